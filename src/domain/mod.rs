//! Domain modules organized as vertical slices.
//!
//! Each sub-module contains:
//! - `mod.rs` — Domain types shared by the wire layer and consumers
//! - `state.rs` — App-owned state containers with update methods (for WS-driven data)

pub mod price;
