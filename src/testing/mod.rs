//! Testing utilities and mock implementations
//!
//! Lets the coordinator, twin engine and loops run end to end without a hub.

pub mod mocks;

pub use mocks::*;
