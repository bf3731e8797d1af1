//! Testing helpers for use writing unit and integration tests of the `bulkload` crate
//!
//! This is internal to `bulkload` and is not intended for use by any other crates.  Breaking
//! changes can be made at any time.
pub mod fixtures;
pub mod logging;
pub mod memory;

/// Test code that reports errors can just cheat and use `eyre`
pub type Result<T> = color_eyre::Result<T>;
