// A set of helper structs for common operations
//
// Shared by the tempest core and the squall driver: logger setup,
// the logging macro facade, and timing helpers.
pub mod timing;
pub mod logging;
pub mod log;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};
