// This makes it easy to import the logging stuff
//
// Call sites do `use utils::log;` and then `log::debug!(...)`.

#![allow(unused_imports)]
pub use crate::timing::get_current_millis;
pub use ::log::{debug, error, info, trace, warn, Level};
