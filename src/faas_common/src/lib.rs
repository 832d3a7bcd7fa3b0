pub extern crate tracing;
// alias
pub extern crate tracing as log;

pub mod func_config;
pub mod logging;
pub mod stat;
pub mod time;

pub use func_config::{FuncConfig, FuncEntry};
