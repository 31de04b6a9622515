#[macro_use]
extern crate tracing;
extern crate nix;
#[macro_use]
extern crate serde;
extern crate serde_json;
extern crate snafu;

pub mod core;
pub mod bdev;
pub mod constants;
pub mod logger;
pub mod subsys;
