//! Subsystems that surround the I/O path: configuration for now.

pub use config::{
    opts::{BdevOpts, NvmeBdevOpts},
    Config,
};

pub mod config;
