//! Building blocks shared by the collector modules.

mod config;

pub use config::*;
