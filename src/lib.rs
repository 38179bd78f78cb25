//! Hades is a host intrusion detection agent.
//!
//! It reports every process execution on the machine, captured by an eBPF
//! probe attached to the `execve` syscall, and periodically the whole process
//! table read from procfs. Both sources go through the same enrichment (parent
//! chain, executable hash, user names) before being written to the output.
//!
//! ```sh
//! # Run the agent with debug logs
//! hades -v
//!
//! # Inspect a single process, including its TCP peers
//! hades --process-info 1234
//! ```
//!
//! ## Modules
//!
//! - [`process_monitor`]: loads the probe and decodes its perf samples.
//! - [`process_snapshot`]: scans procfs on a fixed interval.
//!
//! Both modules write [records](hades_core::Record) to a single unbounded
//! channel drained by the [uploader](crate::uploader).

pub mod cli;
pub mod daemon;
pub mod uploader;
pub mod utils;

pub use process_monitor;
pub use process_snapshot;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Init logger. We log from info level and above unless a verbosity flag
/// asks for more.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: log::Level) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        env_logger::builder()
            .filter_level(override_log_level.to_level_filter())
            .init();
    }
}
