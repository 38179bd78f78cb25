//! Userspace side of the Hades kernel probes: program lifecycle, perf buffer
//! reading and the procfs parsers shared by the collectors.

pub mod parsing;
pub mod program;

mod bump_memlock_rlimit;

pub use bump_memlock_rlimit::bump_memlock_rlimit;
pub use program::{Program, ProgramBuilder, ProgramError, RawRecord, RecordReader};

pub use aya;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error message,
/// making it much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

pub use nix::unistd::Pid;
