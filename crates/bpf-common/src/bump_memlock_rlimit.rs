use anyhow::{Context, Result};
use nix::sys::resource::{Resource, getrlimit, setrlimit};

/// Raises the memlock rlimit to infinity, unless it already is.
/// Kernels before 5.11 account eBPF maps against this limit, so the default
/// value is not enough to create the perf buffers.
pub fn bump_memlock_rlimit() -> Result<()> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_MEMLOCK).context("Failed to read rlimit")?;
    if soft == libc::RLIM_INFINITY && hard == libc::RLIM_INFINITY {
        return Ok(());
    }
    log::debug!("Raising RLIMIT_MEMLOCK from {soft}/{hard}");
    setrlimit(
        Resource::RLIMIT_MEMLOCK,
        libc::RLIM_INFINITY,
        libc::RLIM_INFINITY,
    )
    .context("Failed to increase rlimit")
}
