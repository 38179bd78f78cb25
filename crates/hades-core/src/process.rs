use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Maximum number of argv tokens kept in [`Process::cmdline`].
pub const MAX_CMDLINE_TOKENS: usize = 32;
/// Maximum length in bytes of [`Process::cmdline`].
pub const MAX_CMDLINE_LEN: usize = 64;

/// Pooled records kept around for reuse. Records returned while the pool is
/// full are dropped.
const POOL_CAPACITY: usize = 256;

/// Where a process record was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Ebpf,
    Procfs,
}

/// Syscall that produced an event driven record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Syscall {
    Execve,
}

impl std::fmt::Display for Syscall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Syscall::Execve => write!(f, "execve"),
        }
    }
}

/// A process observed on the host, either from an execve event or from a
/// procfs snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub pid: u32,
    pub tid: u32,
    pub ppid: u32,
    pub name: String,
    pub pname: String,
    pub cmdline: String,
    pub exe: String,
    pub sha256: String,
    pub cwd: String,
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub username: String,
    pub eusername: String,
    pub session_id: u32,
    pub tty: u32,
    pub tty_name: String,
    pub node_name: String,
    pub cgroup_id: u64,
    pub uts_inum: u64,
    pub parent_uts_inum: u64,
    pub ld_preload: String,
    pub source: Option<Source>,
    pub syscall: Option<Syscall>,
    /// Unix seconds
    pub start_time: u64,
    /// The process itself followed by its ancestors, nearest first.
    pub pid_tree: Vec<u32>,
    /// `ip:port` of the peers of established TCP connections.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_addrs: Vec<String>,
}

impl Process {
    /// Clear every field, keeping the allocated buffers.
    pub fn reset(&mut self) {
        self.pid = 0;
        self.tid = 0;
        self.ppid = 0;
        self.name.clear();
        self.pname.clear();
        self.cmdline.clear();
        self.exe.clear();
        self.sha256.clear();
        self.cwd.clear();
        self.uid = 0;
        self.euid = 0;
        self.gid = 0;
        self.username.clear();
        self.eusername.clear();
        self.session_id = 0;
        self.tty = 0;
        self.tty_name.clear();
        self.node_name.clear();
        self.cgroup_id = 0;
        self.uts_inum = 0;
        self.parent_uts_inum = 0;
        self.ld_preload.clear();
        self.source = None;
        self.syscall = None;
        self.start_time = 0;
        self.pid_tree.clear();
        self.remote_addrs.clear();
    }
}

/// Join at most [`MAX_CMDLINE_TOKENS`] arguments with spaces and cut the result
/// to [`MAX_CMDLINE_LEN`] bytes.
pub fn truncate_cmdline<S: AsRef<str>>(argv: &[S]) -> String {
    let mut cmdline = argv
        .iter()
        .take(MAX_CMDLINE_TOKENS)
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" ");
    if cmdline.len() > MAX_CMDLINE_LEN {
        let mut end = MAX_CMDLINE_LEN;
        while !cmdline.is_char_boundary(end) {
            end -= 1;
        }
        cmdline.truncate(end);
    }
    cmdline
}

/// Reuse pool for [`Process`] records.
///
/// A record taken with [`ProcessPool::get`] is owned by the caller until it
/// is handed back with [`ProcessPool::put`], which resets it.
#[derive(Debug, Default)]
pub struct ProcessPool {
    free: Mutex<Vec<Process>>,
}

impl ProcessPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow an empty record.
    pub fn get(&self) -> Process {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default()
    }

    /// Reset `process` and return it to the pool.
    pub fn put(&self, mut process: Process) {
        process.reset();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < POOL_CAPACITY {
            free.push(process);
        }
    }

    /// Number of idle records.
    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
