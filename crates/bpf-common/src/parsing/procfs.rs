//! Utility functions used to extract data from procfs

use glob::glob;
use nix::unistd::Pid;
use std::{
    collections::HashMap,
    fs,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
};
use thiserror::Error;

/// `st` value of an established connection in `/proc/net/tcp`.
const TCP_ESTABLISHED: u8 = 0x01;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading link failed {path}")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("malformed {file} for process {pid}")]
    Malformed { file: &'static str, pid: Pid },
    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// Returns the path of the executable image of a given process.
pub fn get_process_image(pid: Pid) -> Result<PathBuf, ProcfsError> {
    read_link(&format!("/proc/{pid}/exe"))
}

/// Returns the current working directory of given process.
pub fn get_process_cwd(pid: Pid) -> Result<PathBuf, ProcfsError> {
    read_link(&format!("/proc/{pid}/cwd"))
}

/// Return where a link is pointing to.
fn read_link(path: &str) -> Result<PathBuf, ProcfsError> {
    fs::read_link(path).map_err(|source| ProcfsError::ReadFile {
        source,
        path: path.to_string(),
    })
}

fn read_to_string(path: String) -> Result<String, ProcfsError> {
    fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })
}

/// Convenience type for command lines.
pub type CommandLine = Vec<String>;

/// Returns the command line for the given process.
pub fn get_process_command_line(pid: Pid) -> Result<CommandLine, ProcfsError> {
    let path = format!("/proc/{pid}/cmdline");
    let data = fs::read(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(parse_command_line(&data))
}

/// Arguments are NUL terminated. Empty arguments are kept.
fn parse_command_line(data: &[u8]) -> CommandLine {
    let data = data.strip_suffix(&[0]).unwrap_or(data);
    if data.is_empty() {
        return Vec::new();
    }
    data.split(|c| *c == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Identity fields of `/proc/<pid>/status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub name: String,
    pub uid: u32,
    pub euid: u32,
}

pub fn get_process_status(pid: Pid) -> Result<ProcessStatus, ProcfsError> {
    let data = read_to_string(format!("/proc/{pid}/status"))?;
    parse_status(&data).ok_or(ProcfsError::Malformed {
        file: "status",
        pid,
    })
}

fn parse_status(data: &str) -> Option<ProcessStatus> {
    let mut name = None;
    let mut uids = None;
    for line in data.lines() {
        if let Some(value) = line.strip_prefix("Name:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Uid:") {
            // real, effective, saved set, filesystem
            let mut ids = value.split_whitespace().map(str::parse::<u32>);
            match (ids.next(), ids.next()) {
                (Some(Ok(uid)), Some(Ok(euid))) => uids = Some((uid, euid)),
                _ => return None,
            }
        }
    }
    let (uid, euid) = uids?;
    Some(ProcessStatus {
        name: name.unwrap_or_default(),
        uid,
        euid,
    })
}

/// Fields of `/proc/<pid>/stat` used by the collectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStat {
    pub ppid: u32,
    pub session: u32,
    pub tty_nr: u32,
    /// Clock ticks since boot
    pub start_time: u64,
}

pub fn get_process_stat(pid: Pid) -> Result<ProcessStat, ProcfsError> {
    let data = read_to_string(format!("/proc/{pid}/stat"))?;
    parse_stat(&data).ok_or(ProcfsError::Malformed { file: "stat", pid })
}

fn parse_stat(data: &str) -> Option<ProcessStat> {
    // comm is wrapped in parentheses and can contain both spaces and ')'
    let (_, rest) = data.rsplit_once(')')?;
    // fields after comm start at number 3 (state)
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |n: usize| fields.get(n - 3).copied();
    Some(ProcessStat {
        ppid: field(4)?.parse().ok()?,
        session: field(6)?.parse().ok()?,
        tty_nr: field(7)?.parse::<i64>().ok()? as u32,
        start_time: field(22)?.parse().ok()?,
    })
}

/// Seconds since the epoch at which the system booted.
pub fn get_boot_time() -> Result<u64, ProcfsError> {
    let data = read_to_string("/proc/stat".to_string())?;
    data.lines()
        .find_map(|line| line.strip_prefix("btime"))
        .ok_or(ProcfsError::Malformed {
            file: "stat",
            pid: Pid::from_raw(0),
        })?
        .trim()
        .parse()
        .map_err(ProcfsError::from)
}

/// Number of clock ticks per second, the unit of [`ProcessStat::start_time`].
pub fn clock_ticks() -> u64 {
    match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
        ticks if ticks > 0 => ticks as u64,
        _ => 100,
    }
}

pub fn get_running_processes() -> Result<Vec<Pid>, ProcfsError> {
    glob("/proc/[0-9]*")?
        .map(|entry| {
            let entry: String = entry?.to_string_lossy().into();
            let pid = entry.replace("/proc/", "").parse()?;
            Ok(Pid::from_raw(pid))
        })
        .collect()
}

/// Returns the inodes of every socket the process holds a descriptor to.
pub fn get_process_socket_inodes(pid: Pid) -> Result<Vec<u64>, ProcfsError> {
    let path = format!("/proc/{pid}/fd");
    let entries = fs::read_dir(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(entries
        .flatten()
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .filter_map(|target| parse_socket_inode(&target.to_string_lossy()))
        .collect())
}

/// Extract the inode from a `socket:[N]` descriptor target.
pub fn parse_socket_inode(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// A row of `/proc/net/tcp` or `/proc/net/tcp6`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: u8,
    pub inode: u64,
}

impl TcpEntry {
    pub fn is_established(&self) -> bool {
        self.state == TCP_ESTABLISHED
    }
}

/// Parse the TCP connection tables as seen from the network namespace of `pid`.
/// Both IPv4 and IPv6 tables are read; a missing tcp6 table is not an error.
pub fn get_tcp_connections(pid: Pid) -> Result<Vec<TcpEntry>, ProcfsError> {
    let mut entries = parse_tcp_table(&read_to_string(format!("/proc/{pid}/net/tcp"))?);
    if let Ok(data) = read_to_string(format!("/proc/{pid}/net/tcp6")) {
        entries.extend(parse_tcp_table(&data));
    }
    Ok(entries)
}

/// Parse the text format of the kernel TCP tables. Malformed rows are skipped.
pub fn parse_tcp_table(data: &str) -> Vec<TcpEntry> {
    data.lines().skip(1).filter_map(parse_tcp_line).collect()
}

fn parse_tcp_line(line: &str) -> Option<TcpEntry> {
    // sl local_address rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid timeout inode
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    Some(TcpEntry {
        local: parse_socket_addr(fields[1])?,
        remote: parse_socket_addr(fields[2])?,
        state: u8::from_str_radix(fields[3], 16).ok()?,
        inode: fields[9].parse().ok()?,
    })
}

/// Addresses are the raw in-kernel words printed as host-endian hex,
/// ports are printed as plain hex numbers.
fn parse_socket_addr(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(parse_word(addr)?)),
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&parse_word(&addr[i * 8..i * 8 + 8])?);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn parse_word(hex: &str) -> Option<[u8; 4]> {
    u32::from_str_radix(hex, 16).ok().map(u32::to_ne_bytes)
}

/// Map socket inodes to the `ip:port` of the remote peer, keeping only established
/// connections with a specified remote address.
pub fn established_remote_addrs(entries: &[TcpEntry]) -> HashMap<u64, String> {
    entries
        .iter()
        .filter(|entry| entry.is_established())
        .filter(|entry| entry.inode != 0 && !entry.remote.ip().is_unspecified())
        .map(|entry| (entry.inode, entry.remote.to_string()))
        .collect()
}
