//! Decoder for the samples written by the execve probe.
//!
//! Every sample starts with a fixed size little endian [`ExecContext`],
//! followed by three string groups: the filename, argv and envp.
//! Each group starts with a one byte index, argv and envp then carry a one byte
//! string count. Every string is encoded as a `u32` length (which counts the
//! NUL terminator), `length - 1` bytes of payload and the terminator.

use bpf_common::parsing::StringArray;
use bytes::Buf;
use hades_core::Syscall;
use thiserror::Error;

/// Size of the fixed header, padding included.
pub const EXEC_CONTEXT_SIZE: usize = 232;
/// Strings declaring a bigger length are considered corrupted.
pub const MAX_STRING_LEN: u32 = 512;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated header: {len} bytes, expected {EXEC_CONTEXT_SIZE}")]
    TruncatedHeader { len: usize },
}

/// Event kinds emitted by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventType {
    Execve = 700,
}

impl TryFrom<u32> for EventType {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            700 => Ok(EventType::Execve),
            unknown => Err(unknown),
        }
    }
}

impl EventType {
    pub fn syscall(self) -> Syscall {
        match self {
            EventType::Execve => Syscall::Execve,
        }
    }
}

/// Fixed header of an execve sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecContext {
    /// Kernel timestamp, nanoseconds since boot
    pub ts: u64,
    pub uts_inum: u64,
    pub parent_uts_inum: u64,
    pub cgroup_id: u64,
    pub event_type: u32,
    pub pid: u32,
    pub tid: u32,
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub ppid: u32,
    pub session_id: u32,
    pub comm: StringArray<16>,
    pub pcomm: StringArray<16>,
    pub nodename: StringArray<64>,
    pub tty_name: StringArray<64>,
    pub argnum: u8,
}

impl ExecContext {
    pub fn read_from(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < EXEC_CONTEXT_SIZE {
            return Err(DecodeError::TruncatedHeader {
                len: buf.remaining(),
            });
        }
        let ctx = Self {
            ts: buf.get_u64_le(),
            uts_inum: buf.get_u64_le(),
            parent_uts_inum: buf.get_u64_le(),
            cgroup_id: buf.get_u64_le(),
            event_type: buf.get_u32_le(),
            pid: buf.get_u32_le(),
            tid: buf.get_u32_le(),
            uid: buf.get_u32_le(),
            euid: buf.get_u32_le(),
            gid: buf.get_u32_le(),
            ppid: buf.get_u32_le(),
            session_id: buf.get_u32_le(),
            comm: StringArray::read_from(buf),
            pcomm: StringArray::read_from(buf),
            nodename: StringArray::read_from(buf),
            tty_name: StringArray::read_from(buf),
            argnum: buf.get_u8(),
        };
        buf.advance(7);
        Ok(ctx)
    }

    pub fn event_type(&self) -> Option<EventType> {
        EventType::try_from(self.event_type).ok()
    }
}

/// Variable length part of an execve sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecArgs {
    pub filename: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

/// Decode a raw sample.
///
/// Only a truncated header is an error. Corrupted or truncated string groups
/// stop decoding: groups read so far are returned and the rest are left empty.
pub fn decode(sample: &[u8]) -> Result<(ExecContext, ExecArgs), DecodeError> {
    let mut buf = sample;
    let ctx = ExecContext::read_from(&mut buf)?;
    let args = read_args(&mut buf);
    Ok((ctx, args))
}

fn read_args(buf: &mut impl Buf) -> ExecArgs {
    let mut args = ExecArgs::default();
    if !buf.has_remaining() {
        return args;
    }
    buf.advance(1);
    match read_string(buf) {
        Some(filename) => args.filename = filename,
        None => return args,
    }
    if read_group(buf, &mut args.argv) {
        read_group(buf, &mut args.envp);
    }
    args
}

/// Read an argv like group into `out`. Returns false if decoding must stop.
fn read_group(buf: &mut impl Buf, out: &mut Vec<String>) -> bool {
    if buf.remaining() < 2 {
        return false;
    }
    buf.advance(1);
    let count = buf.get_u8();
    for _ in 0..count {
        match read_string(buf) {
            Some(value) => out.push(value),
            None => return false,
        }
    }
    true
}

fn read_string(buf: &mut impl Buf) -> Option<String> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le();
    if len == 0 || len > MAX_STRING_LEN {
        log::debug!("corrupted string length {len}");
        return None;
    }
    let payload = (len - 1) as usize;
    if buf.remaining() < payload {
        return None;
    }
    let value = String::from_utf8_lossy(&buf.copy_to_bytes(payload)).into_owned();
    if buf.has_remaining() {
        buf.advance(1);
    }
    Some(value)
}


#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::sample::{SampleBuilder, put_group, put_string};
    use super::*;

    #[test]
    fn header_layout() {
        let header = SampleBuilder::default().header();
        assert_eq!(header.len(), EXEC_CONTEXT_SIZE);
        let (ctx, args) = decode(&header).unwrap();
        assert_eq!(ctx.pid, 100);
        assert_eq!(ctx.ppid, 1);
        assert_eq!(ctx.cgroup_id, 9876);
        assert_eq!(ctx.comm.to_string(), "bash");
        assert_eq!(ctx.pcomm.to_string(), "sshd");
        assert_eq!(ctx.nodename.to_string(), "host");
        assert_eq!(ctx.tty_name.to_string(), "pts0");
        assert_eq!(ctx.argnum, 2);
        assert_eq!(ctx.event_type(), Some(EventType::Execve));
        assert_eq!(args, ExecArgs::default());
    }

    #[test]
    fn truncated_header() {
        let header = SampleBuilder::default().header();
        assert_eq!(
            decode(&header[..EXEC_CONTEXT_SIZE - 1]),
            Err(DecodeError::TruncatedHeader {
                len: EXEC_CONTEXT_SIZE - 1
            })
        );
        assert_eq!(
            decode(&[]),
            Err(DecodeError::TruncatedHeader { len: 0 })
        );
    }

    #[test]
    fn full_sample() {
        let sample = SampleBuilder::default().build(
            "/bin/ls",
            &["-l", "/tmp"],
            &["LD_PRELOAD=/tmp/hook.so"],
        );
        let (_, args) = decode(&sample).unwrap();
        assert_eq!(args.filename, "/bin/ls");
        assert_eq!(args.argv, vec!["-l", "/tmp"]);
        assert_eq!(args.envp, vec!["LD_PRELOAD=/tmp/hook.so"]);
    }

    #[test]
    fn string_advances_prefix_payload_and_terminator() {
        for len in [1u32, 2, 8, 100, MAX_STRING_LEN] {
            let value = "a".repeat(len as usize - 1);
            let mut buf = BytesMut::new();
            put_string(&mut buf, &value);
            buf.put_slice(b"next");
            let mut cursor = &buf[..];
            assert_eq!(read_string(&mut cursor).as_deref(), Some(value.as_str()));
            assert_eq!(buf.len() - cursor.len(), 4 + len as usize);
            assert_eq!(cursor, b"next");
        }
    }

    #[test]
    fn oversized_length_stops_group() {
        let mut buf = SampleBuilder::default().header();
        buf.put_u8(0);
        put_string(&mut buf, "/usr/bin/env");
        buf.put_u8(1);
        buf.put_u8(3);
        put_string(&mut buf, "first");
        buf.put_u32_le(MAX_STRING_LEN + 1);
        let tail = b"garbage that must not be read";
        buf.put_slice(tail);
        put_group(&mut buf, 2, &["PATH=/bin"]);

        let (_, args) = decode(&buf).unwrap();
        assert_eq!(args.filename, "/usr/bin/env");
        assert_eq!(args.argv, vec!["first"]);
        assert!(args.envp.is_empty());

        let mut cursor = &buf[EXEC_CONTEXT_SIZE..];
        read_args(&mut cursor);
        assert!(cursor.starts_with(tail));
    }

    #[test]
    fn oversized_filename() {
        let mut buf = SampleBuilder::default().header();
        buf.put_u8(0);
        buf.put_u32_le(u32::MAX);
        put_group(&mut buf, 1, &["-l"]);
        let (ctx, args) = decode(&buf).unwrap();
        assert_eq!(ctx.pid, 100);
        assert_eq!(args, ExecArgs::default());
    }

    #[test]
    fn zero_length_is_corruption() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        buf.put_u8(0);
        assert_eq!(read_string(&mut &buf[..]), None);
    }

    #[test]
    fn truncated_groups_never_panic() {
        let sample = SampleBuilder::default().build("/bin/ls", &["-l", "-a"], &["A=1", "B=2"]);
        for len in EXEC_CONTEXT_SIZE..sample.len() {
            let (_, args) = decode(&sample[..len]).unwrap();
            assert!(args.argv.len() <= 2);
            assert!(args.envp.len() <= 2);
        }
    }

    #[test]
    fn unknown_event_type() {
        let header = SampleBuilder {
            event_type: 42,
            ..Default::default()
        }
        .header();
        let (ctx, _) = decode(&header).unwrap();
        assert_eq!(ctx.event_type(), None);
        assert_eq!(EventType::try_from(42), Err(42));
        assert_eq!(EventType::Execve.syscall(), Syscall::Execve);
    }
}
