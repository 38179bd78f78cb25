//! Process execution monitor.
//!
//! Attaches the execve probe, drains its perf buffers and turns every sample
//! into an enriched [`Process`] record.

use std::{path::Path, sync::Arc};

use anyhow::Context;
use bpf_common::{
    Program, ProgramBuilder, ProgramError, RawRecord, RecordReader, program::BpfContext,
};
use hades_core::{
    DataType, Enricher, Process, ProcessPool, Record, RecordSender, SendError, Source,
    enrich::verified_exe, process::truncate_cmdline, record::unix_now,
};

pub mod event;

use event::{ExecArgs, ExecContext};

pub const MODULE_NAME: &str = "process-monitor";

const PROGRAM: &str = "enter_execve";
const PERF_MAP: &str = "exec_events";

/// Read the compiled probe object from disk.
pub fn load_probe(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading probe object {}", path.display()))
}

/// Load and attach the execve probe, then start reading its perf buffers.
pub async fn program(
    ctx: BpfContext,
    probe: Vec<u8>,
) -> Result<(Program, RecordReader), ProgramError> {
    let mut program = ProgramBuilder::new(ctx, MODULE_NAME, probe)
        .tracepoint(PROGRAM, "syscalls", "sys_enter_execve")
        .map(PERF_MAP)
        .start()
        .await?;
    let reader = program.read_records(PERF_MAP)?;
    Ok((program, reader))
}

pub struct ProcessMonitor<S> {
    enricher: Enricher,
    pool: Arc<ProcessPool>,
    sender: S,
}

impl<S: RecordSender> ProcessMonitor<S> {
    pub fn new(enricher: Enricher, pool: Arc<ProcessPool>, sender: S) -> Self {
        Self {
            enricher,
            pool,
            sender,
        }
    }

    /// Consume records until the reader is closed.
    ///
    /// Always returns an error: [`ProgramError::ReaderClosed`] on shutdown,
    /// [`ProgramError::Closed`] if nobody is consuming the output anymore.
    pub async fn run(&self, mut reader: RecordReader) -> ProgramError {
        loop {
            let record = match reader.next().await {
                Ok(record) => record,
                Err(err) => return err,
            };
            if self.handle_record(record).is_err() {
                return ProgramError::Closed(format!("{MODULE_NAME}: output channel"));
            }
        }
    }

    /// Turn a single perf record into an output record.
    ///
    /// Samples with a malformed header are logged and dropped.
    pub fn handle_record(&self, record: RawRecord) -> Result<(), SendError> {
        let sample = match record {
            RawRecord::Lost(lost) => {
                log::warn!("{MODULE_NAME}: perf event ring buffer full, dropped {lost} samples");
                return self.sender.send(Record::buffer_overflow(lost));
            }
            RawRecord::Sample(sample) => sample,
        };
        let (ctx, args) = match event::decode(&sample) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::error!("{MODULE_NAME}: {err}");
                return Ok(());
            }
        };
        if ctx.pid == 0 {
            log::debug!("{MODULE_NAME}: dropping sample without pid");
            return Ok(());
        }

        let mut process = self.pool.get();
        fill_process(&mut process, &ctx, args);
        self.enricher.complete(&mut process);
        let result = match Record::from_process(DataType::ProcessExec, &process) {
            Ok(record) => self.sender.send(record),
            Err(err) => {
                bpf_common::log_error("serializing process", err);
                Ok(())
            }
        };
        self.pool.put(process);
        result
    }
}

fn fill_process(process: &mut Process, ctx: &ExecContext, args: ExecArgs) {
    process.pid = ctx.pid;
    process.tid = ctx.tid;
    process.ppid = ctx.ppid;
    process.uid = ctx.uid;
    process.euid = ctx.euid;
    process.gid = ctx.gid;
    process.session_id = ctx.session_id;
    process.cgroup_id = ctx.cgroup_id;
    process.uts_inum = ctx.uts_inum;
    process.parent_uts_inum = ctx.parent_uts_inum;
    process.name = ctx.comm.to_string();
    process.pname = ctx.pcomm.to_string();
    process.node_name = ctx.nodename.to_string();
    process.tty_name = ctx.tty_name.to_string();
    process.source = Some(Source::Ebpf);
    process.syscall = ctx.event_type().map(|ty| ty.syscall());
    process.exe = verified_exe(&args.filename);
    process.cmdline = truncate_cmdline(&args.argv);
    process.ld_preload = args.envp.join(" ");
    process.start_time = unix_now();
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use hades_core::{ProcessCaches, Syscall, UserLookup};
    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::event::sample::SampleBuilder;

    struct StaticUsers;

    impl UserLookup for StaticUsers {
        fn username(&self, uid: u32) -> Option<String> {
            (uid == 0).then(|| "root".to_string())
        }
    }

    fn monitor() -> (
        ProcessMonitor<mpsc::UnboundedSender<Record>>,
        mpsc::UnboundedReceiver<Record>,
        Arc<ProcessCaches>,
    ) {
        let caches = Arc::new(ProcessCaches::new());
        let enricher = Enricher::new(caches.clone(), Arc::new(StaticUsers));
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = ProcessMonitor::new(enricher, Arc::new(ProcessPool::new()), tx);
        (monitor, rx, caches)
    }

    fn data(record: &Record) -> Process {
        serde_json::from_str(&record.data).unwrap()
    }

    #[test]
    fn execve_end_to_end() {
        let (monitor, mut rx, caches) = monitor();
        let sample = SampleBuilder::default().build("/bin/ls", &["-l"], &[]);
        monitor.handle_record(RawRecord::Sample(Bytes::from(sample))).unwrap();

        let record = rx.try_recv().unwrap();
        assert_eq!(record.data_type, DataType::ProcessExec);
        let process = data(&record);
        let expected_exe = if Path::new("/bin/ls").exists() { "/bin/ls" } else { "" };
        assert_eq!(process.exe, expected_exe);
        assert_eq!(process.cmdline, "-l");
        assert_eq!(process.syscall, Some(Syscall::Execve));
        assert_eq!(process.source, Some(Source::Ebpf));
        assert_eq!(process.name, "bash");
        assert_eq!(process.pname, "sshd");
        assert_eq!(process.username, "root");
        assert_eq!(process.pid_tree, vec![100, 1]);
        assert!(process.remote_addrs.is_empty());
        assert_eq!(caches.parents.get(&100), Some(1));
        assert_eq!(caches.pid_tree(100), vec![100, 1]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn lost_samples() {
        let (monitor, mut rx, caches) = monitor();
        monitor.handle_record(RawRecord::Lost(42)).unwrap();
        let record = rx.try_recv().unwrap();
        assert_eq!(record.data_type, DataType::BufferOverflow);
        assert!(record.data.contains("42"));
        assert_eq!(record.into_fields()["data_type"], "999");
        assert!(rx.try_recv().is_err());
        assert!(caches.parents.is_empty());
    }

    #[test]
    fn malformed_header_is_dropped() {
        let (monitor, mut rx, _) = monitor();
        monitor
            .handle_record(RawRecord::Sample(Bytes::from_static(&[1, 2, 3])))
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn zero_pid_is_dropped() {
        let (monitor, mut rx, caches) = monitor();
        let sample = SampleBuilder {
            pid: 0,
            ..Default::default()
        }
        .build("/bin/ls", &[], &[]);
        monitor.handle_record(RawRecord::Sample(Bytes::from(sample))).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(caches.parents.is_empty());
    }

    #[test]
    fn unknown_type_leaves_syscall_unset() {
        let (monitor, mut rx, _) = monitor();
        let sample = SampleBuilder {
            event_type: 1,
            ..Default::default()
        }
        .build("relative/path", &[], &["LD_PRELOAD=/x.so"]);
        monitor.handle_record(RawRecord::Sample(Bytes::from(sample))).unwrap();
        let process = data(&rx.try_recv().unwrap());
        assert_eq!(process.syscall, None);
        assert_eq!(process.exe, "");
        assert!(process.sha256.is_empty());
        assert_eq!(process.ld_preload, "LD_PRELOAD=/x.so");
    }

    #[test]
    fn records_do_not_leak_between_samples() {
        let (monitor, mut rx, _) = monitor();
        let first = SampleBuilder::default().build("/bin/ls", &["-l"], &["A=1"]);
        let second = SampleBuilder {
            pid: 200,
            ppid: 100,
            ..Default::default()
        }
        .build("", &[], &[]);
        monitor.handle_record(RawRecord::Sample(Bytes::from(first))).unwrap();
        monitor.handle_record(RawRecord::Sample(Bytes::from(second))).unwrap();
        rx.try_recv().unwrap();
        let process = data(&rx.try_recv().unwrap());
        assert_eq!(process.pid, 200);
        assert_eq!(process.cmdline, "");
        assert_eq!(process.ld_preload, "");
        assert_eq!(process.pid_tree, vec![200, 100, 1]);
    }

    #[test]
    fn closed_output_is_reported() {
        let (monitor, rx, _) = monitor();
        drop(rx);
        assert!(monitor.handle_record(RawRecord::Lost(1)).is_err());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (monitor, mut rx, _) = monitor();
        let (tx_records, rx_records) = mpsc::channel(16);
        let (tx_exit, rx_exit) = watch::channel(false);
        let reader = RecordReader::new(rx_records, rx_exit);
        let task = tokio::spawn(async move { monitor.run(reader).await });

        tx_records.send(RawRecord::Lost(42)).await.unwrap();
        let record = rx.recv().await.unwrap();
        assert_eq!(record.data_type, DataType::BufferOverflow);

        tx_exit.send_replace(true);
        let err = task.await.unwrap();
        assert!(err.is_reader_closed());
    }
}
