//! Periodic scan of the whole process table.
//!
//! Every row goes through the same enrichment as execve events and is sent as
//! a [`DataType::ProcessSnapshot`] record. On hosts running more than
//! `max_processes` processes only a random sample of them is reported.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bpf_common::{
    Pid,
    parsing::procfs::{self, ProcfsError},
};
use hades_core::{
    DataType, Enricher, Process, ProcessPool, Record, RecordSender, SendError, Source,
    enrich::{file_sha256, verified_exe},
    process::truncate_cmdline,
    record::unix_now,
};
use rand::{Rng, seq::SliceRandom};
use thiserror::Error;
use tokio::{sync::watch, time};

pub const MODULE_NAME: &str = "process-snapshot";

/// Default bound on the rows reported by a single snapshot.
pub const MAX_PROCESSES: usize = 5000;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    Procfs(#[from] ProcfsError),
    #[error("executable of process {0} is gone")]
    MissingImage(Pid),
    #[error("process {0} not found")]
    ProcessNotFound(Pid),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Keep at most `max` items, picked uniformly at random when there are more.
pub fn admit<T>(items: &mut Vec<T>, max: usize, rng: &mut impl Rng) {
    if items.len() > max {
        items.shuffle(rng);
        items.truncate(max);
    }
}

pub struct SnapshotCollector<S> {
    enricher: Enricher,
    pool: Arc<ProcessPool>,
    sender: S,
    max_processes: usize,
    /// Unix seconds
    boot_time: u64,
    clock_ticks: u64,
}

impl<S: RecordSender> SnapshotCollector<S> {
    pub fn new(
        enricher: Enricher,
        pool: Arc<ProcessPool>,
        sender: S,
        max_processes: usize,
    ) -> Result<Self, ProcfsError> {
        Ok(Self {
            enricher,
            pool,
            sender,
            max_processes,
            boot_time: procfs::get_boot_time()?,
            clock_ticks: procfs::clock_ticks(),
        })
    }

    /// Scan procfs once and send a record for every admitted process.
    /// Returns how many records were sent.
    pub fn snapshot(&self) -> Result<usize, SnapshotError> {
        let mut pids = procfs::get_running_processes()?;
        let total = pids.len();
        admit(&mut pids, self.max_processes, &mut rand::thread_rng());
        if pids.len() < total {
            log::debug!("{MODULE_NAME}: sampled {} of {total} processes", pids.len());
        }

        let mut sent = 0;
        for pid in pids {
            let mut process = self.pool.get();
            let result = match self.collect(pid, &mut process) {
                Ok(()) => match Record::from_process(DataType::ProcessSnapshot, &process) {
                    Ok(record) => self.sender.send(record).map(|()| 1),
                    Err(err) => {
                        bpf_common::log_error("serializing process", err);
                        Ok(0)
                    }
                },
                // processes exiting while we scan are expected
                Err(err) => {
                    log::trace!("{MODULE_NAME}: skipping {pid}: {err}");
                    Ok(0)
                }
            };
            self.pool.put(process);
            sent += result?;
        }
        Ok(sent)
    }

    /// Fill `process` from procfs. Fails if the executable, status or stat
    /// of the process can't be read.
    fn collect(&self, pid: Pid, process: &mut Process) -> Result<(), SnapshotError> {
        let image = procfs::get_process_image(pid)?;
        process.exe = verified_exe(&image.to_string_lossy());
        if process.exe.is_empty() {
            return Err(SnapshotError::MissingImage(pid));
        }
        let status = procfs::get_process_status(pid)?;
        let stat = procfs::get_process_stat(pid)?;

        process.pid = pid.as_raw() as u32;
        process.name = status.name;
        process.uid = status.uid;
        process.euid = status.euid;
        process.ppid = stat.ppid;
        process.session_id = stat.session;
        process.tty = stat.tty_nr;
        process.start_time = self.boot_time + stat.start_time / self.clock_ticks;
        process.source = Some(Source::Procfs);
        fill_optional(pid, process);
        // the exe link keeps working for processes in other mount namespaces
        process.sha256 = file_sha256(format!("/proc/{pid}/exe")).unwrap_or_default();
        self.enricher.complete(process);
        Ok(())
    }

    /// Detailed view of a single process, including the peers of its established
    /// TCP connections.
    pub fn get_process_info(&self, pid: u32) -> Result<Process, SnapshotError> {
        let pid = Pid::from_raw(pid as i32);
        if !Path::new(&format!("/proc/{pid}")).exists() {
            return Err(SnapshotError::ProcessNotFound(pid));
        }
        let mut process = Process {
            pid: pid.as_raw() as u32,
            source: Some(Source::Procfs),
            start_time: unix_now(),
            ..Default::default()
        };
        if let Ok(status) = procfs::get_process_status(pid) {
            process.name = status.name;
            process.uid = status.uid;
            process.euid = status.euid;
        }
        if let Ok(stat) = procfs::get_process_stat(pid) {
            process.ppid = stat.ppid;
            process.session_id = stat.session;
            process.tty = stat.tty_nr;
        }
        fill_optional(pid, &mut process);
        process.exe = self.image_or_cached(pid, procfs::get_process_image(pid));
        self.enricher.complete(&mut process);
        process.remote_addrs = remote_addrs(pid);
        Ok(process)
    }

    /// Verified executable of `pid`. When the exe link can't be resolved, the
    /// last image observed for this pid is used instead.
    fn image_or_cached(&self, pid: Pid, image: Result<PathBuf, ProcfsError>) -> String {
        let exe = image
            .map(|image| verified_exe(&image.to_string_lossy()))
            .unwrap_or_default();
        if !exe.is_empty() {
            return exe;
        }
        self.enricher
            .caches()
            .images
            .get(&(pid.as_raw() as u32))
            .unwrap_or_default()
    }

    /// Take a snapshot every `interval` until `shutdown` is raised.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            let collector = self.clone();
            match tokio::task::spawn_blocking(move || collector.snapshot()).await {
                Ok(Ok(sent)) => log::info!("{MODULE_NAME}: reported {sent} processes"),
                Ok(Err(SnapshotError::Send(_))) => {
                    log::warn!("{MODULE_NAME}: output channel closed");
                    break;
                }
                Ok(Err(err)) => bpf_common::log_error("process snapshot failed", err),
                Err(err) => bpf_common::log_error("process snapshot task failed", err),
            }
        }
        log::debug!("{MODULE_NAME}: stopped");
    }
}

fn fill_optional(pid: Pid, process: &mut Process) {
    if let Ok(cwd) = procfs::get_process_cwd(pid) {
        process.cwd = cwd.to_string_lossy().into_owned();
    }
    if let Ok(argv) = procfs::get_process_command_line(pid) {
        process.cmdline = truncate_cmdline(&argv);
    }
}

/// Peers of the established connections owned by `pid`, in descriptor order.
/// Any failure results in an empty list.
fn remote_addrs(pid: Pid) -> Vec<String> {
    let peers: HashMap<u64, String> = match procfs::get_tcp_connections(pid) {
        Ok(entries) => procfs::established_remote_addrs(&entries),
        Err(err) => {
            log::debug!("{MODULE_NAME}: reading tcp table of {pid}: {err}");
            return Vec::new();
        }
    };
    if peers.is_empty() {
        return Vec::new();
    }
    procfs::get_process_socket_inodes(pid)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|inode| peers.get(&inode).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        net::{TcpListener, TcpStream},
    };

    use hades_core::{ProcessCaches, SystemUsers};
    use rand::{SeedableRng, rngs::StdRng};
    use tokio::sync::mpsc;

    use super::*;

    fn collector(
        max_processes: usize,
    ) -> (
        SnapshotCollector<mpsc::UnboundedSender<Record>>,
        mpsc::UnboundedReceiver<Record>,
        Arc<ProcessCaches>,
    ) {
        let caches = Arc::new(ProcessCaches::new());
        let enricher = Enricher::new(caches.clone(), Arc::new(SystemUsers));
        let (tx, rx) = mpsc::unbounded_channel();
        let collector =
            SnapshotCollector::new(enricher, Arc::new(ProcessPool::new()), tx, max_processes)
                .unwrap();
        (collector, rx, caches)
    }

    fn own_pid() -> u32 {
        std::process::id()
    }

    #[test]
    fn admission_samples_without_replacement() {
        let mut rng = StdRng::seed_from_u64(7);
        let source: Vec<u32> = (1..=6000).collect();
        let mut pids = source.clone();
        admit(&mut pids, MAX_PROCESSES, &mut rng);
        assert_eq!(pids.len(), MAX_PROCESSES);
        let unique: HashSet<_> = pids.iter().collect();
        assert_eq!(unique.len(), MAX_PROCESSES);
        assert!(pids.iter().all(|pid| source.contains(pid)));
    }

    #[test]
    fn admission_keeps_small_tables() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pids: Vec<u32> = (1..=10).collect();
        admit(&mut pids, MAX_PROCESSES, &mut rng);
        assert_eq!(pids, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn snapshot_reports_own_process() {
        let (collector, mut rx, caches) = collector(MAX_PROCESSES);
        let sent = collector.snapshot().unwrap();
        assert!(sent > 0);

        let mut found = None;
        while let Ok(record) = rx.try_recv() {
            assert_eq!(record.data_type, DataType::ProcessSnapshot);
            let process: Process = serde_json::from_str(&record.data).unwrap();
            assert!(process.pid > 0);
            assert!(process.exe.starts_with('/'));
            assert!(process.cmdline.len() <= 64);
            if process.pid == own_pid() {
                found = Some(process);
            }
        }
        let process = found.expect("own process missing from snapshot");
        assert_eq!(process.source, Some(Source::Procfs));
        assert_eq!(process.sha256.len(), 64);
        assert!(process.start_time >= collector.boot_time);
        assert!(process.start_time <= unix_now());
        assert_eq!(caches.parents.get(&own_pid()), Some(process.ppid));
    }

    #[test]
    fn snapshot_is_bounded() {
        let (collector, mut rx, _) = collector(1);
        assert!(collector.snapshot().unwrap() <= 1);
        rx.try_recv().ok();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_output_aborts_snapshot() {
        let (collector, rx, _) = collector(MAX_PROCESSES);
        drop(rx);
        assert!(matches!(collector.snapshot(), Err(SnapshotError::Send(_))));
    }

    #[test]
    fn process_info_with_connections() {
        let (collector, _rx, _) = collector(MAX_PROCESSES);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (_server, _) = listener.accept().unwrap();
        let client_port = client.local_addr().unwrap().port();

        let process = collector.get_process_info(own_pid()).unwrap();
        assert_eq!(process.pid, own_pid());
        assert!(!process.name.is_empty());
        assert!(process.start_time > 0);
        assert!(process.remote_addrs.contains(&format!("127.0.0.1:{port}")));
        assert!(process.remote_addrs.contains(&format!("127.0.0.1:{client_port}")));
    }

    #[test]
    fn process_info_for_missing_pid() {
        let (collector, _rx, _) = collector(MAX_PROCESSES);
        assert!(matches!(
            collector.get_process_info(i32::MAX as u32),
            Err(SnapshotError::ProcessNotFound(_))
        ));
    }

    #[test]
    fn unreadable_image_uses_cached_path() {
        let (collector, _rx, caches) = collector(MAX_PROCESSES);
        let pid = Pid::from_raw(4242);
        caches.images.insert(4242, "/usr/bin/short-lived".to_string());
        let unreadable = Err(ProcfsError::Malformed { file: "exe", pid });
        assert_eq!(collector.image_or_cached(pid, unreadable), "/usr/bin/short-lived");

        let unknown = Pid::from_raw(4243);
        let unreadable = Err(ProcfsError::Malformed { file: "exe", pid: unknown });
        assert_eq!(collector.image_or_cached(unknown, unreadable), "");
    }

    #[test]
    fn readable_image_wins_over_cache() {
        let (collector, _rx, caches) = collector(MAX_PROCESSES);
        caches.images.insert(own_pid(), "/usr/bin/stale".to_string());
        let exe = std::env::current_exe().unwrap();
        assert_eq!(
            collector.image_or_cached(Pid::this(), Ok(exe.clone())),
            exe.to_string_lossy()
        );

        let process = collector.get_process_info(own_pid()).unwrap();
        assert_eq!(process.exe, exe.to_string_lossy());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (collector, mut rx, _) = collector(MAX_PROCESSES);
        let (tx_exit, rx_exit) = watch::channel(false);
        let task = tokio::spawn(Arc::new(collector).run(Duration::from_secs(3600), rx_exit));
        // the first tick fires immediately
        let record = rx.recv().await.unwrap();
        assert_eq!(record.data_type, DataType::ProcessSnapshot);
        tx_exit.send_replace(true);
        task.await.unwrap();
    }
}
