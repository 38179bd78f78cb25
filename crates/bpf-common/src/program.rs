//! [`Program`] is a wrapper around [`aya::Ebpf`] which:
//! - loads the probe object and binds its programs and maps by name
//! - owns every tracepoint hook it attaches, so they can be torn down on close
//! - runs one background task per CPU draining the perf buffers into a [`RecordReader`]
//! - exposes a shutdown signal which makes the reader return [`ProgramError::ReaderClosed`]
//!
use core::fmt;
use std::fmt::Display;

use aya::{
    Ebpf, EbpfError, EbpfLoader, VerifierLogLevel,
    maps::{
        MapError,
        perf::{AsyncPerfEventArray, PerfBufferError},
    },
    programs::{TracePoint, trace_point::TracePointLinkId},
    util::online_cpus,
};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinError,
};

/// Default number of pages used by every per-CPU perf buffer.
pub const PERF_PAGES_DEFAULT: usize = 8;

/// Size of each buffer handed to aya when draining a perf buffer.
const BUFFER_SIZE: usize = 4096;
/// How many samples we read from a perf buffer in a single batch.
const BUFFERS_PER_READ: usize = 10;
/// Capacity of the channel between the per-CPU readers and the [`RecordReader`].
/// When it fills up the readers stop draining and the kernel starts dropping
/// samples, which are then reported as [`RawRecord::Lost`].
const RECORDS_CHANNEL_CAPACITY: usize = 4096;

/// BpfContext contains extra settings which could be provided on program load
#[derive(Clone)]
pub struct BpfContext {
    /// How many pages of memory to use for each per-CPU perf buffer.
    /// NOTE: this will result in a memory usage of:
    /// (number of cores) * (perf_pages) * (page size)
    perf_pages: usize,
    /// Verbosity of the kernel verifier log collected on load.
    log_level: BpfLogLevel,
}

#[derive(Clone, Copy, Debug)]
pub enum BpfLogLevel {
    Disabled,
    Error,
    Debug,
}

impl From<BpfLogLevel> for VerifierLogLevel {
    fn from(level: BpfLogLevel) -> Self {
        match level {
            BpfLogLevel::Disabled => VerifierLogLevel::DISABLE,
            BpfLogLevel::Error => VerifierLogLevel::STATS,
            BpfLogLevel::Debug => VerifierLogLevel::VERBOSE | VerifierLogLevel::STATS,
        }
    }
}

impl BpfContext {
    pub fn new(mut perf_pages: usize, log_level: BpfLogLevel) -> Self {
        if perf_pages == 0 || (perf_pages & (perf_pages - 1) != 0) {
            log::warn!("Invalid value ({perf_pages}) for perf_pages, which must be a power of 2.");
            log::warn!("The default value {PERF_PAGES_DEFAULT} will be used.");
            perf_pages = PERF_PAGES_DEFAULT;
        }
        Self {
            perf_pages,
            log_level,
        }
    }

    pub fn perf_pages(&self) -> usize {
        self.perf_pages
    }
}

impl Default for BpfContext {
    fn default() -> Self {
        Self::new(PERF_PAGES_DEFAULT, BpfLogLevel::Error)
    }
}

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("loading probe")]
    LoadingProbe(#[from] EbpfError),
    #[error("program not found {0}")]
    ProgramNotFound(String),
    #[error("incorrect program type {0}")]
    ProgramTypeError(String),
    #[error("failed program load {program}")]
    ProgramLoadError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error("failed program attach {program}")]
    ProgramAttachError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error("failed program detach {program}")]
    ProgramDetachError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error(transparent)]
    MapError(#[from] MapError),
    #[error("map not found {0}")]
    MapNotFound(String),
    #[error("perf buffer error {0}")]
    PerfBuffer(#[from] PerfBufferError),
    #[error("listing online cpus: {0}")]
    OnlineCpus(#[source] std::io::Error),
    #[error("program {0} is closed")]
    Closed(String),
    #[error("event reader closed")]
    ReaderClosed,
    #[error("running background aya task {0}")]
    JoinError(#[from] JoinError),
}

impl ProgramError {
    /// True for the terminal error returned by [`RecordReader::next`] on shutdown.
    pub fn is_reader_closed(&self) -> bool {
        matches!(self, ProgramError::ReaderClosed)
    }
}

pub struct ProgramBuilder {
    /// probe name, used for logging purposes
    name: &'static str,
    /// Probe configuration
    ctx: BpfContext,
    probe: Vec<u8>,
    programs: Vec<ProgramType>,
    maps: Vec<String>,
}

impl ProgramBuilder {
    pub fn new(ctx: BpfContext, name: &'static str, probe: Vec<u8>) -> Self {
        Self {
            ctx,
            name,
            probe,
            programs: Vec::new(),
            maps: Vec::new(),
        }
    }

    /// Attach program `program` to the tracepoint `category/tracepoint`.
    pub fn tracepoint(mut self, program: &str, category: &str, tracepoint: &str) -> Self {
        self.programs.push(ProgramType::TracePoint {
            program: program.to_string(),
            category: category.to_string(),
            tracepoint: tracepoint.to_string(),
        });
        self
    }

    /// Require a map to be present in the loaded object.
    pub fn map(mut self, name: &str) -> Self {
        self.maps.push(name.to_string());
        self
    }

    /// Load the probe and attach all its programs. Loading and attaching talk to the
    /// kernel synchronously, so they're run on the blocking thread pool.
    pub async fn start(self) -> Result<Program, ProgramError> {
        tokio::task::spawn_blocking(move || {
            let mut program = Program::load(self.ctx, self.name, &self.probe)?;
            for map in &self.maps {
                program.require_map(map)?;
            }
            for ty in &self.programs {
                match ty {
                    ProgramType::TracePoint {
                        program: name,
                        category,
                        tracepoint,
                    } => program.attach_tracepoint(name, category, tracepoint)?,
                }
            }
            Ok(program)
        })
        .await?
    }
}

enum ProgramType {
    TracePoint {
        program: String,
        category: String,
        tracepoint: String,
    },
}

impl Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramType::TracePoint {
                program,
                category,
                tracepoint,
            } => write!(f, "tracepoint {category}/{tracepoint} ({program})"),
        }
    }
}

fn extract_program<'a, T>(bpf: &'a mut Ebpf, program: &str) -> Result<&'a mut T, ProgramError>
where
    T: 'a,
    &'a mut T: TryFrom<&'a mut aya::programs::Program>,
{
    bpf.program_mut(program)
        .ok_or_else(|| ProgramError::ProgramNotFound(program.to_string()))?
        .try_into()
        .map_err(|_err| ProgramError::ProgramTypeError(program.to_string()))
}

/// Lifecycle of a loaded [`Program`]. The state before loading is a [`ProgramBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgramState {
    Loaded,
    Attached,
    Reading,
    Closed,
}

/// A live kernel-side hook owned by a [`Program`].
struct Hook {
    program: String,
    link_id: TracePointLinkId,
}

pub struct Program {
    name: String,
    ctx: BpfContext,
    bpf: Ebpf,
    state: ProgramState,
    hooks: Vec<Hook>,
    /// Raised on close: background readers exit and [`RecordReader::next`]
    /// returns [`ProgramError::ReaderClosed`].
    tx_exit: watch::Sender<bool>,
}

impl Program {
    /// Parse the probe object and create its maps. Programs are loaded into the
    /// kernel when attached.
    pub fn load(ctx: BpfContext, name: &str, probe: &[u8]) -> Result<Self, ProgramError> {
        let bpf = EbpfLoader::new()
            .verifier_log_level(ctx.log_level.into())
            .load(probe)?;
        log::debug!("{name}: probe loaded");
        let (tx_exit, _) = watch::channel(false);
        Ok(Self {
            name: name.to_string(),
            ctx,
            bpf,
            state: ProgramState::Loaded,
            hooks: Vec::new(),
            tx_exit,
        })
    }

    fn require_map(&self, map_name: &str) -> Result<(), ProgramError> {
        self.bpf
            .map(map_name)
            .map(|_| ())
            .ok_or_else(|| ProgramError::MapNotFound(map_name.to_string()))
    }

    /// Load `program` into the kernel and attach it to `category/tracepoint`.
    /// The resulting hook is owned by this [`Program`] until [`Program::close`].
    pub fn attach_tracepoint(
        &mut self,
        program: &str,
        category: &str,
        tracepoint: &str,
    ) -> Result<(), ProgramError> {
        if self.state == ProgramState::Closed {
            return Err(ProgramError::Closed(self.name.clone()));
        }
        let ty = ProgramType::TracePoint {
            program: program.to_string(),
            category: category.to_string(),
            tracepoint: tracepoint.to_string(),
        };
        let tp: &mut TracePoint = extract_program(&mut self.bpf, program)?;
        tp.load().map_err(|program_error| ProgramError::ProgramLoadError {
            program: ty.to_string(),
            program_error: Box::new(program_error),
        })?;
        let link_id = tp
            .attach(category, tracepoint)
            .map_err(|program_error| ProgramError::ProgramAttachError {
                program: ty.to_string(),
                program_error: Box::new(program_error),
            })?;
        log::debug!("{}: attached {ty}", self.name);
        self.hooks.push(Hook {
            program: program.to_string(),
            link_id,
        });
        if self.state == ProgramState::Loaded {
            self.state = ProgramState::Attached;
        }
        Ok(())
    }

    /// Watch a BPF_MAP_TYPE_PERF_EVENT_ARRAY and forward every sample, and every
    /// loss notification, to the returned [`RecordReader`].
    /// A different task is run for each CPU.
    pub fn read_records(&mut self, map_name: &str) -> Result<RecordReader, ProgramError> {
        if self.state == ProgramState::Closed {
            return Err(ProgramError::ReaderClosed);
        }
        let map = self
            .bpf
            .take_map(map_name)
            .ok_or_else(|| ProgramError::MapNotFound(map_name.to_string()))?;
        let mut perf_array = AsyncPerfEventArray::try_from(map)?;
        let cpus = online_cpus().map_err(|(_, err)| ProgramError::OnlineCpus(err))?;

        let (tx, rx) = mpsc::channel(RECORDS_CHANNEL_CAPACITY);
        for cpu_id in cpus {
            let mut buf = perf_array.open(cpu_id, Some(self.ctx.perf_pages))?;
            let name = self.name.clone();
            let tx = tx.clone();
            let mut rx_exit = self.tx_exit.subscribe();
            tokio::spawn(async move {
                let mut buffers = (0..BUFFERS_PER_READ)
                    .map(|_| BytesMut::with_capacity(BUFFER_SIZE))
                    .collect::<Vec<_>>();
                loop {
                    let events = tokio::select! {
                        _ = rx_exit.changed() => return,
                        events = buf.read_events(&mut buffers) => events,
                    };
                    let events = match events {
                        Ok(events) => events,
                        Err(err) => {
                            crate::log_error(&format!("{name}: reading cpu {cpu_id}"), err);
                            return;
                        }
                    };
                    if events.lost > 0 {
                        log::warn!(
                            "{}: Lost {} events (read {})",
                            name,
                            events.lost,
                            events.read
                        );
                        if tx.send(RawRecord::Lost(events.lost as u64)).await.is_err() {
                            return;
                        }
                    }
                    for buffer in buffers.iter_mut().take(events.read) {
                        let sample =
                            std::mem::replace(buffer, BytesMut::with_capacity(BUFFER_SIZE));
                        if tx.send(RawRecord::Sample(sample.freeze())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }

        self.state = ProgramState::Reading;
        Ok(RecordReader::new(rx, self.tx_exit.subscribe()))
    }

    /// Raise the shutdown signal without releasing the hooks.
    pub fn shutdown(&self) {
        self.tx_exit.send_replace(true);
    }

    /// Raise the shutdown signal and release every owned hook. All hooks are
    /// attempted even if some fail; the first failure is returned.
    pub fn close(&mut self) -> Result<(), ProgramError> {
        self.shutdown();
        self.state = ProgramState::Closed;
        let hooks = std::mem::take(&mut self.hooks);
        release_all(&self.name, hooks, |hook| detach(&mut self.bpf, hook))
    }
}

/// Run `release` on every hook, logging failures. Returns the first one.
fn release_all<H>(
    name: &str,
    hooks: Vec<H>,
    mut release: impl FnMut(H) -> Result<(), ProgramError>,
) -> Result<(), ProgramError> {
    let mut result = Ok(());
    for hook in hooks {
        if let Err(err) = release(hook) {
            log::warn!("{name}: {err}");
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    result
}

fn detach(bpf: &mut Ebpf, hook: Hook) -> Result<(), ProgramError> {
    let tp: &mut TracePoint = extract_program(bpf, &hook.program)?;
    tp.detach(hook.link_id)
        .map_err(|program_error| ProgramError::ProgramDetachError {
            program: hook.program,
            program_error: Box::new(program_error),
        })
}

impl Drop for Program {
    fn drop(&mut self) {
        if self.state != ProgramState::Closed {
            if let Err(err) = self.close() {
                crate::log_error(&format!("{}: closing on drop", self.name), err);
            }
        }
    }
}

/// A single item read from the perf buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    /// Raw sample bytes written by the probe.
    Sample(Bytes),
    /// The kernel dropped this many samples because we weren't reading fast enough.
    Lost(u64),
}

/// Receiving end of [`Program::read_records`].
pub struct RecordReader {
    rx: mpsc::Receiver<RawRecord>,
    rx_exit: watch::Receiver<bool>,
}

impl RecordReader {
    pub fn new(rx: mpsc::Receiver<RawRecord>, rx_exit: watch::Receiver<bool>) -> Self {
        Self { rx, rx_exit }
    }

    /// Wait for the next record. Returns [`ProgramError::ReaderClosed`] once the
    /// shutdown signal is raised or every per-CPU reader has exited.
    pub async fn next(&mut self) -> Result<RawRecord, ProgramError> {
        if *self.rx_exit.borrow() {
            return Err(ProgramError::ReaderClosed);
        }
        tokio::select! {
            biased;
            _ = self.rx_exit.changed() => Err(ProgramError::ReaderClosed),
            record = self.rx.recv() => record.ok_or(ProgramError::ReaderClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> (mpsc::Sender<RawRecord>, watch::Sender<bool>, RecordReader) {
        let (tx, rx) = mpsc::channel(8);
        let (tx_exit, rx_exit) = watch::channel(false);
        (tx, tx_exit, RecordReader::new(rx, rx_exit))
    }

    #[test]
    fn perf_pages_must_be_power_of_two() {
        assert_eq!(BpfContext::new(0, BpfLogLevel::Disabled).perf_pages(), 8);
        assert_eq!(BpfContext::new(12, BpfLogLevel::Disabled).perf_pages(), 8);
        assert_eq!(BpfContext::new(64, BpfLogLevel::Disabled).perf_pages(), 64);
    }

    #[test]
    fn malformed_object_fails_to_load() {
        let result = Program::load(BpfContext::default(), "test", b"not an ELF object");
        assert!(matches!(result, Err(ProgramError::LoadingProbe(_))));
    }

    #[test]
    fn release_attempts_every_hook() {
        let mut attempted = Vec::new();
        let result = release_all("test", vec!["a", "b", "c"], |hook| {
            attempted.push(hook);
            match hook {
                "a" => Ok(()),
                other => Err(ProgramError::Closed(other.to_string())),
            }
        });
        assert_eq!(attempted, ["a", "b", "c"]);
        assert!(matches!(result, Err(ProgramError::Closed(hook)) if hook == "b"));
    }

    #[test]
    fn release_without_failures() {
        let mut count = 0;
        let result = release_all("test", vec![1, 2, 3], |_| {
            count += 1;
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn reader_forwards_records_in_order() {
        let (tx, _tx_exit, mut reader) = reader();
        tx.send(RawRecord::Lost(3)).await.unwrap();
        tx.send(RawRecord::Sample(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        assert_eq!(reader.next().await.unwrap(), RawRecord::Lost(3));
        assert_eq!(
            reader.next().await.unwrap(),
            RawRecord::Sample(Bytes::from_static(b"abc"))
        );
    }

    #[tokio::test]
    async fn shutdown_signal_closes_reader() {
        let (tx, tx_exit, mut reader) = reader();
        let pending = tokio::spawn(async move { reader.next().await });
        tokio::task::yield_now().await;
        tx_exit.send_replace(true);
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ProgramError::ReaderClosed)));
        drop(tx);
    }

    #[tokio::test]
    async fn raised_signal_wins_over_queued_records() {
        let (tx, tx_exit, mut reader) = reader();
        tx.send(RawRecord::Lost(1)).await.unwrap();
        tx_exit.send_replace(true);
        assert!(reader.next().await.unwrap_err().is_reader_closed());
    }

    #[tokio::test]
    async fn reader_closes_when_producers_exit() {
        let (tx, _tx_exit, mut reader) = reader();
        drop(tx);
        assert!(reader.next().await.unwrap_err().is_reader_closed());
    }
}
