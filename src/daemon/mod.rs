use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use bpf_common::{
    Program,
    program::{BpfContext, BpfLogLevel},
};
use hades_core::{Enricher, ProcessCaches, ProcessPool, Record, SystemUsers};
use nix::unistd::geteuid;
use process_monitor::ProcessMonitor;
use process_snapshot::SnapshotCollector;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{cli::HadesOpts, uploader::Uploader};

pub mod config;

use config::{AGENT_SECTION, AgentConfig, HadesConfig, MonitorConfig, SnapshotConfig};

/// Components shared by every collector.
struct Shared {
    enricher: Enricher,
    pool: Arc<ProcessPool>,
}

impl Shared {
    fn new() -> Self {
        Self {
            enricher: Enricher::new(Arc::new(ProcessCaches::new()), Arc::new(SystemUsers)),
            pool: Arc::new(ProcessPool::new()),
        }
    }
}

pub async fn hades_daemon_run(options: &HadesOpts) -> Result<()> {
    log::trace!("Hades Options: {:?}", options);

    let shared = Shared::new();

    if let Some(pid) = options.process_info {
        return print_process_info(&shared, pid);
    }

    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    let config = match &options.config_file {
        Some(custom_file) => HadesConfig::with_custom_file(custom_file)?,
        None => HadesConfig::new()?,
    };

    bpf_common::bump_memlock_rlimit()?;

    let agent = AgentConfig::try_from(&config.get_module_config(AGENT_SECTION))?;
    let monitor_config =
        MonitorConfig::try_from(&config.get_module_config(process_monitor::MODULE_NAME))?;
    let snapshot_config =
        SnapshotConfig::try_from(&config.get_module_config(process_snapshot::MODULE_NAME))?;
    log::info!("Starting Hades agent {} on {}", agent.agent_id, agent.hostname);

    let (tx_records, rx_records) = mpsc::unbounded_channel::<Record>();
    let uploader = Uploader::new(agent);
    let uploader_task =
        tokio::spawn(async move { uploader.run(rx_records, tokio::io::stdout()).await });

    let (tx_exit, rx_exit) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let mut program: Option<Program> = None;
    if monitor_config.enabled {
        let (started, task) =
            start_process_monitor(&monitor_config, &shared, tx_records.clone()).await?;
        program = Some(started);
        tasks.push(task);
    } else {
        log::info!("{} disabled", process_monitor::MODULE_NAME);
    }

    if snapshot_config.enabled {
        let collector = SnapshotCollector::new(
            shared.enricher.clone(),
            shared.pool.clone(),
            tx_records.clone(),
            snapshot_config.max_processes,
        )
        .context("starting process snapshot")?;
        tasks.push(tokio::spawn(
            Arc::new(collector).run(snapshot_config.interval, rx_exit.clone()),
        ));
    } else {
        log::info!("{} disabled", process_snapshot::MODULE_NAME);
    }

    // The uploader stops once every collector has dropped its sender.
    drop(tx_records);

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_hup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
        _ = sig_hup.recv() => log::trace!("SIGHUP received"),
    }

    log::info!("Terminating Hades...");
    tx_exit.send_replace(true);
    if let Some(mut program) = program {
        if let Err(err) = program.close() {
            bpf_common::log_error("closing process monitor probe", err);
        }
    }
    for task in tasks {
        if let Err(err) = task.await {
            bpf_common::log_error("collector task failed", err);
        }
    }
    let written = uploader_task.await??;
    log::info!("Hades stopped, {written} records written");

    Ok(())
}

async fn start_process_monitor(
    config: &MonitorConfig,
    shared: &Shared,
    tx_records: mpsc::UnboundedSender<Record>,
) -> Result<(Program, JoinHandle<()>)> {
    let probe = process_monitor::load_probe(&config.probe_path)?;
    let log_level = if log::max_level() >= log::LevelFilter::Debug {
        BpfLogLevel::Debug
    } else {
        BpfLogLevel::Error
    };
    let ctx = BpfContext::new(config.perf_pages, log_level);
    let (program, reader) = process_monitor::program(ctx, probe)
        .await
        .context("starting process monitor")?;
    log::info!("{} started", process_monitor::MODULE_NAME);

    let monitor = ProcessMonitor::new(shared.enricher.clone(), shared.pool.clone(), tx_records);
    let task = tokio::spawn(async move {
        let err = monitor.run(reader).await;
        if err.is_reader_closed() {
            log::debug!("{}: reader closed", process_monitor::MODULE_NAME);
        } else {
            bpf_common::log_error("process monitor stopped", err);
        }
    });
    Ok((program, task))
}

/// Print a single enriched process as pretty JSON.
fn print_process_info(shared: &Shared, pid: u32) -> Result<()> {
    let (tx, _rx) = mpsc::unbounded_channel::<Record>();
    let collector = SnapshotCollector::new(
        shared.enricher.clone(),
        shared.pool.clone(),
        tx,
        process_snapshot::MAX_PROCESSES,
    )?;
    let process = collector.get_process_info(pid)?;
    println!("{}", serde_json::to_string_pretty(&process)?);
    Ok(())
}
