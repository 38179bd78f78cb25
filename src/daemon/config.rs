use std::{collections::HashMap, fs::File, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use bpf_common::program::PERF_PAGES_DEFAULT;
use hades_core::pdk::{ConfigError, ModuleConfig};

const DEFAULT_CONFIG_FILE: &str = "/var/lib/hades/hades.ini";
const DEFAULT_PROBE_PATH: &str = "/usr/lib/hades/hades.bpf.o";
const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 3600;

pub const AGENT_SECTION: &str = "agent";

/// Hades configuration, one [`ModuleConfig`] per `INI` section.
#[derive(Debug, Clone, Default)]
pub struct HadesConfig {
    configs: HashMap<String, ModuleConfig>,
}

impl HadesConfig {
    /// Load the default file, creating it empty if missing.
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            if let Some(prefix) = config_file.parent() {
                std::fs::create_dir_all(prefix)
                    .with_context(|| format!("Error creating {}", prefix.display()))?;
            }
            File::create(&config_file)
                .with_context(|| format!("Error creating {}", config_file.display()))?;
        }
        Self::from_config_file(config_file)
    }

    /// Load a custom file, which must exist.
    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(&conf))
    }

    fn from_ini(conf: &ini::Ini) -> Self {
        let mut configs: HashMap<String, ModuleConfig> = HashMap::new();
        for (section, prop) in conf {
            if let Some(section) = section {
                let module_config = configs.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    module_config.insert(key.to_string(), value.to_string());
                }
            }
        }
        Self { configs }
    }

    /// Configuration of a section, empty if missing.
    pub fn get_module_config(&self, module: &str) -> ModuleConfig {
        self.configs.get(module).cloned().unwrap_or_default()
    }
}

/// Identity attached to every record leaving the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub agent_id: String,
    pub hostname: String,
}

impl TryFrom<&ModuleConfig> for AgentConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let agent_id = match config.get_raw("agent_id") {
            Some(agent_id) => agent_id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let hostname = match config.get_raw("hostname") {
            Some(hostname) => hostname.to_string(),
            None => gethostname::gethostname().to_string_lossy().into_owned(),
        };
        Ok(Self { agent_id, hostname })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub probe_path: PathBuf,
    pub perf_pages: usize,
}

impl TryFrom<&ModuleConfig> for MonitorConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            enabled: config.with_default("enabled", true)?,
            probe_path: config.with_default("probe_path", PathBuf::from(DEFAULT_PROBE_PATH))?,
            perf_pages: config.with_default("perf_pages", PERF_PAGES_DEFAULT)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub max_processes: usize,
}

impl TryFrom<&ModuleConfig> for SnapshotConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let interval: u64 = config.with_default("interval", DEFAULT_SNAPSHOT_INTERVAL_SECS)?;
        if interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "interval".to_string(),
                value: interval.to_string(),
                err: "must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            enabled: config.with_default("enabled", true)?,
            interval: Duration::from_secs(interval),
            max_processes: config
                .with_default("max_processes", process_snapshot::MAX_PROCESSES)?,
        })
    }
}
