use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agent_relay_error::RelayError;
use agent_relay_worker_registry::{
    default_worker_args, WorkerRegistryConfig, DEFAULT_PORT_MAX, DEFAULT_PORT_MIN,
    DEFAULT_WORKER_PROGRAM,
};
use serde::{Deserialize, Serialize};

use crate::execution::{BackendKind, DEFAULT_QUERY_PROGRAM};
use crate::relay::{RelaySettings, DEFAULT_PROGRESS_INTERVAL_MS, DEFAULT_READINESS_TIMEOUT_MS};

const CONFIG_DIR: &str = "agent-relay";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_PORT_MIN,
            max: DEFAULT_PORT_MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub ports: PortRange,
    pub backend: BackendKind,
    pub worker_program: PathBuf,
    pub worker_args: Vec<String>,
    pub query_program: PathBuf,
    pub readiness_timeout_ms: u64,
    pub progress_interval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ports: PortRange::default(),
            backend: BackendKind::default(),
            worker_program: PathBuf::from(DEFAULT_WORKER_PROGRAM),
            worker_args: default_worker_args(),
            query_program: PathBuf::from(DEFAULT_QUERY_PROGRAM),
            readiness_timeout_ms: DEFAULT_READINESS_TIMEOUT_MS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            log_dir: None,
        }
    }
}

impl RelayConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Reads `path`, or the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, RelayError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(RelayError::InvalidConfig {
                    message: format!("failed to read {}: {err}", path.display()),
                })
            }
        };
        let config: Self =
            serde_json::from_str(&contents).map_err(|err| RelayError::InvalidConfig {
                message: format!("{}: {err}", path.display()),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.ports.min == 0 || self.ports.min > self.ports.max {
            return Err(RelayError::InvalidConfig {
                message: format!(
                    "port range {}-{} is empty or starts at 0",
                    self.ports.min, self.ports.max
                ),
            });
        }
        if self.readiness_timeout_ms == 0 {
            return Err(RelayError::InvalidConfig {
                message: "readinessTimeoutMs must be positive".to_string(),
            });
        }
        if self.progress_interval_ms == 0 {
            return Err(RelayError::InvalidConfig {
                message: "progressIntervalMs must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn worker_registry_config(&self) -> WorkerRegistryConfig {
        let mut config = WorkerRegistryConfig {
            port_min: self.ports.min,
            port_max: self.ports.max,
            program: self.worker_program.clone(),
            args: self.worker_args.clone(),
            ..WorkerRegistryConfig::default()
        };
        if let Some(log_dir) = &self.log_dir {
            config.log_dir = log_dir.clone();
        }
        config
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            backend: self.backend,
            readiness_timeout: Duration::from_millis(self.readiness_timeout_ms),
            query_program: self.query_program.clone(),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }
}
