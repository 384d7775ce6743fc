//! Orchestrator configuration
//!
//! Loaded from YAML when the file extension is `.yaml` or `.yml`, otherwise
//! from JSON. Durations are written in milliseconds.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use service_registry::ServiceDefaults;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default kernel root
pub const DEFAULT_ROOT: &str = "/usr/local/libexec/services";

/// Settings for the orchestrator and its local kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Kernel root directory
    pub root: PathBuf,
    /// Working directory given to discovered services
    pub home: PathBuf,
    /// Full reconciliation interval
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// Deadline on executable discovery
    #[serde(rename = "discovery_timeout_ms", with = "duration_ms")]
    pub discovery_timeout: Duration,
    /// Discover executables in subdirectories too
    pub recursive: bool,
    /// Number of stopped instance records kept for inspection
    pub retain_stopped: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            interval: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(2),
            recursive: false,
            retain_stopped: 64,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a YAML or JSON file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = async_fs::read_to_string(path).await?;

        let config: Self = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            _ => serde_json::from_str(&contents)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::Config("interval_ms must be positive".to_string()));
        }
        if self.discovery_timeout.is_zero() {
            return Err(Error::Config(
                "discovery_timeout_ms must be positive".to_string(),
            ));
        }
        if self.root.as_os_str().is_empty() {
            return Err(Error::Config("root must not be empty".to_string()));
        }
        Ok(())
    }

    /// Identity and cwd for services the registry creates: the home
    /// directory and the orchestrator's own uid and gid
    pub fn service_defaults(&self) -> ServiceDefaults {
        ServiceDefaults {
            cwd: self.home.to_string_lossy().into_owned(),
            user: nix::unistd::getuid().to_string(),
            group: nix::unistd::getgid().to_string(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
