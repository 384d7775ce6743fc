//! # Service orchestration
//!
//! Supervises the services of a [`service_registry::Services`] registry on
//! top of a process kernel reached through [`process_kernel::KernelApi`].
//!
//! A background loop periodically discovers the executables under the kernel
//! root, reconciles them against the registry, and converges the running
//! instances toward each service's policy. Ticks that change the registry
//! schedule the next one at half the interval; quiet or failed ticks wait
//! the full interval.
//!
//! ## Example
//!
//! ```no_run
//! use process_kernel::Kernel;
//! use service_orchestration::{Orchestrator, OrchestratorConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> service_orchestration::Result<()> {
//! smol::block_on(async {
//!     let config = OrchestratorConfig::default();
//!     let kernel = Arc::new(Kernel::new(&config.root)?);
//!     let orchestrator = Orchestrator::builder(config, kernel.clone()).start().await?;
//!
//!     for service in orchestrator.list_services().await {
//!         println!("{} {}", service.name, service.enabled);
//!     }
//!
//!     orchestrator.close().await?;
//!     kernel.close().await?;
//!     Ok(())
//! })
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod config;
mod instances;
mod orchestrator;
mod ticker;

pub use config::{DEFAULT_ROOT, OrchestratorConfig};
pub use instances::Instances;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, next_delay};
pub use ticker::{ManualTicker, SmolTicker, Ticker};

/// Error types for orchestration operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Service registry errors
    #[error("service registry error: {0}")]
    Registry(#[from] service_registry::Error),

    /// Process kernel errors
    #[error("kernel error: {0}")]
    Kernel(#[from] process_kernel::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON configuration error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rejected request
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Unknown instance
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Returns true for the informational no-op outcome
    pub fn is_not_modified(&self) -> bool {
        match self {
            Self::Registry(e) => e.is_not_modified(),
            Self::Kernel(e) => e.is_not_modified(),
            _ => false,
        }
    }

    /// Returns true for rejected input
    pub fn is_bad_parameter(&self) -> bool {
        match self {
            Self::BadParameter(_) => true,
            Self::Registry(e) => e.is_bad_parameter(),
            Self::Kernel(e) => e.is_bad_parameter(),
            _ => false,
        }
    }

    /// Returns true for unknown services, groups, instances or processes
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Registry(e) => e.is_not_found(),
            Self::Kernel(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;
