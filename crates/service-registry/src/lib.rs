//! Desired-state registry for supervised services
//!
//! A [`ServiceDefinition`] names an executable under the kernel root together
//! with its arguments, identity and instance policy. [`ServiceGroup`]s supply
//! default flags and environment to the services that list them, and a
//! [`ServiceInstance`] binds a definition to a running kernel process.
//!
//! [`Services`] is reconciled against the executables the kernel discovers:
//! new paths become disabled services, vanished paths disable (never delete)
//! their service.

#![warn(missing_docs)]

pub mod error;
pub mod groups;
pub mod models;
pub mod services;

pub use error::{Error, Result};
pub use groups::{Groups, merge_defaults};
pub use models::{
    ServiceDefinition, ServiceField, ServiceGroup, ServiceInstance, ServiceMode, name_for_path,
    validate_name,
};
pub use services::{ServiceDefaults, Services};
