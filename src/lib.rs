//! Provisioning of ephemeral MySQL instances for build and test pipelines.
//!
//! [`Registry`] is the entry point: it prepares or reuses a data directory,
//! launches `mysqld` from an unpacked distribution, waits until it accepts
//! connections, bootstraps credentials on a fresh directory and stops the
//! server again.

pub mod bootstrap;
pub mod classify;
pub mod cli;
pub mod command;
pub mod config;
pub mod data_dir;
pub mod error;
pub mod launcher;
pub mod readiness;
pub mod registry;
pub mod state;

pub use config::{InstanceConfig, RegistrySettings};
pub use error::{InstanceError, Result};
pub use readiness::CancellationToken;
pub use registry::{InstanceGuard, InstanceInfo, InstanceState, Registry};
