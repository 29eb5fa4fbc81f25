//! Affinity CLI Library
//!
//! Provisions a Wine prefix on a Linux host, acquires the Affinity Universal
//! installer and drives it to completion.

pub mod acquire;
pub mod archive;
pub mod catalog;
pub mod config;
pub mod deps;
pub mod download;
pub mod driver;
pub mod error;
pub mod host;
pub mod installer;
pub mod net;
pub mod preflight;
pub mod prefix;
pub mod process;
pub mod profile;
pub mod runtime;

pub use acquire::PayloadAcquirer;
pub use catalog::{Criteria, InstallerCandidate, InstallerCatalog, VersionCriteria};
pub use config::{Config, ConfigLoader};
pub use driver::{
    InstallReport, InstallRequest, InstallationDriver, RepairReport, UninstallReport, UninstallRequest,
};
pub use error::{AffinityError, Result};
pub use host::{HostProfile, HostProfiler};
pub use net::HttpClient;
pub use preflight::{PreflightReport, PreflightValidator};
pub use prefix::EnvironmentPreparer;
pub use process::{CommandRunner, SharedRunner, SystemRunner};
pub use profile::Profile;
pub use runtime::{Runtime, RuntimeInstaller};
