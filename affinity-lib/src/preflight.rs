//! Pre-flight environment validation
//!
//! Every check runs regardless of the others and contributes zero or more issues.
//! Errors block the pipeline, warnings are surfaced and the run continues.

use crate::config::Config;
use crate::host::HostProfile;
use crate::process::{CommandRunner, CommandSpec, SystemRunner};
use crate::runtime::{self, RuntimeRelease};
use serde::Serialize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Extra runtime names accepted by the check beyond what the driver can run
const EXTRA_RUNTIME_NAMES: &[&str] = &["proton", "proton-run"];

const VULKAN_TOOL: &str = "vulkaninfo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightIssue {
    pub severity: Severity,
    pub message: String,
    pub hint: Option<String>,
}

impl PreflightIssue {
    pub fn error(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn warning(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            hint: Some(hint.into()),
        }
    }
}

/// Ordered issues plus the derived pass/fail flag
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub ok: bool,
    pub issues: Vec<PreflightIssue>,
}

impl PreflightReport {
    pub fn from_issues(issues: Vec<PreflightIssue>) -> Self {
        let ok = !issues.iter().any(|i| i.severity == Severity::Error);
        Self { ok, issues }
    }

    pub fn errors(&self) -> impl Iterator<Item = &PreflightIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &PreflightIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }
}

/// Filesystem and process facts the checks depend on
pub trait HostProbe {
    /// Bytes available to unprivileged users on the filesystem holding `path`
    fn available_space(&self, path: &Path) -> std::io::Result<u64>;

    fn find_executable(&self, name: &str) -> Option<PathBuf>;

    fn env_var(&self, key: &str) -> Option<String>;

    /// GPU vendor for diagnostics only
    fn gpu_vendor(&self) -> Option<String> {
        None
    }
}

/// Probes the real host
#[derive(Debug, Default)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(path)
    }

    fn find_executable(&self, name: &str) -> Option<PathBuf> {
        crate::process::find_in_path(name)
    }

    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }

    fn gpu_vendor(&self) -> Option<String> {
        let lspci = self.find_executable("lspci")?;
        let spec = CommandSpec::new(lspci)
            .arg("-nnk")
            .timeout(Duration::from_secs(5));
        let output = SystemRunner::new(false).run(&spec).ok()?;
        if !output.success {
            return None;
        }
        let text = output.stdout.to_lowercase();
        ["nvidia", "amd", "intel"]
            .iter()
            .find(|vendor| text.contains(*vendor))
            .map(|vendor| vendor.to_string())
    }
}

/// Runs the pre-flight checks
pub struct PreflightValidator<'a> {
    cache_dir: PathBuf,
    min_free_bytes: u64,
    runtime_dir: PathBuf,
    runtime_release: RuntimeRelease,
    runtime_acquirable: bool,
    host: &'a HostProfile,
    probe: &'a dyn HostProbe,
}

impl<'a> PreflightValidator<'a> {
    pub fn new(config: &Config, host: &'a HostProfile, probe: &'a dyn HostProbe) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            min_free_bytes: config.min_free_bytes,
            runtime_dir: config.runtime_dir.clone(),
            runtime_release: config.runtime.clone(),
            runtime_acquirable: false,
            host,
            probe,
        }
    }

    /// A missing runtime is only a warning when the caller will fetch one
    pub fn runtime_acquirable(mut self, acquirable: bool) -> Self {
        self.runtime_acquirable = acquirable;
        self
    }

    pub fn run(&self) -> PreflightReport {
        let mut issues = Vec::new();
        issues.extend(self.check_disk_space());
        issues.extend(self.check_cache_dir());
        issues.extend(self.check_runtime());
        issues.extend(self.check_vulkan());
        issues.extend(self.check_package_manager());

        let report = PreflightReport::from_issues(issues);
        debug!(
            "Preflight finished: ok={} ({} issues)",
            report.ok,
            report.issues.len()
        );
        report
    }

    fn check_disk_space(&self) -> Vec<PreflightIssue> {
        let Some(target) = nearest_existing(&self.cache_dir) else {
            return vec![PreflightIssue::error(
                format!(
                    "Path {} could not be inspected for free space.",
                    self.cache_dir.display()
                ),
                "Create the path or choose a different cache directory.",
            )];
        };

        match self.probe.available_space(&target) {
            Ok(free) if free < self.min_free_bytes => vec![PreflightIssue::error(
                format!(
                    "Not enough free space in {}: {:.1} GB available, {:.0} GB required.",
                    target.display(),
                    free as f64 / GIB,
                    self.min_free_bytes as f64 / GIB
                ),
                "Free up disk space or set --cache-dir to a drive with more capacity.",
            )],
            Ok(_) => vec![],
            Err(e) => vec![PreflightIssue::error(
                format!("Could not read free space at {}: {}", target.display(), e),
                "Create the path or choose a different cache directory.",
            )],
        }
    }

    fn check_cache_dir(&self) -> Vec<PreflightIssue> {
        if let Err(e) = std::fs::create_dir_all(&self.cache_dir) {
            return vec![PreflightIssue::error(
                format!(
                    "Cache directory {} could not be created: {}",
                    self.cache_dir.display(),
                    e
                ),
                "Adjust permissions or choose a different cache directory.",
            )];
        }

        let mut issues = Vec::new();
        if let Err(e) = tempfile::NamedTempFile::new_in(&self.cache_dir) {
            issues.push(PreflightIssue::error(
                format!(
                    "Cache directory {} is not writable: {}",
                    self.cache_dir.display(),
                    e
                ),
                "Run with a writable cache directory or adjust permissions.",
            ));
        }

        if let Ok(metadata) = std::fs::metadata(&self.cache_dir) {
            let mode = metadata.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                issues.push(PreflightIssue::warning(
                    format!(
                        "Cache directory permissions are {:o}, recommended 700.",
                        mode
                    ),
                    format!("Run: chmod 700 {}", self.cache_dir.display()),
                ));
            }
        }

        issues
    }

    fn check_runtime(&self) -> Vec<PreflightIssue> {
        let overrides = runtime::OVERRIDE_VARS
            .iter()
            .filter_map(|var| self.probe.env_var(var));

        for candidate in overrides {
            if let Some(found) = self.resolve(&candidate) {
                debug!("Runtime override resolves to {}", found.display());
                return vec![];
            }
            debug!("Runtime override {} does not resolve", candidate);
        }

        if let Some(managed) = runtime::find_managed_binary(&self.runtime_dir, &self.runtime_release) {
            debug!("Managed runtime found at {}", managed.display());
            return vec![];
        }

        let names = runtime::BINARY_NAMES.iter().chain(EXTRA_RUNTIME_NAMES);
        for name in names {
            if let Some(found) = self.probe.find_executable(name) {
                debug!("Using runtime candidate: {} -> {}", name, found.display());
                return vec![];
            }
        }

        let message = "Wine/Proton runtime not found in PATH.";
        if self.runtime_acquirable {
            vec![PreflightIssue::warning(
                message,
                "A managed Wine build will be downloaded.",
            )]
        } else {
            vec![PreflightIssue::error(
                message,
                "Install wine64 (or run `affinity-cli runtime`), or set AFFINITY_WINE_BIN.",
            )]
        }
    }

    fn check_vulkan(&self) -> Vec<PreflightIssue> {
        if let Some(vendor) = self.probe.gpu_vendor() {
            debug!("Detected GPU vendor: {}", vendor);
        }

        if self.probe.find_executable(VULKAN_TOOL).is_none() {
            return vec![PreflightIssue::warning(
                "Vulkan utilities not found (vulkaninfo missing).",
                "Install Vulkan drivers for your GPU (e.g., mesa-vulkan-drivers, nvidia-utils).",
            )];
        }
        vec![]
    }

    fn check_package_manager(&self) -> Vec<PreflightIssue> {
        match self.host.package_manager.executable() {
            None => vec![PreflightIssue::warning(
                "Could not determine package manager for your distribution.",
                "Install Wine and Vulkan manually for your distro.",
            )],
            Some(exe) if self.probe.find_executable(exe).is_none() => {
                vec![PreflightIssue::warning(
                    format!("Package manager '{}' not found in PATH.", exe),
                    format!("Install or configure {} to allow dependency installation.", exe),
                )]
            }
            Some(_) => vec![],
        }
    }

    fn resolve(&self, candidate: &str) -> Option<PathBuf> {
        if candidate.contains('/') {
            let path = PathBuf::from(candidate);
            path.is_file().then_some(path)
        } else {
            self.probe.find_executable(candidate)
        }
    }
}

const GIB: f64 = (1024 * 1024 * 1024) as f64;

/// Closest ancestor of `path` (inclusive) that exists
fn nearest_existing(path: &Path) -> Option<PathBuf> {
    path.ancestors().find(|p| p.exists()).map(Path::to_path_buf)
}
