//! Installation pipeline
//!
//! Runs the stages in order and stops at the first hard failure: preflight gate,
//! runtime, installer resolution, prefix initialisation, prefix preparation, the
//! installer itself and finally verification of the installed executables.
//! Preflight warnings are logged as soon as they are known, so they reach the operator
//! whether or not a later stage fails.

use crate::acquire::{PayloadAcquirer, StoreEndpoints};
use crate::catalog::{Criteria, InstallerCatalog, VersionCriteria};
use crate::config::Config;
use crate::error::{AffinityError, Result};
use crate::host::HostProfile;
use crate::installer::LaunchPlan;
use crate::net::HttpClient;
use crate::preflight::{HostProbe, PreflightValidator, SystemProbe};
use crate::prefix::{EnvironmentPreparer, PrepareOutcome, VersionCheck, MARKER_NAME};
use crate::process::SharedRunner;
use crate::profile::Profile;
use crate::runtime::{Runtime, RuntimeInstaller};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Executables an Affinity install leaves behind
pub const PRODUCT_EXECUTABLES: &[&str] = &["Photo.exe", "Designer.exe", "Publisher.exe", "Affinity.exe"];

const PROGRAM_DIRS: &[&str] = &["Program Files", "Program Files (x86)"];

/// Operator choices for one install run
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    /// Installer to run instead of scanning or downloading
    pub installer: Option<PathBuf>,
    /// Download URL supplied on the command line
    pub download_url: Option<String>,
    /// Download the managed Wine build when no runtime is found
    pub fetch_runtime: bool,
}

/// What an install run did
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub installer: PathBuf,
    pub prefix: PathBuf,
    pub warnings: Vec<String>,
    pub verified_executables: Vec<PathBuf>,
    pub dry_run: bool,
}

/// What a repair run did
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub prefix: PathBuf,
    /// Components installed again after the marker was cleared
    pub reinstalled: Vec<String>,
    pub warnings: Vec<String>,
    pub verified_executables: Vec<PathBuf>,
    pub dry_run: bool,
}

/// Installed product executables under the prefix's Affinity directories
pub fn find_installed_executables(prefix: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = PROGRAM_DIRS
        .iter()
        .map(|dir| prefix.join("drive_c").join(dir).join("Affinity"))
        .filter(|root| root.is_dir())
        .flat_map(|root| {
            WalkDir::new(root)
                .max_depth(3)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| {
                    let name = e.file_name().to_string_lossy();
                    PRODUCT_EXECUTABLES
                        .iter()
                        .any(|exe| exe.eq_ignore_ascii_case(&name))
                })
                .map(|e| e.into_path())
        })
        .collect();
    found.sort();
    found
}

/// Orchestrates a full install
pub struct InstallationDriver<'a> {
    config: &'a Config,
    runner: SharedRunner,
    client: HttpClient,
    host: HostProfile,
    probe: Box<dyn HostProbe + 'a>,
    runtime: Option<Runtime>,
    endpoints: StoreEndpoints,
    component_tool: Option<PathBuf>,
    progress: bool,
}

impl<'a> InstallationDriver<'a> {
    pub fn new(config: &'a Config, runner: SharedRunner, client: HttpClient, host: HostProfile) -> Self {
        Self {
            config,
            runner,
            client,
            host,
            probe: Box::new(SystemProbe),
            runtime: None,
            endpoints: StoreEndpoints::default(),
            component_tool: None,
            progress: false,
        }
    }

    pub fn with_probe(mut self, probe: impl HostProbe + 'a) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Use an already resolved runtime instead of locating one
    pub fn with_runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_endpoints(mut self, endpoints: StoreEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_component_tool(mut self, path: impl Into<PathBuf>) -> Self {
        self.component_tool = Some(path.into());
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub async fn install(&self, request: &InstallRequest) -> Result<InstallReport> {
        let start_time = Instant::now();
        let prefix = self.config.wine_prefix.clone();
        let mut warnings = Vec::new();

        self.preflight(request, &mut warnings)?;

        let runtime = self.runtime(request).await?;
        let installer = self.resolve_installer(request).await?;
        info!("Using installer {}", installer.display());

        let plan = LaunchPlan::for_installer(&installer, self.config.silent)?;
        let stages = self.stages(runtime);
        let profile = self.config.profile;
        let install_timeout = self.config.install_timeout;
        let launched = installer.clone();

        let stage_warnings = blocking(move || {
            let mut warnings = Vec::new();
            stages
                .runtime
                .ensure_prefix(&stages.prefix, stages.runner.as_ref())?;
            stages.prepare(profile, &mut warnings)?;
            stages.run_installer(&launched, &plan, install_timeout, &mut warnings)?;
            stages
                .runtime
                .wait_for_server(&stages.prefix, stages.runner.as_ref())?;
            Ok(warnings)
        })
        .await?;
        warnings.extend(stage_warnings);

        let verified_executables = if self.config.dry_run {
            info!("Dry run: skipping installation verification");
            Vec::new()
        } else {
            self.verify(&prefix)?
        };

        info!(
            "Installation finished in {:.1}s",
            start_time.elapsed().as_secs_f64()
        );

        Ok(InstallReport {
            installer,
            prefix,
            warnings,
            verified_executables,
            dry_run: self.config.dry_run,
        })
    }

    /// Refresh an existing prefix, reinstall its profile and check the products are still there
    pub async fn repair(&self) -> Result<RepairReport> {
        let prefix = self.config.wine_prefix.clone();
        if !prefix.join("drive_c").is_dir() {
            return Err(AffinityError::preparation(
                format!("No initialised Wine prefix at {}", prefix.display()),
                "Run `affinity-cli install` to create it.",
            ));
        }

        let runtime = self.runtime(&InstallRequest::default()).await?;
        let stages = self.stages(runtime);
        let profile = self.config.profile;

        let (reinstalled, warnings) = blocking(move || {
            let mut warnings = Vec::new();
            info!("Repairing Wine prefix {}", stages.prefix.display());
            if !stages
                .runtime
                .update_prefix(&stages.prefix, stages.runner.as_ref())?
            {
                warnings.push("wineboot --update completed with warnings".to_string());
            }

            stages.preparer().clear_marker()?;
            let reinstalled = stages.prepare(profile, &mut warnings)?;
            stages
                .runtime
                .wait_for_server(&stages.prefix, stages.runner.as_ref())?;
            Ok((reinstalled, warnings))
        })
        .await?;

        let verified_executables = if self.config.dry_run {
            info!("Dry run: skipping installation verification");
            Vec::new()
        } else {
            self.verify(&prefix)?
        };

        Ok(RepairReport {
            prefix,
            reinstalled,
            warnings,
            verified_executables,
            dry_run: self.config.dry_run,
        })
    }

    /// Delete the prefix, and optionally the managed runtime and the download cache
    pub async fn uninstall(&self, request: &UninstallRequest) -> Result<UninstallReport> {
        let prefix = self.config.wine_prefix.clone();
        let mut targets = Vec::new();

        let runtime = if prefix.exists() {
            if !looks_like_prefix(&prefix) {
                return Err(AffinityError::environment(
                    format!(
                        "{} does not look like a Wine prefix, refusing to delete it",
                        prefix.display()
                    ),
                    "Point --prefix at the prefix affinity-cli created.",
                ));
            }
            targets.push(prefix.clone());
            match self.runtime.clone() {
                Some(runtime) => Some(runtime),
                None => Runtime::locate(self.config).ok(),
            }
        } else {
            info!("No Wine prefix at {}", prefix.display());
            None
        };

        if request.remove_runtime && self.config.runtime_dir.exists() {
            targets.push(self.config.runtime_dir.clone());
        }
        if request.clear_cache && self.config.cache_dir.exists() {
            targets.push(self.config.cache_dir.clone());
        }

        let runner = self.runner.clone();
        let dry_run = self.config.dry_run;
        let removed = targets.clone();

        blocking(move || {
            if let Some(runtime) = runtime {
                runtime.kill_server(&prefix, runner.as_ref());
            }

            for target in &targets {
                if dry_run {
                    info!("[dry-run] would remove {}", target.display());
                    continue;
                }
                if *target == prefix {
                    let marker = prefix.join(MARKER_NAME);
                    if marker.exists() {
                        std::fs::remove_file(&marker)?;
                    }
                }
                info!("Removing {}", target.display());
                std::fs::remove_dir_all(target).map_err(|e| {
                    AffinityError::environment(
                        format!("Failed to remove {}: {}", target.display(), e),
                        "Check the directory permissions and retry.",
                    )
                })?;
            }
            Ok(())
        })
        .await?;

        Ok(UninstallReport { removed, dry_run })
    }

    fn stages(&self, runtime: Runtime) -> PrefixStages {
        PrefixStages {
            prefix: self.config.wine_prefix.clone(),
            runtime,
            runner: self.runner.clone(),
            component_tool: self.component_tool.clone(),
        }
    }

    fn preflight(&self, request: &InstallRequest, warnings: &mut Vec<String>) -> Result<()> {
        let report = PreflightValidator::new(self.config, &self.host, self.probe.as_ref())
            .runtime_acquirable(request.fetch_runtime && self.runtime.is_none())
            .run();

        for issue in report.warnings() {
            warn!("{}", issue.message);
            warnings.push(issue.message.clone());
        }

        if report.ok {
            return Ok(());
        }

        let errors: Vec<_> = report.errors().collect();
        let message = errors
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Err(AffinityError::Environment {
            message: format!("Preflight failed: {}", message),
            hint: errors.iter().find_map(|i| i.hint.clone()),
        })
    }

    async fn runtime(&self, request: &InstallRequest) -> Result<Runtime> {
        if let Some(ref runtime) = self.runtime {
            return Ok(runtime.clone());
        }

        match self.detect_runtime().await {
            Ok(runtime) => Ok(runtime),
            Err(AffinityError::Environment { .. }) if request.fetch_runtime => {
                info!("No Wine runtime found, fetching the managed build");
                RuntimeInstaller::new(self.config, self.client.clone(), self.progress)
                    .ensure()
                    .await?;
                self.detect_runtime().await
            }
            Err(e) => Err(e),
        }
    }

    async fn detect_runtime(&self) -> Result<Runtime> {
        let config = self.config.clone();
        let runner = self.runner.clone();
        blocking(move || Runtime::detect(&config, runner.as_ref())).await
    }

    /// Explicit path, then the catalog, then a download
    async fn resolve_installer(&self, request: &InstallRequest) -> Result<PathBuf> {
        if let Some(ref path) = request.installer {
            if !path.is_file() {
                return Err(AffinityError::InstallerNotFound(path.display().to_string()));
            }
            return Ok(path.clone());
        }

        let roots = vec![
            self.config.installers_path.clone(),
            self.config.cache_dir.clone(),
        ];
        let catalog = InstallerCatalog::new()?;
        let criteria = Criteria::version(VersionCriteria::parse(&self.config.default_version));

        let versioned = catalog.scan(&roots);
        if !versioned.is_empty() {
            return Ok(InstallerCatalog::select(&versioned, &criteria)?.file_path.clone());
        }

        if criteria.version == VersionCriteria::Latest {
            let universal = catalog.scan_universal(&roots);
            if let Some(candidate) = universal.first() {
                return Ok(candidate.file_path.clone());
            }
        } else {
            return Err(AffinityError::InstallerNotFound(format!(
                "version {} not found under {}",
                self.config.default_version,
                self.config.installers_path.display()
            )));
        }

        info!("No local installer found, acquiring the universal installer");
        PayloadAcquirer::new(self.config, self.client.clone(), self.progress)
            .with_endpoints(self.endpoints.clone())
            .ensure(
                None,
                request.download_url.as_deref(),
                self.config.download_url.as_deref(),
                self.config.expected_sha256.as_deref(),
            )
            .await
    }

    fn verify(&self, prefix: &Path) -> Result<Vec<PathBuf>> {
        let found = find_installed_executables(prefix);
        if found.is_empty() {
            return Err(AffinityError::Verification {
                message: format!(
                    "no Affinity executable found under {}",
                    prefix.join("drive_c").display()
                ),
                hint: Some(format!(
                    "Inspect {} or rerun the installer without --silent.",
                    prefix.display()
                )),
            });
        }

        for exe in &found {
            info!("Verified {}", exe.display());
        }
        Ok(found)
    }
}

/// Operator choices for one uninstall run
#[derive(Debug, Clone, Default)]
pub struct UninstallRequest {
    /// Also delete the managed Wine builds
    pub remove_runtime: bool,
    /// Also delete downloaded installers and runtime archives
    pub clear_cache: bool,
}

/// What an uninstall run removed, or would remove in a dry run
#[derive(Debug, Clone, Serialize)]
pub struct UninstallReport {
    pub removed: Vec<PathBuf>,
    pub dry_run: bool,
}

fn looks_like_prefix(path: &Path) -> bool {
    path.join(MARKER_NAME).is_file()
        || path.join("system.reg").is_file()
        || path.join("drive_c").is_dir()
}

/// Run a stage that waits on subprocesses on the blocking pool
async fn blocking<T, F>(stage: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(stage).await?
}

/// Owned state of the subprocess-driven stages
struct PrefixStages {
    prefix: PathBuf,
    runtime: Runtime,
    runner: SharedRunner,
    component_tool: Option<PathBuf>,
}

impl PrefixStages {
    fn preparer(&self) -> EnvironmentPreparer<'_> {
        let preparer = EnvironmentPreparer::new(&self.prefix, &self.runtime, self.runner.as_ref());
        match self.component_tool {
            Some(ref tool) => preparer.with_component_tool(tool),
            None => preparer,
        }
    }

    /// Bring the prefix to `profile` and confirm the Windows version it reports
    fn prepare(&self, profile: Profile, warnings: &mut Vec<String>) -> Result<Vec<String>> {
        let preparer = self.preparer();
        let installed = match preparer.prepare(profile)? {
            PrepareOutcome::Prepared { installed } => {
                info!("Installed {} components", installed.len());
                installed
            }
            PrepareOutcome::AlreadySatisfied => Vec::new(),
        };

        match preparer.verify_version() {
            VersionCheck::Confirmed(_) => {}
            VersionCheck::Unconfirmed(_) => {
                warnings.push("Could not confirm the prefix reports Windows 10/11".to_string());
            }
            VersionCheck::Error(e) => {
                return Err(AffinityError::preparation(
                    format!("Failed to query the prefix Windows version: {}", e),
                    format!("Check that {} starts with `wine winecfg`.", self.prefix.display()),
                ));
            }
        }
        Ok(installed)
    }

    fn run_installer(
        &self,
        installer: &Path,
        plan: &LaunchPlan,
        timeout: Duration,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        info!(
            "Launching {} installer {} (this may take several minutes)",
            plan.kind,
            installer.display()
        );

        let spec = self
            .runtime
            .command(&self.prefix)
            .args(&plan.args)
            .timeout(timeout);

        let output = self
            .runner
            .stream(&spec, &mut |line| info!("installer: {}", line))?;

        if !output.success {
            let message = format!("Installer exited with code {:?}", output.code);
            warn!("{}", message);
            warnings.push(message);
        }
        Ok(())
    }
}
