//! Prefix preparation
//!
//! Brings a Wine prefix to a [`Profile`] idempotently. The last fully applied profile is
//! recorded in a marker file inside the prefix; only the components the target profile
//! adds on top of it are installed. The marker is written after everything else
//! succeeded, so an interrupted run simply repeats the missing work.

use crate::error::{AffinityError, Result};
use crate::profile::Profile;
use crate::process::{self, CommandRunner, CommandSpec};
use crate::runtime::Runtime;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Marker file holding the last applied profile name
pub const MARKER_NAME: &str = ".affinity_cli_prepared";

/// Guest OS version forced on the prefix
pub const TARGET_WINDOWS: &str = "win11";

const WINECFG_TIMEOUT: Duration = Duration::from_secs(120);
const REGEDIT_TIMEOUT: Duration = Duration::from_secs(120);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const COMPONENT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const REG_FILE_NAME: &str = "set_winver.reg";
const CURRENT_VERSION_KEY: &str = "HKLM\\Software\\Microsoft\\Windows NT\\CurrentVersion";

/// What `prepare` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The marker already recorded the target profile
    AlreadySatisfied,
    /// Components installed by this run, in profile order
    Prepared { installed: Vec<String> },
}

/// Result of the best-effort guest version check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    Confirmed(String),
    /// The query ran but did not report Windows 10/11
    Unconfirmed(String),
    Error(String),
}

impl VersionCheck {
    pub fn is_error(&self) -> bool {
        matches!(self, VersionCheck::Error(_))
    }
}

/// Prepares a prefix for the Affinity installer
pub struct EnvironmentPreparer<'a> {
    prefix: PathBuf,
    runtime: &'a Runtime,
    runner: &'a dyn CommandRunner,
    component_tool: Option<PathBuf>,
}

impl<'a> EnvironmentPreparer<'a> {
    pub fn new(prefix: impl Into<PathBuf>, runtime: &'a Runtime, runner: &'a dyn CommandRunner) -> Self {
        Self {
            prefix: prefix.into(),
            runtime,
            runner,
            component_tool: None,
        }
    }

    /// Use a specific winetricks binary instead of looking it up on `PATH`
    pub fn with_component_tool(mut self, path: impl Into<PathBuf>) -> Self {
        self.component_tool = Some(path.into());
        self
    }

    pub fn marker_path(&self) -> PathBuf {
        self.prefix.join(MARKER_NAME)
    }

    /// Last applied profile; an unreadable or unknown marker counts as never prepared
    pub fn applied_profile(&self) -> Option<Profile> {
        let marker = self.marker_path();
        let content = std::fs::read_to_string(&marker).ok()?;
        match content.parse() {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!("Ignoring marker {}: {}", marker.display(), e);
                None
            }
        }
    }

    /// Forget the applied profile so the next `prepare` installs everything again
    pub fn clear_marker(&self) -> Result<bool> {
        match std::fs::remove_file(self.marker_path()) {
            Ok(()) => {
                debug!("Removed marker {}", self.marker_path().display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Bring the prefix to `target`
    pub fn prepare(&self, target: Profile) -> Result<PrepareOutcome> {
        let previous = self.applied_profile();
        let missing = target.missing_since(previous);

        if previous == Some(target) && missing.is_empty() {
            info!(
                "Prefix already prepared with profile '{}' (marker found at {})",
                target,
                self.marker_path().display()
            );
            return Ok(PrepareOutcome::AlreadySatisfied);
        }

        info!(
            "Preparing Wine prefix {} for profile '{}'",
            self.prefix.display(),
            target
        );

        self.set_windows_version();

        if missing.is_empty() {
            info!("No additional components needed for profile '{}'", target);
        } else {
            if target == Profile::Full {
                info!("This may take several minutes (dotnet48, DXVK, vkd3d)");
            }
            self.install_components(&missing)?;
        }

        self.force_windows_version_registry()?;

        std::fs::write(self.marker_path(), target.as_str())?;
        info!("Prefix preparation complete");

        Ok(PrepareOutcome::Prepared {
            installed: missing.iter().map(|c| c.to_string()).collect(),
        })
    }

    /// First pass: `winecfg /v`, unreliable across runtime versions so failure only warns
    fn set_windows_version(&self) {
        let spec = self
            .runtime
            .command(&self.prefix)
            .args(["winecfg", "/v", TARGET_WINDOWS])
            .timeout(WINECFG_TIMEOUT);

        info!("Setting Windows version to {}", TARGET_WINDOWS);
        match self.runner.run(&spec) {
            Ok(output) if output.success => {}
            Ok(output) => warn!(
                "winecfg /v {} exited with {:?}: {}",
                TARGET_WINDOWS,
                output.code,
                output.stderr.trim()
            ),
            Err(e) => warn!("winecfg /v {} failed: {}", TARGET_WINDOWS, e),
        }
    }

    /// Second pass: import a registry file with the version keys for HKCU and HKLM
    fn force_windows_version_registry(&self) -> Result<()> {
        let drive_c = self.prefix.join("drive_c");
        std::fs::create_dir_all(&drive_c)?;
        let reg_path = drive_c.join(REG_FILE_NAME);
        std::fs::write(&reg_path, windows_version_registry())?;

        let spec = self
            .runtime
            .command(&self.prefix)
            .args(["regedit", "/S"])
            .arg(format!("C:\\{}", REG_FILE_NAME))
            .timeout(REGEDIT_TIMEOUT);

        info!("Applying Windows version registry keys");
        let result = self.runner.run(&spec);

        if let Err(e) = std::fs::remove_file(&reg_path) {
            debug!("Could not remove {}: {}", reg_path.display(), e);
        }

        let output = result?;
        if !output.success {
            return Err(AffinityError::preparation(
                format!(
                    "Applying Windows version registry keys failed with exit {:?}: {}",
                    output.code,
                    output.stderr.trim()
                ),
                format!(
                    "Run `wine regedit` inside {} to inspect the registry, or recreate the prefix.",
                    self.prefix.display()
                ),
            ));
        }
        Ok(())
    }

    fn install_components(&self, components: &[&str]) -> Result<()> {
        let tool = self.resolve_component_tool()?;
        info!("Installing winetricks components: {}", components.join(", "));

        let spec = CommandSpec::new(tool)
            .arg("-q")
            .args(components)
            .envs(&self.runtime.environment(&self.prefix))
            .env("WINE", &self.runtime.wine_bin)
            .env("WINESERVER", &self.runtime.wineserver_bin)
            .timeout(COMPONENT_TIMEOUT);

        let output = self.runner.stream(&spec, &mut |line| {
            if line.trim().is_empty() {
                debug!("winetricks is still running...");
            } else {
                info!("{}", line);
            }
        })?;

        if !output.success {
            return Err(AffinityError::preparation(
                format!("winetricks failed with exit code {:?}", output.code),
                "Retry, or install the components manually with `winetricks -q <component>`.",
            ));
        }
        Ok(())
    }

    fn resolve_component_tool(&self) -> Result<PathBuf> {
        if let Some(ref tool) = self.component_tool {
            return Ok(tool.clone());
        }
        match process::find_in_path("winetricks") {
            Some(path) => Ok(path),
            None if self.runner.is_dry_run() => Ok(PathBuf::from("winetricks")),
            None => Err(AffinityError::preparation(
                "winetricks is required to prepare the prefix (missing).",
                "Install winetricks (e.g., Ubuntu: sudo apt install winetricks; Arch: sudo pacman -S winetricks) and re-run.",
            )),
        }
    }

    /// Ask the registry which Windows version the prefix reports
    pub fn verify_version(&self) -> VersionCheck {
        let spec = self
            .runtime
            .command(&self.prefix)
            .args(["reg", "query", CURRENT_VERSION_KEY, "/v", "CurrentVersion"])
            .timeout(QUERY_TIMEOUT);

        let output = match self.runner.run(&spec) {
            Ok(output) => output,
            Err(e) => return VersionCheck::Error(e.to_string()),
        };

        let combined = output.combined();
        let reported = combined.trim().to_string();
        if reported.contains("10.") || reported.contains("11.") {
            info!("Confirmed Windows version via registry: {}", reported);
            VersionCheck::Confirmed(reported)
        } else {
            warn!(
                "Could not confirm the prefix Windows version as 10/11; continuing. \
                 If the installer complains about the Windows version, recreate the prefix."
            );
            VersionCheck::Unconfirmed(reported)
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }
}

/// Registry import forcing Windows 11 for both hives
fn windows_version_registry() -> String {
    let mut content = String::from("REGEDIT4\n");
    for hive in ["HKEY_CURRENT_USER", "HKEY_LOCAL_MACHINE"] {
        content.push_str(&format!(
            "\n[{}\\Software\\Microsoft\\Windows NT\\CurrentVersion]\n\
             \"CurrentVersion\"=\"11.0\"\n\
             \"CurrentBuildNumber\"=\"19045\"\n\
             \"CurrentBuild\"=\"19045\"\n\
             \"ProductName\"=\"Windows 11 Pro\"\n",
            hive
        ));
    }
    content
}
