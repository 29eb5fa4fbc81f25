//! Installer kind detection and silent-switch mapping

use crate::error::Result;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Bytes inspected when sniffing an installer executable
const SNIFF_BYTES: usize = 32 * 1024;

/// Installer kinds that determine the silent switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerKind {
    /// Nullsoft Scriptable Install System
    Nsis,
    /// Inno Setup
    InnoSetup,
    /// InstallShield
    InstallShield,
    /// Executable bootstrapper around an MSI (the Affinity universal installer)
    MsiBootstrapper,
    /// Bare Windows Installer package, run through msiexec
    Msi,
    /// Unknown executable
    Generic,
}

impl InstallerKind {
    /// Switches for an unattended run
    pub fn silent_switches(&self) -> &'static [&'static str] {
        match self {
            InstallerKind::Nsis => &["/S"],
            InstallerKind::InnoSetup => &["/VERYSILENT", "/NORESTART", "/SP-"],
            InstallerKind::InstallShield => &["/s"],
            InstallerKind::MsiBootstrapper => &["/quiet", "/norestart"],
            InstallerKind::Msi => &["/qn"],
            InstallerKind::Generic => &["/q"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallerKind::Nsis => "nsis",
            InstallerKind::InnoSetup => "inno",
            InstallerKind::InstallShield => "installshield",
            InstallerKind::MsiBootstrapper => "msi-bootstrapper",
            InstallerKind::Msi => "msi",
            InstallerKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for InstallerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guess the installer kind from its filename alone
pub fn detect_from_name(filename: &str) -> InstallerKind {
    let name = filename.to_lowercase();

    if name.ends_with(".msi") {
        InstallerKind::Msi
    } else if name.contains("nsis") {
        InstallerKind::Nsis
    } else if name.contains("inno") {
        InstallerKind::InnoSetup
    } else if name.contains("installshield") {
        InstallerKind::InstallShield
    } else if name.contains("affinity") {
        // Affinity ships its installers as MSI bootstrappers
        InstallerKind::MsiBootstrapper
    } else {
        InstallerKind::Generic
    }
}

/// Detect the kind from the file's leading bytes, falling back to the filename
pub fn detect(path: &Path) -> Result<InstallerKind> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if filename.to_lowercase().ends_with(".msi") {
        return Ok(InstallerKind::Msi);
    }

    let mut buffer = Vec::with_capacity(SNIFF_BYTES);
    std::fs::File::open(path)?
        .take(SNIFF_BYTES as u64)
        .read_to_end(&mut buffer)?;

    Ok(sniff(&buffer).unwrap_or_else(|| detect_from_name(&filename)))
}

fn sniff(buffer: &[u8]) -> Option<InstallerKind> {
    let content = String::from_utf8_lossy(buffer).to_lowercase();

    if content.contains("nullsoft") || content.contains("nsis") {
        Some(InstallerKind::Nsis)
    } else if content.contains("inno setup") {
        Some(InstallerKind::InnoSetup)
    } else if content.contains("installshield") {
        Some(InstallerKind::InstallShield)
    } else if content.contains("wixburn") || content.contains("windows installer") {
        Some(InstallerKind::MsiBootstrapper)
    } else {
        None
    }
}

/// How to launch an installer under the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub kind: InstallerKind,
    /// Arguments passed to the runtime binary
    pub args: Vec<String>,
}

impl LaunchPlan {
    /// `.msi` packages go through msiexec, everything else runs directly
    pub fn new(kind: InstallerKind, installer: &Path, silent: bool) -> Self {
        let mut args = match kind {
            InstallerKind::Msi => vec![
                "msiexec".to_string(),
                "/i".to_string(),
                host_to_guest_path(installer),
            ],
            _ => vec![installer.to_string_lossy().into_owned()],
        };

        if silent {
            args.extend(kind.silent_switches().iter().map(|s| s.to_string()));
        }

        Self { kind, args }
    }

    /// Detect the kind from disk and build the plan
    pub fn for_installer(installer: &Path, silent: bool) -> Result<Self> {
        Ok(Self::new(detect(installer)?, installer, silent))
    }
}

/// Windows view of a host path through the `Z:` drive mapping
pub fn host_to_guest_path(path: &Path) -> String {
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    format!("Z:{}", absolute.to_string_lossy().replace('/', "\\"))
}
