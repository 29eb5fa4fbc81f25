//! Host package advice
//!
//! Maps the detected package manager to the commands an operator would run. The tool
//! only renders these commands; it never invokes the package manager itself.

use crate::host::{DistroFamily, HostProfile, PackageManager};
use crate::process::{CommandRunner, CommandSpec};
use std::time::Duration;
use tracing::debug;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Command lines for one package manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageManagerCommands {
    /// Prefix of the install command, packages are appended
    pub install: &'static str,
    /// argv prefix that exits 0 when a package is installed
    pub query: &'static [&'static str],
    pub update: &'static str,
    /// Advice for enabling 32-bit packages
    pub multiarch: &'static str,
}

const COMMANDS: &[(PackageManager, PackageManagerCommands)] = &[
    (
        PackageManager::Apt,
        PackageManagerCommands {
            install: "sudo apt-get install -y",
            query: &["dpkg", "-s"],
            update: "sudo apt-get update",
            multiarch: "sudo dpkg --add-architecture i386 && sudo apt-get update",
        },
    ),
    (
        PackageManager::Dnf,
        PackageManagerCommands {
            install: "sudo dnf install -y",
            query: &["rpm", "-q"],
            update: "sudo dnf check-update",
            multiarch: "sudo dnf install -y glibc.i686 libstdc++.i686",
        },
    ),
    (
        PackageManager::Pacman,
        PackageManagerCommands {
            install: "sudo pacman -S --noconfirm",
            query: &["pacman", "-Q"],
            update: "sudo pacman -Syy",
            multiarch: "Enable the [multilib] repository in /etc/pacman.conf",
        },
    ),
    (
        PackageManager::Zypper,
        PackageManagerCommands {
            install: "sudo zypper install -y",
            query: &["rpm", "-q"],
            update: "sudo zypper refresh",
            multiarch: "sudo zypper install -y glibc-32bit",
        },
    ),
];

/// Commands for `pm`, None for an unknown package manager
pub fn commands(pm: PackageManager) -> Option<&'static PackageManagerCommands> {
    COMMANDS
        .iter()
        .find(|(candidate, _)| *candidate == pm)
        .map(|(_, commands)| commands)
}

const DEBIAN_PACKAGES: &[&str] = &[
    "wine",
    "wine64",
    "winetricks",
    "libc6:i386",
    "libgcc-s1:i386",
    "libstdc++6:i386",
    "libx11-6:i386",
    "libvulkan1",
    "libvulkan1:i386",
    "libxrender1",
    "fontconfig",
    "fonts-dejavu",
    "fonts-liberation",
    "curl",
];

const FEDORA_PACKAGES: &[&str] = &[
    "wine",
    "winetricks",
    "glibc.i686",
    "libstdc++.i686",
    "libX11.i686",
    "vulkan-loader",
    "mesa-libGL",
    "fontconfig",
    "dejavu-fonts",
    "liberation-fonts",
    "curl",
];

const ARCH_PACKAGES: &[&str] = &[
    "wine",
    "winetricks",
    "lib32-glibc",
    "lib32-gcc-libs",
    "lib32-libx11",
    "vulkan-icd-loader",
    "lib32-vulkan-icd-loader",
    "mesa",
    "lib32-mesa",
    "fontconfig",
    "ttf-dejavu",
    "ttf-liberation",
    "curl",
];

const SUSE_PACKAGES: &[&str] = &[
    "wine",
    "winetricks",
    "glibc-32bit",
    "libstdc++6-32bit",
    "libX11-6-32bit",
    "Mesa",
    "fontconfig",
    "dejavu-fonts",
    "liberation-fonts",
    "curl",
];

const GENERIC_PACKAGES: &[&str] = &["wine", "winetricks", "fontconfig", "curl"];

/// Host packages the pipeline relies on for a distribution family
pub fn packages_for(family: DistroFamily) -> &'static [&'static str] {
    match family {
        DistroFamily::Debian => DEBIAN_PACKAGES,
        DistroFamily::Fedora => FEDORA_PACKAGES,
        DistroFamily::Arch => ARCH_PACKAGES,
        DistroFamily::Suse => SUSE_PACKAGES,
        DistroFamily::Unknown => GENERIC_PACKAGES,
    }
}

/// Packages not reported as installed by the host package database
///
/// A failed or timed-out query counts as missing.
pub fn missing_packages(profile: &HostProfile, runner: &dyn CommandRunner) -> Vec<String> {
    let packages = packages_for(profile.distro_family);
    let Some(commands) = commands(profile.package_manager) else {
        return packages.iter().map(|p| p.to_string()).collect();
    };

    packages
        .iter()
        .filter(|package| {
            let spec = CommandSpec::new(commands.query[0])
                .args(&commands.query[1..])
                .arg(package)
                .timeout(QUERY_TIMEOUT);
            match runner.run(&spec) {
                Ok(output) => !output.success,
                Err(e) => {
                    debug!("Package query for {} failed: {}", package, e);
                    true
                }
            }
        })
        .map(|p| p.to_string())
        .collect()
}

/// Advisory install command for `missing`
pub fn install_command_line(pm: PackageManager, missing: &[String]) -> Option<String> {
    if missing.is_empty() {
        return None;
    }
    commands(pm).map(|c| format!("{} {}", c.install, missing.join(" ")))
}
