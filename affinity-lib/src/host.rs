//! Host distribution and package manager detection
//!
//! Detection never fails: every miss degrades to the next, weaker signal (os-release,
//! `lsb_release`, release files, a package-manager probe on PATH) and finally a
//! fixed default. The result only feeds
//! advisory text, so a guess is always preferable to an error.

use crate::process::{CommandRunner, CommandSpec, SystemRunner};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const LSB_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Linux distribution family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DistroFamily {
    Debian,
    Fedora,
    Arch,
    Suse,
    Unknown,
}

impl DistroFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistroFamily::Debian => "debian",
            DistroFamily::Fedora => "fedora",
            DistroFamily::Arch => "arch",
            DistroFamily::Suse => "suse",
            DistroFamily::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DistroFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host package manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Pacman,
    Zypper,
    Unknown,
}

impl PackageManager {
    /// Probe order when the distribution is not recognised
    pub const PROBE_ORDER: [PackageManager; 4] = [
        PackageManager::Apt,
        PackageManager::Dnf,
        PackageManager::Pacman,
        PackageManager::Zypper,
    ];

    /// Used when nothing else can be determined
    pub const FALLBACK: PackageManager = PackageManager::Apt;

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Dnf => "dnf",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
            PackageManager::Unknown => "unknown",
        }
    }

    /// Executable expected on PATH
    pub fn executable(&self) -> Option<&'static str> {
        match self {
            PackageManager::Unknown => None,
            other => Some(other.as_str()),
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What we know about the host, computed fresh on every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostProfile {
    pub distro_id: String,
    pub distro_family: DistroFamily,
    pub package_manager: PackageManager,
    pub version_string: String,
}

const DISTRO_TABLE: &[(&str, DistroFamily, PackageManager)] = &[
    ("ubuntu", DistroFamily::Debian, PackageManager::Apt),
    ("debian", DistroFamily::Debian, PackageManager::Apt),
    ("linuxmint", DistroFamily::Debian, PackageManager::Apt),
    ("elementary", DistroFamily::Debian, PackageManager::Apt),
    ("pop", DistroFamily::Debian, PackageManager::Apt),
    ("popos", DistroFamily::Debian, PackageManager::Apt),
    ("deepin", DistroFamily::Debian, PackageManager::Apt),
    ("fedora", DistroFamily::Fedora, PackageManager::Dnf),
    ("rhel", DistroFamily::Fedora, PackageManager::Dnf),
    ("centos", DistroFamily::Fedora, PackageManager::Dnf),
    ("rocky", DistroFamily::Fedora, PackageManager::Dnf),
    ("almalinux", DistroFamily::Fedora, PackageManager::Dnf),
    ("arch", DistroFamily::Arch, PackageManager::Pacman),
    ("manjaro", DistroFamily::Arch, PackageManager::Pacman),
    ("garuda", DistroFamily::Arch, PackageManager::Pacman),
    ("endeavouros", DistroFamily::Arch, PackageManager::Pacman),
    ("cachyos", DistroFamily::Arch, PackageManager::Pacman),
    ("artix", DistroFamily::Arch, PackageManager::Pacman),
    ("opensuse", DistroFamily::Suse, PackageManager::Zypper),
    ("opensuse-leap", DistroFamily::Suse, PackageManager::Zypper),
    ("opensuse-tumbleweed", DistroFamily::Suse, PackageManager::Zypper),
    ("suse", DistroFamily::Suse, PackageManager::Zypper),
];

/// Name fragments tried against the tokens of ids the table does not know
///
/// Fragments shorter than `PREFIX_MIN_LEN` must equal a whole token.
const HEURISTICS: &[(&str, &str)] = &[
    ("arch", "arch"),
    ("manjaro", "manjaro"),
    ("garuda", "garuda"),
    ("endeavour", "endeavouros"),
    ("cachy", "cachyos"),
    ("artix", "artix"),
    ("ubuntu", "ubuntu"),
    ("debian", "debian"),
    ("mint", "linuxmint"),
    ("elementary", "elementary"),
    ("fedora", "fedora"),
    ("centos", "centos"),
    ("rhel", "rhel"),
    ("rocky", "rocky"),
    ("alma", "almalinux"),
    ("opensuse", "opensuse"),
    ("suse", "suse"),
];

/// Release files checked when os-release is absent
const RELEASE_FILES: &[(&str, &str)] = &[
    ("etc/fedora-release", "fedora"),
    ("etc/arch-release", "arch"),
    ("etc/redhat-release", "rhel"),
];

const PREFIX_MIN_LEN: usize = 4;

fn heuristic_match(id: &str) -> Option<&'static str> {
    let tokens: Vec<&str> = id.split('-').filter(|t| !t.is_empty()).collect();
    HEURISTICS
        .iter()
        .find(|(needle, _)| {
            tokens.iter().any(|token| {
                *token == *needle || (needle.len() >= PREFIX_MIN_LEN && token.starts_with(needle))
            })
        })
        .map(|(_, canonical)| *canonical)
}

/// Distributor id reported by `lsb_release -si`
pub fn query_lsb_release(runner: &dyn CommandRunner) -> Option<String> {
    crate::process::find_in_path("lsb_release")?;
    let spec = CommandSpec::new("lsb_release")
        .arg("-si")
        .timeout(LSB_RELEASE_TIMEOUT);
    match runner.run(&spec) {
        Ok(output) if output.success => {
            let id = output.stdout.trim().to_string();
            (!id.is_empty()).then_some(id)
        }
        Ok(output) => {
            debug!("lsb_release exited with {:?}", output.code);
            None
        }
        Err(e) => {
            debug!("lsb_release failed: {}", e);
            None
        }
    }
}

fn lookup(id: &str) -> Option<(DistroFamily, PackageManager)> {
    DISTRO_TABLE
        .iter()
        .find(|(name, _, _)| *name == id)
        .map(|(_, family, pm)| (*family, *pm))
}

type PathProbe = Box<dyn Fn(&str) -> bool + Send + Sync>;
type LsbProbe = Box<dyn Fn() -> Option<String> + Send + Sync>;

/// Detects the host distribution
pub struct HostProfiler {
    root: PathBuf,
    on_path: PathProbe,
    lsb_release: LsbProbe,
}

impl Default for HostProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProfiler {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/"),
            on_path: Box::new(|name| crate::process::find_in_path(name).is_some()),
            lsb_release: Box::new(|| query_lsb_release(&SystemRunner::new(false))),
        }
    }

    /// Profiler reading system files below `root` with a custom PATH probe
    pub fn with_root<F>(root: impl Into<PathBuf>, on_path: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            root: root.into(),
            on_path: Box::new(on_path),
            lsb_release: Box::new(|| None),
        }
    }

    /// Replace the `lsb_release` probe consulted when os-release has no ID
    pub fn with_lsb_release<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.lsb_release = Box::new(probe);
        self
    }

    /// Detect the host profile
    pub fn detect(&self) -> HostProfile {
        let release = self.read_os_release();
        let version_string = release
            .get("VERSION_ID")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let raw_id = release
            .get("ID")
            .cloned()
            .or_else(|| (self.lsb_release)())
            .or_else(|| self.release_file_id().map(str::to_string));

        let id = raw_id.as_deref().and_then(normalize_id);
        let like: Vec<String> = release
            .get("ID_LIKE")
            .map(|v| v.split_whitespace().filter_map(normalize_id).collect())
            .unwrap_or_default();

        let profile = match id {
            Some(id) => self.classify(&id, &like, version_string),
            None => self.probe_only("unknown".to_string(), version_string),
        };

        debug!(
            "Host: {} (family {}, package manager {})",
            profile.distro_id, profile.distro_family, profile.package_manager
        );
        profile
    }

    fn classify(&self, id: &str, like: &[String], version_string: String) -> HostProfile {
        let matched = candidate_ids(id)
            .into_iter()
            .chain(like.iter().flat_map(|l| candidate_ids(l)))
            .find_map(|candidate| lookup(&candidate).map(|hit| (candidate, hit)))
            .or_else(|| {
                heuristic_match(id)
                    .and_then(|canonical| lookup(canonical).map(|hit| (canonical.to_string(), hit)))
            });

        match matched {
            Some((canonical, (family, package_manager))) => {
                if canonical != id {
                    debug!("Mapped distro id {} to {}", id, canonical);
                }
                HostProfile {
                    distro_id: id.to_string(),
                    distro_family: family,
                    package_manager,
                    version_string,
                }
            }
            None => self.probe_only(id.to_string(), version_string),
        }
    }

    fn probe_only(&self, distro_id: String, version_string: String) -> HostProfile {
        let package_manager = PackageManager::PROBE_ORDER
            .iter()
            .copied()
            .find(|pm| pm.executable().map(|exe| (self.on_path)(exe)).unwrap_or(false))
            .unwrap_or(PackageManager::FALLBACK);

        HostProfile {
            distro_id,
            distro_family: DistroFamily::Unknown,
            package_manager,
            version_string,
        }
    }

    fn read_os_release(&self) -> HashMap<String, String> {
        ["etc/os-release", "usr/lib/os-release"]
            .iter()
            .find_map(|rel| std::fs::read_to_string(self.root.join(rel)).ok())
            .map(|content| parse_os_release(&content))
            .unwrap_or_default()
    }

    fn release_file_id(&self) -> Option<&'static str> {
        RELEASE_FILES
            .iter()
            .find(|(rel, _)| self.root.join(rel).exists())
            .map(|(_, id)| *id)
    }

    /// Root the profiler reads from
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Parse `KEY=value` lines, stripping optional quotes
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

/// Lowercase, unify separators to `-`, strip surrounding punctuation
pub fn normalize_id(raw: &str) -> Option<String> {
    let lowered = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_lowercase()
        .replace('_', "-");

    let joined = lowered
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Lookup keys derived from a normalized id, most specific first
fn candidate_ids(id: &str) -> Vec<String> {
    let mut candidates = vec![id.to_string()];
    if id.contains('-') {
        candidates.push(id.replace('-', ""));
        candidates.extend(id.split('-').filter(|p| !p.is_empty()).map(str::to_string));
    }
    if let Some(stem) = id.strip_suffix("linux").filter(|s| !s.is_empty()) {
        candidates.push(stem.trim_end_matches('-').to_string());
    }

    let mut seen = std::collections::HashSet::new();
    candidates.retain(|c| !c.is_empty() && seen.insert(c.clone()));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn profile_for(os_release: Option<&str>, on_path: &'static [&'static str]) -> HostProfile {
        let root = tempdir().unwrap();
        if let Some(content) = os_release {
            std::fs::create_dir_all(root.path().join("etc")).unwrap();
            std::fs::write(root.path().join("etc/os-release"), content).unwrap();
        }
        HostProfiler::with_root(root.path(), move |name| on_path.contains(&name)).detect()
    }

    #[test]
    fn direct_table_hit() {
        let profile = profile_for(Some("ID=ubuntu\nVERSION_ID=\"24.04\"\n"), &[]);
        assert_eq!(profile.distro_id, "ubuntu");
        assert_eq!(profile.distro_family, DistroFamily::Debian);
        assert_eq!(profile.package_manager, PackageManager::Apt);
        assert_eq!(profile.version_string, "24.04");
    }

    #[test]
    fn compound_ids_split_into_candidates() {
        let profile = profile_for(Some("ID=\"opensuse-tumbleweed\"\n"), &[]);
        assert_eq!(profile.distro_family, DistroFamily::Suse);

        let profile = profile_for(Some("ID=Pop_OS\n"), &[]);
        assert_eq!(profile.distro_family, DistroFamily::Debian);
    }

    #[test]
    fn id_like_fallback() {
        let profile = profile_for(Some("ID=nobara\nID_LIKE=\"rhel centos fedora\"\n"), &[]);
        assert_eq!(profile.distro_id, "nobara");
        assert_eq!(profile.distro_family, DistroFamily::Fedora);
        assert_eq!(profile.package_manager, PackageManager::Dnf);
    }

    #[test]
    fn substring_heuristic() {
        let profile = profile_for(Some("ID=archcraft\n"), &[]);
        assert_eq!(profile.distro_family, DistroFamily::Arch);
        assert_eq!(profile.package_manager, PackageManager::Pacman);
    }

    #[test]
    fn heuristics_match_whole_tokens() {
        let profile = profile_for(Some("ID=popcorn\n"), &["dnf"]);
        assert_eq!(profile.distro_family, DistroFamily::Unknown);
        assert_eq!(profile.package_manager, PackageManager::Dnf);

        let profile = profile_for(Some("ID=my-mint-spin\n"), &[]);
        assert_eq!(profile.distro_family, DistroFamily::Debian);

        assert_eq!(heuristic_match("archcraft"), Some("arch"));
        assert_eq!(heuristic_match("tropical"), None);
    }

    #[test]
    fn lsb_release_fills_in_for_os_release() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::write(root.path().join("etc/redhat-release"), "").unwrap();

        let profile = HostProfiler::with_root(root.path(), |_| false)
            .with_lsb_release(|| Some("LinuxMint".to_string()))
            .detect();
        assert_eq!(profile.distro_id, "linuxmint");
        assert_eq!(profile.distro_family, DistroFamily::Debian);
    }

    #[test]
    fn lsb_release_output_is_trimmed() {
        use crate::process::testing::RecordingRunner;
        use crate::process::CommandOutput;

        let runner = RecordingRunner::with_handler(|_| Ok(CommandOutput::ok("Ubuntu\n")));
        if crate::process::find_in_path("lsb_release").is_some() {
            assert_eq!(query_lsb_release(&runner).as_deref(), Some("Ubuntu"));
            assert_eq!(runner.rendered(), vec!["lsb_release -si".to_string()]);
        } else {
            assert_eq!(query_lsb_release(&runner), None);
            assert!(runner.calls().is_empty());
        }
    }

    #[test]
    fn unknown_distro_probes_path() {
        let profile = profile_for(Some("ID=gentoo\n"), &["zypper", "pacman"]);
        assert_eq!(profile.distro_family, DistroFamily::Unknown);
        assert_eq!(profile.package_manager, PackageManager::Pacman);
    }

    #[test]
    fn nothing_known_falls_back() {
        let profile = profile_for(None, &[]);
        assert_eq!(profile.distro_id, "unknown");
        assert_eq!(profile.distro_family, DistroFamily::Unknown);
        assert_eq!(profile.package_manager, PackageManager::FALLBACK);
        assert_eq!(profile.version_string, "unknown");
    }

    #[test]
    fn release_file_fallback() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::write(root.path().join("etc/arch-release"), "").unwrap();

        let profile = HostProfiler::with_root(root.path(), |_| false).detect();
        assert_eq!(profile.distro_family, DistroFamily::Arch);
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_id("  \"Linux_Mint\" ").as_deref(), Some("linux-mint"));
        assert_eq!(normalize_id("open  SUSE--leap").as_deref(), Some("open-suse-leap"));
        assert_eq!(normalize_id("--"), None);
    }
}
