//! Configuration management for affinity-cli
//!
//! A [`Config`] is built once at startup from defaults, an optional config file
//! (TOML, YAML or JSON), `AFFINITY_*` environment overrides and finally CLI flags,
//! then passed by reference into every component.

use crate::error::{AffinityError, Result};
use crate::profile::Profile;
use crate::runtime::RuntimeRelease;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const APP_NAME: &str = "affinity-cli";

/// Token every installer filename must carry
pub const INSTALLER_NAME_PREFIX: &str = "affinity";

/// Extensions considered by the installer catalog
pub const INSTALLER_SUFFIXES: &[&str] = &["exe", "msi", "msix"];

/// Filename used for the downloaded universal installer
pub const UNIVERSAL_INSTALLER_FILENAME: &str = "Affinity_Universal.exe";

/// Known-good universal installer location
pub const DEFAULT_UNIVERSAL_URL: &str = "https://downloads.affinity.studio/Affinity%20x64.exe";

/// Minimum free space at the cache target (5 GiB)
pub const MIN_FREE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// File holding the last explicitly supplied download URL
pub const PERSISTED_URL_FILENAME: &str = "download_url.txt";

/// Config file names probed in the config directory, first hit wins
pub const CONFIG_FILES: &[&str] = &["config.toml", "config.yaml", "config.yml", "config.json"];

/// affinity-cli configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Cache directory for downloaded payloads
    pub cache_dir: PathBuf,

    /// Directory holding config files and the persisted download URL
    pub config_dir: PathBuf,

    /// Root scanned for installer files
    pub installers_path: PathBuf,

    /// Wine prefix dedicated to Affinity
    pub wine_prefix: PathBuf,

    /// Directory the managed Wine runtime is extracted into
    pub runtime_dir: PathBuf,

    /// Preferred installer version ("latest" or a dotted version)
    pub default_version: String,

    /// Target preparation profile
    pub profile: Profile,

    /// Minimum free bytes required at the cache directory
    pub min_free_bytes: u64,

    /// Download URL supplied by the config file
    pub download_url: Option<String>,

    /// Known-good fallback URL (None disables the strategy)
    pub official_url: Option<String>,

    /// Expected SHA256 of the installer payload
    pub expected_sha256: Option<String>,

    /// Pinned Wine build
    pub runtime: RuntimeRelease,

    /// Pass silent switches to the installer
    pub silent: bool,

    /// Log commands instead of running them
    pub dry_run: bool,

    /// Upper bound for the installer process
    pub install_timeout: Duration,

    /// Verbosity level (0-2)
    pub verbosity: u8,
}

impl Config {
    /// Create a new config with default paths
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| AffinityError::Config("Could not determine home directory".into()))?;

        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| home.join(".cache"))
            .join(APP_NAME);

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join(APP_NAME);

        let runtime_dir = dirs::data_dir()
            .unwrap_or_else(|| home.join(".local").join("share"))
            .join(APP_NAME)
            .join("wine");

        let installers_path = std::env::current_dir()
            .unwrap_or_else(|_| home.clone())
            .join("affinity-installers");

        Ok(Self {
            cache_dir,
            config_dir,
            installers_path,
            wine_prefix: home.join(".wine-affinity"),
            runtime_dir,
            default_version: "latest".to_string(),
            profile: Profile::default(),
            min_free_bytes: MIN_FREE_BYTES,
            download_url: None,
            official_url: Some(DEFAULT_UNIVERSAL_URL.to_string()),
            expected_sha256: None,
            runtime: RuntimeRelease::default(),
            silent: false,
            dry_run: false,
            install_timeout: Duration::from_secs(30 * 60),
            verbosity: 0,
        })
    }

    /// Config with every directory rooted under `root`
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            cache_dir: root.join("cache"),
            config_dir: root.join("config"),
            installers_path: root.join("installers"),
            wine_prefix: root.join("prefix"),
            runtime_dir: root.join("runtime"),
            default_version: "latest".to_string(),
            profile: Profile::default(),
            min_free_bytes: MIN_FREE_BYTES,
            download_url: None,
            official_url: Some(DEFAULT_UNIVERSAL_URL.to_string()),
            expected_sha256: None,
            runtime: RuntimeRelease::default(),
            silent: false,
            dry_run: false,
            install_timeout: Duration::from_secs(30 * 60),
            verbosity: 0,
        }
    }

    /// Path of the persisted last-used download URL
    pub fn persisted_url_file(&self) -> PathBuf {
        self.config_dir.join(PERSISTED_URL_FILENAME)
    }

    /// Default destination of the universal installer
    pub fn universal_installer_path(&self) -> PathBuf {
        self.cache_dir.join(UNIVERSAL_INSTALLER_FILENAME)
    }

    /// Ensure directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(&self.config_dir)?;
        Ok(())
    }

    fn apply(&mut self, file: FileConfig) -> Result<()> {
        if let Some(path) = file.installers_path {
            self.installers_path = expand_home(&path);
        }
        if let Some(path) = file.wine_prefix {
            self.wine_prefix = expand_home(&path);
        }
        if let Some(path) = file.cache_dir {
            self.cache_dir = expand_home(&path);
        }
        if let Some(path) = file.runtime_dir {
            self.runtime_dir = expand_home(&path);
        }
        if let Some(version) = file.default_version {
            self.default_version = validate_version(&version)?;
        }
        if let Some(profile) = file.profile {
            self.profile = profile.parse().map_err(AffinityError::Config)?;
        }
        if let Some(url) = file.download_url {
            self.download_url = non_empty(url);
        }
        if let Some(url) = file.official_url {
            // An empty value disables the known-good fallback
            self.official_url = non_empty(url);
        }
        if let Some(sha) = file.expected_sha256 {
            self.expected_sha256 = non_empty(sha.to_lowercase());
        }
        if let Some(gb) = file.min_free_gb {
            self.min_free_bytes = gb.checked_mul(1 << 30).ok_or_else(|| {
                AffinityError::Config(format!("min_free_gb is too large: {}", gb))
            })?;
        }
        if let Some(minutes) = file.install_timeout_minutes {
            let secs = minutes.checked_mul(60).ok_or_else(|| {
                AffinityError::Config(format!("install_timeout_minutes is too large: {}", minutes))
            })?;
            self.install_timeout = Duration::from_secs(secs);
        }
        if let Some(version) = file.runtime_version.and_then(non_empty) {
            self.runtime.version = version;
        }
        if let Some(url) = file.runtime_url.and_then(non_empty) {
            self.runtime.archive_url = url;
        }
        if let Some(url) = file.runtime_sha256_url.and_then(non_empty) {
            self.runtime.checksums_url = url;
        }
        Ok(())
    }
}

/// Keys accepted in the config file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    installers_path: Option<String>,
    wine_prefix: Option<String>,
    cache_dir: Option<String>,
    runtime_dir: Option<String>,
    default_version: Option<String>,
    profile: Option<String>,
    download_url: Option<String>,
    official_url: Option<String>,
    expected_sha256: Option<String>,
    min_free_gb: Option<u64>,
    install_timeout_minutes: Option<u64>,
    runtime_version: Option<String>,
    runtime_url: Option<String>,
    runtime_sha256_url: Option<String>,
}

/// Loads configuration from the config directory or an explicit file
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(explicit_path: Option<PathBuf>) -> Self {
        Self {
            explicit_path: explicit_path.map(|p| expand_home(&p.to_string_lossy())),
        }
    }

    /// Config file to read, if any
    pub fn locate(&self, config_dir: &Path) -> Result<Option<PathBuf>> {
        if let Some(ref path) = self.explicit_path {
            if !path.exists() {
                return Err(AffinityError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        Ok(CONFIG_FILES
            .iter()
            .map(|name| config_dir.join(name))
            .find(|path| path.exists()))
    }

    /// Load defaults, the config file and `AFFINITY_*` environment overrides
    pub fn load(&self) -> Result<Config> {
        self.load_with_overrides(env_overrides())
    }

    /// Load with explicit key overrides applied on top of the file
    pub fn load_with_overrides(&self, overrides: Vec<(&'static str, Option<String>)>) -> Result<Config> {
        let mut config = Config::new()?;
        self.load_into(&mut config, overrides)?;
        Ok(config)
    }

    /// Merge file and overrides into an existing config
    pub fn load_into(
        &self,
        config: &mut Config,
        overrides: Vec<(&'static str, Option<String>)>,
    ) -> Result<()> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = self.locate(&config.config_dir)? {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(::config::File::from(path.as_path()));
        } else {
            debug!("No configuration file found in {}", config.config_dir.display());
        }

        for (key, value) in overrides {
            builder = builder.set_override_option(key, value)?;
        }

        let file_config: FileConfig = builder.build()?.try_deserialize()?;
        config.apply(file_config)
    }
}

/// Environment hooks recognised by the loader
fn env_overrides() -> Vec<(&'static str, Option<String>)> {
    vec![
        ("installers_path", std::env::var("AFFINITY_INSTALLERS_PATH").ok()),
        ("wine_prefix", std::env::var("AFFINITY_WINE_PREFIX").ok()),
        ("default_version", std::env::var("AFFINITY_DEFAULT_VERSION").ok()),
        ("profile", std::env::var("AFFINITY_WINE_PROFILE").ok()),
    ]
}

/// Accepts "latest" or a dotted numeric version
pub fn validate_version(raw: &str) -> Result<String> {
    let version = raw.trim().to_lowercase();
    let version = version.strip_prefix('v').unwrap_or(&version).to_string();
    let dotted = !version.is_empty()
        && version
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));

    if version == "latest" || dotted {
        Ok(version)
    } else {
        Err(AffinityError::Config(format!(
            "Invalid installer version '{}'. Use 'latest' or a dotted version like 2.6.1",
            raw
        )))
    }
}

/// Expand a leading `~/` against the home directory
pub fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw));
    }
    match (raw.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(raw),
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn load_file(name: &str, content: &str) -> Result<Config> {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();

        let mut config = Config::rooted_at(dir.path());
        ConfigLoader::new(Some(path)).load_into(&mut config, vec![])?;
        Ok(config)
    }

    #[test]
    fn loads_toml() {
        let config = load_file(
            "config.toml",
            "wine_prefix = \"/opt/prefix\"\ndefault_version = \"2.6.1\"\nprofile = \"full\"\n",
        )
        .unwrap();

        assert_eq!(config.wine_prefix, PathBuf::from("/opt/prefix"));
        assert_eq!(config.default_version, "2.6.1");
        assert_eq!(config.profile, Profile::Full);
    }

    #[test]
    fn loads_yaml_and_json() {
        let yaml = load_file("config.yaml", "installers_path: /srv/installers\nmin_free_gb: 2\n").unwrap();
        assert_eq!(yaml.installers_path, PathBuf::from("/srv/installers"));
        assert_eq!(yaml.min_free_bytes, 2 * 1024 * 1024 * 1024);

        let json = load_file("config.json", r#"{"profile": "minimal", "official_url": ""}"#).unwrap();
        assert_eq!(json.profile, Profile::Minimal);
        assert!(json.official_url.is_none());
    }

    #[test]
    fn oversized_thresholds_are_rejected() {
        let err = load_file("config.toml", "min_free_gb = 20000000000\n").unwrap_err();
        assert!(matches!(err, AffinityError::Config(ref msg) if msg.contains("min_free_gb")));

        let err = load_file("config.toml", "install_timeout_minutes = 9223372036854775807\n").unwrap_err();
        assert!(matches!(err, AffinityError::Config(ref msg) if msg.contains("install_timeout_minutes")));

        let config = load_file("config.toml", "min_free_gb = 17179869183\n").unwrap();
        assert_eq!(config.min_free_bytes, 17179869183 * (1 << 30));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = load_file("config.toml", "wine_prefix = \"/x\"\ncolour = \"blue\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn rejects_invalid_version() {
        let err = load_file("config.toml", "default_version = \"newest\"\n");
        assert!(matches!(err, Err(AffinityError::Config(_))));
    }

    #[test]
    fn overrides_win_over_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "profile = \"minimal\"\n").unwrap();

        let mut config = Config::rooted_at(dir.path());
        ConfigLoader::new(Some(path))
            .load_into(&mut config, vec![("profile", Some("full".to_string()))])
            .unwrap();
        assert_eq!(config.profile, Profile::Full);
    }

    #[test]
    fn probes_config_dir_in_order() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("config.yaml"), "profile: full\n").unwrap();

        let found = ConfigLoader::new(None).locate(dir.path()).unwrap();
        assert_eq!(found, Some(dir.path().join("config.yaml")));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::new(Some(dir.path().join("nope.toml")));
        assert!(loader.locate(dir.path()).is_err());
    }

    #[test]
    fn version_validation() {
        assert_eq!(validate_version("LATEST").unwrap(), "latest");
        assert_eq!(validate_version("v2.6.1").unwrap(), "2.6.1");
        assert!(validate_version("2..1").is_err());
    }

    #[test]
    fn runtime_release_can_be_repinned() {
        let config = load_file(
            "config.toml",
            "runtime_version = \"9.22\"\nruntime_url = \"https://mirror.example/wine-9.22-amd64.tar.xz\"\n",
        )
        .unwrap();

        assert_eq!(config.runtime.version, "9.22");
        assert_eq!(config.runtime.archive_name(), "wine-9.22-amd64.tar.xz");
        assert_eq!(config.runtime.checksums_url, RuntimeRelease::default().checksums_url);
    }
}
