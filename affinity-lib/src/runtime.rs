//! Wine runtime resolution, invocation environment and managed builds
//!
//! The runtime is looked up in a fixed order: the `AFFINITY_WINE_BIN` and
//! `AFFINITY_CLI_WINE` overrides, a managed build extracted under the runtime directory,
//! then `wine64`/`wine` on `PATH`. [`RuntimeInstaller`] fetches the pinned managed build
//! when none is present.

use crate::archive;
use crate::config::Config;
use crate::download::DownloadManager;
use crate::error::{AffinityError, Result};
use crate::net::HttpClient;
use crate::process::{self, CommandRunner, CommandSpec};
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variables naming a runtime binary, in priority order
pub const OVERRIDE_VARS: &[&str] = &["AFFINITY_WINE_BIN", "AFFINITY_CLI_WINE"];

/// Conventional runtime binary names
pub const BINARY_NAMES: &[&str] = &["wine64", "wine"];

const WINEBOOT_TIMEOUT: Duration = Duration::from_secs(120);
const WINESERVER_TIMEOUT: Duration = Duration::from_secs(60);
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(60);
const KILL_TIMEOUT: Duration = Duration::from_secs(30);

/// A pinned Wine build published as a tarball with a checksum list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeRelease {
    /// Version fragment used to locate the extracted directory (`wine-<version>*`)
    pub version: String,
    pub archive_url: String,
    /// `sha256sums.txt` covering the archive
    pub checksums_url: String,
}

impl Default for RuntimeRelease {
    fn default() -> Self {
        Self {
            version: "10.18-staging".to_string(),
            archive_url: "https://github.com/Kron4ek/Wine-Builds/releases/download/10.18/wine-10.18-staging-amd64-wow64.tar.xz".to_string(),
            checksums_url: "https://github.com/Kron4ek/Wine-Builds/releases/download/10.18/sha256sums.txt".to_string(),
        }
    }
}

impl RuntimeRelease {
    /// File name of the archive, taken from the last URL segment
    pub fn archive_name(&self) -> String {
        self.archive_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("wine.tar.xz")
            .to_string()
    }
}

/// Locate the runtime binary of a managed build under `runtime_dir`
pub fn find_managed_binary(runtime_dir: &Path, release: &RuntimeRelease) -> Option<PathBuf> {
    let pattern = format!(
        "{}/wine-{}*",
        glob::Pattern::escape(&runtime_dir.to_string_lossy()),
        glob::Pattern::escape(&release.version)
    );

    let mut builds: Vec<PathBuf> = glob::glob(&pattern)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_dir())
        .collect();
    builds.sort();

    builds.iter().find_map(|build| {
        BINARY_NAMES
            .iter()
            .map(|name| build.join("bin").join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// Strip a `wine --version` line to the bare number
/// e.g., "wine-10.18 (Staging)" -> "10.18"
pub fn strip_version(version: &str) -> String {
    let trimmed = version.trim();
    let bare = trimmed.strip_prefix("wine-").unwrap_or(trimmed);
    bare.split_whitespace()
        .next()
        .unwrap_or(bare)
        .split("-rc")
        .next()
        .unwrap_or(bare)
        .to_string()
}

/// Parse a `sha256sums.txt` body and return the digest listed for `file_name`
///
/// Lines look like `<hex>  <name>` or `<hex> *<name>`; blank lines and `#` comments are skipped.
pub fn parse_checksum_list(content: &str, file_name: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            let digest = parts.next()?;
            let name = parts.next()?.trim_start_matches('*');
            let name = name.rsplit('/').next().unwrap_or(name);

            let valid = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
            (valid && name == file_name).then(|| digest.to_lowercase())
        })
}

/// A resolved Wine installation
#[derive(Debug, Clone)]
pub struct Runtime {
    /// Path to wine binary
    pub wine_bin: PathBuf,

    /// Path to wineserver binary
    pub wineserver_bin: PathBuf,

    /// Stripped version, when it could be queried
    pub version: Option<String>,
}

impl Runtime {
    /// Resolve the runtime from the process environment and `PATH`
    pub fn locate(config: &Config) -> Result<Self> {
        Self::locate_with(
            config,
            |var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()),
            process::find_in_path,
        )
    }

    /// Resolve with injectable environment and `PATH` lookups
    pub fn locate_with<E, P>(config: &Config, env: E, on_path: P) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
        P: Fn(&str) -> Option<PathBuf>,
    {
        let resolve = |candidate: &str| {
            let path = PathBuf::from(candidate);
            if path.components().count() > 1 {
                path.is_file().then_some(path)
            } else {
                on_path(candidate)
            }
        };

        let from_override = OVERRIDE_VARS.iter().find_map(|var| {
            let value = env(var)?;
            let found = resolve(value.trim());
            if found.is_none() {
                warn!("{}={} does not point at an executable, ignoring", var, value);
            }
            found
        });

        let wine_bin = from_override
            .or_else(|| find_managed_binary(&config.runtime_dir, &config.runtime))
            .or_else(|| BINARY_NAMES.iter().find_map(|name| on_path(name)))
            .ok_or_else(|| {
                AffinityError::environment(
                    "Wine runtime not found.",
                    "Install wine64, run `affinity-cli runtime`, or set AFFINITY_WINE_BIN.",
                )
            })?;

        let sibling = wine_bin.with_file_name("wineserver");
        let wineserver_bin = if sibling.is_file() {
            sibling
        } else {
            on_path("wineserver").ok_or_else(|| {
                AffinityError::environment(
                    format!("wineserver not found next to {}", wine_bin.display()),
                    "Install the complete Wine package, including wineserver.",
                )
            })?
        };

        debug!(
            "Using runtime {} (server {})",
            wine_bin.display(),
            wineserver_bin.display()
        );

        Ok(Self {
            wine_bin,
            wineserver_bin,
            version: None,
        })
    }

    /// Locate the runtime and query its version, best effort
    pub fn detect(config: &Config, runner: &dyn CommandRunner) -> Result<Self> {
        let mut runtime = Self::locate(config)?;
        match runtime.query_version(runner) {
            Ok(version) => {
                info!("Wine version: {}", version);
                runtime.version = Some(version);
            }
            Err(e) => warn!("Could not determine the Wine version: {}", e),
        }
        Ok(runtime)
    }

    /// `wine --version`, stripped of the `wine-` prefix
    pub fn query_version(&self, runner: &dyn CommandRunner) -> Result<String> {
        let spec = CommandSpec::new(&self.wine_bin)
            .arg("--version")
            .timeout(VERSION_TIMEOUT);
        let output = runner.run(&spec)?;

        let version = strip_version(&output.stdout);
        if version.is_empty() {
            if runner.is_dry_run() {
                return Ok("dry-run".to_string());
            }
            return Err(AffinityError::CommandExecution {
                command: spec.display(),
                error: "wine --version returned empty".into(),
            });
        }
        Ok(version)
    }

    /// Directory holding the runtime binaries
    pub fn bin_dir(&self) -> Option<&Path> {
        self.wine_bin.parent()
    }

    /// Environment applied to every runtime invocation
    pub fn environment(&self, prefix: &Path) -> Vec<(String, OsString)> {
        let mut vars = vec![
            ("WINEPREFIX".to_string(), prefix.as_os_str().to_os_string()),
            ("WINEDEBUG".to_string(), OsString::from("-all")),
            ("WINEARCH".to_string(), OsString::from("win64")),
            ("WINE_D3D_CONFIG".to_string(), OsString::from("renderer=vulkan")),
        ];

        if let Some(bin_dir) = self.bin_dir() {
            let inherited = std::env::var_os("PATH").unwrap_or_default();
            let entries = std::iter::once(bin_dir.to_path_buf()).chain(std::env::split_paths(&inherited));
            if let Ok(path) = std::env::join_paths(entries) {
                vars.push(("PATH".to_string(), path));
            }
        }

        vars
    }

    /// `wine <args>` inside `prefix`
    pub fn command(&self, prefix: &Path) -> CommandSpec {
        CommandSpec::new(&self.wine_bin).envs(&self.environment(prefix))
    }

    /// `wineserver <args>` inside `prefix`
    pub fn server_command(&self, prefix: &Path) -> CommandSpec {
        CommandSpec::new(&self.wineserver_bin).envs(&self.environment(prefix))
    }

    /// Initialise `prefix` when it has no `drive_c` yet; returns whether it was created
    pub fn ensure_prefix(&self, prefix: &Path, runner: &dyn CommandRunner) -> Result<bool> {
        if prefix.join("drive_c").is_dir() {
            debug!("Prefix {} already initialised", prefix.display());
            return Ok(false);
        }

        info!("Initialising Wine prefix at {}", prefix.display());
        std::fs::create_dir_all(prefix)?;

        let boot = self
            .command(prefix)
            .args(["wineboot", "--init"])
            .timeout(WINEBOOT_TIMEOUT);
        let output = runner.run(&boot)?;
        if !output.success {
            return Err(AffinityError::environment(
                format!("wineboot --init failed: {}", output.combined().trim()),
                format!(
                    "Remove {} and retry, or check that the Wine runtime starts.",
                    prefix.display()
                ),
            ));
        }

        self.wait_for_server(prefix, runner)?;
        Ok(true)
    }

    /// `wineboot --update` on an existing prefix; a failure is only logged
    pub fn update_prefix(&self, prefix: &Path, runner: &dyn CommandRunner) -> Result<bool> {
        let spec = self
            .command(prefix)
            .args(["wineboot", "--update"])
            .timeout(UPDATE_TIMEOUT);
        let output = runner.run(&spec)?;
        if !output.success {
            warn!("wineboot --update completed with warnings: {}", output.combined().trim());
        }
        Ok(output.success)
    }

    /// Terminate every process still running in `prefix`
    pub fn kill_server(&self, prefix: &Path, runner: &dyn CommandRunner) {
        let spec = self
            .server_command(prefix)
            .arg("-k")
            .timeout(KILL_TIMEOUT);
        match runner.run(&spec) {
            Ok(output) if output.success => debug!("wineserver stopped for {}", prefix.display()),
            Ok(output) => debug!("wineserver -k exited with {:?}", output.code),
            Err(e) => warn!("Could not stop wineserver: {}", e),
        }
    }

    /// Block until every process in the prefix has exited
    pub fn wait_for_server(&self, prefix: &Path, runner: &dyn CommandRunner) -> Result<()> {
        let spec = self
            .server_command(prefix)
            .arg("-w")
            .timeout(WINESERVER_TIMEOUT);
        let output = runner.run(&spec)?;
        if !output.success {
            warn!("wineserver -w exited with {:?}", output.code);
        }
        Ok(())
    }
}

/// Downloads and unpacks the pinned managed Wine build
pub struct RuntimeInstaller<'a> {
    config: &'a Config,
    client: HttpClient,
    downloader: DownloadManager,
}

impl<'a> RuntimeInstaller<'a> {
    pub fn new(config: &'a Config, client: HttpClient, progress: bool) -> Self {
        Self {
            config,
            downloader: DownloadManager::new(client.clone(), progress),
            client,
        }
    }

    /// Make sure a managed build exists; returns its runtime binary
    pub async fn ensure(&self) -> Result<PathBuf> {
        let release = &self.config.runtime;
        if let Some(existing) = find_managed_binary(&self.config.runtime_dir, release) {
            info!("Managed Wine already present at {}", existing.display());
            return Ok(existing);
        }

        let archive_name = release.archive_name();
        info!("Fetching checksums from {}", release.checksums_url);
        let (_, listing) = self.client.get_text(&release.checksums_url).await?;
        let expected = parse_checksum_list(&listing, &archive_name).ok_or_else(|| {
            AffinityError::acquisition(
                format!("No checksum published for {}", archive_name),
                "Check runtime_sha256_url in the configuration.",
            )
        })?;

        let archive_path = self.config.cache_dir.join(&archive_name);
        self.downloader
            .download(&release.archive_url, &archive_path, Some(&expected))
            .await?;

        match archive::extract(&archive_path, &self.config.runtime_dir) {
            Ok(summary) => debug!("Extracted {} entries", summary.files),
            Err(e) if e.is_integrity() => {
                warn!("Removing rejected archive {}", archive_path.display());
                std::fs::remove_file(&archive_path)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let binary = find_managed_binary(&self.config.runtime_dir, release).ok_or_else(|| {
            AffinityError::Archive(format!(
                "{} does not contain a wine-{}*/bin/wine binary",
                archive_name, release.version
            ))
        })?;

        if let Some(bin_dir) = binary.parent() {
            for name in BINARY_NAMES.iter().chain(&["wineserver"]) {
                let path = bin_dir.join(name);
                if path.is_file() {
                    make_executable(&path)?;
                }
            }
        }

        info!("Managed Wine installed at {}", binary.display());
        Ok(binary)
    }
}

fn make_executable(path: &Path) -> Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::test_client;
    use crate::process::testing::RecordingRunner;
    use crate::process::CommandOutput;
    use httpmock::prelude::*;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"#!/bin/sh\n").unwrap();
    }

    fn runtime_at(dir: &Path) -> Runtime {
        Runtime {
            wine_bin: dir.join("bin/wine"),
            wineserver_bin: dir.join("bin/wineserver"),
            version: None,
        }
    }

    #[test]
    fn strips_versions() {
        assert_eq!(strip_version("wine-10.18 (Staging)\n"), "10.18");
        assert_eq!(strip_version("wine-9.0-rc3"), "9.0");
        assert_eq!(strip_version("8.0"), "8.0");
    }

    #[test]
    fn parses_checksum_lists() {
        let digest = "a".repeat(64);
        let listing = format!(
            "# Kron4ek builds\n\n{} *wine-10.18-staging-amd64-wow64.tar.xz\n{}  other.tar.xz\nnot-a-digest wine.tar.xz\n",
            digest,
            "b".repeat(64)
        );

        assert_eq!(
            parse_checksum_list(&listing, "wine-10.18-staging-amd64-wow64.tar.xz"),
            Some(digest)
        );
        assert_eq!(parse_checksum_list(&listing, "wine.tar.xz"), None);
        assert_eq!(parse_checksum_list(&listing, "missing.tar.xz"), None);
    }

    #[test]
    fn archive_name_is_last_url_segment() {
        assert_eq!(
            RuntimeRelease::default().archive_name(),
            "wine-10.18-staging-amd64-wow64.tar.xz"
        );
    }

    #[test]
    fn finds_managed_build() {
        let dir = tempdir().unwrap();
        let release = RuntimeRelease::default();
        assert!(find_managed_binary(dir.path(), &release).is_none());

        let wine = dir.path().join("wine-10.18-staging-amd64-wow64/bin/wine");
        touch(&wine);
        assert_eq!(find_managed_binary(dir.path(), &release), Some(wine));

        // another release is not picked up
        let other = RuntimeRelease {
            version: "9.0".into(),
            ..RuntimeRelease::default()
        };
        assert!(find_managed_binary(dir.path(), &other).is_none());
    }

    #[test]
    fn override_beats_managed_and_path() {
        let dir = tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let custom = dir.path().join("custom/bin/wine");
        touch(&custom);
        touch(&dir.path().join("custom/bin/wineserver"));
        touch(&config.runtime_dir.join("wine-10.18-staging-amd64-wow64/bin/wine"));

        let runtime = Runtime::locate_with(
            &config,
            |var| (var == "AFFINITY_CLI_WINE").then(|| custom.to_string_lossy().into_owned()),
            |_| Some(PathBuf::from("/usr/bin/wine")),
        )
        .unwrap();

        assert_eq!(runtime.wine_bin, custom);
        assert_eq!(runtime.wineserver_bin, dir.path().join("custom/bin/wineserver"));
    }

    #[test]
    fn falls_back_to_path_lookup() {
        let dir = tempdir().unwrap();
        let config = Config::rooted_at(dir.path());

        let runtime = Runtime::locate_with(
            &config,
            |_| Some("/does/not/exist/wine".to_string()),
            |name| match name {
                "wine" => Some(PathBuf::from("/usr/bin/wine")),
                "wineserver" => Some(PathBuf::from("/usr/bin/wineserver")),
                _ => None,
            },
        )
        .unwrap();

        assert_eq!(runtime.wine_bin, PathBuf::from("/usr/bin/wine"));
        assert_eq!(runtime.wineserver_bin, PathBuf::from("/usr/bin/wineserver"));
    }

    #[test]
    fn missing_runtime_is_an_environment_error() {
        let dir = tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let err = Runtime::locate_with(&config, |_| None, |_| None).unwrap_err();
        assert!(matches!(err, AffinityError::Environment { .. }));
        assert!(err.hint().is_some());
    }

    #[test]
    fn environment_is_controlled() {
        let runtime = runtime_at(Path::new("/opt/wine"));
        let env = runtime.environment(Path::new("/home/me/.wine-affinity"));
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.to_string_lossy().into_owned())
        };

        assert_eq!(get("WINEPREFIX").as_deref(), Some("/home/me/.wine-affinity"));
        assert_eq!(get("WINEDEBUG").as_deref(), Some("-all"));
        assert_eq!(get("WINEARCH").as_deref(), Some("win64"));
        assert_eq!(get("WINE_D3D_CONFIG").as_deref(), Some("renderer=vulkan"));
        assert!(get("PATH").unwrap().starts_with("/opt/wine/bin"));
    }

    #[test]
    fn ensure_prefix_boots_once() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let runtime = runtime_at(Path::new("/opt/wine"));
        let runner = RecordingRunner::new();

        assert!(runtime.ensure_prefix(&prefix, &runner).unwrap());
        assert_eq!(
            runner.rendered(),
            vec!["/opt/wine/bin/wine wineboot --init", "/opt/wine/bin/wineserver -w"]
        );
        assert_eq!(runner.calls()[0].timeout, WINEBOOT_TIMEOUT);

        std::fs::create_dir_all(prefix.join("drive_c")).unwrap();
        assert!(!runtime.ensure_prefix(&prefix, &runner).unwrap());
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn failed_wineboot_is_reported() {
        let dir = tempdir().unwrap();
        let runtime = runtime_at(Path::new("/opt/wine"));
        let runner = RecordingRunner::with_handler(|_| Ok(CommandOutput::failed(1, "could not load kernel32")));

        let err = runtime.ensure_prefix(&dir.path().join("prefix"), &runner).unwrap_err();
        assert!(err.to_string().contains("kernel32"));
    }

    #[test]
    fn update_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        let runtime = runtime_at(Path::new("/opt/wine"));
        let runner = RecordingRunner::with_handler(|_| Ok(CommandOutput::failed(1, "fixme:ntdll")));

        assert!(!runtime.update_prefix(dir.path(), &runner).unwrap());
        runtime.kill_server(dir.path(), &runner);

        assert_eq!(
            runner.rendered(),
            vec![
                "/opt/wine/bin/wine wineboot --update".to_string(),
                "/opt/wine/bin/wineserver -k".to_string(),
            ]
        );
        assert_eq!(runner.calls()[0].timeout, UPDATE_TIMEOUT);
    }

    #[test]
    fn queries_version() {
        let runtime = runtime_at(Path::new("/opt/wine"));
        let runner = RecordingRunner::with_handler(|_| Ok(CommandOutput::ok("wine-10.18 (Staging)\n")));
        assert_eq!(runtime.query_version(&runner).unwrap(), "10.18");
        assert_eq!(runner.calls()[0].timeout, VERSION_TIMEOUT);
    }

    fn wine_tarball() -> Vec<u8> {
        let encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in [
            ("wine-10.18-test/bin/wine", &b"#!/bin/sh\n"[..]),
            ("wine-10.18-test/bin/wineserver", &b"#!/bin/sh\n"[..]),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn hostile_tarball() -> Vec<u8> {
        let encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        let mut builder = tar::Builder::new(encoder);
        let data = b"#!/bin/sh\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "wine-10.18-test/bin/wine", &data[..])
            .unwrap();

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder
            .append_link(&mut link, "wine-10.18-test/bin/evil", "/etc/passwd")
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[tokio::test]
    async fn rejected_archive_is_removed_from_cache() {
        let tarball = hostile_tarball();
        let digest = format!("{:x}", Sha256::digest(&tarball));
        let server = MockServer::start();
        let archive = server.mock(|when, then| {
            when.method(GET).path("/wine-10.18-test.tar.xz");
            then.status(200).body(&tarball);
        });
        server.mock(|when, then| {
            when.method(GET).path("/sha256sums.txt");
            then.status(200)
                .body(format!("{}  wine-10.18-test.tar.xz\n", digest));
        });

        let dir = tempdir().unwrap();
        let mut config = Config::rooted_at(dir.path());
        config.runtime = RuntimeRelease {
            version: "10.18-test".into(),
            archive_url: server.url("/wine-10.18-test.tar.xz"),
            checksums_url: server.url("/sha256sums.txt"),
        };

        let installer = RuntimeInstaller::new(&config, test_client(), false);
        let err = installer.ensure().await.unwrap_err();
        assert!(err.is_integrity(), "{err}");
        assert!(!config.cache_dir.join("wine-10.18-test.tar.xz").exists());
        assert!(find_managed_binary(&config.runtime_dir, &config.runtime).is_none());

        // the next attempt fetches again instead of reusing the rejected copy
        installer.ensure().await.unwrap_err();
        archive.assert_hits(2);
    }

    #[tokio::test]
    async fn installs_managed_build() {
        let tarball = wine_tarball();
        let digest = format!("{:x}", Sha256::digest(&tarball));
        let server = MockServer::start();
        let archive = server.mock(|when, then| {
            when.method(GET).path("/wine-10.18-test.tar.xz");
            then.status(200).body(&tarball);
        });
        server.mock(|when, then| {
            when.method(GET).path("/sha256sums.txt");
            then.status(200)
                .body(format!("{}  wine-10.18-test.tar.xz\n", digest));
        });

        let dir = tempdir().unwrap();
        let mut config = Config::rooted_at(dir.path());
        config.runtime = RuntimeRelease {
            version: "10.18-test".into(),
            archive_url: server.url("/wine-10.18-test.tar.xz"),
            checksums_url: server.url("/sha256sums.txt"),
        };

        let installer = RuntimeInstaller::new(&config, test_client(), false);
        let binary = installer.ensure().await.unwrap();

        assert_eq!(binary, config.runtime_dir.join("wine-10.18-test/bin/wine"));
        assert!(process::is_executable(&binary));
        assert!(process::is_executable(&binary.with_file_name("wineserver")));

        // second call finds the extracted build without touching the network
        installer.ensure().await.unwrap();
        archive.assert_hits(1);
    }

    #[tokio::test]
    async fn unlisted_archive_is_refused() {
        let server = MockServer::start();
        let archive = server.mock(|when, then| {
            when.method(GET).path("/wine-10.18-test.tar.xz");
            then.status(200).body("never fetched");
        });
        server.mock(|when, then| {
            when.method(GET).path("/sha256sums.txt");
            then.status(200).body(format!("{}  something-else.tar.xz\n", "c".repeat(64)));
        });

        let dir = tempdir().unwrap();
        let mut config = Config::rooted_at(dir.path());
        config.runtime = RuntimeRelease {
            version: "10.18-test".into(),
            archive_url: server.url("/wine-10.18-test.tar.xz"),
            checksums_url: server.url("/sha256sums.txt"),
        };

        let err = RuntimeInstaller::new(&config, test_client(), false)
            .ensure()
            .await
            .unwrap_err();
        assert!(matches!(err, AffinityError::Acquisition { .. }));
        archive.assert_hits(0);
    }
}
