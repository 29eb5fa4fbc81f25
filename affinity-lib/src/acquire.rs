//! Installer payload acquisition
//!
//! The download URL is resolved through prioritized strategies, first hit wins:
//! an explicit URL, the configured URL, the URL persisted by an earlier run, the
//! known-good default, a scrape of the vendor update page, and finally a scrape
//! after logging in to the vendor store.

use crate::config::Config;
use crate::download::DownloadManager;
use crate::error::{AffinityError, Result};
use crate::net::HttpClient;
use regex::Regex;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const UNIVERSAL_UPDATE_URL: &str = "https://store.serif.com/update/windows/universal/";

const DOWNLOAD_LINK_PATTERN: &str = r#"(?i)https?://[^\s"'>]*Affinity[_-]?Universal[^\s"'>]*\.exe"#;
const CSRF_PATTERN: &str = r#"name=["']csrfmiddlewaretoken["'] value=["']([^"']+)"#;

/// Vendor store endpoints used by the scrape and login strategies
#[derive(Debug, Clone)]
pub struct StoreEndpoints {
    pub update_page: String,
    pub api_logins: Vec<String>,
    pub sign_in: String,
}

impl Default for StoreEndpoints {
    fn default() -> Self {
        Self {
            update_page: UNIVERSAL_UPDATE_URL.to_string(),
            api_logins: vec![
                "https://store.serif.com/api/v1/auth/login/".to_string(),
                "https://store.serif.com/api/auth/login/".to_string(),
            ],
            sign_in: "https://store.serif.com/en-US/account/sign-in/".to_string(),
        }
    }
}

/// Where a download URL came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlSource {
    Provided,
    Configured,
    Persisted,
    Official,
    Public,
    Authenticated,
}

impl UrlSource {
    const ORDER: [UrlSource; 6] = [
        UrlSource::Provided,
        UrlSource::Configured,
        UrlSource::Persisted,
        UrlSource::Official,
        UrlSource::Public,
        UrlSource::Authenticated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UrlSource::Provided => "provided",
            UrlSource::Configured => "config",
            UrlSource::Persisted => "persisted",
            UrlSource::Official => "official",
            UrlSource::Public => "public",
            UrlSource::Authenticated => "authenticated",
        }
    }

    /// Sources the operator did not choose; a transport failure moves on to the next one
    fn falls_through(&self) -> bool {
        matches!(
            self,
            UrlSource::Persisted | UrlSource::Official | UrlSource::Public
        )
    }
}

/// Supplies store credentials for the login strategy
pub trait CredentialSource {
    fn credentials(&self) -> Result<(String, String)>;
}

/// `AFFINITY_CLI_EMAIL`/`AFFINITY_CLI_PASSWORD`, else an interactive prompt
#[derive(Debug, Default)]
pub struct EnvOrPrompt;

impl CredentialSource for EnvOrPrompt {
    fn credentials(&self) -> Result<(String, String)> {
        let email = std::env::var("AFFINITY_CLI_EMAIL").unwrap_or_default();
        let password = std::env::var("AFFINITY_CLI_PASSWORD").unwrap_or_default();
        if !email.is_empty() && !password.is_empty() {
            return Ok((email, password));
        }

        if !std::io::stdin().is_terminal() {
            return Err(AffinityError::acquisition(
                "Login required but stdin is non-interactive.",
                "Set AFFINITY_CLI_EMAIL and AFFINITY_CLI_PASSWORD or pass --download-url.",
            ));
        }

        warn!("Public download failed. Store login is experimental and only used as a last resort.");
        print!("Serif/Affinity account email: ");
        std::io::stdout().flush()?;
        let mut email = String::new();
        std::io::stdin().lock().read_line(&mut email)?;
        let password = rpassword::prompt_password("Password: ")?;

        let (email, password) = (email.trim().to_string(), password.trim().to_string());
        if email.is_empty() || password.is_empty() {
            return Err(AffinityError::acquisition(
                "Email and password are required for authenticated download.",
                "Set AFFINITY_CLI_EMAIL and AFFINITY_CLI_PASSWORD or pass --download-url.",
            ));
        }
        Ok((email, password))
    }
}

/// Resolves and downloads the installer payload
pub struct PayloadAcquirer<'a> {
    config: &'a Config,
    client: HttpClient,
    downloader: DownloadManager,
    endpoints: StoreEndpoints,
    credentials: Box<dyn CredentialSource + Send + Sync + 'a>,
}

impl<'a> PayloadAcquirer<'a> {
    pub fn new(config: &'a Config, client: HttpClient, progress: bool) -> Self {
        Self {
            config,
            downloader: DownloadManager::new(client.clone(), progress),
            client,
            endpoints: StoreEndpoints::default(),
            credentials: Box::new(EnvOrPrompt),
        }
    }

    pub fn with_endpoints(mut self, endpoints: StoreEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_credentials(mut self, credentials: impl CredentialSource + Send + Sync + 'a) -> Self {
        self.credentials = Box::new(credentials);
        self
    }

    /// Make sure the installer payload exists at `destination`, downloading it if needed
    pub async fn ensure(
        &self,
        destination: Option<&Path>,
        explicit_url: Option<&str>,
        configured_url: Option<&str>,
        expected_sha256: Option<&str>,
    ) -> Result<PathBuf> {
        let dest = destination
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.universal_installer_path());

        if dest.metadata().map(|m| m.len() > 0).unwrap_or(false) {
            match expected_sha256 {
                None => {
                    info!("Using cached installer at {}", dest.display());
                    return Ok(dest);
                }
                Some(expected) => {
                    if crate::download::verify_checksum(&dest, expected)? {
                        info!("Using cached installer at {} (checksum OK)", dest.display());
                        return Ok(dest);
                    }
                    warn!("Cached installer failed checksum, re-downloading");
                    std::fs::remove_file(&dest)?;
                }
            }
        }

        for source in UrlSource::ORDER {
            let Some(url) = self.resolve(source, explicit_url, configured_url).await? else {
                continue;
            };

            info!("Downloading Affinity installer ({}): {}", source.as_str(), url);
            match self.downloader.download(&url, &dest, expected_sha256).await {
                Ok(path) => {
                    if source == UrlSource::Provided {
                        self.persist_url(&url);
                    }
                    return Ok(path);
                }
                Err(e) if !e.is_integrity() && source.falls_through() => {
                    warn!("Download from {} source failed: {}", source.as_str(), e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(AffinityError::acquisition(
            "Unable to locate the Affinity Universal download URL.",
            "Provide --download-url or check connectivity.",
        ))
    }

    async fn resolve(
        &self,
        source: UrlSource,
        explicit_url: Option<&str>,
        configured_url: Option<&str>,
    ) -> Result<Option<String>> {
        let url = match source {
            UrlSource::Provided => explicit_url.map(str::to_string),
            UrlSource::Configured => configured_url.map(str::to_string),
            UrlSource::Persisted => self.persisted_url(),
            UrlSource::Official => self.config.official_url.clone(),
            UrlSource::Public => self.scrape().await?,
            UrlSource::Authenticated => self.authenticated().await?,
        };
        Ok(url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()))
    }

    fn persisted_url(&self) -> Option<String> {
        let path = self.config.persisted_url_file();
        match std::fs::read_to_string(&path) {
            Ok(saved) => Some(saved),
            Err(e) => {
                debug!("No persisted URL at {}: {}", path.display(), e);
                None
            }
        }
    }

    fn persist_url(&self, url: &str) {
        let path = self.config.persisted_url_file();
        let written = path
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| std::fs::write(&path, url.trim()));
        match written {
            Ok(()) => info!("Stored download URL for future installs: {}", url),
            Err(e) => debug!("Could not persist download URL: {}", e),
        }
    }

    /// Follow the update page; a redirect to an .exe or a matching link in the body wins
    async fn scrape(&self) -> Result<Option<String>> {
        let (final_url, body) = match self.client.get_text(&self.endpoints.update_page).await {
            Ok(page) => page,
            Err(e) => {
                debug!("Public probe failed: {}", e);
                return Ok(None);
            }
        };

        if final_url.to_lowercase().ends_with(".exe") {
            return Ok(Some(final_url));
        }
        extract_download_link(&body)
    }

    async fn authenticated(&self) -> Result<Option<String>> {
        let (email, password) = self.credentials.credentials()?;

        if !self.login(&email, &password).await? {
            return Err(AffinityError::acquisition(
                "Authentication failed with the Serif store.",
                "Check credentials or provide --download-url.",
            ));
        }
        self.scrape().await
    }

    async fn login(&self, email: &str, password: &str) -> Result<bool> {
        let body = serde_json::json!({ "email": email, "password": password });

        for endpoint in &self.endpoints.api_logins {
            match self.client.post_json(endpoint, &body).await {
                Ok(resp) if matches!(resp.status().as_u16(), 200 | 201 | 204) => {
                    info!("Authenticated via {}", endpoint);
                    return Ok(true);
                }
                Ok(resp) => debug!("API login against {} returned {}", endpoint, resp.status()),
                Err(e) => debug!("API login failed against {}: {}", endpoint, e),
            }
        }

        let (sign_in_url, page) = match self.client.get_text(&self.endpoints.sign_in).await {
            Ok(page) => page,
            Err(e) => {
                debug!("Form login failed: {}", e);
                return Ok(false);
            }
        };
        let Some(token) = extract_csrf(&page)? else {
            debug!("No CSRF token on the sign-in page");
            return Ok(false);
        };

        let form = [
            ("email", email),
            ("username", email),
            ("password", password),
            ("csrfmiddlewaretoken", token.as_str()),
        ];
        match self.client.post_form(&sign_in_url, &form, Some(&sign_in_url)).await {
            Ok(resp) if matches!(resp.status().as_u16(), 200 | 302) => {
                info!("Authenticated via form login");
                Ok(true)
            }
            Ok(resp) => {
                debug!("Form login returned {}", resp.status());
                Ok(false)
            }
            Err(e) => {
                debug!("Form login failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// First universal installer link in an HTML page
pub fn extract_download_link(html: &str) -> Result<Option<String>> {
    let re = Regex::new(DOWNLOAD_LINK_PATTERN)?;
    Ok(re.find(html).map(|m| m.as_str().to_string()))
}

fn extract_csrf(html: &str) -> Result<Option<String>> {
    let re = Regex::new(CSRF_PATTERN)?;
    Ok(re
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::test_client;
    use httpmock::prelude::*;
    use tempfile::tempdir;

    struct StaticCredentials(Option<(&'static str, &'static str)>);

    impl CredentialSource for StaticCredentials {
        fn credentials(&self) -> Result<(String, String)> {
            self.0
                .map(|(e, p)| (e.to_string(), p.to_string()))
                .ok_or_else(|| AffinityError::acquisition("no credentials", "set them"))
        }
    }

    fn endpoints(server: &MockServer) -> StoreEndpoints {
        StoreEndpoints {
            update_page: server.url("/update/windows/universal/"),
            api_logins: vec![server.url("/api/v1/auth/login/"), server.url("/api/auth/login/")],
            sign_in: server.url("/account/sign-in/"),
        }
    }

    fn config(root: &Path, official: Option<String>) -> Config {
        let mut config = Config::rooted_at(root);
        config.official_url = official;
        config
    }

    fn acquirer<'a>(config: &'a Config, server: &MockServer) -> PayloadAcquirer<'a> {
        PayloadAcquirer::new(config, test_client(), false)
            .with_endpoints(endpoints(server))
            .with_credentials(StaticCredentials(None))
    }

    #[tokio::test]
    async fn explicit_url_wins_and_is_persisted() {
        let server = MockServer::start();
        let explicit = server.mock(|when, then| {
            when.method(GET).path("/explicit.exe");
            then.status(200).body("explicit payload");
        });
        let official = server.mock(|when, then| {
            when.method(GET).path("/official.exe");
            then.status(200).body("official payload");
        });

        let dir = tempdir().unwrap();
        let config = config(dir.path(), Some(server.url("/official.exe")));
        let url = server.url("/explicit.exe");

        let path = acquirer(&config, &server)
            .ensure(None, Some(&url), Some("https://unused.invalid/x.exe"), None)
            .await
            .unwrap();

        explicit.assert();
        official.assert_hits(0);
        assert_eq!(path, config.universal_installer_path());
        assert_eq!(std::fs::read_to_string(config.persisted_url_file()).unwrap(), url);
    }

    #[tokio::test]
    async fn configured_url_is_not_persisted() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/configured.exe");
            then.status(200).body("configured payload");
        });

        let dir = tempdir().unwrap();
        let config = config(dir.path(), None);
        let url = server.url("/configured.exe");

        acquirer(&config, &server)
            .ensure(None, None, Some(&url), None)
            .await
            .unwrap();
        assert!(!config.persisted_url_file().exists());
    }

    #[tokio::test]
    async fn persisted_url_beats_official_default() {
        let server = MockServer::start();
        let saved = server.mock(|when, then| {
            when.method(GET).path("/saved.exe");
            then.status(200).body("saved payload");
        });

        let dir = tempdir().unwrap();
        let config = config(dir.path(), Some(server.url("/official.exe")));
        std::fs::create_dir_all(&config.config_dir).unwrap();
        std::fs::write(config.persisted_url_file(), format!("{}\n", server.url("/saved.exe"))).unwrap();

        acquirer(&config, &server).ensure(None, None, None, None).await.unwrap();
        saved.assert();
    }

    #[tokio::test]
    async fn failed_default_falls_through_to_scrape() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/official.exe");
            then.status(404);
        });
        let page = format!(
            "<a href=\"{}\">Download</a>",
            server.url("/files/Affinity_Universal_2.6.1.exe")
        );
        server.mock(|when, then| {
            when.method(GET).path("/update/windows/universal/");
            then.status(200).body(&page);
        });
        let payload = server.mock(|when, then| {
            when.method(GET).path("/files/Affinity_Universal_2.6.1.exe");
            then.status(200).body("scraped payload");
        });

        let dir = tempdir().unwrap();
        let config = config(dir.path(), Some(server.url("/official.exe")));

        let path = acquirer(&config, &server).ensure(None, None, None, None).await.unwrap();
        payload.assert();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "scraped payload");
    }

    #[tokio::test]
    async fn update_page_redirect_to_exe_is_used() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/update/windows/universal/");
            then.status(302).header("location", "/dl/Affinity_x64.exe");
        });
        let payload = server.mock(|when, then| {
            when.method(GET).path("/dl/Affinity_x64.exe");
            then.status(200).body("redirected payload");
        });

        let dir = tempdir().unwrap();
        let config = config(dir.path(), None);

        acquirer(&config, &server).ensure(None, None, None, None).await.unwrap();
        // once while probing the page, once for the download
        payload.assert_hits(2);
    }

    #[tokio::test]
    async fn login_is_attempted_before_giving_up() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/update/windows/universal/");
            then.status(200).body("<html>sign in to download</html>");
        });
        let first_api = server.mock(|when, then| {
            when.method(POST).path("/api/v1/auth/login/");
            then.status(401);
        });
        let second_api = server.mock(|when, then| {
            when.method(POST)
                .path("/api/auth/login/")
                .json_body(serde_json::json!({"email": "me@example.com", "password": "hunter2"}));
            then.status(200);
        });

        let dir = tempdir().unwrap();
        let config = config(dir.path(), None);

        let err = acquirer(&config, &server)
            .with_credentials(StaticCredentials(Some(("me@example.com", "hunter2"))))
            .ensure(None, None, None, None)
            .await
            .unwrap_err();

        first_api.assert();
        second_api.assert();
        assert!(matches!(err, AffinityError::Acquisition { .. }));
        assert!(err.hint().unwrap().contains("--download-url"));
    }

    #[tokio::test]
    async fn form_login_uses_csrf_token() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/update/windows/universal/");
            then.status(200).body("nothing here");
        });
        server.mock(|when, then| {
            when.method(POST).path_includes("/auth/login/");
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(GET).path("/account/sign-in/");
            then.status(200)
                .body(r#"<input type="hidden" name="csrfmiddlewaretoken" value="tok123">"#);
        });
        let form = server.mock(|when, then| {
            when.method(POST)
                .path("/account/sign-in/")
                .form_urlencoded_tuple("csrfmiddlewaretoken", "tok123")
                .form_urlencoded_tuple("username", "me@example.com");
            then.status(200);
        });

        let dir = tempdir().unwrap();
        let config = config(dir.path(), None);

        let result = acquirer(&config, &server)
            .with_credentials(StaticCredentials(Some(("me@example.com", "pw"))))
            .ensure(None, None, None, None)
            .await;

        form.assert();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_credentials_are_terminal() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/update/windows/universal/");
            then.status(500);
        });

        let dir = tempdir().unwrap();
        let config = config(dir.path(), None);

        let err = acquirer(&config, &server)
            .ensure(None, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AffinityError::Acquisition { .. }));
    }

    #[tokio::test]
    async fn integrity_failure_does_not_fall_through() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/official.exe");
            then.status(200).body("tampered");
        });
        let page = server.mock(|when, then| {
            when.method(GET).path("/update/windows/universal/");
            then.status(200).body("");
        });

        let dir = tempdir().unwrap();
        let config = config(dir.path(), Some(server.url("/official.exe")));

        let err = acquirer(&config, &server)
            .ensure(None, None, None, Some(&"a".repeat(64)))
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        page.assert_hits(0);
    }

    #[tokio::test]
    async fn cached_payload_needs_no_network() {
        let server = MockServer::start();
        let dir = tempdir().unwrap();
        let config = config(dir.path(), Some(server.url("/official.exe")));
        let dest = dir.path().join("Affinity_Universal.exe");
        std::fs::write(&dest, b"cached").unwrap();

        let path = acquirer(&config, &server)
            .ensure(Some(&dest), None, None, None)
            .await
            .unwrap();
        assert_eq!(path, dest);
    }

    #[tokio::test]
    async fn empty_cached_payload_is_downloaded_again() {
        let server = MockServer::start();
        let official = server.mock(|when, then| {
            when.method(GET).path("/official.exe");
            then.status(200).body("payload");
        });
        let dir = tempdir().unwrap();
        let config = config(dir.path(), Some(server.url("/official.exe")));
        std::fs::create_dir_all(&config.cache_dir).unwrap();
        std::fs::write(config.universal_installer_path(), b"").unwrap();

        let path = acquirer(&config, &server)
            .ensure(None, None, None, None)
            .await
            .unwrap();
        official.assert_hits(1);
        assert_eq!(std::fs::read(path).unwrap(), b"payload");
    }

    #[test]
    fn extracts_links_case_insensitively() {
        let html = r#"<a href='https://cdn.example.com/affinity-universal-2.6.1.exe'>x</a>"#;
        assert_eq!(
            extract_download_link(html).unwrap().as_deref(),
            Some("https://cdn.example.com/affinity-universal-2.6.1.exe")
        );
        assert_eq!(extract_download_link("no links").unwrap(), None);
    }
}
