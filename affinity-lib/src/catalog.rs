//! Installer discovery
//!
//! Scans directory trees for installer files and classifies them by product and
//! version. Scans are recomputed on every call and never fail: unreadable entries
//! are skipped.

use crate::config::{INSTALLER_NAME_PREFIX, INSTALLER_SUFFIXES};
use crate::error::{AffinityError, Result};
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Label for single-payload installers without an embedded version
pub const UNVERSIONED: &str = "unversioned";

const PRODUCT_ALIASES: &[(&str, &[&str])] = &[
    ("photo", &["photo", "aphoto", "affinityphoto"]),
    ("designer", &["designer", "adesigner", "affinitydesigner"]),
    ("publisher", &["publisher", "apublisher", "affinitypublisher"]),
    ("universal", &["universal"]),
];

const VERSION_PATTERN: &str = r"v?(\d+(?:\.\d+)+)";
const UNIVERSAL_PATTERN: &str = r"(?i)^affinity[_-]?universal[_-]?([0-9]+\.[0-9]+\.[0-9]+)?\.exe$";

/// An installer file found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallerCandidate {
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub version_label: String,
    pub discovery_root: PathBuf,
    /// Product named in the file name, if any
    pub product: Option<String>,
}

impl InstallerCandidate {
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Numeric version components, None when unversioned
    pub fn version(&self) -> Option<Vec<u64>> {
        parse_version(&self.version_label)
    }

    pub fn human_size(&self) -> String {
        let mut size = self.size_bytes as f64;
        for unit in ["B", "KB", "MB"] {
            if size < 1024.0 {
                return if unit == "B" {
                    format!("{} {}", self.size_bytes, unit)
                } else {
                    format!("{:.1} {}", size, unit)
                };
            }
            size /= 1024.0;
        }
        format!("{:.1} GB", size)
    }
}

/// Which version to pick
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VersionCriteria {
    #[default]
    Latest,
    Exact(String),
}

impl VersionCriteria {
    /// "latest" or a dotted version
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("latest") {
            VersionCriteria::Latest
        } else {
            VersionCriteria::Exact(raw.trim_start_matches(['v', 'V']).to_string())
        }
    }
}

/// Selection filters
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    pub version: VersionCriteria,
    pub product: Option<String>,
}

impl Criteria {
    pub fn version(version: VersionCriteria) -> Self {
        Self {
            version,
            product: None,
        }
    }

    fn describe(&self) -> String {
        let version = match &self.version {
            VersionCriteria::Latest => "latest".to_string(),
            VersionCriteria::Exact(v) => v.clone(),
        };
        match &self.product {
            Some(product) => format!("{} {}", product, version),
            None => version,
        }
    }
}

/// Installer scanner
#[derive(Debug, Clone)]
pub struct InstallerCatalog {
    version_re: Regex,
    universal_re: Regex,
}

impl InstallerCatalog {
    pub fn new() -> Result<Self> {
        Ok(Self {
            version_re: Regex::new(VERSION_PATTERN)?,
            universal_re: Regex::new(UNIVERSAL_PATTERN)?,
        })
    }

    /// Recursively scan `roots` for versioned installers, ordered by (file name, path)
    pub fn scan(&self, roots: &[PathBuf]) -> Vec<InstallerCandidate> {
        self.scan_with(roots, false)
    }

    /// Single-payload mode: universal installers only, unversioned ones included
    pub fn scan_universal(&self, roots: &[PathBuf]) -> Vec<InstallerCandidate> {
        self.scan_with(roots, true)
            .into_iter()
            .filter(|c| self.universal_re.is_match(&c.file_name()))
            .collect()
    }

    fn scan_with(&self, roots: &[PathBuf], accept_unversioned: bool) -> Vec<InstallerCandidate> {
        let mut candidates: Vec<InstallerCandidate> = roots
            .iter()
            .filter(|root| root.is_dir())
            .flat_map(|root| {
                WalkDir::new(root)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_type().is_file())
                    .filter_map(move |entry| self.classify(entry.path(), root, accept_unversioned))
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.file_name()
                .to_lowercase()
                .cmp(&b.file_name().to_lowercase())
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        candidates.dedup_by(|a, b| a.file_path == b.file_path);

        debug!("Found {} installer candidates", candidates.len());
        candidates
    }

    fn classify(&self, path: &Path, root: &Path, accept_unversioned: bool) -> Option<InstallerCandidate> {
        let name = path.file_name()?.to_string_lossy().into_owned();
        let extension = path.extension()?.to_string_lossy().to_lowercase();
        if !INSTALLER_SUFFIXES.contains(&extension.as_str()) {
            return None;
        }

        let stem = path.file_stem()?.to_string_lossy().to_lowercase();
        let tokens = tokenize(&stem);
        if !tokens.iter().any(|t| t == INSTALLER_NAME_PREFIX) {
            return None;
        }

        let version_label = match self.version_re.captures(&name).and_then(|c| c.get(1)) {
            Some(version) => version.as_str().to_string(),
            None if accept_unversioned && self.universal_re.is_match(&name) => UNVERSIONED.to_string(),
            None => {
                debug!("Skipping {}: no version in file name", name);
                return None;
            }
        };

        let size_bytes = path.metadata().map(|m| m.len()).unwrap_or(0);
        Some(InstallerCandidate {
            file_path: path.to_path_buf(),
            size_bytes,
            version_label,
            discovery_root: root.to_path_buf(),
            product: product_for(&tokens),
        })
    }

    /// First candidate matching `criteria`; "latest" means the highest version
    pub fn select<'c>(candidates: &'c [InstallerCandidate], criteria: &Criteria) -> Result<&'c InstallerCandidate> {
        let mut matching = candidates.iter().filter(|c| match &criteria.product {
            Some(product) => c.product.as_deref() == Some(product.as_str()),
            None => true,
        });

        let picked = match &criteria.version {
            VersionCriteria::Exact(version) => matching.find(|c| &c.version_label == version),
            // max_by returns the last maximum, keep the first one instead
            VersionCriteria::Latest => matching.fold(None, |best: Option<&InstallerCandidate>, c| match best {
                Some(b) if compare_versions(&c.version_label, &b.version_label) != Ordering::Greater => Some(b),
                _ => Some(c),
            }),
        };

        picked.ok_or_else(|| {
            AffinityError::InstallerNotFound(format!(
                "no installer matching '{}' among {} candidates",
                criteria.describe(),
                candidates.len()
            ))
        })
    }
}

/// Split on non-alphanumeric runs
fn tokenize(stem: &str) -> Vec<String> {
    stem.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn product_for(tokens: &[String]) -> Option<String> {
    PRODUCT_ALIASES
        .iter()
        .find(|(_, aliases)| tokens.iter().any(|t| aliases.contains(&t.as_str())))
        .map(|(product, _)| product.to_string())
}

fn parse_version(label: &str) -> Option<Vec<u64>> {
    label
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect()
}

/// Numeric dotted-version ordering; unversioned sorts lowest
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => {
            let len = a.len().max(b.len());
            let pad = |v: &[u64], i: usize| v.get(i).copied().unwrap_or(0);
            (0..len)
                .map(|i| pad(&a, i).cmp(&pad(&b, i)))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        }
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}
