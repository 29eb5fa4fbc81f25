//! Resumable downloads with checksum verification
//!
//! Bytes land in `<dest>.part` and are renamed into place only after the stream
//! completed and the digest matched, so an existing `dest` is always a complete file.
//! The SHA256 is computed while streaming; a resumed download seeds the hasher with the
//! bytes already on disk.

use crate::error::{AffinityError, Result};
use crate::net::HttpClient;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Download manager
pub struct DownloadManager {
    client: HttpClient,
    progress: bool,
}

impl DownloadManager {
    pub fn new(client: HttpClient, progress: bool) -> Self {
        Self { client, progress }
    }

    /// Download `url` to `dest`, reusing a cached copy when it verifies
    pub async fn download(&self, url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<PathBuf> {
        let expected = expected_sha256.map(|s| s.trim().to_lowercase());

        let cached_len = std::fs::metadata(dest).map(|m| m.len()).ok();
        if cached_len == Some(0) {
            debug!("Discarding empty {}", dest.display());
            std::fs::remove_file(dest)?;
        } else if cached_len.is_some() {
            match expected.as_deref() {
                None => {
                    info!("Using cached {}", dest.display());
                    return Ok(dest.to_path_buf());
                }
                Some(expected) => {
                    if verify_checksum(dest, expected)? {
                        info!("Cached {} verified, skipping download", dest.display());
                        return Ok(dest.to_path_buf());
                    }
                    warn!("Cached {} does not match the expected checksum, re-downloading", dest.display());
                    std::fs::remove_file(dest)?;
                }
            }
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let part = part_path(dest);
        let computed = self.fetch(url, &part).await?;

        if let Some(expected) = expected {
            if computed != expected {
                std::fs::remove_file(&part)?;
                return Err(AffinityError::ChecksumMismatch {
                    expected,
                    got: computed,
                });
            }
            debug!("Checksum verified: {}", computed);
        }

        std::fs::rename(&part, dest)?;
        info!("Downloaded {}", dest.display());
        Ok(dest.to_path_buf())
    }

    /// Stream into `part`, resuming when possible; returns the hex digest of the whole file
    async fn fetch(&self, url: &str, part: &Path) -> Result<String> {
        let mut restarted = false;

        loop {
            let mut offset = std::fs::metadata(part).map(|m| m.len()).unwrap_or(0);
            let mut hasher = Sha256::new();

            if offset > 0 {
                info!("Resuming download at byte {}", offset);
                let mut existing = std::fs::File::open(part)?;
                std::io::copy(&mut existing, &mut hasher)?;
            }

            let mut response = self.client.get(url, Some(offset)).await?;
            let status = response.status();

            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                if restarted || offset == 0 {
                    return Err(AffinityError::Transport(format!(
                        "{} rejected the byte range",
                        url
                    )));
                }
                warn!("Server rejected resume offset {}, restarting download", offset);
                std::fs::remove_file(part)?;
                restarted = true;
                continue;
            }

            if !status.is_success() {
                return Err(AffinityError::Transport(format!("HTTP {} from {}", status, url)));
            }

            let resuming = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
            if offset > 0 && !resuming {
                debug!("Server ignored the range request, starting over");
                offset = 0;
                hasher = Sha256::new();
            }

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(resuming)
                .truncate(!resuming)
                .open(part)?;

            let total_size = response.content_length().map(|len| len + offset).unwrap_or(0);
            let pb = self.progress_bar(total_size, offset)?;

            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk)?;
                hasher.update(&chunk);

                if let Some(ref pb) = pb {
                    pb.inc(chunk.len() as u64);
                }
            }
            file.flush()?;

            if let Some(pb) = pb {
                pb.finish_with_message("Downloaded");
            }

            return Ok(format!("{:x}", hasher.finalize()));
        }
    }

    fn progress_bar(&self, total_size: u64, position: u64) -> Result<Option<ProgressBar>> {
        if !self.progress || total_size == 0 {
            return Ok(None);
        }

        let pb = ProgressBar::new(total_size);
        let style = ProgressStyle::default_bar()
            .template("{msg} {bar:40.cyan/blue} {bytes}/{total_bytes} {eta}")
            .map_err(|e| AffinityError::Transport(format!("Progress bar template error: {}", e)))?;
        pb.set_style(style);
        pb.set_message("Downloading");
        pb.set_position(position);
        Ok(Some(pb))
    }
}

/// Sibling path holding an in-progress download
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Hex SHA256 of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify SHA256 checksum
pub fn verify_checksum(path: &Path, expected: &str) -> Result<bool> {
    Ok(sha256_file(path)? == expected.trim().to_lowercase())
}
