//! Error types for affinity-cli

use thiserror::Error;

/// Affinity result type
pub type Result<T> = std::result::Result<T, AffinityError>;

/// Main error type for provisioning operations
#[derive(Error, Debug)]
pub enum AffinityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] ::config::ConfigError),

    /// Missing host tool, insufficient disk, permission denial
    #[error("{message}")]
    Environment {
        message: String,
        hint: Option<String>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: String, got: String },

    #[error("Unsafe archive member {member}: {reason}")]
    UnsafeArchive { member: String, reason: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("{message}")]
    Acquisition {
        message: String,
        hint: Option<String>,
    },

    #[error("{message}")]
    Preparation {
        message: String,
        hint: Option<String>,
    },

    #[error("Installation verification failed: {message}")]
    Verification {
        message: String,
        hint: Option<String>,
    },

    #[error("Installer not found: {0}")]
    InstallerNotFound(String),

    #[error("Command execution failed: {command} - {error}")]
    CommandExecution { command: String, error: String },

    #[error("Command timed out after {seconds}s: {command}")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

impl From<tokio::task::JoinError> for AffinityError {
    fn from(e: tokio::task::JoinError) -> Self {
        AffinityError::Task(e.to_string())
    }
}

impl AffinityError {
    pub fn environment(message: impl Into<String>, hint: impl Into<String>) -> Self {
        AffinityError::Environment {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn acquisition(message: impl Into<String>, hint: impl Into<String>) -> Self {
        AffinityError::Acquisition {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn preparation(message: impl Into<String>, hint: impl Into<String>) -> Self {
        AffinityError::Preparation {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    /// Remediation hint to show next to the error, if any
    pub fn hint(&self) -> Option<&str> {
        match self {
            AffinityError::Environment { hint, .. }
            | AffinityError::Acquisition { hint, .. }
            | AffinityError::Preparation { hint, .. }
            | AffinityError::Verification { hint, .. } => hint.as_deref(),
            AffinityError::ChecksumMismatch { .. } => {
                Some("The corrupt file was removed. Check the source URL and checksum, then retry.")
            }
            AffinityError::UnsafeArchive { .. } => {
                Some("The archive was rejected and nothing was extracted. Obtain it from a trusted source.")
            }
            AffinityError::Transport(_) | AffinityError::Http(_) => {
                Some("Check your connection or proxy settings (HTTP(S)_PROXY/NO_PROXY).")
            }
            AffinityError::CommandTimeout { .. } => {
                Some("The command did not finish in time. Retry, or run it manually to inspect its output.")
            }
            _ => None,
        }
    }

    /// Integrity failures: the untrusted artifact has already been deleted
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            AffinityError::ChecksumMismatch { .. } | AffinityError::UnsafeArchive { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_errors_are_flagged() {
        let err = AffinityError::ChecksumMismatch {
            expected: "aa".into(),
            got: "bb".into(),
        };
        assert!(err.is_integrity());
        assert!(err.hint().is_some());

        let err = AffinityError::Transport("boom".into());
        assert!(!err.is_integrity());
    }

    #[test]
    fn environment_error_carries_hint() {
        let err = AffinityError::environment("winetricks missing", "install winetricks");
        assert_eq!(err.to_string(), "winetricks missing");
        assert_eq!(err.hint(), Some("install winetricks"));
    }
}
