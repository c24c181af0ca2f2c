//! Error types for fabric-smd

use fabric_sm_core::SmError;
use std::path::PathBuf;
use thiserror::Error;

/// Subnet manager daemon errors
#[derive(Debug, Error)]
pub enum SmdError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The guid2lid file could not be read or written
    #[error("guid2lid file {path}: {message}")]
    Guid2Lid { path: PathBuf, message: String },

    /// The simulated topology could not be loaded
    #[error("Topology error: {0}")]
    Topology(String),

    /// Error raised by the subnet manager core
    #[error(transparent)]
    Core(#[from] SmError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SmdError {
    pub(crate) fn guid2lid(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Guid2Lid {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// True if the daemon should exit with a failure status.
    pub fn is_fatal(&self) -> bool {
        match self {
            SmdError::Core(e) => !e.is_recoverable(),
            _ => true,
        }
    }
}

/// Result type for fabric-smd operations
pub type Result<T> = std::result::Result<T, SmdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SmdError::Configuration("poll_period_ms must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: poll_period_ms must be > 0"
        );
    }

    #[test]
    fn test_guid2lid_error_names_file() {
        let err = SmdError::guid2lid("/var/lib/fabric-sm/guid2lid", "unsupported version 9");
        assert_eq!(
            err.to_string(),
            "guid2lid file /var/lib/fabric-sm/guid2lid: unsupported version 9"
        );
    }

    #[test]
    fn test_fatal_desync_is_fatal() {
        let err = SmdError::from(SmError::FatalTopologyDesync {
            reason: "duplicate switch".to_string(),
        });
        assert!(err.is_fatal());
    }
}
