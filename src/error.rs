/*!
 * Error types for backend-deploy
 */

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeployError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FATAL: i32 = 2;

#[derive(Error, Debug)]
pub enum DeployError {
    /// Local file required for the upload does not exist
    #[error("{} not found", .0.display())]
    MissingFile(PathBuf),

    /// TCP connect, SSH handshake or session setup failed
    #[error("connection to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    /// Credentials rejected by the server
    #[error("authentication failed for {user}: {message}")]
    Authentication { user: String, message: String },

    /// Server host key rejected by the configured verifier
    #[error("host key verification failed for {host}: {reason}")]
    HostKey { host: String, reason: String },

    /// SCP upload failed
    #[error("failed to upload {}: {message}", .path.display())]
    Transfer { path: PathBuf, message: String },

    /// Remote command could not be started or its output could not be read
    #[error("remote command failed: {0}")]
    Command(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeployError {
    /// Get the process exit code for errors that escape the deploy run
    pub fn exit_code(&self) -> i32 {
        EXIT_FATAL
    }

    /// True for failures caused by host identity or credentials
    pub fn is_security_error(&self) -> bool {
        matches!(
            self,
            DeployError::Authentication { .. } | DeployError::HostKey { .. }
        )
    }

    pub(crate) fn connect(endpoint: &str, err: impl std::fmt::Display) -> Self {
        DeployError::Connect {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }
}
