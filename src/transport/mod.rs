//! Remote transport abstraction
//!
//! A deploy run needs three things from the remote side: run a command, copy
//! a file, and hang up. [`Connector`] opens a [`RemoteSession`] that provides
//! them. [`ssh::SshConnector`] is the real implementation;
//! [`mock::MockConnector`] records calls for tests.

pub mod mock;
pub mod ssh;

use crate::config::TargetConfig;
use crate::error::Result;
use crate::host_key::HostKeyVerifier;
use std::path::Path;

pub use mock::{MockConnector, MockRecord};
pub use ssh::{SshAuth, SshConnector, SshSession};

/// Opens authenticated sessions to a target
pub trait Connector {
    type Session: RemoteSession;

    /// Connect, verify the server's host key and authenticate
    ///
    /// No credential may be sent before `verifier` has accepted the key.
    fn connect(&self, target: &TargetConfig, verifier: &dyn HostKeyVerifier)
        -> Result<Self::Session>;
}

/// An established session
pub trait RemoteSession {
    /// Run a command and block until it exits
    fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    /// Open a file-copy sub-session; it is released when dropped
    fn file_copy(&mut self) -> Result<Box<dyn FileCopy + '_>>;

    /// Disconnect. Further calls are no-ops.
    fn close(&mut self) -> Result<()>;
}

/// File-copy sub-session riding an established session
pub trait FileCopy {
    /// Copy a local file to an absolute remote path; returns bytes sent
    fn put(&mut self, local: &Path, remote: &str) -> Result<u64>;
}

/// Exit status and captured streams of a finished remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn new(exit_status: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_status,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn stdout_text(&self) -> String {
        decode_lossy(&self.stdout)
    }

    pub fn stderr_text(&self) -> String {
        decode_lossy(&self.stderr)
    }
}

/// Decode UTF-8, dropping malformed bytes instead of substituting them
pub fn decode_lossy(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_drops_invalid_bytes() {
        assert_eq!(decode_lossy(b"ok \xff\xfedone"), "ok done");
        assert_eq!(decode_lossy("привет".as_bytes()), "привет");
        // Truncated multi-byte sequence at the end
        assert_eq!(decode_lossy(&"ж".as_bytes()[..1]), "");
        assert_eq!(decode_lossy(b""), "");
    }

    #[test]
    fn test_command_output_text() {
        let output = CommandOutput::new(1, b"online\n".to_vec(), b"warn \x80\n".to_vec());
        assert!(!output.success());
        assert_eq!(output.stdout_text(), "online\n");
        assert_eq!(output.stderr_text(), "warn \n");
    }
}
