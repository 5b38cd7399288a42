//! Scripted transport for testing
//!
//! Records every connect, command, upload and close so tests can assert on
//! what a deploy run did without a network. Each stage can be told to fail.

use super::{CommandOutput, Connector, FileCopy, RemoteSession};
use crate::config::TargetConfig;
use crate::error::{DeployError, Result};
use crate::host_key::{HostKey, HostKeyKind, HostKeyVerifier};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Everything a mock session was asked to do
#[derive(Debug, Clone, Default)]
pub struct MockRecord {
    /// Number of connection attempts
    pub connects: usize,
    /// Commands in the order they were executed
    pub commands: Vec<String>,
    /// Uploads in order: (local path, remote path)
    pub uploads: Vec<(PathBuf, String)>,
    /// Uploaded contents keyed by remote path
    pub files: BTreeMap<String, Vec<u8>>,
    /// Number of file-copy sub-sessions opened
    pub copy_sessions: usize,
    /// Number of explicit `close` calls
    pub closes: usize,
}

/// Mock connector with scripted failures and command output
///
/// # Example
///
/// ```rust
/// use backend_deploy::transport::{MockConnector, Connector, RemoteSession};
/// use backend_deploy::config::TargetConfig;
/// use backend_deploy::host_key::AcceptAnyHostKey;
///
/// let connector = MockConnector::new().with_output(0, "ok\n", "");
/// let mut session = connector.connect(&TargetConfig::default(), &AcceptAnyHostKey).unwrap();
/// let output = session.exec("pm2 status").unwrap();
/// assert_eq!(output.stdout_text(), "ok\n");
/// assert_eq!(connector.record().commands, vec!["pm2 status"]);
/// ```
#[derive(Debug, Clone)]
pub struct MockConnector {
    record: Arc<Mutex<MockRecord>>,
    host_key: HostKey,
    connect_error: Option<String>,
    upload_error: Option<(usize, String)>,
    command_error: Option<String>,
    mkdir_output: CommandOutput,
    output: CommandOutput,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            record: Arc::new(Mutex::new(MockRecord::default())),
            host_key: HostKey::new(HostKeyKind::Ed25519, b"mock-host-key".to_vec()),
            connect_error: None,
            upload_error: None,
            command_error: None,
            mkdir_output: CommandOutput::default(),
            output: CommandOutput::default(),
        }
    }

    /// Key presented to the verifier on connect
    pub fn with_host_key(mut self, key: HostKey) -> Self {
        self.host_key = key;
        self
    }

    /// Fail every connection attempt
    pub fn failing_connect(mut self, message: impl Into<String>) -> Self {
        self.connect_error = Some(message.into());
        self
    }

    /// Fail the `index`-th upload (0-based)
    pub fn failing_upload(mut self, index: usize, message: impl Into<String>) -> Self {
        self.upload_error = Some((index, message.into()));
        self
    }

    /// Fail every non-mkdir command before it produces output
    pub fn failing_command(mut self, message: impl Into<String>) -> Self {
        self.command_error = Some(message.into());
        self
    }

    /// Result returned for `mkdir` commands
    pub fn with_mkdir_output(
        mut self,
        exit_status: i32,
        stdout: impl Into<Vec<u8>>,
        stderr: impl Into<Vec<u8>>,
    ) -> Self {
        self.mkdir_output = CommandOutput::new(exit_status, stdout, stderr);
        self
    }

    /// Result returned for every other command
    pub fn with_output(
        mut self,
        exit_status: i32,
        stdout: impl Into<Vec<u8>>,
        stderr: impl Into<Vec<u8>>,
    ) -> Self {
        self.output = CommandOutput::new(exit_status, stdout, stderr);
        self
    }

    /// Snapshot of recorded activity
    pub fn record(&self) -> MockRecord {
        self.record.lock().unwrap().clone()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MockConnector {
    type Session = MockSession;

    fn connect(&self, target: &TargetConfig, verifier: &dyn HostKeyVerifier) -> Result<MockSession> {
        self.record.lock().unwrap().connects += 1;

        if let Some(message) = &self.connect_error {
            return Err(DeployError::connect(&target.endpoint(), message));
        }
        verifier.verify(&target.host, target.port, &self.host_key)?;

        Ok(MockSession {
            connector: self.clone(),
            uploads_attempted: 0,
            closed: false,
        })
    }
}

/// Session handed out by [`MockConnector`]
#[derive(Debug)]
pub struct MockSession {
    connector: MockConnector,
    uploads_attempted: usize,
    closed: bool,
}

impl MockSession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(DeployError::Command("session is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl RemoteSession for MockSession {
    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        self.ensure_open()?;
        self.connector
            .record
            .lock()
            .unwrap()
            .commands
            .push(command.to_string());

        if command.starts_with("mkdir ") {
            return Ok(self.connector.mkdir_output.clone());
        }
        if let Some(message) = &self.connector.command_error {
            return Err(DeployError::Command(message.clone()));
        }
        Ok(self.connector.output.clone())
    }

    fn file_copy(&mut self) -> Result<Box<dyn FileCopy + '_>> {
        self.ensure_open()?;
        self.connector.record.lock().unwrap().copy_sessions += 1;
        Ok(Box::new(MockFileCopy { session: self }))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.connector.record.lock().unwrap().closes += 1;
        Ok(())
    }
}

struct MockFileCopy<'a> {
    session: &'a mut MockSession,
}

impl FileCopy for MockFileCopy<'_> {
    fn put(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let index = self.session.uploads_attempted;
        self.session.uploads_attempted += 1;

        if let Some((fail_at, message)) = &self.session.connector.upload_error {
            if *fail_at == index {
                return Err(DeployError::Transfer {
                    path: local.to_path_buf(),
                    message: message.clone(),
                });
            }
        }

        let data = std::fs::read(local).map_err(|e| DeployError::Transfer {
            path: local.to_path_buf(),
            message: e.to_string(),
        })?;
        let len = data.len() as u64;

        let mut record = self.session.connector.record.lock().unwrap();
        record.uploads.push((local.to_path_buf(), remote.to_string()));
        record.files.insert(remote.to_string(), data);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_key::{AcceptAnyHostKey, FingerprintVerifier};

    fn target() -> TargetConfig {
        TargetConfig {
            host: "mock.example.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_records_commands_and_close() {
        let connector = MockConnector::new().with_output(3, "out", "err");
        let mut session = connector.connect(&target(), &AcceptAnyHostKey).unwrap();

        session.exec("mkdir -p /srv").unwrap();
        let output = session.exec("pm2 status").unwrap();
        assert_eq!(output.exit_status, 3);

        session.close().unwrap();
        assert!(session.exec("pm2 save").is_err());

        let record = connector.record();
        assert_eq!(record.connects, 1);
        assert_eq!(record.commands, vec!["mkdir -p /srv", "pm2 status"]);
        assert_eq!(record.closes, 1);
    }

    #[test]
    fn test_connect_failure() {
        let connector = MockConnector::new().failing_connect("Connection refused");
        let err = connector.connect(&target(), &AcceptAnyHostKey).unwrap_err();
        assert!(err.to_string().contains("Connection refused"));
        assert_eq!(connector.record().connects, 1);
    }

    #[test]
    fn test_verifier_is_consulted() {
        let connector = MockConnector::new();
        let pinned = FingerprintVerifier::new("SHA256:AAAA");
        let err = connector.connect(&target(), &pinned).unwrap_err();
        assert!(err.is_security_error());
    }

    #[test]
    fn test_upload_records_contents() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("index.js");
        std::fs::write(&local, b"console.log(1)").unwrap();

        let connector = MockConnector::new();
        let mut session = connector.connect(&target(), &AcceptAnyHostKey).unwrap();
        {
            let mut copy = session.file_copy().unwrap();
            assert_eq!(copy.put(&local, "/srv/index.js").unwrap(), 14);
        }

        let record = connector.record();
        assert_eq!(record.copy_sessions, 1);
        assert_eq!(record.files["/srv/index.js"], b"console.log(1)");
    }

    #[test]
    fn test_failing_upload_index() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a");
        std::fs::write(&local, b"a").unwrap();

        let connector = MockConnector::new().failing_upload(1, "disk full");
        let mut session = connector.connect(&target(), &AcceptAnyHostKey).unwrap();
        let mut copy = session.file_copy().unwrap();
        assert!(copy.put(&local, "/srv/a").is_ok());
        assert!(copy.put(&local, "/srv/b").is_err());
    }
}
