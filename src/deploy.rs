//! The deploy run
//!
//! A linear sequence: check local files, connect, create the remote
//! directory, upload, run the install/restart script, report. Every failure
//! is printed and ends the run; nothing is retried or rolled back.

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::host_key::HostKeyVerifier;
use crate::output::{sanitize_error, OutputWriter};
use crate::script::{deploy_script, mkdir_command};
use crate::transport::{Connector, RemoteSession};
use std::io::Write;
use std::path::{Path, PathBuf};

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// A local file was missing; nothing was contacted
    MissingFile(PathBuf),
    /// The session could not be established
    ConnectFailed,
    /// An upload failed; the session was closed
    TransferFailed,
    /// The deploy script could not be run or its output could not be read
    CommandFailed,
    /// The deploy script ran to completion with this exit status
    Completed { exit_status: i32 },
    /// Dry run: plan printed, nothing contacted
    Planned,
}

impl DeployOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DeployOutcome::Completed { exit_status: 0 } | DeployOutcome::Planned
        )
    }
}

/// Runs one deployment against one target
pub struct Deployer<C: Connector> {
    config: DeployConfig,
    connector: C,
    verifier: Box<dyn HostKeyVerifier>,
}

impl<C: Connector> Deployer<C> {
    pub fn new(config: DeployConfig, connector: C, verifier: Box<dyn HostKeyVerifier>) -> Self {
        Self {
            config,
            connector,
            verifier,
        }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Execute the full deploy sequence, writing progress to `out`
    pub fn run<W: Write>(&self, out: &mut OutputWriter<W>) -> DeployOutcome {
        let target = &self.config.target;
        let app = &self.config.app;
        let span = tracing::info_span!("deploy", host = %target.host, service = %app.service_name);
        let _enter = span.enter();

        let entry = app.local_entry();
        let manifest = app.local_manifest();
        if let Err(DeployError::MissingFile(path)) =
            check_local_files(&[entry.as_path(), manifest.as_path()])
        {
            out.error(format!("ERROR: {} not found", path.display()));
            tracing::error!(path = %path.display(), "local file missing");
            return DeployOutcome::MissingFile(path);
        }

        out.line(format!("Connecting to {}...", target.host));
        let mut session = match self.connector.connect(target, self.verifier.as_ref()) {
            Ok(session) => session,
            Err(e) => {
                out.error(format!(
                    "ERROR: Failed to connect: {}",
                    sanitize_error(&e.to_string())
                ));
                tracing::error!(error = %e, "connect failed");
                return DeployOutcome::ConnectFailed;
            }
        };
        out.success("Connected successfully");

        self.ensure_remote_dir(&mut session);

        if let Err(e) = self.upload(&mut session, &entry, &manifest, out) {
            out.error(format!(
                "ERROR uploading files: {}",
                sanitize_error(&e.to_string())
            ));
            tracing::error!(error = %e, "upload failed");
            close_session(&mut session);
            return DeployOutcome::TransferFailed;
        }

        out.line("Installing dependencies and restarting server...");
        let outcome = self.execute(&mut session, out);

        close_session(&mut session);
        outcome
    }

    /// Print what a run would do without touching the network
    pub fn plan<W: Write>(&self, out: &mut OutputWriter<W>) -> DeployOutcome {
        let target = &self.config.target;
        let app = &self.config.app;

        let entry = app.local_entry();
        let manifest = app.local_manifest();
        if let Err(DeployError::MissingFile(path)) =
            check_local_files(&[entry.as_path(), manifest.as_path()])
        {
            out.error(format!("ERROR: {} not found", path.display()));
            return DeployOutcome::MissingFile(path);
        }

        out.header("=== Deployment Plan ===");
        out.line(format!(
            "Target:  {}@{}:{}",
            target.username, target.host, target.port
        ));
        out.line(format!("Upload:  {} -> {}", entry.display(), app.remote_entry()));
        out.line(format!(
            "Upload:  {} -> {}",
            manifest.display(),
            app.remote_manifest()
        ));
        out.line(format!("Prepare: {}", mkdir_command(&app.remote_dir)));
        out.line(format!("Command: {}", deploy_script(app)));
        DeployOutcome::Planned
    }

    /// Best effort; a failure here surfaces during upload
    fn ensure_remote_dir(&self, session: &mut C::Session) {
        let command = mkdir_command(&self.config.app.remote_dir);
        match session.exec(&command) {
            Ok(output) if output.success() => {
                tracing::debug!(dir = %self.config.app.remote_dir, "remote directory ready");
            }
            Ok(output) => {
                let stderr = output.stderr_text();
                tracing::warn!(
                    exit_status = output.exit_status,
                    stderr = %stderr.trim(),
                    "mkdir on remote host failed"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "mkdir on remote host failed");
            }
        }
    }

    fn upload<W: Write>(
        &self,
        session: &mut C::Session,
        entry: &Path,
        manifest: &Path,
        out: &mut OutputWriter<W>,
    ) -> Result<()> {
        let app = &self.config.app;
        let mut copy = session.file_copy()?;

        out.line(format!(
            "Uploading {} and {}...",
            app.entry_file, app.manifest_file
        ));
        copy.put(entry, &app.remote_entry())?;
        copy.put(manifest, &app.remote_manifest())?;

        out.success("Files uploaded successfully");
        Ok(())
    }

    fn execute<W: Write>(&self, session: &mut C::Session, out: &mut OutputWriter<W>) -> DeployOutcome {
        let command = deploy_script(&self.config.app).render();
        tracing::debug!(command = %command, "running deploy script");

        let output = match session.exec(&command) {
            Ok(output) => output,
            Err(e) => {
                out.error(format!(
                    "Error reading output: {}",
                    sanitize_error(&e.to_string())
                ));
                tracing::error!(error = %e, "deploy script failed to run");
                return DeployOutcome::CommandFailed;
            }
        };

        let stdout = output.stdout_text();
        let stderr = output.stderr_text();

        out.header("=== Deployment Output ===");
        out.block(&stdout);
        if !stderr.is_empty() {
            out.header("=== Error Output ===");
            out.block(&stderr);
        }

        if output.success() {
            out.success("Deployment and restart complete successfully!");
            tracing::info!("deploy finished");
        } else {
            out.error(format!(
                "Error during deployment. Exit status: {}",
                output.exit_status
            ));
            tracing::error!(exit_status = output.exit_status, "deploy script exited non-zero");
        }

        DeployOutcome::Completed {
            exit_status: output.exit_status,
        }
    }
}

/// Fail on the first path that is not an existing file
fn check_local_files(paths: &[&Path]) -> Result<()> {
    for path in paths {
        if !path.is_file() {
            return Err(DeployError::MissingFile(path.to_path_buf()));
        }
    }
    Ok(())
}

fn close_session<S: RemoteSession>(session: &mut S) {
    if let Err(e) = session.close() {
        tracing::warn!(error = %e, "error while closing session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_key::AcceptAnyHostKey;
    use crate::transport::MockConnector;
    use tempfile::{tempdir, TempDir};

    fn fixture() -> (TempDir, DeployConfig) {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("index.js"), b"require('express')").unwrap();
        std::fs::write(dir.path().join("package.json"), b"{}").unwrap();

        let mut config = DeployConfig::default();
        config.target.host = "198.51.100.7".to_string();
        config.target.username = "root".to_string();
        config.app.backend_dir = dir.path().to_path_buf();
        (dir, config)
    }

    fn run(config: DeployConfig, connector: MockConnector) -> (DeployOutcome, String, MockConnector) {
        let deployer = Deployer::new(config, connector, Box::new(AcceptAnyHostKey));
        let mut out = OutputWriter::plain(Vec::new());
        let outcome = deployer.run(&mut out);
        let text = String::from_utf8(out.into_inner()).unwrap();
        (outcome, text, deployer.connector().clone())
    }

    #[test]
    fn test_check_local_files() {
        let (dir, _) = fixture();
        let present = dir.path().join("index.js");
        let absent = dir.path().join("missing.js");
        assert!(check_local_files(&[present.as_path()]).is_ok());
        match check_local_files(&[present.as_path(), absent.as_path()]) {
            Err(DeployError::MissingFile(path)) => assert_eq!(path, absent),
            other => panic!("unexpected: {:?}", other),
        }
        // Directories do not count as files
        assert!(check_local_files(&[dir.path()]).is_err());
    }

    #[test]
    fn test_mkdir_failure_is_not_fatal() {
        let (_dir, config) = fixture();
        let connector = MockConnector::new()
            .with_mkdir_output(1, "", "mkdir: permission denied")
            .with_output(0, "ok", "");
        let (outcome, _, connector) = run(config, connector);

        assert_eq!(outcome, DeployOutcome::Completed { exit_status: 0 });
        assert_eq!(connector.record().uploads.len(), 2);
    }

    #[test]
    fn test_uploads_go_to_remote_dir() {
        let (_dir, mut config) = fixture();
        config.app.remote_dir = "/srv/chat".to_string();
        let (_, _, connector) = run(config, MockConnector::new());

        let record = connector.record();
        let remotes: Vec<&str> = record.uploads.iter().map(|(_, r)| r.as_str()).collect();
        assert_eq!(remotes, vec!["/srv/chat/index.js", "/srv/chat/package.json"]);
        assert_eq!(record.files["/srv/chat/package.json"], b"{}");
        assert_eq!(record.commands[0], "mkdir -p /srv/chat");
    }

    #[test]
    fn test_plan_does_not_connect() {
        let (_dir, config) = fixture();
        let deployer = Deployer::new(config, MockConnector::new(), Box::new(AcceptAnyHostKey));
        let mut out = OutputWriter::plain(Vec::new());

        assert_eq!(deployer.plan(&mut out), DeployOutcome::Planned);
        let text = String::from_utf8(out.into_inner()).unwrap();
        assert!(text.contains("root@198.51.100.7:22"));
        assert!(text.contains("Command: cd /root/messenger/backend && npm install"));
        assert_eq!(deployer.connector().record().connects, 0);
    }

    #[test]
    fn test_outcome_success() {
        assert!(DeployOutcome::Completed { exit_status: 0 }.is_success());
        assert!(DeployOutcome::Planned.is_success());
        assert!(!DeployOutcome::Completed { exit_status: 1 }.is_success());
        assert!(!DeployOutcome::TransferFailed.is_success());
    }
}
