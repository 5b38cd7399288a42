/*!
 * Integration tests for backend-deploy
 *
 * Every run goes through `MockConnector`, so these exercise the full deploy
 * sequence without a network.
 */

use std::path::Path;
use tempfile::{tempdir, TempDir};

use backend_deploy::config::DeployConfig;
use backend_deploy::host_key::{AcceptAnyHostKey, FingerprintVerifier, HostKey, HostKeyKind};
use backend_deploy::script::deploy_script;
use backend_deploy::transport::MockConnector;
use backend_deploy::{DeployOutcome, Deployer, OutputWriter};

fn backend_dir(with_entry: bool, with_manifest: bool) -> TempDir {
    let dir = tempdir().unwrap();
    if with_entry {
        std::fs::write(dir.path().join("index.js"), b"const app = require('express')();").unwrap();
    }
    if with_manifest {
        std::fs::write(dir.path().join("package.json"), b"{\"name\":\"backend\"}").unwrap();
    }
    dir
}

fn config_for(dir: &Path) -> DeployConfig {
    let mut config = DeployConfig::default();
    config.target.host = "192.0.2.44".to_string();
    config.target.username = "root".to_string();
    config.app.backend_dir = dir.to_path_buf();
    config
}

fn deploy(config: DeployConfig, connector: MockConnector) -> (DeployOutcome, String) {
    let deployer = Deployer::new(config, connector, Box::new(AcceptAnyHostKey));
    let mut out = OutputWriter::plain(Vec::new());
    let outcome = deployer.run(&mut out);
    (outcome, String::from_utf8(out.into_inner()).unwrap())
}

#[test]
fn test_missing_entry_file_never_connects() {
    let dir = backend_dir(false, true);
    let connector = MockConnector::new();

    let (outcome, out) = deploy(config_for(dir.path()), connector.clone());

    let expected = dir.path().join("index.js");
    assert_eq!(outcome, DeployOutcome::MissingFile(expected.clone()));
    assert!(out.contains(&format!("ERROR: {} not found", expected.display())));
    assert_eq!(connector.record().connects, 0);
}

#[test]
fn test_missing_manifest_never_connects() {
    let dir = backend_dir(true, false);
    let connector = MockConnector::new();

    let (outcome, out) = deploy(config_for(dir.path()), connector.clone());

    assert!(matches!(outcome, DeployOutcome::MissingFile(_)));
    assert!(out.contains("package.json not found"));
    assert!(!out.contains("Connecting to"));
    assert_eq!(connector.record().connects, 0);
}

#[test]
fn test_connect_failure_skips_transfer() {
    let dir = backend_dir(true, true);
    let connector = MockConnector::new().failing_connect("Connection timed out");

    let (outcome, out) = deploy(config_for(dir.path()), connector.clone());

    assert_eq!(outcome, DeployOutcome::ConnectFailed);
    assert!(out.contains("Connecting to 192.0.2.44..."));
    assert!(out.contains("ERROR: Failed to connect:"));
    assert!(out.contains("Connection timed out"));

    let record = connector.record();
    assert_eq!(record.connects, 1);
    assert_eq!(record.copy_sessions, 0);
    assert!(record.uploads.is_empty());
    assert!(record.commands.is_empty());
}

#[test]
fn test_transfer_failure_closes_once() {
    let dir = backend_dir(true, true);
    let connector = MockConnector::new().failing_upload(1, "No space left on device");

    let (outcome, out) = deploy(config_for(dir.path()), connector.clone());

    assert_eq!(outcome, DeployOutcome::TransferFailed);
    assert!(out.contains("ERROR uploading files:"));
    assert!(out.contains("No space left on device"));
    assert!(!out.contains("Files uploaded successfully"));

    let record = connector.record();
    assert_eq!(record.closes, 1);
    // The first file stays on the remote side; only mkdir ran
    assert_eq!(record.uploads.len(), 1);
    assert_eq!(record.commands.len(), 1);
    assert!(record.commands[0].starts_with("mkdir -p"));
}

#[test]
fn test_success_prints_output_without_error_block() {
    let dir = backend_dir(true, true);
    let connector = MockConnector::new().with_output(0, "[PM2] Done.\n", "");

    let (outcome, out) = deploy(config_for(dir.path()), connector.clone());

    assert_eq!(outcome, DeployOutcome::Completed { exit_status: 0 });
    assert!(outcome.is_success());
    assert!(!out.contains("=== Error Output ==="));

    let output_at = out.find("=== Deployment Output ===").unwrap();
    let stdout_at = out.find("[PM2] Done.").unwrap();
    let success_at = out
        .find("Deployment and restart complete successfully!")
        .unwrap();
    assert!(output_at < stdout_at && stdout_at < success_at);

    let record = connector.record();
    assert_eq!(record.closes, 1);
    assert_eq!(
        record.files["/root/messenger/backend/index.js"],
        b"const app = require('express')();"
    );
    assert!(record.files.contains_key("/root/messenger/backend/package.json"));
}

#[test]
fn test_nonzero_exit_reports_status() {
    let dir = backend_dir(true, true);
    let connector = MockConnector::new().with_output(127, "", "sh: 1: pm2: not found\n");

    let (outcome, out) = deploy(config_for(dir.path()), connector.clone());

    assert_eq!(outcome, DeployOutcome::Completed { exit_status: 127 });
    assert!(!outcome.is_success());
    assert!(out.contains("=== Error Output ==="));
    assert!(out.contains("pm2: not found"));
    assert!(out.contains("Error during deployment. Exit status: 127"));
    assert!(!out.contains("complete successfully"));
    assert_eq!(connector.record().closes, 1);
}

#[test]
fn test_malformed_output_bytes_are_dropped() {
    let dir = backend_dir(true, true);
    let connector =
        MockConnector::new().with_output(0, b"status \xff\xfeonline\n".to_vec(), Vec::new());

    let (_, out) = deploy(config_for(dir.path()), connector);

    assert!(out.contains("status online"));
    assert!(!out.contains('\u{fffd}'));
}

#[test]
fn test_command_failure_is_reported_and_closes() {
    let dir = backend_dir(true, true);
    let connector = MockConnector::new().failing_command("channel closed by peer");

    let (outcome, out) = deploy(config_for(dir.path()), connector.clone());

    assert_eq!(outcome, DeployOutcome::CommandFailed);
    assert!(out.contains("Error reading output:"));
    assert_eq!(connector.record().closes, 1);
}

#[test]
fn test_remote_command_order() {
    let dir = backend_dir(true, true);
    let connector = MockConnector::new();

    deploy(config_for(dir.path()), connector.clone());

    let record = connector.record();
    assert_eq!(record.commands.len(), 2);
    assert_eq!(record.commands[0], "mkdir -p /root/messenger/backend");

    let command = &record.commands[1];
    let expected = [
        "cd /root/messenger/backend",
        "npm install express socket.io sqlite3 sqlite jsonwebtoken cors multer sms_ru bcrypt",
        "pm2 delete messenger-backend || true",
        "pm2 start index.js --name messenger-backend",
        "pm2 save",
        "sleep 2",
        "pm2 status",
        "pm2 logs messenger-backend --lines 10 --nostream",
    ];
    assert_eq!(command, &expected.join(" && "));
    assert_eq!(command, &deploy_script(&DeployConfig::default().app).render());
}

#[test]
fn test_upload_order_is_entry_then_manifest() {
    let dir = backend_dir(true, true);
    let connector = MockConnector::new();

    deploy(config_for(dir.path()), connector.clone());

    let record = connector.record();
    assert_eq!(record.copy_sessions, 1);
    assert_eq!(record.uploads[0].0, dir.path().join("index.js"));
    assert_eq!(record.uploads[0].1, "/root/messenger/backend/index.js");
    assert_eq!(record.uploads[1].1, "/root/messenger/backend/package.json");
}

#[test]
fn test_rejected_host_key_stops_before_transfer() {
    let dir = backend_dir(true, true);
    let server_key = HostKey::new(HostKeyKind::Ed25519, b"server".to_vec());
    let other_key = HostKey::new(HostKeyKind::Ed25519, b"other".to_vec());
    let connector = MockConnector::new().with_host_key(server_key);

    let deployer = Deployer::new(
        config_for(dir.path()),
        connector.clone(),
        Box::new(FingerprintVerifier::new(&other_key.fingerprint())),
    );
    let mut out = OutputWriter::plain(Vec::new());
    let outcome = deployer.run(&mut out);
    let out = String::from_utf8(out.into_inner()).unwrap();

    assert_eq!(outcome, DeployOutcome::ConnectFailed);
    assert!(out.contains("host key verification failed"));
    assert!(connector.record().uploads.is_empty());
}

#[test]
fn test_pinned_host_key_allows_deploy() {
    let dir = backend_dir(true, true);
    let server_key = HostKey::new(HostKeyKind::Rsa, b"server".to_vec());
    let connector = MockConnector::new()
        .with_host_key(server_key.clone())
        .with_output(0, "ok\n", "");

    let deployer = Deployer::new(
        config_for(dir.path()),
        connector,
        Box::new(FingerprintVerifier::new(&server_key.fingerprint())),
    );
    let mut out = OutputWriter::plain(Vec::new());
    assert!(deployer.run(&mut out).is_success());
}
