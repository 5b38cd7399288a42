//! Server host key verification
//!
//! The connector hands every server key to a [`HostKeyVerifier`] before any
//! credential is sent. Verifiers are chosen by the caller; the default is a
//! strict known_hosts lookup.

use crate::config::{HostKeyConfig, HostKeyPolicy};
use crate::error::{DeployError, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Host key algorithm as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyKind {
    Rsa,
    Dss,
    Ecdsa256,
    Ecdsa384,
    Ecdsa521,
    Ed25519,
    Unknown,
}

impl HostKeyKind {
    /// OpenSSH algorithm name
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyKind::Rsa => "ssh-rsa",
            HostKeyKind::Dss => "ssh-dss",
            HostKeyKind::Ecdsa256 => "ecdsa-sha2-nistp256",
            HostKeyKind::Ecdsa384 => "ecdsa-sha2-nistp384",
            HostKeyKind::Ecdsa521 => "ecdsa-sha2-nistp521",
            HostKeyKind::Ed25519 => "ssh-ed25519",
            HostKeyKind::Unknown => "unknown",
        }
    }
}

impl From<ssh2::HostKeyType> for HostKeyKind {
    fn from(kind: ssh2::HostKeyType) -> Self {
        match kind {
            ssh2::HostKeyType::Rsa => HostKeyKind::Rsa,
            ssh2::HostKeyType::Dss => HostKeyKind::Dss,
            ssh2::HostKeyType::Ecdsa256 => HostKeyKind::Ecdsa256,
            ssh2::HostKeyType::Ecdsa384 => HostKeyKind::Ecdsa384,
            ssh2::HostKeyType::Ecdsa521 => HostKeyKind::Ecdsa521,
            ssh2::HostKeyType::Ed25519 => HostKeyKind::Ed25519,
            ssh2::HostKeyType::Unknown => HostKeyKind::Unknown,
        }
    }
}

/// A server public key in SSH wire encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub kind: HostKeyKind,
    pub blob: Vec<u8>,
}

impl HostKey {
    pub fn new(kind: HostKeyKind, blob: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            blob: blob.into(),
        }
    }

    /// OpenSSH-style fingerprint, e.g. `SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8`
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.name(), self.fingerprint())
    }
}

/// Decides whether a server may be trusted with our credentials
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, port: u16, key: &HostKey) -> Result<()>;
}

/// Looks keys up in an OpenSSH known_hosts file
///
/// Hashed entries are supported since matching is delegated to libssh2.
#[derive(Debug, Clone)]
pub struct KnownHostsVerifier {
    path: PathBuf,
    accept_new: bool,
}

impl KnownHostsVerifier {
    /// Reject every host not already listed
    pub fn strict(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            accept_new: false,
        }
    }

    /// Record unknown hosts on first contact; changed keys are still rejected
    pub fn accept_new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            accept_new: true,
        }
    }

    /// Append one entry; existing lines are left untouched
    fn record(&self, host: &str, port: u16, key: &HostKey) -> Result<()> {
        let write_err = |e: std::io::Error| {
            host_key_error(host, format!("cannot write {}: {}", self.path.display(), e))
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;

        let mut entry = String::new();
        if !ends_with_newline(&mut file).map_err(write_err)? {
            entry.push('\n');
        }
        entry.push_str(&known_hosts_entry(host, port, key));
        entry.push('\n');

        file.write_all(entry.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)
    }
}

impl HostKeyVerifier for KnownHostsVerifier {
    fn verify(&self, host: &str, port: u16, key: &HostKey) -> Result<()> {
        // libssh2 needs a session handle to own the known_hosts collection,
        // but the handle does not have to be connected.
        let session = Session::new()
            .map_err(|e| host_key_error(host, format!("cannot load known_hosts: {}", e)))?;
        let mut known = session
            .known_hosts()
            .map_err(|e| host_key_error(host, format!("cannot load known_hosts: {}", e)))?;

        if self.path.exists() {
            let count = known
                .read_file(&self.path, KnownHostFileKind::OpenSSH)
                .map_err(|e| {
                    host_key_error(
                        host,
                        format!("cannot read {}: {}", self.path.display(), e),
                    )
                })?;
            tracing::debug!(path = %self.path.display(), entries = count, "loaded known_hosts");
        }

        match known.check_port(host, port, &key.blob) {
            CheckResult::Match => {
                tracing::debug!(host, port, key = %key, "host key matches known_hosts");
                Ok(())
            }
            CheckResult::Mismatch => Err(host_key_error(
                host,
                format!(
                    "{} does not match the key recorded in {}",
                    key,
                    self.path.display()
                ),
            )),
            CheckResult::NotFound if self.accept_new => {
                self.record(host, port, key)?;
                tracing::warn!(
                    host,
                    port,
                    key = %key,
                    path = %self.path.display(),
                    "permanently added host key to known_hosts"
                );
                Ok(())
            }
            CheckResult::NotFound => Err(host_key_error(
                host,
                format!(
                    "no entry in {} (server offered {})",
                    self.path.display(),
                    key
                ),
            )),
            CheckResult::Failure => Err(host_key_error(
                host,
                "known_hosts lookup failed".to_string(),
            )),
        }
    }
}

/// Accepts exactly one pinned fingerprint
#[derive(Debug, Clone)]
pub struct FingerprintVerifier {
    expected: String,
}

impl FingerprintVerifier {
    /// Accepts `SHA256:<base64>` or the bare base64 part, with or without padding
    pub fn new(fingerprint: &str) -> Self {
        let bare = fingerprint.trim();
        let bare = bare.strip_prefix("SHA256:").unwrap_or(bare);
        Self {
            expected: format!("SHA256:{}", bare.trim_end_matches('=')),
        }
    }
}

impl HostKeyVerifier for FingerprintVerifier {
    fn verify(&self, host: &str, _port: u16, key: &HostKey) -> Result<()> {
        let actual = key.fingerprint();
        if actual == self.expected {
            Ok(())
        } else {
            Err(host_key_error(
                host,
                format!("expected {}, server offered {}", self.expected, actual),
            ))
        }
    }
}

/// Trusts every server. Only for throwaway hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, host: &str, port: u16, key: &HostKey) -> Result<()> {
        tracing::warn!(host, port, key = %key, "host key accepted without verification");
        Ok(())
    }
}

/// Build the verifier described by the configuration
pub fn verifier_from_config(config: &HostKeyConfig) -> Result<Box<dyn HostKeyVerifier>> {
    if let Some(fingerprint) = &config.fingerprint {
        return Ok(Box::new(FingerprintVerifier::new(fingerprint)));
    }
    match config.policy {
        HostKeyPolicy::Strict => Ok(Box::new(KnownHostsVerifier::strict(
            config.known_hosts_path()?,
        ))),
        HostKeyPolicy::AcceptNew => Ok(Box::new(KnownHostsVerifier::accept_new(
            config.known_hosts_path()?,
        ))),
        HostKeyPolicy::InsecureAcceptAny => Ok(Box::new(AcceptAnyHostKey)),
    }
}

/// known_hosts uses `[host]:port` for anything off the default port
fn known_hosts_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// One OpenSSH known_hosts line, without the trailing newline
fn known_hosts_entry(host: &str, port: u16, key: &HostKey) -> String {
    format!(
        "{} {} {}",
        known_hosts_name(host, port),
        key.kind.name(),
        STANDARD.encode(&key.blob)
    )
}

/// True for an empty file or one whose last byte is a newline
fn ends_with_newline(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn host_key_error(host: &str, reason: String) -> DeployError {
    DeployError::HostKey {
        host: host.to_string(),
        reason,
    }
}
