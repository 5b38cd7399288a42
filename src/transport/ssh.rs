//! SSH/SCP transport implementation
//!
//! Blocking sessions over the `ssh2` crate. Only connection setup is bounded
//! by the configured timeout; once authenticated, remote commands may run for
//! as long as they need.

use super::{CommandOutput, Connector, FileCopy, RemoteSession};
use crate::config::TargetConfig;
use crate::error::{DeployError, Result};
use crate::host_key::{HostKey, HostKeyVerifier};
use secrecy::{ExposeSecret, SecretString};
use ssh2::Session;
use std::fs::File;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// SSH authentication method
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// Password authentication
    Password(SecretString),

    /// Public key authentication with private key file
    KeyFile {
        /// Path to private key file
        key_path: PathBuf,
        /// Optional passphrase for the key
        passphrase: Option<SecretString>,
    },

    /// SSH agent authentication
    Agent,
}

/// Connects with libssh2 via the `ssh2` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    fn connect(&self, target: &TargetConfig, verifier: &dyn HostKeyVerifier) -> Result<SshSession> {
        let endpoint = target.endpoint();
        let timeout = Duration::from_secs(target.timeout_secs);

        let tcp = connect_tcp(&target.host, target.port, timeout)?;
        tcp.set_read_timeout(Some(timeout)).ok();
        tcp.set_write_timeout(Some(timeout)).ok();
        // Keep a handle to lift the socket timeouts once setup is done
        let control = tcp.try_clone()?;

        let mut session =
            Session::new().map_err(|e| DeployError::connect(&endpoint, e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);

        session
            .handshake()
            .map_err(|e| DeployError::connect(&endpoint, e))?;

        let (blob, kind) = session.host_key().ok_or_else(|| {
            DeployError::connect(&endpoint, "server did not present a host key")
        })?;
        let key = HostKey::new(kind.into(), blob);
        tracing::debug!(endpoint = %endpoint, key = %key, "server host key");
        verifier.verify(&target.host, target.port, &key)?;

        authenticate(&session, &target.username, &target.auth()?)?;

        if !session.authenticated() {
            return Err(DeployError::Authentication {
                user: target.username.clone(),
                message: "server did not accept any credential".to_string(),
            });
        }

        session.set_timeout(0);
        control.set_read_timeout(None).ok();
        control.set_write_timeout(None).ok();

        tracing::info!(endpoint = %endpoint, user = %target.username, "ssh session established");

        Ok(SshSession {
            session,
            endpoint,
            closed: false,
        })
    }
}

/// Resolve and connect, trying each address within the timeout
fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let endpoint = format!("{}:{}", host, port);
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| DeployError::connect(&endpoint, e))?
        .collect();

    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "tcp connect failed");
                last_err = e;
            }
        }
    }
    Err(DeployError::connect(&endpoint, last_err))
}

fn authenticate(session: &Session, user: &str, auth: &SshAuth) -> Result<()> {
    let auth_err = |message: String| DeployError::Authentication {
        user: user.to_string(),
        message,
    };

    match auth {
        SshAuth::Password(password) => session
            .userauth_password(user, password.expose_secret())
            .map_err(|e| auth_err(format!("password authentication failed: {}", e))),
        SshAuth::KeyFile {
            key_path,
            passphrase,
        } => {
            let pass: Option<&str> = passphrase.as_ref().map(|p| p.expose_secret());
            session
                .userauth_pubkey_file(user, None, key_path, pass)
                .map_err(|e| auth_err(format!("key file authentication failed: {}", e)))
        }
        SshAuth::Agent => {
            let mut agent = session
                .agent()
                .map_err(|e| auth_err(format!("failed to connect to SSH agent: {}", e)))?;
            agent
                .connect()
                .map_err(|e| auth_err(format!("failed to connect to SSH agent: {}", e)))?;
            agent
                .list_identities()
                .map_err(|e| auth_err(format!("failed to list SSH agent identities: {}", e)))?;
            let identities = agent
                .identities()
                .map_err(|e| auth_err(format!("failed to get SSH agent identities: {}", e)))?;

            for identity in identities {
                if agent.userauth(user, &identity).is_ok() {
                    return Ok(());
                }
            }
            Err(auth_err("no valid identity found in SSH agent".to_string()))
        }
    }
}

/// Authenticated SSH session
pub struct SshSession {
    session: Session,
    endpoint: String,
    closed: bool,
}

impl RemoteSession for SshSession {
    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let cmd_err = |e: &dyn std::fmt::Display| DeployError::Command(e.to_string());

        let mut channel = self.session.channel_session().map_err(|e| cmd_err(&e))?;
        channel.exec(command).map_err(|e| cmd_err(&e))?;

        // stdout and stderr share one receive window; both must be drained
        // as data arrives
        let mut err_stream = channel.stderr();
        let status = channel.clone();
        self.session.set_blocking(false);
        let drained = drain_streams(&mut channel, &mut err_stream, || status.eof());
        self.session.set_blocking(true);
        let (stdout, stderr) = drained.map_err(|e| cmd_err(&e))?;

        channel.wait_close().map_err(|e| cmd_err(&e))?;
        let exit_status = channel.exit_status().map_err(|e| cmd_err(&e))?;

        tracing::debug!(
            exit_status,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "remote command finished"
        );

        Ok(CommandOutput {
            exit_status,
            stdout,
            stderr,
        })
    }

    fn file_copy(&mut self) -> Result<Box<dyn FileCopy + '_>> {
        Ok(Box::new(ScpUpload {
            session: &self.session,
        }))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session
            .disconnect(None, "deploy finished", None)
            .map_err(|e| DeployError::connect(&self.endpoint, e))
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.session.disconnect(None, "Closing connection", None);
        }
    }
}

/// Read both streams of a non-blocking channel until `at_eof` reports the
/// remote side is done and nothing is left to read
fn drain_streams(
    stdout_src: &mut impl Read,
    stderr_src: &mut impl Read,
    at_eof: impl Fn() -> bool,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 32 * 1024];

    loop {
        let out_read = read_available(stdout_src, &mut buf, &mut stdout)?;
        let err_read = read_available(stderr_src, &mut buf, &mut stderr)?;

        if out_read == 0 && err_read == 0 {
            if at_eof() {
                return Ok((stdout, stderr));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Append whatever is buffered; `WouldBlock` counts as nothing read
fn read_available(
    reader: &mut impl Read,
    buf: &mut [u8],
    sink: &mut Vec<u8>,
) -> io::Result<usize> {
    match reader.read(buf) {
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

/// SCP uploads; each file travels on its own channel of the parent session
struct ScpUpload<'a> {
    session: &'a Session,
}

impl FileCopy for ScpUpload<'_> {
    fn put(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let transfer_err = |message: String| DeployError::Transfer {
            path: local.to_path_buf(),
            message,
        };

        let mut file = File::open(local).map_err(|e| transfer_err(e.to_string()))?;
        let size = file
            .metadata()
            .map_err(|e| transfer_err(e.to_string()))?
            .len();

        let mut channel = self
            .session
            .scp_send(Path::new(remote), 0o644, size, None)
            .map_err(|e| transfer_err(format!("scp to {} refused: {}", remote, e)))?;

        let sent = io::copy(&mut file, &mut channel).map_err(|e| transfer_err(e.to_string()))?;

        channel.send_eof().map_err(|e| transfer_err(e.to_string()))?;
        channel.wait_eof().map_err(|e| transfer_err(e.to_string()))?;
        channel.close().map_err(|e| transfer_err(e.to_string()))?;
        channel.wait_close().map_err(|e| transfer_err(e.to_string()))?;

        tracing::info!(local = %local.display(), remote, bytes = sent, "uploaded");
        Ok(sent)
    }
}
