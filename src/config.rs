/*!
 * Configuration types for backend-deploy
 *
 * Loaded from a TOML file and then overridden from the command line and
 * environment. Nothing here carries a built-in host or credential.
 */

use crate::error::{DeployError, Result};
use crate::transport::ssh::SshAuth;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration for a deploy run
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployConfig {
    /// Threshold for diagnostics on stderr or in the log file; the console
/// report of a run is printed regardless
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    /// Adds connection, upload and command milestones
    Info,
    /// Adds host keys, byte counts and per-address connect attempts
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_backend_dir() -> PathBuf {
    PathBuf::from("./бекенд")
}

fn default_entry_file() -> String {
    "index.js".to_string()
}

fn default_manifest_file() -> String {
    "package.json".to_string()
}

fn default_remote_dir() -> String {
    "/root/messenger/backend".to_string()
}

fn default_service_name() -> String {
    "messenger-backend".to_string()
}

fn default_packages() -> Vec<String> {
    [
        "express",
        "socket.io",
        "sqlite3",
        "sqlite",
        "jsonwebtoken",
        "cors",
        "multer",
        "sms_ru",
        "bcrypt",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

fn default_settle_secs() -> u64 {
    2
}

fn default_log_lines() -> u32 {
    10
}

impl DeployConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| DeployError::Config(e.to_string()))
    }

    /// Check the fields a deploy run cannot do without
    ///
    /// Credentials are checked separately through [`TargetConfig::auth`] so
    /// that a dry run works without them.
    pub fn validate(&self) -> Result<()> {
        if self.target.host.trim().is_empty() {
            return Err(DeployError::Config("target host is required".to_string()));
        }
        if self.target.username.trim().is_empty() {
            return Err(DeployError::Config("target username is required".to_string()));
        }
        if self.target.port == 0 {
            return Err(DeployError::Config("target port must be non-zero".to_string()));
        }
        if self.target.timeout_secs == 0 {
            return Err(DeployError::Config(
                "connection timeout must be at least one second".to_string(),
            ));
        }
        if self.app.service_name.trim().is_empty() {
            return Err(DeployError::Config("service name is required".to_string()));
        }
        if !self.app.remote_dir.starts_with('/') {
            return Err(DeployError::Config(format!(
                "remote directory must be absolute: {}",
                self.app.remote_dir
            )));
        }
        for name in [&self.app.entry_file, &self.app.manifest_file] {
            if name.is_empty() || name.contains('/') {
                return Err(DeployError::Config(format!(
                    "invalid file name: {:?}",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn valid_config() -> DeployConfig {
        let mut config = DeployConfig::default();
        config.target.host = "203.0.113.10".to_string();
        config.target.username = "deploy".to_string();
        config.target.password = Some(SecretString::from("hunter2".to_string()));
        config
    }

    #[test]
    fn test_default_config() {
        let config = DeployConfig::default();
        assert_eq!(config.target.port, 22);
        assert_eq!(config.target.timeout_secs, 30);
        assert_eq!(config.app.remote_dir, "/root/messenger/backend");
        assert_eq!(config.app.service_name, "messenger-backend");
        assert_eq!(config.app.packages.len(), 9);
        assert_eq!(config.app.packages[1], "socket.io");
        assert_eq!(config.host_key.policy, HostKeyPolicy::Strict);
        assert!(config.target.host.is_empty());
    }

    #[test]
    fn test_paths() {
        let mut app = AppConfig::default();
        app.backend_dir = PathBuf::from("/srv/app");
        app.remote_dir = "/opt/app/".to_string();

        assert_eq!(app.local_entry(), PathBuf::from("/srv/app/index.js"));
        assert_eq!(app.local_manifest(), PathBuf::from("/srv/app/package.json"));
        assert_eq!(app.remote_entry(), "/opt/app/index.js");
        assert_eq!(app.remote_manifest(), "/opt/app/package.json");
    }

    #[test]
    fn test_from_toml() {
        let toml_str = r#"
            log_level = "debug"

            [target]
            host = "deploy.example.com"
            port = 2222
            username = "node"
            identity_file = "/home/node/.ssh/id_ed25519"

            [app]
            backend_dir = "./server"
            service_name = "chat"
            packages = ["express", "cors"]

            [host_key]
            policy = "accept-new"
            known_hosts = "/tmp/known_hosts"
        "#;

        let config = DeployConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.target.host, "deploy.example.com");
        assert_eq!(config.target.port, 2222);
        assert_eq!(config.target.timeout_secs, 30);
        assert_eq!(config.app.service_name, "chat");
        assert_eq!(config.app.packages, vec!["express", "cors"]);
        assert_eq!(config.app.entry_file, "index.js");
        assert_eq!(config.host_key.policy, HostKeyPolicy::AcceptNew);
        assert!(matches!(config.target.auth().unwrap(), SshAuth::KeyFile { .. }));
    }

    #[test]
    fn test_example_config_parses() {
        let config = DeployConfig::from_toml(include_str!("../deploy.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.app.packages, DeployConfig::default().app.packages);
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_insecure_policy_name() {
        let config = DeployConfig::from_toml(
            r#"
            [host_key]
            policy = "insecure-accept-any"
            "#,
        )
        .unwrap();
        assert_eq!(config.host_key.policy, HostKeyPolicy::InsecureAcceptAny);
    }

    #[test]
    fn test_invalid_toml() {
        let err = DeployConfig::from_toml("[target]\nport = \"ssh\"").unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn test_validate() {
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.target.host = String::new();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.target.password = None;
        assert!(config.validate().is_ok());
        assert!(config.target.auth().is_err());

        let mut config = valid_config();
        config.app.remote_dir = "relative/dir".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.app.entry_file = "../index.js".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auth_precedence() {
        let mut target = valid_config().target;
        match target.auth().unwrap() {
            SshAuth::Password(password) => assert_eq!(password.expose_secret(), "hunter2"),
            other => panic!("expected password auth, got {:?}", other),
        }

        target.agent = true;
        assert!(matches!(target.auth().unwrap(), SshAuth::Agent));

        target.identity_file = Some(PathBuf::from("/keys/id_rsa"));
        assert!(matches!(target.auth().unwrap(), SshAuth::KeyFile { .. }));
    }

    #[test]
    fn test_known_hosts_override() {
        let config = HostKeyConfig {
            known_hosts: Some(PathBuf::from("/etc/ssh/ssh_known_hosts")),
            ..Default::default()
        };
        assert_eq!(
            config.known_hosts_path().unwrap(),
            PathBuf::from("/etc/ssh/ssh_known_hosts")
        );
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
        assert_eq!(tracing::Level::from(LogLevel::Warn), tracing::Level::WARN);
        assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
    }
}
