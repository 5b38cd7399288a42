//! Diagnostic logging for deploy runs
//!
//! The deploy report is printed through [`crate::output::OutputWriter`];
//! everything emitted with `tracing` goes either to stderr or, with
//! `log_file` set, to a JSON-lines file that successive runs append to.

use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &DeployConfig) -> Result<()> {
    let filter = build_filter(effective_level(config))?;
    let log_file = config.log_file.as_deref().map(open_log_file).transpose()?;

    let stderr_layer = log_file.is_none().then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });
    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .json()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

pub fn effective_level(config: &DeployConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.log_level.into()
    }
}

fn build_filter(level: Level) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("backend_deploy={}", level)))
        .map_err(|e| DeployError::Config(format!("invalid log filter: {}", e)))
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            DeployError::Config(format!("cannot open log file {}: {}", path.display(), e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_effective_level() {
        let mut config = DeployConfig {
            log_level: LogLevel::Error,
            ..Default::default()
        };
        assert_eq!(effective_level(&config), Level::ERROR);

        config.verbose = true;
        assert_eq!(effective_level(&config), Level::DEBUG);
    }

    #[test]
    fn test_default_level_is_warn() {
        assert_eq!(effective_level(&DeployConfig::default()), Level::WARN);
    }

    #[test]
    fn test_build_filter() {
        assert!(build_filter(Level::INFO).is_ok());
    }

    #[test]
    fn test_log_file_is_appended() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deploy.log");
        std::fs::write(&path, "{\"previous\":true}\n").unwrap();

        let mut file = open_log_file(&path).unwrap();
        file.write_all(b"{\"next\":true}\n").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{\"previous\":true}\n{\"next\":true}\n");
    }

    #[test]
    fn test_log_file_in_missing_dir_is_config_error() {
        let dir = tempdir().unwrap();
        let err = open_log_file(&dir.path().join("nope").join("deploy.log")).unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }
}
