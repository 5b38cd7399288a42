/*!
 * backend-deploy CLI
 *
 * Uploads the backend entry point and manifest over SCP and restarts the
 * service under pm2. Host and credentials come from a config file, flags or
 * DEPLOY_* environment variables.
 */

use backend_deploy::{
    config::{DeployConfig, HostKeyPolicy, LogLevel},
    error::{Result, EXIT_SUCCESS},
    host_key, logging,
    transport::SshConnector,
    Deployer, OutputWriter,
};
use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "backend-deploy")]
#[command(version, about = "Upload a Node.js backend over SSH and restart it under pm2", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Remote host name or address
    #[arg(long, env = "DEPLOY_HOST")]
    host: Option<String>,

    /// SSH port
    #[arg(short = 'p', long, env = "DEPLOY_PORT")]
    port: Option<u16>,

    /// SSH user
    #[arg(short = 'u', long = "user", env = "DEPLOY_USER")]
    user: Option<String>,

    /// SSH password (prefer the environment variable over the flag)
    #[arg(long, env = "DEPLOY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key file
    #[arg(short = 'i', long, env = "DEPLOY_IDENTITY", value_name = "FILE")]
    identity: Option<PathBuf>,

    /// Authenticate with the running SSH agent
    #[arg(long)]
    agent: bool,

    /// Local directory containing the backend files
    #[arg(long, value_name = "DIR")]
    backend_dir: Option<PathBuf>,

    /// Remote directory receiving the files
    #[arg(long, value_name = "DIR")]
    remote_dir: Option<String>,

    /// pm2 process name
    #[arg(long)]
    service_name: Option<String>,

    /// How to treat unknown or changed host keys
    #[arg(long, value_enum)]
    host_key_policy: Option<HostKeyPolicyArg>,

    /// known_hosts file (default: ~/.ssh/known_hosts)
    #[arg(long, value_name = "FILE")]
    known_hosts: Option<PathBuf>,

    /// Accept only this host key fingerprint (SHA256:...)
    #[arg(long, value_name = "FINGERPRINT")]
    fingerprint: Option<String>,

    /// Connection timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Print the plan and the remote command without connecting
    #[arg(long)]
    dry_run: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Log level
    #[arg(long, value_enum)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stderr
    #[arg(long = "log", value_name = "FILE")]
    log: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum HostKeyPolicyArg {
    Strict,
    AcceptNew,
    InsecureAcceptAny,
}

impl From<HostKeyPolicyArg> for HostKeyPolicy {
    fn from(arg: HostKeyPolicyArg) -> Self {
        match arg {
            HostKeyPolicyArg::Strict => HostKeyPolicy::Strict,
            HostKeyPolicyArg::AcceptNew => HostKeyPolicy::AcceptNew,
            HostKeyPolicyArg::InsecureAcceptAny => HostKeyPolicy::InsecureAcceptAny,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => DeployConfig::from_file(path)?,
        None => DeployConfig::default(),
    };
    let dry_run = cli.dry_run;
    let color = !cli.no_color && console::colors_enabled();
    apply_overrides(&mut config, cli);

    if let Err(e) = logging::init_logging(&config) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    config.validate()?;
    if !dry_run {
        config.target.auth()?;
    }
    let verifier = host_key::verifier_from_config(&config.host_key)?;

    let stdout = std::io::stdout();
    let mut out = OutputWriter::new(stdout.lock(), color);
    let deployer = Deployer::new(config, SshConnector::new(), verifier);

    let outcome = if dry_run {
        deployer.plan(&mut out)
    } else {
        deployer.run(&mut out)
    };
    tracing::debug!(?outcome, success = outcome.is_success(), "run finished");

    // The outcome has already been reported on the console; a finished run
    // exits 0 either way.
    Ok(())
}

/// Command line and environment values win over the config file
fn apply_overrides(config: &mut DeployConfig, cli: Cli) {
    let target = &mut config.target;
    if let Some(host) = cli.host {
        target.host = host;
    }
    if let Some(port) = cli.port {
        target.port = port;
    }
    if let Some(user) = cli.user {
        target.username = user;
    }
    if let Some(password) = cli.password {
        target.password = Some(SecretString::from(password));
    }
    if let Some(identity) = cli.identity {
        target.identity_file = Some(identity);
    }
    if cli.agent {
        target.agent = true;
    }
    if let Some(timeout) = cli.timeout {
        target.timeout_secs = timeout;
    }

    let app = &mut config.app;
    if let Some(dir) = cli.backend_dir {
        app.backend_dir = dir;
    }
    if let Some(dir) = cli.remote_dir {
        app.remote_dir = dir;
    }
    if let Some(name) = cli.service_name {
        app.service_name = name;
    }

    let host_key = &mut config.host_key;
    if let Some(policy) = cli.host_key_policy {
        host_key.policy = policy.into();
    }
    if let Some(path) = cli.known_hosts {
        host_key.known_hosts = Some(path);
    }
    if let Some(fingerprint) = cli.fingerprint {
        host_key.fingerprint = Some(fingerprint);
    }

    if let Some(level) = cli.log_level {
        config.log_level = level.into();
    }
    if cli.log.is_some() {
        config.log_file = cli.log;
    }
    config.verbose |= cli.verbose;
}
