/*!
 * backend-deploy - push a Node.js backend to a host and restart it under pm2
 *
 * - Local precondition checks before any network traffic
 * - SSH session with caller-supplied host key verification
 * - SCP upload of the entry point and dependency manifest
 * - One `&&`-chained remote script: npm install, pm2 restart, status and logs
 */

pub mod config;
pub mod deploy;
pub mod error;
pub mod host_key;
pub mod logging;
pub mod output;
pub mod script;
pub mod transport;

// Re-export commonly used types
pub use config::{AppConfig, DeployConfig, HostKeyPolicy, TargetConfig};
pub use deploy::{DeployOutcome, Deployer};
pub use error::{DeployError, Result};
pub use output::OutputWriter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
