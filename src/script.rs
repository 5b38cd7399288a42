//! Remote command script generation

use crate::config::AppConfig;
use std::fmt;

/// Ordered shell fragments run as one `&&` chain
///
/// Any failing fragment stops the rest of the chain and leaves a non-zero
/// exit status, except where a fragment itself carries `|| true`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandScript {
    steps: Vec<String>,
}

impl CommandScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment built from words, quoting each one as needed
    pub fn command<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let line = words
            .into_iter()
            .map(|w| shell_quote(w.as_ref()))
            .collect::<Vec<_>>()
            .join(" ");
        self.steps.push(line);
        self
    }

    /// Append a fragment verbatim
    pub fn raw(mut self, fragment: impl Into<String>) -> Self {
        self.steps.push(fragment.into());
        self
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn render(&self) -> String {
        self.steps.join(" && ")
    }
}

impl fmt::Display for CommandScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// `mkdir -p` for the upload directory
pub fn mkdir_command(remote_dir: &str) -> String {
    format!("mkdir -p {}", shell_quote(remote_dir))
}

/// Install, restart and report script for the uploaded backend
pub fn deploy_script(app: &AppConfig) -> CommandScript {
    let service = shell_quote(&app.service_name);

    CommandScript::new()
        .command(["cd", app.remote_dir.as_str()])
        .command(
            ["npm", "install"]
                .into_iter()
                .chain(app.packages.iter().map(String::as_str)),
        )
        .raw(format!("pm2 delete {} || true", service))
        .command([
            "pm2",
            "start",
            app.entry_file.as_str(),
            "--name",
            app.service_name.as_str(),
        ])
        .command(["pm2", "save"])
        .command(["sleep".to_string(), app.settle_secs.to_string()])
        .command(["pm2", "status"])
        .command([
            "pm2".to_string(),
            "logs".to_string(),
            app.service_name.clone(),
            "--lines".to_string(),
            app.log_lines.to_string(),
            "--nostream".to_string(),
        ])
}

/// Quote a word for POSIX sh when it contains anything outside a safe set
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./@:=+,%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_script_matches_expected_chain() {
        let script = deploy_script(&AppConfig::default());
        assert_eq!(
            script.render(),
            "cd /root/messenger/backend \
             && npm install express socket.io sqlite3 sqlite jsonwebtoken cors multer sms_ru bcrypt \
             && pm2 delete messenger-backend || true \
             && pm2 start index.js --name messenger-backend \
             && pm2 save \
             && sleep 2 \
             && pm2 status \
             && pm2 logs messenger-backend --lines 10 --nostream"
        );
        assert_eq!(script.steps().len(), 8);
    }

    #[test]
    fn test_script_follows_config() {
        let app = AppConfig {
            remote_dir: "/srv/my app".to_string(),
            service_name: "chat".to_string(),
            packages: vec!["express@4".to_string()],
            settle_secs: 5,
            log_lines: 50,
            ..Default::default()
        };
        let script = deploy_script(&app);
        assert_eq!(script.steps()[0], "cd '/srv/my app'");
        assert_eq!(script.steps()[1], "npm install express@4");
        assert_eq!(script.steps()[2], "pm2 delete chat || true");
        assert_eq!(script.steps()[5], "sleep 5");
        assert_eq!(script.steps()[7], "pm2 logs chat --lines 50 --nostream");
    }

    #[test]
    fn test_empty_package_list_installs_from_manifest() {
        let app = AppConfig {
            packages: Vec::new(),
            ..Default::default()
        };
        assert_eq!(deploy_script(&app).steps()[1], "npm install");
    }

    #[test]
    fn test_mkdir_command() {
        assert_eq!(
            mkdir_command("/root/messenger/backend"),
            "mkdir -p /root/messenger/backend"
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("simple"), "simple");
        assert_eq!(shell_quote("socket.io"), "socket.io");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("a;rm -rf /"), "'a;rm -rf /'");
        assert_eq!(shell_quote(""), "''");
    }
}
