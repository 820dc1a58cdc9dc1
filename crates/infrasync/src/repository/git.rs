//! Thin wrapper around the `git` binary.

use std::path::Path;
use std::process::{Command, Output};

use super::auth::build_auth_env;
use super::error::{classify_git_error, RepositoryError, Result};
use super::parse::format_git_error;
use crate::config::GitConfig;

/// Runs git commands with the configured identity and credentials.
#[derive(Debug, Clone)]
pub(crate) struct GitRunner {
    config: GitConfig,
}

impl GitRunner {
    pub fn new(config: GitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    /// Runs a local command and returns its output regardless of exit status.
    pub fn output(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .current_dir(dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| RepositoryError::GitOperation(e.to_string()))
    }

    /// Runs a local command, failing on non-zero exit.
    pub fn run(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let output = self.output(dir, args)?;
        check(output)
    }

    /// Runs a command that talks to the remote, returning output regardless of exit status.
    pub fn remote_output(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let auth = build_auth_env(&self.config.auth, self.config.ignore_insecure_hosts)?;

        let mut cmd = Command::new("git");
        cmd.current_dir(dir).args(args).env("GIT_TERMINAL_PROMPT", "0");
        for (key, value) in &auth.env_vars {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .map_err(|e| RepositoryError::GitOperation(e.to_string()))?;

        // The askpass script is removed only after git has exited.
        drop(auth);
        Ok(output)
    }

    /// Runs a command that talks to the remote, failing on non-zero exit.
    pub fn run_remote(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let output = self.remote_output(dir, args)?;
        check(output)
    }

    /// Commits staged changes using the configured identity.
    pub fn commit(&self, dir: &Path, message: &str) -> Result<Output> {
        let name = format!("user.name={}", self.config.user_name);
        let email = format!("user.email={}", self.config.user_email);
        self.run(dir, &["-c", &name, "-c", &email, "commit", "-q", "-m", message])
    }

    pub fn head(&self, dir: &Path) -> Result<String> {
        let output = self.run(dir, &["rev-parse", "HEAD"])?;
        Ok(stdout(&output))
    }
}

pub(crate) fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn check(output: Output) -> Result<Output> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(classify_git_error(&format_git_error(&output)))
    }
}
