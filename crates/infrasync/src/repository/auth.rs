//! Git authentication handling.

use std::path::PathBuf;

use secrecy::ExposeSecret;

use super::error::{RepositoryError, Result};
use crate::config::{GitAuth, GitAuthType};
use crate::secrets::{expand_home, resolve_secret};

/// Escapes a value for use inside a single-quoted shell string.
pub fn shell_escape(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Deletes the askpass script when dropped so credentials never outlive
/// the git command that needed them.
#[derive(Debug)]
pub struct AskpassCleanup {
    path: Option<PathBuf>,
}

impl AskpassCleanup {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn empty() -> Self {
        Self { path: None }
    }
}

impl Drop for AskpassCleanup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to clean up askpass script: {}", e);
            }
        }
    }
}

/// Environment to apply to a git invocation.
#[derive(Debug)]
pub struct AuthEnv {
    pub env_vars: Vec<(String, String)>,
    /// Must outlive the git command.
    pub _cleanup: AskpassCleanup,
}

impl AuthEnv {
    fn plain(env_vars: Vec<(String, String)>) -> Self {
        Self {
            env_vars,
            _cleanup: AskpassCleanup::empty(),
        }
    }
}

/// Builds the git environment for the configured credentials.
pub fn build_auth_env(auth: &GitAuth, ignore_insecure_hosts: bool) -> Result<AuthEnv> {
    match auth.auth_type {
        GitAuthType::None => Ok(AuthEnv::plain(Vec::new())),
        GitAuthType::Token | GitAuthType::Basic => {
            let secret = resolve_secret(
                auth.token.as_deref(),
                auth.token_file.as_deref(),
                auth.token_env_var.as_deref(),
            )
            .map_err(|e| {
                RepositoryError::GitAuthFailed(format!(
                    "Failed to resolve git credential: {}. Configure token, tokenFile, or tokenEnvVar.",
                    e
                ))
            })?;

            let password = shell_escape(secret.expose_secret());
            let script = if auth.auth_type == GitAuthType::Basic {
                if auth.username.is_empty() {
                    return Err(RepositoryError::GitAuthFailed(
                        "Basic authentication requires a username".to_string(),
                    ));
                }
                format!(
                    "#!/bin/sh\ncase \"$1\" in\n  Username*) echo '{}' ;;\n  *) echo '{}' ;;\nesac\n",
                    shell_escape(&auth.username),
                    password
                )
            } else {
                format!("#!/bin/sh\necho '{}'\n", password)
            };

            write_askpass(&script)
        }
        GitAuthType::SshKey => {
            let key_path = match auth.ssh_key_path.as_deref().filter(|p| !p.is_empty()) {
                Some(path) => PathBuf::from(expand_home(path)),
                None => dirs::home_dir()
                    .map(|h| h.join(".ssh").join("id_ed25519"))
                    .unwrap_or_else(|| PathBuf::from(".ssh/id_ed25519")),
            };

            if !key_path.exists() {
                return Err(RepositoryError::GitAuthFailed(format!(
                    "SSH key file not found: {}",
                    key_path.display()
                )));
            }

            let escaped = shell_escape(&key_path.display().to_string());
            let safe_path = if escaped.starts_with('-') {
                format!("'./{}'", escaped)
            } else {
                format!("'{}'", escaped)
            };
            let host_checking = if ignore_insecure_hosts {
                "no"
            } else {
                "accept-new"
            };

            Ok(AuthEnv::plain(vec![(
                "GIT_SSH_COMMAND".to_string(),
                format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking={}",
                    safe_path, host_checking
                ),
            )]))
        }
    }
}

fn write_askpass(script: &str) -> Result<AuthEnv> {
    let askpass_path = std::env::temp_dir().join(format!(
        ".infrasync-askpass-{}.sh",
        uuid::Uuid::new_v4()
    ));

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o700)
            .open(&askpass_path)?;
        std::io::Write::write_all(&mut file, script.as_bytes())?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(&askpass_path, script)?;
    }

    let cleanup = AskpassCleanup::new(askpass_path.clone());
    let askpass = askpass_path
        .to_str()
        .ok_or_else(|| {
            RepositoryError::GitAuthFailed(
                "Temp directory path contains non-UTF8 characters".to_string(),
            )
        })?
        .to_string();

    Ok(AuthEnv {
        env_vars: vec![
            ("GIT_ASKPASS".to_string(), askpass),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ],
        _cleanup: cleanup,
    })
}
