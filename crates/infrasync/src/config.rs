//! Manager configuration.
//!
//! The configuration is a single YAML document with camelCase keys. Any
//! `${VAR}` reference is replaced with the value of the environment variable
//! before parsing, so credentials and hosts can be injected at deploy time.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static RE_ENV_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Errors raised while loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Environment variable '{0}' referenced in config is not set")]
    MissingEnvVar(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration of the reconciliation manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManagerConfig {
    pub git: GitConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub behaviour: BehaviourConfig,
}

/// Remote repository and local clone settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitConfig {
    /// URL of the remote repository holding one branch per tenant.
    pub remote_repository: String,

    /// Directory under which each tenant branch gets its own clone.
    pub local_repository_root: PathBuf,

    #[serde(default)]
    pub auth: GitAuth,

    /// Skip SSH host key verification entirely.
    #[serde(default)]
    pub ignore_insecure_hosts: bool,

    #[serde(default = "default_user_name")]
    pub user_name: String,

    #[serde(default = "default_user_email")]
    pub user_email: String,
}

fn default_user_name() -> String {
    "infrasync".to_string()
}

fn default_user_email() -> String {
    "infrasync@localhost".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitAuthType {
    #[default]
    None,
    /// HTTPS personal access token.
    Token,
    /// HTTPS username and password.
    Basic,
    SshKey,
}

/// Git credentials. Secret material is resolved lazily when git is invoked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitAuth {
    #[serde(rename = "type", default)]
    pub auth_type: GitAuthType,

    #[serde(default)]
    pub username: String,

    /// Token or password given inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env_var: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterConfig {
    /// Prepended to the tenant name to form its namespace.
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
}

fn default_namespace_prefix() -> String {
    "ns-".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: default_namespace_prefix(),
        }
    }
}

impl ClusterConfig {
    pub fn namespace_for(&self, tenant: &str) -> String {
        format!("{}{}", self.namespace_prefix, tenant)
    }

    /// Inverse of [`namespace_for`](Self::namespace_for).
    pub fn tenant_for<'a>(&self, namespace: &'a str) -> Option<&'a str> {
        namespace
            .strip_prefix(self.namespace_prefix.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// Tunables for the scheduling components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BehaviourConfig {
    pub sync_workers: usize,
    pub fetch_interval_secs: u64,
    pub recovery_delay_secs: u64,
    /// Branch new tenants are created from. Never treated as a tenant.
    pub template_branch: String,
    pub event_cache_capacity: usize,
    pub event_channel_capacity: usize,
}

impl Default for BehaviourConfig {
    fn default() -> Self {
        Self {
            sync_workers: 3,
            fetch_interval_secs: 14,
            recovery_delay_secs: 60,
            template_branch: "master".to_string(),
            event_cache_capacity: 512,
            event_channel_capacity: 1024,
        }
    }
}

impl ManagerConfig {
    /// Rejects values the rest of the system cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.git.remote_repository.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "git.remoteRepository must not be empty".to_string(),
            ));
        }
        if self.behaviour.sync_workers == 0 {
            return Err(ConfigError::Invalid(
                "behaviour.syncWorkers must be at least 1".to_string(),
            ));
        }
        if self.behaviour.event_cache_capacity == 0 || self.behaviour.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event capacities must be at least 1".to_string(),
            ));
        }
        if self.behaviour.template_branch.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "behaviour.templateBranch must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Replaces every `${VAR}` with the variable's value.
pub fn substitute_env_vars(raw: &str) -> Result<String> {
    let mut missing = None;
    let substituted = RE_ENV_REFERENCE.replace_all(raw, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(substituted.into_owned()),
    }
}

/// Parses and validates a configuration document.
pub fn load_config_from_str(raw: &str) -> Result<ManagerConfig> {
    let substituted = substitute_env_vars(raw)?;
    let config: ManagerConfig =
        serde_yaml::from_str(&substituted).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Reads, parses and validates the configuration file at `path`.
pub fn load_config(path: impl AsRef<Path>) -> Result<ManagerConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Loading configuration from {}", path.display());
    load_config_from_str(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const MINIMAL: &str = r#"
git:
  remoteRepository: https://git.example.com/infra.git
  localRepositoryRoot: /var/lib/infrasync
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(config.git.auth.auth_type, GitAuthType::None);
        assert_eq!(config.cluster.namespace_prefix, "ns-");
        assert_eq!(config.behaviour.sync_workers, 3);
        assert_eq!(config.behaviour.fetch_interval_secs, 14);
        assert_eq!(config.behaviour.recovery_delay_secs, 60);
        assert_eq!(config.behaviour.template_branch, "master");
        assert_eq!(config.behaviour.event_cache_capacity, 512);
    }

    #[test]
    fn test_full_config() {
        let raw = r#"
git:
  remoteRepository: git@git.example.com:infra.git
  localRepositoryRoot: /tmp/clones
  ignoreInsecureHosts: true
  auth:
    type: ssh-key
    sshKeyPath: ~/.ssh/deploy
cluster:
  namespacePrefix: th2-
behaviour:
  syncWorkers: 5
  templateBranch: template
"#;
        let config = load_config_from_str(raw).unwrap();
        assert_eq!(config.git.auth.auth_type, GitAuthType::SshKey);
        assert_eq!(config.git.auth.ssh_key_path.as_deref(), Some("~/.ssh/deploy"));
        assert!(config.git.ignore_insecure_hosts);
        assert_eq!(config.cluster.namespace_for("alpha"), "th2-alpha");
        assert_eq!(config.behaviour.sync_workers, 5);
        assert_eq!(config.behaviour.recovery_delay_secs, 60);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = format!("{MINIMAL}unexpected: true\n");
        assert!(matches!(
            load_config_from_str(&raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let raw = format!("{MINIMAL}behaviour:\n  syncWorkers: 0\n");
        assert!(matches!(
            load_config_from_str(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    #[serial]
    fn test_env_substitution() {
        std::env::set_var("INFRASYNC_TEST_REMOTE", "https://git.example.com/from-env.git");
        let raw = r#"
git:
  remoteRepository: ${INFRASYNC_TEST_REMOTE}
  localRepositoryRoot: /tmp/x
"#;
        let config = load_config_from_str(raw).unwrap();
        assert_eq!(
            config.git.remote_repository,
            "https://git.example.com/from-env.git"
        );
        std::env::remove_var("INFRASYNC_TEST_REMOTE");
    }

    #[test]
    #[serial]
    fn test_missing_env_var() {
        std::env::remove_var("INFRASYNC_TEST_MISSING");
        let err = substitute_env_vars("token: ${INFRASYNC_TEST_MISSING}").unwrap_err();
        match err {
            ConfigError::MissingEnvVar(name) => assert_eq!(name, "INFRASYNC_TEST_MISSING"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_tenant_for_namespace() {
        let cluster = ClusterConfig::default();
        assert_eq!(cluster.tenant_for("ns-alpha"), Some("alpha"));
        assert_eq!(cluster.tenant_for("ns-"), None);
        assert_eq!(cluster.tenant_for("kube-system"), None);
    }
}
