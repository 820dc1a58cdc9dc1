//! Repository-specific error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while operating a tenant repository.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Failed to read directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Failed to serialize YAML: {0}")]
    SerializeYaml(String),

    #[error("Invalid resource in '{path}': {message}")]
    InvalidResource { path: PathBuf, message: String },

    #[error("Unknown resource kind: {0}")]
    UnknownKind(String),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceAlreadyExists { kind: String, name: String },

    #[error("Invalid tenant settings: {0}")]
    InvalidSettings(String),

    #[error("File operation failed: {0}")]
    FileOperation(String),

    #[error("Git operation failed: {0}")]
    GitOperation(String),

    #[error("Git network error: {0}")]
    GitNetworkError(String),

    #[error("Git merge conflict: {0}")]
    GitMergeConflict(String),

    #[error("Git authentication failed: {0}")]
    GitAuthFailed(String),

    #[error("Repository state is inconsistent: {0}")]
    InconsistentState(String),

    #[error("Branch '{0}' is not cloned locally")]
    BranchNotCloned(String),

    #[error("Branch '{0}' already exists")]
    BranchExists(String),

    #[error("Source branch '{0}' does not exist")]
    SourceBranchNotFound(String),
}

impl From<std::io::Error> for RepositoryError {
    fn from(err: std::io::Error) -> Self {
        RepositoryError::FileOperation(err.to_string())
    }
}

impl RepositoryError {
    /// Returns true if the error is likely transient and the next scheduled pass may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::GitNetworkError(_))
    }

    /// Returns true if the local clone must be recreated before retrying.
    pub fn is_inconsistent(&self) -> bool {
        matches!(
            self,
            RepositoryError::InconsistentState(_) | RepositoryError::GitMergeConflict(_)
        )
    }
}

/// Classifies a git stderr string into a more specific error variant.
pub fn classify_git_error(stderr: &str) -> RepositoryError {
    let lower = stderr.to_lowercase();

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return RepositoryError::GitNetworkError(stderr.trim().to_string());
    }

    if lower.contains("merge conflict") || (lower.contains("conflict") && lower.contains("merge")) {
        return RepositoryError::GitMergeConflict(stderr.trim().to_string());
    }

    if lower.contains("not possible to fast-forward")
        || lower.contains("diverging branches")
        || lower.contains("divergent branches")
    {
        return RepositoryError::InconsistentState(stderr.trim().to_string());
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
    {
        return RepositoryError::GitAuthFailed(stderr.trim().to_string());
    }

    RepositoryError::GitOperation(stderr.trim().to_string())
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_network_error() {
        let err = classify_git_error("fatal: unable to access 'https://example.com/': Could not resolve host");
        assert!(matches!(err, RepositoryError::GitNetworkError(_)));
        assert!(err.is_retryable());
        assert!(!err.is_inconsistent());
    }

    #[test]
    fn test_classify_diverged_history() {
        let err = classify_git_error("fatal: Not possible to fast-forward, aborting.");
        assert!(err.is_inconsistent());
    }

    #[test]
    fn test_classify_auth_error() {
        let err = classify_git_error("git@example.com: Permission denied (publickey).");
        assert!(matches!(err, RepositoryError::GitAuthFailed(_)));
    }

    #[test]
    fn test_classify_generic() {
        let err = classify_git_error("  fatal: something odd  ");
        match err {
            RepositoryError::GitOperation(msg) => assert_eq!(msg, "fatal: something odd"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
