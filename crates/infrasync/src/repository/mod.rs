//! Versioned repository: one remote, one branch and one local clone per tenant.

use std::collections::BTreeMap;

pub mod auth;
pub mod context;
pub mod error;
mod git;
pub mod parse;
pub mod tenant;

pub use context::RepositoryContext;
pub use error::{RepositoryError, Result};
pub use tenant::{RepositoryGuard, TenantRepository};

/// Enumerates tenant branches on the remote.
pub trait BranchSource: Send + Sync {
    /// Branch name to head commit for every branch on the remote.
    fn branch_commits(&self) -> Result<BTreeMap<String, String>>;

    /// Releases local state held for a branch that no longer exists.
    fn forget_branch(&self, tenant: &str);
}
