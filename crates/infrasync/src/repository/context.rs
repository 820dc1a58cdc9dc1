//! One remote repository and the tenant clones derived from it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::error::{RepositoryError, Result};
use super::git::{stdout, GitRunner};
use super::parse::parse_ls_remote_heads;
use super::tenant::TenantRepository;
use super::BranchSource;
use crate::config::GitConfig;
use crate::snapshot::{get_snapshot, RepositorySnapshot, SnapshotSource};

/// Owns the per-tenant handles for one remote repository configuration.
///
/// `handle` returns the same instance for a tenant for the lifetime of the
/// context, so all callers share one clone and one lock.
pub struct RepositoryContext {
    git: GitRunner,
    root: PathBuf,
    handles: Mutex<HashMap<String, Arc<TenantRepository>>>,
}

impl RepositoryContext {
    pub fn new(config: GitConfig) -> Self {
        let root = std::path::absolute(&config.local_repository_root)
            .unwrap_or_else(|_| config.local_repository_root.clone());
        Self {
            git: GitRunner::new(config),
            root,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GitConfig {
        self.git.config()
    }

    /// Directory holding one clone per tenant.
    pub fn local_root(&self) -> &Path {
        &self.root
    }

    pub fn handle(&self, tenant: &str) -> Arc<TenantRepository> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .entry(tenant.to_string())
            .or_insert_with(|| {
                Arc::new(TenantRepository::new(
                    tenant,
                    self.root.join(tenant),
                    self.git.clone(),
                ))
            })
            .clone()
    }

    /// Deletes the clone of a tenant whose branch is gone.
    ///
    /// The clone is removed while holding the tenant lock. The handle is
    /// dropped afterwards only when nobody else references it, so every
    /// caller of [`handle`](Self::handle) keeps sharing a single lock.
    pub fn forget(&self, tenant: &str) {
        let handle = self.handle(tenant);
        let guard = handle.lock();

        if handle.path().exists() {
            if let Err(e) = fs::remove_dir_all(handle.path()) {
                log::warn!("Failed to delete clone of '{}': {}", tenant, e);
            }
        }

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        let unshared = handles
            .get(tenant)
            .is_some_and(|h| Arc::ptr_eq(h, &handle) && Arc::strong_count(h) == 2);
        if unshared {
            handles.remove(tenant);
        }
        drop(handles);
        drop(guard);
    }

    /// Remote branch heads, without needing any local clone.
    pub fn list_branch_commits(&self) -> Result<BTreeMap<String, String>> {
        fs::create_dir_all(&self.root).map_err(|e| RepositoryError::WriteFile {
            path: self.root.clone(),
            source: e,
        })?;
        let remote = self.config().remote_repository.clone();
        let output = self
            .git
            .run_remote(&self.root, &["ls-remote", "--heads", &remote])?;
        Ok(parse_ls_remote_heads(&stdout(&output)))
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        Ok(self.list_branch_commits()?.into_keys().collect())
    }
}

impl SnapshotSource for RepositoryContext {
    /// Loads the tenant's snapshot, recreating the clone once if it diverged.
    fn snapshot(&self, tenant: &str) -> Result<RepositorySnapshot> {
        let handle = self.handle(tenant);
        let mut guard = handle.lock();
        match get_snapshot(&mut guard) {
            Err(e) if e.is_inconsistent() => {
                log::warn!("Clone of '{}' is inconsistent ({}), recreating", tenant, e);
                guard.recreate_cache()?;
                get_snapshot(&mut guard)
            }
            other => other,
        }
    }
}

impl BranchSource for RepositoryContext {
    fn branch_commits(&self) -> Result<BTreeMap<String, String>> {
        self.list_branch_commits()
    }

    fn forget_branch(&self, tenant: &str) {
        self.forget(tenant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(root: &Path) -> RepositoryContext {
        RepositoryContext::new(GitConfig {
            remote_repository: "file:///nonexistent".to_string(),
            local_repository_root: root.to_path_buf(),
            auth: Default::default(),
            ignore_insecure_hosts: false,
            user_name: "t".to_string(),
            user_email: "t@localhost".to_string(),
        })
    }

    #[test]
    fn test_handle_is_singleton_per_tenant() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let a = ctx.handle("alpha");
        let b = ctx.handle("alpha");
        let c = ctx.handle("beta");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.path(), ctx.local_root().join("alpha"));
    }

    #[test]
    fn test_forget_deletes_clone_and_handle() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let path = ctx.handle("alpha").path().to_path_buf();
        fs::create_dir_all(path.join("boxes")).unwrap();

        ctx.forget("alpha");
        assert!(!path.exists());
        assert!(ctx.handles.lock().unwrap().is_empty());
    }

    #[test]
    fn test_forget_keeps_handle_that_is_still_shared() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let held = ctx.handle("alpha");
        fs::create_dir_all(held.path().join("boxes")).unwrap();

        ctx.forget("alpha");
        assert!(!held.path().exists());
        assert!(Arc::ptr_eq(&held, &ctx.handle("alpha")));
    }

    #[test]
    fn test_forget_waits_for_tenant_lock() {
        let dir = TempDir::new().unwrap();
        let ctx = Arc::new(context(dir.path()));
        let handle = ctx.handle("alpha");
        fs::create_dir_all(handle.path().join("boxes")).unwrap();

        let guard = handle.lock();
        let forgetting = {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || ctx.forget("alpha"))
        };
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(handle.path().exists());

        drop(guard);
        forgetting.join().unwrap();
        assert!(!handle.path().exists());
    }
}
