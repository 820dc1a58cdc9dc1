//! Per-tenant local clone with its mutual-exclusion lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::error::{RepositoryError, Result};
use super::git::{stdout, GitRunner};
use super::parse::{format_git_error, is_clean_status, is_push_rejected, parse_ls_remote_heads};
use crate::snapshot::loader::SnapshotLoader;
use crate::snapshot::resource::{RepositoryResource, ResourceKind};

/// The local clone of one tenant branch.
///
/// Obtain it through [`RepositoryContext::handle`](super::RepositoryContext::handle);
/// every operation requires holding the lock via [`TenantRepository::lock`].
pub struct TenantRepository {
    tenant: String,
    path: PathBuf,
    git: GitRunner,
    lock: Mutex<()>,
}

impl std::fmt::Debug for TenantRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRepository")
            .field("tenant", &self.tenant)
            .field("path", &self.path)
            .finish()
    }
}

impl TenantRepository {
    pub(crate) fn new(tenant: impl Into<String>, path: PathBuf, git: GitRunner) -> Self {
        Self {
            tenant: tenant.into(),
            path,
            git,
            lock: Mutex::new(()),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Directory of the local clone.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until this tenant's repository is exclusively held.
    /// The lock is released when the guard is dropped.
    pub fn lock(&self) -> RepositoryGuard<'_> {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        RepositoryGuard {
            repo: self,
            _guard: guard,
        }
    }

    fn is_cloned(&self) -> bool {
        self.path.join(".git").exists()
    }

    fn parent_dir(&self) -> Result<PathBuf> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).map_err(|e| RepositoryError::WriteFile {
            path: parent.clone(),
            source: e,
        })?;
        Ok(parent)
    }

    fn delete_clone(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_dir_all(&self.path).map_err(|e| RepositoryError::WriteFile {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    fn clone_branch(&self, branch: &str) -> Result<()> {
        let parent = self.parent_dir()?;
        let target = self.path.to_string_lossy().into_owned();
        let remote = self.git.config().remote_repository.clone();
        self.git.run_remote(
            &parent,
            &["clone", "-q", "--branch", branch, "--single-branch", &remote, &target],
        )?;
        Ok(())
    }
}

/// Exclusive access to a tenant repository.
///
/// Hold it across the whole checkout, mutate, commit sequence.
pub struct RepositoryGuard<'a> {
    repo: &'a TenantRepository,
    _guard: MutexGuard<'a, ()>,
}

impl RepositoryGuard<'_> {
    pub fn tenant(&self) -> &str {
        &self.repo.tenant
    }

    pub fn path(&self) -> &Path {
        &self.repo.path
    }

    /// Brings the clone up to date with the remote branch, cloning it first if
    /// needed. Uncommitted changes are discarded. Returns the commit now
    /// checked out.
    ///
    /// Fails with [`RepositoryError::InconsistentState`] when local history
    /// holds commits the remote lacks or cannot be fast-forwarded; call
    /// [`recreate_cache`](Self::recreate_cache) and retry.
    pub fn checkout(&mut self) -> Result<String> {
        let repo = self.repo;
        let git = &repo.git;

        if !repo.is_cloned() {
            if repo.path.exists() {
                log::warn!(
                    "Removing incomplete clone of '{}' at {}",
                    repo.tenant,
                    repo.path.display()
                );
                repo.delete_clone()?;
            }
            log::info!("Cloning branch '{}' into {}", repo.tenant, repo.path.display());
            repo.clone_branch(&repo.tenant)?;
            return git.head(&repo.path);
        }

        // Only committed state may be read back.
        self.discard_changes()?;
        git.run_remote(&repo.path, &["fetch", "-q", "origin", &repo.tenant])?;

        let ahead = git.run(&repo.path, &["rev-list", "--count", "FETCH_HEAD..HEAD"])?;
        if stdout(&ahead) != "0" {
            return Err(RepositoryError::InconsistentState(format!(
                "local clone of '{}' has {} commit(s) not on the remote",
                repo.tenant,
                stdout(&ahead)
            )));
        }

        let merge = git.output(&repo.path, &["merge", "-q", "--ff-only", "FETCH_HEAD"])?;
        if !merge.status.success() {
            return Err(RepositoryError::InconsistentState(format!(
                "cannot fast-forward '{}': {}",
                repo.tenant,
                format_git_error(&merge)
            )));
        }

        let head = git.head(&repo.path)?;
        log::debug!("Checked out '{}' at {}", repo.tenant, head);
        Ok(head)
    }

    /// Stages everything, commits and pushes.
    ///
    /// Returns `None` when the working tree has no changes. Once the commit
    /// exists locally, any failed push yields
    /// [`RepositoryError::InconsistentState`]: the clone is ahead of the remote
    /// and must be recreated.
    pub fn commit_and_push(&mut self, message: &str) -> Result<Option<String>> {
        let repo = self.repo;
        let git = &repo.git;

        if !repo.is_cloned() {
            return Err(RepositoryError::BranchNotCloned(repo.tenant.clone()));
        }

        git.run(&repo.path, &["add", "-A"])?;
        let status = git.run(&repo.path, &["status", "--porcelain"])?;
        if is_clean_status(&stdout(&status)) {
            return Ok(None);
        }

        git.commit(&repo.path, message)?;

        let refspec = format!("HEAD:refs/heads/{}", repo.tenant);
        let push = git.remote_output(&repo.path, &["push", "-q", "origin", &refspec])?;
        if !push.status.success() {
            let message = format_git_error(&push);
            let reason = if is_push_rejected(&message) {
                "rejected"
            } else {
                "failed"
            };
            return Err(RepositoryError::InconsistentState(format!(
                "push to '{}' {}: {}",
                repo.tenant, reason, message
            )));
        }

        let head = git.head(&repo.path)?;
        log::info!("Pushed '{}' at {}: {}", repo.tenant, head, message);
        Ok(Some(head))
    }

    /// Discards uncommitted changes, returning the working tree to the last local commit.
    pub fn reset(&mut self) -> Result<()> {
        let repo = self.repo;
        if !repo.is_cloned() {
            return Err(RepositoryError::BranchNotCloned(repo.tenant.clone()));
        }
        self.discard_changes()
    }

    fn discard_changes(&mut self) -> Result<()> {
        let repo = self.repo;
        repo.git.run(&repo.path, &["reset", "-q", "--hard", "HEAD"])?;
        repo.git.run(&repo.path, &["clean", "-fdq"])?;
        Ok(())
    }

    /// Deletes the local clone and checks the branch out again.
    pub fn recreate_cache(&mut self) -> Result<String> {
        log::warn!("Recreating local clone of '{}'", self.repo.tenant);
        self.repo.delete_clone()?;
        self.checkout()
    }

    /// Creates this tenant's branch from `source` and pushes it.
    ///
    /// The source branch must exist and the tenant branch must not. Any
    /// partial local clone is deleted on failure.
    pub fn create_branch(&mut self, source: &str) -> Result<String> {
        let repo = self.repo;
        let parent = repo.parent_dir()?;
        let remote = repo.git.config().remote_repository.clone();

        let listing = repo
            .git
            .run_remote(&parent, &["ls-remote", "--heads", &remote])?;
        let heads = parse_ls_remote_heads(&stdout(&listing));
        if !heads.contains_key(source) {
            return Err(RepositoryError::SourceBranchNotFound(source.to_string()));
        }
        if heads.contains_key(&repo.tenant) {
            return Err(RepositoryError::BranchExists(repo.tenant.clone()));
        }

        let result = self.create_branch_inner(source);
        if result.is_err() {
            if let Err(e) = repo.delete_clone() {
                log::warn!("Failed to remove partial clone of '{}': {}", repo.tenant, e);
            }
        }
        result
    }

    fn create_branch_inner(&mut self, source: &str) -> Result<String> {
        let repo = self.repo;
        let git = &repo.git;

        repo.delete_clone()?;
        repo.clone_branch(source)?;
        git.run(&repo.path, &["checkout", "-q", "-b", &repo.tenant])?;

        let refspec = format!("{}:refs/heads/{}", repo.tenant, repo.tenant);
        git.run_remote(&repo.path, &["push", "-q", "origin", &refspec])?;

        let head = git.head(&repo.path)?;
        log::info!("Created branch '{}' from '{}' at {}", repo.tenant, source, head);
        Ok(head)
    }

    /// Resource file access for the working tree.
    pub fn loader(&self) -> SnapshotLoader {
        SnapshotLoader::new(&self.repo.path)
    }

    pub fn add(&self, resource: &RepositoryResource) -> Result<()> {
        self.loader().add(resource)
    }

    pub fn update(&self, resource: &RepositoryResource) -> Result<()> {
        self.loader().update(resource)
    }

    pub fn remove(&self, kind: ResourceKind, name: &str) -> Result<()> {
        self.loader().remove(kind, name)
    }
}
