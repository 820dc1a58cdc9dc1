//! Shared fixtures for infrasync integration tests.
//!
//! `GitRemote` creates a bare repository in a temp directory and pushes
//! tenant branches into it with the real `git` binary, standing in for the
//! hosted remote.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use infrasync::config::{BehaviourConfig, ClusterConfig, GitConfig, ManagerConfig};

pub const TEMPLATE_BRANCH: &str = "master";

/// Runs git in `dir` and returns trimmed stdout, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(["-c", "user.name=fixture", "-c", "user.email=fixture@localhost"])
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("git binary not available");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A resource document as it appears in a tenant branch.
pub fn doc(kind: &str, name: &str, spec: &str) -> String {
    format!(
        "apiVersion: infrasync.io/v1\nkind: {kind}\nmetadata:\n  name: {name}\nspec:\n{spec}\n"
    )
}

pub fn settings(propagation: &str) -> String {
    doc("Settings", "settings", &format!("  k8s-propagation: {propagation}"))
}

/// A bare remote plus a scratch area for fixture writes.
pub struct GitRemote {
    dir: TempDir,
    pub remote: PathBuf,
    pub clones: PathBuf,
    counter: std::cell::Cell<usize>,
}

impl GitRemote {
    /// Creates the remote with a template branch holding only a README.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let remote = dir.path().join("remote.git");
        fs::create_dir_all(&remote).unwrap();
        git(&remote, &["init", "-q", "--bare"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/master"]);

        let seed = dir.path().join("seed");
        fs::create_dir_all(&seed).unwrap();
        git(&seed, &["init", "-q"]);
        git(&seed, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        fs::write(seed.join("README.md"), "tenant template\n").unwrap();
        git(&seed, &["add", "-A"]);
        git(&seed, &["commit", "-q", "-m", "template"]);
        git(&seed, &["remote", "add", "origin", remote.to_str().unwrap()]);
        git(&seed, &["push", "-q", "origin", TEMPLATE_BRANCH]);

        let clones = dir.path().join("clones");
        Self {
            dir,
            remote,
            clones,
            counter: std::cell::Cell::new(0),
        }
    }

    pub fn url(&self) -> String {
        self.remote.to_string_lossy().into_owned()
    }

    pub fn git_config(&self) -> GitConfig {
        self.git_config_at(&self.clones)
    }

    /// Git settings with clones under `root`, for a second independent writer.
    pub fn git_config_at(&self, root: &Path) -> GitConfig {
        GitConfig {
            remote_repository: self.url(),
            local_repository_root: root.to_path_buf(),
            auth: Default::default(),
            ignore_insecure_hosts: false,
            user_name: "infrasync-test".to_string(),
            user_email: "infrasync-test@localhost".to_string(),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            git: self.git_config(),
            cluster: ClusterConfig::default(),
            behaviour: BehaviourConfig {
                sync_workers: 2,
                fetch_interval_secs: 1,
                recovery_delay_secs: 1,
                ..Default::default()
            },
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn scratch(&self, branch: &str) -> PathBuf {
        let n = self.counter.get() + 1;
        self.counter.set(n);
        let scratch = self.dir.path().join(format!("scratch-{n}"));
        git(
            self.dir.path(),
            &["clone", "-q", &self.url(), scratch.to_str().unwrap()],
        );
        let exists = !git(&self.remote, &["branch", "--list", branch]).is_empty();
        if exists {
            git(&scratch, &["checkout", "-q", "-B", branch, &format!("origin/{branch}")]);
        } else {
            git(&scratch, &["checkout", "-q", "-b", branch]);
        }
        scratch
    }

    /// Writes and deletes files on `branch` (created from the template if
    /// missing) and pushes one commit. Returns the new head.
    pub fn commit(&self, branch: &str, writes: &[(&str, &str)], deletes: &[&str]) -> String {
        let scratch = self.scratch(branch);
        for (path, content) in writes {
            let target = scratch.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(target, content).unwrap();
        }
        for path in deletes {
            fs::remove_file(scratch.join(path)).unwrap();
        }
        git(&scratch, &["add", "-A"]);
        git(&scratch, &["commit", "-q", "--allow-empty", "-m", "fixture change"]);
        git(&scratch, &["push", "-q", "origin", branch]);
        let head = git(&scratch, &["rev-parse", "HEAD"]);
        fs::remove_dir_all(&scratch).unwrap();
        head
    }

    pub fn delete_branch(&self, branch: &str) {
        git(&self.remote, &["branch", "-D", branch]);
    }

    pub fn head(&self, branch: &str) -> String {
        git(&self.remote, &["rev-parse", &format!("refs/heads/{branch}")])
    }
}
