//! External-collaborator interfaces for workspaces and repositories.
//!
//! Worktree creation and repository cloning live outside this crate; the
//! executor only needs a directory to hand the provider as its working
//! directory. [`FixedRootWorkspace`] is the trivial local implementation
//! used by embedders and tests; real deployments plug a git-backed layer
//! in behind the same traits.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Request for a per-node working directory.
#[derive(Debug, Clone)]
pub struct WorktreeRequest {
    pub repo_name: String,
    pub tree_key: String,
    pub run_id: i64,
    pub node_key: String,
}

/// A provisioned working directory for one node execution.
#[derive(Debug, Clone)]
pub struct RunWorktree {
    pub worktree_path: PathBuf,
    pub branch: String,
    pub commit_hash: String,
}

/// Provides isolated working directories for node executions.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Create (or reuse) the working directory for a node execution.
    async fn create_run_worktree(&self, request: &WorktreeRequest) -> Result<RunWorktree>;

    /// Remove everything provisioned for a run.
    async fn cleanup_run(&self, run_id: i64) -> Result<()>;
}

/// A repository known to the registry.
#[derive(Debug, Clone)]
pub struct RepositorySpec {
    pub name: String,
    pub remote_url: String,
}

/// What `ensure_repository_clone` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneAction {
    Cloned,
    Reused,
    Synced,
}

/// A locally-available repository clone.
#[derive(Debug, Clone)]
pub struct ClonedRepository {
    pub repository: RepositorySpec,
    pub action: CloneAction,
    pub local_path: PathBuf,
}

/// Ensures repositories are locally available for the worktree layer.
#[async_trait]
pub trait RepositoryRegistry: Send + Sync {
    async fn ensure_repository_clone(
        &self,
        repository: &RepositorySpec,
        sync: bool,
    ) -> Result<ClonedRepository>;
}

// Compile-time assertions: both traits must be object-safe.
const _: () = {
    fn _assert_workspace_object_safe(_: &dyn WorkspaceProvider) {}
    fn _assert_registry_object_safe(_: &dyn RepositoryRegistry) {}
};

/// Hands out plain directories under a fixed root, one per (run, node).
///
/// No git operations happen here; branch and commit fields are synthetic.
#[derive(Debug, Clone)]
pub struct FixedRootWorkspace {
    root: PathBuf,
}

impl FixedRootWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir(&self, run_id: i64) -> PathBuf {
        self.root.join(format!("run-{run_id}"))
    }
}

#[async_trait]
impl WorkspaceProvider for FixedRootWorkspace {
    async fn create_run_worktree(&self, request: &WorktreeRequest) -> Result<RunWorktree> {
        let path = self.run_dir(request.run_id).join(&request.node_key);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("failed to create workspace dir {}", path.display()))?;
        Ok(RunWorktree {
            worktree_path: path,
            branch: format!(
                "alphred/{}/run-{}/{}",
                request.tree_key, request.run_id, request.node_key
            ),
            commit_hash: String::new(),
        })
    }

    async fn cleanup_run(&self, run_id: i64) -> Result<()> {
        let dir = self.run_dir(run_id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("failed to remove workspace dir {}", dir.display()))?;
        }
        Ok(())
    }
}
