//! Git-worktree workspace plugin.
//!
//! One worktree per session under `<worktreeDir>/<project>/<session>`,
//! branched from the project's default branch. Destroy is forced: the
//! supervisor owns these checkouts and a session being torn down must not
//! be blocked by stray build artifacts.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{CreateWorkspaceRequest, Workspace, WorkspaceError, WorkspaceInfo};
use crate::config::ProjectConfig;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WorktreeWorkspace {
    base_dir: PathBuf,
}

impl WorktreeWorkspace {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn worktree_path(&self, project_id: &str, session_id: &str) -> PathBuf {
        self.base_dir.join(project_id).join(session_id)
    }

    async fn run_git(repo: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        debug!(?args, repo = %repo.display(), "Running git command");

        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(repo)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| WorkspaceError::Timeout(COMMAND_TIMEOUT))?
            .map_err(|e| WorkspaceError::CommandFailed(format!("failed to execute git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkspaceError::CommandFailed(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn branch_exists(repo: &Path, branch: &str) -> bool {
        Self::run_git(
            repo,
            &[
                "rev-parse",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ],
        )
        .await
        .is_ok()
    }
}

#[async_trait]
impl Workspace for WorktreeWorkspace {
    fn name(&self) -> &str {
        "worktree"
    }

    #[instrument(skip(self, request), fields(project = %request.project_id, session = %request.session_id))]
    async fn create(
        &self,
        request: &CreateWorkspaceRequest,
    ) -> Result<WorkspaceInfo, WorkspaceError> {
        let path = self.worktree_path(&request.project_id, &request.session_id);
        if path.exists() {
            return Err(WorkspaceError::AlreadyExists(path));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkspaceError::CreationFailed(e.to_string()))?;
        }

        let repo = &request.project.path;

        // Stale remote refs make new worktrees start behind.
        if let Err(e) = Self::run_git(repo, &["fetch", "origin"]).await {
            warn!(error = %e, "Failed to fetch origin before worktree creation");
        }

        let path_str = path.to_string_lossy().to_string();
        let result = if Self::branch_exists(repo, &request.branch).await {
            Self::run_git(repo, &["worktree", "add", &path_str, &request.branch]).await
        } else {
            let base = format!("origin/{}", request.project.default_branch);
            let with_remote_base = Self::run_git(
                repo,
                &["worktree", "add", "-b", &request.branch, &path_str, &base],
            )
            .await;
            match with_remote_base {
                Ok(out) => Ok(out),
                // No remote (local-only repo): branch from the local default.
                Err(_) => {
                    Self::run_git(
                        repo,
                        &[
                            "worktree",
                            "add",
                            "-b",
                            &request.branch,
                            &path_str,
                            &request.project.default_branch,
                        ],
                    )
                    .await
                }
            }
        };

        result.map_err(|e| WorkspaceError::CreationFailed(e.to_string()))?;
        info!(path = %path.display(), branch = %request.branch, "Created worktree");

        Ok(WorkspaceInfo {
            path,
            branch: request.branch.clone(),
        })
    }

    #[instrument(skip(self))]
    async fn destroy(&self, path: &Path) -> Result<(), WorkspaceError> {
        // The worktree's parent repo is recorded in its .git file; `git
        // worktree remove` works from inside the worktree itself.
        let removed = Self::run_git(
            path,
            &["worktree", "remove", "--force", &path.to_string_lossy()],
        )
        .await;

        match removed {
            Ok(_) => {
                info!(path = %path.display(), "Removed worktree");
                Ok(())
            }
            Err(e) => {
                // Fall back to deleting the directory; the repo will prune
                // the dangling registration on its next worktree operation.
                warn!(path = %path.display(), error = %e, "git worktree remove failed, deleting directory");
                tokio::fs::remove_dir_all(path)
                    .await
                    .map_err(|e| WorkspaceError::DestroyFailed(path.to_path_buf(), e.to_string()))
            }
        }
    }

    async fn list(&self, project: &ProjectConfig) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        let output = Self::run_git(&project.path, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output))
    }

    async fn post_create(
        &self,
        info: &WorkspaceInfo,
        project: &ProjectConfig,
    ) -> Result<(), WorkspaceError> {
        // Symlink shared, uncommitted paths (env files, caches) from the
        // main checkout.
        for link in &project.symlinks {
            let source = project.path.join(link);
            let target = info.path.join(link);
            if !source.exists() || target.exists() {
                continue;
            }
            if let Some(parent) = target.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            #[cfg(unix)]
            if let Err(e) = tokio::fs::symlink(&source, &target).await {
                warn!(link = %link, error = %e, "Failed to create workspace symlink");
            }
        }

        if let Some(hook) = &project.post_create {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(hook)
                .current_dir(&info.path)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
                .await
                .map_err(|_| WorkspaceError::Timeout(COMMAND_TIMEOUT))?
                .map_err(|e| WorkspaceError::PostCreateFailed(e.to_string()))?;

            if !output.status.success() {
                return Err(WorkspaceError::PostCreateFailed(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Parse `git worktree list --porcelain` output into workspace infos.
fn parse_worktree_list(output: &str) -> Vec<WorkspaceInfo> {
    let mut infos = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut branch: Option<String> = None;

    for line in output.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            // Flush the previous stanza.
            if let (Some(path), Some(branch)) = (path.take(), branch.take()) {
                infos.push(WorkspaceInfo { path, branch });
            }
            path = Some(PathBuf::from(p));
        } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
            branch = Some(b.to_string());
        }
    }
    if let (Some(path), Some(branch)) = (path, branch) {
        infos.push(WorkspaceInfo { path, branch });
    }
    infos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_path_layout() {
        let workspace = WorktreeWorkspace::new("/data/worktrees");
        assert_eq!(
            workspace.worktree_path("my-app", "app-3"),
            PathBuf::from("/data/worktrees/my-app/app-3")
        );
    }

    #[test]
    fn parses_porcelain_worktree_list() {
        let output = "\
worktree /home/dev/my-app
HEAD 1234567890abcdef1234567890abcdef12345678
branch refs/heads/main

worktree /data/worktrees/my-app/app-1
HEAD fedcba0987654321fedcba0987654321fedcba09
branch refs/heads/feat/INT-100

worktree /data/worktrees/my-app/app-2
HEAD fedcba0987654321fedcba0987654321fedcba09
detached
";
        let infos = parse_worktree_list(output);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].path, PathBuf::from("/home/dev/my-app"));
        assert_eq!(infos[0].branch, "main");
        assert_eq!(infos[1].branch, "feat/INT-100");
    }

    #[test]
    fn empty_listing_parses_to_empty() {
        assert!(parse_worktree_list("").is_empty());
    }
}
