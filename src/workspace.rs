//! Scan workspace directories: layout, retention, and private copies for workers.
//!
//! Each scan clones into `<dataRoot>/workspaces/<repo>/<scanID>/repo`. Old
//! workspaces are garbage collected down to a configured count per repo, and
//! the GC never touches the directory of the scan that triggered it. Workers
//! copy the stack subtree they are about to evaluate into a private temp
//! directory first, so collecting an older workspace can never pull files out
//! from under a running evaluation.

use std::path::{Path, PathBuf};

use error_stack::{Report, ResultExt};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::repo::RepoName;
use crate::scan::{ScanId, StackPath};

/// Errors encountered managing workspaces.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Creating a workspace or staging directory failed.
    #[error("create directory")]
    Create,

    /// Enumerating existing workspaces failed.
    #[error("enumerate workspaces")]
    Enumerate,

    /// Removing an expired workspace failed.
    #[error("remove workspace")]
    Remove,

    /// Copying a stack subtree for a worker failed.
    #[error("stage stack subtree")]
    Stage,
}

/// Workspace directory manager rooted at the application data root.
#[derive(Debug, Clone)]
pub struct Workspaces {
    root: PathBuf,
    retention: usize,
}

impl Workspaces {
    /// Create a manager keeping `retention` workspaces per repo.
    pub fn new(data_root: &Path, retention: usize) -> Self {
        Self {
            root: data_root.join("workspaces"),
            retention: retention.max(1),
        }
    }

    /// The directory a scan's clone goes into: `<root>/<repo>/<scanID>/repo`.
    pub fn checkout_dir(&self, repo: &RepoName, scan: &ScanId) -> PathBuf {
        self.scan_dir(repo, scan).join("repo")
    }

    fn repo_dir(&self, repo: &RepoName) -> PathBuf {
        self.root.join(repo.as_ref())
    }

    fn scan_dir(&self, repo: &RepoName, scan: &ScanId) -> PathBuf {
        self.repo_dir(repo).join(scan.as_ref())
    }

    /// Prepare an empty checkout directory for a scan.
    pub async fn prepare(&self, repo: &RepoName, scan: &ScanId) -> Result<PathBuf, Report<Error>> {
        let dir = self.checkout_dir(repo, scan);
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(Error::Create)
                .describe_lazy(|| format!("creating workspace directory {parent:?}"))
                .help("ensure the data root is writable")?;
        }
        Ok(dir)
    }

    /// Collect old workspaces for a repo, keeping the most recent ones.
    ///
    /// Keeps the `retention` newest scan directories by modification time.
    /// `current` is the scan whose workspace must survive regardless of age;
    /// it occupies one retention slot.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, repo: &RepoName, current: &ScanId) -> Result<(), Report<Error>> {
        let repo_dir = self.repo_dir(repo);
        let mut entries = match tokio::fs::read_dir(&repo_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .context(Error::Enumerate)
                    .describe_lazy(|| format!("listing {repo_dir:?}"))
            }
        };

        let mut aged = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .context(Error::Enumerate)
                .describe_lazy(|| format!("listing {repo_dir:?}"))?;
            let Some(entry) = entry else { break };

            let name = entry.file_name().to_string_lossy().to_string();
            if name == current.as_ref() {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|meta| meta.modified().ok());
            aged.push((modified, entry.path()));
        }

        // Newest first; unknown mtimes sort oldest so they collect first.
        aged.sort_by(|(a, _), (b, _)| b.cmp(a));

        let keep = self.retention.saturating_sub(1);
        for (_, path) in aged.into_iter().skip(keep) {
            debug!("collecting expired workspace {path:?}");
            if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                // Collection is advisory; a stuck directory gets another
                // chance on the next sweep.
                warn!("failed to remove workspace {path:?}: {err}");
            }
        }
        Ok(())
    }

    /// Copy one stack's subtree out of a scan checkout into a private
    /// directory for a worker.
    ///
    /// The copy preserves the stack's repo-relative layout inside the temp
    /// directory so relative references up the tree (common with terragrunt
    /// includes) still resolve for files under the stack itself.
    pub async fn stage_stack(
        &self,
        checkout: &Path,
        stack: &StackPath,
    ) -> Result<StagedStack, Report<Error>> {
        let source = stack.join_under(checkout);
        let staged = tempfile::Builder::new()
            .prefix("driftmon-stack-")
            .tempdir()
            .context(Error::Stage)
            .help("ensure the temp directory is writable")?;

        let dest = stack.join_under(staged.path());
        let copy_source = source.clone();
        tokio::task::spawn_blocking(move || copy_tree(&copy_source, &dest))
            .await
            .context(Error::Stage)?
            .change_context(Error::Stage)
            .describe_lazy(|| format!("copying {source:?}"))?;

        Ok(StagedStack {
            dir: staged,
            stack: stack.clone(),
        })
    }

    /// Strip workspace and temp directory prefixes out of an error string
    /// before it is stored or published.
    pub fn redact(&self, message: &str) -> String {
        let mut redacted = message.replace(&self.root.display().to_string(), "<workspaces>");
        let tmp = std::env::temp_dir().display().to_string();
        if !tmp.is_empty() {
            redacted = redacted.replace(&tmp, "<tmp>");
        }
        redacted
    }
}

/// A worker's private copy of one stack subtree. The backing temp directory
/// is removed on drop.
#[derive(Debug)]
pub struct StagedStack {
    dir: TempDir,
    stack: StackPath,
}

impl StagedStack {
    /// The directory the evaluator should run in.
    pub fn stack_dir(&self) -> PathBuf {
        self.stack.join_under(self.dir.path())
    }

    /// The root of the private copy.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(), Report<Error>> {
    std::fs::create_dir_all(dest)
        .context(Error::Stage)
        .describe_lazy(|| format!("creating {dest:?}"))?;
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry.context(Error::Stage)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context(Error::Stage)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .context(Error::Stage)
                .describe_lazy(|| format!("creating {target:?}"))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)
                .context(Error::Stage)
                .describe_lazy(|| format!("copying to {target:?}"))?;
        }
        // Symlinks are skipped: a link out of the stack subtree would point
        // at the original workspace, which is exactly what staging avoids.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::tempdir;

    fn name(input: &str) -> RepoName {
        RepoName::try_from(input).expect("must validate")
    }

    #[tokio::test]
    async fn sweep_keeps_recent_and_current() {
        let tmp = tempdir().expect("must create temporary directory");
        let workspaces = Workspaces::new(tmp.path(), 2);
        let repo = name("infra");

        let current = ScanId::from("scan-current");
        for id in ["scan-old", "scan-mid", "scan-current"] {
            let dir = workspaces.checkout_dir(&repo, &ScanId::from(id));
            fs::create_dir_all(&dir).expect("must create workspace");
            // Spread mtimes so ordering is deterministic.
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        workspaces.sweep(&repo, &current).await.expect("must sweep");

        let survivors: Vec<String> = fs::read_dir(tmp.path().join("workspaces/infra"))
            .expect("must list")
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(survivors.contains(&String::from("scan-current")));
        assert!(survivors.contains(&String::from("scan-mid")));
        assert!(!survivors.contains(&String::from("scan-old")));
    }

    #[tokio::test]
    async fn stage_stack_copies_subtree() {
        let tmp = tempdir().expect("must create temporary directory");
        let checkout = tmp.path();
        fs::create_dir_all(checkout.join("envs/prod/nested")).expect("must create dirs");
        fs::write(checkout.join("envs/prod/main.tf"), "resource {}").expect("must write");
        fs::write(checkout.join("envs/prod/nested/vars.tf"), "variable {}").expect("must write");
        fs::write(checkout.join("toplevel.txt"), "not copied").expect("must write");

        let workspaces = Workspaces::new(tmp.path(), 3);
        let stack = StackPath::try_from("envs/prod").expect("must validate");
        let staged = workspaces
            .stage_stack(checkout, &stack)
            .await
            .expect("must stage");

        assert!(staged.stack_dir().join("main.tf").is_file());
        assert!(staged.stack_dir().join("nested/vars.tf").is_file());
        assert!(!staged.root().join("toplevel.txt").exists());
    }

    #[test]
    fn redact_strips_roots() {
        let tmp = tempdir().expect("must create temporary directory");
        let workspaces = Workspaces::new(tmp.path(), 3);
        let message = format!(
            "clone failed in {}/workspaces/infra/abc/repo",
            tmp.path().display()
        );
        let redacted = workspaces.redact(&message);
        assert!(!redacted.contains(&tmp.path().display().to_string()));
    }
}
