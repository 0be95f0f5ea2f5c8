//! Stack discovery: walking a checkout for directories containing IaC
//! manifests, plus tool version detection and webhook change selection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use error_stack::{Report, ResultExt};
use tracing::debug;
use walkdir::WalkDir;

use crate::ext::error_stack::{DescribeContext, IntoContext};
use crate::scan::{StackPath, ToolVersions};

/// Directories never worth walking into: VCS internals and tool caches.
const PRUNED_DIRS: &[&str] = &[".git", ".terraform", ".terragrunt-cache"];

/// Version pin files, resolved nearest-ancestor-wins.
const TERRAFORM_VERSION_FILE: &str = ".terraform-version";
const TERRAGRUNT_VERSION_FILE: &str = ".terragrunt-version";

/// Errors encountered during stack discovery.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Walking the checkout failed.
    #[error("walk checkout")]
    Walk,

    /// A discovered directory produced an invalid stack path.
    #[error("derive stack path")]
    StackPath,

    /// Reading a version pin file failed.
    #[error("read version file")]
    VersionFile,
}

/// Whether a repo-relative file path counts as an infrastructure file.
///
/// Used for webhook change filtering; discovery itself walks directories.
pub fn is_infra_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name == "terragrunt.hcl"
        || name.ends_with(".tf")
        || name.ends_with(".tf.json")
        || name.ends_with(".tfvars")
        || name.ends_with(".tfvars.json")
        || name.ends_with(".hcl")
}

/// Walk a checkout and return the stacks it contains, sorted by path.
///
/// A directory is a stack when it directly contains a `terragrunt.hcl` or
/// any `*.tf` file. `root_path` restricts the walk to a subdirectory;
/// `ignore_paths` are repo-relative prefixes pruned from the walk entirely.
/// Returned paths are always relative to the checkout root, so they line up
/// with webhook change paths regardless of `root_path`.
#[tracing::instrument(skip(checkout))]
pub fn discover_stacks(
    checkout: &Path,
    root_path: Option<&str>,
    ignore_paths: &[String],
) -> Result<Vec<StackPath>, Report<Error>> {
    let walk_root = match root_path {
        Some(sub) if !sub.is_empty() => checkout.join(sub),
        _ => checkout.to_path_buf(),
    };

    let mut stacks = Vec::new();
    let walker = WalkDir::new(&walk_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if PRUNED_DIRS.iter().any(|pruned| name == *pruned) {
                return false;
            }
            !is_ignored(checkout, entry.path(), ignore_paths)
        });

    for entry in walker {
        let entry = entry
            .context(Error::Walk)
            .describe_lazy(|| format!("walking {walk_root:?}"))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if !contains_infra_manifest(entry.path()) {
            continue;
        }
        let relative = relative_posix(checkout, entry.path());
        let stack = StackPath::try_from(relative).change_context(Error::StackPath)?;
        stacks.push(stack);
    }

    stacks.sort();
    debug!("discovered {} stacks", stacks.len());
    Ok(stacks)
}

/// Select the subset of stacks touched by a set of changed files.
///
/// A stack matches when any changed file sits inside it; the root stack only
/// matches files at the repo root.
pub fn select_stacks_for_changes(stacks: &[StackPath], changed: &[String]) -> Vec<StackPath> {
    stacks
        .iter()
        .filter(|stack| changed.iter().any(|file| stack.contains_file(file)))
        .cloned()
        .collect()
}

/// Detect pinned tool versions for a set of stacks.
///
/// Each stack resolves its pin from the nearest `.terraform-version` /
/// `.terragrunt-version` walking up from the stack directory to the checkout
/// root. The checkout root's pins become the scan defaults; stacks that
/// resolve differently become per-stack overrides.
#[tracing::instrument(skip(checkout, stacks))]
pub fn detect_versions(
    checkout: &Path,
    stacks: &[StackPath],
) -> Result<ToolVersions, Report<Error>> {
    let default_tf = read_version_file(&checkout.join(TERRAFORM_VERSION_FILE))?;
    let default_tg = read_version_file(&checkout.join(TERRAGRUNT_VERSION_FILE))?;

    let mut terraform_overrides = BTreeMap::new();
    let mut terragrunt_overrides = BTreeMap::new();
    for stack in stacks {
        let tf = nearest_version(checkout, stack, TERRAFORM_VERSION_FILE)?;
        if tf != default_tf {
            if let Some(version) = tf {
                terraform_overrides.insert(String::from(stack.as_ref()), version);
            }
        }
        let tg = nearest_version(checkout, stack, TERRAGRUNT_VERSION_FILE)?;
        if tg != default_tg {
            if let Some(version) = tg {
                terragrunt_overrides.insert(String::from(stack.as_ref()), version);
            }
        }
    }

    Ok(ToolVersions {
        terraform: default_tf,
        terragrunt: default_tg,
        terraform_overrides,
        terragrunt_overrides,
    })
}

fn contains_infra_manifest(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else { return false };
    for entry in entries.flatten() {
        if !entry.file_type().map_or(false, |t| t.is_file()) {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "terragrunt.hcl" || name.ends_with(".tf") || name.ends_with(".tf.json") {
            return true;
        }
    }
    false
}

fn is_ignored(checkout: &Path, path: &Path, ignore_paths: &[String]) -> bool {
    let relative = relative_posix(checkout, path);
    ignore_paths.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        relative == prefix
            || relative
                .strip_prefix(prefix)
                .map_or(false, |rest| rest.starts_with('/'))
    })
}

fn relative_posix(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let rendered = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    rendered
}

/// The nearest version pin for a stack, walking ancestors up to the checkout root.
fn nearest_version(
    checkout: &Path,
    stack: &StackPath,
    file_name: &str,
) -> Result<Option<String>, Report<Error>> {
    let mut dir: PathBuf = stack.join_under(checkout);
    loop {
        if let Some(version) = read_version_file(&dir.join(file_name))? {
            return Ok(Some(version));
        }
        if dir == checkout {
            return Ok(None);
        }
        match dir.parent() {
            Some(parent) if parent.starts_with(checkout) => dir = parent.to_path_buf(),
            _ => return Ok(None),
        }
    }
}

fn read_version_file(path: &Path) -> Result<Option<String>, Report<Error>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let version = content.trim();
            if version.is_empty() {
                Ok(None)
            } else {
                Ok(Some(String::from(version)))
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err)
            .context(Error::VersionFile)
            .describe_lazy(|| format!("reading {path:?}")),
    }
}
