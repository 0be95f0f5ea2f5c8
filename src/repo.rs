//! Repository configuration and the provider seam.
//!
//! The orchestration core is handed repository configuration by a
//! [`RepoProvider`]; it never stores repository settings itself. The default
//! provider is backed by the config file, but anything able to answer
//! `get`/`list` (a settings database, an HTTP admin surface) can stand in.

use async_trait::async_trait;
use derive_more::Display;
use error_stack::{report, Report, ResultExt};
use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::ext::result::{WrapErr, WrapOk};
use crate::git;

/// Errors that are possibly surfaced while resolving repository configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The named repository is not configured.
    #[error("repository is not configured")]
    RepoNotFound,

    /// The backing provider failed to answer.
    #[error("look up repository configuration")]
    Lookup,
}

/// Errors that are possibly surfaced during validation of repository values.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Repo names become broker key segments and directory names,
    /// so the accepted alphabet is deliberately narrow.
    #[error("validate repository name")]
    Name,

    /// The provided clone URL is not usable.
    #[error("validate repository url")]
    Url,
}

/// Validated repository name.
///
/// Names are unique per deployment and are embedded in broker keys, event
/// channel names, and workspace directory paths.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize,
)]
pub struct RepoName(String);

impl AsRef<str> for RepoName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RepoName {
    type Error = Report<ValidationError>;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
        if input.is_empty() || input.len() > 255 || !input.chars().all(valid_char) {
            report!(ValidationError::Name)
                .wrap_err()
                .attach_printable(format!("provided name: '{input}'"))
        } else {
            RepoName(input).wrap_ok()
        }
    }
}

impl TryFrom<&str> for RepoName {
    type Error = Report<ValidationError>;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        Self::try_from(String::from(input))
    }
}

/// Validated clone URL for a repository.
///
/// Different code hosts have different URL semantics (ssh shorthand, local
/// paths in tests), so this only validates that a value is present.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
pub struct RepoUrl(String);

impl AsRef<str> for RepoUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RepoUrl {
    type Error = Report<ValidationError>;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        if input.is_empty() {
            report!(ValidationError::Url)
                .wrap_err()
                .attach_printable("the clone url may not be empty")
        } else {
            RepoUrl(input).wrap_ok()
        }
    }
}

/// One repository as configured for drift detection.
#[derive(Debug, Clone, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct RepoConfig {
    /// The unique name of the repository.
    name: RepoName,

    /// Where to clone it from.
    url: RepoUrl,

    /// The branch to scan; the remote's default branch when unset.
    #[builder(default)]
    branch: Option<String>,

    /// Restrict stack discovery to this subdirectory of the checkout.
    #[builder(default)]
    root_path: Option<String>,

    /// Path prefixes pruned from stack discovery.
    #[builder(default)]
    ignore_paths: Vec<String>,

    /// Whether a new trigger may cancel an in-flight scan of this repository.
    #[builder(default)]
    cancel_inflight_on_new_trigger: bool,

    /// How to authenticate to the code host.
    #[builder(default)]
    git: git::Auth,
}

/// Hands out repository configuration to the orchestration core.
#[async_trait]
pub trait RepoProvider: Send + Sync {
    /// Look up one repository by name.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::RepoNotFound`] when the name is not configured;
    /// callers branch on that sentinel to answer 404s.
    async fn get(&self, name: &RepoName) -> Result<RepoConfig, Report<Error>>;

    /// List every configured repository.
    async fn list(&self) -> Result<Vec<RepoConfig>, Report<Error>>;
}
