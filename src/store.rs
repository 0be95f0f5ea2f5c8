//! Interface for the durable result store, abstracted over implementation.
//!
//! The queue's records are ephemeral; what a stack looked like the last time
//! it was evaluated lives here. Writers are naturally single: the one worker
//! owning a stack scan is the only writer for that (repo, stack) pair.

use async_trait::async_trait;
use error_stack::{Result, ResultExt};
use std::path::Path;

use crate::repo::RepoName;
use crate::runner::RunResult;
use crate::scan::StackPath;

pub mod sqlite;

/// Errors interacting with the result store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Encountered when initializing the store.
    #[error("initialize result store")]
    Initialize,

    /// Encountered at runtime interacting with the store.
    #[error("interact with result store")]
    Interact,
}

/// A repository as summarized across its stored stack results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSummary {
    /// The repository name.
    pub name: RepoName,

    /// Whether any stack currently shows drift.
    pub drifted: bool,

    /// Number of stacks with stored results.
    pub stacks: i64,

    /// Number of stacks currently showing drift.
    pub drifted_stacks: i64,
}

/// One stack's latest stored result, summarized for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSummary {
    /// The stack path.
    pub path: StackPath,

    /// Whether the last evaluation found drift.
    pub drifted: bool,

    /// The last evaluation's error, empty when it succeeded.
    pub error: String,

    /// When the last evaluation ran.
    pub run_at: time::OffsetDateTime,
}

/// All result stores implement this type.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Summarize every repository with stored results.
    async fn list_repos(&self) -> Result<Vec<RepoSummary>, Error>;

    /// Summarize every stack of one repository.
    async fn list_stacks(&self, repo: &RepoName) -> Result<Vec<StackSummary>, Error>;

    /// Fetch one stack's latest full result.
    async fn get_result(
        &self,
        repo: &RepoName,
        stack: &StackPath,
    ) -> Result<Option<RunResult>, Error>;

    /// Store one stack's latest result, replacing any previous one.
    async fn save_result(
        &self,
        repo: &RepoName,
        stack: &StackPath,
        result: &RunResult,
    ) -> Result<(), Error>;
}

/// Connect to the sqlite store implementation.
///
/// Note that this function returns [`sqlite::SqliteStore`] directly so the
/// binary can own the concrete type; functions should accept [`Store`].
pub async fn connect_sqlite(location: &Path) -> Result<sqlite::SqliteStore, Error> {
    sqlite::SqliteStore::connect(location)
        .await
        .change_context(Error::Initialize)
}
