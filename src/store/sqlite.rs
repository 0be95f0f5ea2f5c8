//! Result store implementation using sqlite as a backing store.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use derive_new::new;
use error_stack::{Result, ResultExt};
use indoc::indoc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{migrate, Row, SqlitePool};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::repo::RepoName;
use crate::runner::RunResult;
use crate::scan::StackPath;
use crate::store::{RepoSummary, StackSummary};

/// Errors interacting with sqlite.
#[derive(Debug, Error)]
pub enum Error {
    /// Encountered when connecting to the database.
    #[error("connect to database")]
    Connect,

    /// Encountered when migrating database state.
    #[error("migrate database")]
    Migrate,

    /// Encountered when parsing a DB value.
    #[error("parse value from DB")]
    Parse,

    /// A general communication error.
    #[error("communication error with DB")]
    Communication,
}

/// A result store implemented with sqlite.
#[derive(new)]
pub struct SqliteStore {
    location: PathBuf,
    internal: SqlitePool,
}

impl Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish()
    }
}

impl SqliteStore {
    /// Connect to the database.
    #[tracing::instrument]
    pub async fn connect(location: &Path) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(location)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        debug!("open db at {location:?} with connect options: {options:?}");
        let db = SqlitePoolOptions::new()
            .max_connections(16)
            .min_connections(1)
            .connect_with(options)
            .await
            .context(Error::Connect)
            .describe_lazy(|| format!("attempted to open sqlite db at {location:?}"))?;

        Self::new(location.to_path_buf(), db).migrate().await
    }

    /// Migrate the database.
    #[tracing::instrument]
    async fn migrate(self) -> Result<Self, Error> {
        migrate!("db/migrations")
            .run(&self.internal)
            .await
            .context(Error::Migrate)
            .describe("migrations are compiled into driftmon")
            .help(indoc! {"
            This error likely means the database is corrupted.
            The database only caches the latest evaluation results,
            deleting it may resolve this error.
            "})
            .map(|_| self)
    }
}

#[async_trait]
impl super::Store for SqliteStore {
    #[tracing::instrument]
    async fn list_repos(&self) -> Result<Vec<RepoSummary>, super::Error> {
        let rows = sqlx::query(indoc! {"
            select
                repo,
                count(*) as stacks,
                sum(case when drifted and error = '' then 1 else 0 end) as drifted_stacks
            from results
            group by repo
            order by repo
        "})
        .fetch_all(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        rows.into_iter()
            .map(|row| {
                let name: String = row.get("repo");
                let stacks: i64 = row.get("stacks");
                let drifted_stacks: i64 = row.get("drifted_stacks");
                let name = RepoName::try_from(name)
                    .change_context(Error::Parse)
                    .change_context(super::Error::Interact)?;
                Ok(RepoSummary {
                    name,
                    drifted: drifted_stacks > 0,
                    stacks,
                    drifted_stacks,
                })
            })
            .collect()
    }

    #[tracing::instrument]
    async fn list_stacks(&self, repo: &RepoName) -> Result<Vec<StackSummary>, super::Error> {
        let rows = sqlx::query(indoc! {"
            select stack, drifted, error, run_at
            from results
            where repo = ?
            order by stack
        "})
        .bind(repo.as_ref())
        .fetch_all(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        rows.into_iter()
            .map(|row| {
                let stack: String = row.get("stack");
                let drifted: bool = row.get("drifted");
                let error: String = row.get("error");
                let run_at: i64 = row.get("run_at");
                let path = StackPath::try_from(stack)
                    .change_context(Error::Parse)
                    .change_context(super::Error::Interact)?;
                let run_at = OffsetDateTime::from_unix_timestamp(run_at)
                    .context(Error::Parse)
                    .change_context(super::Error::Interact)?;
                Ok(StackSummary {
                    path,
                    drifted,
                    error,
                    run_at,
                })
            })
            .collect()
    }

    #[tracing::instrument]
    async fn get_result(
        &self,
        repo: &RepoName,
        stack: &StackPath,
    ) -> Result<Option<RunResult>, super::Error> {
        let row = sqlx::query(indoc! {"
            select drifted, plan_output, error, run_at
            from results
            where repo = ? and stack = ?
        "})
        .bind(repo.as_ref())
        .bind(stack.as_ref())
        .fetch_optional(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        row.map(|row| {
            let run_at: i64 = row.get("run_at");
            let run_at = OffsetDateTime::from_unix_timestamp(run_at)
                .context(Error::Parse)
                .change_context(super::Error::Interact)?;
            Ok(RunResult {
                drifted: row.get("drifted"),
                plan_output: row.get("plan_output"),
                error: row.get("error"),
                run_at,
            })
        })
        .transpose()
    }

    #[tracing::instrument(skip(result))]
    async fn save_result(
        &self,
        repo: &RepoName,
        stack: &StackPath,
        result: &RunResult,
    ) -> Result<(), super::Error> {
        sqlx::query(indoc! {"
            insert into results (repo, stack, drifted, plan_output, error, run_at)
            values (?, ?, ?, ?, ?, ?)
            on conflict (repo, stack) do update set
                drifted = excluded.drifted,
                plan_output = excluded.plan_output,
                error = excluded.error,
                run_at = excluded.run_at
        "})
        .bind(repo.as_ref())
        .bind(stack.as_ref())
        .bind(result.drifted)
        .bind(&result.plan_output)
        .bind(&result.error)
        .bind(result.run_at.unix_timestamp())
        .execute(&self.internal)
        .await
        .map(|outcome| debug!("saved result: {outcome:?}"))
        .context(Error::Communication)
        .change_context(super::Error::Interact)
    }
}
