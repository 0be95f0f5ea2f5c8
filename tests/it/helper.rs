//! Shared helpers for the integration test suite.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::{Report, Result};
use tokio::sync::Mutex;

use driftmon::broker::memory::MemoryBroker;
use driftmon::queue::{Options, Queue};
use driftmon::repo::{RepoConfig, RepoName, RepoUrl};
use driftmon::runner::{Error as RunnerError, RunParams, RunResult, Runner};
use driftmon::scan::StackPath;
use driftmon::store::{self, RepoSummary, StackSummary, Store};

/// Queue options tuned for fast tests.
pub fn test_options() -> Options {
    Options {
        lock_ttl: Duration::from_secs(5),
        record_ttl: Duration::from_secs(60),
        index_retention: 50,
    }
}

/// A queue over a fresh in-memory broker.
pub fn memory_queue() -> (Arc<MemoryBroker>, Arc<Queue<MemoryBroker>>) {
    let broker = Arc::new(MemoryBroker::new());
    let queue = Arc::new(Queue::new(Arc::clone(&broker), test_options()));
    (broker, queue)
}

/// A repo config pointing at the given URL.
pub fn repo_config(name: &str, url: &str, cancel_inflight: bool) -> RepoConfig {
    RepoConfig::builder()
        .name(RepoName::try_from(name).expect("must validate repo name"))
        .url(RepoUrl::try_from(String::from(url)).expect("must validate repo url"))
        .cancel_inflight_on_new_trigger(cancel_inflight)
        .build()
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// What the stub runner should do for one invocation against a stack.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return a clean plan.
    Clean,

    /// Return a drifted plan.
    Drifted,

    /// Return an evaluator-reported failure (terminal).
    EvalError(&'static str),

    /// Fail the run infrastructure (retryable).
    InfraError,

    /// Never resolve; used to test cancellation of in-flight work.
    Block,
}

/// A scripted [`Runner`]: behaviors are consumed per stack, in order,
/// defaulting to [`Behavior::Clean`] when the script runs dry.
#[derive(Debug, Default)]
pub struct StubRunner {
    script: Mutex<HashMap<String, Vec<Behavior>>>,
}

impl StubRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a behavior for the next invocation against `stack`.
    pub async fn behave(&self, stack: &str, behavior: Behavior) {
        let mut script = self.script.lock().await;
        script.entry(String::from(stack)).or_default().push(behavior);
    }
}

#[async_trait]
impl Runner for StubRunner {
    async fn run(&self, params: RunParams) -> Result<RunResult, RunnerError> {
        let behavior = {
            let mut script = self.script.lock().await;
            match script.get_mut(params.stack.as_ref()) {
                Some(behaviors) if !behaviors.is_empty() => behaviors.remove(0),
                _ => Behavior::Clean,
            }
        };

        let run_at = time::OffsetDateTime::now_utc();
        match behavior {
            Behavior::Clean => Ok(RunResult {
                drifted: false,
                plan_output: String::from("No changes."),
                error: String::new(),
                run_at,
            }),
            Behavior::Drifted => Ok(RunResult {
                drifted: true,
                plan_output: String::from("Plan: 1 to add, 0 to change, 0 to destroy."),
                error: String::new(),
                run_at,
            }),
            Behavior::EvalError(message) => Ok(RunResult {
                drifted: false,
                plan_output: String::new(),
                error: String::from(message),
                run_at,
            }),
            Behavior::InfraError => Err(Report::new(RunnerError::Spawn)),
            Behavior::Block => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("blocked runner must be canceled, not awaited to completion")
            }
        }
    }
}

/// An in-memory [`Store`] for asserting on persisted results.
#[derive(Debug, Default)]
pub struct MemoryStore {
    results: Mutex<HashMap<(String, String), RunResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored results across all repos.
    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_repos(&self) -> Result<Vec<RepoSummary>, store::Error> {
        let results = self.results.lock().await;
        let mut by_repo: HashMap<String, (i64, i64)> = HashMap::new();
        for ((repo, _), result) in results.iter() {
            let entry = by_repo.entry(repo.clone()).or_default();
            entry.0 += 1;
            if result.drifted && result.error.is_empty() {
                entry.1 += 1;
            }
        }
        let mut out = Vec::new();
        for (repo, (stacks, drifted_stacks)) in by_repo {
            out.push(RepoSummary {
                name: RepoName::try_from(repo).expect("stored repo names are valid"),
                drifted: drifted_stacks > 0,
                stacks,
                drifted_stacks,
            });
        }
        Ok(out)
    }

    async fn list_stacks(&self, repo: &RepoName) -> Result<Vec<StackSummary>, store::Error> {
        let results = self.results.lock().await;
        let mut out = Vec::new();
        for ((stored_repo, stack), result) in results.iter() {
            if stored_repo == repo.as_ref() {
                out.push(StackSummary {
                    path: StackPath::try_from(stack.clone()).expect("stored paths are valid"),
                    drifted: result.drifted,
                    error: result.error.clone(),
                    run_at: result.run_at,
                });
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn get_result(
        &self,
        repo: &RepoName,
        stack: &StackPath,
    ) -> Result<Option<RunResult>, store::Error> {
        let results = self.results.lock().await;
        Ok(results
            .get(&(String::from(repo.as_ref()), String::from(stack.as_ref())))
            .cloned())
    }

    async fn save_result(
        &self,
        repo: &RepoName,
        stack: &StackPath,
        result: &RunResult,
    ) -> Result<(), store::Error> {
        let mut results = self.results.lock().await;
        results.insert(
            (String::from(repo.as_ref()), String::from(stack.as_ref())),
            result.clone(),
        );
        Ok(())
    }
}

/// Build a git repository fixture containing the provided files, committed.
///
/// Panics when git is unavailable; these tests require a working `git`.
pub fn git_fixture(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("must create temporary directory");
    let run = |args: &[&str]| {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir.path())
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .output()
            .expect("must run git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr),
        );
    };

    run(&["init"]);
    for (path, content) in files {
        let target = dir.path().join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).expect("must create parent dirs");
        }
        std::fs::write(target, content).expect("must write fixture file");
    }
    run(&["add", "."]);
    run(&["commit", "-m", "fixture"]);
    dir
}
