//! The evaluator seam: what it means to "run" one stack.
//!
//! The orchestration core doesn't know how drift is decided; it hands a
//! prepared workspace to a [`Runner`] and records what comes back. The
//! process-spawning [`ExecRunner`] drives `terraform`/`terragrunt` plan with
//! detailed exit codes; tests substitute their own implementations.

use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use error_stack::{report, Report};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;
use which::which;

use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::ext::result::{WrapErr, WrapOk};
use crate::git;
use crate::repo::RepoName;
use crate::scan::StackPath;

/// Errors running the evaluator.
///
/// An `Err` from [`Runner::run`] means the run infrastructure failed and the
/// attempt may be retried. An evaluator that ran and reported a problem
/// instead returns `Ok` with [`RunResult::error`] set, which is terminal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable evaluator binary was found.
    #[error("locate evaluator binary")]
    Locate,

    /// Spawning or waiting on the evaluator process failed.
    #[error("spawn evaluator")]
    Spawn,

    /// Reading evaluator output failed.
    #[error("read evaluator output")]
    ReadOutput,
}

/// Everything a runner needs to evaluate one stack.
#[derive(Debug)]
pub struct RunParams {
    /// The repository under evaluation.
    pub repo: RepoName,

    /// Its clone URL, for evaluators that need remote context.
    pub repo_url: String,

    /// The stack under evaluation.
    pub stack: StackPath,

    /// Effective terraform version for the stack, if pinned.
    pub tf_version: Option<String>,

    /// Effective terragrunt version for the stack, if pinned.
    pub tg_version: Option<String>,

    /// Transport auth, for evaluators that fetch modules over the same transport.
    pub auth: git::Auth,

    /// The private workspace directory to run in.
    pub workspace: PathBuf,
}

/// What one evaluation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Whether the stack has drifted from its declared state.
    pub drifted: bool,

    /// The rendered plan output.
    pub plan_output: String,

    /// Evaluator-reported failure; empty means the run itself succeeded.
    pub error: String,

    /// When the evaluation ran.
    #[serde(with = "time::serde::timestamp")]
    pub run_at: OffsetDateTime,
}

impl RunResult {
    /// Whether the evaluator itself failed (as opposed to finding drift).
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Evaluates stacks. Implementations must honor cancellation promptly:
/// the worker drops the returned future when the parent scan is canceled.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Evaluate one stack.
    async fn run(&self, params: RunParams) -> Result<RunResult, Report<Error>>;
}

/// Which binaries [`ExecRunner`] may use.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    /// Override path for terraform; discovered on `PATH` when unset.
    pub terraform_bin: Option<PathBuf>,

    /// Override path for terragrunt; discovered on `PATH` when unset.
    pub terragrunt_bin: Option<PathBuf>,
}

/// Runs `terraform plan -detailed-exitcode` (or `terragrunt` for stacks
/// carrying a `terragrunt.hcl`) in the staged workspace.
///
/// Exit code 0 is a clean plan, 2 is a plan with changes (drift), anything
/// else is an evaluator failure reported in [`RunResult::error`].
#[derive(Debug, Clone, Default)]
pub struct ExecRunner {
    config: ExecConfig,
}

impl ExecRunner {
    /// Create a runner with the provided binary overrides.
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }

    fn locate(&self, stack_dir: &std::path::Path) -> Result<PathBuf, Report<Error>> {
        let terragrunt = stack_dir.join("terragrunt.hcl").is_file();
        let (configured, name) = if terragrunt {
            (&self.config.terragrunt_bin, "terragrunt")
        } else {
            (&self.config.terraform_bin, "terraform")
        };
        match configured {
            Some(path) => path.clone().wrap_ok(),
            None => which(name)
                .context(Error::Locate)
                .describe_lazy(|| format!("looking for '{name}' on the PATH"))
                .help("install the evaluator binary or configure an explicit path"),
        }
    }
}

#[async_trait]
impl Runner for ExecRunner {
    #[tracing::instrument(skip(self, params), fields(repo = %params.repo, stack = %params.stack))]
    async fn run(&self, params: RunParams) -> Result<RunResult, Report<Error>> {
        let run_at = OffsetDateTime::now_utc();
        let binary = self.locate(&params.workspace)?;

        // `init` fetches providers and modules; its failures are evaluator
        // failures, not infrastructure ones, so they land in the result.
        if let Some(failure) = run_step(&binary, &["init", "-input=false", "-no-color"], &params)
            .await?
        {
            return RunResult {
                drifted: false,
                plan_output: String::new(),
                error: failure,
                run_at,
            }
            .wrap_ok();
        }

        let mut cmd = evaluator_command(&binary, &params);
        cmd.arg("plan")
            .arg("-detailed-exitcode")
            .arg("-input=false")
            .arg("-no-color")
            .arg("-lock=false");
        debug!("running {cmd:?}");

        let mut child = cmd.spawn().context(Error::Spawn)?;

        // Stream stderr into traces as it arrives, and buffer it for error
        // reporting; buffer stdout as the plan output.
        let Some(mut stdout) = child.stdout.take() else {
            return report!(Error::Spawn)
                .wrap_err()
                .describe("stdout must be piped");
        };
        let Some(stderr) = child.stderr.take() else {
            return report!(Error::Spawn)
                .wrap_err()
                .describe("stderr must be piped");
        };

        let stdout_reader = async {
            let mut buf = String::new();
            stdout
                .read_to_string(&mut buf)
                .await
                .context(Error::ReadOutput)?;
            Ok(buf)
        };
        let stderr_reader = async {
            let mut buf = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await.context(Error::ReadOutput)? {
                tracing::trace!(message = %line, cmd = "evaluator", cmd_context = "stderr");
                buf.push_str(&line);
                buf.push('\n');
            }
            Ok(buf)
        };
        let waiter = async { child.wait().await.context(Error::Spawn) };

        let (plan_output, stderr_buf, status) =
            futures::future::try_join3(stdout_reader, stderr_reader, waiter).await?;

        let result = match status.code() {
            Some(0) => RunResult {
                drifted: false,
                plan_output,
                error: String::new(),
                run_at,
            },
            Some(2) => RunResult {
                drifted: true,
                plan_output,
                error: String::new(),
                run_at,
            },
            code => RunResult {
                drifted: false,
                plan_output,
                error: format!(
                    "evaluator exited with {}: {}",
                    code.map_or_else(|| String::from("signal"), |c| c.to_string()),
                    stderr_buf.trim(),
                ),
                run_at,
            },
        };
        Ok(result)
    }
}

/// Run a preparatory evaluator step, returning its failure text if it failed.
async fn run_step(
    binary: &std::path::Path,
    args: &[&str],
    params: &RunParams,
) -> Result<Option<String>, Report<Error>> {
    let mut cmd = evaluator_command(binary, params);
    cmd.args(args);
    debug!("running {cmd:?}");
    let output = cmd.output().await.context(Error::Spawn)?;
    if output.status.success() {
        Ok(None)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(Some(format!(
            "evaluator {} failed: {}",
            args.first().unwrap_or(&"step"),
            stderr.trim(),
        )))
    }
}

fn evaluator_command(binary: &std::path::Path, params: &RunParams) -> Command {
    let mut cmd = Command::new(binary);
    cmd.current_dir(&params.workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // If the driving future is dropped (cancellation), the evaluator
        // has no business continuing.
        .kill_on_drop(true)
        .env("TF_IN_AUTOMATION", "1");
    if let Some(version) = &params.tf_version {
        cmd.env("TFENV_TERRAFORM_VERSION", version);
    }
    if let Some(version) = &params.tg_version {
        cmd.env("TGENV_TERRAGRUNT_VERSION", version);
    }
    cmd
}
