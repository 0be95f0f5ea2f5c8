//! The scan data model.
//!
//! A [`Scan`] is one logical attempt to evaluate every stack in one repository
//! at one commit. A [`StackScan`] is one stack's evaluation within a scan.
//! Both are persisted as broker records by the queue; the types here are the
//! decoded forms that the rest of the application works with.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use derive_more::{Display, From};
use error_stack::{report, Report, ResultExt};
use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::ext::result::{WrapErr, WrapOk};
use crate::repo::RepoName;

/// Errors validating scan model values.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Stack paths must stay inside the repository checkout.
    #[error("validate stack path")]
    StackPath,
}

/// The cause of a scan.
///
/// Variants are declared in ascending priority order so the derived [`Ord`]
/// is the supersession order: a trigger may preempt an in-flight scan only
/// when its priority is greater than or equal to the active trigger's.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    StrumDisplay,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// A trigger from a source this application doesn't model.
    Other,

    /// The repository's scan schedule fired.
    Scheduled,

    /// A code host webhook reported new commits.
    Webhook,

    /// A human asked for the scan.
    Manual,
}

impl Trigger {
    /// The ordinal priority of this trigger, for display and event payloads.
    pub fn priority(&self) -> u8 {
        *self as u8
    }
}

/// The lifecycle state of a [`Scan`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// The scan holds the repo lock and work may still be in flight.
    Running,

    /// Every stack finished and none of them failed the scan.
    Completed,

    /// The scan ended with a recorded error.
    Failed,

    /// The scan was canceled, by a user or by supersession.
    Canceled,
}

impl ScanStatus {
    /// Whether this status is terminal. Terminal scans never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanStatus::Running)
    }
}

/// The lifecycle state of a [`StackScan`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    /// Enqueued, waiting for a worker.
    Pending,

    /// A worker claimed it and the evaluator is running.
    Running,

    /// The evaluator ran to completion.
    Completed,

    /// The evaluation failed.
    Failed,

    /// The parent scan was canceled before this stack finished.
    Canceled,
}

impl StackStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StackStatus::Pending | StackStatus::Running)
    }
}

/// Opaque unique identity of a [`Scan`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, Serialize, Deserialize)]
pub struct ScanId(String);

impl ScanId {
    /// Mint a fresh scan id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl AsRef<str> for ScanId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScanId {
    fn from(value: &str) -> Self {
        Self(String::from(value))
    }
}

/// Unique identity of a [`StackScan`], embedding the parent scan and stack path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, Serialize, Deserialize)]
pub struct StackScanId(String);

impl AsRef<str> for StackScanId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl StackScanId {
    /// Derive the id for a stack within a scan.
    ///
    /// The encoding is stable: enqueueing the same stack for the same scan
    /// always produces the same id, which is what makes enqueue idempotence
    /// checks possible.
    pub fn derive(scan: &ScanId, stack: &StackPath) -> Self {
        Self(format!("{}:{}", scan.as_ref(), stack.as_ref()))
    }
}

impl From<&str> for StackScanId {
    fn from(value: &str) -> Self {
        Self(String::from(value))
    }
}

/// A stack's location within its repository: a POSIX-style relative path,
/// where the empty string means the repository root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackPath(String);

impl AsRef<str> for StackPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl StackPath {
    /// The repository root as a stack path.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Whether this stack is the repository root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a changed file (as a repo-relative POSIX path) belongs to this stack.
    ///
    /// The root stack matches a file iff the file sits at the repo root.
    /// Any other stack `S` matches iff the file's path starts with `S` plus a separator.
    pub fn contains_file(&self, file: &str) -> bool {
        if self.is_root() {
            !file.contains('/')
        } else {
            file.strip_prefix(&self.0)
                .map_or(false, |rest| rest.starts_with('/'))
        }
    }

    /// Resolve this stack path under a checkout directory.
    pub fn join_under(&self, root: &Path) -> std::path::PathBuf {
        if self.is_root() {
            root.to_path_buf()
        } else {
            root.join(&self.0)
        }
    }
}

impl fmt::Display for StackPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str(".")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl TryFrom<String> for StackPath {
    type Error = Report<ValidationError>;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        let trimmed = input.trim_end_matches('/');
        if trimmed.starts_with('/') || trimmed.contains('\\') {
            return report!(ValidationError::StackPath)
                .wrap_err()
                .attach_printable(format!("stack paths must be relative: '{input}'"));
        }
        if trimmed.split('/').any(|segment| segment == "..") {
            return report!(ValidationError::StackPath)
                .wrap_err()
                .attach_printable(format!("stack paths may not escape the checkout: '{input}'"));
        }
        StackPath(String::from(trimmed)).wrap_ok()
    }
}

impl TryFrom<&str> for StackPath {
    type Error = Report<ValidationError>;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        Self::try_from(String::from(input))
    }
}

/// Tool versions resolved for a scan: workspace-level defaults plus
/// per-stack overrides for stacks that pin a different version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolVersions {
    /// The default terraform version for the workspace, if pinned.
    pub terraform: Option<String>,

    /// The default terragrunt version for the workspace, if pinned.
    pub terragrunt: Option<String>,

    /// Stacks whose pinned terraform version differs from the default.
    #[serde(default)]
    pub terraform_overrides: BTreeMap<String, String>,

    /// Stacks whose pinned terragrunt version differs from the default.
    #[serde(default)]
    pub terragrunt_overrides: BTreeMap<String, String>,
}

impl ToolVersions {
    /// The effective (terraform, terragrunt) versions for one stack.
    pub fn resolve(&self, stack: &StackPath) -> (Option<String>, Option<String>) {
        let tf = self
            .terraform_overrides
            .get(stack.as_ref())
            .cloned()
            .or_else(|| self.terraform.clone());
        let tg = self
            .terragrunt_overrides
            .get(stack.as_ref())
            .cloned()
            .or_else(|| self.terragrunt.clone());
        (tf, tg)
    }
}

/// Progress accounting for a scan.
///
/// `queued + running + completed + failed` never exceeds `total` once the
/// total is known; `drifted` counts within `completed` and `errored` within `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Stacks selected for this scan.
    pub total: i64,

    /// Stack scans waiting for a worker.
    pub queued: i64,

    /// Stack scans currently held by a worker.
    pub running: i64,

    /// Stack scans that evaluated successfully.
    pub completed: i64,

    /// Stack scans that ended in failure.
    pub failed: i64,

    /// Completed stack scans where drift was detected.
    pub drifted: i64,

    /// Failed stack scans where the evaluator itself reported an error.
    pub errored: i64,

    /// Stacks skipped at enqueue time because a prior stack scan was still inflight.
    pub enqueue_skipped: i64,

    /// Stacks that could not be enqueued for other reasons.
    pub enqueue_failed: i64,
}

/// One attempt to evaluate all selected stacks of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scan {
    /// Unique id of this scan.
    pub id: ScanId,

    /// The repository being scanned.
    pub repo: RepoName,

    /// What caused this scan.
    pub trigger: Trigger,

    /// Advisory commit requested by the trigger, if any.
    pub commit: Option<String>,

    /// Who or what asked for the scan.
    pub actor: String,

    /// The commit actually checked out, resolved after clone.
    pub commit_sha: Option<String>,

    /// Filesystem path of the scan's workspace checkout.
    pub workspace: Option<String>,

    /// Tool versions detected for the workspace.
    #[serde(default)]
    pub versions: ToolVersions,

    /// Lifecycle state.
    pub status: ScanStatus,

    /// Human-readable failure or cancellation reason, on terminal non-success.
    pub error: Option<String>,

    /// Progress accounting.
    #[serde(flatten)]
    pub counters: Counters,

    /// When the scan record was created.
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,

    /// When orchestration started.
    #[serde(default, with = "time::serde::timestamp::option")]
    pub started_at: Option<OffsetDateTime>,

    /// When the scan reached a terminal status. Unset iff the scan is running.
    #[serde(default, with = "time::serde::timestamp::option")]
    pub ended_at: Option<OffsetDateTime>,
}

impl Scan {
    /// The scan's progress percentage, suitable for direct display.
    pub fn progress_percent(&self) -> u8 {
        progress_percent(
            self.counters.completed,
            self.counters.failed,
            self.counters.total,
        )
    }
}

/// One stack's evaluation within a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackScan {
    /// Unique id, derived from the scan id and stack path.
    pub id: StackScanId,

    /// The parent scan.
    pub scan_id: ScanId,

    /// The repository being scanned.
    pub repo: RepoName,

    /// The repository's clone URL, carried so workers don't need the repo config.
    pub repo_url: String,

    /// The stack under evaluation.
    pub stack: StackPath,

    /// Lifecycle state.
    pub status: StackStatus,

    /// How many times this stack scan has been retried.
    pub retries: u32,

    /// Retry budget, after which failures are terminal.
    pub max_retries: u32,

    /// Human-readable failure reason, on terminal non-success.
    pub error: Option<String>,

    /// Inherited from the parent scan.
    pub trigger: Trigger,

    /// Advisory commit inherited from the parent scan.
    pub commit: Option<String>,

    /// Inherited from the parent scan.
    pub actor: String,

    /// When the stack scan was enqueued.
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,

    /// When a worker claimed it.
    #[serde(default, with = "time::serde::timestamp::option")]
    pub started_at: Option<OffsetDateTime>,

    /// When it reached a terminal status.
    #[serde(default, with = "time::serde::timestamp::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// A published delta on a repo's event channel, carrying enough state for
/// subscribers to render status without another fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepoEvent {
    /// A scan changed state.
    ScanUpdate {
        /// The scan after the change.
        scan: Scan,
    },

    /// A stack scan changed state.
    StackUpdate {
        /// The stack scan after the change.
        stack_scan: StackScan,
    },
}

impl RepoEvent {
    /// The repo this event belongs to.
    pub fn repo(&self) -> &RepoName {
        match self {
            RepoEvent::ScanUpdate { scan } => &scan.repo,
            RepoEvent::StackUpdate { stack_scan } => &stack_scan.repo,
        }
    }
}

/// Progress percentage over (completed, failed, total).
///
/// Zero when the total isn't known yet; otherwise the share of finished
/// stacks, clamped into `0..=100` so that counter drift (retries, resets)
/// can never render an impossible percentage.
pub fn progress_percent(completed: i64, failed: i64, total: i64) -> u8 {
    if total <= 0 {
        return 0;
    }
    let done = (completed + failed).clamp(0, total);
    (done * 100 / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn trigger_priority_order() {
        assert!(Trigger::Scheduled < Trigger::Webhook);
        assert!(Trigger::Webhook < Trigger::Manual);
        assert!(Trigger::Other < Trigger::Scheduled);
        assert!(Trigger::Manual >= Trigger::Manual);
    }

    #[test]
    fn trigger_round_trips_through_strings() {
        for trigger in [
            Trigger::Manual,
            Trigger::Webhook,
            Trigger::Scheduled,
            Trigger::Other,
        ] {
            let rendered = trigger.to_string();
            let parsed: Trigger = rendered.parse().expect("must parse rendered trigger");
            assert_eq!(trigger, parsed);
        }
    }

    #[test]
    fn progress_examples() {
        assert_eq!(progress_percent(3, 1, 10), 40);
        assert_eq!(progress_percent(0, 0, 0), 0);
        assert_eq!(progress_percent(15, 0, 10), 100);
        assert_eq!(progress_percent(-5, 0, 10), 0);
        assert_eq!(progress_percent(0, 10, 10), 100);
    }

    #[test]
    fn stack_path_matches_files() {
        let root = StackPath::root();
        assert!(root.contains_file("main.tf"));
        assert!(!root.contains_file("envs/prod/main.tf"));

        let prod = StackPath::try_from("envs/prod").expect("must validate");
        assert!(prod.contains_file("envs/prod/main.tf"));
        assert!(prod.contains_file("envs/prod/nested/module.tf"));
        assert!(!prod.contains_file("envs/prod2/main.tf"));
        assert!(!prod.contains_file("envs/dev/main.tf"));
        assert!(!prod.contains_file("README.md"));
    }

    #[test]
    fn stack_path_rejects_escapes() {
        assert!(StackPath::try_from("/etc/passwd").is_err());
        assert!(StackPath::try_from("../outside").is_err());
        assert!(StackPath::try_from("envs/../../outside").is_err());
        assert!(StackPath::try_from("envs/prod/").is_ok());
    }

    #[test]
    fn stack_scan_id_is_stable() {
        let scan = ScanId::from("scan-1");
        let stack = StackPath::try_from("envs/prod").expect("must validate");
        assert_eq!(
            StackScanId::derive(&scan, &stack),
            StackScanId::derive(&scan, &stack),
        );
    }

    #[test]
    fn versions_resolve_with_overrides() {
        let mut versions = ToolVersions {
            terraform: Some(String::from("1.4.0")),
            terragrunt: None,
            ..ToolVersions::default()
        };
        versions
            .terraform_overrides
            .insert(String::from("envs/legacy"), String::from("0.13.7"));

        let legacy = StackPath::try_from("envs/legacy").expect("must validate");
        let prod = StackPath::try_from("envs/prod").expect("must validate");
        assert_eq!(
            versions.resolve(&legacy),
            (Some(String::from("0.13.7")), None)
        );
        assert_eq!(versions.resolve(&prod), (Some(String::from("1.4.0")), None));
    }

    proptest! {
        #[test]
        fn progress_is_always_a_percentage(
            completed in -1000i64..1000,
            failed in -1000i64..1000,
            total in -1000i64..1000,
        ) {
            let percent = progress_percent(completed, failed, total);
            prop_assert!(percent <= 100);
        }

        #[test]
        fn progress_is_complete_at_total(total in 1i64..1000) {
            prop_assert_eq!(progress_percent(total, 0, total), 100);
            prop_assert_eq!(progress_percent(0, total, total), 100);
        }
    }
}
