//! Wrapper for the `git` CLI: authenticated shallow clones and HEAD resolution.
//!
//! driftmon shells out to `git` rather than linking a git implementation;
//! every git feature operators rely on (credential quirks, proxies, ssh
//! config) then works exactly as it does on their machines.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use error_stack::{report, Report, ResultExt};
use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::ext::result::{WrapErr, WrapOk};
use crate::ext::secrecy::ComparableSecretString;

/// How long a clone may take before it is abandoned.
pub const CLONE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors encountered while working with git.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Building the authentication material for the transport failed.
    #[error("prepare git authentication")]
    Auth,

    /// Running the git binary failed.
    #[error("run git")]
    Execution,

    /// The clone did not finish within [`CLONE_TIMEOUT`].
    #[error("clone timed out")]
    Timeout,

    /// Reading HEAD of the fresh clone failed.
    #[error("resolve HEAD commit")]
    ResolveHead,
}

/// Authentication descriptor for a repository's code host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Auth {
    /// Anonymous HTTP; public repositories.
    #[default]
    None,

    /// A raw `Authorization` header value.
    HttpHeader {
        /// The full header value, e.g. `Bearer <token>`.
        header: ComparableSecretString,
    },

    /// HTTP basic auth.
    HttpBasic {
        /// The user name; for most code hosts any non-empty string works with a token.
        username: String,

        /// The password or token.
        password: ComparableSecretString,
    },

    /// An SSH key already present on disk.
    SshKeyFile {
        /// Path to the private key.
        path: PathBuf,
    },

    /// An SSH key provided inline (e.g. from a secret manager).
    SshKey {
        /// The private key content.
        key: ComparableSecretString,
    },
}

/// A clone request: where from, which branch, and how to authenticate.
#[derive(Debug, Clone)]
pub struct CloneSpec {
    /// The remote URL.
    pub url: String,

    /// Single branch to fetch; the remote default when unset.
    pub branch: Option<String>,

    /// Transport authentication.
    pub auth: Auth,
}

/// Shallow-clone the given repository into `dest` and resolve its HEAD commit.
///
/// The clone is depth-1 and single-branch when a branch is configured; scans
/// only ever need one tree, and full history on large infra monorepos is
/// pure waste. Bounded by [`CLONE_TIMEOUT`].
#[tracing::instrument(skip(spec), fields(url = %spec.url))]
pub async fn clone_repo(spec: &CloneSpec, dest: &Path) -> Result<String, Report<Error>> {
    // The ssh key tempfile must outlive the child process.
    let mut key_file = NamedTempFile::new()
        .context(Error::Auth)
        .describe("creating temp file for ssh key material")?;

    let mut args = config_args(&spec.auth);
    args.push(String::from("clone"));
    args.push(String::from("--depth"));
    args.push(String::from("1"));
    if let Some(branch) = &spec.branch {
        args.push(String::from("--branch"));
        args.push(branch.clone());
        args.push(String::from("--single-branch"));
    }
    args.push(spec.url.clone());
    args.push(dest.display().to_string());

    let env = env_vars(&spec.auth, &mut key_file)?;
    run_git(&args, env, None, CLONE_TIMEOUT).await?;

    head_commit(dest).await
}

/// Resolve the commit sha a checkout is at.
pub async fn head_commit(checkout: &Path) -> Result<String, Report<Error>> {
    let output = run_git(
        &[String::from("rev-parse"), String::from("HEAD")],
        HashMap::new(),
        Some(checkout),
        Duration::from_secs(30),
    )
    .await
    .change_context(Error::ResolveHead)?;

    let sha = String::from_utf8_lossy(&output).trim().to_string();
    if sha.is_empty() {
        report!(Error::ResolveHead)
            .wrap_err()
            .describe_lazy(|| format!("rev-parse HEAD in {checkout:?} produced no output"))
    } else {
        sha.wrap_ok()
    }
}

/// `-c` arguments applied ahead of the subcommand, carrying HTTP auth.
///
/// Credential helpers can override the header provided by `http.extraHeader`,
/// so when we inject a header we also blank `credential.helper`.
fn config_args(auth: &Auth) -> Vec<String> {
    let header = match auth {
        Auth::HttpHeader { header } => Some(format!(
            "http.extraHeader=AUTHORIZATION: {}",
            header.expose_secret()
        )),
        Auth::HttpBasic { username, password } => {
            let raw = format!("{}:{}", username, password.expose_secret());
            let encoded = general_purpose::STANDARD.encode(raw);
            Some(format!("http.extraHeader=AUTHORIZATION: Basic {encoded}"))
        }
        _ => None,
    };

    match header {
        Some(header) => vec![
            String::from("-c"),
            String::from("credential.helper=''"),
            String::from("-c"),
            header,
        ],
        None => Vec::new(),
    }
}

fn env_vars(
    auth: &Auth,
    key_file: &mut NamedTempFile,
) -> Result<HashMap<String, String>, Report<Error>> {
    let mut env = HashMap::new();
    // Never let git fall back to prompting on a headless service.
    env.insert(String::from("GIT_TERMINAL_PROMPT"), String::from("0"));

    match auth {
        Auth::SshKeyFile { path } => {
            env.insert(
                String::from("GIT_SSH_COMMAND"),
                ssh_command(&path.display().to_string()),
            );
        }
        Auth::SshKey { key } => {
            key_file
                .write_all(key.expose_secret().as_bytes())
                .context(Error::Auth)
                .describe("writing ssh key to temp file")?;
            env.insert(
                String::from("GIT_SSH_COMMAND"),
                ssh_command(&key_file.path().display().to_string()),
            );
        }
        _ => {}
    }
    Ok(env)
}

// "-o IdentitiesOnly=yes" means "only use the identity file pointed to by the -i arg".
// "-o StrictHostKeyChecking=no" avoids errors when the host is not in known_hosts.
// "-F /dev/null" means "start with an empty ssh config".
fn ssh_command(key_path: &str) -> String {
    format!("ssh -i {key_path} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no -F /dev/null")
}

async fn run_git(
    args: &[String],
    env: HashMap<String, String>,
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<Vec<u8>, Report<Error>> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let waited = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| report!(Error::Timeout))
        .describe_lazy(|| format!("running git {args:?}"))?;

    let output = waited
        .context(Error::Execution)
        .describe_lazy(|| format!("running git {args:?}"))
        .help("ensure the git binary is installed and on the PATH")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return report!(Error::Execution)
            .wrap_err()
            .describe_lazy(|| {
                format!(
                    "git {:?} exited with {}: {}",
                    args,
                    output.status,
                    stderr.trim(),
                )
            })
            .help("verify the repository url and credentials are correct");
    }

    Ok(output.stdout)
}
