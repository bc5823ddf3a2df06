//! KL-014: Exec resource — run a process and check its exit code.
//!
//! The child gets only the environment listed in `env`, optionally runs
//! under another uid/gid, and is killed when its timeout elapses or the run
//! is cancelled. Output is captured in full for logging.

use super::content;
use super::{ApplyContext, Resource};
use crate::core::duration::parse_duration;
use crate::core::error::{Error, Result};
use crate::core::types::{EnvSpec, ExecSpec, Metadata, ResourceState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// A `kind: exec` catalog entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct Exec {
    #[serde(default)]
    pub api: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub metadata: Metadata,
    pub spec: ExecSpec,
}

fn default_kind() -> String {
    "exec".to_string()
}

impl Exec {
    pub fn new(name: &str, spec: ExecSpec) -> Self {
        Self {
            api: String::new(),
            kind: default_kind(),
            metadata: Metadata {
                name: name.to_string(),
                ..Metadata::default()
            },
            spec,
        }
    }
}

#[async_trait]
impl Resource for Exec {
    fn api(&self) -> &str {
        &self.api
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    async fn apply(&self, ctx: &ApplyContext) -> Result<()> {
        run(&self.spec, ctx, &self.identity_key()).await.map(drop)
    }

    /// With `failOk`, a failure is recorded as completion and swallowed.
    fn fail(&self, err: Error) -> Option<Error> {
        if self.spec.fail_ok {
            info!(resource = %self.identity_key(), error = %err, "failure ignored (failOk)");
            self.done();
            return None;
        }
        self.metadata.state.mark(ResourceState::Failed);
        Some(err)
    }
}

/// Captured result of a finished child.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Render `env` as ordered `(name, value)` pairs, resolving each value.
pub fn load_env(env: &[EnvSpec]) -> Result<Vec<(String, OsString)>> {
    env.iter()
        .map(|e| {
            let value = content::resolve(&e.value)
                .map_err(|err| err.with_key(&format!("env var {}", e.name)))?;
            Ok((e.name.clone(), OsString::from_vec(value)))
        })
        .collect()
}

fn parse_timeout(spec: &ExecSpec) -> Result<Option<Duration>> {
    match spec.timeout.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(t) => parse_duration(t).map(Some),
    }
}

/// Run the command described by `spec` and compare its exit code.
/// A signal-terminated child reports exit code -1.
pub async fn run(spec: &ExecSpec, ctx: &ApplyContext, key: &str) -> Result<ExecOutput> {
    let timeout = parse_timeout(spec)?;
    let env = load_env(&spec.env)?;
    let owner = ctx.identities.resolve(&spec.user_id)?;
    let timed_out = |after| Error::Timeout {
        command: spec.path.clone(),
        after,
    };
    if timeout == Some(Duration::ZERO) {
        return Err(timed_out(Duration::ZERO));
    }
    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled(format!("command {} not started", spec.path)));
    }

    let mut cmd = Command::new(&spec.path);
    cmd.args(&spec.args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !spec.dir.is_empty() {
        cmd.current_dir(&spec.dir);
    }
    if let Some(uid) = owner.uid {
        cmd.uid(uid);
    }
    if let Some(gid) = owner.gid {
        cmd.gid(gid);
    }

    debug!(resource = %key, path = %spec.path, args = ?spec.args, ?timeout, "spawning");
    let child = cmd
        .spawn()
        .map_err(|e| Error::Convergence(format!("command {} failed to start: {}", spec.path, e)))?;

    let deadline = async move {
        match timeout {
            Some(d) => {
                tokio::time::sleep(d).await;
                d
            }
            None => std::future::pending().await,
        }
    };

    // Dropping the wait future drops the child, which kills it.
    let output = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            return Err(Error::Cancelled(format!("command {} killed", spec.path)));
        }
        elapsed = deadline => return Err(timed_out(elapsed)),
        out = child.wait_with_output() => out.map_err(|e| {
            Error::Convergence(format!("command {} failed: {}", spec.path, e))
        })?,
    };

    let result = ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    if !result.stderr.is_empty() {
        info!(resource = %key, "stderr:\n{}", result.stderr);
    }
    if !result.stdout.is_empty() {
        info!(resource = %key, "stdout:\n{}", result.stdout);
    }

    if result.exit_code != spec.exit_code {
        return Err(Error::Convergence(format!(
            "exit code {} != expected {}",
            result.exit_code, spec.exit_code
        )));
    }
    Ok(result)
}
