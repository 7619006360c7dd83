//! Built-in role implementations.
//!
//! `CommandRole` shells out for every delivered event; `PassthroughRole`
//! emits its primary output immediately, for stages done out of band.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::role::{Role, RoleContext, RoleOutput};
use crate::domain::{Event, EventKind, Hat};
use crate::error::{Result, VloopError};
use crate::verifier::render_output;

/// Lines starting with this marker select the emitted event kind
pub const EMIT_MARKER: &str = "vloop:emit ";

const ROLE_OUTPUT_LIMIT: usize = 30_000;

/// Role that runs a shell command for each delivered event.
///
/// The command sees the event through environment variables:
/// `VLOOP_RUN_ID`, `VLOOP_TASK`, `VLOOP_ITERATION`, `VLOOP_EVENT`,
/// `VLOOP_PAYLOAD` (JSON), `VLOOP_DIAGNOSTICS`, `VLOOP_CONTEXT_RESET`.
/// Exit 0 emits the hat's primary output unless stdout names another kind
/// with a `vloop:emit <kind>` line.
pub struct CommandRole {
    hat: Hat,
    command: String,
    env: BTreeMap<String, String>,
    workdir: Option<PathBuf>,
}

impl CommandRole {
    pub fn new(hat: Hat, command: impl Into<String>) -> Self {
        Self {
            hat,
            command: command.into(),
            env: BTreeMap::new(),
            workdir: None,
        }
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn build(&self, event: &Event, ctx: &RoleContext) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.command);
        cmd.current_dir(self.workdir.as_ref().unwrap_or(&ctx.workdir));

        cmd.env("VLOOP_RUN_ID", &ctx.run_id)
            .env("VLOOP_TASK", &ctx.task)
            .env("VLOOP_ITERATION", ctx.iteration.to_string())
            .env("VLOOP_ROLE", self.hat.id.as_str())
            .env("VLOOP_EVENT", event.kind.as_str())
            .env("VLOOP_PAYLOAD", event.payload.to_string())
            .env("VLOOP_DIAGNOSTICS", ctx.diagnostics.as_deref().unwrap_or(""))
            .env("VLOOP_CONTEXT_RESET", if ctx.context_reset { "1" } else { "0" });
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Last `vloop:emit <kind>` line in stdout, if any
    fn emitted_kind(&self, stdout: &str) -> Result<Option<EventKind>> {
        let marker = stdout
            .lines()
            .rev()
            .find_map(|line| line.trim().strip_prefix(EMIT_MARKER));
        match marker {
            Some(kind) => Ok(Some(kind.trim().parse()?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Role for CommandRole {
    fn hat(&self) -> &Hat {
        &self.hat
    }

    async fn handle(&self, event: &Event, ctx: &RoleContext) -> Result<RoleOutput> {
        let output = self
            .build(event, ctx)
            .output()
            .await
            .map_err(|e| VloopError::role_failed(self.hat.id.as_str(), format!("spawn failed: {}", e)))?;

        let rendered = render_output(&output.stdout, &output.stderr, ROLE_OUTPUT_LIMIT);
        if !output.status.success() {
            return Err(VloopError::role_failed(
                self.hat.id.as_str(),
                format!("exit code {}: {}", output.status.code().unwrap_or(-1), rendered),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let kind = self
            .emitted_kind(&stdout)
            .map_err(|e| VloopError::role_failed(self.hat.id.as_str(), e.to_string()))?;
        let payload = serde_json::json!({ "output": rendered });
        Ok(match kind {
            Some(kind) => RoleOutput::new(kind, payload),
            None => RoleOutput::primary(payload),
        })
    }
}

/// Role that acknowledges immediately with its primary output.
pub struct PassthroughRole {
    hat: Hat,
}

impl PassthroughRole {
    pub fn new(hat: Hat) -> Self {
        Self { hat }
    }
}

#[async_trait]
impl Role for PassthroughRole {
    fn hat(&self) -> &Hat {
        &self.hat
    }

    async fn handle(&self, event: &Event, _ctx: &RoleContext) -> Result<RoleOutput> {
        Ok(RoleOutput::primary(serde_json::json!({
            "passthrough": true,
            "in_reply_to": event.seq,
        })))
    }
}
