//! A `SandboxLauncher` that spawns the sandbox guest as a child process and
//! speaks the framed wire protocol over its stdio.
//!
//! Grounded on `cave-kernel::ProcessSandboxRuntime`, which spawned one
//! `tokio::process::Command` per sandbox with `kill_on_drop(true)` and piped
//! stdio. Here the child's stdin/stdout are joined into a single duplex
//! stream (`tokio::io::join`) and handed to `FramedConnection`, so the
//! subprocess only needs to speak the same length-prefixed JSON protocol a
//! microVM or container guest would over a socket — the process launcher is
//! one concrete, locally-runnable implementation of the `SandboxLauncher`
//! seam, not the only one a deployment is expected to use.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::instrument;

use crate::transport::{FramedConnection, SandboxConnection, SandboxLauncher};

/// How to start the guest process for a given runtime tag.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Resolves a runtime tag (e.g. `python3.11`) to the command that starts its
/// guest process. Missing entries fail the launch rather than falling back
/// to a default interpreter, so a misconfigured runtime is caught at
/// `acquire` time instead of executing under the wrong guest.
pub struct LocalProcessLauncher {
    commands: HashMap<String, RuntimeCommand>,
    max_frame_bytes: usize,
}

impl LocalProcessLauncher {
    pub fn new(commands: HashMap<String, RuntimeCommand>, max_frame_bytes: usize) -> Self {
        Self { commands, max_frame_bytes }
    }
}

#[async_trait]
impl SandboxLauncher for LocalProcessLauncher {
    #[instrument(skip(self))]
    async fn launch(&self, runtime_tag: &str) -> anyhow::Result<Box<dyn SandboxConnection>> {
        let command = self
            .commands
            .get(runtime_tag)
            .ok_or_else(|| anyhow::anyhow!("no guest command configured for runtime {runtime_tag}"))?;

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("guest process has no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("guest process has no stdout"))?;
        let duplex = tokio::io::join(stdout, stdin);

        // The child handle itself is dropped here; `kill_on_drop` would fire
        // if we did that now, so it is moved into a guard kept alive by the
        // connection task instead.
        Ok(Box::new(ProcessConnection {
            _child: child,
            inner: FramedConnection::with_max_frame_bytes(duplex, self.max_frame_bytes),
        }))
    }
}

struct ProcessConnection {
    _child: tokio::process::Child,
    inner: FramedConnection<tokio::io::Join<tokio::process::ChildStdout, tokio::process::ChildStdin>>,
}

#[async_trait]
impl SandboxConnection for ProcessConnection {
    async fn init(&self, payload: crate::transport::InitPayload) -> crate::error::CoreResult<()> {
        self.inner.init(payload).await
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        timeout: std::time::Duration,
    ) -> crate::error::CoreResult<crate::transport::ExecuteResponse> {
        self.inner.execute(input, timeout).await
    }

    async fn ping(&self) -> crate::error::CoreResult<bool> {
        self.inner.ping().await
    }

    async fn close(&self) -> crate::error::CoreResult<()> {
        self.inner.close().await
    }
}
