//! One long-lived extractor subprocess, owned by exactly one worker. The
//! extractor is expensive to start (model load, imports), so it is spawned
//! once and then fed a stream of jobs over a line-delimited protocol:
//! one `\n`-terminated file path in, one `\n`-terminated JSON object out.

use crate::process::{Child, ChildStdio, Command, KillHandle};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("extractor command is empty")]
    EmptyCommand,
    #[error("failed to spawn extractor")]
    Spawn(#[source] std::io::Error),
    #[error("extractor did not complete its readiness handshake")]
    Handshake,
    #[error("extractor startup timed out after {0:?}")]
    StartupTimeout(Duration),
    #[error("extractor closed its stdio")]
    Closed,
    #[error("extractor I/O failed")]
    Io(#[source] std::io::Error),
    #[error("extractor responded with malformed JSON")]
    Protocol(#[source] serde_json::Error),
}

/// The per-document verdict. Field names are the extractor's wire names.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub word_count: Option<i64>,
    #[serde(default)]
    pub char_count: Option<i64>,
    #[serde(default)]
    pub table_count: Option<i64>,
    #[serde(default)]
    pub image_count: Option<i64>,
    #[serde(default)]
    pub extraction: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ReadyLine {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    initialized: bool,
}

pub struct ExtractorProcess {
    child: Child,
    stdin: ChildStdio,
    stdout: Lines<BufReader<ChildStdio>>,
}

impl ExtractorProcess {
    /// Spawn and wait for the two readiness lines: `{"ready": true}` after
    /// imports, then `{"initialized": true}` after converter warmup.
    pub async fn spawn(
        command: &[String],
        startup_timeout: Duration,
    ) -> Result<Self, ExtractError> {
        let (program, args) = command.split_first().ok_or(ExtractError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        let mut child = Child::spawn(&mut cmd).map_err(ExtractError::Spawn)?;
        let stdin = child.stdin.take().ok_or(ExtractError::Closed)?;
        let stdout = child.stdout.take().ok_or(ExtractError::Closed)?;
        if let Some(stderr) = child.stderr.take() {
            let pid = child.id();
            tokio::spawn(forward_stderr(stderr, pid));
        }

        let mut process = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };
        match tokio::time::timeout(startup_timeout, process.handshake()).await {
            Ok(result) => result?,
            Err(_) => return Err(ExtractError::StartupTimeout(startup_timeout)),
        }
        tracing::debug!(pid = process.child.id(), "extractor ready");
        Ok(process)
    }

    async fn handshake(&mut self) -> Result<(), ExtractError> {
        let ready: ReadyLine = self.read_json_line().await?;
        if !ready.ready {
            return Err(ExtractError::Handshake);
        }
        let initialized: ReadyLine = self.read_json_line().await?;
        if !initialized.initialized {
            return Err(ExtractError::Handshake);
        }
        Ok(())
    }

    /// One request/response exchange.
    pub async fn extract(&mut self, path: &Path) -> Result<ExtractResponse, ExtractError> {
        let mut line = path.display().to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(ExtractError::Io)?;
        self.stdin.flush().await.map_err(ExtractError::Io)?;
        self.read_json_line().await
    }

    pub fn kill_handle(&self) -> KillHandle {
        self.child.kill_handle()
    }

    async fn read_json_line<T: DeserializeOwned>(&mut self) -> Result<T, ExtractError> {
        let line = self
            .stdout
            .next_line()
            .await
            .map_err(ExtractError::Io)?
            .ok_or(ExtractError::Closed)?;
        serde_json::from_str(&line).map_err(ExtractError::Protocol)
    }
}

async fn forward_stderr(stderr: ChildStdio, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(pid, line = %line, "extractor stderr");
    }
}
