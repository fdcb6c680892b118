//! Line-delimited JSON transport over a child process's stdin/stdout
//!
//! Shared by the ACP and streamed-JSON adapters. One writer task, one reader
//! task and one stderr drain per process; callers talk to them over channels.

use crate::error::{Error, ProviderError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, trace, warn};

/// Program, arguments and environment for an agent process
#[derive(Debug, Clone, Default)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Transport layer for line-based agent protocols.
/// Uses channels to avoid lock contention between send and receive.
pub struct Transport {
    stdin_tx: mpsc::Sender<String>,
    stdout_rx: Mutex<mpsc::Receiver<String>>,
    _stdin_task: tokio::task::JoinHandle<()>,
    _stdout_task: tokio::task::JoinHandle<()>,
    _stderr_task: tokio::task::JoinHandle<()>,
}

impl Transport {
    /// Spawn the agent process and wire up its pipes
    pub async fn spawn(command: &ProcessCommand) -> Result<(Self, Child)> {
        debug!(
            "Spawning agent: {} {:?} (cwd: {:?})",
            command.program, command.args, command.cwd
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ProviderError::connection(format!(
                "Failed to spawn {}: {}",
                command.program, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::connection("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::connection("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::connection("Failed to capture stderr"))?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(100);
        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(100);

        let stdin_task = tokio::spawn(Self::write_stdin_task(stdin, stdin_rx));
        let stdout_task = tokio::spawn(Self::read_stdout_task(stdout, stdout_tx));
        // Drain stderr so the agent can't deadlock on a full pipe.
        let stderr_task = tokio::spawn(Self::read_stderr_task(stderr, command.program.clone()));

        Ok((
            Self {
                stdin_tx,
                stdout_rx: Mutex::new(stdout_rx),
                _stdin_task: stdin_task,
                _stdout_task: stdout_task,
                _stderr_task: stderr_task,
            },
            child,
        ))
    }

    async fn write_stdin_task(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
        while let Some(data) = rx.recv().await {
            trace!("Sending to stdin: {}", data);
            if let Err(e) = stdin.write_all(data.as_bytes()).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                error!("Failed to write newline to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }
        debug!("Stdin writer task ended");
    }

    async fn read_stdout_task(stdout: ChildStdout, tx: mpsc::Sender<String>) {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("Agent stdout closed");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        trace!("Agent stdout: {}", trimmed);
                        if tx.send(trimmed.to_string()).await.is_err() {
                            warn!("Failed to send stdout line, channel closed");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("Error reading agent stdout: {}", e);
                    break;
                }
            }
        }
    }

    async fn read_stderr_task(stderr: ChildStderr, program: String) {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        // Agents log here routinely; never fatal.
                        warn!("{} stderr: {}", program, trimmed);
                    }
                }
                Err(e) => {
                    error!("Error reading {} stderr: {}", program, e);
                    break;
                }
            }
        }
    }

    /// Serialize a message and queue it as one line
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.stdin_tx.send(json).await.map_err(|e| {
            Error::Provider(ProviderError::connection(format!("Failed to send: {}", e)))
        })
    }

    /// Next raw stdout line; `None` once the process closed stdout
    pub async fn recv_line(&self) -> Option<String> {
        let mut rx = self.stdout_rx.lock().await;
        rx.recv().await
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self._stdout_task.abort();
        self._stderr_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_spawn_invalid_command() {
        let result = Transport::spawn(&ProcessCommand::new("nonexistent_command_12345")).await;

        match result {
            Err(Error::Provider(ProviderError::Connection { message, auth_methods })) => {
                assert!(message.contains("Failed to spawn"));
                assert!(auth_methods.is_empty());
            }
            _ => panic!("Expected connection error"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lines_round_trip_through_cat() {
        let (transport, _child) = Transport::spawn(&ProcessCommand::new("cat")).await.unwrap();
        transport
            .send(&serde_json::json!({ "type": "ping", "n": 1 }))
            .await
            .unwrap();

        let line = transport.recv_line().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["n"], 1);
    }
}
