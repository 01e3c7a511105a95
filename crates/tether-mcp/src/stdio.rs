//! Stdio transport for provider processes.
//!
//! Spawns a child process and manages async communication over stdin/stdout
//! using newline-delimited JSON-RPC messages. Stderr is diagnostic output and
//! only ever logged.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::transport::{EventSender, LineBuffer, Transport, TransportEvent, TransportFuture};

/// How long a freshly spawned process must stay alive to count as started.
const STARTUP_GRACE: Duration = Duration::from_millis(100);

/// How long `close` waits for the process to exit after stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Async stdio transport for communicating with a provider process.
pub struct StdioTransport {
    name: String,
    write_tx: Mutex<Option<mpsc::Sender<String>>>,
    child: Arc<Mutex<Child>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    stderr_handle: Option<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawn the configured command and start background reader/writer tasks.
    ///
    /// Fails with [`McpError::ProcessStart`] if the process has already exited
    /// once the startup grace period elapses.
    pub async fn spawn(config: &ServerConfig, events: EventSender) -> Result<Self, McpError> {
        let name = config.name.clone();
        let command = config.command.as_deref().unwrap_or_default();

        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.clone(),
            source: e,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::ProcessStart {
            name: name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::ProcessStart {
            name: name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        // Writer task: drains channel and writes to child stdin
        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
        let writer_handle = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = write_rx.recv().await {
                if stdin.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: splits stdout into lines and forwards them
        let reader_name = name.clone();
        let reader_handle = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut lines = LineBuffer::new();
            let mut chunk = vec![0u8; 8192];
            let reason = loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break "process exited".to_string(),
                    Ok(n) => {
                        for line in lines.push(&chunk[..n]) {
                            if events.send(TransportEvent::Message(line)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => break format!("stdout read failed: {e}"),
                }
            };
            if lines.pending() > 0 {
                tracing::debug!(
                    "Discarding {} bytes of partial output from '{}'",
                    lines.pending(),
                    reader_name
                );
            }
            let _ = events.send(TransportEvent::Closed { reason });
        });

        let stderr_handle = stderr.map(|stderr| {
            let stderr_name = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{}] {}", stderr_name, line);
                }
            })
        });

        let transport = Self {
            name,
            write_tx: Mutex::new(Some(write_tx)),
            child: Arc::new(Mutex::new(child)),
            reader_handle,
            writer_handle,
            stderr_handle,
        };

        tokio::time::sleep(STARTUP_GRACE).await;
        let exited = transport.child.lock().await.try_wait()?;
        if let Some(status) = exited {
            transport.close().await;
            return Err(McpError::ProcessStart {
                name: transport.name.clone(),
                reason: format!("exited with {status}"),
            });
        }

        tracing::debug!("Spawned provider process '{}'", transport.name);
        Ok(transport)
    }

    async fn shutdown(&self) {
        // Drop write channel to send EOF to child stdin
        drop(self.write_tx.lock().await.take());

        let graceful = tokio::time::timeout(SHUTDOWN_GRACE, async {
            let mut child = self.child.lock().await;
            let _ = child.wait().await;
        })
        .await;

        if graceful.is_err() {
            tracing::debug!("Provider '{}' ignored stdin EOF, killing", self.name);
            let mut child = self.child.lock().await;
            let _ = child.kill().await;
        }

        self.reader_handle.abort();
        self.writer_handle.abort();
        if let Some(handle) = &self.stderr_handle {
            handle.abort();
        }
    }
}

impl Transport for StdioTransport {
    fn send(&self, message: String) -> TransportFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            let tx = self.write_tx.lock().await.clone();
            let tx = tx.ok_or_else(|| McpError::Transport {
                name: self.name.clone(),
                message: "transport closed".into(),
            })?;
            tx.send(message).await.map_err(|_| McpError::Transport {
                name: self.name.clone(),
                message: "writer channel closed".into(),
            })
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(self.shutdown())
    }
}
