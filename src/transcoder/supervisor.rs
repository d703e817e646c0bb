//! Encoder process supervision
//!
//! Owns exactly one external encoder per session: spawn, stdout pump with
//! backpressure, stderr classification, exit observation, and the
//! graceful-then-forceful stop contract (write `q`, wait the grace period,
//! then kill).

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::TranscoderConfig;
use crate::errors::{TranscoderError, TranscoderResult};

const CHUNK_SIZE: usize = 32 * 1024;
const CHANNEL_DEPTH: usize = 64;
const STDERR_TAIL_LINES: usize = 32;

/// Final outcome of an encoder process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderExit {
    /// Process exit code, `None` when killed by signal.
    pub code: Option<i32>,
    /// Whether any stdout bytes were produced before exit.
    pub produced_output: bool,
}

impl EncoderExit {
    /// A non-zero exit before any bytes is a hard failure; after bytes it is
    /// a soft end-of-stream.
    pub fn is_hard_failure(&self) -> bool {
        !self.produced_output && self.code != Some(0)
    }
}

/// Internal control messages for the owning task.
#[derive(Debug)]
pub enum EncoderEvent {
    Stop,
}

/// Handle to a live encoder. The byte receiver is taken exactly once by the
/// session's pump; everything else is shared observation state.
pub struct RunningEncoder {
    session_id: String,
    chunks: Option<mpsc::Receiver<Bytes>>,
    exit_rx: watch::Receiver<Option<EncoderExit>>,
    stop_tx: mpsc::Sender<EncoderEvent>,
    bytes_produced: Arc<AtomicU64>,
    error_count: Arc<AtomicU32>,
    stderr_tail: Arc<std::sync::Mutex<std::collections::VecDeque<String>>>,
}

impl RunningEncoder {
    /// Take ownership of the stdout byte channel. Panics if taken twice;
    /// exactly one pumper owns the pipe.
    pub fn take_chunks(&mut self) -> mpsc::Receiver<Bytes> {
        self.chunks
            .take()
            .expect("encoder byte channel already taken")
    }

    /// Request the graceful-then-forceful stop sequence. Idempotent; safe to
    /// call from any teardown path.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(EncoderEvent::Stop);
    }

    /// Clonable handle for teardown hooks that outlive this struct.
    pub fn stop_sender(&self) -> mpsc::Sender<EncoderEvent> {
        self.stop_tx.clone()
    }

    /// Observe process exit. Yields `None` until the process has exited.
    pub fn exit_receiver(&self) -> watch::Receiver<Option<EncoderExit>> {
        self.exit_rx.clone()
    }

    /// Wait for the process to exit and return the outcome.
    pub async fn wait_exit(&self) -> EncoderExit {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = *rx.borrow() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Owning task gone without publishing: treat as killed.
                return EncoderExit {
                    code: None,
                    produced_output: self.bytes_produced() > 0,
                };
            }
        }
    }

    pub fn bytes_produced(&self) -> u64 {
        self.bytes_produced.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Shared error counter for observers that outlive this handle.
    pub fn error_counter(&self) -> Arc<AtomicU32> {
        self.error_count.clone()
    }

    /// Most recent error-class stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Spawns and supervises encoder processes.
pub struct TranscoderSupervisor {
    command: String,
    stop_grace: Duration,
}

impl TranscoderSupervisor {
    pub fn new(config: &TranscoderConfig) -> Self {
        Self {
            command: config.ffmpeg_command.clone(),
            stop_grace: config.stop_grace_period,
        }
    }

    #[cfg(test)]
    pub fn with_command(command: &str, stop_grace: Duration) -> Self {
        Self {
            command: command.to_string(),
            stop_grace,
        }
    }

    /// Start an encoder for one session and wire up its pipes.
    pub async fn spawn(
        &self,
        session_id: &str,
        args: Vec<String>,
    ) -> TranscoderResult<RunningEncoder> {
        debug!(session_id, command = %self.command, ?args, "spawning encoder");

        let mut cmd = TokioCommand::new(&self.command);
        cmd.args(&args);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| TranscoderError::SpawnFailed(e.to_string()))?;

        let pid = child.id();
        info!(session_id, pid, "encoder started");

        let bytes_produced = Arc::new(AtomicU64::new(0));
        let error_count = Arc::new(AtomicU32::new(0));
        let stderr_tail = Arc::new(std::sync::Mutex::new(
            std::collections::VecDeque::with_capacity(STDERR_TAIL_LINES),
        ));

        let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let (exit_tx, exit_rx) = watch::channel::<Option<EncoderExit>>(None);
        let (stop_tx, stop_rx) = mpsc::channel::<EncoderEvent>(4);

        let stdout = child.stdout.take().ok_or(TranscoderError::MissingStdout)?;
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();

        // Stdout pump: the single owner of the pipe. A bounded channel gives
        // the consumer backpressure against a fast encoder.
        {
            let bytes_produced = bytes_produced.clone();
            let stop_tx = stop_tx.clone();
            let session = session_id.to_string();
            tokio::spawn(async move {
                let mut reader = stdout;
                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    match reader.read(&mut buf).await {
                        Ok(0) => {
                            debug!(session_id = %session, "encoder stdout ended");
                            break;
                        }
                        Ok(n) => {
                            bytes_produced.fetch_add(n as u64, Ordering::Relaxed);
                            if chunk_tx
                                .send(Bytes::copy_from_slice(&buf[..n]))
                                .await
                                .is_err()
                            {
                                // Consumer gone: stop the encoder rather than
                                // pump into the void.
                                let _ = stop_tx.try_send(EncoderEvent::Stop);
                                break;
                            }
                        }
                        Err(e) => {
                            error!(session_id = %session, error = %e, "encoder stdout read failed");
                            break;
                        }
                    }
                }
            });
        }

        // Stderr drain: classify lines, bump the error counter, keep a tail.
        if let Some(stderr) = stderr {
            let error_count = error_count.clone();
            let stderr_tail = stderr_tail.clone();
            let session = session_id.to_string();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if is_error_line(&line) {
                        error_count.fetch_add(1, Ordering::Relaxed);
                        if let Ok(mut tail) = stderr_tail.lock() {
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line.clone());
                        }
                        warn!(session_id = %session, line = %line, "encoder error output");
                    } else {
                        debug!(session_id = %session, line = %line, "encoder output");
                    }
                }
            });
        }

        // Owning task: waits for exit, executes the stop contract.
        {
            let bytes_produced = bytes_produced.clone();
            let stderr_tail = stderr_tail.clone();
            let grace = self.stop_grace;
            let session = session_id.to_string();
            tokio::spawn(async move {
                let exit =
                    supervise_child(child, stdin, stop_rx, grace, &session, &bytes_produced).await;
                if exit.is_hard_failure()
                    && let Ok(tail) = stderr_tail.lock()
                {
                    for line in tail.iter() {
                        error!(session_id = %session, line = %line, "encoder failure output");
                    }
                }
                let _ = exit_tx.send(Some(exit));
            });
        }

        Ok(RunningEncoder {
            session_id: session_id.to_string(),
            chunks: Some(chunk_rx),
            exit_rx,
            stop_tx,
            bytes_produced,
            error_count,
            stderr_tail,
        })
    }
}

async fn supervise_child(
    mut child: tokio::process::Child,
    mut stdin: Option<tokio::process::ChildStdin>,
    mut stop_rx: mpsc::Receiver<EncoderEvent>,
    grace: Duration,
    session_id: &str,
    bytes_produced: &AtomicU64,
) -> EncoderExit {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx.recv() => {
            // Graceful stop: ffmpeg treats `q` on stdin as a quit request.
            if let Some(mut pipe) = stdin.take() {
                let _ = pipe.write_all(b"q").await;
                let _ = pipe.shutdown().await;
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(session_id, grace_secs = grace.as_secs(), "encoder ignored graceful stop, killing");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    let code = status.ok().and_then(|s| s.code());
    let produced_output = bytes_produced.load(Ordering::Relaxed) > 0;
    let exit = EncoderExit {
        code,
        produced_output,
    };

    if exit.is_hard_failure() {
        error!(session_id, ?code, "encoder failed before producing output");
    } else {
        info!(session_id, ?code, produced_output, "encoder exited");
    }
    exit
}

/// Error-class stderr lines, matched the way encoder output actually reads.
fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("error")
        || lower.contains("failed")
        || lower.contains("invalid")
        || lower.contains("could not")
        || lower.contains("unable to")
        || lower.contains("not found")
}
