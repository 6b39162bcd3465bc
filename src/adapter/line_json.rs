//! Adapter for agents that write one JSON object per line to stdout.
//!
//! Recognized line types: `system` (announces the child session id),
//! `assistant` (content chunks), `user` (echoed input, ignored) and
//! `result` (terminal). Non-JSON lines are logged and dropped; lines over
//! the configured cap are dropped without ever being buffered whole.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::process::{drain_stderr, probe_version, spawn_child, terminate_child};
use super::{
    AdapterDescriptor, AdapterEvent, AdapterHealth, AgentAdapter, EventStream, TurnOutcome,
    TurnRequest, compose_prompt,
};
use crate::config::AdapterDefaults;
use crate::error::AdapterFailure;

/// One parsed stdout line.
#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

pub(super) enum ReadLine {
    Line(String),
    /// A line exceeded the cap; carries the number of bytes dropped.
    Oversize(usize),
    Eof,
}

/// Line reader whose buffer never exceeds the configured cap. Once a line
/// overflows, the remainder is discarded up to the next newline.
pub(super) struct BoundedLineReader<R> {
    inner: R,
    max: usize,
}

impl<R: AsyncBufRead + Unpin> BoundedLineReader<R> {
    pub(super) fn new(inner: R, max: usize) -> Self {
        Self { inner, max }
    }

    pub(super) async fn next_line(&mut self) -> std::io::Result<ReadLine> {
        let mut buf: Vec<u8> = Vec::new();
        let mut skipping = false;
        let mut dropped = 0usize;

        loop {
            let chunk = self.inner.fill_buf().await?;
            if chunk.is_empty() {
                if skipping {
                    return Ok(ReadLine::Oversize(dropped));
                }
                if buf.is_empty() {
                    return Ok(ReadLine::Eof);
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                buf.clear();
                return Ok(ReadLine::Line(line));
            }

            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if skipping {
                        dropped += pos;
                        self.inner.consume(pos + 1);
                        return Ok(ReadLine::Oversize(dropped));
                    }
                    if buf.len() + pos > self.max {
                        dropped = buf.len() + pos;
                        self.inner.consume(pos + 1);
                        return Ok(ReadLine::Oversize(dropped));
                    }
                    buf.extend_from_slice(&chunk[..pos]);
                    self.inner.consume(pos + 1);
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    return Ok(ReadLine::Line(line));
                }
                None => {
                    let len = chunk.len();
                    if skipping {
                        dropped += len;
                    } else if buf.len() + len > self.max {
                        skipping = true;
                        dropped = buf.len() + len;
                        buf.clear();
                    } else {
                        buf.extend_from_slice(chunk);
                    }
                    self.inner.consume(len);
                }
            }
        }
    }
}

struct Shared {
    descriptor: AdapterDescriptor,
    defaults: AdapterDefaults,
    /// Bridge session id -> child-reported session id, for `--resume`.
    sessions: Mutex<HashMap<String, String>>,
}

pub struct LineJsonAdapter {
    shared: Arc<Shared>,
}

impl LineJsonAdapter {
    pub fn new(descriptor: AdapterDescriptor, defaults: AdapterDefaults) -> Self {
        Self {
            shared: Arc::new(Shared {
                descriptor,
                defaults,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Child session id that a subsequent submit for this bridge session
    /// would resume.
    pub fn resumed_session(&self, session_id: &str) -> Option<String> {
        self.shared.sessions.lock().get(session_id).cloned()
    }
}

#[async_trait]
impl AgentAdapter for LineJsonAdapter {
    fn descriptor(&self) -> &AdapterDescriptor {
        &self.shared.descriptor
    }

    async fn health_check(&self) -> AdapterHealth {
        probe_version(
            &self.shared.descriptor.command,
            &self.shared.descriptor.env,
            Duration::from_secs(self.shared.defaults.health_check_timeout_secs),
        )
        .await
    }

    async fn submit(&self, request: TurnRequest) -> EventStream {
        let (tx, rx) = mpsc::channel(64);
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let terminal = run_turn(&shared, &request, &tx).await;
            let _ = tx.send(terminal).await;
        });

        EventStream::new(rx)
    }

    async fn shutdown(&self) -> crate::error::Result<()> {
        self.shared.sessions.lock().clear();
        Ok(())
    }
}

async fn run_turn(
    shared: &Shared,
    request: &TurnRequest,
    tx: &mpsc::Sender<AdapterEvent>,
) -> AdapterEvent {
    let started = Instant::now();
    let grace = Duration::from_secs(shared.defaults.term_grace_secs);

    // A resumed child already holds the conversation; a fresh one gets
    // the condensed context inline.
    let resumed = shared.sessions.lock().get(&request.session_id).cloned();
    let mut extra_args = Vec::new();
    match &resumed {
        Some(child_session) => {
            extra_args.push("--resume".to_string());
            extra_args.push(child_session.clone());
            extra_args.push("-p".to_string());
            extra_args.push(request.prompt.clone());
        }
        None => {
            extra_args.push("-p".to_string());
            extra_args.push(compose_prompt(&request.context, &request.prompt));
        }
    }

    let mut child = match spawn_child(&shared.descriptor, &request.working_dir, &extra_args, true) {
        Ok(child) => child,
        Err(err) => return AdapterEvent::Failed(AdapterFailure::spawn(&err)),
    };
    let Some(stdout) = child.stdout.take() else {
        terminate_child(&mut child, grace).await;
        return AdapterEvent::Failed(AdapterFailure::permanent("child stdout not captured"));
    };
    let stderr_tail = drain_stderr(&mut child);
    let mut reader = BoundedLineReader::new(BufReader::new(stdout), shared.defaults.max_line_bytes);

    let deadline_at = tokio::time::Instant::now() + request.limits.deadline;
    let mut accumulated = String::new();
    let mut announced_session: Option<String> = None;
    let mut result_line: Option<StreamLine> = None;

    loop {
        let read = tokio::select! {
            read = reader.next_line() => read,
            _ = request.cancel.cancelled() => {
                terminate_child(&mut child, grace).await;
                return AdapterEvent::Failed(AdapterFailure::cancelled());
            }
            _ = tokio::time::sleep_until(deadline_at) => {
                terminate_child(&mut child, grace).await;
                return AdapterEvent::Failed(AdapterFailure::timeout(
                    request.limits.deadline.as_secs(),
                ));
            }
        };

        let line = match read {
            Ok(ReadLine::Line(line)) => line,
            Ok(ReadLine::Oversize(bytes)) => {
                warn!(
                    agent_id = %shared.descriptor.agent_id,
                    bytes,
                    cap = shared.defaults.max_line_bytes,
                    "Dropped oversize stdout line"
                );
                continue;
            }
            Ok(ReadLine::Eof) => break,
            Err(err) => {
                terminate_child(&mut child, grace).await;
                return AdapterEvent::Failed(AdapterFailure::transient(format!(
                    "stdout read failed: {}",
                    err
                )));
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let parsed: StreamLine = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(_) => {
                debug!(
                    agent_id = %shared.descriptor.agent_id,
                    "Dropped non-JSON stdout line"
                );
                continue;
            }
        };

        match parsed.kind.as_str() {
            "system" => {
                if let Some(session) = &parsed.session_id {
                    announced_session = Some(session.clone());
                    shared
                        .sessions
                        .lock()
                        .insert(request.session_id.clone(), session.clone());
                    let _ = tx
                        .send(AdapterEvent::SessionAnnounced {
                            adapter_session_id: session.clone(),
                        })
                        .await;
                }
            }
            "assistant" => {
                if let Some(content) = parsed.content {
                    accumulated.push_str(&content);
                    let _ = tx.send(AdapterEvent::Chunk { text: content }).await;
                }
            }
            "user" => {}
            "result" => {
                result_line = Some(parsed);
                break;
            }
            other => {
                debug!(
                    agent_id = %shared.descriptor.agent_id,
                    kind = other,
                    "Ignored unrecognized stream event"
                );
            }
        }
    }

    // Stream is done; give the child a moment to exit cleanly.
    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            return AdapterEvent::Failed(AdapterFailure::transient(format!(
                "wait failed: {}",
                err
            )));
        }
        Err(_) => {
            terminate_child(&mut child, grace).await;
            return AdapterEvent::Failed(AdapterFailure::transient(
                "child kept running after closing stdout",
            ));
        }
    };
    let stderr = stderr_tail.await.unwrap_or_default();

    let Some(result) = result_line else {
        return match status.code() {
            Some(0) => AdapterEvent::Failed(AdapterFailure::malformed(
                "stream ended without a result event",
            )),
            code => AdapterEvent::Failed(AdapterFailure::from_exit(code.unwrap_or(-1), &stderr)),
        };
    };

    if result.is_error.unwrap_or(false) {
        return AdapterEvent::Failed(AdapterFailure::permanent(format!(
            "agent reported error: {}",
            result.message.as_deref().unwrap_or("unspecified")
        )));
    }
    if !status.success() {
        return AdapterEvent::Failed(AdapterFailure::from_exit(
            status.code().unwrap_or(-1),
            &stderr,
        ));
    }

    if let Some(session) = &result.session_id {
        shared
            .sessions
            .lock()
            .insert(request.session_id.clone(), session.clone());
    }

    let content = result
        .result
        .filter(|text| !text.is_empty())
        .unwrap_or(accumulated);

    AdapterEvent::Completed(TurnOutcome {
        content,
        cost: result.cost_usd.unwrap_or(0.0),
        cost_reported: result.cost_usd.is_some(),
        duration_ms: result
            .duration_ms
            .unwrap_or_else(|| started.elapsed().as_millis() as u64),
        adapter_session_id: result.session_id.or(announced_session),
    })
}
