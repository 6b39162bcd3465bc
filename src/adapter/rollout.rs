//! Adapter for agents that narrate their work into a JSONL rollout
//! journal instead of structured stdout.
//!
//! The child's stdout is opaque. The adapter locates the newest journal
//! created after spawn under `<root>/sessions/YYYY/MM/DD/rollout-*.jsonl`
//! (greatest mtime, ties broken by lexicographic filename), tails it
//! while the child runs, and takes the final non-empty assistant record
//! or the child's clean exit, whichever comes first, as the turn result.
//! The child keeps no conversation state; the orchestrator re-injects
//! condensed context into every prompt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::process::{drain_stderr, probe_version, spawn_child, terminate_child};
use super::{
    AdapterDescriptor, AdapterEvent, AdapterHealth, AgentAdapter, EventStream, TurnOutcome,
    TurnRequest, compose_prompt,
};
use crate::config::AdapterDefaults;
use crate::error::AdapterFailure;

pub const JOURNAL_ROOT_ENV: &str = "JOURNAL_ROOT";

/// One parsed journal line. Unrecognized shapes are skipped.
#[derive(Debug, Deserialize)]
struct JournalLine {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Default)]
struct UsageTotals {
    input_tokens: u64,
    output_tokens: u64,
    seen: bool,
}

struct Shared {
    descriptor: AdapterDescriptor,
    defaults: AdapterDefaults,
}

pub struct RolloutJournalAdapter {
    shared: Arc<Shared>,
}

impl RolloutJournalAdapter {
    pub fn new(descriptor: AdapterDescriptor, defaults: AdapterDefaults) -> Self {
        Self {
            shared: Arc::new(Shared {
                descriptor,
                defaults,
            }),
        }
    }
}

#[async_trait]
impl AgentAdapter for RolloutJournalAdapter {
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

    let Some(journal_root) = shared
        .descriptor
        .journal_root
        .clone()
        .or_else(|| std::env::var_os(JOURNAL_ROOT_ENV).map(PathBuf::from))
    else {
        return AdapterEvent::Failed(AdapterFailure::permanent(
            "rollout journal root not configured",
        ));
    };

    let spawn_mark = SystemTime::now();
    let extra_args = vec![compose_prompt(&request.context, &request.prompt)];
    let mut child = match spawn_child(&shared.descriptor, &request.working_dir, &extra_args, false)
    {
        Ok(child) => child,
        Err(err) => return AdapterEvent::Failed(AdapterFailure::spawn(&err)),
    };
    let stderr_tail = drain_stderr(&mut child);

    let deadline_at = tokio::time::Instant::now() + request.limits.deadline;
    let mut interval =
        tokio::time::interval(Duration::from_millis(shared.defaults.rollout_poll_ms.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut tail = JournalTail::new(journal_root, spawn_mark);

    let status = loop {
        tokio::select! {
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
            _ = interval.tick() => {
                tail.poll(tx).await;
                match child.try_wait() {
                    Ok(Some(status)) => {
                        // One final read to catch lines flushed at exit.
                        tail.poll(tx).await;
                        break status;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        terminate_child(&mut child, grace).await;
                        return AdapterEvent::Failed(AdapterFailure::transient(format!(
                            "wait failed: {}",
                            err
                        )));
                    }
                }
            }
        }
    };

    let stderr = stderr_tail.await.unwrap_or_default();

    if !status.success() {
        return AdapterEvent::Failed(AdapterFailure::from_exit(
            status.code().unwrap_or(-1),
            &stderr,
        ));
    }

    let Some(content) = tail.last_assistant_record() else {
        return AdapterEvent::Failed(AdapterFailure::transient(
            "clean exit without any assistant record in the journal",
        ));
    };

    let (cost, cost_reported) = derive_cost(&shared.descriptor, &tail.usage);

    AdapterEvent::Completed(TurnOutcome {
        content,
        cost,
        cost_reported,
        duration_ms: started.elapsed().as_millis() as u64,
        adapter_session_id: tail.journal_id(),
    })
}

/// Cost from token counts when the descriptor carries rates; otherwise
/// zero with the unreported flag.
fn derive_cost(descriptor: &AdapterDescriptor, usage: &UsageTotals) -> (f64, bool) {
    match (
        usage.seen,
        descriptor.usd_per_1k_input,
        descriptor.usd_per_1k_output,
    ) {
        (true, Some(rate_in), Some(rate_out)) => {
            let cost = usage.input_tokens as f64 / 1000.0 * rate_in
                + usage.output_tokens as f64 / 1000.0 * rate_out;
            (cost, true)
        }
        _ => (0.0, false),
    }
}

/// Incremental reader over the active journal file.
struct JournalTail {
    root: PathBuf,
    spawn_mark: SystemTime,
    path: Option<PathBuf>,
    /// Bytes already consumed up to the last complete line.
    offset: usize,
    records: Vec<String>,
    usage: UsageTotals,
}

impl JournalTail {
    fn new(root: PathBuf, spawn_mark: SystemTime) -> Self {
        Self {
            root,
            spawn_mark,
            path: None,
            offset: 0,
            records: Vec::new(),
            usage: UsageTotals::default(),
        }
    }

    fn last_assistant_record(&self) -> Option<String> {
        self.records.iter().rev().find(|r| !r.trim().is_empty()).cloned()
    }

    /// Journal id from the active filename (`rollout-<id>.jsonl`).
    fn journal_id(&self) -> Option<String> {
        let name = self.path.as_ref()?.file_stem()?.to_string_lossy();
        name.strip_prefix("rollout-").map(String::from)
    }

    async fn poll(&mut self, tx: &mpsc::Sender<AdapterEvent>) {
        if self.path.is_none() {
            self.path = locate_journal(&self.root, self.spawn_mark);
            if let Some(path) = &self.path {
                debug!(path = %path.display(), "Located active rollout journal");
                let _ = tx
                    .send(AdapterEvent::SessionAnnounced {
                        adapter_session_id: self.journal_id().unwrap_or_default(),
                    })
                    .await;
            }
        }
        let Some(path) = self.path.clone() else {
            return;
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Journal read failed");
                return;
            }
        };
        if bytes.len() <= self.offset {
            return;
        }

        let fresh = &bytes[self.offset..];
        // Only complete lines; a partially flushed line waits for the
        // next poll.
        let consumed = match fresh.iter().rposition(|&b| b == b'\n') {
            Some(last_newline) => last_newline + 1,
            None => return,
        };

        for line in fresh[..consumed].split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let Ok(parsed) = serde_json::from_slice::<JournalLine>(line) else {
                continue;
            };
            match parsed.kind.as_deref() {
                Some("assistant_message") => {
                    if let Some(content) = parsed.content
                        && !content.is_empty()
                    {
                        let _ = tx
                            .send(AdapterEvent::Chunk {
                                text: content.clone(),
                            })
                            .await;
                        self.records.push(content);
                    }
                }
                Some("token_count") => {
                    self.usage.input_tokens += parsed.input_tokens.unwrap_or(0);
                    self.usage.output_tokens += parsed.output_tokens.unwrap_or(0);
                    self.usage.seen = true;
                }
                _ => {}
            }
        }

        self.offset += consumed;
    }
}

/// Newest journal created strictly after spawn; greatest mtime wins and
/// ties fall to the lexicographically greatest filename.
fn locate_journal(root: &Path, spawn_mark: SystemTime) -> Option<PathBuf> {
    let sessions = root.join("sessions");
    let mut best: Option<(SystemTime, String, PathBuf)> = None;

    for entry in WalkDir::new(&sessions).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !(name.starts_with("rollout-") && name.ends_with(".jsonl")) {
            continue;
        }
        let Some(mtime) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
            continue;
        };
        if mtime <= spawn_mark {
            continue;
        }

        let is_better = match &best {
            None => true,
            Some((best_mtime, best_name, _)) => {
                mtime > *best_mtime || (mtime == *best_mtime && name > *best_name)
            }
        };
        if is_better {
            best = Some((mtime, name, entry.into_path()));
        }
    }

    best.map(|(_, _, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CancelToken, Transport, TurnLimits};
    use crate::error::FailureKind;
    use tempfile::TempDir;

    fn adapter_for_script(script: &str, root: &Path) -> RolloutJournalAdapter {
        let descriptor =
            AdapterDescriptor::new("mock", "codex_cli", "sh", Transport::RolloutJournal)
                .with_args(vec!["-c".to_string(), script.to_string()])
                .with_env("JR", root.display().to_string())
                .with_journal_root(root);
        RolloutJournalAdapter::new(descriptor, low_latency_defaults())
    }

    fn low_latency_defaults() -> AdapterDefaults {
        AdapterDefaults {
            rollout_poll_ms: 20,
            ..AdapterDefaults::default()
        }
    }

    fn request(deadline: Duration) -> TurnRequest {
        TurnRequest {
            session_id: "bridge-session".to_string(),
            prompt: "reproduce the bug".to_string(),
            context: Vec::new(),
            limits: TurnLimits {
                deadline,
                max_cost: 1.0,
            },
            working_dir: PathBuf::from("."),
            cancel: CancelToken::new(),
        }
    }

    const WRITE_JOURNAL: &str = r#"
        sleep 0.1
        dir="$JR/sessions/2025/08/02"
        mkdir -p "$dir"
        printf '%s\n' \
            '{"type":"assistant_message","content":"working on it"}' \
            '{"type":"tool_call","tool":{"name":"shell"}}' \
            '{"type":"assistant_message","content":"patch proposal ready"}' \
            '{"type":"token_count","input_tokens":1000,"output_tokens":500}' \
            > "$dir/rollout-run1.jsonl"
    "#;

    #[tokio::test]
    async fn test_result_is_final_assistant_record() {
        let root = TempDir::new().unwrap();
        let adapter = adapter_for_script(WRITE_JOURNAL, root.path());

        let outcome = adapter
            .submit(request(Duration::from_secs(10)))
            .await
            .terminal()
            .await
            .unwrap();

        assert_eq!(outcome.content, "patch proposal ready");
        assert_eq!(outcome.adapter_session_id.as_deref(), Some("run1"));
        // No rates configured: zero cost, flagged unreported.
        assert_eq!(outcome.cost, 0.0);
        assert!(!outcome.cost_reported);
    }

    #[tokio::test]
    async fn test_cost_derived_from_token_counts() {
        let root = TempDir::new().unwrap();
        let descriptor =
            AdapterDescriptor::new("mock", "codex_cli", "sh", Transport::RolloutJournal)
                .with_args(vec!["-c".to_string(), WRITE_JOURNAL.to_string()])
                .with_env("JR", root.path().display().to_string())
                .with_journal_root(root.path())
                .with_token_rates(3.0, 15.0);
        let adapter = RolloutJournalAdapter::new(descriptor, low_latency_defaults());

        let outcome = adapter
            .submit(request(Duration::from_secs(10)))
            .await
            .terminal()
            .await
            .unwrap();

        // 1000/1k * 3.0 + 500/1k * 15.0
        assert!((outcome.cost - 10.5).abs() < 1e-9);
        assert!(outcome.cost_reported);
    }

    #[tokio::test]
    async fn test_stale_journals_are_ignored() {
        let root = TempDir::new().unwrap();
        let stale_dir = root.path().join("sessions/2025/08/01");
        std::fs::create_dir_all(&stale_dir).unwrap();
        std::fs::write(
            stale_dir.join("rollout-stale.jsonl"),
            "{\"type\":\"assistant_message\",\"content\":\"stale result\"}\n",
        )
        .unwrap();

        let adapter = adapter_for_script(WRITE_JOURNAL, root.path());
        let outcome = adapter
            .submit(request(Duration::from_secs(10)))
            .await
            .terminal()
            .await
            .unwrap();

        assert_eq!(outcome.content, "patch proposal ready");
    }

    #[tokio::test]
    async fn test_clean_exit_without_journal_is_transient() {
        let root = TempDir::new().unwrap();
        let adapter = adapter_for_script("true", root.path());

        let failure = adapter
            .submit(request(Duration::from_secs(5)))
            .await
            .terminal()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn test_timeout_terminates_child() {
        let root = TempDir::new().unwrap();
        let adapter = adapter_for_script("sleep 30", root.path());

        let failure = adapter
            .submit(request(Duration::from_millis(300)))
            .await
            .terminal()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn test_fatal_exit_is_classified() {
        let root = TempDir::new().unwrap();
        let adapter = adapter_for_script("echo 'invalid subcommand' >&2; exit 2", root.path());

        let failure = adapter
            .submit(request(Duration::from_secs(5)))
            .await
            .terminal()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
    }

    #[test]
    fn test_locate_journal_tie_break_is_lexicographic() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("sessions/2025/08/02");
        std::fs::create_dir_all(&dir).unwrap();

        let mark = SystemTime::now() - Duration::from_secs(1);
        let a = dir.join("rollout-aaa.jsonl");
        let b = dir.join("rollout-bbb.jsonl");
        std::fs::write(&a, "{}\n").unwrap();
        std::fs::write(&b, "{}\n").unwrap();
        // Force identical mtimes via the same content rewrite window is
        // not reliable; assert only on the observable contract: whichever
        // wins must be one of the two, and with equal mtimes it is the
        // lexicographically greater name.
        let found = locate_journal(root.path(), mark).unwrap();
        let meta_a = std::fs::metadata(&a).unwrap().modified().unwrap();
        let meta_b = std::fs::metadata(&b).unwrap().modified().unwrap();
        if meta_a == meta_b {
            assert_eq!(found, b);
        } else {
            assert!(found == a || found == b);
        }
    }
}
