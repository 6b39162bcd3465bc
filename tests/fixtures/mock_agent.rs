//! Scripted mock adapter for orchestrator tests without real CLI agents.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tab::adapter::{
    AdapterDescriptor, AdapterEvent, AdapterHealth, AgentAdapter, EventStream, Transport,
    TurnOutcome, TurnRequest,
};
use tab::error::AdapterFailure;

/// What the mock does for one submitted turn.
#[derive(Debug, Clone)]
pub enum TurnScript {
    Reply { content: String, cost: f64 },
    ReplyChunks { chunks: Vec<String>, cost: f64 },
    TransientFailure(String),
    PermanentFailure(String),
    /// Produce nothing until the deadline or cancellation fires.
    Hang,
}

impl TurnScript {
    pub fn reply(content: &str, cost: f64) -> Self {
        Self::Reply {
            content: content.to_string(),
            cost,
        }
    }
}

pub struct MockAgent {
    descriptor: AdapterDescriptor,
    script: Mutex<VecDeque<TurnScript>>,
    default_reply: TurnScript,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    context_sizes: Mutex<Vec<usize>>,
}

impl MockAgent {
    pub fn new(agent_id: &str) -> Self {
        Self {
            descriptor: AdapterDescriptor::new(agent_id, "mock", "true", Transport::LineJsonStdout),
            script: Mutex::new(VecDeque::new()),
            default_reply: TurnScript::reply("acknowledged", 0.01),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            context_sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failover(mut self, agent_id: &str) -> Self {
        self.descriptor = self.descriptor.with_failover(agent_id);
        self
    }

    pub fn with_script(self, turns: Vec<TurnScript>) -> Self {
        *self.script.lock() = turns.into();
        self
    }

    pub fn with_default_reply(mut self, content: &str, cost: f64) -> Self {
        self.default_reply = TurnScript::reply(content, cost);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn context_sizes(&self) -> Vec<usize> {
        self.context_sizes.lock().clone()
    }

    pub fn assert_called(&self, times: usize) {
        let calls = self.calls();
        assert_eq!(
            calls, times,
            "expected {} adapter calls, observed {}",
            times, calls
        );
    }

    fn next_script(&self) -> TurnScript {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

#[async_trait]
impl AgentAdapter for MockAgent {
    fn descriptor(&self) -> &AdapterDescriptor {
        &self.descriptor
    }

    async fn health_check(&self) -> AdapterHealth {
        AdapterHealth::healthy("mock 1.0.0")
    }

    async fn submit(&self, request: TurnRequest) -> EventStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());
        self.context_sizes.lock().push(request.context.len());

        let script = self.next_script();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let terminal = match script {
                TurnScript::Reply { content, cost } => AdapterEvent::Completed(TurnOutcome {
                    content,
                    cost,
                    cost_reported: true,
                    duration_ms: 5,
                    adapter_session_id: None,
                }),
                TurnScript::ReplyChunks { chunks, cost } => {
                    let mut content = String::new();
                    for chunk in chunks {
                        content.push_str(&chunk);
                        let _ = tx.send(AdapterEvent::Chunk { text: chunk }).await;
                    }
                    AdapterEvent::Completed(TurnOutcome {
                        content,
                        cost,
                        cost_reported: true,
                        duration_ms: 5,
                        adapter_session_id: None,
                    })
                }
                TurnScript::TransientFailure(reason) => {
                    AdapterEvent::Failed(AdapterFailure::transient(reason))
                }
                TurnScript::PermanentFailure(reason) => {
                    AdapterEvent::Failed(AdapterFailure::permanent(reason))
                }
                TurnScript::Hang => {
                    tokio::select! {
                        _ = request.cancel.cancelled() => {
                            AdapterEvent::Failed(AdapterFailure::cancelled())
                        }
                        _ = tokio::time::sleep(request.limits.deadline) => {
                            AdapterEvent::Failed(AdapterFailure::timeout(
                                request.limits.deadline.as_secs(),
                            ))
                        }
                    }
                }
            };
            let _ = tx.send(terminal).await;
        });

        EventStream::new(rx)
    }

    async fn shutdown(&self) -> tab::error::Result<()> {
        Ok(())
    }
}

/// Convenience: build and admit a mock, returning the handle used for
/// assertions.
pub fn admit(registry: &tab::AgentRegistry, agent: MockAgent) -> Arc<MockAgent> {
    let agent = Arc::new(agent);
    registry.admit(agent.clone());
    agent
}
