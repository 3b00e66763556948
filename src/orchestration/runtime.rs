//! Agent runtime: the loop that turns mailbox messages into worker calls.
//!
//! Each registered worker gets one tokio task. The task waits on the
//! agent's mailbox, runs the worker for every `task` message and replies
//! to the sender with a `result` or `error` message tagged with the same
//! task ID.

use crate::agent::AgentId;
use crate::bus::{Message, MessageBus, MessageType};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::Payload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a single mailbox wait lasts before the loop re-checks state.
const RECEIVE_POLL: Duration = Duration::from_secs(1);

/// What a worker is asked to do. This is the content of a `task` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub action: String,
    #[serde(default)]
    pub input_data: Payload,
    #[serde(default)]
    pub metadata: BTreeMap<String, Payload>,
}

/// Pluggable task behaviour: given a request, produce a result or fail.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn process(&self, request: TaskRequest) -> Result<Payload>;
}

/// Adapts a plain closure into a [`Worker`].
pub struct FnWorker<F> {
    f: F,
}

impl<F> FnWorker<F>
where
    F: Fn(TaskRequest) -> Result<Payload> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Worker for FnWorker<F>
where
    F: Fn(TaskRequest) -> Result<Payload> + Send + Sync + 'static,
{
    async fn process(&self, request: TaskRequest) -> Result<Payload> {
        (self.f)(request)
    }
}

/// A running agent loop.
pub struct AgentRuntime {
    agent_id: AgentId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl AgentRuntime {
    /// Spawn the loop for `agent_id`. The agent must already have a mailbox
    /// on `bus`; the loop ends when the token is cancelled or the mailbox
    /// is removed.
    pub fn spawn(
        agent_id: AgentId,
        worker: Arc<dyn Worker>,
        bus: Arc<MessageBus>,
        cancel: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(run_loop(
            agent_id.clone(),
            worker,
            bus,
            cancel.clone(),
        ));
        info!(agent = %agent_id, "agent runtime started");
        Self {
            agent_id,
            cancel,
            handle,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Ask the loop to stop. In-flight work finishes first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(agent = %self.agent_id, error = %e, "agent runtime ended abnormally");
        }
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agent_id", &self.agent_id)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

async fn run_loop(
    agent_id: AgentId,
    worker: Arc<dyn Worker>,
    bus: Arc<MessageBus>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = bus.receive(&agent_id, RECEIVE_POLL) => received,
        };

        match received {
            Ok(Some(message)) if message.msg_type() == MessageType::Task => {
                let reply = handle_task(&agent_id, &worker, &message).await;
                bus.send(reply);
            }
            Ok(Some(message)) => {
                debug!(
                    agent = %agent_id,
                    msg_type = %message.msg_type(),
                    sender = %message.sender(),
                    "ignoring non-task message"
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(agent = %agent_id, error = %e, "mailbox unavailable, stopping runtime");
                break;
            }
        }
    }
    info!(agent = %agent_id, "agent runtime stopped");
}

async fn handle_task(agent_id: &AgentId, worker: &Arc<dyn Worker>, message: &Message) -> Message {
    let outcome = match serde_json::from_value::<TaskRequest>(message.content().clone()) {
        Ok(request) => {
            debug!(
                agent = %agent_id,
                task = %request.task_id.short(),
                action = %request.action,
                "processing task"
            );
            // A panicking worker surfaces as a join error instead of
            // killing the loop.
            let worker = Arc::clone(worker);
            match tokio::spawn(async move { worker.process(request).await }).await {
                Ok(result) => result,
                Err(e) => Err(Error::Worker(format!("worker panicked: {}", e))),
            }
        }
        Err(e) => Err(Error::Worker(format!("malformed task request: {}", e))),
    };

    let reply = match outcome {
        Ok(payload) => Message::new(
            agent_id.clone(),
            message.sender().clone(),
            MessageType::Result,
            payload,
        ),
        Err(e) => {
            warn!(agent = %agent_id, error = %e, "task failed in worker");
            Message::new(
                agent_id.clone(),
                message.sender().clone(),
                MessageType::Error,
                json!({ "error": e.to_string() }),
            )
        }
    };

    match message.task_id() {
        Some(task_id) => reply.for_task(task_id),
        None => reply,
    }
}
