//! Messages exchanged between agents.

use crate::agent::AgentId;
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata key correlating task dispatches with their replies.
pub const TASK_ID_KEY: &str = "task_id";

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Work handed to an agent.
    Task,
    /// Successful reply to a task.
    Result,
    Question,
    Notification,
    /// Failed reply to a task.
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Task => "task",
            MessageType::Result => "result",
            MessageType::Question => "question",
            MessageType::Notification => "notification",
            MessageType::Error => "error",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task" => Ok(MessageType::Task),
            "result" => Ok(MessageType::Result),
            "question" => Ok(MessageType::Question),
            "notification" => Ok(MessageType::Notification),
            "error" => Ok(MessageType::Error),
            other => Err(Error::Validation(format!("unknown message type '{}'", other))),
        }
    }
}

/// A message between two agents.
///
/// Fields are fixed once the message is built; only the builder methods
/// below take `self` by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    sender: AgentId,
    receiver: AgentId,
    msg_type: MessageType,
    content: Payload,
    #[serde(default)]
    metadata: BTreeMap<String, Payload>,
    timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender: AgentId,
        receiver: AgentId,
        msg_type: MessageType,
        content: Payload,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            receiver,
            msg_type,
            content,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// A message addressed to the broadcast sentinel.
    pub fn broadcast(sender: AgentId, msg_type: MessageType, content: Payload) -> Self {
        Self::new(sender, AgentId::broadcast(), msg_type, content)
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Payload>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Tag the message with the task it belongs to.
    pub fn for_task(self, task_id: TaskId) -> Self {
        self.with_metadata(TASK_ID_KEY, task_id.to_string())
    }

    /// The per-subscriber copy used by broadcast: fresh id and timestamp,
    /// everything else carried over.
    pub fn addressed_to(&self, receiver: AgentId) -> Self {
        Self {
            id: MessageId::new(),
            receiver,
            timestamp: Utc::now(),
            ..self.clone()
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> &AgentId {
        &self.sender
    }

    pub fn receiver(&self) -> &AgentId {
        &self.receiver
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn content(&self) -> &Payload {
        &self.content
    }

    pub fn metadata(&self) -> &BTreeMap<String, Payload> {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The task this message belongs to, if it carries a parseable tag.
    pub fn task_id(&self) -> Option<TaskId> {
        self.metadata
            .get(TASK_ID_KEY)
            .and_then(Payload::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn involves(&self, agent: &AgentId) -> bool {
        &self.sender == agent || &self.receiver == agent
    }

    /// JSON object with keys `id, sender, receiver, msg_type, content,
    /// metadata, timestamp`.
    pub fn to_value(&self) -> Result<Payload> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Payload) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
