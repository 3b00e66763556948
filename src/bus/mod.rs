//! In-process message bus.
//!
//! Every registered agent owns an unbounded FIFO mailbox. Direct messages
//! go to one mailbox; broadcasts fan out one addressed copy per subscriber
//! of the message type.

pub mod message;

pub use message::{Message, MessageId, MessageType, TASK_ID_KEY};

use crate::agent::AgentId;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl Mailbox {
    fn push(&self, message: Message) {
        lock(&self.queue).push_back(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        lock(&self.queue).pop_front()
    }

    fn len(&self) -> usize {
        lock(&self.queue).len()
    }
}

/// Filter for [`MessageBus::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Match messages sent or received by this agent.
    pub agent: Option<AgentId>,
    pub msg_type: Option<MessageType>,
    /// Most recent N matches; all matches when `None`.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BusStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub broadcasts_sent: u64,
    pub registered_agents: usize,
    pub active_subscriptions: usize,
    pub total_pending: usize,
}

pub struct MessageBus {
    mailboxes: RwLock<HashMap<AgentId, Arc<Mailbox>>>,
    subscriptions: RwLock<HashMap<MessageType, BTreeSet<AgentId>>>,
    history: Mutex<VecDeque<Message>>,
    history_capacity: usize,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    broadcasts_sent: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_capacity,
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            broadcasts_sent: AtomicU64::new(0),
        }
    }

    fn mailbox(&self, agent: &AgentId) -> Option<Arc<Mailbox>> {
        self.mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent)
            .cloned()
    }

    /// Create a mailbox for `agent`. Re-registering keeps the existing one.
    pub fn register_agent(&self, agent: &AgentId) {
        let mut mailboxes = self.mailboxes.write().unwrap_or_else(PoisonError::into_inner);
        if mailboxes.contains_key(agent) {
            warn!(agent = %agent, "agent already registered with message bus");
            return;
        }
        mailboxes.insert(agent.clone(), Arc::new(Mailbox::default()));
        debug!(agent = %agent, "agent registered with message bus");
    }

    /// Drop the agent's mailbox and every subscription it holds.
    pub fn unregister_agent(&self, agent: &AgentId) {
        self.mailboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent);
        for subscribers in self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .values_mut()
        {
            subscribers.remove(agent);
        }
        debug!(agent = %agent, "agent unregistered from message bus");
    }

    pub fn is_registered(&self, agent: &AgentId) -> bool {
        self.mailbox(agent).is_some()
    }

    /// Deliver a message to its receiver's mailbox.
    ///
    /// A message addressed to the broadcast sentinel goes to every
    /// subscriber of its type instead. An unknown receiver is registered
    /// on the spot.
    pub fn send(&self, message: Message) {
        if message.receiver().is_broadcast() {
            self.broadcast(&message);
            return;
        }
        let mailbox = match self.mailbox(message.receiver()) {
            Some(mailbox) => mailbox,
            None => {
                warn!(
                    receiver = %message.receiver(),
                    sender = %message.sender(),
                    "auto-registering unknown receiver"
                );
                self.register_agent(message.receiver());
                match self.mailbox(message.receiver()) {
                    Some(mailbox) => mailbox,
                    None => return,
                }
            }
        };

        debug!(
            sender = %message.sender(),
            receiver = %message.receiver(),
            msg_type = %message.msg_type(),
            "message sent"
        );
        self.record(message.clone());
        mailbox.push(message);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Wait up to `timeout` for the next message in `agent`'s mailbox.
    ///
    /// Returns `Ok(None)` when the timeout elapses.
    pub async fn receive(&self, agent: &AgentId, timeout: Duration) -> Result<Option<Message>> {
        let mailbox = self
            .mailbox(agent)
            .ok_or_else(|| Error::UnknownAgent(agent.clone()))?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(message) = mailbox.pop() {
                return Ok(Some(self.received(agent, message)));
            }
            if tokio::time::timeout_at(deadline, mailbox.notify.notified())
                .await
                .is_err()
            {
                return Ok(mailbox.pop().map(|m| self.received(agent, m)));
            }
        }
    }

    /// Take the next message without waiting.
    pub fn try_receive(&self, agent: &AgentId) -> Result<Option<Message>> {
        let mailbox = self
            .mailbox(agent)
            .ok_or_else(|| Error::UnknownAgent(agent.clone()))?;
        Ok(mailbox.pop().map(|m| self.received(agent, m)))
    }

    fn received(&self, agent: &AgentId, message: Message) -> Message {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        debug!(
            agent = %agent,
            sender = %message.sender(),
            msg_type = %message.msg_type(),
            "message received"
        );
        message
    }

    /// Send one addressed copy to every subscriber of the message's type.
    ///
    /// Returns the number of copies delivered.
    pub fn broadcast(&self, message: &Message) -> usize {
        let subscribers: Vec<AgentId> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.msg_type())
            .map(|s| s.iter().filter(|a| !a.is_broadcast()).cloned().collect())
            .unwrap_or_default();

        if subscribers.is_empty() {
            warn!(
                msg_type = %message.msg_type(),
                sender = %message.sender(),
                "broadcast has no subscribers"
            );
            return 0;
        }

        for agent in &subscribers {
            self.send(message.addressed_to(agent.clone()));
        }
        self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            msg_type = %message.msg_type(),
            subscribers = subscribers.len(),
            "broadcast sent"
        );
        subscribers.len()
    }

    pub fn subscribe(&self, agent: &AgentId, msg_type: MessageType) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(msg_type)
            .or_default()
            .insert(agent.clone());
        debug!(agent = %agent, %msg_type, "subscribed");
    }

    pub fn unsubscribe(&self, agent: &AgentId, msg_type: MessageType) {
        if let Some(subscribers) = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&msg_type)
        {
            subscribers.remove(agent);
        }
        debug!(agent = %agent, %msg_type, "unsubscribed");
    }

    /// Subscribers of a message type in delivery order.
    pub fn subscribers(&self, msg_type: MessageType) -> Vec<AgentId> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&msg_type)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_messages(&self, agent: &AgentId) -> bool {
        self.pending_count(agent) > 0
    }

    pub fn pending_count(&self, agent: &AgentId) -> usize {
        self.mailbox(agent).map(|m| m.len()).unwrap_or(0)
    }

    /// Drop every pending message for `agent`, returning how many were dropped.
    pub fn clear_mailbox(&self, agent: &AgentId) -> usize {
        let Some(mailbox) = self.mailbox(agent) else {
            return 0;
        };
        let mut queue = lock(&mailbox.queue);
        let count = queue.len();
        queue.clear();
        debug!(agent = %agent, count, "mailbox cleared");
        count
    }

    fn record(&self, message: Message) {
        if self.history_capacity == 0 {
            return;
        }
        let mut history = lock(&self.history);
        history.push_back(message);
        while history.len() > self.history_capacity {
            history.pop_front();
        }
    }

    /// Most recent matching messages, oldest first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<Message> {
        let history = lock(&self.history);
        let mut matches: Vec<Message> = history
            .iter()
            .rev()
            .filter(|m| filter.agent.as_ref().map_or(true, |a| m.involves(a)))
            .filter(|m| filter.msg_type.map_or(true, |t| m.msg_type() == t))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        matches.reverse();
        matches
    }

    pub fn stats(&self) -> BusStats {
        let mailboxes = self.mailboxes.read().unwrap_or_else(PoisonError::into_inner);
        let subscriptions = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
        BusStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
            registered_agents: mailboxes.len(),
            active_subscriptions: subscriptions.values().map(BTreeSet::len).sum(),
            total_pending: mailboxes.values().map(|m| m.len()).sum(),
        }
    }

    /// Clear mailboxes, subscriptions, history and counters.
    pub fn reset(&self) {
        self.mailboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        lock(&self.history).clear();
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.broadcasts_sent.store(0, Ordering::Relaxed);
        info!("message bus reset");
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MessageBus")
            .field("agents", &stats.registered_agents)
            .field("pending", &stats.total_pending)
            .field("sent", &stats.messages_sent)
            .field("received", &stats.messages_received)
            .finish()
    }
}
