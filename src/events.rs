//! Typed domain events fanned out to SSE subscribers.
//!
//! Each subscription owns a bounded queue. Emission never blocks the
//! producer: a full queue drops the event for that subscriber only, and a
//! closed queue prunes the subscription on the next emit. A background task
//! broadcasts heartbeats to every subscriber regardless of filter.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PipelineCreated,
    PipelineUpdated,
    PipelineCompleted,
    AutopilotStarted,
    AutopilotStopped,
    Log,
    Heartbeat,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineCreated => "pipeline_created",
            Self::PipelineUpdated => "pipeline_updated",
            Self::PipelineCompleted => "pipeline_completed",
            Self::AutopilotStarted => "autopilot_started",
            Self::AutopilotStopped => "autopilot_stopped",
            Self::Log => "log",
            Self::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    /// Project the event belongs to; `None` for cross-project events like
    /// heartbeats.
    pub project_id: Option<String>,
    pub data: serde_json::Value,
}

impl Event {
    /// Render as an SSE frame: `event: <type>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_type.as_str(), self.data)
    }

    pub fn heartbeat() -> Self {
        Self {
            event_type: EventType::Heartbeat,
            project_id: None,
            data: json!({ "timestamp": now_rfc3339() }),
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

struct SubscriberHandle {
    tx: mpsc::Sender<Event>,
    project_id: Option<String>,
}

pub struct EventBus {
    subscribers: Mutex<HashMap<String, SubscriberHandle>>,
    queue_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Register a subscriber. With a project filter only that project's
    /// events are delivered; heartbeats always are. Dropping the returned
    /// subscription unregisters it.
    pub fn subscribe(self: &Arc<Self>, project_id: Option<String>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4().to_string();
        self.lock_subscribers().insert(
            id.clone(),
            SubscriberHandle {
                tx,
                project_id,
            },
        );
        Subscription {
            id,
            rx,
            bus: Arc::clone(self),
        }
    }

    /// Remove a subscriber. Unknown ids are a no-op.
    pub fn unsubscribe(&self, subscriber_id: &str) {
        self.lock_subscribers().remove(subscriber_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    /// Deliver to every subscription whose filter matches. Fire-and-forget:
    /// full queues are skipped, closed queues are pruned.
    pub fn emit(&self, event: Event) {
        self.deliver(event, false);
    }

    fn broadcast(&self, event: Event) {
        self.deliver(event, true);
    }

    fn deliver(&self, event: Event, ignore_filter: bool) {
        let mut subscribers = self.lock_subscribers();
        let mut closed = Vec::new();
        for (id, sub) in subscribers.iter() {
            let matches =
                ignore_filter || sub.project_id.is_none() || sub.project_id == event.project_id;
            if !matches {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = %id, "event queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id.clone()),
            }
        }
        for id in closed {
            subscribers.remove(&id);
        }
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<String, SubscriberHandle>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Broadcast a heartbeat to every subscriber on a fixed cadence.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                bus.broadcast(Event::heartbeat());
            }
        })
    }

    // ── Emit helpers ──────────────────────────────────────────────────

    pub fn pipeline_created(
        &self,
        pipeline_id: &str,
        project_id: &str,
        ticket_id: &str,
        state: &str,
    ) {
        self.emit(Event {
            event_type: EventType::PipelineCreated,
            project_id: Some(project_id.to_string()),
            data: json!({
                "pipeline_id": pipeline_id,
                "project_id": project_id,
                "ticket_id": ticket_id,
                "state": state,
            }),
        });
    }

    pub fn pipeline_updated(
        &self,
        pipeline_id: &str,
        project_id: &str,
        state: &str,
        previous_state: &str,
    ) {
        self.emit(Event {
            event_type: EventType::PipelineUpdated,
            project_id: Some(project_id.to_string()),
            data: json!({
                "pipeline_id": pipeline_id,
                "state": state,
                "previous_state": previous_state,
            }),
        });
    }

    pub fn pipeline_completed(&self, pipeline_id: &str, project_id: &str, final_state: &str) {
        self.emit(Event {
            event_type: EventType::PipelineCompleted,
            project_id: Some(project_id.to_string()),
            data: json!({
                "pipeline_id": pipeline_id,
                "final_state": final_state,
            }),
        });
    }

    pub fn autopilot_started(&self, project_id: &str) {
        self.emit(Event {
            event_type: EventType::AutopilotStarted,
            project_id: Some(project_id.to_string()),
            data: json!({ "project_id": project_id }),
        });
    }

    pub fn autopilot_stopped(&self, project_id: &str, reason: &str) {
        self.emit(Event {
            event_type: EventType::AutopilotStopped,
            project_id: Some(project_id.to_string()),
            data: json!({ "project_id": project_id, "reason": reason }),
        });
    }

    pub fn log(&self, pipeline_id: &str, project_id: &str, level: LogLevel, message: &str) {
        self.emit(Event {
            event_type: EventType::Log,
            project_id: Some(project_id.to_string()),
            data: json!({
                "pipeline_id": pipeline_id,
                "level": level.as_str(),
                "message": message,
                "timestamp": now_rfc3339(),
            }),
        });
    }
}

/// A registered subscriber's receiving end. Implements `Stream` so the SSE
/// handler can consume it directly; dropping it unsubscribes.
pub struct Subscription {
    id: String,
    rx: mpsc::Receiver<Event>,
    bus: Arc<EventBus>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl futures::Stream for Subscription {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.id);
    }
}
