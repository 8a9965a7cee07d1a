//! Progress fan-out.
//!
//! Every subscriber gets its own bounded channel. Publishing never awaits:
//! a full queue drops the event for that subscriber (counted), a closed
//! receiver gets its sender pruned. The compile pipeline must never stall
//! on a slow display.

use crate::compile::CompileStage;
use crate::story::NodeId;
use crate::util::{gen_id, now_ms};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

const SUBSCRIBER_QUEUE_CAP: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Started,
    StageChanged,
    CacheHit,
    Synthesized,
    Encoded,
    NodeFailed,
    Finished,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub stage: CompileStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    pub timestamp_ms: i64,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, stage: CompileStage) -> Self {
        Self {
            kind,
            stage,
            node: None,
            detail: String::new(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProgressBusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub dropped_events: u64,
    pub active_subscriptions: usize,
}

pub struct ProgressBus {
    subscribers: DashMap<String, mpsc::Sender<ProgressEvent>>,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber. Unsubscribe by dropping the receiver (the
    /// sender is pruned on the next publish) or calling [`unsubscribe`].
    ///
    /// [`unsubscribe`]: ProgressBus::unsubscribe
    pub fn subscribe(&self) -> (String, mpsc::Receiver<ProgressEvent>) {
        let id = format!("sub_{}", gen_id());
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAP);
        self.subscribers.insert(id.clone(), tx);
        debug!(target = "compiler", subscriber = %id, "Progress subscription created");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &str) {
        self.subscribers.remove(id);
    }

    /// Fan out one event. Returns how many subscribers received it.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0usize;
        let mut closed: Vec<String> = Vec::new();
        for sub in self.subscribers.iter() {
            match sub.value().try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        target = "compiler",
                        subscriber = %sub.key(),
                        "Dropped progress event for slow subscriber"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(sub.key().clone());
                }
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn stats(&self) -> ProgressBusStats {
        ProgressBusStats {
            total_published: self.published.load(Ordering::Relaxed),
            total_delivered: self.delivered.load(Ordering::Relaxed),
            dropped_events: self.dropped.load(Ordering::Relaxed),
            active_subscriptions: self.subscribers.len(),
        }
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
