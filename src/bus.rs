//! Generic typed event bus
//!
//! Request/response message passing between the gateway modules. Each
//! topic has at most one subscribed handler; a request carries its own
//! one-shot reply slot. A missing handler (or one that drops the reply)
//! is the normal `Unavailable` outcome, not an error.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::config::GatewayConfig;

/// Listener keys a handler can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Configuration snapshot fetch / replacement notifications
    Config,
    /// Cache invalidation
    Cache,
    /// Process supervisor operations
    Process,
}

/// Last observed state of a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: Option<u32> },
    Exited { code: Option<i32> },
}

/// Requests routed over the bus. Reply-carrying variants embed their
/// one-shot sender.
#[derive(Debug)]
pub enum BusRequest {
    /// Fetch the current configuration snapshot
    FetchConfig {
        reply: oneshot::Sender<Arc<GatewayConfig>>,
    },
    /// Drop any cached state derived from the configuration
    ClearCache,
    /// Start a supervised process by name
    ProcessStart {
        name: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Stop a supervised process by name
    ProcessStop {
        name: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Query a supervised process
    ProcessStatus {
        name: String,
        reply: oneshot::Sender<ProcessState>,
    },
}

/// Delivery outcome of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No handler is subscribed for the topic
    Unavailable,
}

/// The bus itself. Cheap to clone and share.
#[derive(Clone, Default)]
pub struct Bus {
    handlers: Arc<DashMap<Topic, mpsc::UnboundedSender<BusRequest>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe the (single) handler for a topic. A later subscriber
    /// replaces an earlier one.
    pub fn subscribe(&self, topic: Topic) -> mpsc::UnboundedReceiver<BusRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handlers.insert(topic, tx);
        rx
    }

    /// Deliver a request to the topic's handler, if any
    pub fn publish(&self, topic: Topic, request: BusRequest) -> Delivery {
        match self.handlers.get(&topic) {
            Some(handler) => {
                if handler.send(request).is_ok() {
                    Delivery::Delivered
                } else {
                    // Handler hung up; forget it
                    drop(handler);
                    self.handlers.remove(&topic);
                    Delivery::Unavailable
                }
            }
            None => Delivery::Unavailable,
        }
    }

    /// Publish a reply-carrying request and await the answer.
    /// `None` means no handler was available or it dropped the reply.
    pub async fn request<T>(
        &self,
        topic: Topic,
        build: impl FnOnce(oneshot::Sender<T>) -> BusRequest,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if self.publish(topic, build(tx)) == Delivery::Unavailable {
            return None;
        }
        rx.await.ok()
    }
}
