//! Per-node command streams and request/response correlation.
//!
//! Each connected node owns a bounded outbound queue. Pushes never block:
//! when the queue is full the message is dropped, so one slow node cannot
//! back-pressure the control plane. Callers that need an answer register a
//! waiter under a fresh request id before the request is queued; the node's
//! receive loop hands every inbound message to [`CommandHub::deliver`].

use crate::metrics;
use meridian_core::CommandMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Why a message could not be queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("node {0} is not connected")]
    NotConnected(i64),

    #[error("queue of node {0} is full")]
    QueueFull(i64),
}

/// Why a command did not produce a response.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Push(#[from] PushError),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The waiter was swept or the hub dropped it.
    #[error("response channel closed")]
    Dropped,

    #[error("failed to encode command data: {0}")]
    Encode(String),
}

/// Receiving half handed to the transport for one node.
#[derive(Debug)]
pub struct CommandConnection {
    pub connection_id: u64,
    pub receiver: mpsc::Receiver<CommandMessage>,
}

struct Outbound {
    connection_id: u64,
    sender: mpsc::Sender<CommandMessage>,
}

struct Waiter {
    node_id: i64,
    sender: oneshot::Sender<CommandMessage>,
    registered_at: Instant,
}

/// Registry of node streams and outstanding request waiters.
pub struct CommandHub {
    queue_capacity: usize,
    connections: Mutex<HashMap<i64, Outbound>>,
    waiters: Mutex<HashMap<i64, Waiter>>,
    next_request_id: AtomicI64,
    next_connection_id: AtomicU64,
}

impl CommandHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            connections: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            next_request_id: AtomicI64::new(1),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Open the outbound queue of a node. A newer connection replaces an older
    /// one; the old receiver then sees its channel closed.
    pub async fn connect(&self, node_id: i64) -> CommandConnection {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let replaced = self.connections.lock().await.insert(
            node_id,
            Outbound {
                connection_id,
                sender,
            },
        );
        if replaced.is_none() {
            metrics::CONNECTED_STREAMS.inc();
        }
        tracing::debug!(node_id, connection_id, "Command stream connected");

        CommandConnection {
            connection_id,
            receiver,
        }
    }

    /// Close a node's queue, unless it was already replaced by a newer connection.
    pub async fn disconnect(&self, node_id: i64, connection_id: u64) {
        let mut connections = self.connections.lock().await;
        if connections
            .get(&node_id)
            .is_some_and(|c| c.connection_id == connection_id)
        {
            connections.remove(&node_id);
            metrics::CONNECTED_STREAMS.dec();
            tracing::debug!(node_id, connection_id, "Command stream disconnected");
        }
    }

    pub async fn is_connected(&self, node_id: i64) -> bool {
        self.connections.lock().await.contains_key(&node_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Queue a message without waiting.
    pub async fn push(&self, node_id: i64, message: CommandMessage) -> Result<(), PushError> {
        let mut connections = self.connections.lock().await;
        let Some(outbound) = connections.get(&node_id) else {
            return Err(PushError::NotConnected(node_id));
        };

        let code = message.code.clone();
        match outbound.sender.try_send(message) {
            Ok(()) => {
                metrics::COMMANDS_SENT.with_label_values(&[code.as_str()]).inc();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::COMMANDS_DROPPED.inc();
                tracing::warn!(node_id, code = %code, "Command queue full, dropping message");
                Err(PushError::QueueFull(node_id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                connections.remove(&node_id);
                metrics::CONNECTED_STREAMS.dec();
                Err(PushError::NotConnected(node_id))
            }
        }
    }

    /// Nudge a node to fetch its tasks. Best effort.
    pub async fn notify_new_task(&self, node_id: i64) -> bool {
        match self.push(node_id, CommandMessage::new_node_task()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!(node_id, reason = %e, "Task nudge not delivered");
                false
            }
        }
    }

    /// Send a request and wait for the node's response.
    ///
    /// The waiter is registered before the request is queued, so a response
    /// can never arrive ahead of its waiter.
    pub async fn send_command(
        &self,
        node_id: i64,
        code: &str,
        data: &serde_json::Value,
        timeout: Duration,
    ) -> Result<CommandMessage, CommandError> {
        let data_json = if data.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(data).map_err(|e| CommandError::Encode(e.to_string()))?
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.waiters.lock().await.insert(
            request_id,
            Waiter {
                node_id,
                sender,
                registered_at: Instant::now(),
            },
        );

        let request = CommandMessage::request(request_id, code, data_json);
        if let Err(e) = self.push(node_id, request).await {
            self.waiters.lock().await.remove(&request_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CommandError::Dropped),
            Err(_) => {
                self.waiters.lock().await.remove(&request_id);
                metrics::COMMANDS_TIMED_OUT.inc();
                tracing::debug!(node_id, request_id, "Command timed out");
                Err(CommandError::Timeout(timeout))
            }
        }
    }

    /// Route an inbound message from `node_id` to its waiter.
    ///
    /// Returns false when nobody waits for it, in which case it is dropped.
    pub async fn deliver(&self, node_id: i64, message: CommandMessage) -> bool {
        let mut waiters = self.waiters.lock().await;
        let Some(waiter) = waiters.remove(&message.request_id) else {
            tracing::debug!(node_id, request_id = message.request_id, "No waiter for response");
            return false;
        };
        if waiter.node_id != node_id {
            tracing::warn!(
                node_id,
                request_id = message.request_id,
                expected_node_id = waiter.node_id,
                "Response from unexpected node ignored"
            );
            waiters.insert(message.request_id, waiter);
            return false;
        }
        drop(waiters);

        waiter.sender.send(message).is_ok()
    }

    pub async fn pending_waiters(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// Drop waiters registered at least `stale_after` ago. Their callers see
    /// [`CommandError::Dropped`].
    pub async fn sweep(&self, stale_after: Duration) -> usize {
        let mut waiters = self.waiters.lock().await;
        let before = waiters.len();
        waiters.retain(|_, w| w.registered_at.elapsed() < stale_after);
        let swept = before - waiters.len();

        if swept > 0 {
            metrics::COMMAND_WAITERS_SWEPT.inc_by(swept as u64);
            tracing::info!(swept, "Swept stale command waiters");
        }
        swept
    }

    /// Run [`CommandHub::sweep`] every `interval`.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, stale_after: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.sweep(stale_after).await;
            }
        })
    }
}
