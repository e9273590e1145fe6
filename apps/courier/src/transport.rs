use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::model::{generate_id, ConnectionId};
use crate::protocol::ServerFrame;

pub type TransportHandle = Arc<dyn Transport>;

/// Session-layer primitives the delivery engine is built on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget send.
    fn emit(&self, connection: &str, event: &str, payload: Option<Value>) -> CoreResult<()>;

    /// Sends and waits up to `timeout` for the client's acknowledgement,
    /// returning the client's response payload.
    async fn emit_with_ack(
        &self,
        connection: &str,
        event: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> CoreResult<Option<Value>>;

    fn is_live(&self, connection: &str) -> bool;
}

#[derive(Debug)]
struct AckReply {
    error: Option<String>,
    result: Option<Value>,
}

type PendingAcks = Arc<DashMap<u64, oneshot::Sender<AckReply>>>;

struct ConnectionHandle {
    tx: mpsc::UnboundedSender<ServerFrame>,
    pending: PendingAcks,
}

/// WebSocket-backed [`Transport`]: one outbound frame queue per connection
/// plus the acknowledgements still awaited on it.
#[derive(Default)]
pub struct SocketHub {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    next_ack: AtomicU64,
}

impl SocketHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates a connection identity and the queue its writer task drains.
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let connection_id = generate_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            connection_id.clone(),
            ConnectionHandle {
                tx,
                pending: Arc::new(DashMap::new()),
            },
        );
        (connection_id, rx)
    }

    /// Drops the connection; outstanding acknowledgements resolve as transport failures.
    pub fn unregister(&self, connection: &str) {
        if let Some((_, handle)) = self.connections.remove(connection) {
            let outstanding = handle.pending.len();
            handle.pending.clear();
            if outstanding > 0 {
                debug!(connection_id = %connection, outstanding, "dropped pending acknowledgements");
            }
        }
    }

    /// Routes a client acknowledgement to the task waiting on it.
    pub fn resolve_ack(
        &self,
        connection: &str,
        ack_id: u64,
        error: Option<String>,
        result: Option<Value>,
    ) {
        let waiter = self
            .connections
            .get(connection)
            .and_then(|handle| handle.pending.remove(&ack_id));
        match waiter {
            Some((_, sender)) => {
                let _ = sender.send(AckReply { error, result });
            }
            None => debug!(connection_id = %connection, ack_id, "late or unknown acknowledgement"),
        }
    }

    /// Answers a client request that carried an `ack_id`.
    pub fn reply(&self, connection: &str, ack_id: u64, result: CoreResult<Value>) -> CoreResult<()> {
        let frame = match result {
            Ok(value) => ServerFrame::Ack {
                ack_id,
                error: None,
                result: Some(value),
            },
            Err(err) => ServerFrame::Ack {
                ack_id,
                error: Some(err.to_string()),
                result: None,
            },
        };
        self.send_frame(connection, frame)
    }

    pub fn send_frame(&self, connection: &str, frame: ServerFrame) -> CoreResult<()> {
        let handle = self
            .connections
            .get(connection)
            .ok_or_else(|| CoreError::Presence(connection.to_string()))?;
        handle
            .tx
            .send(frame)
            .map_err(|_| CoreError::Transport(format!("connection `{connection}` is closing")))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

fn require_event(event: &str) -> CoreResult<()> {
    if event.is_empty() {
        return Err(CoreError::missing("event"));
    }
    Ok(())
}

#[async_trait]
impl Transport for SocketHub {
    fn emit(&self, connection: &str, event: &str, payload: Option<Value>) -> CoreResult<()> {
        require_event(event)?;
        self.send_frame(
            connection,
            ServerFrame::Event {
                event: event.to_string(),
                payload,
                ack_id: None,
            },
        )
    }

    async fn emit_with_ack(
        &self,
        connection: &str,
        event: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> CoreResult<Option<Value>> {
        require_event(event)?;
        let ack_id = self.next_ack.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = oneshot::channel();

        // Take what we need from the map before awaiting so no DashMap guard
        // is held across the suspension point.
        let pending = {
            let handle = self
                .connections
                .get(connection)
                .ok_or_else(|| CoreError::Presence(connection.to_string()))?;
            handle.pending.insert(ack_id, sender);
            let frame = ServerFrame::Event {
                event: event.to_string(),
                payload,
                ack_id: Some(ack_id),
            };
            if handle.tx.send(frame).is_err() {
                handle.pending.remove(&ack_id);
                return Err(CoreError::Transport(format!(
                    "connection `{connection}` is closing"
                )));
            }
            Arc::clone(&handle.pending)
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(AckReply {
                error: Some(reason),
                ..
            })) => Err(CoreError::ClientRejected {
                event: event.to_string(),
                reason,
            }),
            Ok(Ok(AckReply { result, .. })) => Ok(result),
            Ok(Err(_)) => Err(CoreError::Transport(format!(
                "connection `{connection}` closed before acknowledging `{event}`"
            ))),
            Err(_) => {
                pending.remove(&ack_id);
                Err(CoreError::DeliveryTimeout {
                    event: event.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn is_live(&self, connection: &str) -> bool {
        self.connections
            .get(connection)
            .map(|handle| !handle.tx.is_closed())
            .unwrap_or(false)
    }
}
