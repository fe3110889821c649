//! In-process signaling link.
//!
//! A link is a pair of queues: a bounded client-to-server queue and an
//! unbounded server-to-client queue. The server side never waits on a slow
//! client, so a room can fan out to its members while one of them is busy.
//! WebSocket adapters on either side translate frames into these queues.

use crate::messages::{AckResult, ClientEnvelope, ServerEvent, ServerMessage};
use tokio::sync::mpsc;

/// Capacity of the client-to-server queue.
pub const CLIENT_QUEUE_CAPACITY: usize = 64;

/// Client end of a link.
#[derive(Debug)]
pub struct ClientLink {
    pub outbound: mpsc::Sender<ClientEnvelope>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Server end of a link.
#[derive(Debug)]
pub struct ServerLink {
    pub inbound: mpsc::Receiver<ClientEnvelope>,
    pub outbound: OutboundSender,
}

/// Create a connected client/server link pair.
#[must_use]
pub fn link_pair() -> (ClientLink, ServerLink) {
    let (client_tx, server_rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
    let (server_tx, client_rx) = mpsc::unbounded_channel();

    (
        ClientLink {
            outbound: client_tx,
            inbound: client_rx,
        },
        ServerLink {
            inbound: server_rx,
            outbound: OutboundSender::new(server_tx),
        },
    )
}

/// Cloneable handle for pushing frames to one client.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl OutboundSender {
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { sender }
    }

    /// Push an event. Returns `false` if the client is gone.
    pub fn send_event(&self, event: ServerEvent) -> bool {
        self.sender.send(ServerMessage::Event(event)).is_ok()
    }

    /// Push an ack. Returns `false` if the client is gone.
    pub fn send_ack(&self, request_id: u64, result: AckResult) -> bool {
        self.sender
            .send(ServerMessage::Ack { request_id, result })
            .is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Whether both handles feed the same client queue.
    #[must_use]
    pub fn same_channel(&self, other: &OutboundSender) -> bool {
        self.sender.same_channel(&other.sender)
    }
}
