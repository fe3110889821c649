//! `RegistryActor` - singleton supervisor for room actors.
//!
//! The `RegistryActor` is the top-level actor:
//!
//! - Singleton per process
//! - Maps room keys to `RoomActor` instances, spawning exactly one per key
//! - Removes rooms when they report themselves closed
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! Room creation is serialized through this actor's mailbox, so concurrent
//! first joiners of the same room always end up on the same room actor and
//! therefore the same routing context.

use crate::errors::RegistryError;
use crate::media::{MediaEngine, NetworkOptions};
use crate::network::AddressResolver;

use super::connection::{ConnectionActor, ConnectionActorHandle};
use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomSettings};

use common::types::{ConnectionId, RoomId};
use signaling_protocol::link::ServerLink;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Registry-wide limits and network settings.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub max_rooms: usize,
    pub room: RoomSettings,
    /// Local address media transports bind to.
    pub listen_ip: IpAddr,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_rooms: 1000,
            room: RoomSettings::default(),
            listen_ip: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Handle to the `RegistryActor`.
///
/// Also the entry point for new signaling connections, see [`Self::accept`].
#[derive(Clone)]
pub struct RegistryActorHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    resolver: Arc<AddressResolver>,
    listen_ip: IpAddr,
    metrics: Arc<ActorMetrics>,
}

impl RegistryActorHandle {
    /// Create a new `RegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(
        instance_id: String,
        engine: Arc<dyn MediaEngine>,
        resolver: Arc<AddressResolver>,
        settings: RegistrySettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RegistryActor::new(
            instance_id,
            receiver,
            sender.downgrade(),
            cancel_token.clone(),
            engine,
            settings,
            Arc::clone(&metrics),
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            resolver,
            listen_ip: settings.listen_ip,
            metrics,
        }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| RegistryError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RegistryError::Internal(format!("response receive failed: {e}")))
    }

    /// Return the actor for `room_id`, creating the room if absent.
    pub async fn get_or_create_room(&self, room_id: RoomId) -> Result<RoomActorHandle, RegistryError> {
        self.call(|respond_to| RegistryMessage::GetOrCreateRoom {
            room_id,
            respond_to,
        })
        .await?
    }

    /// Return the actor for `room_id` if the room exists.
    pub async fn lookup_room(&self, room_id: RoomId) -> Result<Option<RoomActorHandle>, RegistryError> {
        self.call(|respond_to| RegistryMessage::LookupRoom {
            room_id,
            respond_to,
        })
        .await
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, RegistryError> {
        self.call(|respond_to| RegistryMessage::GetStatus { respond_to })
            .await
    }

    /// Stop accepting rooms and cancel every room actor.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.call(|respond_to| RegistryMessage::Shutdown { respond_to })
            .await?
    }

    /// Network options for a new transport.
    pub async fn network_options(&self, force_tcp: bool) -> NetworkOptions {
        let announced_ip = self.resolver.announced_ip().await;
        NetworkOptions::new(self.listen_ip, announced_ip, force_tcp)
    }

    /// Start serving one signaling link.
    ///
    /// The returned task finishes when the client side of the link closes
    /// or the registry is cancelled; every room membership of the
    /// connection is released before it does.
    #[must_use]
    pub fn accept(&self, link: ServerLink) -> (ConnectionActorHandle, JoinHandle<()>) {
        ConnectionActor::spawn(
            ConnectionId::generate(),
            link,
            self.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        )
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    created_at: i64,
}

/// The `RegistryActor` implementation.
pub struct RegistryActor {
    instance_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Handed to room actors for `RoomClosed` reports.
    self_sender: mpsc::WeakSender<RegistryMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    engine: Arc<dyn MediaEngine>,
    rooms: HashMap<RoomId, ManagedRoom>,
    next_room_instance: u64,
    settings: RegistrySettings,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RegistryActor {
    fn new(
        instance_id: String,
        receiver: mpsc::Receiver<RegistryMessage>,
        self_sender: mpsc::WeakSender<RegistryMessage>,
        cancel_token: CancellationToken,
        engine: Arc<dyn MediaEngine>,
        settings: RegistrySettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Registry, &instance_id);

        Self {
            instance_id,
            receiver,
            self_sender,
            cancel_token,
            engine,
            rooms: HashMap::new(),
            next_room_instance: 1,
            settings,
            accepting_new: true,
            metrics,
            mailbox,
        }
    }

    #[instrument(skip_all, name = "rr.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "rr.actor.registry",
            instance_id = %self.instance_id,
            "RegistryActor started"
        );

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rr.actor.registry",
                        instance_id = %self.instance_id,
                        "RegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "rr.actor.registry",
                                instance_id = %self.instance_id,
                                "RegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rr.actor.registry",
            instance_id = %self.instance_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to,
            } => {
                let result = self.get_or_create_room(room_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::LookupRoom {
                room_id,
                respond_to,
            } => {
                let handle = self
                    .rooms
                    .get(&room_id)
                    .filter(|managed| !managed.handle.is_closed())
                    .map(|managed| managed.handle.clone());
                let _ = respond_to.send(handle);
            }

            RegistryMessage::RoomClosed {
                room_id,
                instance_id,
            } => {
                let current = self
                    .rooms
                    .get(&room_id)
                    .is_some_and(|managed| managed.handle.instance_id() == instance_id);
                if current {
                    self.remove_room(&room_id);
                } else {
                    debug!(
                        target: "rr.actor.registry",
                        room_id = %room_id,
                        instance_id,
                        "Ignoring close report from a replaced room"
                    );
                }
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown { respond_to } => {
                info!(
                    target: "rr.actor.registry",
                    instance_id = %self.instance_id,
                    room_count = self.rooms.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    fn get_or_create_room(&mut self, room_id: RoomId) -> Result<RoomActorHandle, RegistryError> {
        if let Some(managed) = self.rooms.get(&room_id) {
            if !managed.handle.is_closed() {
                return Ok(managed.handle.clone());
            }
            // Room exited but its close report is still queued behind us.
            self.remove_room(&room_id);
        }

        if !self.accepting_new || !self.engine.is_ready() {
            return Err(RegistryError::ServerNotReady);
        }
        if self.rooms.len() >= self.settings.max_rooms {
            return Err(RegistryError::CapacityExceeded(
                "room limit reached".to_string(),
            ));
        }

        let instance_id = self.next_room_instance;
        self.next_room_instance += 1;

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            instance_id,
            Arc::clone(&self.engine),
            self.self_sender.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
            self.settings.room,
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.room_created();

        info!(
            target: "rr.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            room_instance = instance_id,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    /// Remove a room without blocking the message loop on its task.
    fn remove_room(&mut self, room_id: &RoomId) {
        let Some(managed) = self.rooms.remove(room_id) else {
            return;
        };
        self.metrics.room_removed();

        let room_id_owned = room_id.clone();
        let lifetime = chrono::Utc::now().timestamp() - managed.created_at;
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rr.actor.registry",
                        room_id = %room_id_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rr.actor.registry",
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rr.actor.registry",
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });

        info!(
            target: "rr.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            lifetime_secs = lifetime,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            connection_count: self.metrics.connection_count(),
            participant_count: self.metrics.participant_count(),
            mailbox_depth: self.mailbox.current_depth(),
            engine_ready: self.engine.is_ready(),
            is_draining: !self.accepting_new,
        }
    }

    async fn graceful_shutdown(&mut self) {
        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(Duration::from_secs(30), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rr.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rr.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rr.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "rr.actor.registry",
            instance_id = %self.instance_id,
            "Graceful shutdown complete"
        );
    }

    /// Detect room actors that exited without reporting (panics).
    async fn check_room_health(&mut self) {
        let finished: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            self.metrics.room_removed();

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "rr.actor.registry",
                        room_id = %room_id,
                        "Room actor exited before its close report was processed"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "rr.actor.registry",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked - triggering investigation"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
        }
    }
}
