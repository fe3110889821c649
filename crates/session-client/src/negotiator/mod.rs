//! Session negotiator.
//!
//! One [`SessionActor`] per participant session drives the join sequence
//! against the room registry:
//!
//! ```text
//! Idle -> AcquiringMedia -> Connecting -> DeviceReady -> TransportsPending -> Active
//!   ^                                                                          |
//!   +---------------------------------- Leaving <------------------------------+
//! ```
//!
//! Spectators skip `AcquiringMedia` and only open a receive transport.
//! Remote tracks announced before the receive transport is ready wait in a
//! [`PendingTracks`](crate::pending::PendingTracks) queue and are consumed
//! once it connects.
//!
//! Callers talk to the actor through a cloneable [`SessionHandle`] and
//! observe progress as [`SessionEvent`]s on a broadcast channel.

mod actor;

pub use actor::SessionActor;

use crate::config::{ClientConfig, IceServer, RecoverySettings};
use crate::errors::SessionError;
use crate::media::RemoteTrack;

use common::types::{ParticipantId, ProducerId, RoomId, TransportId};
use signaling_protocol::{MediaKind, TransportRole};
use std::fmt;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Command mailbox depth.
pub const SESSION_CHANNEL_BUFFER: usize = 64;

/// Event channel depth; slow subscribers lag and skip.
pub const SESSION_EVENT_BUFFER: usize = 256;

/// Negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AcquiringMedia,
    /// Capabilities requested.
    Connecting,
    DeviceReady,
    TransportsPending,
    Active,
    Leaving,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AcquiringMedia => "acquiring_media",
            SessionState::Connecting => "connecting",
            SessionState::DeviceReady => "device_ready",
            SessionState::TransportsPending => "transports_pending",
            SessionState::Active => "active",
            SessionState::Leaving => "leaving",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the session joins a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Capture local media, publish it, and subscribe to everyone else.
    Publisher,
    /// Receive-only.
    Spectator,
}

impl JoinMode {
    #[must_use]
    pub fn from_spectator(spectator: bool) -> Self {
        if spectator {
            JoinMode::Spectator
        } else {
            JoinMode::Publisher
        }
    }

    /// Transport roles the mode needs before the session is active.
    #[must_use]
    pub const fn roles(self) -> &'static [TransportRole] {
        match self {
            JoinMode::Publisher => &[TransportRole::Send, TransportRole::Recv],
            JoinMode::Spectator => &[TransportRole::Recv],
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinMode::Publisher => "publisher",
            JoinMode::Spectator => "spectator",
        }
    }
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and tuning of one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub room_id: RoomId,
    pub user_id: ParticipantId,
    pub recovery: RecoverySettings,
    pub ice_servers: Vec<IceServer>,
}

impl SessionSettings {
    /// Settings with default recovery timing and no ICE servers.
    #[must_use]
    pub fn new(room_id: RoomId, user_id: ParticipantId) -> Self {
        Self {
            room_id,
            user_id,
            recovery: RecoverySettings::default(),
            ice_servers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoverySettings) -> Self {
        self.recovery = recovery;
        self
    }
}

impl From<&ClientConfig> for SessionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            room_id: config.room_id.clone(),
            user_id: config.user_id.clone(),
            recovery: config.recovery,
            ice_servers: config.ice_servers.clone(),
        }
    }
}

/// Something the session did that a UI may want to render.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// A local track was accepted by the registry.
    Published {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    TrackAdded(RemoteTrack),
    TrackRemoved(RemoteTrack),
    ParticipantJoined {
        user_id: ParticipantId,
    },
    ParticipantLeft {
        user_id: ParticipantId,
    },
    RecoveryScheduled {
        role: TransportRole,
        attempt: u32,
        delay: Duration,
    },
    RecoveryExhausted {
        role: TransportRole,
        attempts: u32,
    },
    Error(SessionError),
}

/// Local track as seen in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrackInfo {
    pub id: String,
    pub kind: MediaKind,
    pub enabled: bool,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub mode: Option<JoinMode>,
    pub room_id: RoomId,
    pub user_id: ParticipantId,
    pub send_transport: Option<TransportId>,
    pub recv_transport: Option<TransportId>,
    pub local_tracks: Vec<LocalTrackInfo>,
    pub published: Vec<(ProducerId, MediaKind)>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub pending_tracks: usize,
}

/// Messages accepted by the session actor.
#[derive(Debug)]
pub(crate) enum SessionMessage {
    Join {
        mode: JoinMode,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Leave {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    ToggleTrack {
        kind: MediaKind,
        respond_to: oneshot::Sender<Result<bool, SessionError>>,
    },
    GetSnapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
}

/// Handle to a `SessionActor`.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    events: broadcast::Sender<SessionEvent>,
    cancel_token: CancellationToken,
}

impl SessionHandle {
    /// Join the configured room.
    ///
    /// Resolves once every transport the mode needs is connected, or with
    /// the error that aborted the join. The session is back in `Idle` after
    /// a failed join.
    pub async fn join(&self, mode: JoinMode) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Join {
            mode,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_stopped())?
    }

    /// Tear the session down and return to `Idle`.
    ///
    /// Identity and signaling link are kept, so the session can join again.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Leave { respond_to: tx }).await?;
        rx.await.map_err(|_| actor_stopped())?
    }

    /// Flip the local audio track. Returns the new enabled flag.
    pub async fn toggle_audio(&self) -> Result<bool, SessionError> {
        self.toggle(MediaKind::Audio).await
    }

    /// Flip the local video track. Returns the new enabled flag.
    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        self.toggle(MediaKind::Video).await
    }

    async fn toggle(&self, kind: MediaKind) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::ToggleTrack {
            kind,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_stopped())?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::GetSnapshot { respond_to: tx })
            .await?;
        rx.await.map_err(|_| actor_stopped())
    }

    pub async fn state(&self) -> Result<SessionState, SessionError> {
        Ok(self.snapshot().await?.state)
    }

    /// Subscribe to session events from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stop the session actor; an active session leaves the room first.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: SessionMessage) -> Result<(), SessionError> {
        self.sender.send(message).await.map_err(|_| actor_stopped())
    }
}

fn actor_stopped() -> SessionError {
    SessionError::Internal("session actor stopped".to_string())
}
