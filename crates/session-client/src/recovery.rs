//! Transport recovery.
//!
//! Watches connection-state transitions of the session's transports and
//! schedules one debounced retry per role when a transport fails. When the
//! timer fires the negotiator requests a fresh transport for that role over
//! a relay-only TCP path, superseding the failed one.
//!
//! Timer state is owned per session and per role. Only retries that
//! actually fire count as attempts; a failure that supersedes a pending
//! timer reuses its attempt number. A `connected` transition cancels the
//! role's timer and resets its attempt count. A failure after
//! `max_attempts` retries puts the role in a terminal given-up state until
//! the session is reset.

use crate::config::RecoverySettings;
use crate::media::ConnectionState;

use signaling_protocol::TransportRole;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A retry timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryTrigger {
    pub role: TransportRole,
    pub attempt: u32,
}

/// What the controller did with a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Ignored,
    Scheduled { attempt: u32, delay: Duration },
    /// Transport connected; any pending retry was cancelled.
    Reset,
    GaveUp { attempts: u32 },
}

#[derive(Debug, Default)]
struct RoleState {
    timer: Option<CancellationToken>,
    scheduled_attempt: Option<u32>,
    /// Retries that fired.
    attempts: u32,
    gave_up: bool,
}

impl RoleState {
    fn cancel_timer(&mut self) -> bool {
        self.scheduled_attempt = None;
        match self.timer.take() {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }
}

/// Per-session recovery controller.
#[derive(Debug)]
pub struct RecoveryController {
    settings: RecoverySettings,
    send: RoleState,
    recv: RoleState,
    triggers: mpsc::UnboundedSender<RecoveryTrigger>,
    cancel_token: CancellationToken,
}

impl RecoveryController {
    /// Create a controller whose timers report to `triggers`.
    ///
    /// Timers die with `parent`.
    #[must_use]
    pub fn new(
        settings: RecoverySettings,
        triggers: mpsc::UnboundedSender<RecoveryTrigger>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            settings,
            send: RoleState::default(),
            recv: RoleState::default(),
            triggers,
            cancel_token: parent.child_token(),
        }
    }

    fn role_state(&mut self, role: TransportRole) -> &mut RoleState {
        match role {
            TransportRole::Send => &mut self.send,
            TransportRole::Recv => &mut self.recv,
        }
    }

    fn backoff(&self, role: TransportRole) -> Duration {
        match role {
            TransportRole::Send => self.settings.send_backoff,
            TransportRole::Recv => self.settings.recv_backoff,
        }
    }

    /// Feed a connection-state transition of the current `role` transport.
    ///
    /// A send transport is retried on `failed`; a receive transport on
    /// `failed` or an unexpected `closed`. Nothing is scheduled unless
    /// `session_active`.
    pub fn observe(
        &mut self,
        role: TransportRole,
        state: ConnectionState,
        session_active: bool,
    ) -> RecoveryDecision {
        match state {
            ConnectionState::Connected => {
                let role_state = self.role_state(role);
                let cancelled = role_state.cancel_timer();
                role_state.attempts = 0;
                role_state.gave_up = false;
                if cancelled {
                    debug!(
                        target: "session.recovery",
                        role = %role,
                        "Transport connected, retry cancelled"
                    );
                }
                RecoveryDecision::Reset
            }
            ConnectionState::Failed => self.schedule(role, session_active),
            ConnectionState::Closed if role == TransportRole::Recv => {
                self.schedule(role, session_active)
            }
            _ => RecoveryDecision::Ignored,
        }
    }

    /// The transport request issued by a fired retry was rejected.
    ///
    /// No state transition will follow for a transport that was never
    /// created, so the rejection counts as another failure of the role.
    pub fn retry_rejected(&mut self, role: TransportRole, session_active: bool) -> RecoveryDecision {
        debug!(
            target: "session.recovery",
            role = %role,
            attempts = self.attempts(role),
            "Retry rejected by the registry"
        );
        self.schedule(role, session_active)
    }

    fn schedule(&mut self, role: TransportRole, session_active: bool) -> RecoveryDecision {
        if !session_active {
            return RecoveryDecision::Ignored;
        }

        let delay = self.backoff(role);
        let max_attempts = self.settings.max_attempts;
        let parent = self.cancel_token.clone();
        let triggers = self.triggers.clone();

        let role_state = self.role_state(role);
        if role_state.gave_up {
            return RecoveryDecision::Ignored;
        }
        role_state.cancel_timer();

        if role_state.attempts >= max_attempts {
            role_state.gave_up = true;
            warn!(
                target: "session.recovery",
                role = %role,
                attempts = role_state.attempts,
                "Transport recovery exhausted"
            );
            return RecoveryDecision::GaveUp {
                attempts: role_state.attempts,
            };
        }

        let attempt = role_state.attempts + 1;
        let timer = parent.child_token();
        role_state.timer = Some(timer.clone());
        role_state.scheduled_attempt = Some(attempt);

        tokio::spawn(async move {
            tokio::select! {
                () = timer.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = triggers.send(RecoveryTrigger { role, attempt });
                }
            }
        });

        info!(
            target: "session.recovery",
            role = %role,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Transport retry scheduled"
        );
        RecoveryDecision::Scheduled { attempt, delay }
    }

    /// Accept a fired trigger if it is still the role's current timer, and
    /// count it as an attempt.
    ///
    /// Returns `false` for triggers that raced a cancellation.
    pub fn accept(&mut self, trigger: RecoveryTrigger) -> bool {
        let role_state = self.role_state(trigger.role);
        if role_state.scheduled_attempt != Some(trigger.attempt) {
            return false;
        }
        role_state.timer = None;
        role_state.scheduled_attempt = None;
        role_state.attempts = trigger.attempt;
        true
    }

    /// Cancel every timer and forget all attempts.
    pub fn reset(&mut self) {
        for role in [TransportRole::Send, TransportRole::Recv] {
            let role_state = self.role_state(role);
            role_state.cancel_timer();
            role_state.attempts = 0;
            role_state.gave_up = false;
        }
    }

    #[must_use]
    pub fn attempts(&self, role: TransportRole) -> u32 {
        match role {
            TransportRole::Send => self.send.attempts,
            TransportRole::Recv => self.recv.attempts,
        }
    }

    #[must_use]
    pub fn is_pending(&self, role: TransportRole) -> bool {
        match role {
            TransportRole::Send => self.send.timer.is_some(),
            TransportRole::Recv => self.recv.timer.is_some(),
        }
    }

    #[must_use]
    pub fn has_given_up(&self, role: TransportRole) -> bool {
        match role {
            TransportRole::Send => self.send.gave_up,
            TransportRole::Recv => self.recv.gave_up,
        }
    }
}

impl Drop for RecoveryController {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
