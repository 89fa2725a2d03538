//! Lifecycle of one device session.
//!
//! ```text
//! Idle → Discovering → AwaitingHandoffAck → AwaitingSecureHandshake → Authenticating → Active
//!            ↑                 ↓                       ↓
//!            └─────────────────┴───────────────────────┘  (retry after backoff)
//! Active → Authenticating when the secure link drops or is replaced
//! any → Failed(reason) | Closed;  Failed | Closed → Idle (explicit restart)
//! ```
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Discovering,
    AwaitingHandoffAck,
    AwaitingSecureHandshake,
    Authenticating,
    Active,
    Failed(String),
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid session transition {from} -> {to}")]
pub struct SessionStateError {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Idle, Discovering) => true,
            // A failed attempt returns to discovery after the backoff delay.
            (Discovering, Discovering) => true,
            (Discovering, AwaitingHandoffAck) => true,
            (AwaitingHandoffAck, AwaitingSecureHandshake) => true,
            (AwaitingHandoffAck, Discovering) => true,
            (AwaitingSecureHandshake, Authenticating) => true,
            (AwaitingSecureHandshake, Discovering) => true,
            (Authenticating, Active) => true,
            // The device re-dialed; its new stream must pass the password check.
            (Active, Authenticating) => true,
            (Closed, Closed) => true,
            (Closed, Failed(_)) => false,
            (_, Failed(_)) | (_, Closed) => true,
            (Failed(_), Idle) | (Closed, Idle) => true,
            _ => false,
        }
    }

    /// Validates and returns the next state.
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionStateError> {
        if self.can_transition_to(&next) {
            Ok(next)
        } else {
            Err(SessionStateError {
                from: self.clone(),
                to: next,
            })
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    /// True once the session can no longer progress without a restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed(_) | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Discovering => write!(f, "discovering"),
            SessionState::AwaitingHandoffAck => write!(f, "awaiting-handoff-ack"),
            SessionState::AwaitingSecureHandshake => write!(f, "awaiting-secure-handshake"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::Active => write!(f, "active"),
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}
