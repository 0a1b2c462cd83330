//! Call state machine implementation.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

use crate::types::{CallId, CallRole, CallType, UserId};

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// We hung up.
    LocalHangup,
    /// The peer hung up or the server closed the call.
    RemoteHangup,
    /// We declined an incoming call.
    LocalDecline,
    /// The callee declined our call.
    RemoteDecline,
    /// Nobody answered.
    Missed,
    /// The bounded wait for the peer expired.
    Timeout,
    /// Media, negotiation or transport failure.
    Failed,
}

/// Current state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CallState {
    /// No call.
    #[default]
    Idle,
    /// Outgoing call: acquiring media and creating the call record.
    Initiating,
    /// Outgoing call: offer sent, waiting for the callee.
    Outgoing,
    /// Incoming call: ringing locally, no media acquired.
    Incoming,
    /// Accepted, negotiating the media session.
    Connecting,
    /// Media session established.
    Connected,
    /// Terminal; cleanup runs before the session returns to `Idle`.
    Ended { reason: EndReason },
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// Non-idle and not yet ended.
    pub fn is_live(&self) -> bool {
        !self.is_idle() && !self.is_ended()
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Incoming)
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::Incoming)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Initiating => f.write_str("initiating"),
            Self::Outgoing => f.write_str("outgoing"),
            Self::Incoming => f.write_str("incoming"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Ended { reason } => write!(f, "ended ({reason:?})"),
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// Caller: the initial offer went out after the server created the call.
    OfferSent,
    /// Caller: the callee accepted.
    RemoteAccepted,
    /// Caller: the callee's answer was applied.
    RemoteAnswerApplied,
    /// Callee: local user accepted.
    LocalAccepted,
    /// Callee: the answer to the caller's offer went out.
    AnswerSent,
    /// Either side: remote media observed while still connecting.
    MediaFlowing,
    Terminated { reason: EndReason },
    /// Cleanup finished.
    Reset,
}

impl CallTransition {
    /// The role this transition is reserved for, if any.
    fn required_role(&self) -> Option<CallRole> {
        match self {
            Self::OfferSent | Self::RemoteAccepted | Self::RemoteAnswerApplied => {
                Some(CallRole::Caller)
            }
            Self::LocalAccepted | Self::AnswerSent => Some(CallRole::Callee),
            Self::MediaFlowing | Self::Terminated { .. } | Self::Reset => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// The single active call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    /// Unset for an outgoing call until the server confirms creation.
    call_id: Option<CallId>,
    pub local_user_id: UserId,
    pub remote_user_id: UserId,
    call_type: CallType,
    role: CallRole,
    pub state: CallState,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Offers emitted by this side, renegotiations included.
    pub offers_sent: u32,
}

impl CallSession {
    pub fn new_outgoing(
        local_user_id: UserId,
        remote_user_id: UserId,
        call_type: CallType,
        title: Option<String>,
    ) -> Self {
        Self {
            call_id: None,
            local_user_id,
            remote_user_id,
            call_type,
            role: CallRole::Caller,
            state: CallState::Initiating,
            title,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            offers_sent: 0,
        }
    }

    pub fn new_incoming(
        call_id: CallId,
        local_user_id: UserId,
        remote_user_id: UserId,
        call_type: CallType,
        title: Option<String>,
    ) -> Self {
        Self {
            call_id: Some(call_id),
            local_user_id,
            remote_user_id,
            call_type,
            role: CallRole::Callee,
            state: CallState::Incoming,
            title,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            offers_sent: 0,
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn is_caller(&self) -> bool {
        self.role == CallRole::Caller
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// True if `id` is this call's correlation key.
    pub fn matches(&self, id: &CallId) -> bool {
        self.call_id.as_ref() == Some(id)
    }

    /// Record the server-assigned id. Only the first assignment is kept;
    /// returns false if a different id was already set.
    pub fn assign_call_id(&mut self, id: CallId) -> bool {
        match &self.call_id {
            Some(existing) => *existing == id,
            None => {
                self.call_id = Some(id);
                true
            }
        }
    }

    /// The caller and callee ids in wire order.
    pub fn caller_and_receiver(&self) -> (&UserId, &UserId) {
        match self.role {
            CallRole::Caller => (&self.local_user_id, &self.remote_user_id),
            CallRole::Callee => (&self.remote_user_id, &self.local_user_id),
        }
    }

    /// Switch an audio call to video. Calls are never downgraded.
    pub fn upgrade_to_video(&mut self) -> Result<(), InvalidTransition> {
        if self.call_type.is_video() || !self.state.is_connected() {
            return Err(InvalidTransition {
                current_state: format!("{:?} {:?}", self.state, self.call_type),
                attempted: "UpgradeToVideo".to_string(),
            });
        }
        self.call_type = CallType::Video;
        Ok(())
    }

    /// Time since the call connected.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let until = self.ended_at.unwrap_or_else(Utc::now);
        Some(until.signed_duration_since(started))
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        if let Some(role) = transition.required_role()
            && role != self.role
        {
            return Err(self.invalid(transition));
        }

        let new_state = match (self.state, transition) {
            (CallState::Initiating, CallTransition::OfferSent) => CallState::Outgoing,
            (CallState::Outgoing, CallTransition::RemoteAccepted) => CallState::Connecting,
            (
                CallState::Outgoing | CallState::Connecting,
                CallTransition::RemoteAnswerApplied,
            ) => CallState::Connected,
            (CallState::Incoming, CallTransition::LocalAccepted) => CallState::Connecting,
            (CallState::Connecting, CallTransition::AnswerSent) => CallState::Connected,
            (CallState::Connecting, CallTransition::MediaFlowing) => CallState::Connected,
            (state, CallTransition::Terminated { reason }) if state.is_live() => {
                self.ended_at = Some(Utc::now());
                CallState::Ended { reason }
            }
            (CallState::Ended { .. }, CallTransition::Reset) => CallState::Idle,
            (_, transition) => return Err(self.invalid(transition)),
        };

        if new_state.is_connected() && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.state = new_state;
        Ok(())
    }

    fn invalid(&self, transition: CallTransition) -> InvalidTransition {
        InvalidTransition {
            current_state: format!("{:?} as {:?}", self.state, self.role),
            attempted: format!("{:?}", transition),
        }
    }
}
