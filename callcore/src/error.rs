//! Call-related error types.

use thiserror::Error;

use crate::state::InvalidTransition;

/// Errors surfaced to callers of the call operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("no authenticated identity")]
    NotAuthenticated,

    #[error("signaling transport unavailable")]
    TransportUnavailable,

    #[error("a call is already in progress")]
    CallInProgress,

    #[error("no incoming call to answer")]
    NoIncomingCall,

    #[error("no active call")]
    NoActiveCall,

    #[error("call is not connected")]
    CallNotConnected,

    #[error("call cannot be upgraded to video")]
    UpgradeUnavailable,

    #[error("camera or microphone permission denied")]
    PermissionDenied,

    #[error("capture device not found")]
    DeviceNotFound,

    #[error("timed out waiting for the remote peer")]
    ConnectionTimeout,

    #[error("session negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("remote peer disconnected")]
    RemoteDisconnected,

    #[error("call ended before the operation completed")]
    Cancelled,

    #[error("call engine stopped")]
    EngineStopped,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),
}

/// Failure reported by the media adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("device not found")]
    DeviceNotFound,

    #[error("negotiation error: {0}")]
    Negotiation(String),
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::PermissionDenied => Self::PermissionDenied,
            MediaError::DeviceNotFound => Self::DeviceNotFound,
            MediaError::Negotiation(msg) => Self::NegotiationFailed(msg),
        }
    }
}

/// Failure to hand a signal to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

impl From<TransportError> for CallError {
    fn from(_: TransportError) -> Self {
        Self::TransportUnavailable
    }
}

/// Failure to decode a signaling frame.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("unknown signaling event: {0}")]
    UnknownEvent(String),

    #[error("event {0} is not accepted in this direction")]
    WrongDirection(String),

    #[error("malformed {event} payload: {source}")]
    Payload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}
