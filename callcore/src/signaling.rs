//! Signaling wire events.
//!
//! Every event is a JSON text frame `{"event": <name>, "data": <payload>}`.
//! Lifecycle events correlate on `callId`; negotiation events carry the same
//! value as `roomId`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::SignalingError;
use crate::types::{CallId, CallType, SdpType, SessionDescription, UserId};

/// Who may send a given event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    Both,
}

/// Signaling event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Caller asks the server to create a call record.
    StartCall,
    /// Server notifies the callee of a new call.
    IncomingCall,
    /// Server confirms call creation to the caller.
    CallStarted,
    /// Callee accepts.
    AcceptCall,
    /// Server tells both sides the callee accepted.
    CallActive,
    /// Callee declines.
    DeclineCall,
    /// Server tells the caller the callee declined.
    CallDeclined,
    /// Either side hangs up.
    EndCall,
    /// Server tells both sides the call is over.
    CallEnded,
    /// Server gave up ringing.
    CallMissed,
    /// Server lost the remote participant's connection.
    ParticipantDisconnected,
    WebRtcOffer,
    WebRtcAnswer,
    IceCandidate,
}

impl SignalKind {
    pub const ALL: [SignalKind; 14] = [
        Self::StartCall,
        Self::IncomingCall,
        Self::CallStarted,
        Self::AcceptCall,
        Self::CallActive,
        Self::DeclineCall,
        Self::CallDeclined,
        Self::EndCall,
        Self::CallEnded,
        Self::CallMissed,
        Self::ParticipantDisconnected,
        Self::WebRtcOffer,
        Self::WebRtcAnswer,
        Self::IceCandidate,
    ];

    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::StartCall => "start-call",
            Self::IncomingCall => "incoming-call",
            Self::CallStarted => "call-started",
            Self::AcceptCall => "accept-call",
            Self::CallActive => "call-active",
            Self::DeclineCall => "decline-call",
            Self::CallDeclined => "call-declined",
            Self::EndCall => "end-call",
            Self::CallEnded => "call-ended",
            Self::CallMissed => "call-missed",
            Self::ParticipantDisconnected => "participant-disconnected",
            Self::WebRtcOffer => "webrtc-offer",
            Self::WebRtcAnswer => "webrtc-answer",
            Self::IceCandidate => "ice-candidate",
        }
    }

    pub const fn direction(&self) -> Direction {
        match self {
            Self::StartCall | Self::AcceptCall | Self::DeclineCall | Self::EndCall => {
                Direction::ClientToServer
            }
            Self::IncomingCall
            | Self::CallStarted
            | Self::CallActive
            | Self::CallDeclined
            | Self::CallEnded
            | Self::CallMissed
            | Self::ParticipantDisconnected => Direction::ServerToClient,
            Self::WebRtcOffer | Self::WebRtcAnswer | Self::IceCandidate => Direction::Both,
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.direction() != Direction::ClientToServer
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

impl std::str::FromStr for SignalKind {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.event_name() == s)
            .ok_or_else(|| SignalingError::UnknownEvent(s.to_string()))
    }
}

/// A session description as it appears on the wire: either the full
/// `{type, sdp}` object or a bare SDP string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SdpField {
    Described(SessionDescription),
    Raw(String),
}

impl SdpField {
    /// Resolve to a description, trusting `expected` for bare strings.
    pub fn into_description(self, expected: SdpType) -> SessionDescription {
        match self {
            Self::Described(desc) => desc,
            Self::Raw(sdp) => SessionDescription {
                sdp_type: expected,
                sdp,
            },
        }
    }
}

impl From<SessionDescription> for SdpField {
    fn from(desc: SessionDescription) -> Self {
        Self::Described(desc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallPayload {
    pub host_user_id: UserId,
    pub recipient_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    pub call_id: CallId,
    pub from: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStartedPayload {
    pub call_id: CallId,
    pub to: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Payload carrying only the correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    pub call_id: CallId,
}

/// The remote participant dropped off the signaling server mid-call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDisconnectedPayload {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptCallPayload {
    pub call_id: CallId,
    pub caller_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCallPayload {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub room_id: CallId,
    pub offer: SdpField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub room_id: CallId,
    pub answer: SdpField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<UserId>,
}

/// ICE candidate payload. The candidate stays untyped until the session
/// layer decodes it, so a malformed candidate never fails the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub room_id: CallId,
    #[serde(default)]
    pub candidate: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: SignalKind,
    data: Value,
) -> Result<T, SignalingError> {
    serde_json::from_value(data).map_err(|source| SignalingError::Payload {
        event: kind.event_name(),
        source,
    })
}

/// Events delivered from the server to this client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    IncomingCall(IncomingCallPayload),
    CallStarted(CallStartedPayload),
    CallActive(CallRef),
    CallDeclined(CallRef),
    CallEnded(CallRef),
    CallMissed(CallRef),
    ParticipantDisconnected(ParticipantDisconnectedPayload),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(IceCandidatePayload),
}

impl InboundSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::IncomingCall(_) => SignalKind::IncomingCall,
            Self::CallStarted(_) => SignalKind::CallStarted,
            Self::CallActive(_) => SignalKind::CallActive,
            Self::CallDeclined(_) => SignalKind::CallDeclined,
            Self::CallEnded(_) => SignalKind::CallEnded,
            Self::CallMissed(_) => SignalKind::CallMissed,
            Self::ParticipantDisconnected(_) => SignalKind::ParticipantDisconnected,
            Self::Offer(_) => SignalKind::WebRtcOffer,
            Self::Answer(_) => SignalKind::WebRtcAnswer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }

    /// The correlation key of the event.
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::IncomingCall(p) => &p.call_id,
            Self::CallStarted(p) => &p.call_id,
            Self::CallActive(p)
            | Self::CallDeclined(p)
            | Self::CallEnded(p)
            | Self::CallMissed(p) => &p.call_id,
            Self::ParticipantDisconnected(p) => &p.call_id,
            Self::Offer(p) => &p.room_id,
            Self::Answer(p) => &p.room_id,
            Self::IceCandidate(p) => &p.room_id,
        }
    }

    /// Decode an event from its name and JSON payload.
    pub fn from_wire(event: &str, data: Value) -> Result<Self, SignalingError> {
        let kind: SignalKind = event.parse()?;
        if !kind.is_inbound() {
            return Err(SignalingError::WrongDirection(event.to_string()));
        }
        Ok(match kind {
            SignalKind::IncomingCall => Self::IncomingCall(decode(kind, data)?),
            SignalKind::CallStarted => Self::CallStarted(decode(kind, data)?),
            SignalKind::CallActive => Self::CallActive(decode(kind, data)?),
            SignalKind::CallDeclined => Self::CallDeclined(decode(kind, data)?),
            SignalKind::CallEnded => Self::CallEnded(decode(kind, data)?),
            SignalKind::CallMissed => Self::CallMissed(decode(kind, data)?),
            SignalKind::ParticipantDisconnected => {
                Self::ParticipantDisconnected(decode(kind, data)?)
            }
            SignalKind::WebRtcOffer => Self::Offer(decode(kind, data)?),
            SignalKind::WebRtcAnswer => Self::Answer(decode(kind, data)?),
            SignalKind::IceCandidate => Self::IceCandidate(decode(kind, data)?),
            SignalKind::StartCall
            | SignalKind::AcceptCall
            | SignalKind::DeclineCall
            | SignalKind::EndCall => {
                return Err(SignalingError::WrongDirection(event.to_string()));
            }
        })
    }

    /// Decode a `{"event", "data"}` text frame.
    pub fn from_frame(text: &str) -> Result<Self, SignalingError> {
        let frame: WireFrame = serde_json::from_str(text)?;
        Self::from_wire(&frame.event, frame.data)
    }
}

/// Events this client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    StartCall(StartCallPayload),
    AcceptCall(AcceptCallPayload),
    DeclineCall(CallRef),
    EndCall(EndCallPayload),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(IceCandidatePayload),
}

impl OutboundSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::StartCall(_) => SignalKind::StartCall,
            Self::AcceptCall(_) => SignalKind::AcceptCall,
            Self::DeclineCall(_) => SignalKind::DeclineCall,
            Self::EndCall(_) => SignalKind::EndCall,
            Self::Offer(_) => SignalKind::WebRtcOffer,
            Self::Answer(_) => SignalKind::WebRtcAnswer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.kind().event_name()
    }

    /// The correlation key, if the event has one (`start-call` does not).
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::StartCall(_) => None,
            Self::AcceptCall(p) => Some(&p.call_id),
            Self::DeclineCall(p) => Some(&p.call_id),
            Self::EndCall(p) => Some(&p.call_id),
            Self::Offer(p) => Some(&p.room_id),
            Self::Answer(p) => Some(&p.room_id),
            Self::IceCandidate(p) => Some(&p.room_id),
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::StartCall(p) => serde_json::to_value(p),
            Self::AcceptCall(p) => serde_json::to_value(p),
            Self::DeclineCall(p) => serde_json::to_value(p),
            Self::EndCall(p) => serde_json::to_value(p),
            Self::Offer(p) => serde_json::to_value(p),
            Self::Answer(p) => serde_json::to_value(p),
            Self::IceCandidate(p) => serde_json::to_value(p),
        }
    }

    /// Encode as a `{"event", "data"}` text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireFrame {
            event: self.event_name().to_string(),
            data: self.payload()?,
        })
    }
}
