//! Identifiers and value types shared by the signaling and session layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque call identifier assigned by the signaling server.
///
/// The same value travels as `callId` on lifecycle events and as `roomId`
/// on negotiation events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Participant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The authenticated local user and the bearer token used for signaling
/// and the status API.
#[derive(Clone)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub access_token: String,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            access_token: access_token.into(),
        }
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Media kind of a call. Only ever upgraded from audio to video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallType {
    #[default]
    Audio,
    Video,
}

impl CallType {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("AUDIO"),
            Self::Video => f.write_str("VIDEO"),
        }
    }
}

/// Which side of the offer/answer exchange this client plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallRole {
    /// Sends the initial offer.
    Caller,
    /// Answers the caller's offer.
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// True if the description negotiates a video media section.
    pub fn has_video(&self) -> bool {
        self.sdp.lines().any(|l| l.starts_with("m=video"))
    }
}

/// An ICE candidate received from or sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate line, e.g. `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`.
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    /// Leniently decode a candidate from its wire value.
    ///
    /// Peers send either the full candidate object or just the candidate
    /// line. Null, empty and otherwise unusable values yield `None`; the
    /// caller logs and drops them.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let candidate = match value {
            Value::String(line) => Self::new(line.clone()),
            Value::Object(_) => serde_json::from_value::<Self>(value.clone()).ok()?,
            _ => return None,
        };
        if candidate.candidate.trim().is_empty() {
            return None;
        }
        Some(candidate)
    }

    /// The candidate type from the `typ` field of the candidate line.
    pub fn candidate_type(&self) -> Option<CandidateType> {
        let mut parts = self.candidate.split_whitespace();
        parts.find(|p| *p == "typ")?;
        parts.next()?.parse().ok()
    }
}

/// ICE candidate type (RFC 8445).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl std::str::FromStr for CandidateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            _ => Err(()),
        }
    }
}

/// STUN/TURN server handed to the media session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn default_servers() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
            Self::stun("stun:stun2.l.google.com:19302"),
        ]
    }
}

/// Server-side status of a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallStatus {
    Calling,
    Ringing,
    Active,
    End,
    Missed,
    Declined,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Missed | Self::Declined)
    }
}

/// Call record returned by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub status: CallStatus,
    #[serde(default)]
    pub host_user_id: Option<UserId>,
    #[serde(default)]
    pub recipient_user_id: Option<UserId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_from_object() {
        let value = json!({
            "candidate": "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        let candidate = IceCandidate::from_wire(&value).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(candidate.candidate_type(), Some(CandidateType::Host));
    }

    #[test]
    fn test_candidate_from_bare_line() {
        let value = json!("candidate:2 1 UDP 1694498815 203.0.113.7 50000 typ srflx");
        let candidate = IceCandidate::from_wire(&value).unwrap();
        assert_eq!(
            candidate.candidate_type(),
            Some(CandidateType::ServerReflexive)
        );
    }

    #[test]
    fn test_malformed_candidates_are_rejected() {
        assert!(IceCandidate::from_wire(&Value::Null).is_none());
        assert!(IceCandidate::from_wire(&json!("")).is_none());
        assert!(IceCandidate::from_wire(&json!({ "candidate": "  " })).is_none());
        assert!(IceCandidate::from_wire(&json!({ "sdpMid": "0" })).is_none());
        assert!(IceCandidate::from_wire(&json!(42)).is_none());
    }

    #[test]
    fn test_call_type_wire_names() {
        assert_eq!(serde_json::to_value(CallType::Video).unwrap(), json!("VIDEO"));
        let parsed: CallType = serde_json::from_value(json!("AUDIO")).unwrap();
        assert_eq!(parsed, CallType::Audio);
    }

    #[test]
    fn test_session_description_video_detection() {
        let audio = SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        let video = SessionDescription::offer(
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n",
        );
        assert!(!audio.has_video());
        assert!(video.has_video());
    }

    #[test]
    fn test_identity_debug_redacts_token() {
        let identity = LocalIdentity::new("u1", "secret-token");
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("secret-token"));
        assert_eq!(identity.bearer(), "Bearer secret-token");
    }
}
