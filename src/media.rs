//! Media session adapter contract.
//!
//! The engine never touches capture devices or the peer connection
//! directly. Platform code implements these traits on top of its
//! real-time media library; the engine only sequences the calls and reacts
//! to the events they produce.

use async_trait::async_trait;
use callcore::error::MediaError;
use callcore::types::{CallType, IceCandidate, IceServer, SessionDescription};
use log::debug;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Camera facing for video capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub facing: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            facing: FacingMode::User,
            ideal_width: 1280,
            ideal_height: 720,
        }
    }
}

/// What to capture for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn for_call(call_type: CallType) -> Self {
        Self {
            audio: true,
            video: call_type.is_video().then(VideoConstraints::default),
        }
    }
}

/// A captured local track. Owned by the active call and stopped on every
/// terminal transition.
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Release the device. Idempotent.
    fn stop(&self);

    fn is_live(&self) -> bool;

    /// Flip between front and back camera. Only meaningful for video.
    fn switch_camera(&self) -> Result<(), MediaError> {
        Err(MediaError::DeviceNotFound)
    }
}

/// The set of tracks captured for a call.
#[derive(Debug, Default, Clone)]
pub struct LocalStream {
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&Arc<dyn LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&Arc<dyn LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn add_track(&mut self, track: Arc<dyn LocalTrack>) {
        self.tracks.push(track);
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            debug!("Stopping local {:?} track {}", track.kind(), track.id());
            track.stop();
        }
    }
}

/// Peer connection state as reported by the media library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A remote track became available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Callbacks from a media session.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// A local candidate to forward to the peer.
    IceCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    ConnectionStateChange(PeerConnectionState),
}

/// Sink handed to a media session for its callbacks. Events are tagged
/// with the session generation so the engine can drop events from a
/// session it already tore down.
#[derive(Debug, Clone)]
pub struct MediaEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, MediaEvent)>,
}

impl MediaEventSender {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, MediaEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the engine is gone.
    pub fn send(&self, event: MediaEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// One negotiated peer media session.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn add_local_track(&mut self, track: Arc<dyn LocalTrack>) -> Result<(), MediaError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), MediaError>;

    fn close(&mut self);
}

/// Access to capture devices and the media library.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request local capture. This is where the platform shows its
    /// permission prompt, so it may take arbitrarily long.
    async fn acquire_local_stream(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError>;

    /// Request a camera track for an audio-to-video upgrade.
    async fn acquire_video_track(
        &self,
        constraints: VideoConstraints,
    ) -> Result<Arc<dyn LocalTrack>, MediaError>;

    async fn create_session(
        &self,
        ice_servers: &[IceServer],
        events: MediaEventSender,
    ) -> Result<Box<dyn PeerSession>, MediaError>;
}

/// Media backend for signaling-only deployments. Every capture request
/// fails, so calls can be observed and declined but never answered.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMediaDevices;

#[async_trait]
impl MediaDevices for NoMediaDevices {
    async fn acquire_local_stream(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        Err(MediaError::DeviceNotFound)
    }

    async fn acquire_video_track(
        &self,
        _constraints: VideoConstraints,
    ) -> Result<Arc<dyn LocalTrack>, MediaError> {
        Err(MediaError::DeviceNotFound)
    }

    async fn create_session(
        &self,
        _ice_servers: &[IceServer],
        _events: MediaEventSender,
    ) -> Result<Box<dyn PeerSession>, MediaError> {
        Err(MediaError::DeviceNotFound)
    }
}
