use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callcore::error::{MediaError, TransportError};
use callcore::net::{SignalingTransport, TransportEvent};
use callcore::signaling::{
    AnswerPayload, CallRef, CallStartedPayload, IceCandidatePayload, InboundSignal,
    IncomingCallPayload, OfferPayload, OutboundSignal, SignalKind,
};
use callcore::types::{
    CallId, CallType, IceCandidate, IceServer, LocalIdentity, SdpType, SessionDescription, UserId,
};
use tokio::sync::mpsc;

use crate::calls::{CallCoordinator, CallSnapshot};
use crate::config::CallConfig;
use crate::media::{
    LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaEvent, MediaEventSender,
    PeerSession, TrackKind, VideoConstraints,
};

pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";
pub const CALL_ID: &str = "call-7f3a";

pub fn identity(user: &str) -> LocalIdentity {
    LocalIdentity::new(user, format!("token-{user}"))
}

/// Records every emitted signal.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    sent: Mutex<Vec<OutboundSignal>>,
}

impl MockTransport {
    pub fn connected() -> Arc<Self> {
        let transport = Self::default();
        transport.connected.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, kind: SignalKind) -> usize {
        self.sent().iter().filter(|s| s.kind() == kind).count()
    }

    pub fn last(&self, kind: SignalKind) -> Option<OutboundSignal> {
        self.sent().into_iter().rev().find(|s| s.kind() == kind)
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn emit(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push(signal);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.set_connected(false);
    }
}

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    pub switches: AtomicUsize,
}

impl MockTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            switches: AtomicUsize::new(0),
        }
    }
}

impl LocalTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn switch_camera(&self) -> Result<(), MediaError> {
        match self.kind {
            TrackKind::Video => {
                self.switches.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            TrackKind::Audio => Err(MediaError::DeviceNotFound),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    AddTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddIce(String),
    Close,
}

pub struct MockPeerSession {
    ops: Arc<Mutex<Vec<PeerOp>>>,
    has_video: bool,
    offers: usize,
}

impl MockPeerSession {
    fn record(&self, op: PeerOp) {
        self.ops.lock().unwrap().push(op);
    }

    fn sdp(&self, label: &str) -> String {
        let mut sdp = format!("v=0\r\no=- {label}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        if self.has_video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp
    }
}

#[async_trait]
impl PeerSession for MockPeerSession {
    async fn add_local_track(&mut self, track: Arc<dyn LocalTrack>) -> Result<(), MediaError> {
        if track.kind() == TrackKind::Video {
            self.has_video = true;
        }
        self.record(PeerOp::AddTrack(track.kind()));
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        self.offers += 1;
        self.record(PeerOp::CreateOffer);
        Ok(SessionDescription::offer(self.sdp(&format!("offer-{}", self.offers))))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
        self.record(PeerOp::CreateAnswer);
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.record(PeerOp::SetLocal(description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.record(PeerOp::SetRemote(description.sdp_type));
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(PeerOp::AddIce(candidate.candidate));
        Ok(())
    }

    fn close(&mut self) {
        self.record(PeerOp::Close);
    }
}

/// Scriptable capture devices. Capture waits `capture_delay` to stand in
/// for a permission prompt.
#[derive(Default)]
pub struct MockMediaDevices {
    pub capture_delay: Mutex<Duration>,
    pub deny_capture: AtomicBool,
    pub deny_camera: AtomicBool,
    pub capture_requests: AtomicUsize,
    pub camera_requests: AtomicUsize,
    pub sessions_created: AtomicUsize,
    pub tracks: Mutex<Vec<Arc<MockTrack>>>,
    pub peer_ops: Arc<Mutex<Vec<PeerOp>>>,
    pub media_events: Mutex<Option<MediaEventSender>>,
}

impl MockMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_capture_delay(delay: Duration) -> Arc<Self> {
        let devices = Self::default();
        *devices.capture_delay.lock().unwrap() = delay;
        Arc::new(devices)
    }

    fn new_track(&self, kind: TrackKind) -> Arc<MockTrack> {
        let mut tracks = self.tracks.lock().unwrap();
        let track = Arc::new(MockTrack::new(format!("track-{}", tracks.len()), kind));
        tracks.push(track.clone());
        track
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.is_live())
            .count()
    }

    pub fn track(&self, kind: TrackKind) -> Option<Arc<MockTrack>> {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.kind() == kind)
            .cloned()
    }

    pub fn ops(&self) -> Vec<PeerOp> {
        self.peer_ops.lock().unwrap().clone()
    }

    pub fn ice_applied(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                PeerOp::AddIce(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Report a media callback as the current session.
    pub fn emit(&self, event: MediaEvent) {
        if let Some(sender) = self.media_events.lock().unwrap().as_ref() {
            sender.send(event);
        }
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn acquire_local_stream(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        self.capture_requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.capture_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.deny_capture.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(self.new_track(TrackKind::Audio));
        }
        if constraints.video.is_some() {
            tracks.push(self.new_track(TrackKind::Video));
        }
        Ok(LocalStream::new(tracks))
    }

    async fn acquire_video_track(
        &self,
        _constraints: VideoConstraints,
    ) -> Result<Arc<dyn LocalTrack>, MediaError> {
        self.camera_requests.fetch_add(1, Ordering::SeqCst);
        if self.deny_camera.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        Ok(self.new_track(TrackKind::Video))
    }

    async fn create_session(
        &self,
        _ice_servers: &[IceServer],
        events: MediaEventSender,
    ) -> Result<Box<dyn PeerSession>, MediaError> {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        *self.media_events.lock().unwrap() = Some(events);
        Ok(Box::new(MockPeerSession {
            ops: self.peer_ops.clone(),
            has_video: false,
            offers: 0,
        }))
    }
}

/// A coordinator wired to mock transport and devices.
pub struct Harness {
    pub coordinator: CallCoordinator,
    pub transport: Arc<MockTransport>,
    pub devices: Arc<MockMediaDevices>,
    pub inbound: mpsc::Sender<TransportEvent>,
}

impl Harness {
    pub fn start(user: &str) -> Self {
        Self::with(user, CallConfig::default(), MockMediaDevices::new())
    }

    pub fn with(user: &str, config: CallConfig, devices: Arc<MockMediaDevices>) -> Self {
        let transport = MockTransport::connected();
        let (inbound, rx) = mpsc::channel(64);
        let coordinator = CallCoordinator::start(
            config,
            Some(identity(user)),
            transport.clone(),
            rx,
            devices.clone(),
        );
        Self {
            coordinator,
            transport,
            devices,
            inbound,
        }
    }

    pub async fn deliver(&self, signal: InboundSignal) {
        self.inbound
            .send(TransportEvent::Signal(signal))
            .await
            .unwrap();
        settle().await;
    }

    pub async fn transport_event(&self, event: TransportEvent) {
        self.inbound.send(event).await.unwrap();
        settle().await;
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.coordinator.snapshot()
    }

    /// Wait until the snapshot satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        let mut rx = self.coordinator.watch();
        let snapshot = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for call state")
            .expect("engine stopped");
        snapshot.clone()
    }
}

/// Let the engine drain everything it has been sent.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn call_id() -> CallId {
    CallId::new(CALL_ID)
}

pub fn incoming_call(from: &str, call_type: CallType) -> InboundSignal {
    InboundSignal::IncomingCall(IncomingCallPayload {
        call_id: call_id(),
        from: UserId::new(from),
        title: None,
        call_type: Some(call_type),
    })
}

pub fn call_started(to: &str) -> InboundSignal {
    InboundSignal::CallStarted(CallStartedPayload {
        call_id: call_id(),
        to: UserId::new(to),
        title: None,
    })
}

pub fn call_ref() -> CallRef {
    CallRef { call_id: call_id() }
}

pub fn remote_offer(label: &str) -> InboundSignal {
    InboundSignal::Offer(OfferPayload {
        room_id: call_id(),
        offer: SessionDescription::offer(format!("v=0\r\no=- {label}\r\n")).into(),
        receiver_id: None,
    })
}

pub fn remote_answer() -> InboundSignal {
    InboundSignal::Answer(AnswerPayload {
        room_id: call_id(),
        answer: SessionDescription::answer("v=0\r\no=- remote-answer\r\n").into(),
        caller_id: None,
    })
}

pub fn remote_candidate(n: u32) -> InboundSignal {
    InboundSignal::IceCandidate(IceCandidatePayload {
        room_id: call_id(),
        candidate: serde_json::json!({
            "candidate": candidate_line(n),
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }),
        target_user_id: None,
    })
}

pub fn candidate_line(n: u32) -> String {
    format!("candidate:{n} 1 UDP 2130706431 192.168.1.{n} 5000{n} typ host")
}
