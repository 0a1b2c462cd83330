//! Call engine: owns the active call and sequences signaling with the
//! media session.
//!
//! All methods run on the actor task, one event at a time. Anything that
//! can block on the user (capture permission prompts) runs in a spawned
//! task and reports back as a [`Completion`], so signaling such as a
//! remote hang-up is still processed while a prompt is open.

use super::coordinator::CallSnapshot;
use crate::config::CallConfig;
use crate::media::{
    LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaEvent, MediaEventSender,
    PeerConnectionState, PeerSession, VideoConstraints,
};
use crate::types::events::{
    CallEnded, CallFailure, CallStarted, EventBus, IncomingCall, LocalStreamReady,
    RemoteTrackAdded,
};
use callcore::error::{CallError, MediaError};
use callcore::ice::{PendingIceQueue, PendingOffer};
use callcore::net::{SignalingTransport, TransportEvent};
use callcore::signaling::{
    AcceptCallPayload, AnswerPayload, CallRef, CallStartedPayload, EndCallPayload,
    IceCandidatePayload, InboundSignal, IncomingCallPayload, OfferPayload, OutboundSignal,
    ParticipantDisconnectedPayload, StartCallPayload,
};
use callcore::state::{CallSession, CallState, CallTransition, EndReason};
use callcore::types::{
    CallId, CallType, IceCandidate, LocalIdentity, SdpType, SessionDescription, UserId,
};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Requests from the coordinator.
pub(crate) enum Command {
    Initiate {
        remote_user_id: UserId,
        call_type: CallType,
        title: Option<String>,
        reply: Reply<()>,
    },
    Accept {
        reply: Reply<()>,
    },
    Reject {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    ToggleMute {
        reply: Reply<bool>,
    },
    ToggleCamera {
        reply: Reply<bool>,
    },
    SwitchCamera {
        reply: Reply<()>,
    },
    UpgradeToVideo {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Results of work the engine handed off to a spawned task.
pub(crate) enum Completion {
    LocalStream {
        generation: u64,
        result: Result<LocalStream, MediaError>,
    },
    VideoTrack {
        generation: u64,
        result: Result<Arc<dyn LocalTrack>, MediaError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Callee accepted and is waiting for the caller's offer.
    OfferWait,
    /// Caller is waiting for the callee to pick up.
    Ring,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    kind: TimerKind,
}

pub(crate) struct CallEngine {
    config: CallConfig,
    identity: Option<LocalIdentity>,
    transport: Arc<dyn SignalingTransport>,
    devices: Arc<dyn MediaDevices>,
    events: Arc<EventBus>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    media_tx: mpsc::UnboundedSender<(u64, MediaEvent)>,

    session: Option<CallSession>,
    /// Bumped for every media attempt and every teardown. Completions and
    /// media events carrying an older value are stale.
    generation: u64,
    acquiring: bool,
    local_stream: Option<LocalStream>,
    peer: Option<Box<dyn PeerSession>>,
    remote_ice: PendingIceQueue,
    pending_offer: PendingOffer,
    last_remote_offer: Option<String>,
    awaiting_answer: bool,
    /// This attempt's `start-call` is on the wire. A `call-started` seen
    /// before then belongs to an abandoned attempt.
    start_call_sent: bool,
    deadline: Option<Deadline>,
    pending_setup: Option<Reply<()>>,
    pending_upgrade: Option<Reply<()>>,
    muted: bool,
    camera_off: bool,
    remote_media: bool,
    last_error: Option<CallError>,
}

impl CallEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: CallConfig,
        identity: Option<LocalIdentity>,
        transport: Arc<dyn SignalingTransport>,
        devices: Arc<dyn MediaDevices>,
        events: Arc<EventBus>,
        snapshot_tx: watch::Sender<CallSnapshot>,
        completion_tx: mpsc::UnboundedSender<Completion>,
        media_tx: mpsc::UnboundedSender<(u64, MediaEvent)>,
    ) -> Self {
        Self {
            config,
            identity,
            transport,
            devices,
            events,
            snapshot_tx,
            completion_tx,
            media_tx,
            session: None,
            generation: 0,
            acquiring: false,
            local_stream: None,
            peer: None,
            remote_ice: PendingIceQueue::new(),
            pending_offer: PendingOffer::default(),
            last_remote_offer: None,
            awaiting_answer: false,
            start_call_sent: false,
            deadline: None,
            pending_setup: None,
            pending_upgrade: None,
            muted: false,
            camera_off: false,
            remote_media: false,
            last_error: None,
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|d| d.at)
    }

    pub(crate) async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate {
                remote_user_id,
                call_type,
                title,
                reply,
            } => self.initiate_call(remote_user_id, call_type, title, reply),
            Command::Accept { reply } => self.accept_call(reply),
            Command::Reject { reply } => {
                let result = self.reject_call().await;
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                self.end_call().await;
                let _ = reply.send(Ok(()));
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(Ok(self.toggle_mute()));
            }
            Command::ToggleCamera { reply } => {
                let _ = reply.send(Ok(self.toggle_camera()));
            }
            Command::SwitchCamera { reply } => {
                let _ = reply.send(self.switch_camera());
            }
            Command::UpgradeToVideo { reply } => self.upgrade_to_video(reply),
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    pub(crate) async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::LocalStream { generation, result } => {
                self.on_local_stream(generation, result).await
            }
            Completion::VideoTrack { generation, result } => {
                self.on_video_track(generation, result).await
            }
        }
    }

    pub(crate) async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => info!("Signaling transport connected"),
            TransportEvent::Signal(signal) => self.handle_signal(signal).await,
            TransportEvent::Reconnected => {
                if self.has_live_call() {
                    warn!("Signaling reconnected during a call; ending it as stale");
                    self.fail(CallError::TransportUnavailable).await;
                } else {
                    info!("Signaling transport reconnected");
                }
            }
            TransportEvent::Disconnected { reason } => {
                warn!("Signaling transport disconnected: {reason}");
                if self.has_live_call() {
                    self.fail(CallError::TransportUnavailable).await;
                }
            }
        }
    }

    /// The transport's event stream ended for good.
    pub(crate) async fn on_transport_closed(&mut self) {
        if self.has_live_call() {
            self.fail(CallError::TransportUnavailable).await;
        }
    }

    pub(crate) async fn handle_signal(&mut self, signal: InboundSignal) {
        debug!("<-- {} (call {})", signal.kind(), signal.call_id());
        match signal {
            InboundSignal::IncomingCall(p) => self.on_incoming_call(p).await,
            InboundSignal::CallStarted(p) => self.on_call_started(p).await,
            InboundSignal::CallActive(p) => self.on_call_active(p),
            InboundSignal::CallDeclined(p) => {
                self.on_remote_terminal(p.call_id, EndReason::RemoteDecline)
            }
            InboundSignal::CallEnded(p) => self.on_remote_terminal(p.call_id, EndReason::RemoteHangup),
            InboundSignal::CallMissed(p) => self.on_remote_terminal(p.call_id, EndReason::Missed),
            InboundSignal::ParticipantDisconnected(p) => self.on_participant_disconnected(p),
            InboundSignal::Offer(p) => self.on_remote_offer(p).await,
            InboundSignal::Answer(p) => self.on_remote_answer(p).await,
            InboundSignal::IceCandidate(p) => self.on_remote_ice_candidate(p).await,
        }
    }

    pub(crate) async fn handle_media_event(&mut self, generation: u64, event: MediaEvent) {
        if generation != self.generation || self.peer.is_none() {
            debug!("Dropping media event from a closed session: {event:?}");
            return;
        }
        match event {
            MediaEvent::IceCandidate(candidate) => self.forward_local_candidate(candidate).await,
            MediaEvent::RemoteTrack(track) => {
                info!("Remote {:?} track {} available", track.kind, track.id);
                self.remote_media = true;
                let _ = self.events.remote_track.send(Arc::new(RemoteTrackAdded {
                    call_id: self.active_call_id(),
                    track,
                }));
                self.mark_media_flowing();
                self.publish();
            }
            MediaEvent::ConnectionStateChange(state) => match state {
                PeerConnectionState::Connected => {
                    self.mark_media_flowing();
                    self.publish();
                }
                PeerConnectionState::Failed | PeerConnectionState::Closed => {
                    warn!("Media connection {state:?}");
                    self.fail(CallError::RemoteDisconnected).await;
                }
                PeerConnectionState::Disconnected => {
                    warn!("Media connection interrupted; waiting for it to recover");
                }
                PeerConnectionState::New | PeerConnectionState::Connecting => {
                    debug!("Media connection {state:?}");
                }
            },
        }
    }

    pub(crate) async fn on_deadline(&mut self) {
        let Some(deadline) = self.deadline.take() else {
            return;
        };
        match deadline.kind {
            TimerKind::OfferWait => {
                warn!(
                    "No offer received within {:?} of accepting",
                    self.config.offer_timeout()
                );
                self.fail(CallError::ConnectionTimeout).await;
            }
            TimerKind::Ring => {
                info!("Outgoing call was not answered; giving up");
                self.notify_hangup().await;
                self.teardown(EndReason::Missed, None);
            }
        }
    }

    /// End whatever is in progress. Safe to call repeatedly.
    pub(crate) async fn shutdown(&mut self) {
        if self.session.is_some() {
            self.notify_hangup().await;
            self.teardown(EndReason::LocalHangup, None);
        }
    }

    // ---- user operations -------------------------------------------------

    fn initiate_call(
        &mut self,
        remote_user_id: UserId,
        call_type: CallType,
        title: Option<String>,
        reply: Reply<()>,
    ) {
        let Some(identity) = &self.identity else {
            let _ = reply.send(Err(CallError::NotAuthenticated));
            return;
        };
        if !self.transport.is_connected() {
            let _ = reply.send(Err(CallError::TransportUnavailable));
            return;
        }
        if self.session.is_some() {
            let _ = reply.send(Err(CallError::CallInProgress));
            return;
        }

        info!("Calling {remote_user_id} ({call_type})");
        self.session = Some(CallSession::new_outgoing(
            identity.user_id.clone(),
            remote_user_id,
            call_type,
            title,
        ));
        self.last_error = None;
        self.pending_setup = Some(reply);
        self.start_local_capture(MediaConstraints::for_call(call_type));
        self.publish();
    }

    fn accept_call(&mut self, reply: Reply<()>) {
        let Some(session) = self.session.as_mut().filter(|s| s.state.can_accept()) else {
            let _ = reply.send(Err(CallError::NoIncomingCall));
            return;
        };
        if let Err(e) = session.apply_transition(CallTransition::LocalAccepted) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        let call_type = session.call_type();
        info!(
            "Accepting call {} from {}",
            display_id(session.call_id()),
            session.remote_user_id
        );

        self.pending_setup = Some(reply);
        self.start_local_capture(MediaConstraints::for_call(call_type));
        self.publish();
    }

    async fn reject_call(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_ref().filter(|s| s.state.can_reject()) else {
            return Err(CallError::NoIncomingCall);
        };
        if let Some(call_id) = session.call_id().cloned() {
            info!("Declining call {call_id}");
            self.notify(OutboundSignal::DeclineCall(CallRef { call_id }))
                .await;
        }
        self.teardown(EndReason::LocalDecline, None);
        Ok(())
    }

    async fn end_call(&mut self) {
        let Some(session) = &self.session else {
            debug!("end_call with no active call");
            return;
        };
        if session.state.can_reject() {
            let _ = self.reject_call().await;
            return;
        }
        self.notify_hangup().await;
        self.teardown(EndReason::LocalHangup, None);
    }

    fn toggle_mute(&mut self) -> bool {
        let Some(track) = self.local_stream.as_ref().and_then(|s| s.audio_track()) else {
            return false;
        };
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        self.muted = !enabled;
        self.publish();
        self.muted
    }

    fn toggle_camera(&mut self) -> bool {
        let Some(track) = self.local_stream.as_ref().and_then(|s| s.video_track()) else {
            return false;
        };
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        self.camera_off = !enabled;
        self.publish();
        self.camera_off
    }

    fn switch_camera(&self) -> Result<(), CallError> {
        match self.local_stream.as_ref().and_then(|s| s.video_track()) {
            Some(track) => track.switch_camera().map_err(CallError::from),
            None => Ok(()),
        }
    }

    fn upgrade_to_video(&mut self, reply: Reply<()>) {
        let Some(session) = &self.session else {
            let _ = reply.send(Err(CallError::NoActiveCall));
            return;
        };
        if !session.state.is_connected() {
            let _ = reply.send(Err(CallError::CallNotConnected));
            return;
        }
        if session.call_type().is_video() || self.pending_upgrade.is_some() {
            let _ = reply.send(Err(CallError::UpgradeUnavailable));
            return;
        }

        info!("Requesting camera to upgrade call to video");
        self.pending_upgrade = Some(reply);
        let generation = self.generation;
        let devices = self.devices.clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = devices
                .acquire_video_track(VideoConstraints::default())
                .await;
            if let Err(returned) = tx.send(Completion::VideoTrack { generation, result })
                && let Completion::VideoTrack { result: Ok(track), .. } = returned.0
            {
                track.stop();
            }
        });
    }

    // ---- media setup -----------------------------------------------------

    fn start_local_capture(&mut self, constraints: MediaConstraints) {
        self.generation += 1;
        self.acquiring = true;
        let generation = self.generation;
        let devices = self.devices.clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = devices.acquire_local_stream(constraints).await;
            // Nobody left to own the tracks.
            if let Err(returned) = tx.send(Completion::LocalStream { generation, result })
                && let Completion::LocalStream { result: Ok(stream), .. } = returned.0
            {
                stream.stop_all();
            }
        });
    }

    async fn on_local_stream(&mut self, generation: u64, result: Result<LocalStream, MediaError>) {
        if generation != self.generation || !self.acquiring || self.session.is_none() {
            debug!("Discarding local media from a superseded call attempt");
            if let Ok(stream) = result {
                stream.stop_all();
            }
            return;
        }
        self.acquiring = false;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Local media unavailable: {e}");
                self.fail(e.into()).await;
                return;
            }
        };
        debug!("Local stream ready with {} track(s)", stream.tracks().len());
        self.local_stream = Some(stream.clone());
        self.publish();
        let _ = self
            .events
            .local_stream
            .send(Arc::new(LocalStreamReady {
                stream: stream.clone(),
            }));

        if let Err(e) = self.open_peer_session(&stream).await {
            self.fail(e).await;
            return;
        }

        let is_caller = self.session.as_ref().is_some_and(|s| s.is_caller());
        if is_caller {
            self.caller_media_ready().await;
        } else {
            self.callee_media_ready().await;
        }
    }

    async fn open_peer_session(&mut self, stream: &LocalStream) -> Result<(), CallError> {
        let sink = MediaEventSender::new(self.generation, self.media_tx.clone());
        let mut peer = self
            .devices
            .create_session(&self.config.ice_servers, sink)
            .await?;
        for track in stream.tracks() {
            if let Err(e) = peer.add_local_track(track.clone()).await {
                peer.close();
                return Err(e.into());
            }
        }
        self.peer = Some(peer);
        Ok(())
    }

    async fn caller_media_ready(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let signal = OutboundSignal::StartCall(StartCallPayload {
            host_user_id: session.local_user_id.clone(),
            recipient_user_id: session.remote_user_id.clone(),
            title: session.title.clone(),
            call_type: Some(session.call_type()),
        });
        if let Err(e) = self.emit(signal).await {
            self.fail(e).await;
            return;
        }
        self.start_call_sent = true;
        self.resolve_setup();
        // The offer waits for call-started so it never races the call record.
        self.maybe_send_initial_offer().await;
    }

    async fn callee_media_ready(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(call_id) = session.call_id().cloned() else {
            return;
        };
        let signal = OutboundSignal::AcceptCall(AcceptCallPayload {
            call_id,
            caller_id: session.remote_user_id.clone(),
        });
        if let Err(e) = self.emit(signal).await {
            self.fail(e).await;
            return;
        }
        self.arm_timer(self.config.offer_timeout(), TimerKind::OfferWait);
        self.resolve_setup();

        if let Some(offer) = self.pending_offer.take() {
            info!("Replaying offer received during call setup");
            self.apply_remote_offer(offer).await;
        }
    }

    fn resolve_setup(&mut self) {
        if let Some(reply) = self.pending_setup.take() {
            let _ = reply.send(Ok(()));
        }
    }

    async fn on_video_track(
        &mut self,
        generation: u64,
        result: Result<Arc<dyn LocalTrack>, MediaError>,
    ) {
        let current = generation == self.generation;
        let Some(reply) = self.pending_upgrade.take_if(|_| current) else {
            if let Ok(track) = result {
                track.stop();
            }
            return;
        };

        match result {
            Err(e) => {
                // The audio call is untouched; only the upgrade fails.
                warn!("Camera unavailable for video upgrade: {e}");
                let error = CallError::from(e);
                self.report_error(error.clone());
                let _ = reply.send(Err(error));
            }
            Ok(track) => match self.renegotiate_with_video(track).await {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e.clone()));
                    self.fail(e).await;
                }
            },
        }
    }

    async fn renegotiate_with_video(&mut self, track: Arc<dyn LocalTrack>) -> Result<(), CallError> {
        let Some(stream) = self.local_stream.as_mut() else {
            track.stop();
            return Err(CallError::NoActiveCall);
        };
        stream.add_track(track.clone());

        let peer = self.peer.as_mut().ok_or(CallError::NoActiveCall)?;
        peer.add_local_track(track).await?;

        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        session.upgrade_to_video()?;
        let call_id = session.call_id().cloned().ok_or(CallError::NoActiveCall)?;
        let remote = session.remote_user_id.clone();

        self.camera_off = false;
        self.send_offer(call_id, remote).await?;
        info!("Call upgraded to video; renegotiation offer sent");
        self.publish();
        Ok(())
    }

    // ---- signaling handlers ----------------------------------------------

    async fn on_incoming_call(&mut self, payload: IncomingCallPayload) {
        if let Some(active) = &self.session {
            if active.matches(&payload.call_id) {
                debug!("Duplicate incoming-call for {}", payload.call_id);
                return;
            }
            warn!(
                "Declining call {} from {}: another call is in progress",
                payload.call_id, payload.from
            );
            self.notify(OutboundSignal::DeclineCall(CallRef {
                call_id: payload.call_id,
            }))
            .await;
            return;
        }
        let Some(identity) = &self.identity else {
            warn!("Ignoring incoming call {}: not authenticated", payload.call_id);
            return;
        };

        let call_type = payload.call_type.unwrap_or_default();
        info!(
            "Incoming {call_type} call {} from {}",
            payload.call_id, payload.from
        );
        self.session = Some(CallSession::new_incoming(
            payload.call_id.clone(),
            identity.user_id.clone(),
            payload.from.clone(),
            call_type,
            payload.title.clone(),
        ));
        self.last_error = None;
        let _ = self.events.incoming_call.send(Arc::new(IncomingCall {
            call_id: payload.call_id,
            from: payload.from,
            title: payload.title,
            call_type,
        }));
        self.publish();
    }

    async fn on_call_started(&mut self, payload: CallStartedPayload) {
        let waiting = self.start_call_sent
            && self.session.as_ref().is_some_and(|s| {
                s.is_caller()
                    && s.state == CallState::Initiating
                    && s.call_id().is_none()
                    && s.remote_user_id == payload.to
            });
        if !waiting {
            // A call record we no longer want; close it server-side.
            if !self.is_active_call(&payload.call_id)
                && let Some(identity) = &self.identity
            {
                warn!("Closing orphaned call {}", payload.call_id);
                let signal = OutboundSignal::EndCall(EndCallPayload {
                    call_id: payload.call_id,
                    caller_id: identity.user_id.clone(),
                    receiver_id: payload.to,
                });
                self.notify(signal).await;
            }
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.assign_call_id(payload.call_id.clone());
        info!("Call {} created on the server", payload.call_id);
        let _ = self.events.call_started.send(Arc::new(CallStarted {
            call_id: payload.call_id,
            to: payload.to,
            call_type: session.call_type(),
        }));
        self.maybe_send_initial_offer().await;
        self.publish();
    }

    /// Send the caller's one initial offer once the call record exists and
    /// the media session is ready. Gated on role and the offer count, never
    /// on state alone.
    async fn maybe_send_initial_offer(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        if !session.is_caller() || session.offers_sent > 0 || self.peer.is_none() {
            return;
        }
        let Some(call_id) = session.call_id().cloned() else {
            return;
        };
        let remote = session.remote_user_id.clone();

        match self.send_offer(call_id, remote).await {
            Ok(()) => {
                self.transition(CallTransition::OfferSent);
                if let Some(ring) = self.config.ring_timeout() {
                    self.arm_timer(ring, TimerKind::Ring);
                }
                self.publish();
            }
            Err(e) => self.fail(e).await,
        }
    }

    fn on_call_active(&mut self, payload: CallRef) {
        let Some(session) = self.session.as_ref().filter(|s| s.matches(&payload.call_id)) else {
            self.discard("call-active", &payload.call_id);
            return;
        };
        if !session.is_caller() {
            debug!("Server confirmed our acceptance of {}", payload.call_id);
            return;
        }
        if session.state == CallState::Outgoing {
            // The offer already went out during initiation; acceptance must
            // not produce another one.
            self.clear_timer();
            self.transition(CallTransition::RemoteAccepted);
            self.publish();
        }
    }

    fn on_remote_terminal(&mut self, call_id: CallId, reason: EndReason) {
        if !self.is_active_call(&call_id) {
            self.discard("terminal notice", &call_id);
            return;
        }
        info!("Call {call_id} closed remotely ({reason:?})");
        self.teardown(reason, None);
    }

    fn on_participant_disconnected(&mut self, payload: ParticipantDisconnectedPayload) {
        if !self.is_active_call(&payload.call_id) {
            self.discard("participant-disconnected", &payload.call_id);
            return;
        }
        // The server already dropped the peer; nothing to notify.
        warn!(
            "Remote participant {} left call {}",
            payload.user_id.as_ref().map_or("?", |u| u.as_str()),
            payload.call_id
        );
        self.teardown(EndReason::Failed, Some(CallError::RemoteDisconnected));
    }

    async fn on_remote_offer(&mut self, payload: OfferPayload) {
        let Some(session) = self.session.as_ref().filter(|s| s.matches(&payload.room_id)) else {
            self.discard("offer", &payload.room_id);
            return;
        };
        let (is_caller, state, role) = (session.is_caller(), session.state, session.role());
        let offer = payload.offer.into_description(SdpType::Offer);

        match (is_caller, state) {
            (_, CallState::Connected) => self.apply_remote_offer(offer).await,
            (false, CallState::Incoming) => {
                debug!("Holding offer until the call is accepted");
                self.pending_offer.store(offer);
            }
            (false, CallState::Connecting) if self.peer.is_none() => {
                debug!("Holding offer until local media is ready");
                self.pending_offer.store(offer);
            }
            (false, CallState::Connecting) => self.apply_remote_offer(offer).await,
            (_, state) => warn!(
                "Ignoring offer for {} in state {state} as {role:?}",
                payload.room_id
            ),
        }
    }

    async fn apply_remote_offer(&mut self, offer: SessionDescription) {
        if self.last_remote_offer.as_deref() == Some(offer.sdp.as_str()) {
            debug!("Ignoring duplicate delivery of an applied offer");
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        let Some(call_id) = session.call_id().cloned() else {
            return;
        };
        let offerer = session.remote_user_id.clone();

        match self.answer_offer(offer, call_id, offerer).await {
            Ok(()) => {
                let connecting = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.state == CallState::Connecting);
                if connecting {
                    self.clear_timer();
                    self.transition(CallTransition::AnswerSent);
                }
                self.publish();
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn answer_offer(
        &mut self,
        offer: SessionDescription,
        call_id: CallId,
        offerer: UserId,
    ) -> Result<(), CallError> {
        let sdp = offer.sdp.clone();
        let peer = self.peer.as_mut().ok_or_else(no_media_session)?;
        peer.set_remote_description(offer).await?;
        self.last_remote_offer = Some(sdp);
        self.flush_remote_ice().await;

        let peer = self.peer.as_mut().ok_or_else(no_media_session)?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;

        self.emit(OutboundSignal::Answer(AnswerPayload {
            room_id: call_id,
            answer: answer.into(),
            caller_id: Some(offerer),
        }))
        .await
    }

    async fn on_remote_answer(&mut self, payload: AnswerPayload) {
        let Some(session) = self.session.as_ref().filter(|s| s.matches(&payload.room_id)) else {
            self.discard("answer", &payload.room_id);
            return;
        };
        let state = session.state;
        if !self.awaiting_answer || (!state.is_connected() && !session.is_caller()) {
            warn!("Unexpected answer for {}; dropped", payload.room_id);
            return;
        }
        let answer = payload.answer.into_description(SdpType::Answer);

        let Some(peer) = self.peer.as_mut() else {
            warn!("Answer for {} without a media session", payload.room_id);
            return;
        };
        if let Err(e) = peer.set_remote_description(answer).await {
            self.fail(e.into()).await;
            return;
        }
        self.awaiting_answer = false;
        self.flush_remote_ice().await;

        if matches!(state, CallState::Outgoing | CallState::Connecting) {
            self.clear_timer();
            self.transition(CallTransition::RemoteAnswerApplied);
        }
        self.publish();
    }

    async fn on_remote_ice_candidate(&mut self, payload: IceCandidatePayload) {
        if !self.is_active_call(&payload.room_id) {
            self.discard("ice-candidate", &payload.room_id);
            return;
        }
        let Some(candidate) = IceCandidate::from_wire(&payload.candidate) else {
            debug!("Dropping empty or malformed ICE candidate for {}", payload.room_id);
            return;
        };
        debug!("Remote {} candidate for {}", candidate_label(&candidate), payload.room_id);
        if let Some(candidate) = self.remote_ice.push(candidate) {
            self.apply_remote_candidate(candidate).await;
        }
    }

    async fn flush_remote_ice(&mut self) {
        let queued = self.remote_ice.flush();
        if !queued.is_empty() {
            debug!("Applying {} queued ICE candidate(s)", queued.len());
        }
        for candidate in queued {
            self.apply_remote_candidate(candidate).await;
        }
    }

    async fn apply_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(peer) = self.peer.as_mut() else {
            warn!("ICE candidate without a media session; dropped");
            return;
        };
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!("Dropping ICE candidate: {e}");
        }
    }

    async fn forward_local_candidate(&mut self, candidate: IceCandidate) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(call_id) = session.call_id().cloned() else {
            debug!("Local ICE candidate before the call has an id; dropped");
            return;
        };
        debug!("--> local {} candidate for {call_id}", candidate_label(&candidate));
        let candidate = match serde_json::to_value(&candidate) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to encode local ICE candidate: {e}");
                return;
            }
        };
        let signal = OutboundSignal::IceCandidate(IceCandidatePayload {
            room_id: call_id,
            candidate,
            target_user_id: Some(session.remote_user_id.clone()),
        });
        self.notify(signal).await;
    }

    // ---- helpers -----------------------------------------------------------

    async fn send_offer(&mut self, call_id: CallId, receiver: UserId) -> Result<(), CallError> {
        let peer = self.peer.as_mut().ok_or_else(no_media_session)?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;

        self.emit(OutboundSignal::Offer(OfferPayload {
            room_id: call_id,
            offer: offer.into(),
            receiver_id: Some(receiver),
        }))
        .await?;
        self.awaiting_answer = true;
        if let Some(session) = self.session.as_mut() {
            session.offers_sent += 1;
        }
        Ok(())
    }

    fn mark_media_flowing(&mut self) {
        let connecting = self
            .session
            .as_ref()
            .is_some_and(|s| s.state == CallState::Connecting);
        if connecting {
            self.clear_timer();
            self.transition(CallTransition::MediaFlowing);
        }
    }

    fn transition(&mut self, transition: CallTransition) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match session.apply_transition(transition) {
            Ok(()) => {
                info!("Call {} is {}", display_id(session.call_id()), session.state);
                true
            }
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    async fn emit(&self, signal: OutboundSignal) -> Result<(), CallError> {
        debug!("--> {}", signal.kind());
        self.transport.emit(signal).await.map_err(|e| {
            warn!("Failed to send signal: {e}");
            CallError::from(e)
        })
    }

    /// Best-effort send; failure never blocks local cleanup.
    async fn notify(&self, signal: OutboundSignal) {
        let kind = signal.kind();
        if let Err(e) = self.transport.emit(signal).await {
            warn!("Could not notify server ({kind}): {e}");
        }
    }

    /// Tell the server we are leaving the call, as a decline while it is
    /// still ringing locally.
    async fn notify_hangup(&self) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(call_id) = session.call_id().cloned() else {
            debug!("Call has no server id yet; nothing to notify");
            return;
        };
        let signal = if session.state.can_reject() {
            OutboundSignal::DeclineCall(CallRef { call_id })
        } else {
            let (caller, receiver) = session.caller_and_receiver();
            OutboundSignal::EndCall(EndCallPayload {
                call_id,
                caller_id: caller.clone(),
                receiver_id: receiver.clone(),
            })
        };
        self.notify(signal).await;
    }

    /// End the call because of `error`, notifying the server best-effort.
    async fn fail(&mut self, error: CallError) {
        if self.session.is_none() {
            return;
        }
        let reason = match error {
            CallError::ConnectionTimeout => EndReason::Timeout,
            _ => EndReason::Failed,
        };
        warn!("Ending call: {error}");
        self.notify_hangup().await;
        self.teardown(reason, Some(error));
    }

    /// Release every resource the call owns and return to idle. This is the
    /// only path out of a call.
    fn teardown(&mut self, reason: EndReason, error: Option<CallError>) {
        self.deadline = None;
        self.generation += 1;
        self.acquiring = false;
        self.awaiting_answer = false;
        self.start_call_sent = false;
        self.remote_ice.reset();
        self.pending_offer.clear();
        self.last_remote_offer = None;
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }

        let pending_error = error.clone().unwrap_or(CallError::Cancelled);
        if let Some(reply) = self.pending_setup.take() {
            let _ = reply.send(Err(pending_error.clone()));
        }
        if let Some(reply) = self.pending_upgrade.take() {
            let _ = reply.send(Err(pending_error));
        }
        if let Some(error) = &error {
            self.report_error(error.clone());
        }

        let Some(mut session) = self.session.take() else {
            self.publish();
            return;
        };
        if let Err(e) = session.apply_transition(CallTransition::Terminated { reason }) {
            warn!("{e}");
        }
        info!("Call {} ended ({reason:?})", display_id(session.call_id()));
        self.publish_session(Some(&session));
        let _ = self.events.call_ended.send(Arc::new(CallEnded {
            call_id: session.call_id().cloned(),
            remote_user_id: session.remote_user_id.clone(),
            reason,
            error,
            duration: session.duration(),
        }));

        self.muted = false;
        self.camera_off = false;
        self.remote_media = false;
        if let Err(e) = session.apply_transition(CallTransition::Reset) {
            warn!("{e}");
        }
        self.publish();
    }

    fn report_error(&mut self, error: CallError) {
        self.last_error = Some(error.clone());
        let _ = self.events.call_error.send(Arc::new(CallFailure {
            call_id: self.active_call_id(),
            error,
        }));
    }

    fn arm_timer(&mut self, after: Duration, kind: TimerKind) {
        debug!("Arming {kind:?} timer for {after:?}");
        self.deadline = Some(Deadline {
            at: Instant::now() + after,
            kind,
        });
    }

    fn clear_timer(&mut self) {
        self.deadline = None;
    }

    fn has_live_call(&self) -> bool {
        self.session.is_some()
    }

    fn is_active_call(&self, call_id: &CallId) -> bool {
        self.session.as_ref().is_some_and(|s| s.matches(call_id))
    }

    fn active_call_id(&self) -> Option<CallId> {
        self.session.as_ref().and_then(|s| s.call_id().cloned())
    }

    fn discard(&self, what: &str, call_id: &CallId) {
        debug!("Discarding {what} for inactive call {call_id}");
    }

    fn publish(&self) {
        self.publish_session(self.session.as_ref());
    }

    fn publish_session(&self, session: Option<&CallSession>) {
        let snapshot = CallSnapshot {
            state: session.map(|s| s.state).unwrap_or_default(),
            call_id: session.and_then(|s| s.call_id().cloned()),
            call_type: session.map(|s| s.call_type()),
            role: session.map(|s| s.role()),
            remote_user_id: session.map(|s| s.remote_user_id.clone()),
            title: session.and_then(|s| s.title.clone()),
            started_at: session.and_then(|s| s.started_at),
            muted: self.muted,
            camera_off: self.camera_off,
            remote_media: self.remote_media,
            offers_sent: session.map(|s| s.offers_sent).unwrap_or_default(),
            live_local_tracks: self
                .local_stream
                .as_ref()
                .map(LocalStream::live_tracks)
                .unwrap_or_default(),
            last_error: self.last_error.clone(),
        };
        self.snapshot_tx.send_replace(snapshot.clone());
        let _ = self.events.state_changed.send(Arc::new(snapshot));
    }
}

fn candidate_label(candidate: &IceCandidate) -> &'static str {
    candidate
        .candidate_type()
        .map_or("unknown", |t| t.as_str())
}

fn no_media_session() -> CallError {
    CallError::NegotiationFailed("no media session".to_string())
}

fn display_id(call_id: Option<&CallId>) -> &str {
    call_id.map(CallId::as_str).unwrap_or("<pending>")
}
