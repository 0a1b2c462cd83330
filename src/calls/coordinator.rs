//! UI-facing handle to the call engine.

use super::actor::CallActor;
use super::engine::{CallEngine, Command, Reply};
use crate::config::CallConfig;
use crate::media::MediaDevices;
use crate::types::events::EventBus;
use callcore::error::CallError;
use callcore::net::{SignalingTransport, TransportEvent};
use callcore::state::CallState;
use callcore::types::{CallId, CallRole, CallType, LocalIdentity, UserId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Everything a UI needs to render the current call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub call_id: Option<CallId>,
    pub call_type: Option<CallType>,
    pub role: Option<CallRole>,
    pub remote_user_id: Option<UserId>,
    pub title: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub camera_off: bool,
    pub remote_media: bool,
    pub offers_sent: u32,
    pub live_local_tracks: usize,
    /// Most recent error, kept after the call returns to idle.
    pub last_error: Option<CallError>,
}

impl CallSnapshot {
    pub fn is_call_active(&self) -> bool {
        !self.state.is_idle()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| Utc::now() - started)
    }
}

/// Cloneable handle for driving calls. All state lives in a single actor
/// task; every method here is a message to it.
#[derive(Clone)]
pub struct CallCoordinator {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: Arc<EventBus>,
}

impl CallCoordinator {
    /// Spawn the engine on the current Tokio runtime.
    ///
    /// `identity` is `None` until the user has signed in; calls cannot be
    /// placed or received without it.
    pub fn start(
        config: CallConfig,
        identity: Option<LocalIdentity>,
        transport: Arc<dyn SignalingTransport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventBus::new());

        let engine = CallEngine::new(
            config,
            identity,
            transport,
            devices,
            events.clone(),
            snapshot_tx,
            completion_tx,
            media_tx,
        );
        let actor = CallActor {
            engine,
            commands: command_rx,
            transport_events: Some(transport_events),
            completions: completion_rx,
            media_events: media_rx,
        };
        tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            snapshot: snapshot_rx,
            events,
        }
    }

    /// Place a call. Resolves once local media is captured and the server
    /// has been asked to create the call.
    pub async fn initiate_call(
        &self,
        remote_user_id: UserId,
        call_type: CallType,
        title: Option<String>,
    ) -> Result<(), CallError> {
        self.request(|reply| Command::Initiate {
            remote_user_id,
            call_type,
            title,
            reply,
        })
        .await
    }

    /// Answer the ringing call. Resolves once local media is captured and
    /// the acceptance has been sent.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Hang up. A no-op when there is no call.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Returns the new muted flag; `false` when there is no local audio.
    pub async fn toggle_mute(&self) -> bool {
        self.request(|reply| Command::ToggleMute { reply })
            .await
            .unwrap_or(false)
    }

    /// Returns the new camera-off flag; `false` when there is no local video.
    pub async fn toggle_camera(&self) -> bool {
        self.request(|reply| Command::ToggleCamera { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn switch_camera(&self) -> Result<(), CallError> {
        self.request(|reply| Command::SwitchCamera { reply }).await
    }

    /// Add a camera track to a connected audio call and renegotiate.
    pub async fn upgrade_to_video(&self) -> Result<(), CallError> {
        self.request(|reply| Command::UpgradeToVideo { reply }).await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// End any active call and stop the engine.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)?
    }
}
