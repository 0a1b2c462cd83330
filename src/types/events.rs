use crate::calls::CallSnapshot;
use crate::media::{LocalStream, RemoteTrack};
use callcore::error::CallError;
use callcore::state::EndReason;
use callcore::types::{CallId, CallType, UserId};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// A call is ringing locally. No media has been acquired yet.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub from: UserId,
    pub title: Option<String>,
    pub call_type: CallType,
}

/// The server created our outgoing call.
#[derive(Debug, Clone)]
pub struct CallStarted {
    pub call_id: CallId,
    pub to: UserId,
    pub call_type: CallType,
}

/// A call reached its terminal state. Cleanup has already run.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: Option<CallId>,
    pub remote_user_id: UserId,
    pub reason: EndReason,
    pub error: Option<CallError>,
    pub duration: Option<chrono::Duration>,
}

/// Local capture is available for preview.
#[derive(Debug, Clone)]
pub struct LocalStreamReady {
    pub stream: LocalStream,
}

#[derive(Debug, Clone)]
pub struct RemoteTrackAdded {
    pub call_id: Option<CallId>,
    pub track: RemoteTrack,
}

/// An error surfaced for the active call.
#[derive(Debug, Clone)]
pub struct CallFailure {
    pub call_id: Option<CallId>,
    pub error: CallError,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (state_changed, Arc<CallSnapshot>),
    (incoming_call, Arc<IncomingCall>),
    (call_started, Arc<CallStarted>),
    (call_ended, Arc<CallEnded>),
    (local_stream, Arc<LocalStreamReady>),
    (remote_track, Arc<RemoteTrackAdded>),
    (call_error, Arc<CallFailure>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
