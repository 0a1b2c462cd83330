//! Core of the peer-to-peer call signaling stack.
//!
//! This crate holds everything that does not depend on a socket, an HTTP
//! library or a media engine: identifiers, the signaling wire format, the
//! per-call state machine, negotiation buffers, errors and the ports that
//! adapters implement.

pub mod error;
pub mod ice;
pub mod net;
pub mod signaling;
pub mod state;
pub mod types;

pub use error::{CallError, MediaError, SignalingError, TransportError};
pub use ice::{PendingIceQueue, PendingOffer};
pub use signaling::{InboundSignal, OutboundSignal, SignalKind};
pub use state::{CallSession, CallState, CallTransition, EndReason, InvalidTransition};
