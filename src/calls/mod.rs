//! One-to-one call orchestration.
//!
//! # Architecture
//!
//! - [`CallCoordinator`]: cloneable handle used by the UI. Sends commands to
//!   the engine and exposes a [`CallSnapshot`] watch channel plus the
//!   [`EventBus`](crate::types::events::EventBus).
//! - `CallActor`: the single task that owns all call state and processes
//!   commands, signaling, media callbacks and timers in arrival order.
//! - `CallEngine`: the call logic. Sequences the offer/answer exchange,
//!   buffers early offers and candidates, and guarantees that every exit
//!   path releases local media.
//! - [`CallStatusClient`]: REST lookup of a call's server record.

mod actor;
mod coordinator;
mod engine;
mod status;


pub use coordinator::{CallCoordinator, CallSnapshot};
pub use status::{CallStatusClient, StatusError};
