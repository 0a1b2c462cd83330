pub use callcore::{error, ice, net, signaling, state};

// Core types are re-exported, but events (with EventBus) live here next to the engine
pub mod types {
    pub use callcore::types::*;
    pub mod events;
}

pub mod calls;
pub mod config;
pub mod media;

#[cfg(test)]
pub(crate) mod test_utils;

pub use calls::{CallCoordinator, CallSnapshot, CallStatusClient, StatusError};
pub use config::CallConfig;
