//! Peer session management: the per-peer protocol state machine, the
//! manager that drives it from transport events, and the callback boundary
//! towards the UI.

use std::fmt;

use uuid::Uuid;

pub mod callbacks;
pub mod manager;
pub mod state;

pub use callbacks::{ChannelCallbacks, NoopCallbacks, SessionCallbacks, SessionEvent};
pub use manager::PeerSessionManager;
pub use state::{SessionInput, SessionState};

/// Opaque identity of this instance, stamped as `sender` on every envelope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalIdentity(String);

impl LocalIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LocalIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
