//! Serverless peer-to-peer messenger core.
//!
//! Two instances exchange an SDP offer and answer out of band, open an
//! ordered WebRTC data channel, swap P-256 public keys over it and from then
//! on seal every application message with a per-peer AES-256-GCM key.
//!
//! No key is verified against an identity: a party able to rewrite the
//! signaling payloads can sit in the middle of the exchange undetected.

pub mod config;
pub mod crypto;
pub mod error;
pub mod network;
pub mod session;
pub mod store;

pub use config::{AppConfig, PreKeyPolicy, SessionConfig};
pub use error::{P2PError, P2PResult};
pub use network::{
    Envelope, FileAttachment, IceCandidate, LoopbackNetwork, PeerId, SessionDescription,
    WebRtcTransport,
};
pub use session::{
    ChannelCallbacks, LocalIdentity, PeerSessionManager, SessionCallbacks, SessionEvent,
    SessionState,
};
pub use store::{Contact, ProfileStore, SqliteStore, UserProfile};
