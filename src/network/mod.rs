//! Transport seam between the session state machine and native peer connections.
//!
//! Native connection and data-channel callbacks never touch session state.
//! They push [`TransportEvent`]s into an unbounded channel that the owner of
//! the session manager drains, one event per state-machine step.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod loopback;
pub mod messages;
pub mod rtc;
pub mod signaling;

pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use messages::{Body, Content, Envelope, FileAttachment, FilePayload, MessageType};
pub use signaling::{IceCandidate, SdpType, SessionDescription};
pub use rtc::WebRtcTransport;

use crate::error::P2PResult;

/// Identifier of a remote peer, chosen by whoever drives signaling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Aggregate connection state as reported by the native connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
    Other,
}

/// Native events, one per callback the platform fires
#[derive(Clone)]
pub enum TransportEventKind {
    ConnectionState(ConnectionState),
    SignalingState(SignalingState),
    LocalCandidate(IceCandidate),
    /// Callee side: the remote end opened a data channel.
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelClosed,
    ChannelMessage(String),
    ChannelError(String),
}

impl fmt::Debug for TransportEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            Self::SignalingState(s) => f.debug_tuple("SignalingState").field(s).finish(),
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(&c.candidate).finish(),
            Self::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            Self::ChannelOpen => f.write_str("ChannelOpen"),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(&m.len()).finish(),
            Self::ChannelError(e) => f.debug_tuple("ChannelError").field(e).finish(),
        }
    }
}

/// An event tagged with the session it belongs to
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub peer: PeerId,
    /// Session generation; events from replaced sessions are discarded.
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Handle given to a native connection so its callbacks can report events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    peer: PeerId,
    generation: u64,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>, peer: PeerId, generation: u64) -> Self {
        Self {
            tx,
            peer,
            generation,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Report an event. A dropped receiver means the manager is gone; the event is discarded.
    pub fn emit(&self, kind: TransportEventKind) {
        let _ = self.tx.send(TransportEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            kind,
        });
    }
}

/// Factory for native peer connections
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a connection configured with an empty ICE server list.
    async fn create_connection(&self, sink: EventSink) -> P2PResult<Box<dyn PeerConnection>>;
}

/// One native peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an ordered, reliable data channel.
    async fn create_data_channel(&self, label: &str) -> P2PResult<Arc<dyn DataChannel>>;

    async fn create_offer(&self) -> P2PResult<SessionDescription>;

    async fn create_answer(&self) -> P2PResult<SessionDescription>;

    /// Apply a local description and return the effective one, including
    /// any candidates gathered while applying it.
    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> P2PResult<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> P2PResult<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> P2PResult<()>;

    /// Number of ICE servers this connection was configured with.
    fn ice_server_count(&self) -> usize;

    async fn close(&self) -> P2PResult<()>;
}

/// One native data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> P2PResult<()>;

    async fn close(&self) -> P2PResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }

    #[tokio::test]
    async fn test_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx, PeerId::from("bob"), 7);

        sink.emit(TransportEventKind::ChannelOpen);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer, PeerId::from("bob"));
        assert_eq!(event.generation, 7);
        assert!(matches!(event.kind, TransportEventKind::ChannelOpen));
    }
}
