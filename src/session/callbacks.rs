use tokio::sync::mpsc;

use crate::error::P2PError;
use crate::network::{Envelope, IceCandidate, PeerId};

/// Notifications from the session manager to the UI layer.
///
/// Called from inside the manager's event handling; implementations should
/// hand work off rather than block.
pub trait SessionCallbacks: Send {
    /// An application envelope arrived; encrypted content is already decrypted.
    fn on_message(&mut self, peer: &PeerId, envelope: Envelope);

    fn on_connection(&mut self, peer: &PeerId);

    fn on_disconnection(&mut self, peer: &PeerId);

    fn on_error(&mut self, error: P2PError);

    /// A local candidate to deliver to `peer` out of band.
    fn on_ice_candidate(&mut self, _peer: &PeerId, _candidate: IceCandidate) {}
}

/// Everything [`SessionCallbacks`] can report, as one value
#[derive(Debug)]
pub enum SessionEvent {
    Message { peer: PeerId, envelope: Envelope },
    Connected(PeerId),
    Disconnected(PeerId),
    Error(P2PError),
    IceCandidate { peer: PeerId, candidate: IceCandidate },
}

/// Forwards callbacks into an unbounded channel of [`SessionEvent`]s
#[derive(Debug, Clone)]
pub struct ChannelCallbacks {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelCallbacks {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl SessionCallbacks for ChannelCallbacks {
    fn on_message(&mut self, peer: &PeerId, envelope: Envelope) {
        self.forward(SessionEvent::Message {
            peer: peer.clone(),
            envelope,
        });
    }

    fn on_connection(&mut self, peer: &PeerId) {
        self.forward(SessionEvent::Connected(peer.clone()));
    }

    fn on_disconnection(&mut self, peer: &PeerId) {
        self.forward(SessionEvent::Disconnected(peer.clone()));
    }

    fn on_error(&mut self, error: P2PError) {
        self.forward(SessionEvent::Error(error));
    }

    fn on_ice_candidate(&mut self, peer: &PeerId, candidate: IceCandidate) {
        self.forward(SessionEvent::IceCandidate {
            peer: peer.clone(),
            candidate,
        });
    }
}

/// Callbacks that drop everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl SessionCallbacks for NoopCallbacks {
    fn on_message(&mut self, _peer: &PeerId, _envelope: Envelope) {}

    fn on_connection(&mut self, _peer: &PeerId) {}

    fn on_disconnection(&mut self, _peer: &PeerId) {}

    fn on_error(&mut self, _error: P2PError) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Content;

    #[test]
    fn test_channel_callbacks_forward_in_order() {
        let (mut callbacks, mut rx) = ChannelCallbacks::new();
        let bob = PeerId::from("bob");

        callbacks.on_connection(&bob);
        callbacks.on_message(&bob, Envelope::text("remote-id", Content::plain("hi")));
        callbacks.on_error(P2PError::DecryptionFailed);
        callbacks.on_disconnection(&bob);

        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Connected(p)) if p == bob));
        match rx.try_recv() {
            Ok(SessionEvent::Message { peer, envelope }) => {
                assert_eq!(peer, bob);
                assert_eq!(envelope.text_content(), Some("hi"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::Error(P2PError::DecryptionFailed))
        ));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Disconnected(_))));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (mut callbacks, rx) = ChannelCallbacks::new();
        drop(rx);
        callbacks.on_connection(&PeerId::from("bob"));
    }
}
