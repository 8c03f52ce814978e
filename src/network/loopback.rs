//! In-process transport linking managers without touching the network.
//!
//! Offers and answers carry a token attribute in their SDP. When the caller
//! applies the matching answer both ends are linked and receive the events a
//! native stack would fire: signaling stable, connection connected, data
//! channel (callee only) and channel open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    ConnectionState, DataChannel, EventSink, IceCandidate, PeerConnection, PeerTransport,
    SdpType, SessionDescription, SignalingState, TransportEventKind,
};
use crate::error::{P2PError, P2PResult};

const OFFER_ATTR: &str = "a=loopback-offer:";
const ANSWER_ATTR: &str = "a=loopback-answer:";
const LABEL_ATTR: &str = "a=loopback-label:";
const FIRST_PORT: u16 = 40000;

/// Shared medium for every loopback endpoint created from it
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    /// Offer token -> data channel label
    offers: HashMap<String, String>,
    answers: HashMap<String, AnswerSide>,
    /// (from endpoint, to endpoint) -> sink of the receiving connection
    routes: HashMap<(String, String), EventSink>,
    applied: Vec<(String, IceCandidate)>,
    unreachable: bool,
    issued_candidates: u16,
}

struct AnswerSide {
    name: String,
    sink: EventSink,
    state: Arc<Mutex<ConnState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for one named endpoint on this network.
    pub fn transport(&self, name: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            name: name.into(),
        }
    }

    /// When set, linking fails the way an unroutable pairing does.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    /// Remote candidates accepted by `endpoint`'s connections, in application order.
    pub fn applied_candidates(&self, endpoint: &str) -> Vec<IceCandidate> {
        self.inner
            .lock()
            .applied
            .iter()
            .filter(|(name, _)| name == endpoint)
            .map(|(_, candidate)| candidate.clone())
            .collect()
    }

    /// Deliver a raw text frame from `from` to `to` as if it arrived on the
    /// data channel. Returns false when the two endpoints are not linked.
    pub fn inject(&self, from: &str, to: &str, frame: impl Into<String>) -> bool {
        let inner = self.inner.lock();
        match inner.routes.get(&(from.to_string(), to.to_string())) {
            Some(sink) => {
                sink.emit(TransportEventKind::ChannelMessage(frame.into()));
                true
            }
            None => false,
        }
    }

    fn host_candidate(&self) -> IceCandidate {
        let mut inner = self.inner.lock();
        let port = FIRST_PORT.wrapping_add(inner.issued_candidates);
        inner.issued_candidates = inner.issued_candidates.wrapping_add(1);
        IceCandidate::new(format!(
            "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
            port
        ))
    }
}

pub struct LoopbackTransport {
    network: LoopbackNetwork,
    name: String,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_connection(&self, sink: EventSink) -> P2PResult<Box<dyn PeerConnection>> {
        debug!(endpoint = %self.name, peer = %sink.peer(), "Creating loopback connection");
        Ok(Box::new(LoopbackConnection {
            network: self.network.clone(),
            name: self.name.clone(),
            sink,
            state: Arc::new(Mutex::new(ConnState::default())),
        }))
    }
}

#[derive(Default)]
struct ConnState {
    /// Token of the offer this connection created
    local_token: Option<String>,
    /// Token of the offer this connection received
    remote_token: Option<String>,
    has_remote: bool,
    channel: Option<Arc<LoopbackChannel>>,
    remote_sink: Option<EventSink>,
    remote_name: Option<String>,
    closed: bool,
}

struct LoopbackConnection {
    network: LoopbackNetwork,
    name: String,
    sink: EventSink,
    state: Arc<Mutex<ConnState>>,
}

fn sdp_attr<'a>(sdp: &'a str, attr: &str) -> Option<&'a str> {
    sdp.lines()
        .find_map(|line| line.strip_prefix(attr))
        .map(str::trim)
}

impl LoopbackConnection {
    fn ensure_open(&self) -> P2PResult<()> {
        if self.state.lock().closed {
            return Err(P2PError::Transport("connection closed".to_string()));
        }
        Ok(())
    }

    /// Caller side: pair with the endpoint that answered `token`.
    fn link(&self, token: &str) -> P2PResult<()> {
        let mut net = self.network.inner.lock();
        let label = net.offers.remove(token).unwrap_or_default();
        let callee = net.answers.remove(token).ok_or_else(|| {
            P2PError::ConnectionFailed("no loopback endpoint answered this offer".to_string())
        })?;

        if net.unreachable {
            drop(net);
            debug!(endpoint = %self.name, remote = %callee.name, "Loopback pairing unreachable");
            self.sink
                .emit(TransportEventKind::ConnectionState(ConnectionState::Failed));
            callee
                .sink
                .emit(TransportEventKind::ConnectionState(ConnectionState::Failed));
            return Ok(());
        }

        net.routes.insert(
            (self.name.clone(), callee.name.clone()),
            callee.sink.clone(),
        );
        net.routes
            .insert((callee.name.clone(), self.name.clone()), self.sink.clone());
        drop(net);

        let caller_channel = {
            let mut state = self.state.lock();
            state.remote_sink = Some(callee.sink.clone());
            state.remote_name = Some(callee.name.clone());
            state.channel.clone().ok_or_else(|| {
                P2PError::ConnectionFailed("offer was created without a data channel".to_string())
            })?
        };
        *caller_channel.remote.lock() = Some(callee.sink.clone());
        let callee_channel = Arc::new(LoopbackChannel {
            label,
            link: caller_channel.link.clone(),
            remote: Mutex::new(Some(self.sink.clone())),
        });
        {
            let mut state = callee.state.lock();
            state.channel = Some(callee_channel.clone());
            state.remote_sink = Some(self.sink.clone());
            state.remote_name = Some(self.name.clone());
        }
        caller_channel.link.store(true, Ordering::SeqCst);

        debug!(endpoint = %self.name, remote = %callee.name, "Loopback endpoints linked");

        self.sink
            .emit(TransportEventKind::SignalingState(SignalingState::Stable));
        self.sink
            .emit(TransportEventKind::ConnectionState(ConnectionState::Connected));
        self.sink.emit(TransportEventKind::ChannelOpen);

        callee
            .sink
            .emit(TransportEventKind::SignalingState(SignalingState::Stable));
        callee
            .sink
            .emit(TransportEventKind::DataChannel(callee_channel));
        callee
            .sink
            .emit(TransportEventKind::ConnectionState(ConnectionState::Connected));
        callee.sink.emit(TransportEventKind::ChannelOpen);
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_data_channel(&self, label: &str) -> P2PResult<Arc<dyn DataChannel>> {
        self.ensure_open()?;
        let channel = Arc::new(LoopbackChannel {
            label: label.to_string(),
            link: Arc::new(AtomicBool::new(false)),
            remote: Mutex::new(None),
        });
        self.state.lock().channel = Some(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> P2PResult<SessionDescription> {
        self.ensure_open()?;
        let token = Uuid::new_v4().to_string();
        let label = {
            let mut state = self.state.lock();
            state.local_token = Some(token.clone());
            state
                .channel
                .as_ref()
                .map(|c| c.label.clone())
                .unwrap_or_default()
        };
        self.network
            .inner
            .lock()
            .offers
            .insert(token.clone(), label.clone());

        Ok(SessionDescription::offer(format!(
            "v=0\r\n{}{}\r\n{}{}\r\n",
            OFFER_ATTR, token, LABEL_ATTR, label
        )))
    }

    async fn create_answer(&self) -> P2PResult<SessionDescription> {
        self.ensure_open()?;
        let token = self.state.lock().remote_token.clone().ok_or_else(|| {
            P2PError::Transport("cannot answer without a remote offer".to_string())
        })?;
        self.network.inner.lock().answers.insert(
            token.clone(),
            AnswerSide {
                name: self.name.clone(),
                sink: self.sink.clone(),
                state: self.state.clone(),
            },
        );
        Ok(SessionDescription::answer(format!(
            "v=0\r\n{}{}\r\n",
            ANSWER_ATTR, token
        )))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> P2PResult<SessionDescription> {
        self.ensure_open()?;
        if desc.sdp_type == SdpType::Offer {
            self.sink
                .emit(TransportEventKind::SignalingState(SignalingState::HaveLocalOffer));
        }
        self.sink
            .emit(TransportEventKind::LocalCandidate(self.network.host_candidate()));
        Ok(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> P2PResult<()> {
        self.ensure_open()?;
        match desc.sdp_type {
            SdpType::Offer => {
                let token = sdp_attr(&desc.sdp, OFFER_ATTR)
                    .ok_or_else(|| P2PError::MalformedSignal("not a loopback offer".to_string()))?;
                if !self.network.inner.lock().offers.contains_key(token) {
                    return Err(P2PError::ConnectionFailed(
                        "offer is unknown on this loopback network".to_string(),
                    ));
                }
                {
                    let mut state = self.state.lock();
                    state.remote_token = Some(token.to_string());
                    state.has_remote = true;
                }
                self.sink
                    .emit(TransportEventKind::SignalingState(SignalingState::HaveRemoteOffer));
                Ok(())
            }
            SdpType::Answer => {
                let token = sdp_attr(&desc.sdp, ANSWER_ATTR)
                    .ok_or_else(|| P2PError::MalformedSignal("not a loopback answer".to_string()))?;
                {
                    let mut state = self.state.lock();
                    if state.local_token.as_deref() != Some(token) {
                        return Err(P2PError::MalformedSignal(
                            "answer does not match the local offer".to_string(),
                        ));
                    }
                    state.has_remote = true;
                }
                self.link(token)
            }
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> P2PResult<()> {
        self.ensure_open()?;
        if !self.state.lock().has_remote {
            return Err(P2PError::Transport(
                "remote description not set".to_string(),
            ));
        }
        self.network
            .inner
            .lock()
            .applied
            .push((self.name.clone(), candidate));
        Ok(())
    }

    fn ice_server_count(&self) -> usize {
        0
    }

    async fn close(&self) -> P2PResult<()> {
        let (channel, remote, remote_name, tokens) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (
                state.channel.take(),
                state.remote_sink.take(),
                state.remote_name.take(),
                [state.local_token.take(), state.remote_token.take()],
            )
        };
        {
            let mut net = self.network.inner.lock();
            for token in tokens.iter().flatten() {
                net.offers.remove(token);
                net.answers.remove(token);
            }
            if let Some(remote_name) = remote_name {
                net.routes.remove(&(self.name.clone(), remote_name.clone()));
                net.routes.remove(&(remote_name, self.name.clone()));
            }
        }
        if let Some(channel) = channel {
            channel.link.store(false, Ordering::SeqCst);
        }
        if let Some(remote) = remote {
            remote.emit(TransportEventKind::ChannelClosed);
            remote.emit(TransportEventKind::ConnectionState(
                ConnectionState::Disconnected,
            ));
        }
        debug!(endpoint = %self.name, peer = %self.sink.peer(), "Loopback connection closed");
        Ok(())
    }
}

/// One end of a loopback data channel; both ends share the link flag.
pub struct LoopbackChannel {
    label: String,
    link: Arc<AtomicBool>,
    remote: Mutex<Option<EventSink>>,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.link.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> P2PResult<()> {
        if !self.is_open() {
            return Err(P2PError::ChannelNotOpen(self.label.clone()));
        }
        match self.remote.lock().as_ref() {
            Some(sink) => {
                sink.emit(TransportEventKind::ChannelMessage(text));
                Ok(())
            }
            None => Err(P2PError::ChannelNotOpen(self.label.clone())),
        }
    }

    async fn close(&self) -> P2PResult<()> {
        if self.link.swap(false, Ordering::SeqCst) {
            if let Some(sink) = self.remote.lock().as_ref() {
                sink.emit(TransportEventKind::ChannelClosed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PeerId, TransportEvent};
    use tokio::sync::mpsc;

    async fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEventKind> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.kind);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_links_both_ends() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let a = network
            .transport("a")
            .create_connection(EventSink::new(a_tx, PeerId::from("b"), 1))
            .await
            .unwrap();
        let b = network
            .transport("b")
            .create_connection(EventSink::new(b_tx, PeerId::from("a"), 1))
            .await
            .unwrap();

        let a_channel = a.create_data_channel("chat").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        assert!(!a_channel.is_open());

        a.set_remote_description(answer).await.unwrap();
        assert!(a_channel.is_open());

        let a_events = drain(&mut a_rx).await;
        assert!(a_events
            .iter()
            .any(|e| matches!(e, TransportEventKind::ConnectionState(ConnectionState::Connected))));
        assert!(matches!(a_events.last(), Some(TransportEventKind::ChannelOpen)));

        let b_events = drain(&mut b_rx).await;
        let b_channel = b_events
            .iter()
            .find_map(|e| match e {
                TransportEventKind::DataChannel(dc) => Some(dc.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(b_channel.label(), "chat");

        a_channel.send_text("ping".to_string()).await.unwrap();
        match drain(&mut b_rx).await.as_slice() {
            [TransportEventKind::ChannelMessage(text)] => assert_eq!(text, "ping"),
            other => panic!("unexpected events: {:?}", other),
        }

        a.close().await.unwrap();
        assert!(!b_channel.is_open());
        assert!(drain(&mut b_rx)
            .await
            .iter()
            .any(|e| matches!(e, TransportEventKind::ConnectionState(ConnectionState::Disconnected))));
    }

    #[tokio::test]
    async fn test_candidates_need_remote_description() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = network
            .transport("b")
            .create_connection(EventSink::new(tx, PeerId::from("a"), 1))
            .await
            .unwrap();

        let candidate = IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 9 typ host");
        assert!(conn.add_ice_candidate(candidate).await.is_err());
        assert!(network.applied_candidates("b").is_empty());
        assert_eq!(conn.ice_server_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_pairing_fails() {
        let network = LoopbackNetwork::new();
        network.set_unreachable(true);
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();

        let a = network
            .transport("a")
            .create_connection(EventSink::new(a_tx, PeerId::from("b"), 1))
            .await
            .unwrap();
        let b = network
            .transport("b")
            .create_connection(EventSink::new(b_tx, PeerId::from("a"), 1))
            .await
            .unwrap();

        let channel = a.create_data_channel("chat").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert!(!channel.is_open());
        assert!(drain(&mut a_rx)
            .await
            .iter()
            .any(|e| matches!(e, TransportEventKind::ConnectionState(ConnectionState::Failed))));
        assert!(!network.inject("a", "b", "hello"));
    }
}
