//! webrtc-rs backend.
//!
//! Connections are created with an empty ICE server list, so only paths the
//! local network offers directly are tried. Local descriptions are returned
//! after candidate gathering completes, which lets a single pasted offer or
//! answer carry every candidate.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ConnectionState, DataChannel, EventSink, IceCandidate, PeerConnection, PeerTransport,
    SdpType, SessionDescription, SignalingState, TransportEventKind,
};
use crate::error::{P2PError, P2PResult};

/// Creates native peer connections through a shared webrtc-rs API instance
pub struct WebRtcTransport {
    api: API,
}

impl WebRtcTransport {
    pub fn new() -> P2PResult<Self> {
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_connection(&self, sink: EventSink) -> P2PResult<Box<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: Vec::new(),
            ..Default::default()
        };
        let ice_servers = config.ice_servers.len();
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                debug!(peer = %sink.peer(), ?state, "Peer connection state changed");
                sink.emit(TransportEventKind::ConnectionState(connection_state(state)));
            })
        }));

        let signaling_sink = sink.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let sink = signaling_sink.clone();
            Box::pin(async move {
                sink.emit(TransportEventKind::SignalingState(signaling_state(state)));
            })
        }));

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(TransportEventKind::LocalCandidate(from_init(init))),
                    Err(e) => warn!(peer = %sink.peer(), "Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let channel_sink = sink.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = channel_sink.clone();
            Box::pin(async move {
                debug!(peer = %sink.peer(), label = %dc.label(), "Remote data channel announced");
                let channel = RtcDataChannel::attach(dc, sink.clone());
                sink.emit(TransportEventKind::DataChannel(Arc::new(channel)));
            })
        }));

        Ok(Box::new(RtcPeerConnection {
            pc,
            sink,
            ice_servers,
        }))
    }
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
    ice_servers: usize,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_data_channel(&self, label: &str) -> P2PResult<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        Ok(Arc::new(RtcDataChannel::attach(dc, self.sink.clone())))
    }

    async fn create_offer(&self) -> P2PResult<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        to_description(offer)
    }

    async fn create_answer(&self) -> P2PResult<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        to_description(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> P2PResult<SessionDescription> {
        let mut gathering_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(to_native(desc.clone())?).await?;
        let _ = gathering_complete.recv().await;

        match self.pc.local_description().await {
            Some(gathered) => to_description(gathered),
            None => Ok(desc),
        }
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> P2PResult<()> {
        self.pc.set_remote_description(to_native(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> P2PResult<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    fn ice_server_count(&self) -> usize {
        self.ice_servers
    }

    async fn close(&self) -> P2PResult<()> {
        self.pc.close().await?;
        Ok(())
    }
}

struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    /// Forward the channel's callbacks into `sink`.
    fn attach(dc: Arc<RTCDataChannel>, sink: EventSink) -> Self {
        let open_sink = sink.clone();
        dc.on_open(Box::new(move || {
            let sink = open_sink.clone();
            Box::pin(async move {
                sink.emit(TransportEventKind::ChannelOpen);
            })
        }));

        let close_sink = sink.clone();
        dc.on_close(Box::new(move || {
            let sink = close_sink.clone();
            Box::pin(async move {
                sink.emit(TransportEventKind::ChannelClosed);
            })
        }));

        let error_sink = sink.clone();
        dc.on_error(Box::new(move |err: webrtc::Error| {
            let sink = error_sink.clone();
            Box::pin(async move {
                sink.emit(TransportEventKind::ChannelError(err.to_string()));
            })
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                if !msg.is_string {
                    sink.emit(TransportEventKind::ChannelError(
                        "binary frames are not supported".to_string(),
                    ));
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => sink.emit(TransportEventKind::ChannelMessage(text)),
                    Err(_) => sink.emit(TransportEventKind::ChannelError(
                        "text frame is not valid UTF-8".to_string(),
                    )),
                }
            })
        }));

        Self { dc }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> P2PResult<()> {
        if !self.is_open() {
            return Err(P2PError::ChannelNotOpen(self.label()));
        }
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> P2PResult<()> {
        self.dc.close().await?;
        Ok(())
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Other,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_description(desc: RTCSessionDescription) -> P2PResult<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(P2PError::MalformedSignal(format!(
            "unsupported description type {:?}",
            other
        ))),
    }
}

fn to_native(desc: SessionDescription) -> P2PResult<RTCSessionDescription> {
    let native = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    native.map_err(|e| P2PError::MalformedSignal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
        assert!(connection_state(RTCPeerConnectionState::Failed).is_terminal());
        assert_eq!(
            signaling_state(RTCSignalingState::HaveLocalPranswer),
            SignalingState::Other
        );
    }

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = from_init(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.4 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        });
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn test_connections_have_no_ice_servers() {
        let transport = WebRtcTransport::new().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = transport
            .create_connection(EventSink::new(tx, "bob".into(), 1))
            .await
            .unwrap();

        assert_eq!(conn.ice_server_count(), 0);
        conn.close().await.unwrap();
    }
}
