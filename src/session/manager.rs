//! Registry of peer sessions and the event loop that drives them.
//!
//! The manager is owned by one task. Every native callback arrives as a
//! [`TransportEvent`] that the owner feeds back through [`handle_event`],
//! so session state is only ever touched through `&mut self`.
//!
//! [`handle_event`]: PeerSessionManager::handle_event

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::callbacks::SessionCallbacks;
use super::state::{SessionInput, SessionState};
use super::LocalIdentity;
use crate::config::{PreKeyPolicy, SessionConfig};
use crate::crypto::{
    decrypt_text, derive_shared_secret, encrypt_text, import_public_key, DhKeyPair, SharedKey,
};
use crate::error::{P2PError, P2PResult};
use crate::network::{
    Body, ConnectionState, Content, DataChannel, Envelope, EventSink, FileAttachment,
    FilePayload, IceCandidate, PeerConnection, PeerId, PeerTransport, SdpType,
    SessionDescription, SignalingState, TransportEvent, TransportEventKind,
};
use crate::store::UserProfile;

/// Everything the manager holds for one remote peer
struct PeerSession {
    generation: u64,
    state: SessionState,
    connection: Option<Box<dyn PeerConnection>>,
    channel: Option<Arc<dyn DataChannel>>,
    shared_key: Option<SharedKey>,
    remote_public_key: Option<String>,
    /// Remote candidates that arrived before the connection could take them
    pending_candidates: Vec<IceCandidate>,
    remote_description_applied: bool,
    /// Application envelopes with plain content, waiting for the shared key
    outbox: VecDeque<Envelope>,
    /// Transport has reported a connection
    connected: bool,
    /// `on_connection` has fired
    announced: bool,
    key_sent: bool,
}

impl PeerSession {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            state: SessionState::Idle,
            connection: None,
            channel: None,
            shared_key: None,
            remote_public_key: None,
            pending_candidates: Vec::new(),
            remote_description_applied: false,
            outbox: VecDeque::new(),
            connected: false,
            announced: false,
            key_sent: false,
        }
    }

    fn apply(&mut self, input: SessionInput) {
        if let Some(next) = self.state.next(input) {
            self.state = next;
        }
    }

    fn release(&mut self) -> (Option<Arc<dyn DataChannel>>, Option<Box<dyn PeerConnection>>) {
        self.shared_key = None;
        self.pending_candidates.clear();
        self.outbox.clear();
        self.remote_description_applied = false;
        (self.channel.take(), self.connection.take())
    }

    fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.as_ref().filter(|c| c.is_open()).cloned()
    }
}

async fn close_native(
    peer: &PeerId,
    channel: Option<Arc<dyn DataChannel>>,
    connection: Option<Box<dyn PeerConnection>>,
) {
    if let Some(channel) = channel {
        if let Err(e) = channel.close().await {
            debug!(peer = %peer, "Error closing data channel: {}", e);
        }
    }
    if let Some(connection) = connection {
        if let Err(e) = connection.close().await {
            debug!(peer = %peer, "Error closing peer connection: {}", e);
        }
    }
}

async fn transmit(channel: &Arc<dyn DataChannel>, envelope: &Envelope) -> P2PResult<()> {
    let frame = envelope.to_json()?;
    channel.send_text(frame).await
}

fn seal_content(key: &SharedKey, content: Content) -> P2PResult<Content> {
    match content {
        Content::Plain { data } => Ok(Content::Encrypted(encrypt_text(key, &data)?)),
        sealed => Ok(sealed),
    }
}

fn open_content(key: Option<&SharedKey>, content: Content) -> P2PResult<Content> {
    match content {
        Content::Encrypted(data) => {
            let key = key.ok_or(P2PError::DecryptionFailed)?;
            Ok(Content::plain(decrypt_text(key, &data)?))
        }
        plain => Ok(plain),
    }
}

/// Encrypt the application content of an envelope.
fn seal_envelope(key: &SharedKey, mut envelope: Envelope) -> P2PResult<Envelope> {
    envelope.body = match envelope.body {
        Body::Text(content) => Body::Text(seal_content(key, content)?),
        Body::Image(mut file) => {
            file.data = seal_content(key, file.data)?;
            Body::Image(file)
        }
        Body::File(mut file) => {
            file.data = seal_content(key, file.data)?;
            Body::File(file)
        }
        other => other,
    };
    Ok(envelope)
}

/// Decrypt the application content of an envelope.
fn open_envelope(key: Option<&SharedKey>, mut envelope: Envelope) -> P2PResult<Envelope> {
    envelope.body = match envelope.body {
        Body::Text(content) => Body::Text(open_content(key, content)?),
        Body::Image(mut file) => {
            file.data = open_content(key, file.data)?;
            Body::Image(file)
        }
        Body::File(mut file) => {
            file.data = open_content(key, file.data)?;
            Body::File(file)
        }
        other => other,
    };
    Ok(envelope)
}

/// Owns every peer session of this instance
pub struct PeerSessionManager<C: SessionCallbacks> {
    config: SessionConfig,
    transport: Box<dyn PeerTransport>,
    callbacks: C,
    identity: Option<LocalIdentity>,
    key_pair: Option<DhKeyPair>,
    sessions: HashMap<PeerId, PeerSession>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl<C: SessionCallbacks> PeerSessionManager<C> {
    pub fn new(
        transport: impl PeerTransport + 'static,
        config: SessionConfig,
        callbacks: C,
    ) -> P2PResult<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            transport: Box::new(transport),
            callbacks,
            identity: None,
            key_pair: None,
            sessions: HashMap::new(),
            next_generation: 1,
            events_tx,
            events_rx,
        })
    }

    // ---- Lifecycle ----------------------------------------------------------

    /// Generate the local DH key pair and identity.
    pub async fn initialize(&mut self) -> P2PResult<LocalIdentity> {
        if self.identity.is_some() {
            return Err(P2PError::AlreadyInitialized);
        }
        let key_pair = DhKeyPair::generate()?;
        let identity = LocalIdentity::generate();
        info!(identity = %identity, "Session manager initialized");

        self.key_pair = Some(key_pair);
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Restore identity and DH key pair from a stored profile.
    pub async fn initialize_from_profile(
        &mut self,
        profile: &UserProfile,
    ) -> P2PResult<LocalIdentity> {
        if self.identity.is_some() {
            return Err(P2PError::AlreadyInitialized);
        }
        let key_pair = DhKeyPair::from_jwk(&profile.dh_key_jwk)?;
        let identity = LocalIdentity::from(profile.id.clone());
        info!(identity = %identity, "Session manager restored from profile");

        self.key_pair = Some(key_pair);
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Export identity and key pair for the profile store.
    pub fn export_profile(&self, display_name: impl Into<String>) -> P2PResult<UserProfile> {
        let (identity, key_pair) = self.local()?;
        Ok(UserProfile {
            id: identity.as_str().to_string(),
            display_name: display_name.into(),
            dh_key_jwk: key_pair.to_jwk().to_string(),
            created_at: Utc::now(),
        })
    }

    /// Close every session and forget the local identity. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        let sessions: Vec<(PeerId, PeerSession)> = self.sessions.drain().collect();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Closing all peer sessions");
        }
        for (peer, mut session) in sessions {
            let (channel, connection) = session.release();
            close_native(&peer, channel, connection).await;
        }

        self.key_pair = None;
        self.identity = None;
        while self.events_rx.try_recv().is_ok() {}
    }

    /// Tear down the session with one peer.
    pub async fn close_peer(&mut self, peer: &PeerId) -> P2PResult<()> {
        if self.teardown(peer).await {
            info!(peer = %peer, "Session closed");
            Ok(())
        } else {
            Err(P2PError::UnknownPeer(peer.to_string()))
        }
    }

    // ---- Signaling ----------------------------------------------------------

    /// Start a session as caller and return the offer to deliver out of band.
    pub async fn connect_to_peer(&mut self, peer: &PeerId) -> P2PResult<SessionDescription> {
        self.local()?;
        let carried = self.take_unattached_candidates(peer);
        self.teardown(peer).await;

        let (generation, connection) = match self.create_connection(peer).await {
            Ok(created) => created,
            Err(e) => {
                self.park_candidates(peer, carried);
                return Err(e);
            }
        };
        let negotiated = async {
            let channel = connection
                .create_data_channel(&self.config.channel_label)
                .await?;
            let offer = connection.create_offer().await?;
            let offer = connection.set_local_description(offer).await?;
            Ok::<_, P2PError>((channel, offer))
        }
        .await;

        let (channel, offer) = match negotiated {
            Ok(result) => result,
            Err(e) => {
                warn!(peer = %peer, "Failed to create offer: {}", e);
                close_native(peer, None, Some(connection)).await;
                self.park_candidates(peer, carried);
                return Err(e);
            }
        };

        let mut session = PeerSession::new(generation);
        session.apply(SessionInput::LocalOffer);
        session.connection = Some(connection);
        session.channel = Some(channel);
        session.pending_candidates = carried;
        self.sessions.insert(peer.clone(), session);

        info!(peer = %peer, "Offer created");
        Ok(offer)
    }

    /// Accept a remote offer as callee and return the answer to deliver out of band.
    pub async fn handle_peer_offer(
        &mut self,
        peer: &PeerId,
        offer: SessionDescription,
    ) -> P2PResult<SessionDescription> {
        self.local()?;
        offer.expect_type(SdpType::Offer)?;
        let carried = self.take_unattached_candidates(peer);
        self.teardown(peer).await;

        let (generation, connection) = match self.create_connection(peer).await {
            Ok(created) => created,
            Err(e) => {
                self.park_candidates(peer, carried);
                return Err(e);
            }
        };
        let negotiated = async {
            connection.set_remote_description(offer).await?;
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer).await
        }
        .await;

        let answer = match negotiated {
            Ok(answer) => answer,
            Err(e) => {
                warn!(peer = %peer, "Failed to answer offer: {}", e);
                close_native(peer, None, Some(connection)).await;
                self.park_candidates(peer, carried);
                return Err(e);
            }
        };

        let mut session = PeerSession::new(generation);
        session.apply(SessionInput::RemoteOffer);
        session.apply(SessionInput::LocalAnswer);
        session.connection = Some(connection);
        session.remote_description_applied = true;
        session.pending_candidates = carried;
        self.sessions.insert(peer.clone(), session);

        info!(peer = %peer, "Answer created");
        self.replay_candidates(peer).await;
        Ok(answer)
    }

    /// Apply the callee's answer to the offer created for `peer`.
    pub async fn handle_peer_answer(
        &mut self,
        peer: &PeerId,
        answer: SessionDescription,
    ) -> P2PResult<()> {
        self.local()?;
        answer.expect_type(SdpType::Answer)?;

        let session = self
            .sessions
            .get_mut(peer)
            .filter(|s| s.connection.is_some())
            .ok_or_else(|| P2PError::UnknownPeer(peer.to_string()))?;
        if session.state != SessionState::OfferCreated {
            return Err(P2PError::InvalidState {
                peer: peer.to_string(),
                state: session.state.to_string(),
            });
        }

        let applied = match session.connection.as_ref() {
            Some(connection) => connection.set_remote_description(answer).await,
            None => Err(P2PError::UnknownPeer(peer.to_string())),
        };
        if let Err(e) = applied {
            warn!(peer = %peer, "Failed to apply answer: {}", e);
            self.fail_session(peer, "answer rejected").await;
            return Err(e);
        }

        if let Some(session) = self.sessions.get_mut(peer) {
            session.apply(SessionInput::RemoteAnswer);
            session.remote_description_applied = true;
        }
        info!(peer = %peer, "Answer applied");
        self.replay_candidates(peer).await;
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the connection can take it.
    pub async fn add_ice_candidate(
        &mut self,
        peer: &PeerId,
        candidate: IceCandidate,
    ) -> P2PResult<()> {
        self.local()?;

        let replace = self
            .sessions
            .get(peer)
            .map_or(true, |s| s.state.is_disconnected());
        if replace {
            self.sessions.insert(peer.clone(), PeerSession::new(0));
        }

        let Some(session) = self.sessions.get_mut(peer) else {
            return Err(P2PError::UnknownPeer(peer.to_string()));
        };
        match session.connection.as_ref() {
            Some(connection) if session.remote_description_applied => {
                trace!(peer = %peer, "Applying remote candidate");
                connection.add_ice_candidate(candidate).await
            }
            _ => {
                session.pending_candidates.push(candidate);
                debug!(
                    peer = %peer,
                    buffered = session.pending_candidates.len(),
                    "Buffered remote candidate"
                );
                Ok(())
            }
        }
    }

    // ---- Messaging ----------------------------------------------------------

    /// Send a text message. `Ok(false)` means there is no open channel to `peer`.
    pub async fn send_text_message(&mut self, peer: &PeerId, text: &str) -> P2PResult<bool> {
        let (identity, _) = self.local()?;
        let envelope = Envelope::text(identity.as_str(), Content::plain(text));
        self.dispatch(peer, envelope).await
    }

    /// Send a file as an IMAGE or FILE envelope depending on its MIME type.
    pub async fn send_file(
        &mut self,
        peer: &PeerId,
        attachment: &FileAttachment,
    ) -> P2PResult<bool> {
        let (identity, _) = self.local()?;
        if attachment.size() > self.config.max_file_size {
            return Err(P2PError::FileTooLarge {
                size: attachment.size(),
                max: self.config.max_file_size,
            });
        }

        let payload = FilePayload {
            name: attachment.name.clone(),
            size: attachment.size(),
            mime_type: attachment.mime_type.clone(),
            data: Content::plain(attachment.encoded_data()),
        };
        let envelope = Envelope::file(identity.as_str(), payload);
        self.dispatch(peer, envelope).await
    }

    async fn dispatch(&mut self, peer: &PeerId, envelope: Envelope) -> P2PResult<bool> {
        let Some(session) = self.sessions.get_mut(peer) else {
            debug!(peer = %peer, "No session; message not sent");
            return Ok(false);
        };
        let Some(channel) = session.open_channel() else {
            debug!(peer = %peer, state = %session.state, "Channel not open; message not sent");
            return Ok(false);
        };

        // The peer can only open what we seal after it has our key.
        let key_sent = session.key_sent;
        let envelope = match session.shared_key.as_ref().filter(|_| key_sent) {
            Some(key) => seal_envelope(key, envelope)?,
            None => match self.config.pre_key_policy {
                PreKeyPolicy::Queue => {
                    session.outbox.push_back(envelope);
                    debug!(
                        peer = %peer,
                        queued = session.outbox.len(),
                        "Key exchange pending; message queued"
                    );
                    return Ok(true);
                }
                PreKeyPolicy::Plaintext => {
                    warn!(peer = %peer, "Key exchange pending; sending message unencrypted");
                    envelope
                }
            },
        };

        match transmit(&channel, &envelope).await {
            Ok(()) => Ok(true),
            Err(P2PError::ChannelNotOpen(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ---- Observers ----------------------------------------------------------

    pub fn identity(&self) -> Option<&LocalIdentity> {
        self.identity.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.identity.is_some()
    }

    /// Our DH public key as sent in KEY_EXCHANGE envelopes.
    pub fn local_public_key(&self) -> Option<String> {
        self.key_pair.as_ref().map(DhKeyPair::public_key_base64)
    }

    /// Whether an open data channel to `peer` exists.
    pub fn is_connected_to(&self, peer: &PeerId) -> bool {
        self.sessions
            .get(peer)
            .is_some_and(|s| s.open_channel().is_some())
    }

    pub fn get_connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.open_channel().is_some())
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn session_state(&self, peer: &PeerId) -> Option<SessionState> {
        self.sessions.get(peer).map(|s| s.state)
    }

    pub fn has_shared_secret(&self, peer: &PeerId) -> bool {
        self.sessions
            .get(peer)
            .is_some_and(|s| s.shared_key.is_some())
    }

    /// Fingerprint of the key shared with `peer`, for display only.
    pub fn key_fingerprint(&self, peer: &PeerId) -> Option<String> {
        self.sessions
            .get(peer)
            .and_then(|s| s.shared_key.as_ref())
            .map(SharedKey::fingerprint)
    }

    /// DH public key `peer` sent during key exchange.
    pub fn peer_public_key(&self, peer: &PeerId) -> Option<&str> {
        self.sessions
            .get(peer)
            .and_then(|s| s.remote_public_key.as_deref())
    }

    /// ICE servers the peer's connection was configured with.
    pub fn ice_server_count(&self, peer: &PeerId) -> Option<usize> {
        self.sessions
            .get(peer)
            .and_then(|s| s.connection.as_ref())
            .map(|c| c.ice_server_count())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    // ---- Event loop ---------------------------------------------------------

    /// Wait for the next transport event.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// Take the next transport event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Handle every event already queued. Returns how many were handled.
    pub async fn process_pending_events(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.try_next_event() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Advance the state machine by one transport event.
    pub async fn handle_event(&mut self, event: TransportEvent) {
        let TransportEvent {
            peer,
            generation,
            kind,
        } = event;

        match self.sessions.get(&peer) {
            Some(s) if s.generation == generation && !s.state.is_disconnected() => {}
            _ => {
                trace!(peer = %peer, generation, ?kind, "Dropping event for stale session");
                return;
            }
        }

        match kind {
            TransportEventKind::ConnectionState(ConnectionState::Connected) => {
                self.mark_connected(&peer);
            }
            TransportEventKind::ConnectionState(state) if state.is_terminal() => {
                self.fail_session(&peer, "connection lost").await;
            }
            TransportEventKind::ConnectionState(state) => {
                debug!(peer = %peer, ?state, "Connection state changed");
            }
            TransportEventKind::SignalingState(SignalingState::Stable) => {
                self.mark_connected(&peer);
            }
            TransportEventKind::SignalingState(state) => {
                trace!(peer = %peer, ?state, "Signaling state changed");
            }
            TransportEventKind::LocalCandidate(candidate) => {
                self.callbacks.on_ice_candidate(&peer, candidate);
            }
            TransportEventKind::DataChannel(channel) => {
                if let Some(session) = self.sessions.get_mut(&peer) {
                    if session.channel.is_some() {
                        debug!(peer = %peer, label = %channel.label(), "Ignoring extra data channel");
                    } else {
                        debug!(peer = %peer, label = %channel.label(), "Remote data channel attached");
                        session.channel = Some(channel);
                    }
                }
            }
            TransportEventKind::ChannelOpen => self.on_channel_open(&peer).await,
            TransportEventKind::ChannelClosed => {
                self.fail_session(&peer, "data channel closed").await;
            }
            TransportEventKind::ChannelMessage(frame) => self.on_channel_message(&peer, frame).await,
            TransportEventKind::ChannelError(e) => {
                warn!(peer = %peer, "Data channel error: {}", e);
                self.callbacks.on_error(P2PError::Transport(e));
            }
        }
    }

    // ---- Internals ----------------------------------------------------------

    fn local(&self) -> P2PResult<(&LocalIdentity, &DhKeyPair)> {
        match (self.identity.as_ref(), self.key_pair.as_ref()) {
            (Some(identity), Some(key_pair)) => Ok((identity, key_pair)),
            _ => Err(P2PError::NotInitialized),
        }
    }

    async fn create_connection(
        &mut self,
        peer: &PeerId,
    ) -> P2PResult<(u64, Box<dyn PeerConnection>)> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let sink = EventSink::new(self.events_tx.clone(), peer.clone(), generation);
        let connection = self.transport.create_connection(sink).await?;
        debug!(
            peer = %peer,
            generation,
            ice_servers = connection.ice_server_count(),
            "Peer connection created"
        );
        Ok((generation, connection))
    }

    /// Candidates buffered for `peer` before any connection existed.
    fn take_unattached_candidates(&mut self, peer: &PeerId) -> Vec<IceCandidate> {
        match self.sessions.get_mut(peer) {
            Some(session) if session.connection.is_none() => {
                std::mem::take(&mut session.pending_candidates)
            }
            _ => Vec::new(),
        }
    }

    /// Keep candidates from a failed attempt for the next one.
    fn park_candidates(&mut self, peer: &PeerId, candidates: Vec<IceCandidate>) {
        if candidates.is_empty() {
            return;
        }
        debug!(peer = %peer, count = candidates.len(), "Keeping buffered candidates for the next attempt");
        let mut session = PeerSession::new(0);
        session.pending_candidates = candidates;
        self.sessions.insert(peer.clone(), session);
    }

    /// Remove the session and close its native objects. Returns whether one existed.
    async fn teardown(&mut self, peer: &PeerId) -> bool {
        match self.sessions.remove(peer) {
            Some(mut session) => {
                let (channel, connection) = session.release();
                if channel.is_some() || connection.is_some() {
                    debug!(peer = %peer, generation = session.generation, "Replacing previous session");
                }
                close_native(peer, channel, connection).await;
                true
            }
            None => false,
        }
    }

    /// Move the session to `Disconnected`, release it and report it once.
    async fn fail_session(&mut self, peer: &PeerId, reason: &str) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.state.is_disconnected() {
            return;
        }
        session.apply(SessionInput::Failed);
        let dropped = session.outbox.len();
        let (channel, connection) = session.release();

        if dropped > 0 {
            warn!(peer = %peer, dropped, "Dropping queued messages of disconnected session");
        }
        info!(peer = %peer, reason, "Session disconnected");
        close_native(peer, channel, connection).await;
        self.callbacks.on_disconnection(peer);
    }

    fn mark_connected(&mut self, peer: &PeerId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        session.connected = true;
        session.apply(SessionInput::Connected);
        if !session.announced {
            session.announced = true;
            info!(peer = %peer, "Peer connected");
            self.callbacks.on_connection(peer);
        }
    }

    /// Replay buffered candidates in arrival order.
    async fn replay_candidates(&mut self, peer: &PeerId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        let Some(connection) = session.connection.as_ref() else {
            return;
        };
        let candidates = std::mem::take(&mut session.pending_candidates);
        if candidates.is_empty() {
            return;
        }

        debug!(peer = %peer, count = candidates.len(), "Replaying buffered candidates");
        for candidate in candidates {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(peer = %peer, "Buffered candidate rejected: {}", e);
                self.callbacks.on_error(e);
            }
        }
    }

    async fn on_channel_open(&mut self, peer: &PeerId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        session.apply(SessionInput::ChannelOpened);
        self.send_key_exchange(peer).await;
        self.flush_outbox(peer).await;
    }

    /// Send our public key once per session. Nothing sealed goes out before it.
    async fn send_key_exchange(&mut self, peer: &PeerId) {
        let Ok((identity, key_pair)) = self.local() else {
            return;
        };
        let envelope = Envelope::key_exchange(identity.as_str(), key_pair.public_key_base64());

        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.key_sent {
            return;
        }
        let Some(channel) = session.channel.clone() else {
            warn!(peer = %peer, "No data channel to send key exchange on");
            return;
        };
        session.key_sent = true;

        debug!(peer = %peer, "Sending key exchange");
        if let Err(e) = transmit(&channel, &envelope).await {
            warn!(peer = %peer, "Failed to send key exchange: {}", e);
            self.callbacks.on_error(e);
        }
    }

    async fn on_channel_message(&mut self, peer: &PeerId, frame: String) {
        let envelope = match Envelope::from_json(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %peer, "Dropping malformed envelope: {}", e);
                self.callbacks.on_error(e);
                return;
            }
        };

        match self.sessions.get_mut(peer) {
            // A frame can only arrive over an open channel.
            Some(session) if session.state == SessionState::AnswerExchanged => {
                session.apply(SessionInput::ChannelOpened);
            }
            Some(_) => {}
            None => return,
        }

        if let Body::KeyExchange(payload) = &envelope.body {
            self.on_key_exchange(peer, &payload.public_key).await;
            return;
        }

        let key = self.sessions.get(peer).and_then(|s| s.shared_key.as_ref());
        match open_envelope(key, envelope) {
            Ok(envelope) => {
                trace!(peer = %peer, id = %envelope.id, kind = ?envelope.message_type(), "Envelope received");
                self.callbacks.on_message(peer, envelope);
            }
            Err(e) => {
                warn!(peer = %peer, "Dropping message that failed to decrypt");
                self.callbacks.on_error(e);
            }
        }
    }

    async fn on_key_exchange(&mut self, peer: &PeerId, public_key: &str) {
        let Some(key_pair) = self.key_pair.as_ref() else {
            return;
        };
        let derived = import_public_key(public_key)
            .and_then(|remote| derive_shared_secret(key_pair, &remote));
        let shared_key = match derived {
            Ok(key) => key,
            Err(e) => {
                warn!(peer = %peer, "Rejected peer public key: {}", e);
                self.callbacks.on_error(e);
                return;
            }
        };

        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        // No identity verification happens here; the fingerprint is informational.
        debug!(peer = %peer, fingerprint = %shared_key.fingerprint(), "Shared key derived");
        let connected = session.connected;
        session.shared_key = Some(shared_key);
        session.remote_public_key = Some(public_key.to_string());
        session.apply(SessionInput::KeyDerived { connected });

        // The peer's key can arrive before our own open event is handled.
        self.send_key_exchange(peer).await;
        self.flush_outbox(peer).await;
    }

    /// Seal and send everything queued before the key arrived.
    async fn flush_outbox(&mut self, peer: &PeerId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.outbox.is_empty() || !session.key_sent {
            return;
        }
        let (Some(key), Some(channel)) = (session.shared_key.as_ref(), session.channel.clone())
        else {
            return;
        };

        let queued: Vec<Envelope> = session.outbox.drain(..).collect();
        let mut sealed = Vec::with_capacity(queued.len());
        let mut errors = Vec::new();
        for envelope in queued {
            match seal_envelope(key, envelope) {
                Ok(envelope) => sealed.push(envelope),
                Err(e) => errors.push(e),
            }
        }

        debug!(peer = %peer, count = sealed.len(), "Flushing queued messages");
        for envelope in &sealed {
            if let Err(e) = transmit(&channel, envelope).await {
                errors.push(e);
            }
        }
        for e in errors {
            warn!(peer = %peer, "Queued message not delivered: {}", e);
            self.callbacks.on_error(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LoopbackNetwork;
    use crate::session::callbacks::{ChannelCallbacks, SessionEvent};

    fn manager(network: &LoopbackNetwork, name: &str) -> PeerSessionManager<ChannelCallbacks> {
        let (callbacks, _rx) = ChannelCallbacks::new();
        PeerSessionManager::new(network.transport(name), SessionConfig::default(), callbacks)
            .unwrap()
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 9 typ host", n, n))
    }

    #[tokio::test]
    async fn test_operations_need_initialization() {
        let network = LoopbackNetwork::new();
        let mut alice = manager(&network, "alice");
        let bob = PeerId::from("bob");

        assert!(matches!(
            alice.connect_to_peer(&bob).await,
            Err(P2PError::NotInitialized)
        ));
        assert!(matches!(
            alice.add_ice_candidate(&bob, candidate(1)).await,
            Err(P2PError::NotInitialized)
        ));
        assert!(matches!(
            alice.send_text_message(&bob, "hi").await,
            Err(P2PError::NotInitialized)
        ));
        assert!(alice.export_profile("alice").is_err());

        alice.initialize().await.unwrap();
        assert!(matches!(
            alice.initialize().await,
            Err(P2PError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_profile_restores_identity_and_key() {
        let network = LoopbackNetwork::new();
        let mut first = manager(&network, "alice");
        let identity = first.initialize().await.unwrap();
        let profile = first.export_profile("Alice").unwrap();

        let mut second = manager(&network, "alice");
        let restored = second.initialize_from_profile(&profile).await.unwrap();

        assert_eq!(restored, identity);
        assert_eq!(second.local_public_key(), first.local_public_key());
        assert_eq!(profile.display_name, "Alice");
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_connection_exists() {
        let network = LoopbackNetwork::new();
        let mut alice = manager(&network, "alice");
        alice.initialize().await.unwrap();
        let bob = PeerId::from("bob");

        alice.add_ice_candidate(&bob, candidate(1)).await.unwrap();
        alice.add_ice_candidate(&bob, candidate(2)).await.unwrap();
        assert_eq!(alice.session_state(&bob), Some(SessionState::Idle));

        alice.connect_to_peer(&bob).await.unwrap();
        assert_eq!(alice.session_state(&bob), Some(SessionState::OfferCreated));
        assert_eq!(alice.ice_server_count(&bob), Some(0));
        assert!(network.applied_candidates("alice").is_empty());
    }

    #[tokio::test]
    async fn test_failed_offer_keeps_buffered_candidates() {
        let network = LoopbackNetwork::new();
        let mut bob = manager(&network, "bob");
        bob.initialize().await.unwrap();
        let alice = PeerId::from("alice");

        bob.add_ice_candidate(&alice, candidate(1)).await.unwrap();
        bob.add_ice_candidate(&alice, candidate(2)).await.unwrap();

        let result = bob
            .handle_peer_offer(&alice, SessionDescription::offer("v=0"))
            .await;
        assert!(matches!(result, Err(P2PError::MalformedSignal(_))));

        assert_eq!(bob.session_state(&alice), Some(SessionState::Idle));
        let kept: Vec<String> = bob.sessions[&alice]
            .pending_candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect();
        assert_eq!(kept, vec![candidate(1).candidate, candidate(2).candidate]);
    }

    #[tokio::test]
    async fn test_answer_needs_an_offer() {
        let network = LoopbackNetwork::new();
        let mut alice = manager(&network, "alice");
        alice.initialize().await.unwrap();
        let bob = PeerId::from("bob");

        assert!(matches!(
            alice
                .handle_peer_answer(&bob, SessionDescription::answer("v=0"))
                .await,
            Err(P2PError::UnknownPeer(_))
        ));

        alice.add_ice_candidate(&bob, candidate(1)).await.unwrap();
        assert!(matches!(
            alice
                .handle_peer_answer(&bob, SessionDescription::answer("v=0"))
                .await,
            Err(P2PError::UnknownPeer(_))
        ));

        assert!(matches!(
            alice
                .handle_peer_answer(&bob, SessionDescription::offer("v=0"))
                .await,
            Err(P2PError::MalformedSignal(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_must_be_an_offer() {
        let network = LoopbackNetwork::new();
        let mut bob = manager(&network, "bob");
        bob.initialize().await.unwrap();

        let result = bob
            .handle_peer_offer(&PeerId::from("alice"), SessionDescription::answer("v=0"))
            .await;
        assert!(matches!(result, Err(P2PError::MalformedSignal(_))));
        assert_eq!(bob.session_state(&PeerId::from("alice")), None);
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let network = LoopbackNetwork::new();
        let (callbacks, mut rx) = ChannelCallbacks::new();
        let mut alice =
            PeerSessionManager::new(network.transport("alice"), SessionConfig::default(), callbacks)
                .unwrap();
        alice.initialize().await.unwrap();
        let bob = PeerId::from("bob");

        alice.connect_to_peer(&bob).await.unwrap();
        alice.connect_to_peer(&bob).await.unwrap();
        alice.process_pending_events().await;
        while rx.try_recv().is_ok() {}

        alice
            .handle_event(TransportEvent {
                peer: bob.clone(),
                generation: 1,
                kind: TransportEventKind::ConnectionState(ConnectionState::Failed),
            })
            .await;

        assert_eq!(alice.session_state(&bob), Some(SessionState::OfferCreated));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_candidates_reach_callbacks() {
        let network = LoopbackNetwork::new();
        let (callbacks, mut rx) = ChannelCallbacks::new();
        let mut alice =
            PeerSessionManager::new(network.transport("alice"), SessionConfig::default(), callbacks)
                .unwrap();
        alice.initialize().await.unwrap();

        alice.connect_to_peer(&PeerId::from("bob")).await.unwrap();
        alice.process_pending_events().await;

        let mut saw_candidate = false;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::IceCandidate { peer, candidate } = event {
                assert_eq!(peer, PeerId::from("bob"));
                assert!(candidate.candidate.contains("typ host"));
                saw_candidate = true;
            }
        }
        assert!(saw_candidate);
    }

    #[tokio::test]
    async fn test_sealing_covers_file_payloads() {
        let a = DhKeyPair::generate().unwrap();
        let b = DhKeyPair::generate().unwrap();
        let key = derive_shared_secret(&a, b.public_key()).unwrap();

        let attachment = FileAttachment::new("notes.txt", "text/plain", b"secret notes".to_vec());
        let envelope = Envelope::file(
            "alice",
            FilePayload {
                name: attachment.name.clone(),
                size: attachment.size(),
                mime_type: attachment.mime_type.clone(),
                data: Content::plain(attachment.encoded_data()),
            },
        );

        let sealed = seal_envelope(&key, envelope.clone()).unwrap();
        assert!(!sealed.to_json().unwrap().contains(&attachment.encoded_data()));

        let opened = open_envelope(Some(&key), sealed.clone()).unwrap();
        assert_eq!(opened, envelope);
        assert!(matches!(
            open_envelope(None, sealed),
            Err(P2PError::DecryptionFailed)
        ));
    }
}
