use std::fmt;

/// Protocol state of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    /// Caller: offer created and applied locally
    OfferCreated,
    /// Callee: remote offer applied
    OfferReceived,
    AnswerExchanged,
    ChannelOpen,
    /// Shared key derived, connection not yet reported up
    KeyExchanged,
    Active,
    Disconnected,
}

/// Inputs that drive [`SessionState::next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    LocalOffer,
    RemoteOffer,
    LocalAnswer,
    RemoteAnswer,
    ChannelOpened,
    /// Peer key received and shared secret derived. `connected` tells
    /// whether the transport has already reported a connection.
    KeyDerived { connected: bool },
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    /// Transition table. `None` means the input is not valid in this state
    /// and the state stays as it is.
    pub fn next(self, input: SessionInput) -> Option<SessionState> {
        use SessionInput::*;
        use SessionState::*;

        match (self, input) {
            (Disconnected, _) => None,
            (_, Failed) | (_, Closed) => Some(Disconnected),

            (Idle, LocalOffer) => Some(OfferCreated),
            (Idle, RemoteOffer) => Some(OfferReceived),
            (OfferCreated, RemoteAnswer) => Some(AnswerExchanged),
            (OfferReceived, LocalAnswer) => Some(AnswerExchanged),

            (AnswerExchanged, ChannelOpened) => Some(ChannelOpen),

            (ChannelOpen, KeyDerived { connected }) | (KeyExchanged, KeyDerived { connected }) => {
                Some(if connected { Active } else { KeyExchanged })
            }
            // A peer may resend its key; the session stays usable.
            (Active, KeyDerived { .. }) => Some(Active),

            (KeyExchanged, Connected) => Some(Active),

            _ => None,
        }
    }

    pub fn is_disconnected(self) -> bool {
        self == SessionState::Disconnected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::OfferCreated => "offer-created",
            SessionState::OfferReceived => "offer-received",
            SessionState::AnswerExchanged => "answer-exchanged",
            SessionState::ChannelOpen => "channel-open",
            SessionState::KeyExchanged => "key-exchanged",
            SessionState::Active => "active",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
