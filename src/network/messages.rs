use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedData;
use crate::error::{P2PError, P2PResult};

/// Fallback MIME type when content sniffing finds nothing.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Types of envelopes that travel over a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    Image,
    File,
    KeyExchange,
}

/// Message body, explicitly tagged as plaintext or AES-GCM sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "lowercase")]
pub enum Content {
    Plain { data: String },
    Encrypted(EncryptedData),
}

impl Content {
    pub fn plain(data: impl Into<String>) -> Self {
        Content::Plain { data: data.into() }
    }

    /// The plaintext, if this content is not sealed.
    pub fn as_plain(&self) -> Option<&str> {
        match self {
            Content::Plain { data } => Some(data),
            Content::Encrypted(_) => None,
        }
    }
}

/// Metadata plus body of an IMAGE or FILE envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Plaintext of this content is the base64 of the file bytes.
    pub data: Content,
}

impl FilePayload {
    /// Decode the file bytes of an already-decrypted payload.
    pub fn decode_data(&self) -> P2PResult<Vec<u8>> {
        let encoded = self.data.as_plain().ok_or_else(|| {
            P2PError::MalformedEnvelope("file payload is still encrypted".to_string())
        })?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| P2PError::MalformedEnvelope(format!("file data: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangePayload {
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Typed body of an envelope; the variant fixes the wire `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(Content),
    Image(FilePayload),
    File(FilePayload),
    KeyExchange(KeyExchangePayload),
}

/// Envelope wrapping every message placed on a data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub id: String,
    pub sender: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub body: Body,
}

/// Wire shape: `{id, type, sender, timestamp, payload}`.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    id: String,
    #[serde(rename = "type")]
    msg_type: MessageType,
    sender: String,
    timestamp: i64,
    payload: serde_json::Value,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = serde_json::Error;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let body = match wire.msg_type {
            MessageType::Text => Body::Text(serde_json::from_value(wire.payload)?),
            MessageType::Image => Body::Image(serde_json::from_value(wire.payload)?),
            MessageType::File => Body::File(serde_json::from_value(wire.payload)?),
            MessageType::KeyExchange => Body::KeyExchange(serde_json::from_value(wire.payload)?),
        };
        Ok(Self {
            id: wire.id,
            sender: wire.sender,
            timestamp: wire.timestamp,
            body,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let msg_type = envelope.message_type();
        // Serializing these plain data types into a Value cannot fail.
        let payload = match envelope.body {
            Body::Text(content) => serde_json::to_value(content),
            Body::Image(file) | Body::File(file) => serde_json::to_value(file),
            Body::KeyExchange(key) => serde_json::to_value(key),
        }
        .unwrap_or(serde_json::Value::Null);

        Self {
            id: envelope.id,
            msg_type,
            sender: envelope.sender,
            timestamp: envelope.timestamp,
            payload,
        }
    }
}

impl Envelope {
    /// Create a new envelope stamped with a fresh id and the current time
    pub fn new(sender: impl Into<String>, body: Body) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }

    /// Create a text envelope
    pub fn text(sender: impl Into<String>, content: Content) -> Self {
        Self::new(sender, Body::Text(content))
    }

    /// Create a file envelope; `image/*` MIME types travel as IMAGE
    pub fn file(sender: impl Into<String>, payload: FilePayload) -> Self {
        let body = if payload.mime_type.starts_with("image/") {
            Body::Image(payload)
        } else {
            Body::File(payload)
        };
        Self::new(sender, body)
    }

    /// Create a key exchange envelope carrying our raw DH public key
    pub fn key_exchange(sender: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self::new(
            sender,
            Body::KeyExchange(KeyExchangePayload {
                public_key: public_key.into(),
            }),
        )
    }

    pub fn message_type(&self) -> MessageType {
        match self.body {
            Body::Text(_) => MessageType::Text,
            Body::Image(_) => MessageType::Image,
            Body::File(_) => MessageType::File,
            Body::KeyExchange(_) => MessageType::KeyExchange,
        }
    }

    /// Text of a TEXT envelope whose content is plaintext.
    pub fn text_content(&self) -> Option<&str> {
        match &self.body {
            Body::Text(content) => content.as_plain(),
            _ => None,
        }
    }

    /// Serialize the envelope to a JSON text frame
    pub fn to_json(&self) -> P2PResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize an envelope from a JSON text frame
    pub fn from_json(json: &str) -> P2PResult<Self> {
        serde_json::from_str(json).map_err(|e| P2PError::MalformedEnvelope(e.to_string()))
    }
}

/// A file the UI wants to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl FileAttachment {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, sniffing its MIME type from the content.
    pub async fn from_path(path: impl AsRef<Path>) -> P2PResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let mime_type = infer::get(&bytes)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "attachment".to_string());

        Ok(Self {
            name,
            mime_type,
            bytes,
        })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// Base64 of the file bytes; the plaintext that gets sealed for the wire.
    pub fn encoded_data(&self) -> String {
        general_purpose::STANDARD.encode(&self.bytes)
    }
}
