//! Out-of-band signaling payloads.
//!
//! These are produced and consumed by the session manager but carried by the
//! user (copy/paste, QR code, ...). The JSON shapes match what browsers emit
//! for `RTCSessionDescriptionInit` and `RTCIceCandidateInit`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{P2PError, P2PResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Fail with `MalformedSignal` unless this description has the given type.
    pub fn expect_type(&self, expected: SdpType) -> P2PResult<()> {
        if self.sdp_type == expected {
            Ok(())
        } else {
            Err(P2PError::MalformedSignal(format!(
                "expected an {}, got an {}",
                expected, self.sdp_type
            )))
        }
    }

    pub fn to_json(&self) -> P2PResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> P2PResult<Self> {
        let desc: Self = serde_json::from_str(json.trim())
            .map_err(|e| P2PError::MalformedSignal(e.to_string()))?;
        if desc.sdp.trim().is_empty() {
            return Err(P2PError::MalformedSignal("empty SDP".to_string()));
        }
        Ok(desc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    pub fn to_json(&self) -> P2PResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> P2PResult<Self> {
        serde_json::from_str(json.trim()).map_err(|e| P2PError::MalformedSignal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_matches_browser_shape() {
        let offer = SessionDescription::offer("v=0\r\n");
        assert_eq!(offer.to_json().unwrap(), r#"{"type":"offer","sdp":"v=0\r\n"}"#);

        let parsed = SessionDescription::from_json(r#" {"type":"answer","sdp":"v=0"} "#).unwrap();
        assert_eq!(parsed, SessionDescription::answer("v=0"));
    }

    #[test]
    fn test_expect_type() {
        let answer = SessionDescription::answer("v=0");
        assert!(answer.expect_type(SdpType::Answer).is_ok());
        assert!(matches!(
            answer.expect_type(SdpType::Offer),
            Err(P2PError::MalformedSignal(_))
        ));
    }

    #[test]
    fn test_rejects_bad_descriptions() {
        for json in ["", "{}", r#"{"type":"pranswer","sdp":"v=0"}"#, r#"{"type":"offer","sdp":"  "}"#] {
            assert!(matches!(
                SessionDescription::from_json(json),
                Err(P2PError::MalformedSignal(_))
            ));
        }
    }

    #[test]
    fn test_candidate_field_names() {
        let candidate = IceCandidate::new("candidate:1 1 udp 2130706431 192.168.1.4 50000 typ host");
        let value: serde_json::Value = serde_json::from_str(&candidate.to_json().unwrap()).unwrap();

        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value["usernameFragment"].is_null());

        let browser = r#"{"candidate":"candidate:2 1 udp 1 10.0.0.2 9 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let parsed = IceCandidate::from_json(browser).unwrap();
        assert_eq!(parsed.sdp_mline_index, Some(0));
        assert_eq!(parsed.username_fragment, None);
    }
}
