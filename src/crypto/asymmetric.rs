//! RSA-OAEP + AES-256-GCM hybrid envelopes.
//!
//! This is the point-to-point path used when no DH session exists. RSA-OAEP
//! cannot carry arbitrary-length plaintext, so every message gets its own
//! one-time AES key and only that key is RSA-encrypted.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use rsa::{
    traits::{PrivateKeyParts, PublicKeyParts},
    BigUint, Oaep, RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::key_exchange::{fill_random, IV_LEN};
use crate::error::{P2PError, P2PResult};

/// Modulus size used by [`RsaKeyPair::generate`].
pub const RSA_KEY_BITS: usize = 4096;

/// Fixed public exponent (F4).
const PUBLIC_EXPONENT: u32 = 65537;

const JWK_ALG: &str = "RSA-OAEP-256";

pub struct RsaKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl RsaKeyPair {
    /// Generate an RSA-OAEP-4096 key pair.
    pub fn generate() -> P2PResult<Self> {
        Self::generate_with_bits(RSA_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> P2PResult<Self> {
        let mut rng = OsRng;
        let exponent = BigUint::from(PUBLIC_EXPONENT);
        let private_key = RsaPrivateKey::new_with_exp(&mut rng, bits, &exponent)
            .map_err(|e| P2PError::CryptoUnavailable(format!("RSA key generation failed: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }
}

/// JSON Web Key representation of an RSA key (RFC 7517/7518).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RsaJwk {
    kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alg: Option<String>,
    n: String,
    e: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    qi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ext: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_ops: Option<Vec<String>>,
}

fn b64url(bytes: &[u8]) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn biguint_field(name: &str, value: &str) -> P2PResult<BigUint> {
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| P2PError::MalformedKey(format!("JWK field {}: {}", name, e)))?;
    if bytes.is_empty() {
        return Err(P2PError::MalformedKey(format!("JWK field {} is empty", name)));
    }
    Ok(BigUint::from_bytes_be(&bytes))
}

fn required<'a>(name: &str, value: &'a Option<String>) -> P2PResult<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| P2PError::MalformedKey(format!("JWK missing field {}", name)))
}

fn parse_jwk(jwk: &str) -> P2PResult<RsaJwk> {
    let parsed: RsaJwk =
        serde_json::from_str(jwk).map_err(|e| P2PError::MalformedKey(format!("JWK: {}", e)))?;
    if parsed.kty != "RSA" {
        return Err(P2PError::MalformedKey(format!(
            "expected kty RSA, got {}",
            parsed.kty
        )));
    }
    Ok(parsed)
}

pub fn export_public_key(key: &RsaPublicKey) -> P2PResult<String> {
    let jwk = RsaJwk {
        kty: "RSA".to_string(),
        alg: Some(JWK_ALG.to_string()),
        n: b64url(&key.n().to_bytes_be()),
        e: b64url(&key.e().to_bytes_be()),
        d: None,
        p: None,
        q: None,
        dp: None,
        dq: None,
        qi: None,
        ext: Some(true),
        key_ops: Some(vec!["encrypt".to_string()]),
    };
    Ok(serde_json::to_string(&jwk)?)
}

/// Export the private key with its CRT parameters. Returned string is zeroized on drop.
pub fn export_private_key(key: &RsaPrivateKey) -> P2PResult<Zeroizing<String>> {
    let primes = key.primes();
    if primes.len() != 2 {
        return Err(P2PError::MalformedKey(
            "only two-prime RSA keys can be exported".to_string(),
        ));
    }
    let dp = key
        .dp()
        .ok_or_else(|| P2PError::MalformedKey("missing CRT exponent dp".to_string()))?;
    let dq = key
        .dq()
        .ok_or_else(|| P2PError::MalformedKey("missing CRT exponent dq".to_string()))?;
    let (_, qi) = key
        .qinv()
        .ok_or_else(|| P2PError::MalformedKey("missing CRT coefficient".to_string()))?
        .to_bytes_be();

    let jwk = RsaJwk {
        kty: "RSA".to_string(),
        alg: Some(JWK_ALG.to_string()),
        n: b64url(&key.n().to_bytes_be()),
        e: b64url(&key.e().to_bytes_be()),
        d: Some(b64url(&key.d().to_bytes_be())),
        p: Some(b64url(&primes[0].to_bytes_be())),
        q: Some(b64url(&primes[1].to_bytes_be())),
        dp: Some(b64url(&dp.to_bytes_be())),
        dq: Some(b64url(&dq.to_bytes_be())),
        qi: Some(b64url(&qi)),
        ext: Some(true),
        key_ops: Some(vec!["decrypt".to_string()]),
    };
    Ok(Zeroizing::new(serde_json::to_string(&jwk)?))
}

pub fn import_public_key(jwk: &str) -> P2PResult<RsaPublicKey> {
    let jwk = parse_jwk(jwk)?;
    let n = biguint_field("n", &jwk.n)?;
    let e = biguint_field("e", &jwk.e)?;
    RsaPublicKey::new(n, e).map_err(|e| P2PError::MalformedKey(e.to_string()))
}

pub fn import_private_key(jwk: &str) -> P2PResult<RsaPrivateKey> {
    let jwk = parse_jwk(jwk)?;
    let n = biguint_field("n", &jwk.n)?;
    let e = biguint_field("e", &jwk.e)?;
    let d = biguint_field("d", required("d", &jwk.d)?)?;
    let p = biguint_field("p", required("p", &jwk.p)?)?;
    let q = biguint_field("q", required("q", &jwk.q)?)?;

    let mut key = RsaPrivateKey::from_components(n, e, d, vec![p, q])
        .map_err(|e| P2PError::MalformedKey(e.to_string()))?;
    key.validate()
        .map_err(|e| P2PError::MalformedKey(e.to_string()))?;
    key.precompute()
        .map_err(|e| P2PError::MalformedKey(e.to_string()))?;
    Ok(key)
}

/// A message sealed for one RSA recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridEnvelope {
    pub iv: String,
    pub ciphertext: String,
    pub encrypted_key: String,
}

pub fn encrypt_message(plaintext: &str, recipient: &RsaPublicKey) -> P2PResult<HybridEnvelope> {
    let mut message_key = Zeroizing::new([0u8; 32]);
    fill_random(&mut message_key[..])?;
    let mut iv = [0u8; IV_LEN];
    fill_random(&mut iv)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&message_key[..]));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|e| P2PError::EncryptionFailed(e.to_string()))?;

    let mut rng = OsRng;
    let encrypted_key = recipient
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &message_key[..])
        .map_err(|e| P2PError::EncryptionFailed(e.to_string()))?;

    Ok(HybridEnvelope {
        iv: general_purpose::STANDARD.encode(iv),
        ciphertext: general_purpose::STANDARD.encode(ciphertext),
        encrypted_key: general_purpose::STANDARD.encode(encrypted_key),
    })
}

/// Reverse [`encrypt_message`]. Every failing step reports the same `DecryptionFailed`.
pub fn decrypt_message(envelope: &HybridEnvelope, recipient: &RsaPrivateKey) -> P2PResult<String> {
    let decode = |field: &str| {
        general_purpose::STANDARD
            .decode(field)
            .map_err(|_| P2PError::DecryptionFailed)
    };
    let iv = decode(&envelope.iv)?;
    let ciphertext = decode(&envelope.ciphertext)?;
    let encrypted_key = decode(&envelope.encrypted_key)?;

    let message_key = Zeroizing::new(
        recipient
            .decrypt(Oaep::new::<Sha256>(), &encrypted_key)
            .map_err(|_| P2PError::DecryptionFailed)?,
    );
    if message_key.len() != 32 || iv.len() != IV_LEN {
        return Err(P2PError::DecryptionFailed);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&message_key[..]));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| P2PError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| P2PError::DecryptionFailed)
}
