//! P-256 Diffie-Hellman key exchange and the AES-256-GCM session cipher.
//!
//! Each device holds one long-lived [`DhKeyPair`]. The public half travels to
//! the peer inside a `KEY_EXCHANGE` envelope as the base64 of the uncompressed
//! SEC1 point. Both sides run ECDH and stretch the result with HKDF-SHA256 into
//! the same 256-bit AES-GCM key.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{ecdh, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{P2PError, P2PResult};

/// HKDF info label binding derived keys to this protocol.
const HKDF_INFO: &[u8] = b"p2p-rtc/ecdh-p256/aes-256-gcm";

/// AES-GCM IV length in bytes (96 bits).
pub const IV_LEN: usize = 12;

/// Length of an uncompressed SEC1 P-256 point.
const RAW_PUBLIC_KEY_LEN: usize = 65;

/// Fill `buf` from the OS generator, reporting failure instead of panicking.
pub(crate) fn fill_random(buf: &mut [u8]) -> P2PResult<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| P2PError::CryptoUnavailable(e.to_string()))
}

/// Long-lived ECDH key pair on curve P-256. Only usable for key derivation.
#[derive(Clone)]
pub struct DhKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl DhKeyPair {
    /// Generate a fresh key pair from OS randomness.
    pub fn generate() -> P2PResult<Self> {
        loop {
            let mut seed = Zeroizing::new([0u8; 32]);
            fill_random(&mut seed[..])?;
            // Out-of-range scalars are astronomically rare; draw again.
            if let Ok(secret) = SecretKey::from_slice(&seed[..]) {
                let public = secret.public_key();
                return Ok(Self { secret, public });
            }
        }
    }

    /// Restore a key pair previously exported with [`DhKeyPair::to_jwk`].
    pub fn from_jwk(jwk: &str) -> P2PResult<Self> {
        let secret = SecretKey::from_jwk_str(jwk)?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    /// Export the private key as a JSON Web Key for the local profile store.
    pub fn to_jwk(&self) -> Zeroizing<String> {
        self.secret.to_jwk_string()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Base64 of this key pair's raw public point.
    pub fn public_key_base64(&self) -> String {
        export_public_key(&self.public)
    }
}

impl fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

/// Serialize a public key to base64 of its uncompressed point. Deterministic.
pub fn export_public_key(key: &PublicKey) -> String {
    general_purpose::STANDARD.encode(key.to_encoded_point(false).as_bytes())
}

/// Inverse of [`export_public_key`].
pub fn import_public_key(encoded: &str) -> P2PResult<PublicKey> {
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| P2PError::MalformedKey(format!("Base64 decode error: {}", e)))?;

    if bytes.len() != RAW_PUBLIC_KEY_LEN {
        return Err(P2PError::MalformedKey(format!(
            "expected {} byte uncompressed point, got {}",
            RAW_PUBLIC_KEY_LEN,
            bytes.len()
        )));
    }

    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|_| P2PError::MalformedKey("point is not on curve P-256".to_string()))
}

/// Symmetric AES-256-GCM key shared with exactly one peer.
#[derive(Clone)]
pub struct SharedKey {
    key: Zeroizing<[u8; 32]>,
}

impl SharedKey {
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Short digest of the key formatted as XXXX-XXXX-XXXX-XXXX.
    ///
    /// Equal on both ends of a session; never compared by the core itself.
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(&self.key[..]);
        let hex = hex::encode(&hash[..8]).to_uppercase();
        format!(
            "{}-{}-{}-{}",
            &hex[0..4],
            &hex[4..8],
            &hex[8..12],
            &hex[12..16]
        )
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key[..]))
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Ciphertext and IV, both base64, as carried inside envelope payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub ciphertext: String,
    pub iv: String,
}

/// Run ECDH between our private key and the peer's public key and derive the session key.
pub fn derive_shared_secret(local: &DhKeyPair, remote: &PublicKey) -> P2PResult<SharedKey> {
    let shared = ecdh::diffie_hellman(local.secret.to_nonzero_scalar(), remote.as_affine());

    let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes());
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|e| P2PError::CryptoUnavailable(format!("HKDF expand failed: {}", e)))?;

    Ok(SharedKey::from_bytes(okm))
}

/// Encrypt with a fresh random 96-bit IV.
pub fn encrypt(key: &SharedKey, plaintext: &[u8]) -> P2PResult<EncryptedData> {
    let mut iv = [0u8; IV_LEN];
    fill_random(&mut iv)?;

    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| P2PError::EncryptionFailed(e.to_string()))?;

    Ok(EncryptedData {
        ciphertext: general_purpose::STANDARD.encode(ciphertext),
        iv: general_purpose::STANDARD.encode(iv),
    })
}

/// Decrypt and authenticate. Any failure collapses into `DecryptionFailed`.
pub fn decrypt(key: &SharedKey, data: &EncryptedData) -> P2PResult<Vec<u8>> {
    let iv = general_purpose::STANDARD
        .decode(&data.iv)
        .map_err(|_| P2PError::DecryptionFailed)?;
    if iv.len() != IV_LEN {
        return Err(P2PError::DecryptionFailed);
    }

    let ciphertext = general_purpose::STANDARD
        .decode(&data.ciphertext)
        .map_err(|_| P2PError::DecryptionFailed)?;

    key.cipher()
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| P2PError::DecryptionFailed)
}

/// Convenience wrapper for UTF-8 payloads.
pub fn encrypt_text(key: &SharedKey, plaintext: &str) -> P2PResult<EncryptedData> {
    encrypt(key, plaintext.as_bytes())
}

pub fn decrypt_text(key: &SharedKey, data: &EncryptedData) -> P2PResult<String> {
    let bytes = decrypt(key, data)?;
    String::from_utf8(bytes).map_err(|_| P2PError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn flip_bit(encoded: &str, byte: usize, bit: u8) -> String {
        let mut raw = general_purpose::STANDARD.decode(encoded).unwrap();
        raw[byte] ^= 1 << bit;
        general_purpose::STANDARD.encode(raw)
    }

    #[test]
    fn test_dh_symmetry() {
        let alice = DhKeyPair::generate().unwrap();
        let bob = DhKeyPair::generate().unwrap();

        let alice_key = derive_shared_secret(&alice, bob.public_key()).unwrap();
        let bob_key = derive_shared_secret(&bob, alice.public_key()).unwrap();

        let from_alice = encrypt_text(&alice_key, "hi bob").unwrap();
        let from_bob = encrypt_text(&bob_key, "hi alice").unwrap();

        assert_eq!(decrypt_text(&bob_key, &from_alice).unwrap(), "hi bob");
        assert_eq!(decrypt_text(&alice_key, &from_bob).unwrap(), "hi alice");
        assert_eq!(alice_key.fingerprint(), bob_key.fingerprint());
    }

    #[test]
    fn test_third_party_key_differs() {
        let alice = DhKeyPair::generate().unwrap();
        let bob = DhKeyPair::generate().unwrap();
        let mallory = DhKeyPair::generate().unwrap();

        let alice_bob = derive_shared_secret(&alice, bob.public_key()).unwrap();
        let mallory_bob = derive_shared_secret(&mallory, bob.public_key()).unwrap();

        let sealed = encrypt_text(&alice_bob, "private").unwrap();
        assert!(matches!(
            decrypt_text(&mallory_bob, &sealed),
            Err(P2PError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_symmetric_roundtrip() {
        let alice = DhKeyPair::generate().unwrap();
        let bob = DhKeyPair::generate().unwrap();
        let key = derive_shared_secret(&alice, bob.public_key()).unwrap();

        let long = "ünïcødé and a fairly long line of text. ".repeat(200);
        for message in ["", "hello", long.as_str()] {
            let sealed = encrypt_text(&key, message).unwrap();
            assert_eq!(decrypt_text(&key, &sealed).unwrap(), message);
        }
    }

    #[test]
    fn test_iv_uniqueness() {
        let pair = DhKeyPair::generate().unwrap();
        let other = DhKeyPair::generate().unwrap();
        let key = derive_shared_secret(&pair, other.public_key()).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..2000 {
            let sealed = encrypt_text(&key, "same plaintext").unwrap();
            assert!(seen.insert(sealed.iv), "IV reused");
        }
    }

    #[test]
    fn test_tamper_detection() {
        let pair = DhKeyPair::generate().unwrap();
        let other = DhKeyPair::generate().unwrap();
        let key = derive_shared_secret(&pair, other.public_key()).unwrap();
        let sealed = encrypt_text(&key, "attack at dawn").unwrap();

        let ct_len = general_purpose::STANDARD.decode(&sealed.ciphertext).unwrap().len();
        for byte in 0..ct_len {
            for bit in [0u8, 7] {
                let tampered = EncryptedData {
                    ciphertext: flip_bit(&sealed.ciphertext, byte, bit),
                    iv: sealed.iv.clone(),
                };
                assert!(matches!(decrypt(&key, &tampered), Err(P2PError::DecryptionFailed)));
            }
        }

        for byte in 0..IV_LEN {
            let tampered = EncryptedData {
                ciphertext: sealed.ciphertext.clone(),
                iv: flip_bit(&sealed.iv, byte, 3),
            };
            assert!(matches!(decrypt(&key, &tampered), Err(P2PError::DecryptionFailed)));
        }
    }

    #[test]
    fn test_garbage_ciphertext_is_decryption_failure() {
        let pair = DhKeyPair::generate().unwrap();
        let key = derive_shared_secret(&pair, pair.public_key()).unwrap();

        let bad = EncryptedData {
            ciphertext: "not base64!".to_string(),
            iv: "AAAAAAAAAAAAAAAA".to_string(),
        };
        assert!(matches!(decrypt(&key, &bad), Err(P2PError::DecryptionFailed)));

        let short_iv = EncryptedData {
            ciphertext: general_purpose::STANDARD.encode([0u8; 32]),
            iv: general_purpose::STANDARD.encode([0u8; 4]),
        };
        assert!(matches!(decrypt(&key, &short_iv), Err(P2PError::DecryptionFailed)));
    }

    #[test]
    fn test_public_key_export_import() {
        let pair = DhKeyPair::generate().unwrap();
        let exported = export_public_key(pair.public_key());

        assert_eq!(exported, export_public_key(pair.public_key()));
        assert_eq!(general_purpose::STANDARD.decode(&exported).unwrap().len(), 65);

        let imported = import_public_key(&exported).unwrap();
        assert_eq!(&imported, pair.public_key());
    }

    #[test]
    fn test_import_rejects_malformed_keys() {
        assert!(matches!(import_public_key("%%%"), Err(P2PError::MalformedKey(_))));

        let short = general_purpose::STANDARD.encode([4u8; 33]);
        assert!(matches!(import_public_key(&short), Err(P2PError::MalformedKey(_))));

        let mut off_curve = [0u8; 65];
        off_curve[0] = 0x04;
        off_curve[64] = 1;
        let off_curve = general_purpose::STANDARD.encode(off_curve);
        assert!(matches!(import_public_key(&off_curve), Err(P2PError::MalformedKey(_))));
    }

    #[test]
    fn test_jwk_restore_keeps_derivation() {
        let alice = DhKeyPair::generate().unwrap();
        let bob = DhKeyPair::generate().unwrap();

        let restored = DhKeyPair::from_jwk(&alice.to_jwk()).unwrap();
        assert_eq!(restored.public_key_base64(), alice.public_key_base64());

        let before = derive_shared_secret(&alice, bob.public_key()).unwrap();
        let after = derive_shared_secret(&restored, bob.public_key()).unwrap();
        assert_eq!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn test_fingerprint_format() {
        let pair = DhKeyPair::generate().unwrap();
        let key = derive_shared_secret(&pair, pair.public_key()).unwrap();
        let fingerprint = key.fingerprint();

        assert_eq!(fingerprint.len(), 19);
        assert_eq!(fingerprint.chars().filter(|c| *c == '-').count(), 3);
    }
}
