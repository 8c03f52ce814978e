//! Cryptography module for the messenger core
//!
//! This module provides:
//! - Key exchange (long-lived P-256 ECDH keys, HKDF into per-peer AES-256-GCM keys)
//! - Hybrid envelopes (RSA-OAEP-4096 wrapping one-time AES-256-GCM keys)
//!
//! There is no fallback implementation: if the OS random source fails every
//! operation reports `CryptoUnavailable`.

pub mod asymmetric;
pub mod key_exchange;

pub use asymmetric::{HybridEnvelope, RsaKeyPair};
pub use key_exchange::{
    decrypt, decrypt_text, derive_shared_secret, encrypt, encrypt_text, export_public_key,
    import_public_key, DhKeyPair, EncryptedData, SharedKey,
};
