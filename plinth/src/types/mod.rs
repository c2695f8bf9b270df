//! Core domain types used by the engine.
//!
//! This module defines strongly-typed digests, addresses, and key material
//! shared across the crate. The goal is to avoid "naked" byte buffers in
//! public APIs and instead use domain-specific newtypes.
//!
//! All fixed-size types serialize as lowercase hex strings so they remain
//! usable as map keys in human-readable formats and stay deterministic in
//! binary ones.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use secp256k1::{Message, SECP256K1};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

pub mod block;
pub mod tx;

pub use block::Block;
pub use tx::{Transaction, TxId};

use crate::error::TxError;

/// Length in bytes of SHA-256 digests.
pub const DIGEST_LEN: usize = 32;

/// Length in bytes of account addresses.
pub const ADDRESS_LEN: usize = 20;

/// Strongly-typed SHA-256 digest.
///
/// Used both as block identifier and as state-root identifier. Equality is
/// byte-wise; ordering is lexicographic over the big-endian bytes, which
/// matches numeric ordering of the digest interpreted as a 256-bit integer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HashDigest(pub [u8; DIGEST_LEN]);

impl HashDigest {
    /// Computes a new [`HashDigest`] as the SHA-256 hash of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&digest);
        HashDigest(out)
    }

    /// Returns the underlying 32-byte digest as a borrowed array.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Checks the Hashcash rule: the digest, read as a big-endian 256-bit
    /// integer, must be below `2^256 / difficulty`.
    ///
    /// A difficulty of zero is always satisfied; it marks blocks that were
    /// not mined (genesis).
    pub fn satisfies(&self, difficulty: u64) -> bool {
        if difficulty == 0 {
            return true;
        }
        // Long division of (2^256 - 1) by the difficulty, one 64-bit limb
        // at a time, yields the largest digest that still satisfies the
        // bound (exact for powers of two as well, since then the division
        // truncates to 2^(256-k) - 1).
        let d = u128::from(difficulty);
        let mut rem: u128 = 0;
        let mut target = [0u8; DIGEST_LEN];
        for limb in 0..4 {
            let acc = (rem << 64) | u128::from(u64::MAX);
            let q = (acc / d) as u64;
            rem = acc % d;
            target[limb * 8..(limb + 1) * 8].copy_from_slice(&q.to_be_bytes());
        }
        self.0 <= target
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for HashDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for HashDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        let arr: [u8; DIGEST_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 hex-encoded bytes"))?;
        Ok(HashDigest(arr))
    }
}

/// Fixed 20-byte account identity.
///
/// Derived from the Keccak-256 digest of the uncompressed secp256k1 public
/// key with its leading sign byte stripped, keeping the last 20 bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// Derives an [`Address`] from a secp256k1 public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let uncompressed = public_key.0.serialize_uncompressed();
        let digest = Keccak256::digest(&uncompressed[1..]);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[DIGEST_LEN - ADDRESS_LEN..]);
        Address(out)
    }

    /// Returns the underlying 20-byte identity as a borrowed array.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        let arr: [u8; ADDRESS_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("expected 20 hex-encoded bytes"))?;
        Ok(Address(arr))
    }
}

/// Arbitrary-length proof-of-work witness.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Nonce(pub Vec<u8>);

impl Nonce {
    /// Returns the raw witness bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        Ok(Nonce(bytes))
    }
}

/// secp256k1 public key, wrapped to keep the crate surface self-contained.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(pub(crate) secp256k1::PublicKey);

impl PublicKey {
    /// Parses a public key from SEC1-encoded bytes (compressed or not).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TxError> {
        secp256k1::PublicKey::from_slice(bytes)
            .map(PublicKey)
            .map_err(|e| TxError::InvalidKeyMaterial(e.to_string()))
    }

    /// Returns the derived account address.
    pub fn to_address(&self) -> Address {
        Address::from_public_key(self)
    }

    /// Verifies a signature over a 32-byte digest.
    pub fn verify(&self, digest: &HashDigest, signature: &Signature) -> bool {
        let message = Message::from_digest(digest.0);
        SECP256K1
            .verify_ecdsa(&message, &signature.0, &self.0)
            .is_ok()
    }
}

/// Compact ECDSA signature over a canonical serialization digest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(pub(crate) secp256k1::ecdsa::Signature);

/// secp256k1 private key used to sign transactions.
///
/// Never serialized; lives only in the signer's process.
#[derive(Clone)]
pub struct PrivateKey(secp256k1::SecretKey);

impl PrivateKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        PrivateKey(secp256k1::SecretKey::new(&mut secp256k1::rand::thread_rng()))
    }

    /// Parses a private key from raw 32-byte scalar material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TxError> {
        secp256k1::SecretKey::from_slice(bytes)
            .map(PrivateKey)
            .map_err(|e| TxError::InvalidKeyMaterial(e.to_string()))
    }

    /// Returns the matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.public_key(SECP256K1))
    }

    /// Returns the account address of this key.
    pub fn to_address(&self) -> Address {
        self.public_key().to_address()
    }

    /// Signs a 32-byte digest.
    pub fn sign(&self, digest: &HashDigest) -> Signature {
        let message = Message::from_digest(digest.0);
        Signature(SECP256K1.sign_ecdsa(&message, &self.0))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        write!(f, "PrivateKey({})", self.to_address())
    }
}

/// Cooperative cancellation flag shared between a long-running operation
/// and its controller.
///
/// Mining and evaluation poll this at block and batch boundaries and bail
/// out with [`ChainError::Canceled`](crate::error::ChainError::Canceled).
#[derive(Clone, Debug, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    /// Creates a flag in the "not cancelled" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
