//! Signed transactions.
//!
//! A transaction carries an ordered list of actions, a per-signer nonce,
//! and a secp256k1 signature over the canonical bincode-2 serialization of
//! every other field. The same canonical encoding is used for the
//! transaction id, so ids commit to the signature as well.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::action::Action;
use crate::error::TxError;

use super::{Address, DIGEST_LEN, HashDigest, PrivateKey, PublicKey, Signature};

/// Strongly-typed transaction identifier.
///
/// The SHA-256 digest of the canonical serialization of a transaction,
/// signature included.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxId(pub [u8; DIGEST_LEN]);

impl TxId {
    /// Returns the underlying 32-byte id as a borrowed array.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for TxId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for TxId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        let arr: [u8; DIGEST_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 hex-encoded bytes"))?;
        Ok(TxId(arr))
    }
}

/// Signed, ordered list of actions with a nonce per signer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction<A> {
    /// Position of this transaction in the signer's confirmed run,
    /// starting at zero.
    pub nonce: u64,
    /// Account address that signed this transaction.
    pub signer: Address,
    /// Public key the signature verifies against; must derive `signer`.
    pub public_key: PublicKey,
    /// Addresses whose state the actions declare they may update.
    pub updated_addresses: BTreeSet<Address>,
    /// Wall-clock creation time, in seconds since the Unix epoch.
    pub timestamp: u64,
    /// Actions to apply, in order.
    pub actions: Vec<A>,
    /// Signature over the canonical serialization of the fields above.
    pub signature: Signature,
}

/// The fields covered by the signature, serialized in declaration order.
#[derive(Serialize)]
struct SigningPayload<'a, A> {
    nonce: u64,
    signer: &'a Address,
    public_key: &'a PublicKey,
    updated_addresses: &'a BTreeSet<Address>,
    timestamp: u64,
    actions: &'a [A],
}

fn signing_digest<A: Action>(
    nonce: u64,
    signer: &Address,
    public_key: &PublicKey,
    updated_addresses: &BTreeSet<Address>,
    timestamp: u64,
    actions: &[A],
) -> HashDigest {
    let payload = SigningPayload {
        nonce,
        signer,
        public_key,
        updated_addresses,
        timestamp,
        actions,
    };
    let cfg = bincode::config::standard();
    let bytes = bincode::serde::encode_to_vec(&payload, cfg)
        .expect("transaction fields should always be serializable with bincode 2 + serde");
    HashDigest::compute(&bytes)
}

impl<A: Action> Transaction<A> {
    /// Creates and signs a transaction with `private_key`.
    ///
    /// The signer address is derived from the key; callers only choose the
    /// nonce, the declared updated addresses, and the actions.
    pub fn new(
        private_key: &PrivateKey,
        nonce: u64,
        updated_addresses: BTreeSet<Address>,
        timestamp: u64,
        actions: Vec<A>,
    ) -> Self {
        let public_key = private_key.public_key();
        let signer = public_key.to_address();
        let digest = signing_digest(
            nonce,
            &signer,
            &public_key,
            &updated_addresses,
            timestamp,
            &actions,
        );
        let signature = private_key.sign(&digest);
        Transaction {
            nonce,
            signer,
            public_key,
            updated_addresses,
            timestamp,
            actions,
            signature,
        }
    }

    /// Returns the canonical byte representation, signature included.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let cfg = bincode::config::standard();
        bincode::serde::encode_to_vec(self, cfg)
            .expect("transaction should always be serializable with bincode 2 + serde")
    }

    /// Computes the id of this transaction.
    pub fn id(&self) -> TxId {
        let digest = HashDigest::compute(&self.canonical_bytes());
        TxId(digest.0)
    }

    /// The digest the signature is expected to cover.
    pub fn signing_digest(&self) -> HashDigest {
        signing_digest(
            self.nonce,
            &self.signer,
            &self.public_key,
            &self.updated_addresses,
            self.timestamp,
            &self.actions,
        )
    }

    /// Checks structural invariants: the public key derives the claimed
    /// signer and the signature verifies over the canonical serialization.
    pub fn verify(&self) -> Result<(), TxError> {
        let derived = self.public_key.to_address();
        if derived != self.signer {
            return Err(TxError::InvalidPublicKey {
                expected: self.signer,
                actual: derived,
            });
        }
        if !self.public_key.verify(&self.signing_digest(), &self.signature) {
            return Err(TxError::InvalidSignature {
                signer: self.signer,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionContext;
    use crate::error::ActionError;
    use serde_json::json;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct SetGreeting {
        target: Address,
        greeting: String,
    }

    impl Action for SetGreeting {
        fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<(), ActionError> {
            ctx.states.set_state(self.target, json!(self.greeting))
        }
    }

    fn dummy_key(byte: u8) -> PrivateKey {
        PrivateKey::from_bytes(&[byte; 32]).expect("nonzero scalar is a valid key")
    }

    fn dummy_tx(key: &PrivateKey, nonce: u64) -> Transaction<SetGreeting> {
        let target = key.to_address();
        Transaction::new(
            key,
            nonce,
            [target].into_iter().collect(),
            1_700_000_000,
            vec![SetGreeting {
                target,
                greeting: format!("hello-{nonce}"),
            }],
        )
    }

    #[test]
    fn fresh_transaction_verifies() {
        let key = dummy_key(1);
        let tx = dummy_tx(&key, 0);
        assert_eq!(tx.signer, key.to_address());
        tx.verify().expect("signature should verify");
    }

    #[test]
    fn tampered_nonce_invalidates_signature() {
        let key = dummy_key(1);
        let mut tx = dummy_tx(&key, 0);
        tx.nonce = 1;

        let err = tx.verify().unwrap_err();
        assert!(matches!(err, TxError::InvalidSignature { .. }));
    }

    #[test]
    fn forged_signer_is_detected() {
        let key = dummy_key(1);
        let mut tx = dummy_tx(&key, 0);
        tx.signer = Address([9u8; crate::types::ADDRESS_LEN]);

        let err = tx.verify().unwrap_err();
        assert!(matches!(err, TxError::InvalidPublicKey { .. }));
    }

    #[test]
    fn serde_roundtrip_preserves_signature_validity() {
        let key = dummy_key(2);
        let tx = dummy_tx(&key, 3);

        let json = serde_json::to_string(&tx).expect("serialize transaction");
        let back: Transaction<SetGreeting> =
            serde_json::from_str(&json).expect("deserialize transaction");

        back.verify().expect("roundtripped signature still verifies");
        assert_eq!(back.id(), tx.id());
        assert_eq!(back.actions, tx.actions);
    }

    #[test]
    fn id_commits_to_the_signature() {
        let key = dummy_key(3);
        let a = dummy_tx(&key, 0);
        let b = dummy_tx(&key, 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.id());
    }
}
