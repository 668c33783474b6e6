use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

use crate::protocol::{CodecError, Message};

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, SigningError>;

// ---------------------------------------------------------------------------
// Identity collaborator contract
// ---------------------------------------------------------------------------

/// Lookup of verified identity credentials, as consumed by relevance scoring.
pub trait VerificationSource {
    fn is_verified(&self, address: &str) -> bool;
}

impl VerificationSource for HashSet<String> {
    fn is_verified(&self, address: &str) -> bool {
        self.contains(address)
    }
}

impl VerificationSource for HashMap<String, bool> {
    fn is_verified(&self, address: &str) -> bool {
        self.get(address).copied().unwrap_or(false)
    }
}

/// Detached signature plus the hex public key that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageSignature {
    pub signature: String,
    pub public_key: String,
}

/// Signing and verification of forum messages.
///
/// The application supplies this (wallet-backed keys, delegated browser keys,
/// ...). `Ed25519Identity` is the in-crate implementation.
pub trait IdentityProvider: VerificationSource + Send + Sync {
    fn sign(&self, message: &Message) -> Result<MessageSignature>;
    fn verify(&self, message: &Message) -> bool;
}

/// Sign `message` and attach the signature fields.
pub fn sign_message<I: IdentityProvider + ?Sized>(identity: &I, mut message: Message) -> Result<Message> {
    let sig = identity.sign(&message)?;
    message.signature = Some(sig.signature);
    message.signer_public_key = Some(sig.public_key);
    Ok(message)
}

// ---------------------------------------------------------------------------
// Ed25519 implementation
// ---------------------------------------------------------------------------

/// Ed25519 identity: signs BLAKE3(signable_bytes) and tracks which addresses
/// hold a verified credential.
pub struct Ed25519Identity {
    signing_key: SigningKey,
    verified: RwLock<HashSet<String>>,
}

impl Ed25519Identity {
    /// Fresh random keypair.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore from a 32-byte Ed25519 private key.
    pub fn from_secret_bytes(private_key: &[u8]) -> Result<Self> {
        if private_key.len() != 32 {
            return Err(SigningError::InvalidKeyLength);
        }
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(private_key);
        Ok(Self::from_signing_key(SigningKey::from_bytes(&key_bytes)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        Ed25519Identity {
            signing_key,
            verified: RwLock::new(HashSet::new()),
        }
    }

    /// Hex-encoded public key, used as this identity's author address.
    pub fn address(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Record that `address` holds a verified identity credential.
    pub fn mark_verified(&self, address: &str) {
        if let Ok(mut verified) = self.verified.write() {
            verified.insert(address.to_string());
        }
    }
}

impl VerificationSource for Ed25519Identity {
    fn is_verified(&self, address: &str) -> bool {
        self.verified
            .read()
            .map(|v| v.contains(address))
            .unwrap_or(false)
    }
}

impl IdentityProvider for Ed25519Identity {
    fn sign(&self, message: &Message) -> Result<MessageSignature> {
        let signable = message.signable_bytes()?;
        let hash = blake3::hash(&signable);
        let signature = self.signing_key.sign(hash.as_bytes());
        Ok(MessageSignature {
            signature: hex::encode(signature.to_bytes()),
            public_key: self.address(),
        })
    }

    fn verify(&self, message: &Message) -> bool {
        verify_message(message).unwrap_or(false)
    }
}

/// Verify the Ed25519 signature carried by a message.
///
/// The author address is the signer's hex public key, so a message whose
/// `signer_public_key` differs from `author` is rejected even when the
/// signature itself is valid.
///
/// Returns `Ok(false)` for a well-formed but wrong signature or a foreign
/// author, `Err` if the message is unsigned or its key/signature fields are
/// malformed.
pub fn verify_message(message: &Message) -> Result<bool> {
    let (sig_hex, key_hex) = match (&message.signature, &message.signer_public_key) {
        (Some(sig), Some(key)) => (sig, key),
        _ => return Err(SigningError::InvalidSignature),
    };

    if !key_hex.eq_ignore_ascii_case(message.author.as_str()) {
        log::debug!(
            "Signer {} does not own author address {}",
            key_hex,
            message.author
        );
        return Ok(false);
    }

    let key_bytes: [u8; 32] = hex::decode(key_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(SigningError::InvalidKeyLength)?;
    let sig_bytes: [u8; 64] = hex::decode(sig_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(SigningError::InvalidSignature)?;

    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| SigningError::InvalidKeyLength)?;
    let signature = Signature::from_bytes(&sig_bytes);

    let signable = message.signable_bytes()?;
    let hash = blake3::hash(&signable);
    Ok(verifying_key.verify(hash.as_bytes(), &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageBody, ThreadPayload};

    fn thread(author: &str) -> Message {
        Message::new(
            author.into(),
            1_700_000_000_000,
            MessageBody::Thread(ThreadPayload {
                community_id: "c1".into(),
                title: "Hello".into(),
                content: "First post".into(),
            }),
        )
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = Ed25519Identity::generate();
        let signed = sign_message(&identity, thread(&identity.address())).unwrap();
        assert!(signed.is_signed());
        assert_eq!(signed.signer_public_key.as_deref(), Some(identity.address().as_str()));
        assert!(identity.verify(&signed));
    }

    #[test]
    fn test_tampered_message_fails() {
        let identity = Ed25519Identity::generate();
        let mut signed = sign_message(&identity, thread(&identity.address())).unwrap();
        if let MessageBody::Thread(t) = &mut signed.body {
            t.title = "Edited".into();
        }
        assert!(!identity.verify(&signed));
        assert_eq!(verify_message(&signed).unwrap(), false);
    }

    #[test]
    fn test_foreign_author_fails() {
        let victim = Ed25519Identity::generate();
        let attacker = Ed25519Identity::generate();

        // Valid signature from the attacker's key, victim's address as author
        let forged = sign_message(&attacker, thread(&victim.address())).unwrap();
        assert_eq!(forged.signer_public_key.as_deref(), Some(attacker.address().as_str()));
        assert!(!victim.verify(&forged));
        assert!(!attacker.verify(&forged));
        assert_eq!(verify_message(&forged).unwrap(), false);

        // Swapping in the victim's key breaks the signature instead
        let mut rekeyed = forged.clone();
        rekeyed.signer_public_key = Some(victim.address());
        assert_eq!(verify_message(&rekeyed).unwrap(), false);
    }

    #[test]
    fn test_author_match_ignores_hex_case() {
        let identity = Ed25519Identity::generate();
        let signed = sign_message(&identity, thread(&identity.address().to_uppercase())).unwrap();
        assert!(identity.verify(&signed));
    }

    #[test]
    fn test_unsigned_message_rejected() {
        let identity = Ed25519Identity::generate();
        assert!(!identity.verify(&thread("0xu1")));
        assert!(verify_message(&thread("0xu1")).is_err());
    }

    #[test]
    fn test_other_identity_verifies() {
        let alice = Ed25519Identity::generate();
        let bob = Ed25519Identity::generate();
        let signed = sign_message(&alice, thread(&alice.address())).unwrap();
        // Verification only needs the embedded public key
        assert!(bob.verify(&signed));
    }

    #[test]
    fn test_from_secret_bytes() {
        assert!(matches!(
            Ed25519Identity::from_secret_bytes(&[1u8; 31]),
            Err(SigningError::InvalidKeyLength)
        ));
        let a = Ed25519Identity::from_secret_bytes(&[7u8; 32]).unwrap();
        let b = Ed25519Identity::from_secret_bytes(&[7u8; 32]).unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn test_verified_addresses() {
        let identity = Ed25519Identity::generate();
        assert!(!identity.is_verified("0xu1"));
        identity.mark_verified("0xu1");
        assert!(identity.is_verified("0xu1"));

        let mut map = HashMap::new();
        map.insert("0xu2".to_string(), false);
        map.insert("0xu3".to_string(), true);
        assert!(!map.is_verified("0xu2"));
        assert!(map.is_verified("0xu3"));
        assert!(!map.is_verified("0xu4"));
    }
}
