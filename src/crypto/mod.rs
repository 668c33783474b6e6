pub mod hashing;
pub mod signing;

pub use hashing::{content_digest, payload_hash};
pub use signing::{
    sign_message, verify_message, Ed25519Identity, IdentityProvider, MessageSignature,
    SigningError, VerificationSource,
};
