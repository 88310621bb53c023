//! # strata-crypto: Signing and digest primitives for `Strata`
//!
//! Thin wrappers over `ed25519-dalek` and `blake3`:
//! - [`digest`] / [`digest_of`]: BLAKE3 over raw bytes or the canonical
//!   `postcard` encoding of a serializable value
//! - [`SigningKey`]: Ed25519 key with redacted `Debug`
//! - [`seal`] / [`verify_seal`]: produce and check the [`HeaderSignature`]
//!   attached to every envelope header
//! - [`address_of`]: account address derived from a public key

use ed25519_dalek::{Signer, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use strata_types::{AccountAddress, Hash, HeaderSignature, PublicKey, Signature};

/// Errors from signing and verification.
#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("canonical encoding failed: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("secret key seed is all zeros")]
    DegenerateKey,

    #[error("header digest does not match signed hash")]
    DigestMismatch,

    #[error("signature verification failed")]
    InvalidSignature,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

// ============================================================================
// Digests
// ============================================================================

/// BLAKE3 digest of raw bytes.
pub fn digest(bytes: &[u8]) -> Hash {
    Hash::from_bytes(*blake3::hash(bytes).as_bytes())
}

/// BLAKE3 digest of the canonical `postcard` encoding of `value`.
pub fn digest_of<T: Serialize + ?Sized>(value: &T) -> Result<Hash> {
    let bytes = postcard::to_allocvec(value)?;
    Ok(digest(&bytes))
}

/// Account address owned by a public key.
pub fn address_of(public_key: &PublicKey) -> AccountAddress {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"strata-address");
    hasher.update(public_key.as_bytes());
    AccountAddress::from(Hash::from_bytes(*hasher.finalize().as_bytes()))
}

// ============================================================================
// Signing keys
// ============================================================================

/// Ed25519 signing key.
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

// Key material never reaches logs
impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &self.public_key())
            .field("inner", &"<redacted>")
            .finish()
    }
}

impl SigningKey {
    /// Generates a new key from system randomness.
    pub fn generate() -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Creates a key from a 32-byte seed.
    pub fn from_bytes(seed: &[u8; 32]) -> Result<Self> {
        if seed == &[0u8; 32] {
            return Err(CryptoError::DegenerateKey);
        }
        Ok(Self {
            inner: ed25519_dalek::SigningKey::from_bytes(seed),
        })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.inner.verifying_key().to_bytes())
    }

    pub fn address(&self) -> AccountAddress {
        address_of(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.inner.sign(message).to_bytes().to_vec())
    }
}

/// Verifies `signature` over `message` with strict RFC 8032 checks.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    let key =
        VerifyingKey::from_bytes(public_key.as_bytes()).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = ed25519_dalek::Signature::from_slice(signature.as_bytes())
        .map_err(|_| CryptoError::InvalidSignature)?;
    key.verify_strict(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

// ============================================================================
// Header seals
// ============================================================================

/// Signs the digest of `header` and returns the signature block.
pub fn seal<T: Serialize + ?Sized>(header: &T, key: &SigningKey) -> Result<HeaderSignature> {
    let hash = digest_of(header)?;
    Ok(HeaderSignature {
        hash,
        signee: key.public_key(),
        signature: key.sign(hash.as_bytes()),
    })
}

/// Checks that `seal` covers exactly `header` and was produced by its signee.
pub fn verify_seal<T: Serialize + ?Sized>(header: &T, seal: &HeaderSignature) -> Result<()> {
    if digest_of(header)? != seal.hash {
        return Err(CryptoError::DigestMismatch);
    }
    verify(&seal.signee, seal.hash.as_bytes(), &seal.signature)
}
