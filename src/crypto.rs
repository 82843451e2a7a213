//! Pluggable message crypto capability.
//!
//! The comm layer never decides how identities sign or verify; it asks a
//! [`MessageCryptoService`]. Two implementations ship with the crate:
//! - [`Ed25519CryptoService`]: identity is an Ed25519 verifying key, PKI-ID is
//!   its SHA-256 digest.
//! - [`HmacCryptoService`]: shared-key HMAC-SHA256 where the identity doubles as
//!   the PKI-ID. Only meaningful on test and development networks.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::types::{ChannelId, PeerIdentity, PkiId};

pub trait MessageCryptoService: Send + Sync {
    /// Checks that an identity is well formed and acceptable.
    fn validate_identity(&self, identity: &PeerIdentity) -> Result<(), CryptoError>;

    /// Derives the PKI-ID bound to an identity.
    fn pki_id_of(&self, identity: &PeerIdentity) -> PkiId;

    /// Signs `msg` with the local signing key.
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verifies `signature` over `message` under `identity`'s verification key.
    fn verify(
        &self,
        identity: &PeerIdentity,
        signature: &[u8],
        message: &[u8],
    ) -> Result<(), CryptoError>;

    /// Verifies a signature in the context of a channel.
    fn verify_by_channel(
        &self,
        channel: &ChannelId,
        identity: &PeerIdentity,
        signature: &[u8],
        message: &[u8],
    ) -> Result<(), CryptoError>;
}

pub struct Ed25519CryptoService {
    signing_key: SigningKey,
}

impl Ed25519CryptoService {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self::new(SigningKey::generate(&mut rng))
    }

    /// The identity other peers learn during the handshake.
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity(self.signing_key.verifying_key().to_bytes().to_vec())
    }

    fn verifying_key(identity: &PeerIdentity) -> Result<VerifyingKey, CryptoError> {
        let bytes: [u8; 32] = identity.as_bytes().try_into().map_err(|_| {
            CryptoError::InvalidIdentity(format!(
                "expected 32-byte Ed25519 key, got {} bytes",
                identity.as_bytes().len()
            ))
        })?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidIdentity(e.to_string()))
    }
}

impl MessageCryptoService for Ed25519CryptoService {
    fn validate_identity(&self, identity: &PeerIdentity) -> Result<(), CryptoError> {
        Self::verifying_key(identity).map(|_| ())
    }

    fn pki_id_of(&self, identity: &PeerIdentity) -> PkiId {
        PkiId(Sha256::digest(identity.as_bytes()).to_vec())
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.signing_key.sign(msg).to_bytes().to_vec())
    }

    fn verify(
        &self,
        identity: &PeerIdentity,
        signature: &[u8],
        message: &[u8],
    ) -> Result<(), CryptoError> {
        let key = Self::verifying_key(identity)?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        key.verify(message, &signature)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }

    fn verify_by_channel(
        &self,
        _channel: &ChannelId,
        identity: &PeerIdentity,
        signature: &[u8],
        message: &[u8],
    ) -> Result<(), CryptoError> {
        // No channel membership policy at this layer
        self.verify(identity, signature, message)
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Shared-key provider: every peer holding `key` can sign for every identity.
pub struct HmacCryptoService {
    key: Vec<u8>,
}

impl HmacCryptoService {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self) -> Result<HmacSha256, CryptoError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| CryptoError::Signing(e.to_string()))
    }
}

impl MessageCryptoService for HmacCryptoService {
    fn validate_identity(&self, identity: &PeerIdentity) -> Result<(), CryptoError> {
        if identity.is_empty() {
            return Err(CryptoError::InvalidIdentity("empty identity".to_string()));
        }
        Ok(())
    }

    fn pki_id_of(&self, identity: &PeerIdentity) -> PkiId {
        PkiId(identity.as_bytes().to_vec())
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut mac = self.mac()?;
        mac.update(msg);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(
        &self,
        _identity: &PeerIdentity,
        signature: &[u8],
        message: &[u8],
    ) -> Result<(), CryptoError> {
        let mut mac = self.mac()?;
        mac.update(message);
        mac.verify_slice(signature)
            .map_err(|_| CryptoError::InvalidSignature("HMAC mismatch".to_string()))
    }

    fn verify_by_channel(
        &self,
        _channel: &ChannelId,
        identity: &PeerIdentity,
        signature: &[u8],
        message: &[u8],
    ) -> Result<(), CryptoError> {
        self.verify(identity, signature, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_sign_and_verify() {
        let mcs = Ed25519CryptoService::generate();
        let identity = mcs.identity();
        assert!(mcs.validate_identity(&identity).is_ok());

        let sig = mcs.sign(b"payload").unwrap();
        assert!(mcs.verify(&identity, &sig, b"payload").is_ok());
        assert!(mcs.verify(&identity, &sig, b"other payload").is_err());
    }

    #[test]
    fn test_ed25519_wrong_identity_rejected() {
        let alice = Ed25519CryptoService::generate();
        let bob = Ed25519CryptoService::generate();

        let sig = alice.sign(b"hello").unwrap();
        assert!(alice.verify(&bob.identity(), &sig, b"hello").is_err());
        assert_ne!(alice.pki_id_of(&alice.identity()), alice.pki_id_of(&bob.identity()));
    }

    #[test]
    fn test_ed25519_malformed_identity() {
        let mcs = Ed25519CryptoService::generate();
        let err = mcs.validate_identity(&PeerIdentity(vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidIdentity(_)));
    }

    #[test]
    fn test_hmac_signature_is_deterministic() {
        let mcs = HmacCryptoService::new(vec![0, 0, 0]);
        let a = mcs.sign(b"msg").unwrap();
        let b = mcs.sign(b"msg").unwrap();
        assert_eq!(a, b);

        let identity = PeerIdentity::from("localhost:2000");
        assert!(mcs.verify(&identity, &a, b"msg").is_ok());

        let mut flipped = a.clone();
        flipped[0] ^= 1;
        assert!(mcs.verify(&identity, &flipped, b"msg").is_err());
        assert_eq!(mcs.pki_id_of(&identity), PkiId::from("localhost:2000"));
    }

    #[test]
    fn test_hmac_empty_identity_rejected() {
        let mcs = HmacCryptoService::new(b"k".to_vec());
        assert!(mcs.validate_identity(&PeerIdentity::default()).is_err());
    }
}
