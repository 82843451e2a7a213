//! PKI-ID to identity cache over the injected crypto capability.

use dashmap::DashMap;
use std::sync::Arc;

use crate::crypto::MessageCryptoService;
use crate::error::{CommError, CryptoError};
use crate::types::{PeerIdentity, PkiId};

pub struct IdentityMapper {
    mcs: Arc<dyn MessageCryptoService>,
    identities: DashMap<PkiId, PeerIdentity>,
    self_pki_id: PkiId,
}

impl IdentityMapper {
    /// Creates a mapper pre-loaded with the local identity.
    pub fn new(
        mcs: Arc<dyn MessageCryptoService>,
        self_identity: PeerIdentity,
    ) -> Result<Self, CommError> {
        mcs.validate_identity(&self_identity)?;
        let self_pki_id = mcs.pki_id_of(&self_identity);
        let identities = DashMap::new();
        identities.insert(self_pki_id.clone(), self_identity);
        Ok(Self {
            mcs,
            identities,
            self_pki_id,
        })
    }

    pub fn self_pki_id(&self) -> &PkiId {
        &self.self_pki_id
    }

    /// Binds `pki_id` to `identity` after checking the identity is valid and
    /// actually derives `pki_id`.
    pub fn put(&self, pki_id: &PkiId, identity: &PeerIdentity) -> Result<(), CommError> {
        if pki_id.is_empty() {
            return Err(CommError::HandshakeFailed("empty PKI-ID".to_string()));
        }
        self.mcs.validate_identity(identity)?;

        let derived = self.mcs.pki_id_of(identity);
        if &derived != pki_id {
            return Err(CommError::IdentityMismatch {
                expected: derived,
                actual: pki_id.clone(),
            });
        }

        self.identities.insert(pki_id.clone(), identity.clone());
        Ok(())
    }

    pub fn get(&self, pki_id: &PkiId) -> Result<PeerIdentity, CommError> {
        self.identities
            .get(pki_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CommError::Crypto(CryptoError::UnknownPeer(pki_id.clone())))
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CommError> {
        Ok(self.mcs.sign(msg)?)
    }

    /// Verifies a signature made by the peer registered under `pki_id`.
    pub fn verify(&self, pki_id: &PkiId, signature: &[u8], message: &[u8]) -> Result<(), CommError> {
        let identity = self.get(pki_id)?;
        Ok(self.mcs.verify(&identity, signature, message)?)
    }

    pub fn pki_id_of(&self, identity: &PeerIdentity) -> PkiId {
        self.mcs.pki_id_of(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Ed25519CryptoService, HmacCryptoService};

    fn hmac_mapper(self_id: &str) -> IdentityMapper {
        let mcs: Arc<dyn MessageCryptoService> = Arc::new(HmacCryptoService::new(vec![0, 0, 0]));
        IdentityMapper::new(mcs, PeerIdentity::from(self_id)).unwrap()
    }

    #[test]
    fn test_self_identity_preloaded() {
        let mapper = hmac_mapper("localhost:1000");
        assert_eq!(mapper.self_pki_id(), &PkiId::from("localhost:1000"));
        assert_eq!(
            mapper.get(&PkiId::from("localhost:1000")).unwrap(),
            PeerIdentity::from("localhost:1000")
        );
    }

    #[test]
    fn test_put_rejects_inconsistent_pki_id() {
        let mapper = hmac_mapper("localhost:1000");
        let err = mapper
            .put(&PkiId::from("localhost:9650"), &PeerIdentity::from("localhost:9613"))
            .unwrap_err();
        assert!(matches!(err, CommError::IdentityMismatch { .. }));
        assert!(mapper.get(&PkiId::from("localhost:9650")).is_err());
    }

    #[test]
    fn test_put_then_verify() {
        let mapper = hmac_mapper("localhost:1000");
        let peer = PkiId::from("localhost:2000");
        mapper.put(&peer, &PeerIdentity::from("localhost:2000")).unwrap();

        let sig = mapper.sign(b"data").unwrap();
        assert!(mapper.verify(&peer, &sig, b"data").is_ok());
        assert!(mapper.verify(&PkiId::from("unknown"), &sig, b"data").is_err());
    }

    #[test]
    fn test_ed25519_identity_binding() {
        let local = Ed25519CryptoService::generate();
        let remote = Ed25519CryptoService::generate();
        let local_identity = local.identity();
        let mapper = IdentityMapper::new(Arc::new(local), local_identity).unwrap();

        let remote_identity = remote.identity();
        let remote_pki = mapper.pki_id_of(&remote_identity);
        mapper.put(&remote_pki, &remote_identity).unwrap();

        let sig = remote.sign(b"hello").unwrap();
        assert!(mapper.verify(&remote_pki, &sig, b"hello").is_ok());
    }
}
