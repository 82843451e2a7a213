use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CommError;
use crate::network::message::GossipMessage;

/// Signed wire unit: serialized [`GossipMessage`] plus a signature over it.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("payload_len", &self.payload.len())
            .field("signature", &hex::encode(&self.signature))
            .finish()
    }
}

impl Envelope {
    /// Decodes the payload without checking the signature.
    pub fn to_gossip_message(&self) -> Result<SignedGossipMessage, CommError> {
        let message: GossipMessage = bincode::deserialize(&self.payload)?;
        Ok(SignedGossipMessage {
            message,
            envelope: self.clone(),
        })
    }
}

/// A [`GossipMessage`] together with the envelope it travels in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedGossipMessage {
    pub message: GossipMessage,
    pub envelope: Envelope,
}

impl SignedGossipMessage {
    /// Serializes `message` and signs the bytes with `signer`.
    pub fn sign<F>(message: GossipMessage, signer: F) -> Result<Self, CommError>
    where
        F: FnOnce(&[u8]) -> Result<Vec<u8>, CommError>,
    {
        let payload = bincode::serialize(&message)?;
        let signature = signer(&payload)?;
        Ok(Self {
            message,
            envelope: Envelope { payload, signature },
        })
    }

    /// Wraps `message` in an envelope with an empty signature.
    pub fn noop_sign(message: GossipMessage) -> Result<Self, CommError> {
        Self::sign(message, |_| Ok(Vec::new()))
    }

    /// Checks the envelope signature with `verifier(signature, payload)`.
    pub fn verify<F>(&self, verifier: F) -> Result<(), CommError>
    where
        F: FnOnce(&[u8], &[u8]) -> Result<(), CommError>,
    {
        if self.envelope.signature.is_empty() {
            return Err(CommError::HandshakeFailed("missing signature".to_string()));
        }
        verifier(&self.envelope.signature, &self.envelope.payload)
    }

    pub fn is_signed(&self) -> bool {
        !self.envelope.signature.is_empty()
    }
}

impl From<SignedGossipMessage> for Envelope {
    fn from(msg: SignedGossipMessage) -> Self {
        msg.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sign_has_empty_signature() {
        let signed = SignedGossipMessage::noop_sign(GossipMessage::empty_data()).unwrap();
        assert!(!signed.is_signed());
        assert!(signed.verify(|_, _| Ok(())).is_err());
    }

    #[test]
    fn test_envelope_decode_preserves_message() {
        let msg = GossipMessage::empty_data();
        let signed = SignedGossipMessage::sign(msg.clone(), |payload| {
            Ok(payload.iter().rev().cloned().collect())
        })
        .unwrap();

        let decoded = signed.envelope.to_gossip_message().unwrap();
        assert_eq!(decoded.message, msg);
        assert!(decoded
            .verify(|sig, payload| {
                let expected: Vec<u8> = payload.iter().rev().cloned().collect();
                if sig == expected.as_slice() {
                    Ok(())
                } else {
                    Err(CommError::HandshakeFailed("mismatch".into()))
                }
            })
            .is_ok());
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let envelope = Envelope {
            payload: vec![0xff; 3],
            signature: vec![],
        };
        assert!(matches!(
            envelope.to_gossip_message(),
            Err(CommError::Codec(_))
        ));
    }
}
