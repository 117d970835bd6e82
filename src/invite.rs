//! Invite payload encoding: a base64url-encoded CBOR record handed out
//! of band (QR code, link, clipboard) that lets a recipient join a
//! document without a prior sync.

use anyhow::{anyhow, Result};
use arbor_core::{CapabilityToken, ReplicaId};
use serde::{Deserialize, Serialize};

const INVITE_VERSION: u8 = 1;
const INVITE_TAG: &str = "invite";

#[derive(Serialize, Deserialize)]
struct InviteRecord {
    v: u8,
    t: String,
    doc_id: Vec<u8>,
    issuer_pk: ReplicaId,
    subject_sk: Vec<u8>,
    token: Vec<u8>,
    payload_key: Option<Vec<u8>>,
}

/// A decoded invite: who issued it, the document it's scoped to, the
/// secret key the recipient should adopt as their replica key, the
/// capability token that authorizes them, and an optional payload
/// decryption key (opaque to this crate; payload encryption at rest is
/// out of scope).
pub struct Invite {
    pub doc_id: Vec<u8>,
    pub issuer_pk: ReplicaId,
    pub subject_sk: [u8; 32],
    pub token: CapabilityToken,
    pub payload_key: Option<Vec<u8>>,
}

impl Invite {
    /// Encodes the invite as the base64url string handed out of band.
    pub fn encode(&self) -> String {
        let record = InviteRecord {
            v: INVITE_VERSION,
            t: INVITE_TAG.to_owned(),
            doc_id: self.doc_id.clone(),
            issuer_pk: self.issuer_pk,
            subject_sk: self.subject_sk.to_vec(),
            token: self.token.to_bytes(),
            payload_key: self.payload_key.clone(),
        };
        let cbor = serde_cbor::to_vec(&record).expect("invite record is always representable");
        base64::encode_config(cbor, base64::URL_SAFE_NO_PAD)
    }

    /// Decodes and validates the shape of a base64url invite string.
    pub fn decode(encoded: &str) -> Result<Self> {
        let cbor = base64::decode_config(encoded, base64::URL_SAFE_NO_PAD)
            .map_err(|e| anyhow!("invite is not valid base64url: {}", e))?;
        let record: InviteRecord = serde_cbor::from_slice(&cbor)
            .map_err(|e| anyhow!("invite is not a valid record: {}", e))?;
        if record.v != INVITE_VERSION {
            return Err(anyhow!("unsupported invite version {}", record.v));
        }
        if record.t != INVITE_TAG {
            return Err(anyhow!("not an invite record (t = {:?})", record.t));
        }
        let subject_sk: [u8; 32] = record
            .subject_sk
            .try_into()
            .map_err(|_| anyhow!("subject_sk must be 32 bytes"))?;
        let token = CapabilityToken::from_bytes(&record.token)?;
        Ok(Invite {
            doc_id: record.doc_id,
            issuer_pk: record.issuer_pk,
            subject_sk,
            token,
            payload_key: record.payload_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{Action, Claims, Keypair, NodeId};

    #[test]
    fn encode_then_decode_round_trips() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate();
        let claims = Claims {
            issuer: issuer.replica_id(),
            audience: b"doc-1".to_vec(),
            subject: subject.replica_id(),
            scope: NodeId::ROOT,
            actions: vec![Action::WriteStructure, Action::WritePayload],
            issued_at: 0,
            expires_at: 1_000,
        };
        let token = CapabilityToken::issue(issuer, claims);
        let invite = Invite {
            doc_id: b"doc-1".to_vec(),
            issuer_pk: issuer.replica_id(),
            subject_sk: subject.to_bytes(),
            token,
            payload_key: None,
        };
        let encoded = invite.encode();
        let decoded = Invite::decode(&encoded).unwrap();
        assert_eq!(decoded.doc_id, invite.doc_id);
        assert_eq!(decoded.issuer_pk, invite.issuer_pk);
        assert_eq!(decoded.subject_sk, invite.subject_sk);
        decoded.token.verify_signature().unwrap();
    }

    #[test]
    fn garbage_input_is_rejected() {
        assert!(Invite::decode("not-a-valid-invite").is_err());
    }
}
