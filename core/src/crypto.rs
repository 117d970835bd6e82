//! Ed25519 signing, used both for signing individual ops (`OpAuth`) and
//! for issuing capability tokens.
//!
//! Payload encryption at rest is out of scope, so this module carries no
//! symmetric-cipher half.

use crate::ids::ReplicaId;
use anyhow::Result;
use bytecheck::CheckBytes;
use ed25519_dalek::{PublicKey, SecretKey, Signature, Signer, Verifier};
use rkyv::ser::serializers::AllocSerializer;
use rkyv::ser::Serializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, Archived, Deserialize, Serialize};

#[derive(Clone, Copy, Archive, Serialize, Deserialize)]
#[archive(as = "Keypair")]
#[repr(transparent)]
pub struct Keypair([u8; 32]);

impl Keypair {
    pub fn generate() -> Self {
        let mut secret = [0; 32];
        getrandom::getrandom(&mut secret).expect("platform RNG must be available");
        Self(secret)
    }

    /// Reconstructs a keypair from its raw 32-byte secret seed, e.g. the
    /// `subject_sk` carried by an invite payload.
    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self(secret)
    }

    fn to_keypair(self) -> ed25519_dalek::Keypair {
        let secret = SecretKey::from_bytes(&self.0).expect("32 bytes is a valid secret key");
        let public = PublicKey::from(&secret);
        ed25519_dalek::Keypair { secret, public }
    }

    pub fn replica_id(self) -> ReplicaId {
        ReplicaId::new(self.to_keypair().public.to_bytes())
    }

    /// The raw 32-byte secret seed, for contexts (like an invite payload)
    /// that must hand the whole keypair to another party out of band.
    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    /// Signs the rkyv-archived bytes of `payload`, returning the signer's
    /// replica id alongside the bytes and signature.
    pub fn sign<P>(self, payload: &P) -> Signed
    where
        P: Serialize<AllocSerializer<256>>,
    {
        let mut ser = AllocSerializer::<256>::default();
        ser.serialize_value(payload)
            .expect("in-memory serialization cannot fail");
        let payload = ser.into_serializer().into_inner().to_vec();
        self.sign_bytes(payload)
    }

    /// Signs raw bytes directly, for formats (like the CBOR capability
    /// token claims) that aren't rkyv-archived.
    pub fn sign_bytes(self, payload: Vec<u8>) -> Signed {
        let keypair = self.to_keypair();
        let sig = keypair.sign(&payload).to_bytes();
        let replica_id = ReplicaId::new(keypair.public.to_bytes());
        Signed {
            payload,
            replica_id,
            sig,
        }
    }
}

#[derive(Clone, Archive, CheckBytes, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct Signed {
    pub payload: Vec<u8>,
    pub replica_id: ReplicaId,
    pub sig: [u8; 64],
}

impl Signed {
    pub fn verify_bytes(&self) -> Result<()> {
        let public = PublicKey::from_bytes(self.replica_id.as_ref())?;
        let sig = Signature::from(self.sig);
        public.verify(&self.payload[..], &sig)?;
        Ok(())
    }
}

impl ArchivedSigned {
    /// Verifies the signature, then returns a reference to the archived
    /// payload of type `P`. Callers must validate the archived payload
    /// themselves if it didn't come with `bytecheck` validation already
    /// applied to this envelope.
    pub fn verify<'a, P>(&'a self) -> Result<(ReplicaId, &'a Archived<P>)>
    where
        P: Archive,
        Archived<P>: CheckBytes<DefaultValidator<'a>>,
    {
        let public = PublicKey::from_bytes(self.replica_id.as_ref())?;
        let sig = Signature::from(self.sig);
        public.verify(&self.payload[..], &sig)?;
        let payload = rkyv::check_archived_root::<P>(&self.payload[..])
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok((self.replica_id, payload))
    }
}
