//! Three-level identity chain binding a long-term identity to a device
//! and to a per-document replica key.
//!
//! Without a chain, attribution stops at the bare `replica_pk` and is
//! unlinkable across documents; a chain lets a verifier walk back up to
//! the identity that ultimately authorized the replica key.

use anyhow::{anyhow, Result};
use arbor_core::{Keypair, ReplicaId};
use ed25519_dalek::{PublicKey, Signature, Verifier};

/// One link: `issuer` vouches for `subject` by signing its raw bytes.
#[derive(Clone, Debug)]
pub struct IdentityCert {
    pub issuer: ReplicaId,
    pub subject: ReplicaId,
    pub signature: [u8; 64],
}

impl IdentityCert {
    pub fn issue(issuer: Keypair, subject: ReplicaId) -> Self {
        let signed = issuer.sign_bytes(subject.as_ref().to_vec());
        Self {
            issuer: signed.replica_id,
            subject,
            signature: signed.sig,
        }
    }

    pub fn verify(&self) -> Result<()> {
        let public = PublicKey::from_bytes(self.issuer.as_ref())
            .map_err(|e| anyhow!("malformed issuer key: {}", e))?;
        let sig = Signature::from(self.signature);
        public
            .verify(self.subject.as_ref(), &sig)
            .map_err(|_| anyhow!("identity cert does not verify"))
    }
}

/// `identity_pk → device_pk → replica_pk`, each link a cert signed by the
/// previous key in the chain.
#[derive(Clone, Debug)]
pub struct IdentityChain {
    pub identity: ReplicaId,
    pub device: IdentityCert,
    pub replica: IdentityCert,
}

impl IdentityChain {
    /// Builds a chain from the three keypairs, signing each link with its
    /// parent.
    pub fn build(identity: Keypair, device: Keypair, replica: Keypair) -> Self {
        let device_cert = IdentityCert::issue(identity, device.replica_id());
        let replica_cert = IdentityCert::issue(device, replica.replica_id());
        Self {
            identity: identity.replica_id(),
            device: device_cert,
            replica: replica_cert,
        }
    }

    /// Verifies both links and that they chain together, returning the
    /// long-term identity the replica key is ultimately attributed to.
    pub fn verify(&self, replica: ReplicaId) -> Result<ReplicaId> {
        if self.device.issuer != self.identity {
            return Err(anyhow!("device cert not issued by the claimed identity"));
        }
        self.device.verify()?;
        if self.replica.issuer != self.device.subject {
            return Err(anyhow!("replica cert not issued by the claimed device"));
        }
        if self.replica.subject != replica {
            return Err(anyhow!("replica cert subject does not match the signer"));
        }
        self.replica.verify()?;
        Ok(self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_well_formed_chain_verifies_and_attributes_to_the_identity() {
        let identity = Keypair::generate();
        let device = Keypair::generate();
        let replica = Keypair::generate();
        let identity_id = identity.replica_id();
        let chain = IdentityChain::build(identity, device, replica);
        assert_eq!(chain.verify(replica.replica_id()).unwrap(), identity_id);
    }

    #[test]
    fn a_substituted_replica_key_fails_verification() {
        let identity = Keypair::generate();
        let device = Keypair::generate();
        let replica = Keypair::generate();
        let chain = IdentityChain::build(identity, device, replica);
        let impostor = Keypair::generate();
        assert!(chain.verify(impostor.replica_id()).is_err());
    }
}
