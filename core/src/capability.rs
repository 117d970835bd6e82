//! Capability tokens and op authorization.
//!
//! A token is a CWT-shaped claim set (issuer, audience, subject public key,
//! scope, action list, expiry) CBOR-encoded and Ed25519-signed — the same
//! "serialize claims, sign the bytes" shape COSE_Sign1 describes, hand
//! rolled here since no COSE crate is part of this codebase's dependency
//! stack. `TokenId` is the content hash of the signed bytes.

use crate::crypto::Keypair;
use crate::ids::{NodeId, ReplicaId, TokenId};
use crate::tree::TreeEngine;
use anyhow::{anyhow, Result};
use ed25519_dalek::{PublicKey, Signature, Verifier};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Actions a capability token can grant over a subtree.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Action {
    ReadStructure,
    ReadPayload,
    WriteStructure,
    WritePayload,
    Delete,
    Tombstone,
    Grant,
}

/// The signed claim set. `scope` is the subtree root the token's actions
/// apply to; ops outside that subtree never match, regardless of action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub issuer: ReplicaId,
    /// `aud` — the id of the document this token is scoped to. A token
    /// minted for one document never authorizes ops against another,
    /// regardless of how permissive its scope/action list is.
    pub audience: Vec<u8>,
    /// `cnf.pub` — the public key the holder must sign ops with.
    pub subject: ReplicaId,
    pub scope: NodeId,
    pub actions: Vec<Action>,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl Claims {
    fn to_cbor(&self) -> Vec<u8> {
        serde_cbor::to_vec(self).expect("claim set is always representable in CBOR")
    }
}

/// A capability token: signed claims plus the signature and an optional
/// identity chain establishing the issuer's own authority when the issuer
/// is not the document's root keypair.
#[derive(Clone, Debug)]
pub struct CapabilityToken {
    pub claims: Claims,
    pub signature: [u8; 64],
    /// Each entry certifies the previous issuer's right to issue, up to a
    /// document's root keypair. Empty when `claims.issuer` is the root.
    pub identity_chain: Vec<CapabilityToken>,
}

impl CapabilityToken {
    /// Issues and signs a new token.
    pub fn issue(issuer: Keypair, claims: Claims) -> Self {
        let bytes = claims.to_cbor();
        let signed = issuer.sign_bytes(bytes);
        CapabilityToken {
            claims,
            signature: signed.sig,
            identity_chain: Vec::new(),
        }
    }

    pub fn id(&self) -> TokenId {
        TokenId::derive(&self.claims.to_cbor())
    }

    /// Verifies the signature against `claims.issuer`. Does not check
    /// expiry, scope, or issuer trust — callers combine this with
    /// [`Authorizer::decide`] for the full contract.
    pub fn verify_signature(&self) -> Result<()> {
        let public = PublicKey::from_bytes(self.claims.issuer.as_ref())
            .map_err(|e| anyhow!("malformed issuer key: {}", e))?;
        let sig = Signature::from(self.signature);
        public
            .verify(&self.claims.to_cbor(), &sig)
            .map_err(|_| anyhow!("token signature does not verify"))
    }

    fn is_expired(&self, now: u64) -> bool {
        now >= self.claims.expires_at
    }

    /// Packs the token (claims, signature, and identity chain) into a
    /// self-contained byte string, for contexts like an invite payload
    /// that need to carry a token without separately serde-deriving this
    /// type (its `[u8; 64]` signature is wider than serde's blanket array
    /// support).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let claims_bytes = self.claims.to_cbor();
        out.extend_from_slice(&(claims_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&claims_bytes);
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&(self.identity_chain.len() as u32).to_be_bytes());
        for cert in &self.identity_chain {
            let cert_bytes = cert.to_bytes();
            out.extend_from_slice(&(cert_bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(&cert_bytes);
        }
        out
    }

    /// Inverse of [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let claims_len = take_u32(&mut cursor)? as usize;
        let claims_bytes = take_n(&mut cursor, claims_len)?;
        let claims: Claims = serde_cbor::from_slice(claims_bytes)?;
        let sig_bytes = take_n(&mut cursor, 64)?;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(sig_bytes);
        let chain_len = take_u32(&mut cursor)? as usize;
        let mut identity_chain = Vec::with_capacity(chain_len);
        for _ in 0..chain_len {
            let cert_len = take_u32(&mut cursor)? as usize;
            let cert_bytes = take_n(&mut cursor, cert_len)?;
            identity_chain.push(CapabilityToken::from_bytes(cert_bytes)?);
        }
        Ok(CapabilityToken {
            claims,
            signature,
            identity_chain,
        })
    }
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32> {
    let bytes = take_n(cursor, 4)?;
    Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
}

fn take_n<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if cursor.len() < n {
        return Err(anyhow!("truncated capability token bytes"));
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

/// The result of asking whether an action on a node is covered by a set of
/// held tokens. `Unknown` means the answer depends on ancestry this replica
/// hasn't received yet — the op belongs in the pending-context quarantine,
/// not rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScopeDecision {
    Allow,
    Deny,
    Unknown,
}

/// Decides whether an action on a node is in scope for a token. The
/// default implementation walks a node's ancestor chain in a
/// [`TreeEngine`] looking for the token's scope root; pluggable so callers
/// backed by a different materialized-tree representation can supply their
/// own walk.
pub trait ScopeEvaluator {
    fn in_scope(&self, node: NodeId, scope_root: NodeId) -> ScopeDecision;
}

/// Walks ancestors via a [`TreeEngine`]'s materialized parent pointers.
pub struct TreeScopeEvaluator<'a> {
    pub tree: &'a TreeEngine,
}

impl<'a> ScopeEvaluator for TreeScopeEvaluator<'a> {
    fn in_scope(&self, node: NodeId, scope_root: NodeId) -> ScopeDecision {
        if node == scope_root {
            return ScopeDecision::Allow;
        }
        let mut current = node;
        loop {
            if !self.tree.is_known(&current) {
                return ScopeDecision::Unknown;
            }
            let parent = match self.tree.parent_of(current) {
                Some(p) => p,
                None => return ScopeDecision::Unknown,
            };
            if parent == scope_root {
                return ScopeDecision::Allow;
            }
            if parent.is_root() || parent.is_trash() {
                return ScopeDecision::Deny;
            }
            current = parent;
        }
    }
}

/// Holds the tokens a replica has received, the issuers it trusts, and an
/// explicit hard-revocation list, and decides whether an op is authorized.
pub struct Authorizer {
    tokens_by_id: std::collections::HashMap<TokenId, CapabilityToken>,
    trusted_issuers: HashSet<ReplicaId>,
    revoked: HashSet<TokenId>,
}

impl Authorizer {
    pub fn new(trusted_issuers: HashSet<ReplicaId>) -> Self {
        Self {
            tokens_by_id: std::collections::HashMap::new(),
            trusted_issuers,
            revoked: HashSet::new(),
        }
    }

    pub fn remember(&mut self, token: CapabilityToken) {
        self.tokens_by_id.insert(token.id(), token);
    }

    pub fn revoke(&mut self, id: TokenId) {
        self.revoked.insert(id);
    }

    /// Whether any held, non-revoked, trusted token grants `subject` the
    /// given action over exactly `scope_root` within `doc_id`. Used by the
    /// sync handshake to decide whether to accept a filter before any
    /// per-op, per-node scope walk is possible.
    pub fn grants(
        &self,
        doc_id: &[u8],
        subject: ReplicaId,
        action: Action,
        scope_root: NodeId,
        now: u64,
    ) -> bool {
        self.tokens_by_id.values().any(|token| {
            !self.revoked.contains(&token.id())
                && self.issuer_trusted(token)
                && !token.is_expired(now)
                && token.claims.audience == doc_id
                && token.claims.subject == subject
                && token.claims.scope == scope_root
                && token.claims.actions.contains(&action)
        })
    }

    /// Whether `token` traces back to a trusted issuer, either directly or
    /// through a verified `identity_chain`: each link's own signature must
    /// verify and must vouch for the issuer one step closer to `token`,
    /// forming an unbroken chain up to a trusted root.
    fn issuer_trusted(&self, token: &CapabilityToken) -> bool {
        if token.verify_signature().is_err() {
            return false;
        }
        if self.trusted_issuers.contains(&token.claims.issuer) {
            return true;
        }
        let mut expected_subject = token.claims.issuer;
        for cert in &token.identity_chain {
            if cert.claims.subject != expected_subject || cert.verify_signature().is_err() {
                return false;
            }
            if self.trusted_issuers.contains(&cert.claims.issuer) {
                return true;
            }
            expected_subject = cert.claims.issuer;
        }
        false
    }

    /// Decides whether `signer` may perform `action` on `node` within
    /// `doc_id`, given the `proof_ref` token id an op claims to be
    /// authorized by.
    pub fn decide(
        &self,
        evaluator: &dyn ScopeEvaluator,
        doc_id: &[u8],
        signer: ReplicaId,
        action: Action,
        node: NodeId,
        proof_ref: TokenId,
        now: u64,
    ) -> Result<(), crate::error::AuthError> {
        let token = self
            .tokens_by_id
            .get(&proof_ref)
            .ok_or(crate::error::AuthError::UnknownProofRef)?;
        if self.revoked.contains(&proof_ref) {
            return Err(crate::error::AuthError::Revoked);
        }
        if !self.issuer_trusted(token) {
            return Err(crate::error::AuthError::TokenIssuerUnknown);
        }
        if token.is_expired(now) {
            return Err(crate::error::AuthError::TokenExpired);
        }
        if token.claims.audience != doc_id {
            return Err(crate::error::AuthError::AudienceMismatch);
        }
        if token.claims.subject != signer {
            return Err(crate::error::AuthError::InvalidSignature);
        }
        if !token.claims.actions.contains(&action) {
            return Err(crate::error::AuthError::InsufficientCapability);
        }
        match evaluator.in_scope(node, token.claims.scope) {
            ScopeDecision::Allow => Ok(()),
            ScopeDecision::Deny => Err(crate::error::AuthError::ScopeViolation),
            ScopeDecision::Unknown => Err(crate::error::AuthError::PendingContext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{Lamport, OpId};
    use crate::op::{Op, OpKind, OpMeta};

    const DOC: &[u8] = b"doc-under-test";

    fn claims_for(issuer: ReplicaId, subject: ReplicaId, scope: NodeId) -> Claims {
        Claims {
            issuer,
            audience: DOC.to_vec(),
            subject,
            scope,
            actions: vec![Action::WriteStructure],
            issued_at: 0,
            expires_at: 1000,
        }
    }

    #[test]
    fn token_signature_round_trips() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate();
        let claims = claims_for(issuer.replica_id(), subject.replica_id(), NodeId::ROOT);
        let token = CapabilityToken::issue(issuer, claims);
        token.verify_signature().unwrap();
    }

    #[test]
    fn token_bytes_round_trip_preserves_signature_validity() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate();
        let claims = claims_for(issuer.replica_id(), subject.replica_id(), NodeId::ROOT);
        let token = CapabilityToken::issue(issuer, claims);
        let bytes = token.to_bytes();
        let parsed = CapabilityToken::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id(), token.id());
        parsed.verify_signature().unwrap();
    }

    #[test]
    fn tampered_claims_fail_verification() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate();
        let claims = claims_for(issuer.replica_id(), subject.replica_id(), NodeId::ROOT);
        let mut token = CapabilityToken::issue(issuer, claims);
        token.claims.expires_at += 1;
        assert!(token.verify_signature().is_err());
    }

    #[test]
    fn untrusted_issuer_is_rejected() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate();
        let mut auth = Authorizer::new(HashSet::new()); // issuer not trusted
        let claims = claims_for(issuer.replica_id(), subject.replica_id(), NodeId::ROOT);
        let token = CapabilityToken::issue(issuer, claims);
        let id = token.id();
        auth.remember(token);
        let tree = TreeEngine::new();
        let evaluator = TreeScopeEvaluator { tree: &tree };
        let err = auth
            .decide(
                &evaluator,
                DOC,
                subject.replica_id(),
                Action::WriteStructure,
                NodeId::ROOT,
                id,
                0,
            )
            .unwrap_err();
        assert_eq!(err, crate::error::AuthError::TokenIssuerUnknown);
    }

    #[test]
    fn a_token_scoped_to_another_document_is_rejected() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate();
        let mut trusted = HashSet::new();
        trusted.insert(issuer.replica_id());
        let mut auth = Authorizer::new(trusted);
        let claims = claims_for(issuer.replica_id(), subject.replica_id(), NodeId::ROOT);
        let token = CapabilityToken::issue(issuer, claims);
        let id = token.id();
        auth.remember(token);
        let tree = TreeEngine::new();
        let evaluator = TreeScopeEvaluator { tree: &tree };
        let err = auth
            .decide(
                &evaluator,
                b"some-other-doc",
                subject.replica_id(),
                Action::WriteStructure,
                NodeId::ROOT,
                id,
                0,
            )
            .unwrap_err();
        assert_eq!(err, crate::error::AuthError::AudienceMismatch);
    }

    #[test]
    fn a_valid_identity_chain_extends_trust_to_its_root() {
        let root = Keypair::generate();
        let delegate = Keypair::generate();
        let subject = Keypair::generate();
        let mut trusted = HashSet::new();
        trusted.insert(root.replica_id());
        let mut auth = Authorizer::new(trusted);

        let vouch_claims = claims_for(root.replica_id(), delegate.replica_id(), NodeId::ROOT);
        let vouch = CapabilityToken::issue(root, vouch_claims);
        let leaf_claims = claims_for(delegate.replica_id(), subject.replica_id(), NodeId::ROOT);
        let mut leaf = CapabilityToken::issue(delegate, leaf_claims);
        leaf.identity_chain.push(vouch);
        let id = leaf.id();
        auth.remember(leaf);

        let tree = TreeEngine::new();
        let evaluator = TreeScopeEvaluator { tree: &tree };
        auth.decide(
            &evaluator,
            DOC,
            subject.replica_id(),
            Action::WriteStructure,
            NodeId::ROOT,
            id,
            0,
        )
        .unwrap();
    }

    #[test]
    fn an_identity_chain_link_with_a_forged_signature_is_not_trusted() {
        let root = Keypair::generate();
        let delegate = Keypair::generate();
        let subject = Keypair::generate();
        let mut trusted = HashSet::new();
        trusted.insert(root.replica_id());
        let mut auth = Authorizer::new(trusted);

        let vouch_claims = claims_for(root.replica_id(), delegate.replica_id(), NodeId::ROOT);
        let mut vouch = CapabilityToken::issue(root, vouch_claims);
        vouch.signature[0] ^= 0xff;

        let leaf_claims = claims_for(delegate.replica_id(), subject.replica_id(), NodeId::ROOT);
        let mut leaf = CapabilityToken::issue(delegate, leaf_claims);
        leaf.identity_chain.push(vouch);
        let id = leaf.id();
        auth.remember(leaf);

        let tree = TreeEngine::new();
        let evaluator = TreeScopeEvaluator { tree: &tree };
        let err = auth
            .decide(
                &evaluator,
                DOC,
                subject.replica_id(),
                Action::WriteStructure,
                NodeId::ROOT,
                id,
                0,
            )
            .unwrap_err();
        assert_eq!(err, crate::error::AuthError::TokenIssuerUnknown);
    }

    #[test]
    fn scope_allows_direct_children_and_denies_unrelated_nodes() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate();
        let mut trusted = HashSet::new();
        trusted.insert(issuer.replica_id());
        let mut auth = Authorizer::new(trusted);

        let mut tree = TreeEngine::new();
        let scoped_root = NodeId::new([1; 16]);
        let child = NodeId::new([2; 16]);
        let outsider = NodeId::new([3; 16]);
        tree.append(&Op {
            meta: OpMeta {
                id: OpId {
                    replica: ReplicaId::new([9; 32]),
                    counter: 1,
                },
                lamport: Lamport(1),
            },
            kind: OpKind::Insert {
                parent: NodeId::ROOT,
                node: scoped_root,
                order_key: vec![1],
                payload: None,
            },
            auth: None,
        })
        .unwrap();
        tree.append(&Op {
            meta: OpMeta {
                id: OpId {
                    replica: ReplicaId::new([9; 32]),
                    counter: 2,
                },
                lamport: Lamport(2),
            },
            kind: OpKind::Insert {
                parent: scoped_root,
                node: child,
                order_key: vec![1],
                payload: None,
            },
            auth: None,
        })
        .unwrap();

        let claims = claims_for(issuer.replica_id(), subject.replica_id(), scoped_root);
        let token = CapabilityToken::issue(issuer, claims);
        let id = token.id();
        auth.remember(token);
        let evaluator = TreeScopeEvaluator { tree: &tree };

        auth.decide(
            &evaluator,
            DOC,
            subject.replica_id(),
            Action::WriteStructure,
            child,
            id,
            0,
        )
        .unwrap();

        let err = auth
            .decide(
                &evaluator,
                DOC,
                subject.replica_id(),
                Action::WriteStructure,
                outsider,
                id,
                0,
            )
            .unwrap_err();
        assert_eq!(err, crate::error::AuthError::PendingContext);
    }
}
