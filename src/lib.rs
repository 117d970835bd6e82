//! # arbor
//!
//! A peer-to-peer tree CRDT with an authenticated, bandwidth-efficient sync
//! protocol. [`arbor_core`] owns the tree engine, op log backend trait, and
//! capability machinery; this crate wires a concrete [`SledBackend`] and a
//! [`Transport`] together into a running [`Replica`] that other replicas
//! can sync with over [`SyncSession`].
#![deny(missing_docs)]

mod config;
mod error;
mod identity;
mod invite;
mod sync;
mod transport;

pub use arbor_core::{
    Action, AppliedEffect, AuthError, Authorizer, CapabilityToken, Claims, Filter, Keypair,
    Lamport, NodeId, Op, OpAuth, OpId, OpKind, OpMeta, OpRef, PendingOp, PendingReason, ReplicaId,
    ScopeDecision, ScopeEvaluator, SledBackend, TokenId, TreeError, TreeScopeEvaluator,
};
pub use crate::config::Config;
pub use crate::error::SyncError;
pub use crate::identity::{IdentityCert, IdentityChain};
pub use crate::invite::Invite;
pub use crate::sync::{SubscribeOpts, Subscription, SyncSession, WireFilter, WireMessage};
pub use crate::transport::{InMemoryTransport, Transport};

use anyhow::Result;
use arbor_core::{Backend, TreeEngine};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// One document's live state on one replica: the materialized tree, its
/// durable op log, capability authorization, and the signing key sync
/// sessions use to prove authorship of new ops.
///
/// Cheaply cloneable — every field is shared behind an `Arc`, so several
/// [`SyncSession`]s (one per peer connection) can run concurrently against
/// the same replica.
#[derive(Clone)]
pub struct Replica {
    doc_id: Vec<u8>,
    keypair: Keypair,
    backend: Arc<dyn Backend>,
    tree: Arc<Mutex<TreeEngine>>,
    authorizer: Arc<Mutex<Authorizer>>,
    lamport: Arc<Mutex<Lamport>>,
    held_tokens: Arc<Mutex<Vec<CapabilityToken>>>,
    next_counter: Arc<Mutex<u64>>,
    config: Config,
}

impl Replica {
    /// Opens (or creates) one document's state in `db`, installing the
    /// same tracing and panic-logging setup every binary built on this
    /// crate uses.
    pub fn new(
        db: sled::Db,
        doc_id: Vec<u8>,
        keypair: Keypair,
        trusted_issuers: HashSet<ReplicaId>,
    ) -> Result<Self> {
        init_tracing();
        let backend: Arc<dyn Backend> = Arc::new(SledBackend::new(&db, &doc_id)?);
        Ok(Self {
            doc_id,
            keypair,
            backend,
            tree: Arc::new(Mutex::new(TreeEngine::new())),
            authorizer: Arc::new(Mutex::new(Authorizer::new(trusted_issuers))),
            lamport: Arc::new(Mutex::new(Lamport::default())),
            held_tokens: Arc::new(Mutex::new(Vec::new())),
            next_counter: Arc::new(Mutex::new(0)),
            config: Config::default(),
        })
    }

    /// A replica backed by a temporary, process-local sled database — for
    /// tests and scratch sessions that don't need to survive a restart.
    pub fn memory(
        doc_id: Vec<u8>,
        keypair: Keypair,
        trusted_issuers: HashSet<ReplicaId>,
    ) -> Result<Self> {
        Self::new(
            sled::Config::new().temporary(true).open()?,
            doc_id,
            keypair,
            trusted_issuers,
        )
    }

    /// Replaces the session tuning this replica hands to every
    /// [`SyncSession`] it builds.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// This replica's signing identity.
    pub fn replica_id(&self) -> ReplicaId {
        self.keypair.replica_id()
    }

    /// The document this replica holds state for.
    pub fn doc_id(&self) -> &[u8] {
        &self.doc_id
    }

    /// Adds a capability token this replica presents to peers during the
    /// sync handshake, proving what it's allowed to read or write, and
    /// remembers it for locally evaluating others' ops too.
    pub fn hold_token(&self, token: CapabilityToken) {
        self.authorizer
            .lock()
            .expect("authorizer mutex poisoned")
            .remember(token.clone());
        self.held_tokens
            .lock()
            .expect("held token list mutex poisoned")
            .push(token);
    }

    /// Stops honoring a previously remembered token, by id.
    pub fn revoke_token(&self, id: TokenId) {
        self.authorizer
            .lock()
            .expect("authorizer mutex poisoned")
            .revoke(id);
    }

    /// The ids of `node`'s current children, by winning parent edge.
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.tree.lock().expect("tree mutex poisoned").children(node)
    }

    /// `node`'s current winning parent, if it's known at all.
    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.tree.lock().expect("tree mutex poisoned").parent_of(node)
    }

    /// `node`'s current payload, if any.
    pub fn payload_of(&self, node: NodeId) -> Option<Vec<u8>> {
        self.tree.lock().expect("tree mutex poisoned").payload_of(node)
    }

    /// Whether `node` has been materialized by any op this replica has
    /// seen.
    pub fn is_known(&self, node: NodeId) -> bool {
        self.tree.lock().expect("tree mutex poisoned").is_known(&node)
    }

    /// Signs and applies one local edit directly to this replica's tree
    /// and backend, without going through a sync session. `proof_ref`
    /// should name a token this replica holds authorizing `kind`'s node.
    pub async fn apply_local(
        &self,
        kind: OpKind,
        proof_ref: Option<TokenId>,
    ) -> Result<Op> {
        let counter = {
            let mut next = self.next_counter.lock().expect("counter mutex poisoned");
            let counter = *next;
            *next += 1;
            counter
        };
        let lamport = self.lamport.lock().expect("lamport mutex poisoned").tick();
        let meta = OpMeta {
            id: OpId {
                replica: self.replica_id(),
                counter,
            },
            lamport,
        };
        let unsigned = Op {
            meta: meta.clone(),
            kind: kind.clone(),
            auth: None,
        };
        let auth = proof_ref.map(|r| {
            let signed = self.keypair.sign_bytes(unsigned.signing_bytes());
            OpAuth {
                signature: signed.sig,
                proof_ref: *r.as_bytes(),
            }
        });
        let op = Op { meta, kind, auth };
        self.tree.lock().expect("tree mutex poisoned").append(&op)?;
        self.backend.apply_ops(&self.doc_id, &[op.clone()]).await?;
        Ok(op)
    }

    /// Builds a [`SyncSession`] over `transport`, sharing this replica's
    /// tree, backend, authorizer, and lamport clock so every session's
    /// effects are visible to every other.
    pub fn sync_session(&self, transport: Box<dyn Transport>) -> SyncSession {
        SyncSession::new(
            transport,
            self.backend.clone(),
            self.tree.clone(),
            self.authorizer.clone(),
            self.lamport.clone(),
            self.doc_id.clone(),
            self.replica_id(),
            self.held_tokens
                .lock()
                .expect("held token list mutex poisoned")
                .clone(),
            self.config.clone(),
        )
    }
}

fn init_tracing() {
    tracing_log::LogTracer::init().ok();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_span_events(FmtSpan::ACTIVE | FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
}
