//! The sync session: a capability-gated handshake, progressive rateless
//! reconciliation over `OpRef`s, and authenticated streaming of the ops
//! each side is missing, all driven over one [`Transport`].
//!
//! One [`SyncSession`] handles both roles — [`SyncSession::sync_once`] and
//! [`SyncSession::subscribe`] drive the initiating side,
//! [`SyncSession::respond`] drives the accepting side — so the wire format
//! only needs to be read from one place to understand either direction.

use crate::config::Config;
use crate::error::SyncError;
use crate::transport::Transport;
use arbor_core::{
    Action, Authorizer, Backend, CapabilityToken, Filter, Lamport, NodeId, Op, OpAuth, OpKind,
    OpRef, PendingOp, PendingReason, ReplicaId, SketchDecoder, SketchEncoder, TokenId, TreeEngine,
    TreeScopeEvaluator, WireCodeword,
};
use bytecheck::CheckBytes;
use futures::channel::oneshot;
use futures::future::{select, BoxFuture, Either};
use futures_timer::Delay;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Wire-format mirror of [`Filter`] — `Filter` itself isn't rkyv-archived
/// since it has no business being a storage format, only a wire one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Archive, CheckBytes, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes, Debug))]
#[repr(C)]
pub enum WireFilter {
    All,
    Children(NodeId),
}

impl From<Filter> for WireFilter {
    fn from(f: Filter) -> Self {
        match f {
            Filter::All => WireFilter::All,
            Filter::Children(p) => WireFilter::Children(p),
        }
    }
}

impl From<WireFilter> for Filter {
    fn from(f: WireFilter) -> Self {
        match f {
            WireFilter::All => Filter::All,
            WireFilter::Children(p) => Filter::Children(p),
        }
    }
}

/// Every message shape the protocol exchanges. Reuses the already-archived
/// [`Op`], [`OpRef`], [`ReplicaId`] types directly rather than re-deriving
/// wire copies of them.
#[derive(Debug, Archive, CheckBytes, Deserialize, Serialize)]
#[archive_attr(derive(Debug, CheckBytes))]
#[repr(C)]
pub enum WireMessage {
    Hello {
        doc_id: Vec<u8>,
        replica: ReplicaId,
        filters: Vec<WireFilter>,
        max_lamport: u64,
        capabilities: Vec<Vec<u8>>,
    },
    HelloAck {
        accepted: Vec<WireFilter>,
        rejected: Vec<WireFilter>,
        capabilities: Vec<Vec<u8>>,
    },
    /// `full_refs` is `Some` once the sketch exchange has given up on
    /// converging within `max_codewords` codewords and the initiator falls
    /// back to a complete listing; `codewords` is empty in that case.
    SyncRequest {
        filter: WireFilter,
        codewords: Vec<[u8; 24]>,
        full_refs: Option<Vec<OpRef>>,
    },
    /// `complete = false` means the decoding side hasn't converged yet and
    /// both ref lists are empty — the initiator should send another round
    /// of codewords (or fall back to `full_refs`).
    SyncDelta {
        needed: Vec<OpRef>,
        available: Vec<OpRef>,
        complete: bool,
    },
    OpBatch {
        ops: Vec<Op>,
    },
    OpBatchAck {
        count: u32,
    },
    UpdatePing,
    Cancel {
        sub_id: u32,
    },
    Error {
        code: u16,
        message: String,
    },
}

impl WireMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ser = rkyv::ser::serializers::AllocSerializer::<1024>::default();
        use rkyv::ser::Serializer;
        ser.serialize_value(self)
            .expect("in-memory serialization cannot fail");
        ser.into_serializer().into_inner().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let archived = rkyv::check_archived_root::<WireMessage>(bytes)
            .map_err(|e| SyncError::MalformedMessage(e.to_string()))?;
        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|_: std::convert::Infallible| {
                SyncError::MalformedMessage("unreachable: rkyv::Infallible cannot fail".into())
            })
    }
}

fn protocol_error(msg: WireMessage, expected: &str) -> SyncError {
    match msg {
        WireMessage::Error { code, message } => {
            SyncError::ProtocolViolation(format!("remote reported error {}: {}", code, message))
        }
        WireMessage::Cancel { .. } => SyncError::Cancelled,
        other => SyncError::ProtocolViolation(format!("expected {}, got {:?}", expected, other)),
    }
}

fn backend_err(e: anyhow::Error) -> SyncError {
    SyncError::BackendError(e.to_string())
}

fn required_actions(kind: &OpKind) -> Vec<Action> {
    match kind {
        OpKind::Insert { payload: Some(_), .. } => {
            vec![Action::WriteStructure, Action::WritePayload]
        }
        OpKind::Insert { .. } => vec![Action::WriteStructure],
        OpKind::Move { .. } => vec![Action::WriteStructure],
        OpKind::Delete { .. } => vec![Action::Delete],
        OpKind::Payload { .. } => vec![Action::WritePayload],
    }
}

/// Verifies `auth.signature` covers `op.signing_bytes()` under the public
/// key `op.meta.id.replica` claims — the binding that lets a `proof_ref`
/// checked against the *claimed* signer actually mean something.
fn verify_op_signature(op: &Op, auth: &OpAuth) -> Result<(), arbor_core::AuthError> {
    let public = ed25519_dalek::PublicKey::from_bytes(op.meta.id.replica.as_ref())
        .map_err(|_| arbor_core::AuthError::InvalidSignature)?;
    let sig = ed25519_dalek::Signature::from(auth.signature);
    ed25519_dalek::Verifier::verify(&public, &op.signing_bytes(), &sig)
        .map_err(|_| arbor_core::AuthError::InvalidSignature)
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Options for [`SyncSession::subscribe`].
#[derive(Clone, Copy, Debug)]
pub struct SubscribeOpts {
    /// Run one reconcile-and-catch-up pass before settling into the
    /// push-listening loop.
    pub immediate: bool,
}

impl Default for SubscribeOpts {
    fn default() -> Self {
        Self { immediate: true }
    }
}

/// Lets a caller end a live [`Subscription`] from outside its driving
/// future.
pub struct StopHandle(oneshot::Sender<()>);

impl StopHandle {
    /// Requests cancellation. The subscription resolves with
    /// [`SyncError::Cancelled`] once the remote has been told.
    pub fn stop(self) {
        let _ = self.0.send(());
    }
}

/// A running subscription: `done` resolves once the session ends, whether
/// by remote close, error, or a `stop()` call.
pub struct Subscription {
    pub sub_id: u32,
    pub done: BoxFuture<'static, Result<(), SyncError>>,
    pub stop: StopHandle,
}

/// Drives one side of the sync protocol for one document over one
/// transport. Holds shared document state behind `Arc<Mutex<_>>` so
/// several sessions (concurrent peers) can run against the same replica.
pub struct SyncSession {
    transport: Box<dyn Transport>,
    backend: Arc<dyn Backend>,
    tree: Arc<Mutex<TreeEngine>>,
    authorizer: Arc<Mutex<Authorizer>>,
    /// Shared with [`crate::Replica`] so ops observed from a peer advance
    /// the clock new local ops are stamped with, even across sessions.
    lamport: Arc<Mutex<Lamport>>,
    doc_id: Vec<u8>,
    local_replica: ReplicaId,
    held_tokens: Vec<CapabilityToken>,
    config: Config,
    next_sub_id: u32,
}

impl SyncSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Box<dyn Transport>,
        backend: Arc<dyn Backend>,
        tree: Arc<Mutex<TreeEngine>>,
        authorizer: Arc<Mutex<Authorizer>>,
        lamport: Arc<Mutex<Lamport>>,
        doc_id: Vec<u8>,
        local_replica: ReplicaId,
        held_tokens: Vec<CapabilityToken>,
        config: Config,
    ) -> Self {
        Self {
            transport,
            backend,
            tree,
            authorizer,
            lamport,
            doc_id,
            local_replica,
            held_tokens,
            config,
            next_sub_id: 0,
        }
    }

    /// Runs one reconcile-and-catch-up round for `filter` as the
    /// initiating side, then returns.
    pub async fn sync_once(&mut self, filter: Filter) -> Result<(), SyncError> {
        let accepted = self.hello_as_initiator(&[filter]).await?;
        if accepted.is_empty() {
            return Err(SyncError::ProtocolViolation(
                "remote accepted no filters".into(),
            ));
        }
        let (needed, available) = self.reconcile_as_initiator(filter).await?;
        self.exchange_missing_ops(needed, available).await
    }

    /// Starts a long-lived subscription as the initiating side: an
    /// optional immediate reconcile, then an indefinite wait for pushed
    /// `OpBatch`es until the remote closes, errors, or `stop()` is called.
    pub fn subscribe(mut self, filter: Filter, opts: SubscribeOpts) -> Subscription {
        let sub_id = self.next_sub_id;
        self.next_sub_id += 1;
        let (stop_tx, stop_rx) = oneshot::channel();
        let done: BoxFuture<'static, Result<(), SyncError>> =
            Box::pin(self.drive_subscription(sub_id, filter, opts, stop_rx));
        Subscription {
            sub_id,
            done,
            stop: StopHandle(stop_tx),
        }
    }

    /// Accepts one incoming session as the responding side: handshake,
    /// reconcile, then the symmetric op exchange.
    pub async fn respond(&mut self) -> Result<(), SyncError> {
        let (doc_id, replica, filters, capabilities) = match self.recv_with_timeout().await? {
            WireMessage::Hello {
                doc_id,
                replica,
                filters,
                capabilities,
                ..
            } => (doc_id, replica, filters, capabilities),
            other => return Err(protocol_error(other, "Hello")),
        };
        if doc_id != self.doc_id {
            self.send(WireMessage::Error {
                code: 404,
                message: "unknown document".into(),
            })
            .await
            .ok();
            return Err(SyncError::ProtocolViolation(
                "hello named an unknown document".into(),
            ));
        }
        self.remember_remote_capabilities(&capabilities);

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for filter in filters {
            if self.filter_authorized(replica, filter) {
                accepted.push(filter);
            } else {
                rejected.push(filter);
            }
        }
        let my_capabilities = self.held_tokens.iter().map(|t| t.to_bytes()).collect();
        self.send(WireMessage::HelloAck {
            accepted: accepted.clone(),
            rejected,
            capabilities: my_capabilities,
        })
        .await?;
        let filter = match accepted.first() {
            Some(f) => (*f).into(),
            None => {
                return Err(SyncError::ProtocolViolation(
                    "no filter accepted: UNAUTHORIZED".into(),
                ))
            }
        };

        let (needed, available) = self.respond_reconcile(filter).await?;
        self.respond_exchange_missing_ops(needed, available).await
    }

    async fn drive_subscription(
        mut self,
        sub_id: u32,
        filter: Filter,
        opts: SubscribeOpts,
        mut stop: oneshot::Receiver<()>,
    ) -> Result<(), SyncError> {
        let accepted = self.hello_as_initiator(&[filter]).await?;
        if accepted.is_empty() {
            return Err(SyncError::ProtocolViolation(
                "remote accepted no filters".into(),
            ));
        }
        if opts.immediate {
            let (needed, available) = self.reconcile_as_initiator(filter).await?;
            self.exchange_missing_ops(needed, available).await?;
        }
        loop {
            let recv_fut = self.transport.recv();
            futures::pin_mut!(recv_fut);
            match select(recv_fut, &mut stop).await {
                Either::Left((Some(bytes), _)) => {
                    let msg = WireMessage::from_bytes(&bytes)?;
                    match msg {
                        WireMessage::OpBatch { ops } => {
                            let applied = self.verify_and_apply(ops).await?;
                            self.send(WireMessage::OpBatchAck {
                                count: applied as u32,
                            })
                            .await?;
                        }
                        WireMessage::UpdatePing => {}
                        WireMessage::Cancel { .. } => return Err(SyncError::Cancelled),
                        WireMessage::Error { code, message } => {
                            return Err(SyncError::ProtocolViolation(format!(
                                "remote reported error {}: {}",
                                code, message
                            )))
                        }
                        other => {
                            return Err(SyncError::ProtocolViolation(format!(
                                "unexpected message while subscribed: {:?}",
                                other
                            )))
                        }
                    }
                }
                Either::Left((None, _)) => {
                    return Err(SyncError::TransportError("transport closed".into()))
                }
                Either::Right(_) => {
                    self.send(WireMessage::Cancel { sub_id }).await.ok();
                    return Err(SyncError::Cancelled);
                }
            }
        }
    }

    async fn send(&mut self, msg: WireMessage) -> Result<(), SyncError> {
        self.transport.send(msg.to_bytes()).await
    }

    /// Waits for the next message, terminating the session if none
    /// arrives within `config.ack_timeout`.
    async fn recv_with_timeout(&mut self) -> Result<WireMessage, SyncError> {
        let recv_fut = self.transport.recv();
        futures::pin_mut!(recv_fut);
        let timeout = Delay::new(self.config.ack_timeout);
        match select(recv_fut, timeout).await {
            Either::Left((Some(bytes), _)) => WireMessage::from_bytes(&bytes),
            Either::Left((None, _)) => Err(SyncError::TransportError("transport closed".into())),
            Either::Right(_) => Err(SyncError::TransportError(
                "timed out waiting for a reply".into(),
            )),
        }
    }

    fn remember_remote_capabilities(&mut self, capabilities: &[Vec<u8>]) {
        let mut authorizer = self.authorizer.lock().expect("authorizer mutex poisoned");
        for bytes in capabilities {
            match CapabilityToken::from_bytes(bytes) {
                Ok(token) => match token.verify_signature() {
                    Ok(()) => authorizer.remember(token),
                    Err(e) => tracing::warn!(
                        error = %e,
                        "discarding capability token with an invalid issuer signature"
                    ),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "discarding malformed capability token from peer")
                }
            }
        }
    }

    fn filter_authorized(&self, replica: ReplicaId, filter: WireFilter) -> bool {
        let scope_root = match filter {
            WireFilter::All => NodeId::ROOT,
            WireFilter::Children(p) => p,
        };
        self.authorizer.lock().expect("authorizer mutex poisoned").grants(
            &self.doc_id,
            replica,
            Action::ReadStructure,
            scope_root,
            now_unix(),
        )
    }

    async fn hello_as_initiator(&mut self, filters: &[Filter]) -> Result<Vec<Filter>, SyncError> {
        let max_lamport = self.backend.max_lamport().await.map_err(backend_err)?.0;
        let capabilities = self.held_tokens.iter().map(|t| t.to_bytes()).collect();
        self.send(WireMessage::Hello {
            doc_id: self.doc_id.clone(),
            replica: self.local_replica,
            filters: filters.iter().copied().map(Into::into).collect(),
            max_lamport,
            capabilities,
        })
        .await?;
        match self.recv_with_timeout().await? {
            WireMessage::HelloAck {
                accepted,
                rejected,
                capabilities,
            } => {
                self.remember_remote_capabilities(&capabilities);
                if !rejected.is_empty() {
                    return Err(SyncError::ProtocolViolation(
                        "remote rejected a filter: UNAUTHORIZED".into(),
                    ));
                }
                Ok(accepted.into_iter().map(Into::into).collect())
            }
            other => Err(protocol_error(other, "HelloAck")),
        }
    }

    /// Drives the sketch exchange as the side that owns the encoder,
    /// falling back to a full `OpRef` listing once `max_codewords` is
    /// exceeded without convergence. Returns `(needed, available)`: the
    /// refs the remote reported missing from its own set, and the refs it
    /// reported having that we don't.
    async fn reconcile_as_initiator(
        &mut self,
        filter: Filter,
    ) -> Result<(Vec<OpRef>, Vec<OpRef>), SyncError> {
        let local_refs = self.backend.list_op_refs(filter).await.map_err(backend_err)?;
        let mut encoder = SketchEncoder::new();
        for r in &local_refs {
            encoder.add(*r);
        }
        let mut codewords_sent: u32 = 0;
        loop {
            let fell_back = codewords_sent > self.config.max_codewords;
            let (codewords, full_refs) = if fell_back {
                (Vec::new(), Some(local_refs.clone()))
            } else {
                let chunk: Vec<[u8; 24]> = (0..self.config.codewords_per_message)
                    .map(|_| encoder.next_codeword().to_bytes())
                    .collect();
                codewords_sent += chunk.len() as u32;
                (chunk, None)
            };
            self.send(WireMessage::SyncRequest {
                filter: filter.into(),
                codewords,
                full_refs,
            })
            .await?;
            match self.recv_with_timeout().await? {
                WireMessage::SyncDelta {
                    needed,
                    available,
                    complete,
                } => {
                    if complete {
                        return Ok((needed, available));
                    }
                }
                other => return Err(protocol_error(other, "SyncDelta")),
            }
        }
    }

    /// The responder's half of [`Self::reconcile_as_initiator`]: receives
    /// `SyncRequest`s for one filter until either the sketch converges or a
    /// full listing arrives, replying with `SyncDelta` each round.
    async fn respond_reconcile(
        &mut self,
        filter: Filter,
    ) -> Result<(Vec<OpRef>, Vec<OpRef>), SyncError> {
        let local_refs = self.backend.list_op_refs(filter).await.map_err(backend_err)?;
        let mut decoder = SketchDecoder::new();
        for r in &local_refs {
            decoder.add_local(*r);
        }
        loop {
            match self.recv_with_timeout().await? {
                WireMessage::SyncRequest {
                    codewords,
                    full_refs,
                    ..
                } => {
                    if let Some(remote_refs) = full_refs {
                        let local_set: HashSet<OpRef> = local_refs.iter().copied().collect();
                        let remote_set: HashSet<OpRef> = remote_refs.into_iter().collect();
                        let needed: Vec<OpRef> =
                            remote_set.difference(&local_set).copied().collect();
                        let available: Vec<OpRef> =
                            local_set.difference(&remote_set).copied().collect();
                        self.send(WireMessage::SyncDelta {
                            needed: needed.clone(),
                            available: available.clone(),
                            complete: true,
                        })
                        .await?;
                        return Ok((needed, available));
                    }
                    for bytes in codewords {
                        decoder.add_codeword(WireCodeword::from_bytes(bytes));
                    }
                    let converged = decoder
                        .try_decode()
                        .map_err(|e| SyncError::ProtocolViolation(e.to_string()))?;
                    if converged {
                        let needed = decoder.remote_missing();
                        let available = decoder.local_missing();
                        self.send(WireMessage::SyncDelta {
                            needed: needed.clone(),
                            available: available.clone(),
                            complete: true,
                        })
                        .await?;
                        return Ok((needed, available));
                    }
                    self.send(WireMessage::SyncDelta {
                        needed: Vec::new(),
                        available: Vec::new(),
                        complete: false,
                    })
                    .await?;
                }
                other => return Err(protocol_error(other, "SyncRequest")),
            }
        }
    }

    /// Sends the ops the remote reported as `needed`, then receives the
    /// ops it reported as `available`, acking each batch in both
    /// directions. Bounded by `config.max_ops_per_batch`.
    async fn exchange_missing_ops(
        &mut self,
        needed_by_remote: Vec<OpRef>,
        available_from_remote: Vec<OpRef>,
    ) -> Result<(), SyncError> {
        self.send_missing_ops(needed_by_remote).await?;
        self.recv_missing_ops(available_from_remote.len()).await
    }

    /// The responder's half of [`Self::exchange_missing_ops`]: receive
    /// first (what we told the initiator we need), then send (what we
    /// told it we have).
    async fn respond_exchange_missing_ops(
        &mut self,
        needed: Vec<OpRef>,
        available: Vec<OpRef>,
    ) -> Result<(), SyncError> {
        self.recv_missing_ops(needed.len()).await?;
        self.send_missing_ops(available).await
    }

    async fn send_missing_ops(&mut self, refs: Vec<OpRef>) -> Result<(), SyncError> {
        if refs.is_empty() {
            return Ok(());
        }
        let ops = self
            .backend
            .get_ops_by_op_refs(&refs)
            .await
            .map_err(backend_err)?;
        for chunk in ops.chunks(self.config.max_ops_per_batch as usize) {
            self.send(WireMessage::OpBatch {
                ops: chunk.to_vec(),
            })
            .await?;
            match self.recv_with_timeout().await? {
                WireMessage::OpBatchAck { .. } => {}
                other => return Err(protocol_error(other, "OpBatchAck")),
            }
        }
        Ok(())
    }

    async fn recv_missing_ops(&mut self, mut remaining: usize) -> Result<(), SyncError> {
        while remaining > 0 {
            match self.recv_with_timeout().await? {
                WireMessage::OpBatch { ops } => {
                    let applied = self.verify_and_apply(ops).await?;
                    remaining = remaining.saturating_sub(applied.max(1));
                    self.send(WireMessage::OpBatchAck {
                        count: applied as u32,
                    })
                    .await?;
                }
                other => return Err(protocol_error(other, "OpBatch")),
            }
        }
        Ok(())
    }

    /// Runs `op` through the scope evaluator and every action its kind
    /// requires, against the tree and authorizer as they stand right now.
    fn decide(
        &self,
        tree: &TreeEngine,
        authorizer: &Authorizer,
        op: &Op,
        now: u64,
    ) -> Result<(), arbor_core::AuthError> {
        let evaluator = TreeScopeEvaluator { tree };
        match &op.auth {
            Some(auth) => {
                verify_op_signature(op, auth)?;
                let proof_ref = TokenId::from_bytes(auth.proof_ref);
                required_actions(&op.kind).into_iter().try_for_each(|action| {
                    authorizer.decide(
                        &evaluator,
                        &self.doc_id,
                        op.meta.id.replica,
                        action,
                        op.kind.scope_node(),
                        proof_ref,
                        now,
                    )
                })
            }
            None if self.config.require_proof_ref => Err(arbor_core::AuthError::UnknownProofRef),
            None => Ok(()),
        }
    }

    /// Appends already-authorized ops to the tree, observing their lamport
    /// stamps, then persists them to the backend.
    async fn apply(&self, ops: &[Op]) -> Result<(), SyncError> {
        if ops.is_empty() {
            return Ok(());
        }
        {
            let mut tree = self.tree.lock().expect("tree mutex poisoned");
            let mut lamport = self.lamport.lock().expect("lamport mutex poisoned");
            for op in ops {
                lamport.observe(op.meta.lamport);
                match tree.append(op) {
                    Ok(_) | Err(arbor_core::TreeError::DuplicateOp(_)) => {}
                    Err(e) => return Err(SyncError::Tree(e)),
                }
            }
        }
        self.backend
            .apply_ops(&self.doc_id, ops)
            .await
            .map_err(backend_err)
    }

    /// Checks every op's authorization against the held and remembered
    /// tokens, applying allowed ops to the tree and backend, quarantining
    /// ones whose scope can't yet be decided, and dropping the rest. Any
    /// structural op applied here may complete the ancestry a previously
    /// quarantined op was missing, so quarantined ops are re-checked
    /// afterwards. Returns how many ops were actually applied.
    async fn verify_and_apply(&self, ops: Vec<Op>) -> Result<usize, SyncError> {
        let mut to_apply = Vec::new();
        let mut to_pend = Vec::new();
        {
            let tree = self.tree.lock().expect("tree mutex poisoned");
            let authorizer = self.authorizer.lock().expect("authorizer mutex poisoned");
            let now = now_unix();
            for op in ops {
                match self.decide(&tree, &authorizer, &op, now) {
                    Ok(()) => to_apply.push(op),
                    Err(e) if e.is_pending() => to_pend.push(PendingOp {
                        op,
                        reason: PendingReason::AncestryIncomplete,
                        message: None,
                    }),
                    Err(e) => {
                        tracing::warn!(error = %e, node = ?op.kind.node(), "rejecting op failing authorization");
                    }
                }
            }
        }
        if !to_pend.is_empty() {
            self.backend
                .store_pending_ops(&to_pend)
                .await
                .map_err(backend_err)?;
        }
        let applied = to_apply.len();
        self.apply(&to_apply).await?;
        self.retry_pending().await?;
        Ok(applied)
    }

    /// Whether `op`'s quarantine has outlived `config.pending_ttl`, in
    /// lamport ticks rather than wall-clock time so GC stays deterministic
    /// across replicas. `None` means never GC.
    fn is_pending_ttl_expired(&self, op: &Op, current_lamport: u64) -> bool {
        match self.config.pending_ttl {
            Some(ttl) => current_lamport.saturating_sub(op.meta.lamport.0) > ttl,
            None => false,
        }
    }

    /// Re-decides every quarantined op against the current tree and
    /// authorizer. An op whose ancestry has since arrived is applied and
    /// its quarantine entry cleared; one that now fails outright (its
    /// scope resolved to a node the token doesn't cover) is dropped the
    /// same way. Runs to a fixed point so a chain of quarantined ops
    /// unblocks in one pass.
    async fn retry_pending(&self) -> Result<(), SyncError> {
        loop {
            let pending = self.backend.list_pending_ops().await.map_err(backend_err)?;
            if pending.is_empty() {
                return Ok(());
            }
            let mut to_apply = Vec::new();
            let mut to_clear = Vec::new();
            {
                let tree = self.tree.lock().expect("tree mutex poisoned");
                let authorizer = self.authorizer.lock().expect("authorizer mutex poisoned");
                let current_lamport = self.lamport.lock().expect("lamport mutex poisoned").0;
                let now = now_unix();
                for pending_op in pending {
                    let opref = OpRef::derive(&self.doc_id, &pending_op.op.meta.id);
                    match self.decide(&tree, &authorizer, &pending_op.op, now) {
                        Ok(()) => {
                            to_apply.push(pending_op.op);
                            to_clear.push(opref);
                        }
                        Err(e) if e.is_pending() => {
                            if self.is_pending_ttl_expired(&pending_op.op, current_lamport) {
                                tracing::warn!(node = ?pending_op.op.kind.node(), "GCing pending op past its TTL, never decided");
                                to_clear.push(opref);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, node = ?pending_op.op.kind.node(), "dropping quarantined op that now fails authorization");
                            to_clear.push(opref);
                        }
                    }
                }
            }
            if to_clear.is_empty() {
                return Ok(());
            }
            self.apply(&to_apply).await?;
            self.backend
                .delete_pending_ops(&to_clear)
                .await
                .map_err(backend_err)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use arbor_core::{Claims, Keypair, SledBackend};

    fn db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    fn session(
        transport: InMemoryTransport,
        root_issuer: &Keypair,
        replica: Keypair,
        config: Config,
    ) -> SyncSession {
        let backend: Arc<dyn Backend> = Arc::new(SledBackend::new(&db(), b"doc").unwrap());
        let tree = Arc::new(Mutex::new(TreeEngine::new()));
        let mut trusted = HashSet::new();
        trusted.insert(root_issuer.replica_id());
        let authorizer = Arc::new(Mutex::new(Authorizer::new(trusted)));
        let claims = Claims {
            issuer: root_issuer.replica_id(),
            audience: b"doc".to_vec(),
            subject: replica.replica_id(),
            scope: NodeId::ROOT,
            actions: vec![
                Action::ReadStructure,
                Action::WriteStructure,
                Action::WritePayload,
                Action::Delete,
            ],
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let token = CapabilityToken::issue(*root_issuer, claims);
        authorizer.lock().unwrap().remember(token.clone());
        SyncSession::new(
            Box::new(transport),
            backend,
            tree,
            authorizer,
            Arc::new(Mutex::new(Lamport::default())),
            b"doc".to_vec(),
            replica.replica_id(),
            vec![token],
            config,
        )
    }

    #[async_std::test]
    async fn sync_once_between_empty_replicas_is_a_noop() {
        let root = Keypair::generate();
        let (t_a, t_b) = InMemoryTransport::pair();
        let mut a = session(t_a, &root, Keypair::generate(), Config::default());
        let mut b = session(t_b, &root, Keypair::generate(), Config::default());
        let (ra, rb) = futures::join!(a.sync_once(Filter::All), b.respond());
        ra.unwrap();
        rb.unwrap();
    }

    #[async_std::test]
    async fn sync_once_pulls_ops_the_initiator_is_missing() {
        let root = Keypair::generate();
        let replica_b = Keypair::generate();
        let config = Config {
            require_proof_ref: false,
            ..Config::default()
        };
        let (t_a, t_b) = InMemoryTransport::pair();
        let mut a = session(t_a, &root, Keypair::generate(), config.clone());
        let mut b = session(t_b, &root, replica_b, config);

        let op = Op {
            meta: arbor_core::OpMeta {
                id: arbor_core::OpId {
                    replica: replica_b.replica_id(),
                    counter: 1,
                },
                lamport: arbor_core::Lamport(1),
            },
            kind: OpKind::Insert {
                parent: NodeId::ROOT,
                node: NodeId::new([9; 16]),
                order_key: vec![1],
                payload: None,
            },
            auth: None,
        };
        b.tree.lock().unwrap().append(&op).unwrap();
        b.backend.apply_ops(b"doc", &[op.clone()]).await.unwrap();

        let (ra, rb) = futures::join!(a.sync_once(Filter::All), b.respond());
        ra.unwrap();
        rb.unwrap();

        assert!(a.tree.lock().unwrap().is_known(&NodeId::new([9; 16])));
    }

    #[async_std::test]
    async fn an_unauthorized_filter_is_rejected() {
        let root = Keypair::generate();
        let stranger_issuer = Keypair::generate();
        let (t_a, t_b) = InMemoryTransport::pair();

        // `a` holds a token signed by an issuer `b` doesn't trust.
        let replica_a = Keypair::generate();
        let backend: Arc<dyn Backend> = Arc::new(SledBackend::new(&db(), b"doc").unwrap());
        let tree = Arc::new(Mutex::new(TreeEngine::new()));
        let authorizer = Arc::new(Mutex::new(Authorizer::new(HashSet::new())));
        let claims = Claims {
            issuer: stranger_issuer.replica_id(),
            audience: b"doc".to_vec(),
            subject: replica_a.replica_id(),
            scope: NodeId::ROOT,
            actions: vec![Action::ReadStructure],
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let token = CapabilityToken::issue(stranger_issuer, claims);
        let mut a = SyncSession::new(
            Box::new(t_a),
            backend,
            tree,
            authorizer,
            Arc::new(Mutex::new(Lamport::default())),
            b"doc".to_vec(),
            replica_a.replica_id(),
            vec![token],
            Config::default(),
        );
        let mut b = session(t_b, &root, Keypair::generate(), Config::default());

        let (ra, rb) = futures::join!(a.sync_once(Filter::All), b.respond());
        assert!(ra.is_err());
        assert!(rb.is_err());
    }

    #[async_std::test]
    async fn an_op_whose_ancestry_is_unknown_is_quarantined_pending() {
        let root = Keypair::generate();
        let sender = Keypair::generate();
        let (t_a, t_b) = InMemoryTransport::pair();
        let mut a = session(t_a, &root, Keypair::generate(), Config::default());
        let mut b = session(t_b, &root, sender, Config::default());

        // A token scoped to a node `a` hasn't seen yet, so `a` can't tell
        // whether an insert under it is in scope or not.
        let scope_root = NodeId::new([5; 16]);
        let parent = NodeId::new([6; 16]);
        let node = NodeId::new([7; 16]);
        let claims = Claims {
            issuer: root.replica_id(),
            audience: b"doc".to_vec(),
            subject: sender.replica_id(),
            scope: scope_root,
            actions: vec![Action::WriteStructure],
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let token = CapabilityToken::issue(root, claims);
        let token_id = token.id();
        b.authorizer.lock().unwrap().remember(token.clone());
        b.held_tokens.push(token);

        let meta = arbor_core::OpMeta {
            id: arbor_core::OpId {
                replica: sender.replica_id(),
                counter: 1,
            },
            lamport: arbor_core::Lamport(1),
        };
        let kind = OpKind::Insert {
            parent,
            node,
            order_key: vec![1],
            payload: None,
        };
        let unsigned = Op {
            meta: meta.clone(),
            kind: kind.clone(),
            auth: None,
        };
        let signed = sender.sign_bytes(unsigned.signing_bytes());
        let op = Op {
            meta,
            kind,
            auth: Some(arbor_core::OpAuth {
                signature: signed.sig,
                proof_ref: *token_id.as_bytes(),
            }),
        };
        b.tree.lock().unwrap().append(&op).unwrap();
        b.backend.apply_ops(b"doc", &[op.clone()]).await.unwrap();

        let (ra, rb) = futures::join!(a.sync_once(Filter::All), b.respond());
        ra.unwrap();
        rb.unwrap();

        assert!(!a.tree.lock().unwrap().is_known(&node));
        let pending = a.backend.list_pending_ops().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op.kind.node(), node);
    }

    #[async_std::test]
    async fn a_quarantined_op_is_gced_once_its_ttl_elapses() {
        let root = Keypair::generate();
        let stuck_sender = Keypair::generate();
        let other_sender = Keypair::generate();
        let (t_a, t_b) = InMemoryTransport::pair();
        let config = Config {
            pending_ttl: Some(0),
            ..Config::default()
        };
        let mut a = session(t_a, &root, Keypair::generate(), config.clone());
        let mut b = session(t_b, &root, stuck_sender, config);

        let scope_root = NodeId::new([5; 16]);
        let stuck_parent = NodeId::new([6; 16]);
        let stuck_node = NodeId::new([7; 16]);
        let other_node = NodeId::new([8; 16]);

        let stuck_claims = Claims {
            issuer: root.replica_id(),
            audience: b"doc".to_vec(),
            subject: stuck_sender.replica_id(),
            scope: scope_root,
            actions: vec![Action::WriteStructure],
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let stuck_token = CapabilityToken::issue(root, stuck_claims);
        let stuck_token_id = stuck_token.id();

        let other_claims = Claims {
            issuer: root.replica_id(),
            audience: b"doc".to_vec(),
            subject: other_sender.replica_id(),
            scope: NodeId::ROOT,
            actions: vec![Action::WriteStructure],
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let other_token = CapabilityToken::issue(root, other_claims);
        let other_token_id = other_token.id();

        b.authorizer.lock().unwrap().remember(stuck_token.clone());
        b.authorizer.lock().unwrap().remember(other_token.clone());
        b.held_tokens.push(stuck_token);
        b.held_tokens.push(other_token);

        fn sign(signer: Keypair, kind: OpKind, counter: u64, lamport: u64, token_id: TokenId) -> Op {
            let meta = arbor_core::OpMeta {
                id: arbor_core::OpId {
                    replica: signer.replica_id(),
                    counter,
                },
                lamport: arbor_core::Lamport(lamport),
            };
            let unsigned = Op {
                meta: meta.clone(),
                kind: kind.clone(),
                auth: None,
            };
            let signed = signer.sign_bytes(unsigned.signing_bytes());
            Op {
                meta,
                kind,
                auth: Some(arbor_core::OpAuth {
                    signature: signed.sig,
                    proof_ref: *token_id.as_bytes(),
                }),
            }
        }

        // Never resolvable: `stuck_parent` is never inserted by anyone.
        let stuck = sign(
            stuck_sender,
            OpKind::Insert {
                parent: stuck_parent,
                node: stuck_node,
                order_key: vec![1],
                payload: None,
            },
            1,
            1,
            stuck_token_id,
        );
        // Applies directly and pushes the replica's lamport clock well
        // past the stuck op's, making it eligible for a TTL of 0.
        let other = sign(
            other_sender,
            OpKind::Insert {
                parent: NodeId::ROOT,
                node: other_node,
                order_key: vec![1],
                payload: None,
            },
            1,
            10,
            other_token_id,
        );
        for op in [&stuck, &other] {
            b.tree.lock().unwrap().append(op).unwrap();
        }
        b.backend.apply_ops(b"doc", &[stuck, other]).await.unwrap();

        let (ra, rb) = futures::join!(a.sync_once(Filter::All), b.respond());
        ra.unwrap();
        rb.unwrap();

        assert!(a.tree.lock().unwrap().is_known(&other_node));
        assert!(!a.tree.lock().unwrap().is_known(&stuck_node));
        assert!(a.backend.list_pending_ops().await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn a_quarantined_op_is_retried_once_its_ancestry_arrives() {
        let root = Keypair::generate();
        let sender = Keypair::generate();
        let (t_a, t_b) = InMemoryTransport::pair();
        let mut a = session(t_a, &root, Keypair::generate(), Config::default());
        let mut b = session(t_b, &root, sender, Config::default());

        let claims = Claims {
            issuer: root.replica_id(),
            audience: b"doc".to_vec(),
            subject: sender.replica_id(),
            scope: NodeId::ROOT,
            actions: vec![Action::WriteStructure],
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let token = CapabilityToken::issue(root, claims);
        let token_id = token.id();
        b.authorizer.lock().unwrap().remember(token.clone());
        b.held_tokens.push(token);

        let sign = |kind: OpKind, counter: u64| -> Op {
            let meta = arbor_core::OpMeta {
                id: arbor_core::OpId {
                    replica: sender.replica_id(),
                    counter,
                },
                lamport: arbor_core::Lamport(counter),
            };
            let unsigned = Op {
                meta: meta.clone(),
                kind: kind.clone(),
                auth: None,
            };
            let signed = sender.sign_bytes(unsigned.signing_bytes());
            Op {
                meta,
                kind,
                auth: Some(arbor_core::OpAuth {
                    signature: signed.sig,
                    proof_ref: *token_id.as_bytes(),
                }),
            }
        };

        // The child arrives (structurally, in `b`'s tree) before its own
        // parent — `a` starts out unable to tell whether the child's insert
        // is in scope, since it doesn't know the parent's ancestry yet.
        let parent = NodeId::new([6; 16]);
        let child = NodeId::new([7; 16]);
        let insert_parent = sign(
            OpKind::Insert {
                parent: NodeId::ROOT,
                node: parent,
                order_key: vec![1],
                payload: None,
            },
            1,
        );
        let insert_child = sign(
            OpKind::Insert {
                parent,
                node: child,
                order_key: vec![1],
                payload: None,
            },
            2,
        );
        for op in [&insert_parent, &insert_child] {
            b.tree.lock().unwrap().append(op).unwrap();
        }
        b.backend
            .apply_ops(b"doc", &[insert_parent, insert_child])
            .await
            .unwrap();

        let (ra, rb) = futures::join!(a.sync_once(Filter::All), b.respond());
        ra.unwrap();
        rb.unwrap();

        // Both ops land despite arriving in an order `a` couldn't have
        // decided the second one from alone; the quarantine resolved once
        // the parent's ancestry was in place.
        assert!(a.tree.lock().unwrap().is_known(&parent));
        assert!(a.tree.lock().unwrap().is_known(&child));
        assert!(a.backend.list_pending_ops().await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn a_quarantined_op_is_dropped_once_its_ancestry_resolves_outside_scope() {
        let root = Keypair::generate();
        let struct_sender = Keypair::generate();
        let payload_sender = Keypair::generate();
        let (t_a, t_b) = InMemoryTransport::pair();
        let mut a = session(t_a, &root, Keypair::generate(), Config::default());
        let mut b = session(t_b, &root, struct_sender, Config::default());

        let scope_root = NodeId::new([9; 16]);
        let node = NodeId::new([7; 16]);

        let outside_claims = Claims {
            issuer: root.replica_id(),
            audience: b"doc".to_vec(),
            subject: struct_sender.replica_id(),
            scope: NodeId::ROOT,
            actions: vec![Action::WriteStructure],
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let outside_token = CapabilityToken::issue(root, outside_claims);
        let outside_token_id = outside_token.id();

        let scoped_claims = Claims {
            issuer: root.replica_id(),
            audience: b"doc".to_vec(),
            subject: payload_sender.replica_id(),
            scope: scope_root,
            actions: vec![Action::WritePayload],
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let scoped_token = CapabilityToken::issue(root, scoped_claims);
        let scoped_token_id = scoped_token.id();

        b.authorizer.lock().unwrap().remember(outside_token.clone());
        b.authorizer.lock().unwrap().remember(scoped_token.clone());
        b.held_tokens.push(outside_token);
        b.held_tokens.push(scoped_token);

        fn sign(signer: Keypair, kind: OpKind, counter: u64, token_id: TokenId) -> Op {
            let meta = arbor_core::OpMeta {
                id: arbor_core::OpId {
                    replica: signer.replica_id(),
                    counter,
                },
                lamport: arbor_core::Lamport(counter),
            };
            let unsigned = Op {
                meta: meta.clone(),
                kind: kind.clone(),
                auth: None,
            };
            let signed = signer.sign_bytes(unsigned.signing_bytes());
            Op {
                meta,
                kind,
                auth: Some(arbor_core::OpAuth {
                    signature: signed.sig,
                    proof_ref: *token_id.as_bytes(),
                }),
            }
        }

        // `node` is inserted straight under ROOT, nowhere near `scope_root`.
        let insert = sign(
            struct_sender,
            OpKind::Insert {
                parent: NodeId::ROOT,
                node,
                order_key: vec![1],
                payload: None,
            },
            1,
            outside_token_id,
        );
        // A payload write for that same node, authorized only inside
        // `scope_root` — `a` can't tell it's out of scope until it learns
        // `node`'s real ancestry from the insert above.
        let payload_op = sign(
            payload_sender,
            OpKind::Payload {
                node,
                payload: Some(b"leaked".to_vec()),
            },
            1,
            scoped_token_id,
        );
        for op in [&insert, &payload_op] {
            b.tree.lock().unwrap().append(op).unwrap();
        }
        b.backend
            .apply_ops(b"doc", &[insert, payload_op])
            .await
            .unwrap();

        let (ra, rb) = futures::join!(a.sync_once(Filter::All), b.respond());
        ra.unwrap();
        rb.unwrap();

        assert!(a.tree.lock().unwrap().is_known(&node));
        assert_eq!(a.tree.lock().unwrap().payload_of(node), None);
        assert!(a.backend.list_pending_ops().await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn an_op_with_a_forged_signature_is_dropped() {
        let root = Keypair::generate();
        let sender = Keypair::generate();
        let impostor = Keypair::generate();
        let (t_a, t_b) = InMemoryTransport::pair();
        let mut a = session(t_a, &root, Keypair::generate(), Config::default());
        let mut b = session(t_b, &root, sender, Config::default());

        let claims = Claims {
            issuer: root.replica_id(),
            audience: b"doc".to_vec(),
            subject: sender.replica_id(),
            scope: NodeId::ROOT,
            actions: vec![Action::WriteStructure],
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let token = CapabilityToken::issue(root, claims);
        let token_id = token.id();
        b.authorizer.lock().unwrap().remember(token.clone());
        b.held_tokens.push(token);

        let node = NodeId::new([7; 16]);
        let meta = arbor_core::OpMeta {
            id: arbor_core::OpId {
                replica: sender.replica_id(),
                counter: 1,
            },
            lamport: arbor_core::Lamport(1),
        };
        let kind = OpKind::Insert {
            parent: NodeId::ROOT,
            node,
            order_key: vec![1],
            payload: None,
        };
        let unsigned = Op {
            meta: meta.clone(),
            kind: kind.clone(),
            auth: None,
        };
        // Signed by an impostor, not the replica the op claims to be from.
        let signed = impostor.sign_bytes(unsigned.signing_bytes());
        let op = Op {
            meta,
            kind,
            auth: Some(arbor_core::OpAuth {
                signature: signed.sig,
                proof_ref: *token_id.as_bytes(),
            }),
        };
        // `b` stores the forged op directly, bypassing its own `decide` —
        // standing in for a malicious peer that already has it in its log.
        b.tree.lock().unwrap().append(&op).unwrap();
        b.backend.apply_ops(b"doc", &[op.clone()]).await.unwrap();

        let (ra, rb) = futures::join!(a.sync_once(Filter::All), b.respond());
        ra.unwrap();
        rb.unwrap();

        assert!(!a.tree.lock().unwrap().is_known(&node));
        assert!(a.backend.list_pending_ops().await.unwrap().is_empty());
    }

    #[test]
    fn a_capability_token_with_a_forged_issuer_signature_is_not_remembered() {
        let root = Keypair::generate();
        let subject = Keypair::generate();
        let (t_a, _t_b) = InMemoryTransport::pair();
        let mut session = session(t_a, &root, subject, Config::default());

        let claims = Claims {
            issuer: root.replica_id(),
            audience: b"doc".to_vec(),
            subject: subject.replica_id(),
            scope: NodeId::new([5; 16]),
            actions: vec![Action::WriteStructure],
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let mut token = CapabilityToken::issue(root, claims);
        token.signature[0] ^= 0xff;

        session.remember_remote_capabilities(&[token.to_bytes()]);

        assert!(!session.authorizer.lock().unwrap().grants(
            b"doc",
            subject.replica_id(),
            Action::WriteStructure,
            NodeId::new([5; 16]),
            0,
        ));
    }

    #[async_std::test]
    async fn subscription_can_be_stopped_before_any_push_arrives() {
        let root = Keypair::generate();
        let (t_a, t_b) = InMemoryTransport::pair();
        let a = session(t_a, &root, Keypair::generate(), Config::default());
        let mut b = session(t_b, &root, Keypair::generate(), Config::default());

        let sub = a.subscribe(Filter::All, SubscribeOpts { immediate: false });
        sub.stop.stop();
        let (result, _) = futures::join!(sub.done, async { b.respond().await });
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
