//! Persistent op storage and querying.
//!
//! [`Backend`] is the pluggable, externally-supplied store: arbor-core never
//! assumes a particular database, only that something durable answers these
//! eight methods. [`SledBackend`] is the reference implementation used by
//! tests and by the root crate's default configuration, built on the
//! `sled::Tree` scan-prefix idiom used elsewhere in this codebase for
//! keyed, prefix-queryable trees.

use crate::ids::{Lamport, NodeId, OpId, OpRef};
use crate::op::{Op, OpKind};
use anyhow::Result;
use async_trait::async_trait;

/// Selects which ops `list_op_refs` returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Filter {
    All,
    /// Every op that either set a node's winning parent to `NodeId` or
    /// moved a node away from it.
    Children(NodeId),
}

/// Why an op is sitting in the pending-context quarantine instead of the
/// main log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PendingReason {
    UnknownProofRef,
    AncestryIncomplete,
}

impl PendingReason {
    fn tag(self) -> u8 {
        match self {
            PendingReason::UnknownProofRef => 0,
            PendingReason::AncestryIncomplete => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(PendingReason::UnknownProofRef),
            1 => Ok(PendingReason::AncestryIncomplete),
            _ => Err(anyhow::anyhow!("unknown pending reason tag {}", tag)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PendingOp {
    pub op: Op,
    pub reason: PendingReason,
    pub message: Option<String>,
}

/// Pluggable persistent store for a single document's op log.
/// Implementations must make `apply_ops` idempotent: re-applying an already
/// known op is a no-op, not an error — duplicate rejection happens earlier,
/// in the tree engine.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn max_lamport(&self) -> Result<Lamport>;
    async fn list_op_refs(&self, filter: Filter) -> Result<Vec<OpRef>>;
    async fn get_ops_by_op_refs(&self, refs: &[OpRef]) -> Result<Vec<Op>>;
    async fn apply_ops(&self, doc_id: &[u8], ops: &[Op]) -> Result<()>;
    async fn store_pending_ops(&self, ops: &[PendingOp]) -> Result<()>;
    async fn list_pending_ops(&self) -> Result<Vec<PendingOp>>;
    async fn delete_pending_ops(&self, refs: &[OpRef]) -> Result<()>;
}

fn encode_pending(p: &PendingOp) -> Vec<u8> {
    let op_bytes = p.op.to_bytes();
    let message = p.message.as_deref().unwrap_or("");
    let mut out = Vec::with_capacity(1 + 4 + message.len() + 4 + op_bytes.len());
    out.push(p.reason.tag());
    out.extend_from_slice(&(message.len() as u32).to_be_bytes());
    out.extend_from_slice(message.as_bytes());
    out.extend_from_slice(&(op_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&op_bytes);
    out
}

fn decode_pending(bytes: &[u8]) -> Result<PendingOp> {
    let reason = PendingReason::from_tag(bytes[0])?;
    let mut offset = 1;
    let msg_len = u32::from_be_bytes(bytes[offset..offset + 4].try_into()?) as usize;
    offset += 4;
    let message = std::str::from_utf8(&bytes[offset..offset + msg_len])?.to_owned();
    offset += msg_len;
    offset += 4; // op length prefix, redundant once we slice to end of buffer
    let op = Op::from_bytes(&bytes[offset..])?;
    Ok(PendingOp {
        op,
        reason,
        message: if message.is_empty() { None } else { Some(message) },
    })
}

/// Reference [`Backend`] implementation over `sled`.
///
/// Keeps four trees: the op log keyed by `OpRef`, a secondary index keyed by
/// `(replica, counter)` for dedup lookups, a tertiary affected-parent index
/// keyed by `parent || opref` for `Filter::Children`, and the pending-context
/// quarantine keyed by `OpRef`. A fifth single-key tree tracks each node's
/// last-seen parent so structural ops can be indexed under both their old
/// and new parent without needing the tree engine's materialized state.
pub struct SledBackend {
    doc_id: Vec<u8>,
    ops: sled::Tree,
    by_replica_counter: sled::Tree,
    affected_parent: sled::Tree,
    shadow_parent: sled::Tree,
    pending: sled::Tree,
    max_lamport: std::sync::atomic::AtomicU64,
}

impl SledBackend {
    pub fn new(db: &sled::Db, doc_id: &[u8]) -> Result<Self> {
        let ns = |suffix: &str| -> Result<sled::Tree> {
            let mut name = Vec::with_capacity(doc_id.len() + suffix.len() + 1);
            name.extend_from_slice(doc_id);
            name.push(b'/');
            name.extend_from_slice(suffix.as_bytes());
            Ok(db.open_tree(name)?)
        };
        let ops = ns("ops")?;
        let max_lamport = ops
            .iter()
            .values()
            .filter_map(|v| v.ok())
            .filter_map(|v| Op::from_bytes(&v).ok())
            .map(|op| op.meta.lamport.0)
            .max()
            .unwrap_or(0);
        Ok(Self {
            doc_id: doc_id.to_vec(),
            ops,
            by_replica_counter: ns("by_replica_counter")?,
            affected_parent: ns("affected_parent")?,
            shadow_parent: ns("shadow_parent")?,
            pending: ns("pending")?,
            max_lamport: std::sync::atomic::AtomicU64::new(max_lamport),
        })
    }

    fn replica_counter_key(id: &OpId) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(id.replica.as_ref());
        key.extend_from_slice(&id.counter.to_be_bytes());
        key
    }

    fn affected_key(parent: NodeId, opref: &OpRef) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(parent.as_ref());
        key.extend_from_slice(opref.as_bytes());
        key
    }

    fn index_structural(&self, opref: &OpRef, op: &Op) -> Result<()> {
        let node = op.kind.node();
        let old_parent = self
            .shadow_parent
            .get(node.as_ref())?
            .map(|v| NodeId::new(v.as_ref().try_into().expect("16 bytes")));
        let new_parent = match &op.kind {
            OpKind::Insert { parent, .. } => Some(*parent),
            OpKind::Move { new_parent, .. } => Some(*new_parent),
            OpKind::Delete { .. } => Some(NodeId::TRASH),
            OpKind::Payload { .. } => None,
        };
        if let Some(old) = old_parent {
            self.affected_parent
                .insert(Self::affected_key(old, opref), &[])?;
        }
        if let Some(new) = new_parent {
            self.affected_parent
                .insert(Self::affected_key(new, opref), &[])?;
            self.shadow_parent
                .insert(node.as_ref(), &<[u8; 16]>::from(new))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for SledBackend {
    async fn max_lamport(&self) -> Result<Lamport> {
        Ok(Lamport(
            self.max_lamport.load(std::sync::atomic::Ordering::Acquire),
        ))
    }

    async fn list_op_refs(&self, filter: Filter) -> Result<Vec<OpRef>> {
        match filter {
            // Pending-context ops aren't in `self.ops` yet, but a peer
            // resending them until their authorization resolves is exactly
            // what the quarantine is for — they still need to be
            // advertised, or the peer would keep looping on them forever.
            Filter::All => self
                .ops
                .iter()
                .keys()
                .chain(self.pending.iter().keys())
                .map(|k| {
                    let k = k?;
                    Ok(OpRef::from_bytes(k.as_ref().try_into()?))
                })
                .collect(),
            Filter::Children(parent) => self
                .affected_parent
                .scan_prefix(parent.as_ref())
                .keys()
                .map(|k| {
                    let k = k?;
                    let opref_bytes = &k.as_ref()[16..];
                    Ok(OpRef::from_bytes(opref_bytes.try_into()?))
                })
                .collect(),
        }
    }

    async fn get_ops_by_op_refs(&self, refs: &[OpRef]) -> Result<Vec<Op>> {
        refs.iter()
            .filter_map(|r| match self.ops.get(r.as_bytes()) {
                Ok(Some(v)) => Some(Op::from_bytes(&v)),
                Ok(None) => match self.pending.get(r.as_bytes()) {
                    Ok(Some(v)) => Some(decode_pending(&v).map(|p| p.op)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                },
                Err(e) => Some(Err(e.into())),
            })
            .collect()
    }

    async fn apply_ops(&self, doc_id: &[u8], ops: &[Op]) -> Result<()> {
        for op in ops {
            let opref = OpRef::derive(doc_id, &op.meta.id);
            if self.ops.contains_key(opref.as_bytes())? {
                tracing::debug!(?opref, "apply_ops: op already stored, skipping");
                continue;
            }
            self.ops.insert(opref.as_bytes(), op.to_bytes())?;
            self.by_replica_counter
                .insert(Self::replica_counter_key(&op.meta.id), opref.as_bytes())?;
            if op.kind.is_structural() {
                self.index_structural(&opref, op)?;
            }
            self.max_lamport
                .fetch_max(op.meta.lamport.0, std::sync::atomic::Ordering::AcqRel);
        }
        Ok(())
    }

    async fn store_pending_ops(&self, ops: &[PendingOp]) -> Result<()> {
        for p in ops {
            // Derived the same way `apply_ops` derives an op's ref, so a
            // pending op keeps the same identity once its quarantine lifts
            // and it moves into the main log.
            let opref = OpRef::derive(&self.doc_id, &p.op.meta.id);
            self.pending.insert(opref.as_bytes(), encode_pending(p))?;
        }
        Ok(())
    }

    async fn list_pending_ops(&self) -> Result<Vec<PendingOp>> {
        self.pending
            .iter()
            .values()
            .map(|v| decode_pending(&v?))
            .collect()
    }

    async fn delete_pending_ops(&self, refs: &[OpRef]) -> Result<()> {
        for r in refs {
            self.pending.remove(r.as_bytes())?;
        }
        Ok(())
    }
}
