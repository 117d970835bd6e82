//! The operation sum type and its authorization envelope.

use crate::ids::{Lamport, NodeId, OpId};
use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Archive, CheckBytes, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
pub enum OpKind {
    Insert {
        parent: NodeId,
        node: NodeId,
        order_key: Vec<u8>,
        payload: Option<Vec<u8>>,
    },
    Move {
        node: NodeId,
        new_parent: NodeId,
        order_key: Vec<u8>,
    },
    /// Always equivalent to `Move { new_parent: NodeId::TRASH, .. }` —
    /// tombstoning is expressed as a move to trash, not a separate state.
    Delete {
        node: NodeId,
    },
    Payload {
        node: NodeId,
        payload: Option<Vec<u8>>,
    },
}

impl OpKind {
    /// The node this op structurally or content-wise affects.
    pub fn node(&self) -> NodeId {
        match self {
            OpKind::Insert { node, .. } => *node,
            OpKind::Move { node, .. } => *node,
            OpKind::Delete { node } => *node,
            OpKind::Payload { node, .. } => *node,
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, OpKind::Insert { .. } | OpKind::Move { .. } | OpKind::Delete { .. })
    }

    /// The node whose ancestry a scope walk should use to decide
    /// authorization. An `Insert`'s own node is by definition not yet
    /// materialized, so its scope is decided by the parent it's attaching
    /// to instead; every other kind acts on an already-known node, so its
    /// own node is the right anchor.
    pub fn scope_node(&self) -> NodeId {
        match self {
            OpKind::Insert { parent, .. } => *parent,
            other => other.node(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Archive, CheckBytes, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
pub struct OpMeta {
    pub id: OpId,
    pub lamport: Lamport,
}

/// Signature attached to an op once `sign_ops` has run. Absent
/// on ops a replica has not yet authorized to send.
#[derive(Clone, Debug, Eq, PartialEq, Archive, CheckBytes, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
pub struct OpAuth {
    pub signature: [u8; 64],
    pub proof_ref: [u8; 32],
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, CheckBytes, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
pub struct Op {
    pub meta: OpMeta,
    pub kind: OpKind,
    pub auth: Option<OpAuth>,
}

impl Op {
    pub fn node(&self) -> NodeId {
        self.kind.node()
    }

    /// Bytes signed by `OpAuth::signature` — everything except the
    /// signature itself, so verification can recompute and compare.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut ser = rkyv::ser::serializers::AllocSerializer::<256>::default();
        use rkyv::ser::Serializer;
        ser.serialize_value(&(self.meta.clone(), self.kind.clone()))
            .expect("in-memory serialization cannot fail");
        ser.into_serializer().into_inner().to_vec()
    }

    /// The rkyv-archived wire representation of this op, shared by the op
    /// log's storage format and the sync protocol's `OpBatch` encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ser = rkyv::ser::serializers::AllocSerializer::<256>::default();
        use rkyv::ser::Serializer;
        ser.serialize_value(self)
            .expect("in-memory serialization cannot fail");
        ser.into_serializer().into_inner().to_vec()
    }

    /// Validates and decodes the bytes produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Op> {
        let archived =
            rkyv::check_archived_root::<Op>(bytes).map_err(|e| anyhow::anyhow!("{}", e))?;
        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|_| anyhow::anyhow!("unreachable: rkyv::Infallible cannot fail"))
    }
}
