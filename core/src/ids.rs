//! Identifiers: [`NodeId`], [`ReplicaId`], [`OpId`], [`Lamport`], [`OpRef`].
//!
//! `NodeId` reserves the all-zero value for the implicit root and the
//! all-ones value for the trash node. `ReplicaId` is an Ed25519
//! public key. `OpRef` is a content-free 16-byte handle, derived by hashing
//! `(docId, replica, counter)` under a domain tag so it never collides
//! across documents or replicas.

use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};
use std::cmp::Ordering;

const OPREF_DOMAIN: &[u8] = b"arbor/opref/v1";
const TOKENID_DOMAIN: &[u8] = b"treecrdt/tokenid/v1";

#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "NodeId")]
#[repr(transparent)]
pub struct NodeId([u8; 16]);

impl NodeId {
    pub const ROOT: NodeId = NodeId([0u8; 16]);
    pub const TRASH: NodeId = NodeId([0xffu8; 16]);

    pub fn new(id: [u8; 16]) -> Self {
        Self(id)
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    pub fn is_trash(&self) -> bool {
        *self == Self::TRASH
    }
}

impl AsRef<[u8; 16]> for NodeId {
    fn as_ref(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<NodeId> for [u8; 16] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Node({})", hex::encode(&self.0[0..4]))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for NodeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("node id must be 16 bytes"))?;
        Ok(Self(arr))
    }
}

// Capability claim sets are CBOR-encoded, which needs `serde`'s traits
// alongside `rkyv`'s — implemented by hand since both derive macros are
// named `Serialize`/`Deserialize` and can't be derived in the same scope.
impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, serializer)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        <[u8; 16] as serde::Deserialize>::deserialize(deserializer).map(Self)
    }
}

#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "ReplicaId")]
#[repr(transparent)]
pub struct ReplicaId([u8; 32]);

impl ReplicaId {
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }
}

impl AsRef<[u8; 32]> for ReplicaId {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<ReplicaId> for [u8; 32] {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

impl std::fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..4]))
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut buf = [0u8; 44];
        base64::encode_config_slice(&self.0, base64::URL_SAFE, &mut buf);
        write!(f, "{}", std::str::from_utf8(&buf).expect("base64 is ascii"))
    }
}

impl std::str::FromStr for ReplicaId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 44 {
            return Err(anyhow::anyhow!("invalid replica id length {}", s.len()));
        }
        let mut buf = [0u8; 32];
        base64::decode_config_slice(s, base64::URL_SAFE, &mut buf)?;
        Ok(Self(buf))
    }
}

impl serde::Serialize for ReplicaId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, serializer)
    }
}

impl<'de> serde::Deserialize<'de> for ReplicaId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        <[u8; 32] as serde::Deserialize>::deserialize(deserializer).map(Self)
    }
}

/// A replica-local, monotonically increasing per-replica sequence number
/// paired with the replica that minted it.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
pub struct OpId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl std::fmt::Debug for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}#{}", self.replica, self.counter)
    }
}

/// A Lamport timestamp. Orders by value; ties are broken by `(replica,
/// counter)` wherever winner selection needs a total order.
#[derive(
    Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize,
    Serialize,
)]
#[archive(as = "Lamport")]
#[repr(transparent)]
pub struct Lamport(pub u64);

impl Lamport {
    pub fn tick(&mut self) -> Lamport {
        self.0 += 1;
        *self
    }

    pub fn observe(&mut self, other: Lamport) {
        self.0 = self.0.max(other.0) + 1;
    }
}

/// Compares `(lamport, replica, counter)` descending — the winner-selection
/// order used throughout the tree engine to keep convergence independent
/// of delivery order.
pub fn winner_order(a_lamport: Lamport, a_id: &OpId, b_lamport: Lamport, b_id: &OpId) -> Ordering {
    (a_lamport, a_id.replica, a_id.counter).cmp(&(b_lamport, b_id.replica, b_id.counter))
}

/// Content-free 16-byte handle for an op: `blake3(domain || doc_id || replica || counter)`
/// truncated to 16 bytes. Never reused across documents since `doc_id` is
/// mixed into the hash.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "OpRef")]
#[repr(transparent)]
pub struct OpRef([u8; 16]);

impl OpRef {
    pub fn derive(doc_id: &[u8], id: &OpId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(OPREF_DOMAIN);
        hasher.update(doc_id);
        hasher.update(id.replica.as_ref());
        hasher.update(&id.counter.to_be_bytes());
        let hash = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&hash.as_bytes()[0..16]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for OpRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "OpRef({})", hex::encode(&self.0[0..4]))
    }
}

impl std::fmt::Display for OpRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Domain-separated hash identifying a capability token: the full
/// 32-byte `blake3` output, not truncated — wide enough to use directly
/// as the wire `proof_ref` without a second collision-resistance budget.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TokenId([u8; 32]);

impl TokenId {
    pub fn derive(token_bytes: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(TOKENID_DOMAIN);
        hasher.update(token_bytes);
        let hash = hasher.finalize();
        Self(*hash.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "TokenId({})", hex::encode(&self.0[0..4]))
    }
}
