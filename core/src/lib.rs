//! # arbor-core
//!
//! The tree CRDT, op log, and capability authorization machinery behind a
//! peer-to-peer collaborative outline/document editor. This crate has no
//! opinion about transport or storage beyond the [`oplog::Backend`] trait —
//! wiring a concrete backend and a network transport together into a
//! running replica is the root `arbor` crate's job.
//!
//! ## Tree state
//! A document is a tree of opaque nodes. Structure and content are both
//! edited with an append-only log of ops (see [`op::Op`]); the current tree
//! is a pure function of the ops a replica has seen, computed by
//! [`tree::TreeEngine`]. Each node's winning parent edge is whichever
//! structural op addressing that node has the greatest `(lamport, replica,
//! counter)` triple — see [`ids::winner_order`] — which makes convergence
//! independent of delivery order: two replicas that have seen the same set
//! of ops compute the same tree, full stop, with no merge function beyond
//! "recompute the max."
//!
//! A move that would create a cycle is simply not materialized: the engine
//! falls back to the next-best candidate for that node, and ultimately to
//! the reserved trash node, rather than ever producing state a reader would
//! need to special-case.
//!
//! ## Op log
//! Ops are durable once a [`oplog::Backend`] implementation has stored them.
//! [`oplog::SledBackend`] is the reference implementation; it also builds
//! the affected-parent secondary index an `OpRef` subscription filter needs
//! without requiring the tree engine's materialized state.
//!
//! ## Set reconciliation
//! Deciding what a peer is missing doesn't require enumerating either
//! side's full `OpRef` set. [`sketch::SketchEncoder`] streams fixed-size
//! codewords derived from a set of `OpRef`s; [`sketch::SketchDecoder`]
//! peels them against a local set and reports the symmetric difference
//! once enough codewords have arrived, with bandwidth proportional to how
//! much the two sides actually differ rather than to either set's size.
//!
//! ## Capability authorization
//! Every op an untrusted peer sends must be covered by a capability token
//! scoped to the subtree it touches (see the `capability` module, added
//! once that layer lands). Ops whose authorization can't yet be decided —
//! typically because the ancestor chain establishing scope hasn't arrived
//! yet — sit in a pending-context quarantine rather than being accepted or
//! rejected outright.
#![warn(missing_docs)]

mod capability;
mod crypto;
mod error;
mod ids;
mod op;
mod oplog;
mod orderkey;
mod replicaset;
mod sketch;
mod tree;

pub use crate::capability::{
    Action, Authorizer, CapabilityToken, Claims, ScopeDecision, ScopeEvaluator, TreeScopeEvaluator,
};
pub use crate::crypto::{Keypair, Signed};
pub use crate::error::{AuthError, TreeError};
pub use crate::ids::{Lamport, NodeId, OpId, OpRef, ReplicaId, TokenId};
pub use crate::op::{Op, OpAuth, OpKind, OpMeta};
pub use crate::oplog::{Backend, Filter, PendingOp, PendingReason, SledBackend};
pub use crate::orderkey::OrderKey;
pub use crate::replicaset::ReplicaCounters;
pub use crate::sketch::{SketchDecoder, SketchEncoder, SketchError, WireCodeword};
pub use crate::tree::{AppliedEffect, TreeEngine};
