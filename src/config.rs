//! Tunable session parameters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options governing reconciliation, batching, and authorization
/// strictness for a [`crate::sync::SyncSession`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ceiling on the IBLT symmetric-difference decode size before the
    /// session falls back to full `listOpRefs` enumeration.
    pub max_codewords: u32,
    /// Codeword chunk size per `SyncRequest`.
    pub codewords_per_message: u32,
    /// Hard cap on ops per `OpBatch`.
    pub max_ops_per_batch: u32,
    /// Terminate the session if no ack arrives within this duration.
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,
    /// Reject ops carried without a `proof_ref`.
    pub require_proof_ref: bool,
    /// Perform an initial reconcile before waiting for pushes, when
    /// subscribing.
    pub immediate: bool,
    /// Lamport-tick based TTL after which a pending-context op becomes
    /// eligible for GC. `None` means never GC, keeping ops an authorizing
    /// token hasn't arrived for around indefinitely rather than dropping
    /// them.
    pub pending_ttl: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_codewords: 4096,
            codewords_per_message: 64,
            max_ops_per_batch: 256,
            ack_timeout: Duration::from_secs(30),
            require_proof_ref: true,
            immediate: true,
            pending_ttl: None,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
