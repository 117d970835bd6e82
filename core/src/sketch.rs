//! Rateless set reconciliation over `OpRef`s, built on `riblt`.
//!
//! A sync session doesn't enumerate its whole op log to find what a peer is
//! missing; it streams a sequence of fixed-size coded symbols ("codewords")
//! that the peer's decoder peels against its own local set until both sides'
//! extra elements fall out. [`SketchEncoder`] produces codewords from a set
//! of `OpRef`s; [`SketchDecoder`] consumes them against a (possibly
//! different) local set and reports what each side is missing once enough
//! codewords have arrived.

use crate::ids::OpRef;
use riblt::{CodedSymbol, Decoder, Encoder, Error as RibltError, HashedSymbol, Symbol};

#[derive(Clone, Copy, Eq, PartialEq)]
struct Bytes16([u8; 16]);

impl Symbol for Bytes16 {
    fn zero() -> Self {
        Self([0u8; 16])
    }

    fn xor(&self, other: &Self) -> Self {
        let mut out = [0u8; 16];
        for i in 0..16 {
            out[i] = self.0[i] ^ other.0[i];
        }
        Self(out)
    }

    fn hash(&self) -> u64 {
        // Must not be XOR-linear in the symbol bytes, or the codeword
        // checksum becomes tautological and the decoder mispeels.
        let hi = u64::from_be_bytes(self.0[0..8].try_into().expect("8 bytes"));
        let lo = u64::from_be_bytes(self.0[8..16].try_into().expect("8 bytes"));
        splitmix64(hi ^ splitmix64(lo ^ 0x9e37_79b9_7f4a_7c15))
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// The on-wire codeword shape: a 16-byte XOR sum, a signed symbol count,
/// and a 4-byte checksum — the low bytes of the same mixed hash `Symbol`
/// already uses, not a second hash function.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WireCodeword {
    pub sum: [u8; 16],
    pub count: i32,
    pub checksum: [u8; 4],
}

impl WireCodeword {
    pub fn to_bytes(self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..16].copy_from_slice(&self.sum);
        out[16..20].copy_from_slice(&self.count.to_be_bytes());
        out[20..24].copy_from_slice(&self.checksum);
        out
    }

    pub fn from_bytes(bytes: [u8; 24]) -> Self {
        let mut sum = [0u8; 16];
        sum.copy_from_slice(&bytes[0..16]);
        let count = i32::from_be_bytes(bytes[16..20].try_into().expect("4 bytes"));
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);
        Self { sum, count, checksum }
    }

    fn from_coded(c: &CodedSymbol<Bytes16>) -> Self {
        let hash_bytes = c.hash.to_be_bytes();
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash_bytes[4..8]);
        Self {
            sum: c.symbol.0,
            count: c.count as i32,
            checksum,
        }
    }

    fn to_coded(self) -> CodedSymbol<Bytes16> {
        let symbol = Bytes16(self.sum);
        CodedSymbol {
            symbol,
            hash: symbol.hash(),
            count: self.count as i64,
        }
    }
}

/// Errors the underlying `riblt` decoder can report while peeling.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SketchError {
    #[error("codeword has an invalid degree")]
    InvalidDegree,
    #[error("codeword has an invalid size")]
    InvalidSize,
    #[error("decode failed — more codewords are needed or the sets are too divergent")]
    DecodeFailed,
}

impl From<RibltError> for SketchError {
    fn from(e: RibltError) -> Self {
        match e {
            RibltError::InvalidDegree => SketchError::InvalidDegree,
            RibltError::InvalidSize => SketchError::InvalidSize,
            RibltError::DecodeFailed => SketchError::DecodeFailed,
        }
    }
}

/// Produces codewords from a set of `OpRef`s.
pub struct SketchEncoder {
    inner: Encoder<Bytes16>,
}

impl Default for SketchEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SketchEncoder {
    pub fn new() -> Self {
        Self {
            inner: Encoder::new(),
        }
    }

    pub fn add(&mut self, opref: OpRef) {
        self.inner.add_symbol(&Bytes16(*opref.as_bytes()));
    }

    pub fn next_codeword(&mut self) -> WireCodeword {
        WireCodeword::from_coded(&self.inner.produce_next_coded_symbol())
    }
}

/// Peels codewords from [`SketchEncoder`] against a local set of `OpRef`s.
pub struct SketchDecoder {
    inner: Decoder<Bytes16>,
    codewords_received: u64,
}

impl Default for SketchDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SketchDecoder {
    pub fn new() -> Self {
        Self {
            inner: Decoder::new(),
            codewords_received: 0,
        }
    }

    pub fn add_local(&mut self, opref: OpRef) {
        self.inner.add_symbol(&Bytes16(*opref.as_bytes()));
    }

    pub fn add_codeword(&mut self, codeword: WireCodeword) {
        self.inner.add_coded_symbol(&codeword.to_coded());
        self.codewords_received += 1;
    }

    pub fn codewords_received(&self) -> u64 {
        self.codewords_received
    }

    /// Attempts to fully peel with the codewords received so far. `Ok(true)`
    /// means reconciliation is complete; `Ok(false)` means more codewords
    /// are needed.
    pub fn try_decode(&mut self) -> Result<bool, SketchError> {
        self.inner.try_decode()?;
        Ok(self.inner.decoded())
    }

    pub fn decoded(&self) -> bool {
        self.inner.decoded()
    }

    /// `OpRef`s the encoder's set has that the local set doesn't.
    pub fn remote_missing(&self) -> Vec<OpRef> {
        self.inner
            .get_remote_symbols()
            .iter()
            .map(|s: &HashedSymbol<Bytes16>| OpRef::from_bytes(s.symbol.0))
            .collect()
    }

    /// `OpRef`s the local set has that the encoder's set doesn't.
    pub fn local_missing(&self) -> Vec<OpRef> {
        self.inner
            .get_local_symbols()
            .iter()
            .map(|s: &HashedSymbol<Bytes16>| OpRef::from_bytes(s.symbol.0))
            .collect()
    }
}
