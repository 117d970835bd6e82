//! Client-side helper for minting sibling order keys.
//!
//! `Op::order_key` on the wire is an opaque byte string; the
//! engine only ever compares it lexicographically. `OrderKey` gives callers
//! a convenient way to mint a fresh key strictly between two existing ones,
//! using an arbitrary-precision binary fraction so siblings can always be
//! inserted without renumbering.

use core::{fmt, ops::Index};
use smallvec::{smallvec, SmallVec};

const DIGIT_BITS: u32 = 7;
const DIGIT_MASK: usize = (1 << DIGIT_BITS) - 1;
const DIGIT_MASK_U8: u8 = (1 << DIGIT_BITS) - 1;

/// A canonical binary fraction in `[0, 1)` used as a sortable order key.
/// Trailing zero digits are dropped so equal values always encode
/// identically.
#[derive(PartialOrd, Ord, PartialEq, Eq, Clone)]
pub struct OrderKey(SmallVec<[u8; 8]>);

impl AsRef<[u8]> for OrderKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Index<usize> for OrderKey {
    type Output = u8;

    fn index(&self, index: usize) -> &Self::Output {
        self.0.get(index).unwrap_or(&0u8)
    }
}

impl fmt::Debug for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderKey({})", self)
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.0.is_empty() {
            write!(f, "0x0.{}", hex::encode(&self.0))
        } else {
            write!(f, "0x0")
        }
    }
}

impl OrderKey {
    fn from_digits(mut digits: SmallVec<[u8; 8]>) -> Self {
        debug_assert!(digits.iter().all(|x| *x < 0x80));
        if digits.is_empty() {
            digits.push(0);
        } else {
            while digits.len() > 1 && digits.last() == Some(&0u8) {
                digits.pop();
            }
        }
        for i in 0..digits.len() {
            digits[i] <<= 1;
            if i < digits.len() - 1 {
                digits[i] |= 1;
            }
        }
        Self(digits)
    }

    pub fn zero() -> Self {
        Self(smallvec![0u8])
    }

    pub fn half() -> Self {
        Self::from_digits(smallvec![1 << (DIGIT_BITS - 1)])
    }

    /// An order key strictly between `self` and `other`, or equal to both
    /// if they're already equal.
    pub fn between(&self, other: &Self) -> Self {
        let n = self.0.len().max(other.0.len());
        let mut digits = SmallVec::with_capacity(n);
        let mut carry = 0usize;
        for i in (0..n).rev() {
            carry += self.digit(i);
            carry += other.digit(i);
            digits.push((carry & DIGIT_MASK) as u8);
            carry >>= DIGIT_BITS;
        }
        digits.reverse();
        for i in 0..n {
            let r = digits[i];
            digits[i] = (r >> 1) + ((carry as u8) << (DIGIT_BITS - 1));
            carry = (r & 1) as usize;
        }
        if carry != 0 {
            digits.push(0x40);
        }
        Self::from_digits(digits)
    }

    /// A key guaranteed greater than `self`, for appending past the last
    /// sibling.
    pub fn succ(&self) -> Self {
        let mut digits = self.digits();
        if digits.iter().all(|x| *x == DIGIT_MASK_U8) {
            let n = digits.len().max(1);
            digits.extend((0..n).map(|_| 0u8));
        }
        for byte in digits.iter_mut().rev() {
            *byte = (*byte + 1) & DIGIT_MASK_U8;
            if *byte != 0 {
                break;
            }
        }
        Self::from_digits(digits)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn digits(&self) -> SmallVec<[u8; 8]> {
        let mut res = self.0.clone();
        res.iter_mut().for_each(|x| *x >>= 1);
        res
    }

    fn digit(&self, i: usize) -> usize {
        self.0.get(i).map(|x| *x >> 1).unwrap_or_default() as usize
    }
}
