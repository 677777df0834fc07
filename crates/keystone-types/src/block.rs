use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::oid::Oid;

/// A reserved contiguous range `[start, start + size)` of oids.
///
/// Blocks issued by distinct reservations never overlap. A block is owned by
/// whoever received it until it is exhausted; exhausted blocks are kept for
/// audit and never handed out again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidBlock {
    pub start: Oid,
    pub size: u64,
}

impl OidBlock {
    /// Build a block, rejecting ranges that would wrap past `u64::MAX`.
    pub fn new(start: Oid, size: u64) -> Result<Self, TypeError> {
        start
            .value()
            .checked_add(size)
            .ok_or(TypeError::RangeOverflow { start: start.value(), size })?;
        Ok(Self { start, size })
    }

    /// One past the last oid in the block.
    pub fn end(&self) -> u64 {
        self.start.value() + self.size
    }

    pub fn contains(&self, oid: Oid) -> bool {
        oid.value() >= self.start.value() && oid.value() < self.end()
    }

    pub fn is_disjoint(&self, other: &OidBlock) -> bool {
        self.end() <= other.start.value() || other.end() <= self.start.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        let block = OidBlock::new(Oid::new(100), 100).unwrap();
        assert_eq!(block.end(), 200);
        assert!(block.contains(Oid::new(100)));
        assert!(block.contains(Oid::new(199)));
        assert!(!block.contains(Oid::new(200)));
    }

    #[test]
    fn adjacent_blocks_are_disjoint() {
        let a = OidBlock::new(Oid::new(0), 100).unwrap();
        let b = OidBlock::new(Oid::new(100), 100).unwrap();
        let c = OidBlock::new(Oid::new(150), 10).unwrap();
        assert!(a.is_disjoint(&b));
        assert!(!b.is_disjoint(&c));
    }

    #[test]
    fn overflow_rejected() {
        assert!(OidBlock::new(Oid::new(u64::MAX - 1), 2).is_err());
    }
}
