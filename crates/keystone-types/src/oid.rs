use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Width of an encoded oid store key in bytes.
pub const OID_KEY_LEN: usize = 8;

/// Unique identifier of a persisted object.
///
/// Oids are handed out in blocks by the allocator and are never reused. In the
/// `oids` store an oid is keyed by its 8-byte big-endian encoding, so the byte
/// order of keys matches the numeric order of oids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Oid(u64);

impl Oid {
    /// The first oid ever issued by a fresh allocator.
    pub const ZERO: Oid = Oid(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw integer value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Fixed-width big-endian store key.
    pub fn to_key(&self) -> [u8; OID_KEY_LEN] {
        self.0.to_be_bytes()
    }

    /// Decode a store key produced by [`Oid::to_key`].
    pub fn from_key(key: &[u8]) -> Result<Self, TypeError> {
        let bytes: [u8; OID_KEY_LEN] = key.try_into().map_err(|_| TypeError::InvalidLength {
            expected: OID_KEY_LEN,
            actual: key.len(),
        })?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }

    /// Zero-padded 16-character hex representation.
    ///
    /// Lexicographic order of these strings matches numeric order, which is what
    /// makes `pending-task.<hex>` bindings scan in oid order.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_key())
    }

    /// Parse from a hex string produced by [`Oid::to_hex`].
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_key(&bytes)
    }

    /// The oid immediately following this one, if any.
    pub fn checked_next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:#x})", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<u64> for Oid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Oid> for u64 {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_is_big_endian() {
        let oid = Oid::new(0x0102);
        assert_eq!(oid.to_key(), [0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn key_roundtrip() {
        let oid = Oid::new(42);
        assert_eq!(Oid::from_key(&oid.to_key()).unwrap(), oid);
    }

    #[test]
    fn from_key_rejects_wrong_length() {
        let err = Oid::from_key(&[1, 2, 3]).unwrap_err();
        assert_eq!(err, TypeError::InvalidLength { expected: 8, actual: 3 });
    }

    #[test]
    fn hex_is_fixed_width() {
        assert_eq!(Oid::new(0).to_hex(), "0000000000000000");
        assert_eq!(Oid::new(255).to_hex(), "00000000000000ff");
        assert_eq!(Oid::from_hex("00000000000000ff").unwrap(), Oid::new(255));
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(matches!(Oid::from_hex("zz"), Err(TypeError::InvalidHex(_))));
    }

    #[test]
    fn checked_next_stops_at_max() {
        assert_eq!(Oid::new(7).checked_next(), Some(Oid::new(8)));
        assert_eq!(Oid::new(u64::MAX).checked_next(), None);
    }

    proptest! {
        #[test]
        fn key_order_matches_numeric_order(a: u64, b: u64) {
            let (oa, ob) = (Oid::new(a), Oid::new(b));
            prop_assert_eq!(oa.cmp(&ob), oa.to_key().cmp(&ob.to_key()));
            prop_assert_eq!(oa.cmp(&ob), oa.to_hex().cmp(&ob.to_hex()));
        }
    }
}
