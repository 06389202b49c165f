use std::fmt;

use crate::Sha1Hash;

/// The length of a node id, in bytes.
pub const NODE_ID_LEN: usize = 20;

/// A 160-bit DHT node identifier.
///
/// Ids live in the same space as info hashes so that the distance between
/// a node and a torrent is well defined. All ordering is lexicographic on
/// the big endian byte representation, which is the same as ordering the
/// ids as 160-bit unsigned integers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// The smallest id, all zeros.
    pub const MIN: NodeId = NodeId([0; NODE_ID_LEN]);

    pub fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns a uniformly random id, used when the host has no persisted
    /// identity to resume from.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Returns the id's `i`th bit, where bit 0 is the most significant.
    pub fn bit(&self, i: usize) -> bool {
        debug_assert!(i < 8 * NODE_ID_LEN);
        self.0[i / 8] >> (7 - i % 8) & 1 == 1
    }

    /// The XOR distance between two ids.
    ///
    /// The metric is symmetric and satisfies the triangle inequality;
    /// ordering distances orders closeness.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut dist = [0; NODE_ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        Distance(NodeId(dist))
    }

    /// Two's complement negation, i.e. `2^160 - self` modulo `2^160`.
    pub(super) fn wrapping_neg(&self) -> NodeId {
        let mut bytes = [0; NODE_ID_LEN];
        let mut carry = 1u16;
        for i in (0..NODE_ID_LEN).rev() {
            let sum = (!self.0[i]) as u16 + carry;
            bytes[i] = sum as u8;
            carry = sum >> 8;
        }
        NodeId(bytes)
    }

    pub(super) fn wrapping_add(&self, other: &NodeId) -> NodeId {
        let mut bytes = [0; NODE_ID_LEN];
        let mut carry = 0u16;
        for i in (0..NODE_ID_LEN).rev() {
            let sum = self.0[i] as u16 + other.0[i] as u16 + carry;
            bytes[i] = sum as u8;
            carry = sum >> 8;
        }
        NodeId(bytes)
    }

    pub(super) fn wrapping_sub(&self, other: &NodeId) -> NodeId {
        self.wrapping_add(&other.wrapping_neg())
    }

    /// Logical shift right by one bit, i.e. division by two.
    pub(super) fn shr1(&self) -> NodeId {
        let mut bytes = [0; NODE_ID_LEN];
        let mut carry = 0u8;
        for i in 0..NODE_ID_LEN {
            bytes[i] = self.0[i] >> 1 | carry;
            carry = (self.0[i] & 1) << 7;
        }
        NodeId(bytes)
    }
}

impl From<Sha1Hash> for NodeId {
    fn from(hash: Sha1Hash) -> Self {
        Self(hash)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The XOR distance between two 160-bit ids, itself a 160-bit value.
///
/// Ordering is big endian unsigned, the same as on [`NodeId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(NodeId);

impl Distance {
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        (self.0).as_bytes()
    }
}
