// Shared Rust library
pub mod dht_messages;
pub mod snapshot;

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use sha2::{Digest, Sha256};

use dht_messages::NodeId;

/// Number of bits in the ring identifier space.
pub const RING_BITS: u32 = 16;

/// Size of the circular keyspace, `2^RING_BITS`.
pub const RING_SIZE: u64 = 1 << RING_BITS;

// Checks if an ID is between two other IDs in a circular ID space.
// `id` is between `start` and `end` if `start < id <= end` in the circular space.
pub fn is_between(id: &NodeId, start: &NodeId, end: &NodeId) -> bool {
    if start == end {
        // If start and end are the same, the interval (start, end] is empty
        return false;
    }
    if start < end {
        start < id && id <= end
    } else {
        // Wraps around (start > end)
        !(end < id && id <= start)
    }
}

/// Returns `(id + 2^exponent) mod RING_SIZE`, the target of finger slot `exponent`.
pub fn add_id_power_of_2(id: &NodeId, exponent: u32) -> NodeId {
    let sum = (u64::from(*id) + (1u64 << exponent)) % RING_SIZE;
    sum as NodeId
}

/// Clockwise distance travelled going from `from` to `to`.
pub fn ring_distance(from: &NodeId, to: &NodeId) -> u64 {
    (u64::from(*to) + RING_SIZE - u64::from(*from)) % RING_SIZE
}

/// Hashes arbitrary bytes onto the ring: SHA-256 reduced modulo `RING_SIZE`.
pub fn hash_to_ring(bytes: &[u8]) -> NodeId {
    let digest = Sha256::digest(bytes);
    let reduced = BigUint::from_bytes_be(&digest) % BigUint::from(RING_SIZE);
    reduced.to_u32().unwrap_or_default()
}

/// Identity of a node named by its project and instance discriminator.
pub fn node_identity(project: &str, instance: &str) -> NodeId {
    hash_to_ring(format!("{}_{}", project, instance).as_bytes())
}

/// Ring position of a client key.
pub fn key_position(key: u64) -> NodeId {
    hash_to_ring(key.to_string().as_bytes())
}
