//! Constants fixing the canonical node encoding and cache defaults.

/// First byte of an encoded leaf node.
pub const NODE_PREFIX_LEAF: u8 = 0x00;
/// First byte of an encoded internal node.
pub const NODE_PREFIX_INTERNAL: u8 = 0x01;
/// Marker byte standing in for an absent inline leaf.
pub const NODE_PREFIX_NIL: u8 = 0x02;

/// Default bound on the number of nodes resident in a tree's cache.
pub const DEFAULT_NODE_CAPACITY: usize = 50_000;
/// Default bound on the total bytes of leaf values resident in a tree's cache.
pub const DEFAULT_VALUE_CAPACITY: usize = 16 * 1024 * 1024;
