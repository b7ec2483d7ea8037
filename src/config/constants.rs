//! # Configuration Constants
//!
//! This module centralizes the geometry of the on-disk format. The node
//! capacities are derived from the page size, and the derivations are pinned
//! by compile-time assertions so the three numbers can never drift apart.
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> LEAF_CAPACITY      (derived: keys + rids + sibling pointer)
//!       │
//!       ├─> INTERIOR_CAPACITY  (derived: level + keys + child pointers)
//!       │
//!       └─> META_HEADER_SIZE   (64 bytes at the start of the header page)
//! ```
//!
//! Changing `PAGE_SIZE` changes the capacities and therefore the file format;
//! existing index files become unreadable.

/// Size of each page in bytes. The fundamental unit of I/O and pinning.
pub const PAGE_SIZE: usize = 4096;

/// Size of an index key on disk (`i32`).
pub const KEY_SIZE: usize = 4;

/// Size of a record id on disk (`u32` page number + `u16` slot number).
pub const RID_SIZE: usize = 6;

/// Size of a page id on disk (`u32`).
pub const PAGE_ID_SIZE: usize = 4;

/// Number of `(key, rid)` slots in a leaf node.
///
/// A leaf is `keys[L] · rids[L] · right_sibling`, packed.
pub const LEAF_CAPACITY: usize = (PAGE_SIZE - PAGE_ID_SIZE) / (KEY_SIZE + RID_SIZE);

/// Number of key slots in an interior node; child pointers are one more.
///
/// An interior node is `level · keys[N] · children[N + 1]`, packed.
pub const INTERIOR_CAPACITY: usize = (PAGE_SIZE - KEY_SIZE - PAGE_ID_SIZE) / (KEY_SIZE + PAGE_ID_SIZE);

/// Size of the index metadata record at the start of the header page.
pub const META_HEADER_SIZE: usize = 64;

/// Number of page frames in the buffer pool.
///
/// Inserts pin at most one page per tree level plus the two halves of a
/// split; scans pin a single leaf. 64 frames leaves ample headroom while
/// keeping the pool small enough to exercise eviction in tests.
pub const BUFFER_POOL_CAPACITY: usize = 64;

const _: () = assert!(
    LEAF_CAPACITY * (KEY_SIZE + RID_SIZE) + PAGE_ID_SIZE <= PAGE_SIZE,
    "leaf layout must fit in a page"
);

const _: () = assert!(
    KEY_SIZE + INTERIOR_CAPACITY * KEY_SIZE + (INTERIOR_CAPACITY + 1) * PAGE_ID_SIZE <= PAGE_SIZE,
    "interior layout must fit in a page"
);

const _: () = assert!(
    META_HEADER_SIZE <= PAGE_SIZE,
    "meta header must fit in the header page"
);
