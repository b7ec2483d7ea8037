//! B+ tree leaf page codec.
//!
//! A leaf is a packed array of `LEAF_CAPACITY` keys, a parallel array of
//! record ids, and a right-sibling page pointer:
//!
//! ```text
//! +---------------------+---------------------+------------------+
//! | keys:  i32 x L      | rids: (u32,u16) x L | right_sib: u32   |
//! +---------------------+---------------------+------------------+
//! ```
//!
//! Occupied slots form a key-ascending prefix of the arrays; a slot is
//! occupied iff its rid has a nonzero page number. `right_sib == 0` marks
//! the end of the leaf chain.

use eyre::{ensure, Result};
use zerocopy::little_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::LEAF_CAPACITY;
use crate::storage::PageId;

use super::Rid;

/// Typed view of a leaf page.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafPage {
    keys: [I32; LEAF_CAPACITY],
    rids: [Rid; LEAF_CAPACITY],
    right_sib: U32,
}

pub const LEAF_PAGE_SIZE: usize = size_of::<LeafPage>();

const _: () = assert!(LEAF_PAGE_SIZE <= crate::config::PAGE_SIZE);

impl LeafPage {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= LEAF_PAGE_SIZE,
            "buffer too small for LeafPage: {} < {}",
            data.len(),
            LEAF_PAGE_SIZE
        );
        Self::ref_from_bytes(&data[..LEAF_PAGE_SIZE])
            .map_err(|e| eyre::eyre!("failed to read LeafPage: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= LEAF_PAGE_SIZE,
            "buffer too small for LeafPage: {} < {}",
            data.len(),
            LEAF_PAGE_SIZE
        );
        Self::mut_from_bytes(&mut data[..LEAF_PAGE_SIZE])
            .map_err(|e| eyre::eyre!("failed to read LeafPage: {:?}", e))
    }

    /// Initialises `data` as an empty leaf: every slot unused, no sibling.
    pub fn init(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= LEAF_PAGE_SIZE,
            "buffer too small for LeafPage: {} < {}",
            data.len(),
            LEAF_PAGE_SIZE
        );
        data[..LEAF_PAGE_SIZE].fill(0);
        Self::from_bytes_mut(data)
    }

    pub fn key_at(&self, index: usize) -> i32 {
        self.keys[index].get()
    }

    pub fn rid_at(&self, index: usize) -> Rid {
        self.rids[index]
    }

    /// Whether slot `index` holds an entry.
    pub fn is_slot_used(&self, index: usize) -> bool {
        self.rids[index].page_no() != 0
    }

    /// A leaf is full when its last slot is occupied.
    pub fn is_full(&self) -> bool {
        self.is_slot_used(LEAF_CAPACITY - 1)
    }

    pub fn is_empty(&self) -> bool {
        !self.is_slot_used(0)
    }

    /// Number of occupied slots.
    pub fn occupancy(&self) -> usize {
        (0..LEAF_CAPACITY)
            .take_while(|&i| self.is_slot_used(i))
            .count()
    }

    pub fn right_sib(&self) -> PageId {
        self.right_sib.get()
    }

    pub fn set_right_sib(&mut self, page_no: PageId) {
        self.right_sib = U32::new(page_no);
    }

    /// Inserts `(key, rid)` into a non-full leaf, keeping the occupied
    /// prefix sorted. Scans right to left, shifting entries with a strictly
    /// greater key one slot right, so a duplicate lands immediately after
    /// the existing copies of its key.
    pub fn insert(&mut self, key: i32, rid: Rid) {
        debug_assert!(!self.is_full(), "leaf insert requires a free last slot");

        if !self.is_empty() {
            for i in (0..LEAF_CAPACITY - 1).rev() {
                if !self.is_slot_used(i) {
                    continue;
                }
                if self.key_at(i) > key {
                    self.keys[i + 1] = self.keys[i];
                    self.rids[i + 1] = self.rids[i];
                } else {
                    self.keys[i + 1] = I32::new(key);
                    self.rids[i + 1] = rid;
                    return;
                }
            }
        }

        self.keys[0] = I32::new(key);
        self.rids[0] = rid;
    }

    /// Removes slots `[mid, LEAF_CAPACITY)` from this leaf and returns them
    /// in order, zeroing the vacated slots. Used as the first half of a
    /// split; the caller installs the result into the new right sibling.
    pub fn split_off_upper(&mut self, mid: usize) -> Vec<(i32, Rid)> {
        let mut moved = Vec::with_capacity(LEAF_CAPACITY - mid);
        for i in mid..LEAF_CAPACITY {
            moved.push((self.key_at(i), self.rid_at(i)));
            self.keys[i] = I32::new(0);
            self.rids[i] = Rid::new(0, 0);
        }
        moved
    }

    /// Installs `entries` into an empty leaf starting at slot 0.
    pub fn install(&mut self, entries: &[(i32, Rid)]) {
        debug_assert!(self.is_empty(), "install target must be an empty leaf");
        for (i, &(key, rid)) in entries.iter().enumerate() {
            self.keys[i] = I32::new(key);
            self.rids[i] = rid;
        }
    }
}
