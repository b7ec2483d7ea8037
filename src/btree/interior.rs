//! B+ tree interior page codec.
//!
//! An interior node routes key lookups to one of `N + 1` children:
//!
//! ```text
//! +------------+------------------+---------------------------+
//! | level: i32 | keys: i32 x N    | children: u32 x (N + 1)   |
//! +------------+------------------+---------------------------+
//! ```
//!
//! `level == 1` means the children are leaves; `level == 0` means they are
//! interior nodes. Occupied children form a prefix; key slot `i` is
//! occupied iff `children[i + 1]` is. For occupied key `i`, the subtree
//! under `children[i]` holds keys `< keys[i]` and the subtree under
//! `children[i + 1]` holds keys `>= keys[i]`.

use eyre::{ensure, Result};
use zerocopy::little_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::INTERIOR_CAPACITY;
use crate::storage::{PageId, NO_PAGE};

/// Typed view of an interior page.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct InteriorPage {
    level: I32,
    keys: [I32; INTERIOR_CAPACITY],
    children: [U32; INTERIOR_CAPACITY + 1],
}

pub const INTERIOR_PAGE_SIZE: usize = size_of::<InteriorPage>();

const _: () = assert!(INTERIOR_PAGE_SIZE <= crate::config::PAGE_SIZE);

impl InteriorPage {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= INTERIOR_PAGE_SIZE,
            "buffer too small for InteriorPage: {} < {}",
            data.len(),
            INTERIOR_PAGE_SIZE
        );
        Self::ref_from_bytes(&data[..INTERIOR_PAGE_SIZE])
            .map_err(|e| eyre::eyre!("failed to read InteriorPage: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= INTERIOR_PAGE_SIZE,
            "buffer too small for InteriorPage: {} < {}",
            data.len(),
            INTERIOR_PAGE_SIZE
        );
        Self::mut_from_bytes(&mut data[..INTERIOR_PAGE_SIZE])
            .map_err(|e| eyre::eyre!("failed to read InteriorPage: {:?}", e))
    }

    /// Initialises `data` as an empty interior node at `level`.
    pub fn init(data: &mut [u8], level: i32) -> Result<&mut Self> {
        ensure!(
            data.len() >= INTERIOR_PAGE_SIZE,
            "buffer too small for InteriorPage: {} < {}",
            data.len(),
            INTERIOR_PAGE_SIZE
        );
        data[..INTERIOR_PAGE_SIZE].fill(0);
        let node = Self::from_bytes_mut(data)?;
        node.set_level(level);
        Ok(node)
    }

    /// `1` if the children are leaves, `0` if they are interior nodes.
    pub fn level(&self) -> i32 {
        self.level.get()
    }

    pub fn set_level(&mut self, level: i32) {
        self.level = I32::new(level);
    }

    pub fn key_at(&self, index: usize) -> i32 {
        self.keys[index].get()
    }

    pub fn set_key(&mut self, index: usize, key: i32) {
        self.keys[index] = I32::new(key);
    }

    pub fn child_at(&self, index: usize) -> PageId {
        self.children[index].get()
    }

    pub fn set_child(&mut self, index: usize, page_no: PageId) {
        self.children[index] = U32::new(page_no);
    }

    /// The node is full when its last child pointer is occupied.
    pub fn is_full(&self) -> bool {
        self.child_at(INTERIOR_CAPACITY) != NO_PAGE
    }

    /// Number of occupied key slots.
    pub fn occupancy(&self) -> usize {
        (0..INTERIOR_CAPACITY)
            .take_while(|&i| self.child_at(i + 1) != NO_PAGE)
            .count()
    }

    /// Child to descend into when inserting `key`: the rightmost child
    /// whose separator is strictly less than `key`, else the first child.
    pub fn route(&self, key: i32) -> PageId {
        for i in (1..=INTERIOR_CAPACITY).rev() {
            if self.child_at(i) != NO_PAGE && self.key_at(i - 1) < key {
                return self.child_at(i);
            }
        }
        self.child_at(0)
    }

    /// Child to descend into when seeking the scan lower bound `low`:
    /// starts at the rightmost occupied child and steps left while the
    /// separator to its left is `>= low`. May land one child left of the
    /// tightest choice; the leaf chain walk absorbs the slack.
    pub fn route_lower_bound(&self, low: i32) -> PageId {
        let mut i = (1..=INTERIOR_CAPACITY)
            .rev()
            .find(|&i| self.child_at(i) != NO_PAGE)
            .unwrap_or(0);
        while i > 0 && self.key_at(i - 1) >= low {
            i -= 1;
        }
        self.child_at(i)
    }

    /// Inserts a pending split entry `(key, page_no)` into a non-full
    /// node: shifts strictly greater keys (with their right children) one
    /// slot right and places `page_no` as the right child of `key`.
    pub fn insert(&mut self, key: i32, page_no: PageId) {
        debug_assert!(!self.is_full(), "interior insert requires a free last child");

        for i in (0..INTERIOR_CAPACITY - 1).rev() {
            if self.child_at(i + 1) == NO_PAGE {
                continue;
            }
            if self.key_at(i) > key {
                self.keys[i + 1] = self.keys[i];
                self.children[i + 2] = self.children[i + 1];
            } else {
                self.keys[i + 1] = I32::new(key);
                self.children[i + 2] = U32::new(page_no);
                return;
            }
        }

        self.keys[0] = I32::new(key);
        self.children[1] = U32::new(page_no);
    }

    /// Removes the push-up key at `pushup` together with everything to its
    /// right and returns `(pushed_key, moved_keys, moved_children)`. The
    /// node must be full. Afterwards this node keeps `keys[0..pushup)` and
    /// `children[0..pushup + 1)`; the moved children start with the child
    /// immediately right of the pushed key, so they pair with the moved
    /// keys as a valid prefix for the new sibling.
    pub fn split_off_upper(&mut self, pushup: usize) -> (i32, Vec<i32>, Vec<PageId>) {
        debug_assert!(self.is_full(), "split requires a full interior node");

        let pushed = self.key_at(pushup);
        let mut moved_keys = Vec::with_capacity(INTERIOR_CAPACITY - pushup - 1);
        let mut moved_children = Vec::with_capacity(INTERIOR_CAPACITY - pushup);

        for i in pushup + 1..INTERIOR_CAPACITY {
            moved_keys.push(self.key_at(i));
        }
        for i in pushup + 1..=INTERIOR_CAPACITY {
            moved_children.push(self.child_at(i));
        }

        for i in pushup..INTERIOR_CAPACITY {
            self.keys[i] = I32::new(0);
        }
        for i in pushup + 1..=INTERIOR_CAPACITY {
            self.children[i] = U32::new(NO_PAGE);
        }

        (pushed, moved_keys, moved_children)
    }

    /// Installs the moved half of a split into an empty node.
    pub fn install_split(&mut self, level: i32, keys: &[i32], children: &[PageId]) {
        debug_assert_eq!(children.len(), keys.len() + 1);
        self.set_level(level);
        for (i, &key) in keys.iter().enumerate() {
            self.keys[i] = I32::new(key);
        }
        for (i, &child) in children.iter().enumerate() {
            self.children[i] = U32::new(child);
        }
    }
}
