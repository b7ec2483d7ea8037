//! # B+ Tree Index Engine
//!
//! [`BTreeIndex`] ties the page codecs to the pager and implements the
//! three public operations: open-or-build, insert, and range scan.
//!
//! ## Pin Choreography
//!
//! Every page the engine touches is pinned through the pager and unpinned
//! exactly once on every path out of the frame that pinned it, dirty iff
//! that frame mutated it. After a public call returns, the only page the
//! engine may still hold pinned is the leaf an active scan is positioned
//! on.
//!
//! ## Insertion
//!
//! Insertion descends recursively from the root. A leaf with a free last
//! slot absorbs the entry by a right-to-left shift; a full leaf splits,
//! copying its upper half into a fresh right sibling and handing a
//! *copy-up* entry (new page, its smallest key) to the parent frame. A
//! full parent splits in turn, *pushing up* its middle key. When the page
//! that split is the current root, a fresh interior root is allocated and
//! the header page is rewritten; this is the only time the header changes
//! after creation.
//!
//! The root starts life as an empty leaf. Whether the root is still a leaf
//! is decided by comparing the current root page id against the initial
//! root page id recorded at creation, which the header persists.
//!
//! ## Scans
//!
//! `start_scan` validates the operator pair and range, descends to the
//! leftmost leaf that can contain the lower bound, and leaves that leaf
//! pinned as the scan position. `scan_next` yields record ids until a key
//! fails the predicate, following right-sibling pointers as leaves are
//! exhausted. `end_scan` releases the position. Completion can release
//! the pinned leaf early (when it runs off the end of the chain), so
//! `end_scan` tolerates an already-released page.

use std::path::Path;

use eyre::{ensure, Result};
use log::debug;

use crate::config::{BUFFER_POOL_CAPACITY, INTERIOR_CAPACITY, LEAF_CAPACITY};
use crate::heap::RecordSource;
use crate::storage::{PagedFile, PageId, Pager, PagerError, NO_PAGE};

use super::interior::InteriorPage;
use super::leaf::LeafPage;
use super::meta::IndexMetaPage;
use super::{index_file_name, AttrType, IndexError, Operator, Rid};

/// A split's contribution to its parent: the new right sibling and the key
/// that separates it from the old node.
struct PendingSplit {
    key: i32,
    page_no: PageId,
}

/// Position of an in-progress scan: the pinned leaf and the slot to look
/// at next, plus the predicate fixed at `start_scan`.
#[derive(Debug)]
struct ScanState {
    low: i32,
    high: i32,
    low_op: Operator,
    high_op: Operator,
    page_id: PageId,
    next_entry: usize,
}

/// A disk-resident B+ tree index over one `i32` attribute of a relation.
#[derive(Debug)]
pub struct BTreeIndex {
    pager: Pager,
    index_name: String,
    header_page_id: PageId,
    root_page_id: PageId,
    initial_root_page_id: PageId,
    scan: Option<ScanState>,
}

impl BTreeIndex {
    /// Opens the index for `relation_name` keyed at `attr_byte_offset`,
    /// creating and bulk-building it from `relation` if the index file
    /// does not exist yet. The file is named `<relation>.<offset>` inside
    /// `dir`; [`BTreeIndex::index_name`] returns that exact name.
    ///
    /// Fails with [`IndexError::BadIndexInfo`] when an existing file's
    /// stored metadata disagrees with the arguments.
    pub fn open<S: RecordSource>(
        dir: &Path,
        relation_name: &str,
        attr_byte_offset: usize,
        attr_type: AttrType,
        relation: &mut S,
    ) -> Result<Self> {
        let index_name = index_file_name(relation_name, attr_byte_offset);
        let path = dir.join(&index_name);

        if PagedFile::exists(&path) {
            debug!("opening existing index file {index_name}");
            Self::open_existing(path, index_name, relation_name, attr_byte_offset, attr_type)
        } else {
            debug!("creating index file {index_name}");
            Self::create(
                path,
                index_name,
                relation_name,
                attr_byte_offset,
                attr_type,
                relation,
            )
        }
    }

    fn open_existing(
        path: std::path::PathBuf,
        index_name: String,
        relation_name: &str,
        attr_byte_offset: usize,
        attr_type: AttrType,
    ) -> Result<Self> {
        let file = PagedFile::open(path)?;
        let mut pager = Pager::new(file, BUFFER_POOL_CAPACITY);
        let header_page_id = pager.first_page_id();

        pager.read_page(header_page_id)?;
        let (name_ok, stored_name, stored_offset, stored_type, root, initial_root) = {
            let meta = IndexMetaPage::from_bytes(pager.page(header_page_id)?)?;
            (
                meta.relation_name_matches(relation_name),
                meta.relation_name(),
                meta.attr_byte_offset(),
                meta.attr_type(),
                meta.root_page(),
                meta.initial_root_page(),
            )
        };
        pager.unpin_page(header_page_id, false)?;

        if !name_ok || stored_offset != attr_byte_offset as i32 || stored_type != attr_type.tag() {
            return Err(IndexError::BadIndexInfo {
                file: index_name,
                detail: format!(
                    "stored ({stored_name:?}, offset {stored_offset}, type {stored_type}) \
                     vs requested ({relation_name:?}, offset {attr_byte_offset}, type {})",
                    attr_type.tag()
                ),
            }
            .into());
        }

        Ok(Self {
            pager,
            index_name,
            header_page_id,
            root_page_id: root,
            initial_root_page_id: initial_root,
            scan: None,
        })
    }

    fn create<S: RecordSource>(
        path: std::path::PathBuf,
        index_name: String,
        relation_name: &str,
        attr_byte_offset: usize,
        attr_type: AttrType,
        relation: &mut S,
    ) -> Result<Self> {
        ensure!(
            attr_type == AttrType::Int,
            "only 32-bit integer keys are supported"
        );

        let file = PagedFile::create(path)?;
        let mut pager = Pager::new(file, BUFFER_POOL_CAPACITY);

        let header_page_id = pager.alloc_page()?;
        let root_page_id = pager.alloc_page()?;

        IndexMetaPage::init(
            pager.page_mut(header_page_id)?,
            relation_name,
            attr_byte_offset as i32,
            attr_type.tag(),
            root_page_id,
        )?;
        LeafPage::init(pager.page_mut(root_page_id)?)?;

        pager.unpin_page(header_page_id, true)?;
        pager.unpin_page(root_page_id, true)?;

        let mut index = Self {
            pager,
            index_name,
            header_page_id,
            root_page_id,
            initial_root_page_id: root_page_id,
            scan: None,
        };

        while let Some((rid, record)) = relation.next_record()? {
            let key = key_from_record(&record, attr_byte_offset)?;
            index.insert_entry(key, rid)?;
        }
        index.pager.flush_file()?;

        Ok(index)
    }

    /// The index file name, `<relation>.<offset>`.
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Number of pages the engine currently holds pinned. Zero between
    /// calls, one while a scan is positioned on a leaf.
    pub fn pinned_pages(&self) -> usize {
        self.pager.pinned_count()
    }

    /// Inserts one `(key, rid)` pair. Duplicate keys coexist; a duplicate
    /// lands after the copies already present.
    pub fn insert_entry(&mut self, key: i32, rid: Rid) -> Result<()> {
        let root_id = self.root_page_id;
        self.pager.read_page(root_id)?;
        let root_is_leaf = root_id == self.initial_root_page_id;
        let pending = self.insert_into(root_id, root_is_leaf, key, rid)?;
        debug_assert!(
            pending.is_none(),
            "a split at the root must be absorbed by promotion"
        );
        Ok(())
    }

    /// Recursive descent step. `page_id` is pinned on entry and released
    /// on every path out. Returns the pending entry a split produced for
    /// the caller's node, if any.
    fn insert_into(
        &mut self,
        page_id: PageId,
        is_leaf: bool,
        key: i32,
        rid: Rid,
    ) -> Result<Option<PendingSplit>> {
        if is_leaf {
            let full = LeafPage::from_bytes(self.pager.page(page_id)?)?.is_full();
            if full {
                return self.split_leaf(page_id, key, rid);
            }
            LeafPage::from_bytes_mut(self.pager.page_mut(page_id)?)?.insert(key, rid);
            self.pager.unpin_page(page_id, true)?;
            return Ok(None);
        }

        let (child_id, child_is_leaf) = {
            let node = InteriorPage::from_bytes(self.pager.page(page_id)?)?;
            (node.route(key), node.level() == 1)
        };
        self.pager.read_page(child_id)?;

        match self.insert_into(child_id, child_is_leaf, key, rid)? {
            None => {
                self.pager.unpin_page(page_id, false)?;
                Ok(None)
            }
            Some(entry) => {
                let full = InteriorPage::from_bytes(self.pager.page(page_id)?)?.is_full();
                if full {
                    return self.split_interior(page_id, entry);
                }
                InteriorPage::from_bytes_mut(self.pager.page_mut(page_id)?)?
                    .insert(entry.key, entry.page_no);
                self.pager.unpin_page(page_id, true)?;
                Ok(None)
            }
        }
    }

    /// Splits the full leaf `page_id` and inserts `(key, rid)` into the
    /// appropriate half. The upper half moves to a fresh right sibling
    /// spliced into the chain; the copy-up entry is the new leaf's
    /// smallest key.
    fn split_leaf(&mut self, page_id: PageId, key: i32, rid: Rid) -> Result<Option<PendingSplit>> {
        let new_page_id = self.pager.alloc_page()?;

        let mid = if LEAF_CAPACITY % 2 == 0 {
            LEAF_CAPACITY / 2
        } else {
            LEAF_CAPACITY / 2 + 1
        };

        let (moved, split_key) = {
            let old = LeafPage::from_bytes_mut(self.pager.page_mut(page_id)?)?;
            let split_key = old.key_at(mid - 1);
            (old.split_off_upper(mid), split_key)
        };

        let old_right = LeafPage::from_bytes(self.pager.page(page_id)?)?.right_sib();
        {
            let new = LeafPage::init(self.pager.page_mut(new_page_id)?)?;
            new.install(&moved);
            new.set_right_sib(old_right);
        }

        if key > split_key {
            LeafPage::from_bytes_mut(self.pager.page_mut(new_page_id)?)?.insert(key, rid);
        } else {
            LeafPage::from_bytes_mut(self.pager.page_mut(page_id)?)?.insert(key, rid);
        }

        LeafPage::from_bytes_mut(self.pager.page_mut(page_id)?)?.set_right_sib(new_page_id);

        // Copy-up: the new leaf's smallest key, read after the insert so a
        // new leading entry is reflected.
        let pending = PendingSplit {
            key: LeafPage::from_bytes(self.pager.page(new_page_id)?)?.key_at(0),
            page_no: new_page_id,
        };

        let was_root = page_id == self.root_page_id;
        self.pager.unpin_page(page_id, true)?;
        self.pager.unpin_page(new_page_id, true)?;

        if was_root {
            self.promote_root(page_id, pending)?;
            Ok(None)
        } else {
            Ok(Some(pending))
        }
    }

    /// Splits the full interior node `page_id` around a push-up key and
    /// homes `entry` in the half that owns its key range.
    fn split_interior(
        &mut self,
        page_id: PageId,
        entry: PendingSplit,
    ) -> Result<Option<PendingSplit>> {
        let new_page_id = self.pager.alloc_page()?;

        let mid = INTERIOR_CAPACITY / 2;
        let pushup = if INTERIOR_CAPACITY % 2 == 0 {
            let mid_key = InteriorPage::from_bytes(self.pager.page(page_id)?)?.key_at(mid);
            if entry.key < mid_key {
                mid - 1
            } else {
                mid
            }
        } else {
            mid
        };

        let (pushed_key, moved_keys, moved_children, level) = {
            let old = InteriorPage::from_bytes_mut(self.pager.page_mut(page_id)?)?;
            let level = old.level();
            let (pushed, keys, children) = old.split_off_upper(pushup);
            (pushed, keys, children, level)
        };

        {
            let new = InteriorPage::init(self.pager.page_mut(new_page_id)?, level)?;
            new.install_split(level, &moved_keys, &moved_children);
        }

        // The pushed key separates the halves: entries below it belong to
        // the old node, entries at or above it to the new one.
        if entry.key < pushed_key {
            InteriorPage::from_bytes_mut(self.pager.page_mut(page_id)?)?
                .insert(entry.key, entry.page_no);
        } else {
            InteriorPage::from_bytes_mut(self.pager.page_mut(new_page_id)?)?
                .insert(entry.key, entry.page_no);
        }

        let pending = PendingSplit {
            key: pushed_key,
            page_no: new_page_id,
        };

        let was_root = page_id == self.root_page_id;
        self.pager.unpin_page(page_id, true)?;
        self.pager.unpin_page(new_page_id, true)?;

        if was_root {
            self.promote_root(page_id, pending)?;
            Ok(None)
        } else {
            Ok(Some(pending))
        }
    }

    /// Installs a new interior root above `old_root_id` and its new
    /// sibling, then rewrites the header's root pointer. The header page
    /// is touched only after the new root is fully written.
    fn promote_root(&mut self, old_root_id: PageId, pending: PendingSplit) -> Result<()> {
        let new_root_id = self.pager.alloc_page()?;
        let level = if old_root_id == self.initial_root_page_id {
            1
        } else {
            0
        };
        {
            let root = InteriorPage::init(self.pager.page_mut(new_root_id)?, level)?;
            root.set_key(0, pending.key);
            root.set_child(0, old_root_id);
            root.set_child(1, pending.page_no);
        }

        self.pager.read_page(self.header_page_id)?;
        IndexMetaPage::from_bytes_mut(self.pager.page_mut(self.header_page_id)?)?
            .set_root_page(new_root_id);
        self.pager.unpin_page(self.header_page_id, true)?;

        self.root_page_id = new_root_id;
        self.pager.unpin_page(new_root_id, true)?;

        debug!(
            "promoted root of {} to page {new_root_id} (level {level})",
            self.index_name
        );
        Ok(())
    }

    /// Begins a range scan over `(low, high)` with the given bound
    /// operators. On success one leaf stays pinned as the scan position.
    ///
    /// Fails with [`IndexError::BadOpcodes`] unless `low_op` is `Gt`/`Gte`
    /// and `high_op` is `Lt`/`Lte`, with [`IndexError::BadScanrange`] when
    /// `low > high`, and with [`IndexError::NoSuchKeyFound`] when no key
    /// satisfies the predicate. An already-running scan is ended first.
    pub fn start_scan(
        &mut self,
        low: i32,
        low_op: Operator,
        high: i32,
        high_op: Operator,
    ) -> Result<()> {
        let low_ok = matches!(low_op, Operator::Gt | Operator::Gte);
        let high_ok = matches!(high_op, Operator::Lt | Operator::Lte);
        if !low_ok || !high_ok {
            return Err(IndexError::BadOpcodes {
                low: low_op,
                high: high_op,
            }
            .into());
        }
        if low > high {
            return Err(IndexError::BadScanrange { low, high }.into());
        }

        if self.scan.is_some() {
            self.end_scan()?;
        }

        let mut page_id = self.root_page_id;
        self.pager.read_page(page_id)?;

        if self.root_page_id != self.initial_root_page_id {
            // Descend towards the lower bound; the loop leaves a pinned
            // leaf once it steps through a level-1 node.
            loop {
                let (child_id, children_are_leaves) = {
                    let node = InteriorPage::from_bytes(self.pager.page(page_id)?)?;
                    (node.route_lower_bound(low), node.level() == 1)
                };
                self.pager.unpin_page(page_id, false)?;
                self.pager.read_page(child_id)?;
                page_id = child_id;
                if children_are_leaves {
                    break;
                }
            }
        }

        loop {
            let probe = {
                let leaf = LeafPage::from_bytes(self.pager.page(page_id)?)?;
                probe_leaf(leaf, low, low_op, high, high_op)
            };
            match probe {
                LeafProbe::Match(entry) => {
                    self.scan = Some(ScanState {
                        low,
                        high,
                        low_op,
                        high_op,
                        page_id,
                        next_entry: entry,
                    });
                    return Ok(());
                }
                LeafProbe::NoMatch => {
                    self.pager.unpin_page(page_id, false)?;
                    return Err(IndexError::NoSuchKeyFound.into());
                }
                LeafProbe::Continue(right) => {
                    self.pager.unpin_page(page_id, false)?;
                    self.pager.read_page(right)?;
                    page_id = right;
                }
            }
        }
    }

    /// Returns the record id of the next entry matching the scan
    /// predicate, advancing the position.
    ///
    /// Fails with [`IndexError::ScanNotInitialized`] when no scan is
    /// active and with [`IndexError::IndexScanCompleted`] once every
    /// matching entry has been returned.
    pub fn scan_next(&mut self) -> Result<Rid> {
        let state = self
            .scan
            .as_mut()
            .ok_or(IndexError::ScanNotInitialized)?;

        let (exhausted, right) = {
            let leaf = LeafPage::from_bytes(self.pager.page(state.page_id)?)?;
            let exhausted =
                state.next_entry >= LEAF_CAPACITY || !leaf.is_slot_used(state.next_entry);
            (exhausted, leaf.right_sib())
        };

        if exhausted {
            self.pager.unpin_page(state.page_id, false)?;
            if right == NO_PAGE {
                return Err(IndexError::IndexScanCompleted.into());
            }
            self.pager.read_page(right)?;
            state.page_id = right;
            state.next_entry = 0;
        }

        let (key, rid) = {
            let leaf = LeafPage::from_bytes(self.pager.page(state.page_id)?)?;
            (leaf.key_at(state.next_entry), leaf.rid_at(state.next_entry))
        };

        if key_satisfies(key, state.low, state.low_op, state.high, state.high_op) {
            state.next_entry += 1;
            Ok(rid)
        } else {
            Err(IndexError::IndexScanCompleted.into())
        }
    }

    /// Ends the current scan and releases its pinned leaf.
    ///
    /// Fails with [`IndexError::ScanNotInitialized`] when no scan is
    /// active. A scan whose completion already released the leaf ends
    /// cleanly.
    pub fn end_scan(&mut self) -> Result<()> {
        let state = self.scan.take().ok_or(IndexError::ScanNotInitialized)?;
        match self.pager.unpin_page(state.page_id, false) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.downcast_ref::<PagerError>(), Some(PagerError::PageNotPinned(_))) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for BTreeIndex {
    fn drop(&mut self) {
        if self.scan.is_some() {
            if let Err(e) = self.end_scan() {
                log::error!("failed to end scan while closing {}: {e}", self.index_name);
            }
        }
        if let Err(e) = self.pager.flush_file() {
            log::error!("failed to flush index file {}: {e}", self.index_name);
        }
    }
}

/// Extracts the `i32` key at `attr_byte_offset` from a base-relation
/// record.
fn key_from_record(record: &[u8], attr_byte_offset: usize) -> Result<i32> {
    let end = attr_byte_offset + 4;
    ensure!(
        record.len() >= end,
        "record of {} bytes has no i32 attribute at offset {}",
        record.len(),
        attr_byte_offset
    );
    let bytes: [u8; 4] = record[attr_byte_offset..end].try_into()?;
    Ok(i32::from_le_bytes(bytes))
}

enum LeafProbe {
    /// Slot index of the first entry satisfying the predicate.
    Match(usize),
    /// No entry can satisfy the predicate on this leaf or to its right.
    NoMatch,
    /// Leaf exhausted without passing the high bound; continue right.
    Continue(PageId),
}

/// Scans a leaf left to right for the first entry inside the range.
fn probe_leaf(leaf: &LeafPage, low: i32, low_op: Operator, high: i32, high_op: Operator) -> LeafProbe {
    if leaf.is_empty() {
        return LeafProbe::NoMatch;
    }
    for i in 0..LEAF_CAPACITY {
        if !leaf.is_slot_used(i) {
            break;
        }
        let key = leaf.key_at(i);
        if key_satisfies(key, low, low_op, high, high_op) {
            return LeafProbe::Match(i);
        }
        if past_high(key, high, high_op) {
            return LeafProbe::NoMatch;
        }
    }
    match leaf.right_sib() {
        NO_PAGE => LeafProbe::NoMatch,
        right => LeafProbe::Continue(right),
    }
}

/// Whether `key` lies inside the scan range. The operators have been
/// validated by `start_scan`: `low_op` is `Gt`/`Gte`, `high_op` `Lt`/`Lte`.
fn key_satisfies(key: i32, low: i32, low_op: Operator, high: i32, high_op: Operator) -> bool {
    let above = if low_op == Operator::Gt {
        key > low
    } else {
        key >= low
    };
    let below = if high_op == Operator::Lt {
        key < high
    } else {
        key <= high
    };
    above && below
}

/// Whether `key` already lies past the high bound, so no later entry can
/// match either.
fn past_high(key: i32, high: i32, high_op: Operator) -> bool {
    if high_op == Operator::Lt {
        key >= high
    } else {
        key > high
    }
}
