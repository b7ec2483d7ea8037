//! # Pin-Counting Buffer Pool
//!
//! The [`Pager`] keeps a bounded set of page frames in memory and mediates
//! every page access of the index engine. The protocol is:
//!
//! 1. `read_page(id)` / `alloc_page()` bring a page into a frame and take
//!    one pin on it.
//! 2. `page(id)` / `page_mut(id)` hand out the frame's bytes; both refuse
//!    to touch a page that is not currently pinned.
//! 3. `unpin_page(id, dirty)` releases one pin and ors in the dirty flag.
//!    A page is marked dirty iff some caller mutated it after acquisition.
//! 4. Frames with a zero pin count are eligible for eviction; dirty frames
//!    are written back first.
//!
//! Eviction is a second-chance sweep: each frame carries a `visited` flag
//! set on access; the sweep hand clears the flag on the first encounter and
//! evicts on the second. Pinned frames are always skipped. If every frame
//! is pinned the pool refuses the request with [`PagerError::PoolExhausted`]
//! rather than blocking.
//!
//! `flush_file` refuses to run while any page is pinned
//! ([`PagerError::PagePinned`]), then writes back all dirty frames and
//! syncs the file.

use std::collections::HashMap;

use eyre::Result;
use thiserror::Error;

use crate::config::PAGE_SIZE;

use super::file::PagedFile;
use super::PageId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PagerError {
    /// The page has no outstanding pin (or is not resident at all).
    #[error("page {0} is not pinned")]
    PageNotPinned(PageId),
    /// `flush_file` was called while a page still holds a pin.
    #[error("page {0} is still pinned")]
    PagePinned(PageId),
    /// Every frame is pinned; nothing can be evicted.
    #[error("buffer pool exhausted: all {0} frames are pinned")]
    PoolExhausted(usize),
}

#[derive(Debug)]
struct Frame {
    page_id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
    pin_count: u32,
    dirty: bool,
    visited: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            page_id: super::NO_PAGE,
            data: Box::new([0u8; PAGE_SIZE]),
            pin_count: 0,
            dirty: false,
            visited: false,
        }
    }
}

/// Buffer pool over a [`PagedFile`].
#[derive(Debug)]
pub struct Pager {
    file: PagedFile,
    frames: Vec<Frame>,
    resident: HashMap<PageId, usize>,
    hand: usize,
    capacity: usize,
}

impl Pager {
    pub fn new(file: PagedFile, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer pool needs at least one frame");
        Self {
            file,
            frames: Vec::with_capacity(capacity),
            resident: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    /// The id of the file's first page (the index header page).
    pub fn first_page_id(&self) -> PageId {
        self.file.first_page_id()
    }

    pub fn page_count(&self) -> u32 {
        self.file.page_count()
    }

    /// Number of pages currently holding at least one pin.
    pub fn pinned_count(&self) -> usize {
        self.frames.iter().filter(|f| f.pin_count > 0).count()
    }

    /// Pins page `id`, reading it from disk if it is not resident.
    pub fn read_page(&mut self, id: PageId) -> Result<()> {
        if let Some(&idx) = self.resident.get(&id) {
            let frame = &mut self.frames[idx];
            frame.pin_count += 1;
            frame.visited = true;
            return Ok(());
        }

        let idx = self.acquire_frame()?;
        self.file.read_page(id, &mut self.frames[idx].data)?;
        self.install(idx, id);
        Ok(())
    }

    /// Allocates a fresh zeroed page, pinned.
    pub fn alloc_page(&mut self) -> Result<PageId> {
        let id = self.file.allocate()?;
        let idx = self.acquire_frame()?;
        self.frames[idx].data.fill(0);
        self.install(idx, id);
        Ok(id)
    }

    /// The bytes of pinned page `id`.
    pub fn page(&self, id: PageId) -> Result<&[u8]> {
        let idx = self.pinned_frame(id)?;
        Ok(&self.frames[idx].data[..])
    }

    /// The bytes of pinned page `id`, mutably. The caller still declares
    /// dirtiness at unpin time.
    pub fn page_mut(&mut self, id: PageId) -> Result<&mut [u8]> {
        let idx = self.pinned_frame(id)?;
        Ok(&mut self.frames[idx].data[..])
    }

    /// Releases one pin on page `id`; `dirty` records whether the caller
    /// mutated the page while holding the pin.
    pub fn unpin_page(&mut self, id: PageId, dirty: bool) -> Result<()> {
        let idx = self.pinned_frame(id)?;
        let frame = &mut self.frames[idx];
        frame.pin_count -= 1;
        frame.dirty |= dirty;
        Ok(())
    }

    /// Writes back every dirty frame and syncs the file. Fails with
    /// [`PagerError::PagePinned`] if any page still holds a pin.
    pub fn flush_file(&mut self) -> Result<()> {
        if let Some(frame) = self.frames.iter().find(|f| f.pin_count > 0) {
            return Err(PagerError::PagePinned(frame.page_id).into());
        }
        for frame in &mut self.frames {
            if frame.dirty {
                self.file.write_page(frame.page_id, &frame.data)?;
                frame.dirty = false;
            }
        }
        self.file.sync()?;
        Ok(())
    }

    fn pinned_frame(&self, id: PageId) -> Result<usize, PagerError> {
        match self.resident.get(&id) {
            Some(&idx) if self.frames[idx].pin_count > 0 => Ok(idx),
            _ => Err(PagerError::PageNotPinned(id)),
        }
    }

    fn install(&mut self, idx: usize, id: PageId) {
        let frame = &mut self.frames[idx];
        frame.page_id = id;
        frame.pin_count = 1;
        frame.dirty = false;
        frame.visited = true;
        self.resident.insert(id, idx);
    }

    /// Finds a free frame, growing the pool up to capacity and evicting an
    /// unpinned frame beyond that. The returned frame is unmapped.
    fn acquire_frame(&mut self) -> Result<usize> {
        if self.frames.len() < self.capacity {
            self.frames.push(Frame::new());
            return Ok(self.frames.len() - 1);
        }

        if self.frames.iter().all(|f| f.pin_count > 0) {
            return Err(PagerError::PoolExhausted(self.capacity).into());
        }

        // Second chance: clear `visited` on the first pass over a frame,
        // evict on the second. Terminates because at least one frame is
        // unpinned and loses its visited flag after one revolution.
        loop {
            let idx = self.hand;
            self.hand = (self.hand + 1) % self.frames.len();

            let frame = &mut self.frames[idx];
            if frame.pin_count > 0 {
                continue;
            }
            if frame.visited {
                frame.visited = false;
                continue;
            }

            if frame.dirty {
                self.file.write_page(frame.page_id, &frame.data)?;
                frame.dirty = false;
            }
            self.resident.remove(&frame.page_id);
            return Ok(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_pager(capacity: usize) -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let file = PagedFile::create(dir.path().join("idx")).unwrap();
        (dir, Pager::new(file, capacity))
    }

    #[test]
    fn alloc_page_pins_and_zeroes() {
        let (_dir, mut pager) = make_pager(4);

        let id = pager.alloc_page().unwrap();
        assert_eq!(id, 1);
        assert_eq!(pager.pinned_count(), 1);
        assert!(pager.page(id).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn page_access_requires_a_pin() {
        let (_dir, mut pager) = make_pager(4);
        let id = pager.alloc_page().unwrap();
        pager.unpin_page(id, false).unwrap();

        let err = pager.page(id).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PagerError>(),
            Some(&PagerError::PageNotPinned(id))
        );
    }

    #[test]
    fn unpin_without_pin_is_an_error() {
        let (_dir, mut pager) = make_pager(4);
        let id = pager.alloc_page().unwrap();
        pager.unpin_page(id, false).unwrap();

        let err = pager.unpin_page(id, false).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PagerError>(),
            Some(&PagerError::PageNotPinned(id))
        );
    }

    #[test]
    fn pins_are_counted_per_caller() {
        let (_dir, mut pager) = make_pager(4);
        let id = pager.alloc_page().unwrap();
        pager.read_page(id).unwrap();

        assert_eq!(pager.pinned_count(), 1);
        pager.unpin_page(id, false).unwrap();
        assert!(pager.page(id).is_ok());
        pager.unpin_page(id, true).unwrap();
        assert!(pager.page(id).is_err());
    }

    #[test]
    fn flush_refuses_while_pinned() {
        let (_dir, mut pager) = make_pager(4);
        let id = pager.alloc_page().unwrap();

        let err = pager.flush_file().unwrap_err();
        assert_eq!(
            err.downcast_ref::<PagerError>(),
            Some(&PagerError::PagePinned(id))
        );

        pager.unpin_page(id, true).unwrap();
        pager.flush_file().unwrap();
    }

    #[test]
    fn dirty_pages_survive_flush_and_reread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        {
            let file = PagedFile::create(&path).unwrap();
            let mut pager = Pager::new(file, 4);
            let id = pager.alloc_page().unwrap();
            pager.page_mut(id).unwrap()[0] = 0xCD;
            pager.unpin_page(id, true).unwrap();
            pager.flush_file().unwrap();
        }

        let file = PagedFile::open(&path).unwrap();
        let mut pager = Pager::new(file, 4);
        pager.read_page(1).unwrap();
        assert_eq!(pager.page(1).unwrap()[0], 0xCD);
        pager.unpin_page(1, false).unwrap();
    }

    #[test]
    fn eviction_writes_back_dirty_frames() {
        let (_dir, mut pager) = make_pager(2);

        let first = pager.alloc_page().unwrap();
        pager.page_mut(first).unwrap()[0] = 0x11;
        pager.unpin_page(first, true).unwrap();

        // Fill the pool and force the dirty frame out.
        for _ in 0..3 {
            let id = pager.alloc_page().unwrap();
            pager.unpin_page(id, false).unwrap();
        }

        pager.read_page(first).unwrap();
        assert_eq!(pager.page(first).unwrap()[0], 0x11);
        pager.unpin_page(first, false).unwrap();
    }

    #[test]
    fn pool_of_all_pinned_frames_is_exhausted() {
        let (_dir, mut pager) = make_pager(2);
        pager.alloc_page().unwrap();
        pager.alloc_page().unwrap();

        let err = pager.alloc_page().unwrap_err();
        assert_eq!(
            err.downcast_ref::<PagerError>(),
            Some(&PagerError::PoolExhausted(2))
        );
    }

    #[test]
    fn pinned_frames_are_never_evicted() {
        let (_dir, mut pager) = make_pager(2);
        let keep = pager.alloc_page().unwrap();
        pager.page_mut(keep).unwrap()[7] = 0x77;

        let spare = pager.alloc_page().unwrap();
        pager.unpin_page(spare, false).unwrap();

        // Each new allocation can only recycle the unpinned frame.
        for _ in 0..4 {
            let id = pager.alloc_page().unwrap();
            pager.unpin_page(id, false).unwrap();
        }

        assert_eq!(pager.page(keep).unwrap()[7], 0x77);
        pager.unpin_page(keep, false).unwrap();
    }
}
