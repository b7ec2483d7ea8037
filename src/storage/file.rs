//! Fixed-page file access.
//!
//! A [`PagedFile`] is a plain file interpreted as a sequence of
//! `PAGE_SIZE`-byte pages. Pages are addressed by 1-based [`PageId`]s so
//! that 0 can serve as "no page" everywhere; page `p` lives at file offset
//! `(p - 1) * PAGE_SIZE`. Allocation only ever appends (the index layer
//! never frees pages), so the set of valid ids is exactly `1..=page_count`.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

use crate::config::PAGE_SIZE;

use super::PageId;

/// The "no page" sentinel. Also marks unused leaf slots and the end of the
/// leaf sibling chain in the index layer.
pub const NO_PAGE: PageId = 0;

#[derive(Error, Debug)]
pub enum FileError {
    /// The page id is 0 or past the end of the file.
    #[error("page {0} is not allocated")]
    InvalidPageId(PageId),
    /// The file on disk cannot be a paged file.
    #[error("file has invalid format: {0}")]
    InvalidFormat(&'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A file of fixed-size pages with stable ids.
#[derive(Debug)]
pub struct PagedFile {
    handle: fs::File,
    page_count: u32,
}

impl PagedFile {
    /// Creates a new, empty paged file. Fails if the path already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, FileError> {
        let handle = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            handle,
            page_count: 0,
        })
    }

    /// Opens an existing paged file, deriving the page count from its size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FileError> {
        let handle = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let len = handle.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(FileError::InvalidFormat(
                "file length is not a multiple of the page size",
            ));
        }
        Ok(Self {
            handle,
            page_count: (len / PAGE_SIZE as u64) as u32,
        })
    }

    /// Whether a paged file exists at `path`.
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().is_file()
    }

    /// The id of the first page of the file, by convention the header page.
    pub fn first_page_id(&self) -> PageId {
        1
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Extends the file by one zeroed page and returns its id.
    pub fn allocate(&mut self) -> Result<PageId, FileError> {
        let id = self.page_count + 1;
        self.handle
            .set_len(id as u64 * PAGE_SIZE as u64)?;
        self.page_count = id;
        Ok(id)
    }

    /// Reads page `id` into `buf`.
    pub fn read_page(&mut self, id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<(), FileError> {
        self.seek_page(id)?;
        self.handle.read_exact(buf)?;
        Ok(())
    }

    /// Writes `buf` to page `id`. The page must already be allocated.
    pub fn write_page(&mut self, id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<(), FileError> {
        self.seek_page(id)?;
        self.handle.write_all(buf)?;
        Ok(())
    }

    /// Forces file contents to disk.
    pub fn sync(&mut self) -> Result<(), FileError> {
        self.handle.sync_all()?;
        Ok(())
    }

    fn seek_page(&mut self, id: PageId) -> Result<(), FileError> {
        if id == NO_PAGE || id > self.page_count {
            return Err(FileError::InvalidPageId(id));
        }
        let offset = (id as u64 - 1) * PAGE_SIZE as u64;
        self.handle.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}
