//! Base relation storage.
//!
//! A [`HeapFile`] stores fixed-length records on pages: the first page is a
//! small header (magic, record length, record count), every later page is
//! a `used: u16` counter followed by packed records. Records are addressed
//! by [`Rid`]s whose page number is the heap page id, so a rid's page
//! number is never zero.
//!
//! The index build driver consumes the relation through the
//! [`RecordSource`] seam; [`HeapScan`] walks the pages in order and is the
//! standard implementation. End of relation is the scanner returning
//! `Ok(None)`.

use std::path::Path;

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_SIZE;
use crate::storage::{PagedFile, PageId};
use crate::btree::Rid;

const HEAP_MAGIC: &[u8; 16] = b"settdb heap\x00\x00\x00\x00\x00";
const HEAP_VERSION: u32 = 1;
const HEAP_PAGE_HEADER_SIZE: usize = 2;

/// Yields the records of a base relation in storage order. The build
/// driver pulls records until `Ok(None)`.
pub trait RecordSource {
    fn next_record(&mut self) -> Result<Option<(Rid, Vec<u8>)>>;
}

/// A `RecordSource` over nothing; builds an empty index.
pub struct EmptySource;

impl RecordSource for EmptySource {
    fn next_record(&mut self) -> Result<Option<(Rid, Vec<u8>)>> {
        Ok(None)
    }
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HeapFileHeader {
    magic: [u8; 16],
    version: U32,
    record_len: U32,
    record_count: U32,
    reserved: [u8; 4],
}

const _: () = assert!(size_of::<HeapFileHeader>() == 32);

impl HeapFileHeader {
    fn from_bytes(data: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read HeapFileHeader: {:?}", e))?;
        ensure!(&header.magic == HEAP_MAGIC, "invalid magic bytes in heap file");
        ensure!(
            header.version.get() == HEAP_VERSION,
            "unsupported heap file version: {}",
            header.version.get()
        );
        Ok(header)
    }

    fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read HeapFileHeader: {:?}", e))
    }
}

/// A file of fixed-length records, append-only.
pub struct HeapFile {
    file: PagedFile,
    record_len: usize,
    record_count: u32,
    page_buf: Box<[u8; PAGE_SIZE]>,
}

impl HeapFile {
    /// Creates an empty heap file for records of `record_len` bytes.
    pub fn create<P: AsRef<Path>>(path: P, record_len: usize) -> Result<Self> {
        ensure!(
            record_len > 0 && record_len <= PAGE_SIZE - HEAP_PAGE_HEADER_SIZE,
            "record length {} does not fit a page",
            record_len
        );

        let mut file = PagedFile::create(path)?;
        let header_page = file.allocate()?;

        let mut page_buf = Box::new([0u8; PAGE_SIZE]);
        page_buf[..16].copy_from_slice(HEAP_MAGIC);
        {
            let header = HeapFileHeader::from_bytes_mut(&mut page_buf[..])?;
            header.version = U32::new(HEAP_VERSION);
            header.record_len = U32::new(record_len as u32);
            header.record_count = U32::new(0);
        }
        file.write_page(header_page, &page_buf)?;

        Ok(Self {
            file,
            record_len,
            record_count: 0,
            page_buf,
        })
    }

    /// Opens an existing heap file and reads its geometry.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = PagedFile::open(path)?;
        let mut page_buf = Box::new([0u8; PAGE_SIZE]);
        file.read_page(file.first_page_id(), &mut page_buf)?;
        let (record_len, record_count) = {
            let header = HeapFileHeader::from_bytes(&page_buf[..])?;
            (header.record_len.get() as usize, header.record_count.get())
        };
        Ok(Self {
            file,
            record_len,
            record_count,
            page_buf,
        })
    }

    pub fn record_len(&self) -> usize {
        self.record_len
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    fn records_per_page(&self) -> usize {
        (PAGE_SIZE - HEAP_PAGE_HEADER_SIZE) / self.record_len
    }

    /// Appends one record and returns its rid.
    pub fn append(&mut self, record: &[u8]) -> Result<Rid> {
        ensure!(
            record.len() == self.record_len,
            "record of {} bytes does not match record length {}",
            record.len(),
            self.record_len
        );

        let per_page = self.records_per_page();
        let last_data_page = self.file.page_count();

        let (page_id, slot) = if last_data_page < 2 {
            (self.file.allocate()?, 0u16)
        } else {
            self.file.read_page(last_data_page, &mut self.page_buf)?;
            let used = page_used(&self.page_buf);
            if (used as usize) < per_page {
                (last_data_page, used)
            } else {
                (self.file.allocate()?, 0u16)
            }
        };

        if slot == 0 {
            self.page_buf.fill(0);
        }
        let offset = HEAP_PAGE_HEADER_SIZE + slot as usize * self.record_len;
        self.page_buf[offset..offset + self.record_len].copy_from_slice(record);
        set_page_used(&mut self.page_buf, slot + 1);
        self.file.write_page(page_id, &self.page_buf)?;

        self.record_count += 1;
        self.sync_header()?;

        Ok(Rid::new(page_id, slot))
    }

    /// An in-order scan over all records.
    pub fn scan(&mut self) -> HeapScan<'_> {
        HeapScan {
            heap: self,
            page_id: 1,
            slot: 0,
            page_used: 0,
        }
    }

    fn sync_header(&mut self) -> Result<()> {
        let header_page = self.file.first_page_id();
        self.file.read_page(header_page, &mut self.page_buf)?;
        {
            let header = HeapFileHeader::from_bytes_mut(&mut self.page_buf[..])?;
            header.record_count = U32::new(self.record_count);
        }
        self.file.write_page(header_page, &self.page_buf)?;
        Ok(())
    }
}

fn page_used(page: &[u8; PAGE_SIZE]) -> u16 {
    u16::from_le_bytes([page[0], page[1]])
}

fn set_page_used(page: &mut [u8; PAGE_SIZE], used: u16) {
    page[..2].copy_from_slice(&used.to_le_bytes());
}

/// Iterates a heap file's records in `(page, slot)` order.
pub struct HeapScan<'f> {
    heap: &'f mut HeapFile,
    page_id: PageId,
    slot: u16,
    page_used: u16,
}

impl RecordSource for HeapScan<'_> {
    fn next_record(&mut self) -> Result<Option<(Rid, Vec<u8>)>> {
        loop {
            if self.page_id > 1 && self.slot < self.page_used {
                let offset = HEAP_PAGE_HEADER_SIZE + self.slot as usize * self.heap.record_len;
                let record = self.heap.page_buf[offset..offset + self.heap.record_len].to_vec();
                let rid = Rid::new(self.page_id, self.slot);
                self.slot += 1;
                return Ok(Some((rid, record)));
            }

            if self.page_id >= self.heap.file.page_count() {
                return Ok(None);
            }
            self.page_id += 1;
            self.slot = 0;
            self.heap
                .file
                .read_page(self.page_id, &mut self.heap.page_buf)?;
            self.page_used = page_used(&self.heap.page_buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_assigns_rids_from_page_two() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::create(dir.path().join("rel"), 8).unwrap();

        let first = heap.append(&[1u8; 8]).unwrap();
        let second = heap.append(&[2u8; 8]).unwrap();

        assert_eq!(first, Rid::new(2, 0));
        assert_eq!(second, Rid::new(2, 1));
        assert_eq!(heap.record_count(), 2);
    }

    #[test]
    fn append_rejects_wrong_record_length() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::create(dir.path().join("rel"), 8).unwrap();
        assert!(heap.append(&[0u8; 7]).is_err());
    }

    #[test]
    fn records_overflow_onto_new_pages() {
        let dir = tempdir().unwrap();
        let record_len = 512;
        let mut heap = HeapFile::create(dir.path().join("rel"), record_len).unwrap();
        let per_page = (PAGE_SIZE - HEAP_PAGE_HEADER_SIZE) / record_len;

        let mut last_rid = Rid::new(0, 0);
        for i in 0..per_page + 1 {
            last_rid = heap.append(&vec![i as u8; record_len]).unwrap();
        }

        assert_eq!(last_rid, Rid::new(3, 0));
    }

    #[test]
    fn scan_yields_records_in_append_order() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::create(dir.path().join("rel"), 4).unwrap();

        let mut rids = Vec::new();
        for i in 0..2500u32 {
            rids.push(heap.append(&i.to_le_bytes()).unwrap());
        }

        let mut scan = heap.scan();
        let mut seen = 0u32;
        while let Some((rid, record)) = scan.next_record().unwrap() {
            assert_eq!(rid, rids[seen as usize]);
            assert_eq!(record, seen.to_le_bytes());
            seen += 1;
        }
        assert_eq!(seen, 2500);
    }

    #[test]
    fn empty_heap_scan_ends_immediately() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::create(dir.path().join("rel"), 4).unwrap();
        assert!(heap.scan().next_record().unwrap().is_none());
    }

    #[test]
    fn reopen_recovers_geometry_and_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rel");
        {
            let mut heap = HeapFile::create(&path, 4).unwrap();
            for i in 0..10u32 {
                heap.append(&i.to_le_bytes()).unwrap();
            }
        }

        let mut heap = HeapFile::open(&path).unwrap();
        assert_eq!(heap.record_len(), 4);
        assert_eq!(heap.record_count(), 10);

        let mut scan = heap.scan();
        let mut count = 0;
        while scan.next_record().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 10);
    }
}
