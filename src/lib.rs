//! # settdb
//!
//! A disk-resident B+ tree secondary-index engine. Given a base relation
//! of fixed-length records, settdb builds and maintains a clustered index
//! over one `i32` attribute at a fixed byte offset, supports
//! duplicate-preserving inserts of `(key, rid)` pairs, and serves ordered
//! range scans with independently strict or non-strict bounds.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │        BTreeIndex (btree::tree)       │   open/build, insert, scan
//! ├─────────────┬────────────┬────────────┤
//! │  LeafPage   │ Interior-  │ IndexMeta- │   zerocopy page codecs
//! │             │ Page       │ Page       │
//! ├─────────────┴────────────┴────────────┤
//! │        Pager (pin-counting pool)      │   read/alloc/unpin/flush
//! ├───────────────────────────────────────┤
//! │        PagedFile (fixed pages)        │   stable 1-based page ids
//! └───────────────────────────────────────┘
//! ```
//!
//! The base relation lives in a separate [`heap::HeapFile`]; at index
//! creation the build driver scans it through the [`heap::RecordSource`]
//! seam and inserts every record.
//!
//! ## Example
//!
//! ```no_run
//! use settdb::{AttrType, BTreeIndex, HeapFile, Operator};
//!
//! # fn main() -> eyre::Result<()> {
//! let dir = std::path::Path::new("/tmp/db");
//! let mut relation = HeapFile::create(dir.join("orders"), 16)?;
//! for i in 0..1000i32 {
//!     let mut record = [0u8; 16];
//!     record[..4].copy_from_slice(&i.to_le_bytes());
//!     relation.append(&record)?;
//! }
//!
//! let mut index = BTreeIndex::open(dir, "orders", 0, AttrType::Int, &mut relation.scan())?;
//!
//! index.start_scan(100, Operator::Gte, 200, Operator::Lt)?;
//! while let Ok(rid) = index.scan_next() {
//!     println!("{rid:?}");
//! }
//! index.end_scan()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Scope
//!
//! Single-threaded. Inserts and scans only: no deletion, no rebalancing,
//! no write-ahead logging. Keys are 32-bit signed integers.

mod macros;

pub mod btree;
pub mod config;
pub mod heap;
pub mod storage;

pub use btree::{index_file_name, AttrType, BTreeIndex, IndexError, Operator, Rid};
pub use heap::{EmptySource, HeapFile, HeapScan, RecordSource};
pub use storage::{PageId, Pager, PagerError};
