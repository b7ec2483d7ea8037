//! Index header page codec.
//!
//! The first page of an index file holds one metadata record identifying
//! the index and locating the root:
//!
//! ```text
//! Offset  Size  Field
//! 0       16    magic
//! 16      4     version
//! 20      20    relation_name (NUL padded)
//! 40      4     attr_byte_offset
//! 44      4     attr_type tag
//! 48      4     root_page
//! 52      4     initial_root_page
//! 56      8     reserved
//! ```
//!
//! `root_page` is rewritten on every root promotion. `initial_root_page`
//! never changes after creation: the root is still a leaf exactly while
//! `root_page == initial_root_page`, and persisting the initial id keeps
//! that test valid across reopens.

use eyre::{ensure, Result};
use zerocopy::little_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::META_HEADER_SIZE;
use crate::storage::PageId;
use crate::zerocopy_accessors;

pub const INDEX_MAGIC: &[u8; 16] = b"settdb index\x00\x00\x00\x00";
pub const META_VERSION: u32 = 1;

/// Maximum stored length of a relation name, including NUL padding.
pub const RELATION_NAME_LEN: usize = 20;

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug)]
pub struct IndexMetaPage {
    magic: [u8; 16],
    version: U32,
    relation_name: [u8; RELATION_NAME_LEN],
    attr_byte_offset: I32,
    attr_type: U32,
    root_page: U32,
    initial_root_page: U32,
    reserved: [u8; 8],
}

const _: () = assert!(size_of::<IndexMetaPage>() == META_HEADER_SIZE);

impl IndexMetaPage {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= META_HEADER_SIZE,
            "buffer too small for IndexMetaPage: {} < {}",
            data.len(),
            META_HEADER_SIZE
        );
        let meta = Self::ref_from_bytes(&data[..META_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read IndexMetaPage: {:?}", e))?;
        ensure!(&meta.magic == INDEX_MAGIC, "invalid magic bytes in index file");
        ensure!(
            meta.version() == META_VERSION,
            "unsupported index file version: {} (expected {})",
            meta.version(),
            META_VERSION
        );
        Ok(meta)
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= META_HEADER_SIZE,
            "buffer too small for IndexMetaPage: {} < {}",
            data.len(),
            META_HEADER_SIZE
        );
        let meta = Self::mut_from_bytes(&mut data[..META_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read IndexMetaPage: {:?}", e))?;
        ensure!(&meta.magic == INDEX_MAGIC, "invalid magic bytes in index file");
        Ok(meta)
    }

    /// Writes a fresh metadata record into the header page.
    pub fn init<'a>(
        data: &'a mut [u8],
        relation_name: &str,
        attr_byte_offset: i32,
        attr_type_tag: u32,
        root_page: PageId,
    ) -> Result<&'a mut Self> {
        ensure!(
            data.len() >= META_HEADER_SIZE,
            "buffer too small for IndexMetaPage: {} < {}",
            data.len(),
            META_HEADER_SIZE
        );
        ensure!(
            relation_name.len() <= RELATION_NAME_LEN,
            "relation name {:?} exceeds {} bytes",
            relation_name,
            RELATION_NAME_LEN
        );

        data[..META_HEADER_SIZE].fill(0);
        data[..16].copy_from_slice(INDEX_MAGIC);
        let meta = Self::mut_from_bytes(&mut data[..META_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to map IndexMetaPage: {:?}", e))?;
        meta.set_version(META_VERSION);
        meta.relation_name[..relation_name.len()].copy_from_slice(relation_name.as_bytes());
        meta.set_attr_byte_offset(attr_byte_offset);
        meta.set_attr_type(attr_type_tag);
        meta.set_root_page(root_page);
        meta.set_initial_root_page(root_page);
        Ok(meta)
    }

    zerocopy_accessors! {
        version: u32,
        attr_byte_offset: i32,
        attr_type: u32,
        root_page: u32,
        initial_root_page: u32,
    }

    /// Whether the stored relation name equals `name` (NUL padding aside).
    pub fn relation_name_matches(&self, name: &str) -> bool {
        if name.len() > RELATION_NAME_LEN {
            return false;
        }
        let mut padded = [0u8; RELATION_NAME_LEN];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        self.relation_name == padded
    }

    /// The stored relation name, for diagnostics.
    pub fn relation_name(&self) -> String {
        let end = self
            .relation_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(RELATION_NAME_LEN);
        String::from_utf8_lossy(&self.relation_name[..end]).into_owned()
    }
}
