//! Record encoding.
//!
//! Every record stored in a B-tree page has the layout:
//!
//! ```text
//! [info: u8][key_len: u16][payload_len: u16][key bytes][payload bytes]
//! ```
//!
//! Leaf records carry the row value as payload, or a [`BlobRef`] when the
//! value is stored externally (`INFO_EXTERN`). Node pointers carry the
//! child page number as an 8-byte payload.

#![allow(clippy::cast_possible_truncation)]

use crate::btree::node::NodeError;
use crate::storage::{PAGE_SIZE, PageId};

/// Size of the fixed record header in bytes.
pub const RECORD_HEADER_SIZE: usize = 5;

/// Leftmost record of the leftmost page on a non-leaf level.
pub const INFO_MIN_REC: u8 = 0x01;

/// The payload is a [`BlobRef`] instead of the value itself.
pub const INFO_EXTERN: u8 = 0x02;

/// Longest key accepted by the bulk loader.
///
/// Bounded so that several node pointers always fit on an internal page.
pub const MAX_KEY_LEN: usize = 1024;

/// Size of an encoded node pointer payload.
pub const NODE_POINTER_PAYLOAD: usize = 8;

/// Size of an encoded blob reference.
pub const BLOB_REF_SIZE: usize = 20;

/// Blob first page: total value length (u64).
pub const BLOB_FIRST_LENGTH: usize = 8;
/// Blob first page: first index page (u64), or 0 when the value fits the first page.
pub const BLOB_FIRST_INDEX: usize = 16;
/// Blob first page: bytes of the value stored on this page (u32).
pub const BLOB_FIRST_CHUNK: usize = 24;
/// Blob first page: start of the value bytes.
pub const BLOB_FIRST_DATA: usize = 28;

/// Blob data page: bytes stored on this page (u32).
pub const BLOB_DATA_CHUNK: usize = 8;
/// Blob data page: start of the value bytes.
pub const BLOB_DATA_DATA: usize = 12;

/// Blob index page: number of entries (u32).
pub const BLOB_INDEX_COUNT: usize = 8;
/// Blob index page: next index page (u64), or 0.
pub const BLOB_INDEX_NEXT: usize = 12;
/// Blob index page: start of the data page list (u64 each).
pub const BLOB_INDEX_ENTRIES: usize = 20;

/// Value bytes held by a blob first page.
pub const BLOB_FIRST_CAPACITY: usize = PAGE_SIZE - BLOB_FIRST_DATA;
/// Value bytes held by a blob data page.
pub const BLOB_DATA_CAPACITY: usize = PAGE_SIZE - BLOB_DATA_DATA;
/// Data page numbers held by a blob index page.
pub const BLOB_INDEX_CAPACITY: usize = (PAGE_SIZE - BLOB_INDEX_ENTRIES) / 8;

/// An input row: index key plus the rest of the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Row {
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Size of this row if it were stored inline in a leaf page.
    #[must_use]
    pub fn inline_size(&self) -> usize {
        record_size(self.key.len(), self.value.len())
    }
}

/// Size of an encoded record with the given key and payload lengths.
#[must_use]
pub const fn record_size(key_len: usize, payload_len: usize) -> usize {
    RECORD_HEADER_SIZE + key_len + payload_len
}

/// Descriptor of an externally stored value.
///
/// Layout (20 bytes): `first_page: u64`, `length: u64`, `page_count: u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRef {
    /// First page of the blob chain.
    pub first_page: PageId,
    /// Total value length in bytes.
    pub length: u64,
    /// Number of pages in the chain (first, data and index pages).
    pub page_count: u32,
}

impl BlobRef {
    #[must_use]
    pub fn to_bytes(self) -> [u8; BLOB_REF_SIZE] {
        let mut bytes = [0u8; BLOB_REF_SIZE];
        bytes[0..8].copy_from_slice(&self.first_page.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.length.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.page_count.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NodeError> {
        if bytes.len() != BLOB_REF_SIZE {
            return Err(NodeError::Corrupt("blob reference has wrong size"));
        }
        let mut first = [0u8; 8];
        let mut length = [0u8; 8];
        let mut count = [0u8; 4];
        first.copy_from_slice(&bytes[0..8]);
        length.copy_from_slice(&bytes[8..16]);
        count.copy_from_slice(&bytes[16..20]);
        Ok(Self {
            first_page: u64::from_le_bytes(first),
            length: u64::from_le_bytes(length),
            page_count: u32::from_le_bytes(count),
        })
    }
}

/// An owned record ready to be placed on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub info: u8,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Record {
    /// A leaf record storing `value` inline.
    #[must_use]
    pub const fn leaf(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            info: 0,
            key,
            payload: value,
        }
    }

    /// A leaf record whose value lives in a blob chain.
    #[must_use]
    pub fn external(key: Vec<u8>, blob: BlobRef) -> Self {
        Self {
            info: INFO_EXTERN,
            key,
            payload: blob.to_bytes().to_vec(),
        }
    }

    /// A node pointer to `child` with separator `key`.
    #[must_use]
    pub fn node_pointer(key: Vec<u8>, child: PageId) -> Self {
        Self {
            info: 0,
            key,
            payload: child.to_le_bytes().to_vec(),
        }
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        record_size(self.key.len(), self.payload.len())
    }

    #[must_use]
    pub const fn is_min_rec(&self) -> bool {
        self.info & INFO_MIN_REC != 0
    }

    pub const fn set_min_rec(&mut self) {
        self.info |= INFO_MIN_REC;
    }

    /// Write the record into `buf`, which must be exactly `encoded_len()` long.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.encoded_len());
        let key_end = RECORD_HEADER_SIZE + self.key.len();
        buf[0] = self.info;
        buf[1..3].copy_from_slice(&(self.key.len() as u16).to_le_bytes());
        buf[3..5].copy_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf[RECORD_HEADER_SIZE..key_end].copy_from_slice(&self.key);
        buf[key_end..].copy_from_slice(&self.payload);
    }
}

/// A record borrowed from a page buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef<'a> {
    pub info: u8,
    pub key: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> RecordRef<'a> {
    /// Decode the record starting at the beginning of `bytes`.
    ///
    /// Returns the record and its encoded length.
    pub fn decode(bytes: &'a [u8]) -> Result<(Self, usize), NodeError> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(NodeError::Corrupt("truncated record header"));
        }
        let key_len = usize::from(u16::from_le_bytes([bytes[1], bytes[2]]));
        let payload_len = usize::from(u16::from_le_bytes([bytes[3], bytes[4]]));
        let total = record_size(key_len, payload_len);
        if bytes.len() < total {
            return Err(NodeError::Corrupt("record runs past heap top"));
        }
        let key_end = RECORD_HEADER_SIZE + key_len;
        Ok((
            Self {
                info: bytes[0],
                key: &bytes[RECORD_HEADER_SIZE..key_end],
                payload: &bytes[key_end..total],
            },
            total,
        ))
    }

    #[must_use]
    pub const fn is_min_rec(&self) -> bool {
        self.info & INFO_MIN_REC != 0
    }

    #[must_use]
    pub const fn is_extern(&self) -> bool {
        self.info & INFO_EXTERN != 0
    }

    /// Child page of a node pointer.
    pub fn child(&self) -> Result<PageId, NodeError> {
        let bytes: [u8; NODE_POINTER_PAYLOAD] = self
            .payload
            .try_into()
            .map_err(|_| NodeError::Corrupt("node pointer payload is not 8 bytes"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Blob reference of an externally stored value.
    pub fn blob_ref(&self) -> Result<BlobRef, NodeError> {
        BlobRef::from_bytes(self.payload)
    }

    #[must_use]
    pub fn to_owned_record(&self) -> Record {
        Record {
            info: self.info,
            key: self.key.to_vec(),
            payload: self.payload.to_vec(),
        }
    }
}
