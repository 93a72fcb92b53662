// SPDX-License-Identifier: AGPL-3.0-or-later
// OrbDB - Transactional Object Store
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! On-Disk Record Codecs
//!
//! The log file is a sequence of transaction records, each framing the data
//! records committed under one TID. All multi-byte fields are big-endian.
//!
//! ## Transaction Record
//!
//! ```text
//! ┌────────┬───────────┬──────────┬─────────┬─────────┬─────────┬──────┬──────┬─────┬─────────┬───────────┐
//! │ TID(8) │ TotalLen  │ Status   │ UserLen │ DescLen │ ExtLen  │ User │ Desc │ Ext │ Data    │ TotalLen  │
//! │        │ (8)       │ (1)      │ (2)     │ (2)     │ (2)     │ (*)  │ (*)  │ (*) │ Records │ (8)       │
//! └────────┴───────────┴──────────┴─────────┴─────────┴─────────┴──────┴──────┴─────┴─────────┴───────────┘
//! ```
//!
//! `TotalLen` counts every byte of the record, trailer included, and is
//! repeated as the trailer so the log can be walked backward. A record whose
//! prefix and trailer lengths disagree is torn or corrupt.
//!
//! ## Data Record
//!
//! ```text
//! ┌────────┬────────┬────────────┬───────────┬────────┬─────────┬────────────────────┐
//! │ OID(8) │ TID(8) │ PrevOff(8) │ TxnOff(8) │ Status │ BlobLen │ Blob  or  Back(8)  │
//! │        │        │            │           │ (1)    │ (4)     │ (when BlobLen = 0) │
//! └────────┴────────┴────────────┴───────────┴────────┴─────────┴────────────────────┘
//! ```
//!
//! A zero `BlobLen` means the payload lives elsewhere: the trailing 8-byte
//! backpointer names the older record whose blob this revision aliases. This
//! is how undo re-publishes an old state without copying it. A valid (`v`)
//! record with a zero blob length must carry a nonzero backpointer; only a
//! delete (`i`) record may point at nothing.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{OrbError, Result};
use crate::oid::{Oid, Tid};

/// Log file magic, offset 0.
pub const LOG_MAGIC: [u8; 4] = *b"FS21";

/// Fixed part of a transaction record before the metadata bytes.
pub const TXN_HEADER_SIZE: usize = 8 + 8 + 1 + 2 + 2 + 2;

/// Fixed part of a data record before the blob or backpointer.
pub const DATA_HEADER_SIZE: usize = 8 + 8 + 8 + 8 + 1 + 4;

/// Trailer: the repeated total length.
pub const TXN_TRAILER_SIZE: usize = 8;

/// Transaction status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxnStatus {
    /// Committed normally.
    Normal = b' ',
    /// Survived a pack at or before this transaction's TID.
    Packed = b'p',
    /// Undone by a later transaction.
    Undone = b'u',
    /// Checkpoint / incomplete marker.
    Checkpoint = b'c',
}

impl TryFrom<u8> for TxnStatus {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            b' ' => Ok(TxnStatus::Normal),
            b'p' => Ok(TxnStatus::Packed),
            b'u' => Ok(TxnStatus::Undone),
            b'c' => Ok(TxnStatus::Checkpoint),
            other => Err(other),
        }
    }
}

/// Data record status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordStatus {
    /// Current encoding of a live revision.
    Valid = b'v',
    /// Superseded by a later revision (still readable for snapshots).
    Invalidated = b'n',
    /// Object deleted at this revision.
    Deleted = b'i',
}

impl TryFrom<u8> for RecordStatus {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            b'v' => Ok(RecordStatus::Valid),
            b'n' => Ok(RecordStatus::Invalidated),
            b'i' => Ok(RecordStatus::Deleted),
            other => Err(other),
        }
    }
}

/// Opaque transaction metadata carried in the transaction record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
}

impl TransactionMeta {
    pub fn new(user: Vec<u8>, description: Vec<u8>, extension: Vec<u8>) -> Self {
        Self { user, description, extension }
    }

    /// Total metadata bytes following the fixed header.
    pub fn encoded_len(&self) -> usize {
        self.user.len() + self.description.len() + self.extension.len()
    }
}

/// Decoded transaction record header.
#[derive(Debug, Clone)]
pub struct TxnHeader {
    pub tid: Tid,
    /// Total record length, trailer included.
    pub total_len: u64,
    pub status: TxnStatus,
    pub meta: TransactionMeta,
}

impl TxnHeader {
    /// Byte length of the header plus metadata (everything before the first
    /// data record).
    pub fn encoded_len(&self) -> usize {
        TXN_HEADER_SIZE + self.meta.encoded_len()
    }

    /// Offset of the first data record, relative to the record start.
    pub fn data_start(&self) -> u64 {
        self.encoded_len() as u64
    }

    /// Serialize the header and metadata into `buf`.
    ///
    /// Metadata fields longer than `u16::MAX` cannot be represented on disk.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        for (name, field) in [
            ("user", &self.meta.user),
            ("description", &self.meta.description),
            ("extension", &self.meta.extension),
        ] {
            if field.len() > u16::MAX as usize {
                return Err(OrbError::Unsupported(format!(
                    "transaction {name} metadata of {} bytes exceeds the 2-byte length field",
                    field.len()
                )));
            }
        }
        buf.extend_from_slice(self.tid.as_bytes());
        buf.extend_from_slice(&self.total_len.to_be_bytes());
        buf.push(self.status as u8);
        buf.extend_from_slice(&(self.meta.user.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.meta.description.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.meta.extension.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.meta.user);
        buf.extend_from_slice(&self.meta.description);
        buf.extend_from_slice(&self.meta.extension);
        Ok(())
    }

    /// Decode the fixed header from `buf` (at least [`TXN_HEADER_SIZE`]
    /// bytes). Metadata byte counts are returned so the caller can read the
    /// variable tail; `offset` is the record's file offset, used for error
    /// context only.
    pub fn decode_fixed(buf: &[u8], offset: u64) -> Result<(Tid, u64, TxnStatus, usize, usize, usize)> {
        if buf.len() < TXN_HEADER_SIZE {
            return Err(OrbError::Corrupt {
                offset,
                detail: format!("short transaction header: {} bytes", buf.len()),
            });
        }
        let mut tid = [0u8; 8];
        tid.copy_from_slice(&buf[0..8]);
        let total_len = BigEndian::read_u64(&buf[8..16]);
        let status = TxnStatus::try_from(buf[16]).map_err(|b| OrbError::Corrupt {
            offset,
            detail: format!("unknown transaction status byte 0x{b:02x}"),
        })?;
        let ulen = BigEndian::read_u16(&buf[17..19]) as usize;
        let dlen = BigEndian::read_u16(&buf[19..21]) as usize;
        let elen = BigEndian::read_u16(&buf[21..23]) as usize;
        let min_len = (TXN_HEADER_SIZE + ulen + dlen + elen + TXN_TRAILER_SIZE) as u64;
        if total_len < min_len {
            return Err(OrbError::Corrupt {
                offset,
                detail: format!("transaction length {total_len} shorter than header demands ({min_len})"),
            });
        }
        Ok((Tid(tid), total_len, status, ulen, dlen, elen))
    }
}

/// Decoded data record header.
#[derive(Debug, Clone)]
pub struct DataHeader {
    pub oid: Oid,
    pub tid: Tid,
    /// File offset of the previous data record for the same OID (0 if none).
    pub prev_offset: u64,
    /// File offset of the enclosing transaction record.
    pub txn_offset: u64,
    pub status: RecordStatus,
    pub blob_len: u32,
}

impl DataHeader {
    /// Full on-disk size of the record this header describes.
    pub fn record_len(&self) -> u64 {
        if self.blob_len == 0 {
            (DATA_HEADER_SIZE + 8) as u64
        } else {
            DATA_HEADER_SIZE as u64 + u64::from(self.blob_len)
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.oid.as_bytes());
        buf.extend_from_slice(self.tid.as_bytes());
        buf.extend_from_slice(&self.prev_offset.to_be_bytes());
        buf.extend_from_slice(&self.txn_offset.to_be_bytes());
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.blob_len.to_be_bytes());
    }

    pub fn decode(buf: &[u8], offset: u64) -> Result<Self> {
        if buf.len() < DATA_HEADER_SIZE {
            return Err(OrbError::Corrupt {
                offset,
                detail: format!("short data record header: {} bytes", buf.len()),
            });
        }
        let mut oid = [0u8; 8];
        oid.copy_from_slice(&buf[0..8]);
        let mut tid = [0u8; 8];
        tid.copy_from_slice(&buf[8..16]);
        let status = RecordStatus::try_from(buf[32]).map_err(|b| OrbError::Corrupt {
            offset,
            detail: format!("unknown data record status byte 0x{b:02x}"),
        })?;
        Ok(DataHeader {
            oid: Oid(oid),
            tid: Tid(tid),
            prev_offset: BigEndian::read_u64(&buf[16..24]),
            txn_offset: BigEndian::read_u64(&buf[24..32]),
            status,
            blob_len: BigEndian::read_u32(&buf[33..37]),
        })
    }
}

/// Payload of a data record: an inline blob or an alias backpointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPayload {
    Blob(Vec<u8>),
    /// File offset of the record whose blob this revision republishes.
    /// Zero is only legal on a [`RecordStatus::Deleted`] record.
    Back(u64),
}

/// A fully decoded data record.
#[derive(Debug, Clone)]
pub struct DataRecord {
    pub header: DataHeader,
    pub payload: RecordPayload,
}

impl DataRecord {
    /// Validate the alias invariant: a valid record without an inline blob
    /// must point somewhere.
    pub fn check_alias_invariant(&self, offset: u64) -> Result<()> {
        if self.header.status == RecordStatus::Valid {
            if let RecordPayload::Back(0) = self.payload {
                return Err(OrbError::Corrupt {
                    offset,
                    detail: format!("valid record for {} has neither blob nor backpointer", self.header.oid),
                });
            }
        }
        Ok(())
    }
}

/// One entry of an object's revision history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tid: Tid,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
    /// Size in bytes of the revision's (resolved) blob.
    pub size: u64,
    pub status: RecordStatus,
}

/// One entry of the undo log, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoRecord {
    pub tid: Tid,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
    pub status: TxnStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> TxnHeader {
        TxnHeader {
            tid: Tid::from_parts(2026, 8, 7, 10, 30, 15.5),
            total_len: 0,
            status: TxnStatus::Normal,
            meta: TransactionMeta::new(b"alice".to_vec(), b"initial import".to_vec(), Vec::new()),
        }
    }

    #[test]
    fn test_txn_header_roundtrip() {
        let mut header = sample_header();
        header.total_len = 4096;
        let mut buf = Vec::new();
        header.encode_into(&mut buf).unwrap();
        assert_eq!(buf.len(), header.encoded_len());

        let (tid, total_len, status, ulen, dlen, elen) = TxnHeader::decode_fixed(&buf, 0).unwrap();
        assert_eq!(tid, header.tid);
        assert_eq!(total_len, 4096);
        assert_eq!(status, TxnStatus::Normal);
        assert_eq!((ulen, dlen, elen), (5, 14, 0));
        assert_eq!(&buf[TXN_HEADER_SIZE..TXN_HEADER_SIZE + 5], b"alice");
    }

    #[test]
    fn test_txn_header_rejects_undersized_length() {
        let mut header = sample_header();
        // Too small to even hold the metadata it declares.
        header.total_len = 10;
        let mut buf = Vec::new();
        header.encode_into(&mut buf).unwrap();
        assert!(matches!(
            TxnHeader::decode_fixed(&buf, 123),
            Err(OrbError::Corrupt { offset: 123, .. })
        ));
    }

    #[test]
    fn test_txn_header_rejects_unknown_status() {
        let mut header = sample_header();
        header.total_len = 4096;
        let mut buf = Vec::new();
        header.encode_into(&mut buf).unwrap();
        buf[16] = b'?';
        assert!(TxnHeader::decode_fixed(&buf, 0).is_err());
    }

    #[test]
    fn test_data_header_roundtrip() {
        let header = DataHeader {
            oid: Oid::from_u64(7),
            tid: Tid::from_parts(2026, 8, 7, 10, 30, 15.5),
            prev_offset: 1234,
            txn_offset: 1000,
            status: RecordStatus::Valid,
            blob_len: 99,
        };
        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), DATA_HEADER_SIZE);

        let decoded = DataHeader::decode(&buf, 0).unwrap();
        assert_eq!(decoded.oid, header.oid);
        assert_eq!(decoded.tid, header.tid);
        assert_eq!(decoded.prev_offset, 1234);
        assert_eq!(decoded.txn_offset, 1000);
        assert_eq!(decoded.status, RecordStatus::Valid);
        assert_eq!(decoded.blob_len, 99);
        assert_eq!(decoded.record_len(), DATA_HEADER_SIZE as u64 + 99);
    }

    #[test]
    fn test_alias_record_length() {
        let header = DataHeader {
            oid: Oid::from_u64(7),
            tid: Tid::ZERO,
            prev_offset: 0,
            txn_offset: 0,
            status: RecordStatus::Valid,
            blob_len: 0,
        };
        // Zero blob length means an 8-byte backpointer follows.
        assert_eq!(header.record_len(), (DATA_HEADER_SIZE + 8) as u64);
    }

    #[test]
    fn test_alias_invariant() {
        let record = DataRecord {
            header: DataHeader {
                oid: Oid::from_u64(1),
                tid: Tid::ZERO,
                prev_offset: 0,
                txn_offset: 0,
                status: RecordStatus::Valid,
                blob_len: 0,
            },
            payload: RecordPayload::Back(0),
        };
        assert!(record.check_alias_invariant(50).is_err());

        let delete = DataRecord {
            header: DataHeader { status: RecordStatus::Deleted, ..record.header.clone() },
            payload: RecordPayload::Back(0),
        };
        assert!(delete.check_alias_invariant(50).is_ok());
    }
}
