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

//! Append-Only Log File
//!
//! One writer, many readers. The writer appends whole transaction records
//! and publishes a *safe offset* after each successful commit; readers may
//! read anywhere below it. The trailer length on every transaction record
//! makes the log walkable backward, and the prefix/trailer pair doubles as
//! the torn-write detector during recovery.
//!
//! ```text
//! ┌───────────┬──────────────────┬──────────────────┬─────
//! │ FS21 (4)  │ Transaction 1    │ Transaction 2    │ ...
//! └───────────┴──────────────────┴──────────────────┴─────
//! ```
//!
//! [`LogFile`] is the writer handle; [`LogReader`] a cheap independent read
//! handle. [`TxnBuilder`] serializes a transaction record, leaving the
//! trailer to be appended separately so a vote can flush everything but the
//! commit point.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use orbdb_core::record::{
    DataHeader, DataRecord, RecordPayload, RecordStatus, TransactionMeta, TxnHeader, TxnStatus,
    DATA_HEADER_SIZE, LOG_MAGIC, TXN_HEADER_SIZE, TXN_TRAILER_SIZE,
};
use orbdb_core::{Oid, OrbError, Result, Tid};

/// File offset where the first transaction record begins.
pub const HEADER_SIZE: u64 = LOG_MAGIC.len() as u64;

/// Offset of the status byte within a transaction record.
pub const TXN_STATUS_OFFSET: u64 = 16;

/// Alias chains longer than this indicate a corrupt or adversarial log.
const MAX_ALIAS_DEPTH: usize = 100;

/// Writer handle to the log. At most one exists per storage.
pub struct LogFile {
    path: PathBuf,
    file: File,
    end: u64,
}

impl LogFile {
    /// Create a fresh log containing only the magic header.
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        file.set_len(0)?;
        file.write_all(&LOG_MAGIC)?;
        file.sync_all()?;
        Ok(LogFile { path: path.to_path_buf(), file, end: HEADER_SIZE })
    }

    /// Open an existing log for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        check_magic(&mut file)?;
        let end = file.metadata()?.len();
        Ok(LogFile { path: path.to_path_buf(), file, end })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Physical end of the file (may exceed the safe offset mid-commit).
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Append `bytes` at the current end, returning their offset.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.end;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.end += bytes.len() as u64;
        Ok(offset)
    }

    /// Overwrite bytes in place. Only used to patch a transaction's status
    /// byte (pack boundary, undone marker).
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Drop everything at and beyond `offset` (abort of a voted transaction).
    pub fn truncate_to(&mut self, offset: u64) -> Result<()> {
        self.file.set_len(offset)?;
        self.end = offset;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Independent read-only handle.
pub struct LogReader {
    file: File,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        check_magic(&mut file)?;
        Ok(LogReader { file })
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                OrbError::Corrupt {
                    offset,
                    detail: format!("unexpected end of log reading {} bytes", buf.len()),
                }
            } else {
                e.into()
            }
        })
    }

    /// Decode the transaction header (fixed part + metadata) at `offset`.
    pub fn txn_header_at(&mut self, offset: u64) -> Result<TxnHeader> {
        let mut fixed = [0u8; TXN_HEADER_SIZE];
        self.read_exact_at(offset, &mut fixed)?;
        let (tid, total_len, status, ulen, dlen, elen) = TxnHeader::decode_fixed(&fixed, offset)?;
        let mut meta = vec![0u8; ulen + dlen + elen];
        self.read_exact_at(offset + TXN_HEADER_SIZE as u64, &mut meta)?;
        let description = meta.split_off(ulen);
        let (description, extension) = {
            let mut d = description;
            let e = d.split_off(dlen);
            (d, e)
        };
        Ok(TxnHeader {
            tid,
            total_len,
            status,
            meta: TransactionMeta::new(meta, description, extension),
        })
    }

    /// Read the 8-byte repeated length whose last byte ends at
    /// `record_end`.
    pub fn trailer_len_at(&mut self, record_end: u64) -> Result<u64> {
        let mut buf = [0u8; TXN_TRAILER_SIZE];
        self.read_exact_at(record_end - TXN_TRAILER_SIZE as u64, &mut buf)?;
        Ok(BigEndian::read_u64(&buf))
    }

    /// Decode a full transaction record frame at `offset`, verifying that it
    /// fits below `end` and that its prefix and trailer lengths agree.
    pub fn verify_txn_at(&mut self, offset: u64, end: u64) -> Result<TxnHeader> {
        let header = self.txn_header_at(offset)?;
        if header.total_len < (header.encoded_len() + TXN_TRAILER_SIZE) as u64
            || offset + header.total_len > end
        {
            return Err(OrbError::Corrupt {
                offset,
                detail: format!(
                    "transaction length {} overruns log end {}",
                    header.total_len, end
                ),
            });
        }
        let trailer = self.trailer_len_at(offset + header.total_len)?;
        if trailer != header.total_len {
            return Err(OrbError::Corrupt {
                offset,
                detail: format!("prefix length {} != trailer length {}", header.total_len, trailer),
            });
        }
        Ok(header)
    }

    /// Decode the data record at `offset`.
    pub fn data_record_at(&mut self, offset: u64) -> Result<DataRecord> {
        let mut fixed = [0u8; DATA_HEADER_SIZE];
        self.read_exact_at(offset, &mut fixed)?;
        let header = DataHeader::decode(&fixed, offset)?;
        let payload = if header.blob_len == 0 {
            let mut back = [0u8; 8];
            self.read_exact_at(offset + DATA_HEADER_SIZE as u64, &mut back)?;
            RecordPayload::Back(BigEndian::read_u64(&back))
        } else {
            let mut blob = vec![0u8; header.blob_len as usize];
            self.read_exact_at(offset + DATA_HEADER_SIZE as u64, &mut blob)?;
            RecordPayload::Blob(blob)
        };
        let record = DataRecord { header, payload };
        record.check_alias_invariant(offset)?;
        Ok(record)
    }

    /// Resolve a record's payload, following alias backpointers.
    ///
    /// `None` means the object has no state at this revision (deleted).
    pub fn resolve_payload(&mut self, record: &DataRecord) -> Result<Option<Vec<u8>>> {
        let mut current = record.clone();
        for _ in 0..MAX_ALIAS_DEPTH {
            match current.payload {
                RecordPayload::Blob(blob) => return Ok(Some(blob)),
                RecordPayload::Back(0) => return Ok(None),
                RecordPayload::Back(offset) => current = self.data_record_at(offset)?,
            }
        }
        Err(OrbError::Corrupt {
            offset: record.header.txn_offset,
            detail: format!("alias chain for {} exceeds {MAX_ALIAS_DEPTH} links", record.header.oid),
        })
    }

    /// Forward iterator over transaction records in `[start, end)`.
    pub fn iter_txns(&mut self, start: u64, end: u64) -> TxnIter<'_> {
        TxnIter { reader: self, pos: start, end }
    }

    /// Backward iterator over transaction records below `end`.
    pub fn iter_txns_rev(&mut self, end: u64) -> RevTxnIter<'_> {
        RevTxnIter { reader: self, pos: end }
    }

    /// Iterator over the data records of one transaction.
    pub fn iter_data<'a>(&'a mut self, txn_offset: u64, header: &TxnHeader) -> DataIter<'a> {
        DataIter {
            reader: self,
            pos: txn_offset + header.data_start(),
            end: txn_offset + header.total_len - TXN_TRAILER_SIZE as u64,
        }
    }
}

fn check_magic(file: &mut File) -> Result<()> {
    let mut magic = [0u8; 4];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut magic).map_err(|_| OrbError::Corrupt {
        offset: 0,
        detail: "log file shorter than its magic".to_string(),
    })?;
    if magic != LOG_MAGIC {
        return Err(OrbError::Corrupt {
            offset: 0,
            detail: format!("bad log magic {magic:02x?}"),
        });
    }
    Ok(())
}

/// A transaction record yielded by iteration.
#[derive(Debug, Clone)]
pub struct TxnEntry {
    pub offset: u64,
    pub header: TxnHeader,
}

impl TxnEntry {
    /// End offset of the record (start of the next one).
    pub fn end(&self) -> u64 {
        self.offset + self.header.total_len
    }
}

pub struct TxnIter<'a> {
    reader: &'a mut LogReader,
    pos: u64,
    end: u64,
}

impl Iterator for TxnIter<'_> {
    type Item = Result<TxnEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        match self.reader.verify_txn_at(self.pos, self.end) {
            Ok(header) => {
                let entry = TxnEntry { offset: self.pos, header };
                self.pos = entry.end();
                Some(Ok(entry))
            }
            Err(err) => {
                // Do not spin on the same offset forever.
                self.pos = self.end;
                Some(Err(err))
            }
        }
    }
}

pub struct RevTxnIter<'a> {
    reader: &'a mut LogReader,
    pos: u64,
}

impl Iterator for RevTxnIter<'_> {
    type Item = Result<TxnEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos <= HEADER_SIZE {
            return None;
        }
        let result = (|| {
            let len = self.reader.trailer_len_at(self.pos)?;
            if len < (TXN_HEADER_SIZE + TXN_TRAILER_SIZE) as u64 || len > self.pos - HEADER_SIZE {
                return Err(OrbError::Corrupt {
                    offset: self.pos - TXN_TRAILER_SIZE as u64,
                    detail: format!("implausible trailer length {len}"),
                });
            }
            let start = self.pos - len;
            let header = self.reader.txn_header_at(start)?;
            if header.total_len != len {
                return Err(OrbError::Corrupt {
                    offset: start,
                    detail: format!("prefix length {} != trailer length {len}", header.total_len),
                });
            }
            Ok(TxnEntry { offset: start, header })
        })();
        match result {
            Ok(entry) => {
                self.pos = entry.offset;
                Some(Ok(entry))
            }
            Err(err) => {
                self.pos = HEADER_SIZE;
                Some(Err(err))
            }
        }
    }
}

/// A data record plus its file offset.
#[derive(Debug, Clone)]
pub struct DataEntry {
    pub offset: u64,
    pub record: DataRecord,
}

pub struct DataIter<'a> {
    reader: &'a mut LogReader,
    pos: u64,
    end: u64,
}

impl Iterator for DataIter<'_> {
    type Item = Result<DataEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        match self.reader.data_record_at(self.pos) {
            Ok(record) => {
                let len = record.header.record_len();
                if self.pos + len > self.end {
                    self.pos = self.end;
                    return Some(Err(OrbError::Corrupt {
                        offset: self.pos,
                        detail: "data record overruns its transaction".to_string(),
                    }));
                }
                let entry = DataEntry { offset: self.pos, record };
                self.pos += len;
                Some(Ok(entry))
            }
            Err(err) => {
                self.pos = self.end;
                Some(Err(err))
            }
        }
    }
}

/// Serializes one transaction record.
///
/// The builder tracks absolute record offsets as it goes (the caller supplies
/// the base offset the transaction will be appended at), so index updates and
/// intra-transaction backpointers can be prepared before anything is written.
/// `finish` yields the body *without* the trailer: `tpc_vote` appends the
/// body, and only `tpc_finish` appends the 8-byte trailer that makes the
/// transaction real.
pub struct TxnBuilder {
    base: u64,
    buf: Vec<u8>,
    tid: Tid,
    offsets: Vec<(Oid, u64)>,
}

impl TxnBuilder {
    pub fn new(tid: Tid, status: TxnStatus, meta: &TransactionMeta, base: u64) -> Result<Self> {
        let header = TxnHeader { tid, total_len: 0, status, meta: meta.clone() };
        let mut buf = Vec::with_capacity(4096);
        header.encode_into(&mut buf)?;
        Ok(TxnBuilder { base, buf, tid, offsets: Vec::new() })
    }

    /// Absolute offset the next record will land at.
    pub fn next_offset(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    /// Append a data record; returns its absolute offset.
    pub fn add_record(
        &mut self,
        oid: Oid,
        prev_offset: u64,
        status: RecordStatus,
        payload: &RecordPayload,
    ) -> u64 {
        let offset = self.next_offset();
        let blob_len = match payload {
            RecordPayload::Blob(blob) => blob.len() as u32,
            RecordPayload::Back(_) => 0,
        };
        let header = DataHeader {
            oid,
            tid: self.tid,
            prev_offset,
            txn_offset: self.base,
            status,
            blob_len,
        };
        header.encode_into(&mut self.buf);
        match payload {
            RecordPayload::Blob(blob) => self.buf.extend_from_slice(blob),
            RecordPayload::Back(back) => self.buf.extend_from_slice(&back.to_be_bytes()),
        }
        self.offsets.push((oid, offset));
        offset
    }

    pub fn record_count(&self) -> usize {
        self.offsets.len()
    }

    /// Finalize: patch the total length into the header and return
    /// `(body, trailer, index entries)`.
    pub fn finish(mut self) -> (Vec<u8>, [u8; 8], Vec<(Oid, u64)>) {
        let total_len = (self.buf.len() + TXN_TRAILER_SIZE) as u64;
        BigEndian::write_u64(&mut self.buf[8..16], total_len);
        (self.buf, total_len.to_be_bytes(), self.offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta() -> TransactionMeta {
        TransactionMeta::new(b"user".to_vec(), b"desc".to_vec(), Vec::new())
    }

    fn append_txn(log: &mut LogFile, tid: Tid, records: &[(Oid, &[u8])]) -> u64 {
        let mut builder = TxnBuilder::new(tid, TxnStatus::Normal, &meta(), log.end()).unwrap();
        for (oid, blob) in records {
            builder.add_record(*oid, 0, RecordStatus::Valid, &RecordPayload::Blob(blob.to_vec()));
        }
        let (body, trailer, _) = builder.finish();
        let offset = log.append(&body).unwrap();
        log.append(&trailer).unwrap();
        log.sync().unwrap();
        offset
    }

    #[test]
    fn test_create_rejects_garbage_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        std::fs::write(&path, b"NOPE").unwrap();
        assert!(matches!(LogReader::open(&path), Err(OrbError::Corrupt { offset: 0, .. })));
    }

    #[test]
    fn test_forward_iteration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        let mut log = LogFile::create(&path).unwrap();

        let t1 = Tid::from_parts(2026, 8, 7, 1, 0, 0.0);
        let t2 = Tid::from_parts(2026, 8, 7, 1, 1, 0.0);
        append_txn(&mut log, t1, &[(Oid::from_u64(1), b"one")]);
        append_txn(&mut log, t2, &[(Oid::from_u64(2), b"two"), (Oid::from_u64(3), b"three")]);

        let mut reader = LogReader::open(&path).unwrap();
        let entries: Vec<_> = reader
            .iter_txns(HEADER_SIZE, log.end())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].header.tid, t1);
        assert_eq!(entries[1].header.tid, t2);

        let header = entries[1].header.clone();
        let offset = entries[1].offset;
        let records: Vec<_> = reader
            .iter_data(offset, &header)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record.header.oid, Oid::from_u64(2));
        assert_eq!(records[1].record.payload, RecordPayload::Blob(b"three".to_vec()));
    }

    #[test]
    fn test_backward_iteration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        let mut log = LogFile::create(&path).unwrap();

        let t1 = Tid::from_parts(2026, 8, 7, 1, 0, 0.0);
        let t2 = Tid::from_parts(2026, 8, 7, 1, 1, 0.0);
        append_txn(&mut log, t1, &[(Oid::from_u64(1), b"one")]);
        append_txn(&mut log, t2, &[(Oid::from_u64(2), b"two")]);

        let mut reader = LogReader::open(&path).unwrap();
        let tids: Vec<_> = reader
            .iter_txns_rev(log.end())
            .map(|e| e.map(|e| e.header.tid))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(tids, vec![t2, t1]);
    }

    #[test]
    fn test_trailer_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        let mut log = LogFile::create(&path).unwrap();
        let offset = append_txn(
            &mut log,
            Tid::from_parts(2026, 8, 7, 1, 0, 0.0),
            &[(Oid::from_u64(1), b"one")],
        );
        // Flip a byte of the trailer.
        let end = log.end();
        log.write_at(end - 1, &[0xAA]).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        let result: Result<Vec<_>> = reader.iter_txns(HEADER_SIZE, end).collect();
        match result {
            Err(OrbError::Corrupt { offset: o, .. }) => assert_eq!(o, offset),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_alias_resolution() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        let mut log = LogFile::create(&path).unwrap();

        let t1 = Tid::from_parts(2026, 8, 7, 1, 0, 0.0);
        let oid = Oid::from_u64(9);
        let mut builder = TxnBuilder::new(t1, TxnStatus::Normal, &meta(), log.end()).unwrap();
        let first = builder.add_record(oid, 0, RecordStatus::Valid, &RecordPayload::Blob(b"payload".to_vec()));
        let (body, trailer, _) = builder.finish();
        log.append(&body).unwrap();
        log.append(&trailer).unwrap();

        let t2 = Tid::from_parts(2026, 8, 7, 1, 1, 0.0);
        let mut builder = TxnBuilder::new(t2, TxnStatus::Normal, &meta(), log.end()).unwrap();
        let alias = builder.add_record(oid, first, RecordStatus::Valid, &RecordPayload::Back(first));
        let (body, trailer, _) = builder.finish();
        log.append(&body).unwrap();
        log.append(&trailer).unwrap();
        log.sync().unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        let record = reader.data_record_at(alias).unwrap();
        assert_eq!(record.header.blob_len, 0);
        let blob = reader.resolve_payload(&record).unwrap();
        assert_eq!(blob.as_deref(), Some(&b"payload"[..]));
    }

    #[test]
    fn test_truncate_discards_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        let mut log = LogFile::create(&path).unwrap();
        let t1 = Tid::from_parts(2026, 8, 7, 1, 0, 0.0);
        append_txn(&mut log, t1, &[(Oid::from_u64(1), b"one")]);
        let safe = log.end();
        log.append(b"torn partial transaction").unwrap();
        log.truncate_to(safe).unwrap();
        assert_eq!(log.end(), safe);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), safe);
    }
}
