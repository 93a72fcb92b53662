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

//! Crash Recovery
//!
//! A crash between vote and finish leaves at most one torn transaction at
//! the log tail, detectable by its missing or mismatched trailer. Recovery:
//!
//! 1. checks the log magic;
//! 2. loads the index sidecar (rebuilding from scratch when it is missing,
//!    damaged, or ahead of a truncated log);
//! 3. rescans the log from the sidecar's recorded position, folding every
//!    fully-formed transaction into the index;
//! 4. moves any torn tail aside to a numbered `.tr<N>` sidecar — the bytes
//!    are preserved for forensics, never silently destroyed — and truncates
//!    the log back to the last good transaction;
//! 5. verifies TID ordering over the rescanned segment, logging a warning on
//!    any backward step and escalating when the step exceeds the clock
//!    safety threshold.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use orbdb_core::record::{RecordStatus, TxnStatus};
use orbdb_core::{OrbError, Result, Tid};
use tracing::{error, info, warn};

use crate::index::{index_path, OidIndex};
use crate::log::{LogReader, HEADER_SIZE};

/// Backward TID steps larger than this many minutes are treated as clock
/// failures rather than ordinary scheduling jitter.
const CLOCK_SAFETY_MINUTES: u32 = 60;

/// Outcome of opening a log file.
#[derive(Debug)]
pub struct RecoveryReport {
    /// Offset just past the last fully committed transaction.
    pub safe_offset: u64,
    /// TID of that transaction (zero for an empty log).
    pub last_tid: Tid,
    /// Index consistent with `safe_offset`.
    pub index: OidIndex,
    /// Where a torn tail was preserved, if one was found.
    pub truncated_to: Option<PathBuf>,
}

/// Recover `log_path`, truncating any torn tail.
pub fn recover(log_path: &Path) -> Result<RecoveryReport> {
    open_log(log_path, true)
}

/// Like [`recover`] but strictly read-only: a torn tail is ignored rather
/// than moved aside, and the log file is never modified.
pub fn scan(log_path: &Path) -> Result<RecoveryReport> {
    open_log(log_path, false)
}

fn open_log(log_path: &Path, truncate: bool) -> Result<RecoveryReport> {
    let mut reader = LogReader::open(log_path)?;
    let file_len = std::fs::metadata(log_path)?.len();

    let mut index = match OidIndex::load(&index_path(log_path), HEADER_SIZE) {
        Ok(index) if index.safe_offset <= file_len => index,
        Ok(index) => {
            warn!(
                sidecar_offset = index.safe_offset,
                file_len, "index sidecar is ahead of the log, rebuilding from scratch"
            );
            OidIndex::new(HEADER_SIZE)
        }
        Err(err) => {
            warn!(error = %err, "index sidecar unusable, rebuilding from scratch");
            OidIndex::new(HEADER_SIZE)
        }
    };

    let mut pos = index.safe_offset;
    let mut prev_tid = index.last_tid;
    let mut scanned = 0u64;

    while pos < file_len {
        match validate_and_apply(&mut reader, pos, file_len, &mut index) {
            Ok((end, tid)) => {
                if !prev_tid.is_zero() && tid <= prev_tid {
                    let backward_minutes = prev_tid.minutes().saturating_sub(tid.minutes());
                    if backward_minutes > CLOCK_SAFETY_MINUTES {
                        error!(
                            %tid, %prev_tid, backward_minutes,
                            "transaction id regressed past the clock safety threshold"
                        );
                    } else {
                        warn!(%tid, %prev_tid, "transaction id did not advance");
                    }
                }
                prev_tid = prev_tid.max(tid);
                pos = end;
                scanned += 1;
            }
            Err(err) => {
                info!(offset = pos, error = %err, "log tail is not a complete transaction");
                break;
            }
        }
    }

    let mut truncated_to = None;
    if pos < file_len && truncate {
        let sidecar = preserve_tail(log_path, pos, file_len)?;
        warn!(
            from = pos,
            bytes = file_len - pos,
            sidecar = %sidecar.display(),
            "truncated torn transaction tail"
        );
        truncated_to = Some(sidecar);
    }

    index.safe_offset = pos;
    index.last_tid = prev_tid;
    if scanned > 0 {
        info!(transactions = scanned, safe_offset = pos, "absorbed log tail into index");
    }

    Ok(RecoveryReport { safe_offset: pos, last_tid: prev_tid, index, truncated_to })
}

/// Fully validate the transaction at `pos` (frame, trailer, every data
/// record) and fold its records into the index. Returns the end offset and
/// the TID.
fn validate_and_apply(
    reader: &mut LogReader,
    pos: u64,
    file_len: u64,
    index: &mut OidIndex,
) -> Result<(u64, Tid)> {
    let header = reader.verify_txn_at(pos, file_len)?;
    if header.status == TxnStatus::Checkpoint {
        // An incomplete marker at the tail: the transaction never finished.
        return Err(OrbError::Corrupt {
            offset: pos,
            detail: "transaction is marked incomplete".to_string(),
        });
    }
    let tid = header.tid;
    let end = pos + header.total_len;

    let mut updates = Vec::new();
    for entry in reader.iter_data(pos, &header) {
        let entry = entry?;
        updates.push((entry.record.header.oid, entry.offset, entry.record.header.status));
    }
    for (oid, offset, status) in updates {
        match status {
            RecordStatus::Deleted => index.remove(oid),
            _ => index.insert(oid, offset),
        }
    }
    Ok((end, tid))
}

/// Copy `[from, to)` of the log into the first unused `.tr<N>` sidecar and
/// truncate the log back to `from`.
fn preserve_tail(log_path: &Path, from: u64, to: u64) -> Result<PathBuf> {
    let sidecar = next_tr_path(log_path);
    let mut log = OpenOptions::new().read(true).write(true).open(log_path)?;
    log.seek(SeekFrom::Start(from))?;
    let mut tail = vec![0u8; (to - from) as usize];
    log.read_exact(&mut tail)?;

    let mut out = OpenOptions::new().create_new(true).write(true).open(&sidecar)?;
    out.write_all(&tail)?;
    out.sync_all()?;

    log.set_len(from)?;
    log.sync_all()?;
    Ok(sidecar)
}

fn next_tr_path(log_path: &Path) -> PathBuf {
    for n in 1u32.. {
        let mut name = log_path.file_name().map(|f| f.to_os_string()).unwrap_or_default();
        name.push(format!(".tr{n}"));
        let candidate = log_path.with_file_name(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("ran out of sidecar numbers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogFile, TxnBuilder};
    use orbdb_core::record::{RecordPayload, TransactionMeta};
    use orbdb_core::Oid;
    use tempfile::TempDir;

    fn commit(log: &mut LogFile, tid: Tid, oid: Oid, blob: &[u8]) -> u64 {
        let meta = TransactionMeta::default();
        let mut builder = TxnBuilder::new(tid, TxnStatus::Normal, &meta, log.end()).unwrap();
        builder.add_record(oid, 0, RecordStatus::Valid, &RecordPayload::Blob(blob.to_vec()));
        let (body, trailer, _) = builder.finish();
        log.append(&body).unwrap();
        log.append(&trailer).unwrap();
        log.sync().unwrap();
        log.end()
    }

    #[test]
    fn test_clean_log_recovers_fully() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        let mut log = LogFile::create(&path).unwrap();
        let t1 = Tid::from_parts(2026, 8, 7, 1, 0, 0.0);
        let t2 = Tid::from_parts(2026, 8, 7, 1, 1, 0.0);
        commit(&mut log, t1, Oid::from_u64(1), b"one");
        let end = commit(&mut log, t2, Oid::from_u64(2), b"two");
        drop(log);

        let report = recover(&path).unwrap();
        assert_eq!(report.safe_offset, end);
        assert_eq!(report.last_tid, t2);
        assert_eq!(report.index.len(), 2);
        assert!(report.truncated_to.is_none());
    }

    #[test]
    fn test_torn_tail_preserved_and_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        let mut log = LogFile::create(&path).unwrap();
        let t1 = Tid::from_parts(2026, 8, 7, 1, 0, 0.0);
        let safe = commit(&mut log, t1, Oid::from_u64(1), b"one");
        // A voted-but-unfinished transaction: body without trailer.
        let t2 = Tid::from_parts(2026, 8, 7, 1, 1, 0.0);
        let mut builder =
            TxnBuilder::new(t2, TxnStatus::Normal, &TransactionMeta::default(), log.end()).unwrap();
        builder.add_record(Oid::from_u64(2), 0, RecordStatus::Valid, &RecordPayload::Blob(b"torn".to_vec()));
        let (body, _trailer, _) = builder.finish();
        log.append(&body).unwrap();
        log.sync().unwrap();
        drop(log);

        let report = recover(&path).unwrap();
        assert_eq!(report.safe_offset, safe);
        assert_eq!(report.last_tid, t1);
        assert_eq!(report.index.len(), 1);

        let sidecar = report.truncated_to.expect("tail should be preserved");
        assert!(sidecar.to_string_lossy().ends_with(".tr1"));
        assert!(std::fs::metadata(&sidecar).unwrap().len() > 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), safe);

        // Recovery is idempotent.
        let again = recover(&path).unwrap();
        assert_eq!(again.safe_offset, safe);
        assert!(again.truncated_to.is_none());
    }

    #[test]
    fn test_stale_sidecar_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        let mut log = LogFile::create(&path).unwrap();
        let t1 = Tid::from_parts(2026, 8, 7, 1, 0, 0.0);
        commit(&mut log, t1, Oid::from_u64(1), b"one");
        drop(log);

        // Sidecar claims a safe offset beyond the file.
        let mut stale = OidIndex::new(999_999);
        stale.safe_offset = 999_999;
        stale.save(&index_path(&path)).unwrap();

        let report = recover(&path).unwrap();
        assert_eq!(report.index.len(), 1);
        assert_eq!(report.last_tid, t1);
    }

    #[test]
    fn test_backward_tid_step_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        let mut log = LogFile::create(&path).unwrap();
        // A clock regression left a later transaction with an earlier TID.
        let t_late = Tid::from_parts(2026, 8, 7, 2, 0, 0.0);
        let t_early = Tid::from_parts(2026, 8, 7, 1, 0, 0.0);
        commit(&mut log, t_late, Oid::from_u64(1), b"late");
        let end = commit(&mut log, t_early, Oid::from_u64(2), b"early");
        drop(log);

        // Recovery logs the regression but keeps every committed record.
        let report = recover(&path).unwrap();
        assert_eq!(report.safe_offset, end);
        assert_eq!(report.last_tid, t_late);
        assert_eq!(report.index.len(), 2);
    }

    #[test]
    fn test_delete_records_drop_index_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb");
        let mut log = LogFile::create(&path).unwrap();
        let t1 = Tid::from_parts(2026, 8, 7, 1, 0, 0.0);
        commit(&mut log, t1, Oid::from_u64(5), b"alive");

        let t2 = Tid::from_parts(2026, 8, 7, 1, 1, 0.0);
        let mut builder =
            TxnBuilder::new(t2, TxnStatus::Normal, &TransactionMeta::default(), log.end()).unwrap();
        builder.add_record(Oid::from_u64(5), 0, RecordStatus::Deleted, &RecordPayload::Back(0));
        let (body, trailer, _) = builder.finish();
        log.append(&body).unwrap();
        log.append(&trailer).unwrap();
        log.sync().unwrap();
        drop(log);

        let report = recover(&path).unwrap();
        assert_eq!(report.index.get(Oid::from_u64(5)), None);
        assert_eq!(report.last_tid, t2);
    }
}
