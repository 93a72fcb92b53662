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

//! Undo & History
//!
//! The append-only log makes undo logical rather than physical: undoing
//! transaction T stages, for every object T touched, a new zero-length
//! record whose backpointer republishes the object's pre-T state. Nothing
//! is copied and nothing is erased; undoing an undo points back at T's own
//! records and the state returns.
//!
//! Undo refuses when an object has been modified since T by a transaction
//! whose effect the conflict resolver cannot reconcile.

use std::collections::VecDeque;

use tracing::debug;

use orbdb_core::record::{HistoryEntry, RecordStatus, TxnStatus, UndoRecord};
use orbdb_core::{Oid, OrbError, Result, Tid};

use crate::log::{DataEntry, TxnEntry};
use crate::store::{ObjectStore, Pending, PendingPayload, Phase, TxnHandle};

impl ObjectStore {
    /// Stage the undo of `undo_tid` into the current transaction.
    ///
    /// Returns the OIDs whose state will revert when the enclosing
    /// transaction commits.
    pub fn undo(&self, undo_tid: Tid, txn: TxnHandle) -> Result<Vec<Oid>> {
        self.check_writable()?;

        let (entry, records) = self.find_undo_target(undo_tid)?;
        let mut staged: Vec<Pending> = Vec::with_capacity(records.len());

        for record in &records {
            let oid = record.record.header.oid;
            let payload = self.reverse_record(undo_tid, record)?;
            staged.push(Pending {
                oid,
                // Conflict handling happened here; vote must not redo it.
                expected: Tid::ZERO,
                payload,
                resolved: true,
            });
        }

        let mut current = self.current.lock();
        let cur = Self::current_mut(&mut current, txn)?;
        if cur.phase == Phase::Voted {
            return Err(OrbError::TransactionState {
                detail: "cannot stage undo after vote".to_string(),
            });
        }
        let oids: Vec<Oid> = staged.iter().map(|p| p.oid).collect();
        for pending in staged {
            match cur.pending.iter_mut().find(|p| p.oid == pending.oid) {
                Some(slot) => *slot = pending,
                None => cur.pending.push(pending),
            }
        }
        cur.undone_txns.push(entry.offset);
        if cur.phase == Phase::Begun {
            cur.phase = Phase::Stored;
        }
        debug!(%undo_tid, objects = oids.len(), "undo staged");
        Ok(oids)
    }

    /// Locate the transaction record for `undo_tid` and decode its data
    /// records.
    fn find_undo_target(&self, undo_tid: Tid) -> Result<(TxnEntry, Vec<DataEntry>)> {
        let safe = self.index.read().safe_offset;
        let mut scanner = self.scan_reader()?;
        let mut found = None;
        for entry in scanner.iter_txns_rev(safe) {
            let entry = entry?;
            if entry.header.tid == undo_tid {
                found = Some(entry);
                break;
            }
            if entry.header.tid < undo_tid {
                break;
            }
        }
        let entry = found.ok_or_else(|| OrbError::Undo {
            tid: undo_tid,
            reason: "no committed transaction with this id".to_string(),
        })?;
        if entry.header.status == TxnStatus::Packed {
            return Err(OrbError::Undo {
                tid: undo_tid,
                reason: "transaction lies at or below the pack horizon".to_string(),
            });
        }
        let records = scanner
            .iter_data(entry.offset, &entry.header)
            .collect::<Result<Vec<_>>>()?;
        Ok((entry, records))
    }

    /// Compute the reverse payload for one record of the undone transaction.
    fn reverse_record(&self, undo_tid: Tid, entry: &DataEntry) -> Result<PendingPayload> {
        let oid = entry.record.header.oid;
        let target = entry.record.header.prev_offset;
        let head = self.index.read().get(oid);

        // The easy and common case: the undone record is still the head, so
        // the object reverts to its direct predecessor.
        let head_is_target = head == Some(entry.offset);
        let head_gone_by_delete =
            head.is_none() && entry.record.header.status == RecordStatus::Deleted;
        if head_is_target || head_gone_by_delete {
            return self.payload_for_target(target);
        }

        // Something committed after the undone transaction. Undo is still
        // legal when the intervening changes left the object's state exactly
        // as the undone transaction wrote it, or when the resolver can merge.
        let Some(head_offset) = head else {
            return Err(OrbError::Undo {
                tid: undo_tid,
                reason: format!("{oid} no longer exists"),
            });
        };

        let mut reader = self.reader.lock();
        let head_record = reader.data_record_at(head_offset)?;
        let head_blob = reader.resolve_payload(&head_record)?;
        let undone_blob = reader.resolve_payload(&entry.record)?;
        let target_blob = if target == 0 {
            None
        } else {
            let record = reader.data_record_at(target)?;
            reader.resolve_payload(&record)?
        };
        drop(reader);

        if head_blob == undone_blob {
            return self.payload_for_target(target);
        }

        if let (Some(undone), Some(saved), Some(new)) =
            (undone_blob.as_deref(), head_blob.as_deref(), target_blob.as_deref())
        {
            if let Some(merged) = self.resolver.resolve(oid, undone, saved, new) {
                debug!(%oid, %undo_tid, "undo conflict resolved by merge");
                return Ok(PendingPayload::Blob(merged));
            }
        }

        Err(OrbError::Undo {
            tid: undo_tid,
            reason: format!("{oid} was modified by a later transaction"),
        })
    }

    /// Payload that republishes the record at `target` (or deletes the
    /// object when there is no predecessor).
    fn payload_for_target(&self, target: u64) -> Result<PendingPayload> {
        if target == 0 {
            return Ok(PendingPayload::Delete);
        }
        // Aliases must land on a data-carrying record.
        let mut reader = self.reader.lock();
        let mut offset = target;
        loop {
            let record = reader.data_record_at(offset)?;
            if record.header.blob_len > 0 {
                return Ok(PendingPayload::Alias(offset));
            }
            match record.payload {
                orbdb_core::record::RecordPayload::Back(0) => return Ok(PendingPayload::Delete),
                orbdb_core::record::RecordPayload::Back(back) => offset = back,
                orbdb_core::record::RecordPayload::Blob(_) => unreachable!("blob_len checked above"),
            }
        }
    }

    /// Undoable transactions, newest first, positions `[first, last)`.
    pub fn undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoRecord>> {
        self.undo_info(first, last, |_| true)
    }

    /// Like [`undo_log`](Self::undo_log) with a caller-side predicate.
    pub fn undo_info(
        &self,
        first: usize,
        last: usize,
        filter: impl Fn(&UndoRecord) -> bool,
    ) -> Result<Vec<UndoRecord>> {
        let safe = self.index.read().safe_offset;
        let mut scanner = self.scan_reader()?;
        let mut out = Vec::new();
        let mut position = 0usize;
        for entry in scanner.iter_txns_rev(safe) {
            let entry = entry?;
            if entry.header.status == TxnStatus::Packed {
                // Nothing at or below the pack horizon can be undone.
                break;
            }
            let record = UndoRecord {
                tid: entry.header.tid,
                user: entry.header.meta.user.clone(),
                description: entry.header.meta.description.clone(),
                extension: entry.header.meta.extension.clone(),
                status: entry.header.status,
            };
            if !filter(&record) {
                continue;
            }
            if position >= last {
                break;
            }
            if position >= first {
                out.push(record);
            }
            position += 1;
        }
        Ok(out)
    }

    /// Up to `n` metadata entries for `oid`, newest first.
    pub fn history(&self, oid: Oid, n: usize) -> Result<Vec<HistoryEntry>> {
        let head = self.index.read().get(oid).ok_or(OrbError::KeyNotFound { oid })?;
        let mut scanner = self.scan_reader()?;
        let mut out = Vec::new();
        let mut queue = VecDeque::from([head]);
        while out.len() < n {
            let Some(offset) = queue.pop_front() else { break };
            let record = scanner.data_record_at(offset)?;
            let header = scanner.txn_header_at(record.header.txn_offset)?;
            let size = scanner
                .resolve_payload(&record)?
                .map(|blob| blob.len() as u64)
                .unwrap_or(0);
            out.push(HistoryEntry {
                tid: record.header.tid,
                user: header.meta.user,
                description: header.meta.description,
                extension: header.meta.extension,
                size,
                status: record.header.status,
            });
            if record.header.prev_offset != 0 {
                queue.push_back(record.header.prev_offset);
            }
        }
        Ok(out)
    }
}
