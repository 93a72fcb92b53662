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

//! Pack: Copy-Live Log Compaction
//!
//! Packing at horizon `pack_tid` rewrites the log keeping, per object:
//!
//! - the newest revision at or below the horizon, for objects reachable
//!   from the root in the snapshot at `pack_tid`;
//! - every revision above the horizon, reachable or not.
//!
//! Everything else — superseded pre-horizon revisions and the entire
//! history of unreachable objects — is discarded. Backpointers are
//! rewritten to the copied locations; an alias whose target did not survive
//! is materialized into an inline blob. Copied pre-horizon transactions are
//! stamped `p` so later undo knows where history ends.
//!
//! Commits keep flowing during the mark and copy phases; the swap phase
//! takes the commit lock, copies whatever committed meanwhile, renames the
//! temp file over the log, and rebuilds the index. A recorded pack horizon
//! makes repeated packs at the same or an earlier TID no-ops.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use orbdb_core::record::{RecordPayload, RecordStatus, TxnStatus};
use orbdb_core::resolver::ReferencesExtractor;
use orbdb_core::{Oid, OrbError, Result, Tid};

use crate::index::{index_path, OidIndex};
use crate::log::{LogFile, LogReader, TxnBuilder, HEADER_SIZE};
use crate::store::ObjectStore;

/// Working state threaded through the copy passes.
struct PackCopy {
    out: LogFile,
    /// Old record offset → new record offset.
    off_map: HashMap<u64, u64>,
    /// Newest copied record per OID, for prev-chain rewriting.
    prev_new: HashMap<Oid, u64>,
    new_index: OidIndex,
}

impl ObjectStore {
    /// Pack the log at `pack_tid`. Returns `false` when the horizon is at
    /// or below a previous pack and nothing was done.
    pub fn pack(&self, pack_tid: Tid, refs: &dyn ReferencesExtractor) -> Result<bool> {
        self.check_writable()?;
        if self.commit_lock.held_by_me() {
            // The swap phase would reenter the commit lock and replace the
            // log under this thread's own unfinished commit.
            return Err(OrbError::TransactionState {
                detail: "cannot pack between vote and finish".to_string(),
            });
        }
        {
            let index = self.index.read();
            if pack_tid <= index.pack_tid {
                debug!(%pack_tid, already = %index.pack_tid, "pack horizon already reached");
                return Ok(false);
            }
            if pack_tid > index.last_tid {
                return Err(OrbError::Unsupported(format!(
                    "pack horizon {pack_tid} is beyond the last committed transaction {}",
                    index.last_tid
                )));
            }
        }

        // One pack at a time; commits keep flowing underneath.
        self.storage_lock.acquire(None)?;
        let result = self.pack_locked(pack_tid, refs);
        let _ = self.storage_lock.release();
        result
    }

    fn pack_locked(&self, pack_tid: Tid, refs: &dyn ReferencesExtractor) -> Result<bool> {
        let snapshot = self.index.read().clone();

        // Phase A: mark. Walk the object graph as of `pack_tid`, recording
        // for each reachable object the offset of its newest revision at or
        // below the horizon.
        let horizon_heads = self.mark_reachable(&snapshot, pack_tid, refs)?;
        debug!(reachable = horizon_heads.len(), "pack mark phase complete");

        // Phase B: copy into a temp log, up to the snapshot's safe offset.
        let temp_path = self.path.with_extension("pack");
        let mut copy = PackCopy {
            out: LogFile::create(&temp_path)?,
            off_map: HashMap::new(),
            prev_new: HashMap::new(),
            new_index: OidIndex::new(HEADER_SIZE),
        };
        let mut reader = self.scan_reader()?;
        self.copy_range(
            &mut reader,
            &mut copy,
            HEADER_SIZE,
            snapshot.safe_offset,
            pack_tid,
            Some(&horizon_heads),
        )?;

        // Phase C: swap. Stop commits, catch up, rename, rebuild.
        self.commit_lock.acquire(None)?;
        let swap = (|| -> Result<()> {
            let catch_up_end = self.index.read().safe_offset;
            if catch_up_end > snapshot.safe_offset {
                self.copy_range(
                    &mut reader,
                    &mut copy,
                    snapshot.safe_offset,
                    catch_up_end,
                    pack_tid,
                    Some(&horizon_heads),
                )?;
            }
            copy.out.sync()?;

            let dropped = self.size().saturating_sub(copy.out.end());
            std::fs::rename(&temp_path, &self.path)?;

            let mut index = self.index.write();
            let mut log = self.log.lock();
            *log = LogFile::open(&self.path)?;
            *self.reader.lock() = LogReader::open(&self.path)?;
            copy.new_index.safe_offset = log.end();
            copy.new_index.last_tid = index.last_tid;
            copy.new_index.pack_tid = pack_tid;
            *index = copy.new_index.clone();
            index.save(&index_path(&self.path))?;

            info!(%pack_tid, dropped_bytes = dropped, objects = index.len(), "pack complete");
            Ok(())
        })();
        let _ = self.commit_lock.release();
        if swap.is_err() {
            let _ = std::fs::remove_file(&temp_path);
        }
        swap?;
        Ok(true)
    }

    /// Transitive reachability from the root in the snapshot at `pack_tid`.
    /// Maps each reachable OID to the old offset of its newest revision at
    /// or below the horizon.
    fn mark_reachable(
        &self,
        snapshot: &OidIndex,
        pack_tid: Tid,
        refs: &dyn ReferencesExtractor,
    ) -> Result<HashMap<Oid, u64>> {
        let mut reader = self.scan_reader()?;
        let mut heads: HashMap<Oid, u64> = HashMap::new();
        let mut seen: HashSet<Oid> = HashSet::new();
        let mut stack = vec![Oid::ROOT];

        while let Some(oid) = stack.pop() {
            if !seen.insert(oid) {
                continue;
            }
            let Some(mut offset) = snapshot.get(oid) else { continue };
            // Newest revision at or below the horizon.
            let record = loop {
                let record = reader.data_record_at(offset)?;
                if record.header.tid <= pack_tid {
                    break Some(record);
                }
                if record.header.prev_offset == 0 {
                    break None;
                }
                offset = record.header.prev_offset;
            };
            let Some(record) = record else { continue };
            let Some(blob) = reader.resolve_payload(&record)? else {
                // Deleted at the horizon: not part of the live graph.
                continue;
            };
            heads.insert(oid, offset);
            for referenced in refs.references(&blob) {
                if !seen.contains(&referenced) {
                    stack.push(referenced);
                }
            }
        }
        Ok(heads)
    }

    /// Copy the transactions in `[start, end)` into `copy`, applying the
    /// pack retention rule.
    fn copy_range(
        &self,
        reader: &mut LogReader,
        copy: &mut PackCopy,
        start: u64,
        end: u64,
        pack_tid: Tid,
        horizon_heads: Option<&HashMap<Oid, u64>>,
    ) -> Result<()> {
        let mut scan = self.scan_reader()?;
        for entry in scan.iter_txns(start, end) {
            let entry = entry?;
            let pre_horizon = entry.header.tid <= pack_tid;

            let records = reader
                .iter_data(entry.offset, &entry.header)
                .collect::<Result<Vec<_>>>()?;
            let kept: Vec<_> = records
                .into_iter()
                .filter(|data| {
                    if !pre_horizon {
                        return true;
                    }
                    match horizon_heads {
                        Some(heads) => heads.get(&data.record.header.oid) == Some(&data.offset),
                        None => true,
                    }
                })
                .collect();
            if kept.is_empty() {
                continue;
            }

            let status = if pre_horizon { TxnStatus::Packed } else { entry.header.status };
            let mut builder =
                TxnBuilder::new(entry.header.tid, status, &entry.header.meta, copy.out.end())?;
            for data in &kept {
                let oid = data.record.header.oid;
                let prev = copy.prev_new.get(&oid).copied().unwrap_or(0);
                let payload = match &data.record.payload {
                    RecordPayload::Blob(blob) => RecordPayload::Blob(blob.clone()),
                    RecordPayload::Back(0) => RecordPayload::Back(0),
                    RecordPayload::Back(target) => match copy.off_map.get(target) {
                        Some(new_target) => RecordPayload::Back(*new_target),
                        // The alias target did not survive the pack;
                        // materialize the state inline.
                        None => match reader.resolve_payload(&data.record)? {
                            Some(blob) => RecordPayload::Blob(blob),
                            None => RecordPayload::Back(0),
                        },
                    },
                };
                let status = data.record.header.status;
                let new_offset = builder.add_record(oid, prev, status, &payload);
                copy.off_map.insert(data.offset, new_offset);
                copy.prev_new.insert(oid, new_offset);
                match status {
                    RecordStatus::Deleted => copy.new_index.remove(oid),
                    _ => copy.new_index.insert(oid, new_offset),
                }
            }
            let (body, trailer, _) = builder.finish();
            copy.out.append(&body)?;
            copy.out.append(&trailer)?;
        }
        Ok(())
    }
}
