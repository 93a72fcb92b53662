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

//! Object Storage Engine
//!
//! [`ObjectStore`] ties the log, the OID index, and the lock manager into
//! the MVCC storage surface: snapshot reads (`load`, `load_before`,
//! `load_serial`), tentative writes (`store`), and the two-phase commit
//! hooks (`tpc_begin` / `tpc_vote` / `tpc_finish` / `tpc_abort`).
//!
//! One transaction is current per storage at a time. Writes buffer in
//! memory; `tpc_vote` assigns the TID, re-checks conflicts, and flushes the
//! transaction body (header and data records, no trailer) to the log;
//! `tpc_finish` appends the trailer, fsyncs, and publishes the new index
//! entries and safe offset. A crash before the trailer therefore leaves a
//! tail that recovery can identify and set aside.
//!
//! Reads never block commits: they see only offsets at or below the
//! published safe offset and walk immutable bytes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info};

use orbdb_core::record::{RecordPayload, RecordStatus, TransactionMeta, TxnStatus};
use orbdb_core::resolver::{ConflictResolver, NoMerge};
use orbdb_core::{Oid, OrbError, Result, Tid};

use crate::commit_lock::ReentrantLock;
use crate::flock::StoreLock;
use crate::index::{index_path, OidIndex};
use crate::log::{LogFile, LogReader, TxnBuilder, TXN_STATUS_OFFSET};
use crate::recovery;

/// Options for opening a storage.
#[derive(Clone)]
pub struct StoreOptions {
    pub name: String,
    pub read_only: bool,
    pub resolver: Arc<dyn ConflictResolver>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            read_only: false,
            resolver: Arc::new(NoMerge),
        }
    }
}

/// Opaque token naming a session's transaction on this storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Begun,
    Stored,
    Voted,
}

pub(crate) enum PendingPayload {
    Blob(Vec<u8>),
    /// Alias to an older data-carrying record (undo).
    Alias(u64),
    /// Object ceases to exist at this revision.
    Delete,
}

pub(crate) struct Pending {
    pub(crate) oid: Oid,
    pub(crate) expected: Tid,
    pub(crate) payload: PendingPayload,
    /// Conflict handling already happened (merge or undo staging).
    pub(crate) resolved: bool,
}

pub(crate) struct CurrentTxn {
    pub(crate) id: u64,
    pub(crate) phase: Phase,
    pub(crate) meta: TransactionMeta,
    pub(crate) pending: Vec<Pending>,
    pub(crate) tid: Option<Tid>,
    /// Where the voted body was appended.
    pub(crate) append_offset: u64,
    pub(crate) trailer: [u8; 8],
    /// Index updates to publish on finish.
    pub(crate) staged: Vec<(Oid, u64, RecordStatus)>,
    /// Offsets of transactions to mark undone on finish.
    pub(crate) undone_txns: Vec<u64>,
}

/// The storage engine: append-only log + OID index + MVCC snapshot reads.
pub struct ObjectStore {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) log: Mutex<LogFile>,
    pub(crate) reader: Mutex<LogReader>,
    pub(crate) index: RwLock<OidIndex>,
    pub(crate) commit_lock: ReentrantLock,
    pub(crate) storage_lock: ReentrantLock,
    pub(crate) current: Mutex<Option<CurrentTxn>>,
    pub(crate) txn_free: Condvar,
    next_handle: AtomicU64,
    oid_counter: AtomicU64,
    read_only: bool,
    /// Latched when a commit-time write failure leaves the on-disk state
    /// untrustworthy; all further mutation is refused.
    pub(crate) degraded: AtomicBool,
    pub(crate) resolver: Arc<dyn ConflictResolver>,
    _write_lock: Option<StoreLock>,
}

impl ObjectStore {
    /// Open (creating if absent) the log at `path`.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        if !path.exists() {
            if options.read_only {
                return Err(OrbError::ReadOnly);
            }
            drop(LogFile::create(path)?);
        }

        let write_lock = if options.read_only {
            None
        } else {
            Some(StoreLock::acquire(path)?)
        };

        let report = if options.read_only {
            recovery::scan(path)?
        } else {
            recovery::recover(path)?
        };
        info!(
            storage = %options.name,
            path = %path.display(),
            objects = report.index.len(),
            last_tid = %report.last_tid,
            "storage opened"
        );

        let log = LogFile::open(path)?;
        let reader = LogReader::open(path)?;
        let oid_counter = report.index.max_oid() + 1;

        Ok(ObjectStore {
            name: options.name,
            path: path.to_path_buf(),
            log: Mutex::new(log),
            reader: Mutex::new(reader),
            index: RwLock::new(report.index),
            commit_lock: ReentrantLock::new("commit"),
            storage_lock: ReentrantLock::new("storage"),
            current: Mutex::new(None),
            txn_free: Condvar::new(),
            next_handle: AtomicU64::new(1),
            oid_counter: AtomicU64::new(oid_counter),
            read_only: options.read_only,
            degraded: AtomicBool::new(false),
            resolver: options.resolver,
            _write_lock: write_lock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of objects with a live head revision.
    pub fn len(&self) -> u64 {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Physical size of the log in bytes.
    pub fn size(&self) -> u64 {
        self.log.lock().end()
    }

    /// TID of the most recent committed transaction.
    pub fn last_tid(&self) -> Tid {
        self.index.read().last_tid
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only || self.degraded.load(Ordering::Acquire)
    }

    /// Persist the index sidecar. Called on close; cheap to call anytime.
    pub fn flush_index(&self) -> Result<()> {
        self.index.read().save(&index_path(&self.path))
    }

    /// A fresh log reader for long scans, so point reads are not blocked.
    pub(crate) fn scan_reader(&self) -> Result<LogReader> {
        LogReader::open(&self.path)
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(OrbError::ReadOnly);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // OID allocation
    // ------------------------------------------------------------------

    /// Allocate a fresh OID. OIDs are never reused.
    pub fn new_oid(&self) -> Result<Oid> {
        self.check_writable()?;
        Ok(Oid::from_u64(self.oid_counter.fetch_add(1, Ordering::SeqCst)))
    }

    /// Allocate a batch of OIDs for a client that wants to assign locally.
    pub fn new_oids(&self, count: u32) -> Result<Vec<Oid>> {
        self.check_writable()?;
        let count = u64::from(count.max(1));
        let first = self.oid_counter.fetch_add(count, Ordering::SeqCst);
        Ok((first..first + count).map(Oid::from_u64).collect())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Latest revision of `oid`: `(blob, serial)`.
    pub fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid)> {
        let offset = self.head_offset(oid)?;
        let mut reader = self.reader.lock();
        let record = reader.data_record_at(offset)?;
        match reader.resolve_payload(&record)? {
            Some(blob) => Ok((blob, record.header.tid)),
            None => Err(OrbError::KeyNotFound { oid }),
        }
    }

    /// The exact revision of `oid` written by transaction `serial`.
    pub fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>> {
        let mut offset = self.head_offset(oid)?;
        let mut reader = self.reader.lock();
        loop {
            let record = reader.data_record_at(offset)?;
            if record.header.tid == serial {
                return match reader.resolve_payload(&record)? {
                    Some(blob) => Ok(blob),
                    None => Err(OrbError::RevisionNotFound { oid, tid: serial }),
                };
            }
            if record.header.tid < serial || record.header.prev_offset == 0 {
                return Err(OrbError::RevisionNotFound { oid, tid: serial });
            }
            offset = record.header.prev_offset;
        }
    }

    /// The revision of `oid` current just before `tid`, with its validity
    /// window: `(blob, start, end)` such that `start < tid` and the revision
    /// was superseded at `end` (`None` while it is still current).
    ///
    /// Returns `Ok(None)` when `tid` precedes the object's earliest revision.
    pub fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<(Vec<u8>, Tid, Option<Tid>)>> {
        let mut offset = self.head_offset(oid)?;
        let mut reader = self.reader.lock();
        let mut end: Option<Tid> = None;
        loop {
            let record = reader.data_record_at(offset)?;
            if record.header.tid < tid {
                return match reader.resolve_payload(&record)? {
                    Some(blob) => Ok(Some((blob, record.header.tid, end))),
                    None => Err(OrbError::KeyNotFound { oid }),
                };
            }
            if record.header.prev_offset == 0 {
                return Ok(None);
            }
            end = Some(record.header.tid);
            offset = record.header.prev_offset;
        }
    }

    fn head_offset(&self, oid: Oid) -> Result<u64> {
        self.index.read().get(oid).ok_or(OrbError::KeyNotFound { oid })
    }

    // ------------------------------------------------------------------
    // Two-phase commit
    // ------------------------------------------------------------------

    /// Install a new current transaction, failing if one is already active.
    pub fn tpc_begin(&self, meta: TransactionMeta) -> Result<TxnHandle> {
        self.check_writable()?;
        let mut current = self.current.lock();
        if current.is_some() {
            return Err(OrbError::TransactionState {
                detail: "another transaction is active on this storage".to_string(),
            });
        }
        Ok(self.install_txn(&mut current, meta))
    }

    /// Like [`tpc_begin`](Self::tpc_begin) but waits (FIFO via the condvar)
    /// for the active transaction to complete, up to `deadline`.
    pub fn tpc_begin_blocking(
        &self,
        meta: TransactionMeta,
        deadline: Option<Instant>,
    ) -> Result<TxnHandle> {
        self.check_writable()?;
        let mut current = self.current.lock();
        while current.is_some() {
            match deadline {
                Some(deadline) => {
                    if self.txn_free.wait_until(&mut current, deadline).timed_out() {
                        return Err(OrbError::TransactionState {
                            detail: "timed out waiting to begin a transaction".to_string(),
                        });
                    }
                }
                None => self.txn_free.wait(&mut current),
            }
        }
        Ok(self.install_txn(&mut current, meta))
    }

    fn install_txn(&self, slot: &mut Option<CurrentTxn>, meta: TransactionMeta) -> TxnHandle {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        *slot = Some(CurrentTxn {
            id,
            phase: Phase::Begun,
            meta,
            pending: Vec::new(),
            tid: None,
            append_offset: 0,
            trailer: [0; 8],
            staged: Vec::new(),
            undone_txns: Vec::new(),
        });
        TxnHandle(id)
    }

    /// Queue a tentative write of `data` for `oid`.
    ///
    /// `expected` is the serial the caller last observed for the object
    /// (zero for a new object). A mismatch against the committed head is
    /// offered to the conflict resolver; an unresolved mismatch fails with
    /// [`OrbError::ReadConflict`].
    pub fn store(&self, txn: TxnHandle, oid: Oid, expected: Tid, data: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        let mut current = self.current.lock();
        let cur = Self::current_mut(&mut current, txn)?;
        let retry = cur.phase == Phase::Voted;
        if retry && !cur.pending.iter().any(|p| p.oid == oid) {
            return Err(OrbError::TransactionState {
                detail: "voted transaction accepts only conflict-resolution retries".to_string(),
            });
        }

        let pending = self.reconcile(oid, expected, data)?;
        match cur.pending.iter_mut().find(|p| p.oid == oid) {
            Some(slot) => *slot = pending,
            None => cur.pending.push(pending),
        }
        if cur.phase == Phase::Begun {
            cur.phase = Phase::Stored;
        }
        Ok(())
    }

    /// Check `expected` against the committed head, consulting the resolver
    /// on a mismatch.
    fn reconcile(&self, oid: Oid, expected: Tid, data: Vec<u8>) -> Result<Pending> {
        let head = self.index.read().get(oid);
        let Some(head_offset) = head else {
            if !expected.is_zero() {
                return Err(OrbError::KeyNotFound { oid });
            }
            return Ok(Pending { oid, expected, payload: PendingPayload::Blob(data), resolved: false });
        };

        let (actual, saved) = {
            let mut reader = self.reader.lock();
            let record = reader.data_record_at(head_offset)?;
            (record.header.tid, reader.resolve_payload(&record)?)
        };

        if expected == actual {
            return Ok(Pending { oid, expected, payload: PendingPayload::Blob(data), resolved: false });
        }
        if saved.is_none() && expected.is_zero() {
            // Recreating a deleted object is an ordinary store.
            return Ok(Pending { oid, expected: actual, payload: PendingPayload::Blob(data), resolved: true });
        }

        let old = if expected.is_zero() {
            None
        } else {
            self.load_serial(oid, expected).ok()
        };
        let merged = match (old.as_deref(), saved.as_deref()) {
            (Some(old), Some(saved)) => self.resolver.resolve(oid, old, saved, &data),
            _ => None,
        };
        match merged {
            Some(merged) => {
                debug!(%oid, %expected, %actual, "store conflict resolved by merge");
                Ok(Pending { oid, expected: actual, payload: PendingPayload::Blob(merged), resolved: true })
            }
            None => Err(OrbError::ReadConflict { oid }),
        }
    }

    /// First commit phase: take the commit lock, assign the TID, re-check
    /// conflicts, and flush the transaction body (without its trailer).
    pub fn tpc_vote(&self, txn: TxnHandle, deadline: Option<Instant>) -> Result<Tid> {
        self.check_writable()?;
        {
            let mut current = self.current.lock();
            let cur = Self::current_mut(&mut current, txn)?;
            if cur.phase == Phase::Voted {
                return Err(OrbError::TransactionState {
                    detail: "transaction has already voted".to_string(),
                });
            }
        }

        if let Err(err) = self.commit_lock.acquire(deadline) {
            // Deadline expired: the transaction cannot make progress.
            let _ = self.tpc_abort(txn);
            return Err(err);
        }

        match self.vote_locked(txn) {
            Ok(tid) => Ok(tid),
            Err(err) => {
                let _ = self.commit_lock.release();
                let _ = self.tpc_abort(txn);
                Err(err)
            }
        }
    }

    fn vote_locked(&self, txn: TxnHandle) -> Result<Tid> {
        let mut current = self.current.lock();
        let cur = Self::current_mut(&mut current, txn)?;

        let tid = Tid::now().later_than(self.index.read().last_tid);

        // Late conflict detection. Between store and vote nothing else can
        // have committed (begin is exclusive), but undo staging and resolver
        // merges rely on this re-check being authoritative.
        for pending in &mut cur.pending {
            if pending.resolved {
                continue;
            }
            if let PendingPayload::Blob(data) = &pending.payload {
                let head = self.index.read().get(pending.oid);
                let actual = match head {
                    Some(offset) => self.reader.lock().data_record_at(offset)?.header.tid,
                    None => Tid::ZERO,
                };
                if actual != pending.expected {
                    let replacement = self.reconcile(pending.oid, pending.expected, data.clone());
                    match replacement {
                        Ok(resolved) => *pending = resolved,
                        Err(_) => {
                            return Err(OrbError::Conflict {
                                oid: pending.oid,
                                expected: pending.expected,
                                actual,
                            });
                        }
                    }
                }
            }
        }

        let mut log = self.log.lock();
        let base = log.end();
        let mut builder = TxnBuilder::new(tid, TxnStatus::Normal, &cur.meta, base)?;
        let index = self.index.read();
        let mut statuses = Vec::with_capacity(cur.pending.len());
        for pending in &cur.pending {
            let prev = index.get(pending.oid).unwrap_or(0);
            let (status, payload) = match &pending.payload {
                PendingPayload::Blob(blob) => (RecordStatus::Valid, RecordPayload::Blob(blob.clone())),
                PendingPayload::Alias(back) => (RecordStatus::Valid, RecordPayload::Back(*back)),
                PendingPayload::Delete => (RecordStatus::Deleted, RecordPayload::Back(0)),
            };
            builder.add_record(pending.oid, prev, status, &payload);
            statuses.push(status);
        }
        drop(index);

        let (body, trailer, offsets) = builder.finish();
        log.append(&body)?;

        cur.tid = Some(tid);
        cur.phase = Phase::Voted;
        cur.append_offset = base;
        cur.trailer = trailer;
        cur.staged = offsets
            .into_iter()
            .zip(statuses)
            .map(|((oid, offset), status)| (oid, offset, status))
            .collect();
        debug!(%tid, records = cur.staged.len(), "transaction voted");
        Ok(tid)
    }

    /// Second commit phase: append the trailer, fsync, publish the index
    /// updates and safe offset, and run `f(tid)` while the commit lock is
    /// still held (invalidation fan-out hangs off this callback).
    pub fn tpc_finish(&self, txn: TxnHandle, f: impl FnOnce(Tid)) -> Result<Tid> {
        let mut current = self.current.lock();
        let cur = Self::current_mut(&mut current, txn)?;
        if cur.phase != Phase::Voted {
            return Err(OrbError::TransactionState {
                detail: "tpc_finish before vote".to_string(),
            });
        }
        let tid = cur.tid.expect("voted transaction has a tid");

        {
            let mut log = self.log.lock();
            let write_result = (|| -> Result<()> {
                log.append(&cur.trailer)?;
                for offset in &cur.undone_txns {
                    log.write_at(offset + TXN_STATUS_OFFSET, &[TxnStatus::Undone as u8])?;
                }
                log.sync()?;
                Ok(())
            })();
            if let Err(err) = write_result {
                // The commit point may or may not be durable; refuse all
                // further writes and leave the bytes for the operator.
                self.degraded.store(true, Ordering::Release);
                error!(%tid, error = %err, "commit-time write failure, storage now read-only");
                *current = None;
                self.txn_free.notify_all();
                let _ = self.commit_lock.release();
                return Err(err);
            }

            let mut index = self.index.write();
            for (oid, offset, status) in &cur.staged {
                match status {
                    RecordStatus::Deleted => index.remove(*oid),
                    _ => index.insert(*oid, *offset),
                }
                let next = oid.as_u64() + 1;
                self.oid_counter.fetch_max(next, Ordering::SeqCst);
            }
            index.safe_offset = log.end();
            index.last_tid = tid;
        }

        f(tid);

        *current = None;
        self.txn_free.notify_all();
        self.commit_lock.release()?;
        debug!(%tid, "transaction finished");
        Ok(tid)
    }

    /// Abort the current transaction in any pre-finish state, discarding the
    /// tentative buffer and truncating a voted body off the log.
    pub fn tpc_abort(&self, txn: TxnHandle) -> Result<()> {
        let mut current = self.current.lock();
        let matches = current.as_ref().map(|c| c.id == txn.0).unwrap_or(false);
        if !matches {
            // Aborting a transaction that is not current is a no-op; abort
            // must always be safe to call.
            return Ok(());
        }
        let cur = current.take().expect("checked above");
        if cur.phase == Phase::Voted {
            let mut log = self.log.lock();
            let result = log.truncate_to(cur.append_offset);
            if let Err(err) = result {
                self.degraded.store(true, Ordering::Release);
                error!(error = %err, "failed to truncate aborted transaction, storage now read-only");
            }
            drop(log);
            let _ = self.commit_lock.release();
        }
        self.txn_free.notify_all();
        debug!("transaction aborted");
        Ok(())
    }

    /// OIDs the current transaction has staged, for invalidation fan-out.
    pub fn txn_oids(&self, txn: TxnHandle) -> Result<Vec<Oid>> {
        let mut current = self.current.lock();
        let cur = Self::current_mut(&mut current, txn)?;
        Ok(cur.pending.iter().map(|p| p.oid).collect())
    }

    pub(crate) fn current_mut<'a>(
        slot: &'a mut Option<CurrentTxn>,
        txn: TxnHandle,
    ) -> Result<&'a mut CurrentTxn> {
        match slot {
            Some(cur) if cur.id == txn.0 => Ok(cur),
            Some(_) => Err(OrbError::TransactionState {
                detail: "handle does not name the current transaction".to_string(),
            }),
            None => Err(OrbError::TransactionState {
                detail: "no transaction is active".to_string(),
            }),
        }
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        if !self.is_read_only() {
            if let Err(err) = self.flush_index() {
                error!(error = %err, "failed to persist index sidecar on close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> ObjectStore {
        ObjectStore::open(&dir.path().join("data.orb"), StoreOptions::default()).unwrap()
    }

    fn meta() -> TransactionMeta {
        TransactionMeta::new(b"tester".to_vec(), b"unit".to_vec(), Vec::new())
    }

    fn commit_one(store: &ObjectStore, oid: Oid, expected: Tid, blob: &[u8]) -> Tid {
        let txn = store.tpc_begin(meta()).unwrap();
        store.store(txn, oid, expected, blob.to_vec()).unwrap();
        store.tpc_vote(txn, None).unwrap();
        store.tpc_finish(txn, |_| {}).unwrap()
    }

    #[test]
    fn test_store_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let oid = store.new_oid().unwrap();
        let tid = commit_one(&store, oid, Tid::ZERO, b"A");

        let (blob, serial) = store.load(oid).unwrap();
        assert_eq!(blob, b"A");
        assert_eq!(serial, tid);
        assert_eq!(store.last_tid(), tid);
    }

    #[test]
    fn test_load_unknown_oid() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(matches!(
            store.load(Oid::from_u64(99)),
            Err(OrbError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_tids_strictly_increase() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let oid = store.new_oid().unwrap();
        let mut last = Tid::ZERO;
        let mut expected = Tid::ZERO;
        for i in 0..5u8 {
            let tid = commit_one(&store, oid, expected, &[i]);
            assert!(tid > last);
            last = tid;
            expected = tid;
        }
    }

    #[test]
    fn test_load_before_windows() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let oid = store.new_oid().unwrap();
        let t1 = commit_one(&store, oid, Tid::ZERO, b"v1");
        let t2 = commit_one(&store, oid, t1, b"v2");

        // Snapshot at t2 sees v1 with window [t1, t2).
        let (blob, start, end) = store.load_before(oid, t2).unwrap().unwrap();
        assert_eq!(blob, b"v1");
        assert_eq!(start, t1);
        assert_eq!(end, Some(t2));

        // Before the first revision there is nothing.
        assert!(store.load_before(oid, t1).unwrap().is_none());

        // The far future sees the current revision, unbounded.
        let (blob, start, end) = store.load_before(oid, Tid::MAX).unwrap().unwrap();
        assert_eq!(blob, b"v2");
        assert_eq!(start, t2);
        assert_eq!(end, None);
    }

    #[test]
    fn test_load_serial_exact() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let oid = store.new_oid().unwrap();
        let t1 = commit_one(&store, oid, Tid::ZERO, b"v1");
        let t2 = commit_one(&store, oid, t1, b"v2");

        assert_eq!(store.load_serial(oid, t1).unwrap(), b"v1");
        assert_eq!(store.load_serial(oid, t2).unwrap(), b"v2");
        assert!(matches!(
            store.load_serial(oid, Tid::MAX),
            Err(OrbError::RevisionNotFound { .. })
        ));
    }

    #[test]
    fn test_stale_store_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let oid = store.new_oid().unwrap();
        let t1 = commit_one(&store, oid, Tid::ZERO, b"v1");
        let _t2 = commit_one(&store, oid, t1, b"v2");

        // A writer that still believes t1 is current must conflict.
        let txn = store.tpc_begin(meta()).unwrap();
        let err = store.store(txn, oid, t1, b"v3".to_vec()).unwrap_err();
        assert!(matches!(err, OrbError::ReadConflict { .. }));
        store.tpc_abort(txn).unwrap();
    }

    #[test]
    fn test_resolver_merges_conflict() {
        struct LastWriteWins;
        impl ConflictResolver for LastWriteWins {
            fn resolve(&self, _oid: Oid, _old: &[u8], _saved: &[u8], new: &[u8]) -> Option<Vec<u8>> {
                Some(new.to_vec())
            }
        }

        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(
            &dir.path().join("data.orb"),
            StoreOptions { resolver: Arc::new(LastWriteWins), ..Default::default() },
        )
        .unwrap();
        let oid = store.new_oid().unwrap();
        let t1 = commit_one(&store, oid, Tid::ZERO, b"v1");
        let t2 = commit_one(&store, oid, t1, b"v2");

        // Stale expected serial, but the resolver accepts the merge.
        let t3 = commit_one(&store, oid, t1, b"v3");
        assert!(t3 > t2);
        assert_eq!(store.load(oid).unwrap().0, b"v3");
    }

    #[test]
    fn test_second_begin_rejected_and_blocking_begin_waits() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir));
        let txn = store.tpc_begin(meta()).unwrap();
        assert!(store.tpc_begin(meta()).is_err());

        let store2 = Arc::clone(&store);
        let waiter = std::thread::spawn(move || {
            let txn2 = store2.tpc_begin_blocking(meta(), None).unwrap();
            store2.tpc_abort(txn2).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        store.tpc_abort(txn).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_abort_discards_voted_body() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let oid = store.new_oid().unwrap();
        commit_one(&store, oid, Tid::ZERO, b"keep");
        let size_before = store.size();

        let txn = store.tpc_begin(meta()).unwrap();
        store.store(txn, oid, store.last_tid(), b"discard".to_vec()).unwrap();
        store.tpc_vote(txn, None).unwrap();
        assert!(store.size() > size_before);
        store.tpc_abort(txn).unwrap();
        assert_eq!(store.size(), size_before);
        assert_eq!(store.load(oid).unwrap().0, b"keep");

        // The storage is fully usable afterwards.
        let t = commit_one(&store, oid, store.last_tid(), b"next");
        assert_eq!(store.load(oid).unwrap(), (b"next".to_vec(), t));
    }

    #[test]
    fn test_finish_callback_sees_tid() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let oid = store.new_oid().unwrap();
        let txn = store.tpc_begin(meta()).unwrap();
        store.store(txn, oid, Tid::ZERO, b"x".to_vec()).unwrap();
        let voted = store.tpc_vote(txn, None).unwrap();
        let seen = Mutex::new(Tid::ZERO);
        let finished = store.tpc_finish(txn, |tid| *seen.lock() = tid).unwrap();
        assert_eq!(voted, finished);
        assert_eq!(*seen.lock(), finished);
    }

    #[test]
    fn test_new_oids_are_distinct() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut oids = store.new_oids(10).unwrap();
        oids.push(store.new_oid().unwrap());
        let unique: std::collections::HashSet<_> = oids.iter().collect();
        assert_eq!(unique.len(), oids.len());
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            let oid = store.new_oid().unwrap();
            commit_one(&store, oid, Tid::ZERO, b"v1");
        }
        let store = ObjectStore::open(
            &dir.path().join("data.orb"),
            StoreOptions { read_only: true, ..Default::default() },
        )
        .unwrap();
        assert!(matches!(store.new_oid(), Err(OrbError::ReadOnly)));
        assert!(matches!(store.tpc_begin(meta()), Err(OrbError::ReadOnly)));
        // Reads still work.
        assert_eq!(store.load(Oid::from_u64(1)).unwrap().0, b"v1");
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = TempDir::new().unwrap();
        let oid;
        let tid;
        {
            let store = open(&dir);
            oid = store.new_oid().unwrap();
            tid = commit_one(&store, oid, Tid::ZERO, b"persisted");
        }
        let store = open(&dir);
        assert_eq!(store.load(oid).unwrap(), (b"persisted".to_vec(), tid));
        assert_eq!(store.last_tid(), tid);
        // OID allocation resumes past existing objects.
        assert!(store.new_oid().unwrap().as_u64() > oid.as_u64());
    }

    #[test]
    fn test_vote_deadline_in_past_aborts() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir));
        let oid = store.new_oid().unwrap();

        // Hold the commit lock from another thread so the vote must wait.
        let store2 = Arc::clone(&store);
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            store2.commit_lock.acquire(None).unwrap();
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            store2.commit_lock.release().unwrap();
        });
        started_rx.recv().unwrap();

        let txn = store.tpc_begin(meta()).unwrap();
        store.store(txn, oid, Tid::ZERO, b"x".to_vec()).unwrap();
        let deadline = Instant::now() + std::time::Duration::from_millis(50);
        assert!(store.tpc_vote(txn, Some(deadline)).is_err());
        // The transaction was aborted by the failed vote.
        assert!(store.tpc_begin(meta()).is_ok());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
    }
}
