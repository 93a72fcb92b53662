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

//! Per-Session Transaction Coordinator
//!
//! Coordinates a two-phase commit across one or more resource managers.
//! A session owns one [`Transaction`] at a time; resource managers join it
//! as they are touched, and commit drives every joined manager through
//! `tpc_begin → commit → tpc_vote → tpc_finish`, aborting all of them if any
//! phase before finish fails.
//!
//! Managers are committed in ascending [`ResourceManager::sort_key`] order so
//! that two sessions committing across the same set of stores always acquire
//! their commit locks in the same order.
//!
//! ## Savepoints
//!
//! A savepoint captures rollback tokens from every joined manager. Rolling
//! one back discards all work done after it but keeps the transaction live.
//! A savepoint dies at the next commit/abort, when an earlier savepoint is
//! rolled back, or when a manager without savepoint support joins.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{OrbError, Result};
use crate::record::TransactionMeta;

/// A participant in two-phase commit.
///
/// The mutation protocol mirrors the storage engine's 2PC surface; `commit`
/// is the tentative apply step that runs between `tpc_begin` and `tpc_vote`.
pub trait ResourceManager: Send {
    /// Stable ordering key. Commits sort joined managers by this key to
    /// avoid lock-order deadlocks across stores.
    fn sort_key(&self) -> String;

    fn tpc_begin(&mut self, txn: &TransactionMeta) -> Result<()>;

    /// Apply buffered work tentatively (still revocable).
    fn commit(&mut self, txn: &TransactionMeta) -> Result<()>;

    fn tpc_vote(&mut self, txn: &TransactionMeta) -> Result<()>;

    fn tpc_finish(&mut self, txn: &TransactionMeta) -> Result<()>;

    fn tpc_abort(&mut self, txn: &TransactionMeta);

    /// Discard buffered work outside the 2PC window.
    fn abort(&mut self, txn: &TransactionMeta);

    /// Whether this manager can produce savepoint rollback tokens.
    fn supports_savepoint(&self) -> bool {
        false
    }

    /// Capture a rollback token for the manager's current buffered state.
    fn savepoint(&mut self) -> Result<Box<dyn SavepointRollback + Send>> {
        Err(OrbError::Unsupported("resource manager has no savepoint support".into()))
    }
}

/// Rollback token returned by [`ResourceManager::savepoint`].
pub trait SavepointRollback {
    fn rollback(&mut self) -> Result<()>;
}

/// Observer notified around every commit and abort.
pub trait Synchronizer: Send + Sync {
    fn before_completion(&self, txn: &TransactionMeta);
    fn after_completion(&self, txn: &TransactionMeta, committed: bool);
}

/// Shared handle to a joined resource manager.
pub type ManagerRef = Arc<Mutex<dyn ResourceManager>>;

/// Queue of before-commit hooks. Hooks run after `commit()` is called but
/// before any `tpc_begin`, and may push further hooks while running.
#[derive(Default)]
pub struct HookQueue(VecDeque<Box<dyn FnOnce(&mut HookQueue) + Send>>);

impl HookQueue {
    pub fn push<F: FnOnce(&mut HookQueue) + Send + 'static>(&mut self, hook: F) {
        self.0.push_back(Box::new(hook));
    }

    fn drain(&mut self) {
        while let Some(hook) = self.0.pop_front() {
            hook(self);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
}

type SavepointRegistry = Arc<Mutex<Vec<(u64, Arc<AtomicBool>)>>>;

/// An intra-transaction rollback marker.
pub struct Savepoint {
    seq: u64,
    valid: Arc<AtomicBool>,
    rollbacks: Vec<Box<dyn SavepointRollback + Send>>,
    registry: SavepointRegistry,
}

impl Savepoint {
    /// Roll the transaction back to this savepoint's state.
    ///
    /// Invalidates every savepoint taken after this one. Fails if the
    /// savepoint itself has already been invalidated.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.valid.load(Ordering::Acquire) {
            return Err(OrbError::TransactionState {
                detail: "savepoint is no longer valid".into(),
            });
        }
        for token in self.rollbacks.iter_mut().rev() {
            token.rollback()?;
        }
        let registry = self.registry.lock();
        for (seq, valid) in registry.iter() {
            if *seq > self.seq {
                valid.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

/// One unit of work spanning one or more resource managers.
pub struct Transaction {
    meta: TransactionMeta,
    managers: Vec<ManagerRef>,
    hooks: HookQueue,
    synchronizers: Vec<Arc<dyn Synchronizer>>,
    savepoints: SavepointRegistry,
    savepoint_seq: u64,
    state: TxnState,
}

impl Transaction {
    pub fn new(meta: TransactionMeta) -> Self {
        Self {
            meta,
            managers: Vec::new(),
            hooks: HookQueue::default(),
            synchronizers: Vec::new(),
            savepoints: Arc::new(Mutex::new(Vec::new())),
            savepoint_seq: 0,
            state: TxnState::Active,
        }
    }

    pub fn meta(&self) -> &TransactionMeta {
        &self.meta
    }

    /// Join a resource manager. Idempotent per `Arc` identity.
    ///
    /// Joining a manager without savepoint support invalidates any live
    /// savepoints: they could no longer roll the whole transaction back.
    pub fn join(&mut self, manager: ManagerRef) -> Result<()> {
        self.ensure_active()?;
        if self.managers.iter().any(|m| Arc::ptr_eq(m, &manager)) {
            return Ok(());
        }
        if !manager.lock().supports_savepoint() {
            self.invalidate_savepoints();
        }
        self.managers.push(manager);
        Ok(())
    }

    /// Register a hook to run after `commit()` is called but before any
    /// manager's `tpc_begin`. Hooks are discarded on abort.
    pub fn add_before_commit_hook<F: FnOnce(&mut HookQueue) + Send + 'static>(&mut self, hook: F) {
        self.hooks.push(hook);
    }

    pub fn add_synchronizer(&mut self, sync: Arc<dyn Synchronizer>) {
        self.synchronizers.push(sync);
    }

    /// Capture a savepoint across every joined manager.
    pub fn savepoint(&mut self) -> Result<Savepoint> {
        self.ensure_active()?;
        let mut rollbacks = Vec::with_capacity(self.managers.len());
        for manager in &self.managers {
            let mut manager = manager.lock();
            if !manager.supports_savepoint() {
                return Err(OrbError::Unsupported(format!(
                    "manager {} does not support savepoints",
                    manager.sort_key()
                )));
            }
            rollbacks.push(manager.savepoint()?);
        }
        self.savepoint_seq += 1;
        let valid = Arc::new(AtomicBool::new(true));
        self.savepoints.lock().push((self.savepoint_seq, Arc::clone(&valid)));
        Ok(Savepoint {
            seq: self.savepoint_seq,
            valid,
            rollbacks,
            registry: Arc::clone(&self.savepoints),
        })
    }

    /// Run two-phase commit across all joined managers.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        for sync in &self.synchronizers {
            sync.before_completion(&self.meta);
        }
        self.hooks.drain();

        let mut ordered: Vec<ManagerRef> = self.managers.clone();
        ordered.sort_by_key(|m| m.lock().sort_key());

        let result = self.run_two_phase(&ordered);
        match result {
            Ok(()) => {
                self.state = TxnState::Committed;
                self.invalidate_savepoints();
                for sync in &self.synchronizers {
                    sync.after_completion(&self.meta, true);
                }
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "two-phase commit failed, aborting participants");
                for manager in ordered.iter().rev() {
                    manager.lock().tpc_abort(&self.meta);
                }
                self.state = TxnState::Aborted;
                self.invalidate_savepoints();
                for sync in &self.synchronizers {
                    sync.after_completion(&self.meta, false);
                }
                Err(err)
            }
        }
    }

    fn run_two_phase(&self, ordered: &[ManagerRef]) -> Result<()> {
        for manager in ordered {
            manager.lock().tpc_begin(&self.meta)?;
        }
        for manager in ordered {
            manager.lock().commit(&self.meta)?;
        }
        for manager in ordered {
            manager.lock().tpc_vote(&self.meta)?;
        }
        // Past the vote barrier every participant has promised to finish.
        for manager in ordered {
            manager.lock().tpc_finish(&self.meta)?;
        }
        Ok(())
    }

    /// Abort the transaction, discarding buffered work everywhere.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_active()?;
        for sync in &self.synchronizers {
            sync.before_completion(&self.meta);
        }
        self.hooks = HookQueue::default();
        for manager in &self.managers {
            manager.lock().abort(&self.meta);
        }
        self.state = TxnState::Aborted;
        self.invalidate_savepoints();
        for sync in &self.synchronizers {
            sync.after_completion(&self.meta, false);
        }
        Ok(())
    }

    fn invalidate_savepoints(&mut self) {
        let mut registry = self.savepoints.lock();
        for (_, valid) in registry.iter() {
            valid.store(false, Ordering::Release);
        }
        registry.clear();
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(OrbError::TransactionState {
                detail: format!("transaction already {:?}", self.state),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Records the order in which 2PC phases were driven.
    struct TraceManager {
        key: String,
        trace: Arc<Mutex<Vec<String>>>,
        fail_on_vote: bool,
        buffered: Vec<u32>,
        savepoints: bool,
    }

    impl TraceManager {
        fn new(key: &str, trace: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                key: key.to_string(),
                trace,
                fail_on_vote: false,
                buffered: Vec::new(),
                savepoints: true,
            }
        }

        fn log(&self, phase: &str) {
            self.trace.lock().push(format!("{}:{}", self.key, phase));
        }
    }

    struct TraceRollback {
        len: usize,
        buffered: Arc<Mutex<Vec<u32>>>,
    }

    impl SavepointRollback for TraceRollback {
        fn rollback(&mut self) -> Result<()> {
            self.buffered.lock().truncate(self.len);
            Ok(())
        }
    }

    impl ResourceManager for TraceManager {
        fn sort_key(&self) -> String {
            self.key.clone()
        }

        fn tpc_begin(&mut self, _txn: &TransactionMeta) -> Result<()> {
            self.log("begin");
            Ok(())
        }

        fn commit(&mut self, _txn: &TransactionMeta) -> Result<()> {
            self.log("commit");
            Ok(())
        }

        fn tpc_vote(&mut self, _txn: &TransactionMeta) -> Result<()> {
            self.log("vote");
            if self.fail_on_vote {
                return Err(OrbError::ReadConflict { oid: crate::oid::Oid::from_u64(1) });
            }
            Ok(())
        }

        fn tpc_finish(&mut self, _txn: &TransactionMeta) -> Result<()> {
            self.log("finish");
            Ok(())
        }

        fn tpc_abort(&mut self, _txn: &TransactionMeta) {
            self.log("tpc_abort");
        }

        fn abort(&mut self, _txn: &TransactionMeta) {
            self.log("abort");
            self.buffered.clear();
        }

        fn supports_savepoint(&self) -> bool {
            self.savepoints
        }

        fn savepoint(&mut self) -> Result<Box<dyn SavepointRollback + Send>> {
            // Tests only need the length semantics, not shared buffers.
            Ok(Box::new(TraceRollback {
                len: self.buffered.len(),
                buffered: Arc::new(Mutex::new(self.buffered.clone())),
            }))
        }
    }

    fn meta() -> TransactionMeta {
        TransactionMeta::new(b"tester".to_vec(), b"unit".to_vec(), Vec::new())
    }

    #[test]
    fn test_commit_orders_by_sort_key() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut txn = Transaction::new(meta());
        // Joined out of order; commit must sort.
        txn.join(Arc::new(Mutex::new(TraceManager::new("zeta", Arc::clone(&trace))))).unwrap();
        txn.join(Arc::new(Mutex::new(TraceManager::new("alpha", Arc::clone(&trace))))).unwrap();
        txn.commit().unwrap();

        let trace = trace.lock();
        assert_eq!(trace[0], "alpha:begin");
        assert_eq!(trace[1], "zeta:begin");
        let finishes: Vec<_> = trace.iter().filter(|t| t.ends_with(":finish")).collect();
        assert_eq!(finishes, vec!["alpha:finish", "zeta:finish"]);
    }

    #[test]
    fn test_vote_failure_aborts_all() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut txn = Transaction::new(meta());
        let mut failing = TraceManager::new("beta", Arc::clone(&trace));
        failing.fail_on_vote = true;
        txn.join(Arc::new(Mutex::new(TraceManager::new("alpha", Arc::clone(&trace))))).unwrap();
        txn.join(Arc::new(Mutex::new(failing))).unwrap();

        assert!(txn.commit().is_err());
        let trace = trace.lock();
        assert!(trace.contains(&"alpha:tpc_abort".to_string()));
        assert!(trace.contains(&"beta:tpc_abort".to_string()));
        assert!(!trace.iter().any(|t| t.ends_with(":finish")));

        // The transaction is terminal now.
        assert!(txn.commit().is_err());
    }

    #[test]
    fn test_before_commit_hooks_run_and_may_register_more() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut txn = Transaction::new(meta());
        let c1 = Arc::clone(&counter);
        txn.add_before_commit_hook(move |queue| {
            c1.fetch_add(1, Ordering::SeqCst);
            let c2 = Arc::clone(&c1);
            queue.push(move |_| {
                c2.fetch_add(10, Ordering::SeqCst);
            });
        });
        txn.commit().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_hooks_discarded_on_abort() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut txn = Transaction::new(meta());
        let c1 = Arc::clone(&counter);
        txn.add_before_commit_hook(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        txn.abort().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_synchronizer_sees_commit_and_abort() {
        struct Recorder(Mutex<Vec<&'static str>>);
        impl Synchronizer for Recorder {
            fn before_completion(&self, _txn: &TransactionMeta) {
                self.0.lock().push("before");
            }
            fn after_completion(&self, _txn: &TransactionMeta, committed: bool) {
                self.0.lock().push(if committed { "after-commit" } else { "after-abort" });
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut txn = Transaction::new(meta());
        txn.add_synchronizer(recorder.clone());
        txn.commit().unwrap();
        assert_eq!(*recorder.0.lock(), vec!["before", "after-commit"]);

        let mut txn2 = Transaction::new(meta());
        txn2.add_synchronizer(recorder.clone());
        txn2.abort().unwrap();
        assert_eq!(recorder.0.lock().as_slice(), ["before", "after-commit", "before", "after-abort"]);
    }

    #[test]
    fn test_savepoint_invalidated_by_commit() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut txn = Transaction::new(meta());
        txn.join(Arc::new(Mutex::new(TraceManager::new("alpha", trace)))).unwrap();
        let sp = txn.savepoint().unwrap();
        assert!(sp.is_valid());
        txn.commit().unwrap();
        assert!(!sp.is_valid());
    }

    #[test]
    fn test_earlier_rollback_invalidates_later_savepoint() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut txn = Transaction::new(meta());
        txn.join(Arc::new(Mutex::new(TraceManager::new("alpha", trace)))).unwrap();
        let mut sp1 = txn.savepoint().unwrap();
        let mut sp2 = txn.savepoint().unwrap();
        sp1.rollback().unwrap();
        assert!(!sp2.is_valid());
        assert!(sp2.rollback().is_err());
        // sp1 itself can be rolled back again.
        assert!(sp1.rollback().is_ok());
    }

    #[test]
    fn test_non_savepoint_manager_invalidates_live_savepoints() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut txn = Transaction::new(meta());
        txn.join(Arc::new(Mutex::new(TraceManager::new("alpha", Arc::clone(&trace))))).unwrap();
        let sp = txn.savepoint().unwrap();

        let mut plain = TraceManager::new("gamma", trace);
        plain.savepoints = false;
        txn.join(Arc::new(Mutex::new(plain))).unwrap();
        assert!(!sp.is_valid());

        // And new savepoints are refused outright.
        assert!(matches!(txn.savepoint(), Err(OrbError::Unsupported(_))));
    }
}
