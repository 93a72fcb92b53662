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

//! Storage Lock Manager
//!
//! Two locks guard a storage:
//!
//! - the **commit lock**, held from a successful `tpc_vote` to the end of
//!   `tpc_finish`/`tpc_abort`. Because the vote and the finish arrive as
//!   separate calls, the lock cannot be a scoped RAII guard; acquisition and
//!   release are explicit and owner-checked.
//! - the **storage lock**, a short lock around administrative mutations
//!   (pack's swap phase, close). It is always taken before the commit lock.
//!
//! Both are reentrant for the owning thread only, and contending threads are
//! granted the lock in strict FIFO order of their acquisition attempts.

use std::collections::VecDeque;
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use orbdb_core::{OrbError, Result};

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
    queue: VecDeque<u64>,
    next_waiter: u64,
}

/// A FIFO, owner-reentrant lock with explicit acquire/release.
pub struct ReentrantLock {
    name: &'static str,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl ReentrantLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    /// Acquire the lock, waiting at most until `deadline` when given.
    ///
    /// Reentrant: a thread that already owns the lock nests another level
    /// immediately. Waiters are served first-come first-served.
    pub fn acquire(&self, deadline: Option<Instant>) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner == Some(me) {
            state.depth += 1;
            return Ok(());
        }

        let ticket = state.next_waiter;
        state.next_waiter += 1;
        state.queue.push_back(ticket);

        loop {
            if state.owner.is_none() && state.queue.front() == Some(&ticket) {
                state.queue.pop_front();
                state.owner = Some(me);
                state.depth = 1;
                // The new head of the queue may already be runnable.
                self.cond.notify_all();
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        state.queue.retain(|t| *t != ticket);
                        self.cond.notify_all();
                        return Err(OrbError::TransactionState {
                            detail: format!("timed out waiting for {} lock", self.name),
                        });
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Release one level of ownership. Fails if the calling thread does not
    /// own the lock.
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return Err(OrbError::TransactionState {
                detail: format!("{} lock released by non-owner thread", self.name),
            });
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Whether the calling thread currently owns the lock.
    pub fn held_by_me(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Run `f` with the lock held, releasing on the way out.
    pub fn with<T>(&self, f: impl FnOnce() -> T) -> T {
        self.acquire(None).expect("untimed acquire cannot fail");
        let out = f();
        let _ = self.release();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reentrant_same_thread() {
        let lock = ReentrantLock::new("test");
        lock.acquire(None).unwrap();
        lock.acquire(None).unwrap();
        assert!(lock.held_by_me());
        lock.release().unwrap();
        assert!(lock.held_by_me());
        lock.release().unwrap();
        assert!(!lock.held_by_me());
    }

    #[test]
    fn test_release_by_non_owner_fails() {
        let lock = Arc::new(ReentrantLock::new("test"));
        lock.acquire(None).unwrap();
        let lock2 = Arc::clone(&lock);
        let handle = thread::spawn(move || lock2.release());
        assert!(handle.join().unwrap().is_err());
        lock.release().unwrap();
    }

    #[test]
    fn test_acquire_deadline_times_out() {
        let lock = Arc::new(ReentrantLock::new("test"));
        lock.acquire(None).unwrap();
        let lock2 = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            lock2.acquire(Some(Instant::now() + Duration::from_millis(50)))
        });
        assert!(handle.join().unwrap().is_err());
        lock.release().unwrap();
    }

    #[test]
    fn test_fifo_ordering() {
        let lock = Arc::new(ReentrantLock::new("test"));
        let order = Arc::new(Mutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));

        lock.acquire(None).unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            let started_thread = Arc::clone(&started);
            handles.push(thread::spawn(move || {
                started_thread.fetch_add(1, Ordering::SeqCst);
                lock.acquire(None).unwrap();
                order.lock().push(i);
                lock.release().unwrap();
            }));
            // Let each waiter enqueue before spawning the next so arrival
            // order is deterministic.
            while started.load(Ordering::SeqCst) <= i {
                thread::yield_now();
            }
            thread::sleep(Duration::from_millis(20));
        }

        lock.release().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
