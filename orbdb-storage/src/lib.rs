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

//! OrbDB Storage Engine
//!
//! Append-only object storage with MVCC snapshot reads, two-phase commit,
//! logical undo, copy-live packing, and crash recovery.
//!
//! ```rust,ignore
//! use orbdb_storage::{ObjectStore, StoreOptions};
//! use orbdb_core::{Tid, TransactionMeta};
//!
//! let store = ObjectStore::open("data.orb".as_ref(), StoreOptions::default())?;
//! let oid = store.new_oid()?;
//! let txn = store.tpc_begin(TransactionMeta::default())?;
//! store.store(txn, oid, Tid::ZERO, b"state".to_vec())?;
//! store.tpc_vote(txn, None)?;
//! let tid = store.tpc_finish(txn, |_| {})?;
//! assert_eq!(store.load(oid)?, (b"state".to_vec(), tid));
//! ```

pub mod commit_lock;
pub mod flock;
pub mod index;
pub mod log;
pub mod pack;
pub mod recovery;
pub mod store;
pub mod undo;

pub use commit_lock::ReentrantLock;
pub use flock::StoreLock;
pub use index::OidIndex;
pub use log::{LogFile, LogReader, TxnBuilder};
pub use recovery::{recover, scan, RecoveryReport};
pub use store::{ObjectStore, StoreOptions, TxnHandle};
