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

//! OrbDB Core
//!
//! Shared leaf crate for the OrbDB object store: identifier types, on-disk
//! record codecs, the error taxonomy, codec collaborator traits, the wire
//! protocol, and the per-session transaction coordinator.

pub mod coordinator;
pub mod error;
pub mod oid;
pub mod proto;
pub mod record;
pub mod resolver;

pub use coordinator::{ManagerRef, ResourceManager, Savepoint, Synchronizer, Transaction};
pub use error::{OrbError, Result};
pub use oid::{Oid, Tid};
pub use record::{
    DataHeader, DataRecord, HistoryEntry, RecordPayload, RecordStatus, TransactionMeta, TxnHeader,
    TxnStatus, UndoRecord, DATA_HEADER_SIZE, LOG_MAGIC, TXN_HEADER_SIZE, TXN_TRAILER_SIZE,
};
pub use resolver::{ConflictResolver, NoMerge, NoReferences, ReferencesExtractor};
