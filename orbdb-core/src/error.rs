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

//! Error types for OrbDB

use std::io;

use thiserror::Error;

use crate::oid::{Oid, Tid};

#[derive(Error, Debug)]
pub enum OrbError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("no such object: {oid}")]
    KeyNotFound { oid: Oid },

    #[error("no revision of {oid} at serial {tid}")]
    RevisionNotFound { oid: Oid, tid: Tid },

    #[error("write conflict on {oid}: expected serial {expected}, committed head is {actual}")]
    Conflict { oid: Oid, expected: Tid, actual: Tid },

    #[error("read conflict on {oid}")]
    ReadConflict { oid: Oid },

    #[error("transaction state error: {detail}")]
    TransactionState { detail: String },

    #[error("corrupted record at offset {offset}: {detail}")]
    Corrupt { offset: u64, detail: String },

    #[error("storage is read-only")]
    ReadOnly,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("cannot undo transaction {tid}: {reason}")]
    Undo { tid: Tid, reason: String },

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl OrbError {
    /// Short stable tag for log fields and wire transport.
    pub fn kind(&self) -> &'static str {
        match self {
            OrbError::Io(_) => "io",
            OrbError::KeyNotFound { .. } => "key_not_found",
            OrbError::RevisionNotFound { .. } => "revision_not_found",
            OrbError::Conflict { .. } => "conflict",
            OrbError::ReadConflict { .. } => "read_conflict",
            OrbError::TransactionState { .. } => "transaction_state",
            OrbError::Corrupt { .. } => "corrupt",
            OrbError::ReadOnly => "read_only",
            OrbError::Unsupported(_) => "unsupported",
            OrbError::Undo { .. } => "undo",
            OrbError::Disconnected(_) => "disconnected",
            OrbError::Protocol(_) => "protocol",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrbError>;
