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

//! Codec Collaborator Traits
//!
//! The storage never interprets blobs. Two narrow callbacks are the only
//! places where blob contents matter, and both are supplied by the external
//! object codec:
//!
//! - [`ConflictResolver`]: given the three revisions involved in a
//!   write-write conflict, may produce a merged blob.
//! - [`ReferencesExtractor`]: given a blob, yields the OIDs it references.
//!   Pack uses this to compute reachability from the root object.

use crate::oid::Oid;

/// Merges concurrent writes against the same object, when the codec knows how.
pub trait ConflictResolver: Send + Sync {
    /// Attempt a three-way merge.
    ///
    /// `old` is the revision the writer based its change on (the blob at the
    /// expected serial), `saved` is the committed head the writer lost to,
    /// and `new` is the blob the writer is trying to store. Returns the
    /// merged blob, or `None` to decline.
    fn resolve(&self, oid: Oid, old: &[u8], saved: &[u8], new: &[u8]) -> Option<Vec<u8>>;
}

/// A resolver that declines every merge. Conflicts always surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMerge;

impl ConflictResolver for NoMerge {
    fn resolve(&self, _oid: Oid, _old: &[u8], _saved: &[u8], _new: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Extracts outbound object references from a blob.
pub trait ReferencesExtractor: Send + Sync {
    fn references(&self, blob: &[u8]) -> Vec<Oid>;
}

/// Treats every blob as a leaf. Packing with this keeps only the root.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReferences;

impl ReferencesExtractor for NoReferences {
    fn references(&self, _blob: &[u8]) -> Vec<Oid> {
        Vec::new()
    }
}

/// References encoded as a flat big-endian OID array; handy for tests and
/// for codecs that maintain a reference table outside the payload proper.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawOidArray;

impl ReferencesExtractor for RawOidArray {
    fn references(&self, blob: &[u8]) -> Vec<Oid> {
        blob.chunks_exact(8)
            .map(|chunk| {
                let mut oid = [0u8; 8];
                oid.copy_from_slice(chunk);
                Oid(oid)
            })
            .collect()
    }
}
