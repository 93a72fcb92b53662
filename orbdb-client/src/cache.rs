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

//! Two-File Rolling Client Cache
//!
//! Persistent blob cache for the client stub. Writes append to the current
//! file until it exceeds half the configured budget, then the cache flips:
//! the other file is truncated and becomes current. Old-but-hot entries
//! survive at most one flip; the scheme needs no compaction and bounds disk
//! use at `limit` plus one record.
//!
//! ## Record Format
//!
//! ```text
//! ┌────────┬────────┬───────────┬──────────┬────────┬──────┬───────────┐
//! │ OID(8) │ Status │ TotalLen  │ BlobLen  │ TID(8) │ Blob │ TotalLen  │
//! │        │ (1)    │ (4)       │ (4)      │        │ (*)  │ (4)       │
//! └────────┴────────┴───────────┴──────────┴────────┴──────┴───────────┘
//! ```
//!
//! Each file starts with a 4-byte magic. All fields big-endian. The
//! duplicated total length allows backward traversal and stops a scan at
//! the first torn record; an unknown status byte skips the record, keeping
//! the format forward-compatible.
//!
//! ## Windows
//!
//! An entry is *current* when its end TID is unset; a stale (`n`) entry
//! still answers `load_before` for any snapshot inside `[start, end)`.
//! End TIDs are session state: after reopening the files, a stale entry's
//! window is bounded by the next newer cached revision, and re-verified
//! against the server before the cache is trusted again.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use orbdb_core::record::RecordStatus;
use orbdb_core::{Oid, Tid};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

const CACHE_MAGIC: [u8; 4] = *b"OCF1";
const HEADER: u64 = 4;
/// oid + status + total_len + blob_len + tid.
const RECORD_FIXED: usize = 8 + 1 + 4 + 4 + 8;
const TRAILER: usize = 4;

/// Offset of the status byte within a record.
const STATUS_OFFSET: u64 = 8;

#[derive(Debug, Clone)]
struct Entry {
    file: usize,
    offset: u64,
    start: Tid,
    /// Exclusive end of the validity window; `None` while current.
    end: Option<Tid>,
    status: RecordStatus,
    blob_len: u32,
}

struct CacheFile {
    file: File,
    path: PathBuf,
    len: u64,
}

impl CacheFile {
    fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER {
            file.set_len(0)?;
            file.write_all(&CACHE_MAGIC)?;
            file.sync_all()?;
            return Ok(CacheFile { file, path: path.to_path_buf(), len: HEADER });
        }
        let mut magic = [0u8; 4];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut magic)?;
        if magic != CACHE_MAGIC {
            return Err(ClientError::Cache(format!(
                "bad cache magic in {}",
                path.display()
            )));
        }
        Ok(CacheFile { file, path: path.to_path_buf(), len })
    }

    fn reset(&mut self) -> Result<()> {
        self.file.set_len(HEADER)?;
        self.len = HEADER;
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.len;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(offset)
    }

    fn patch_status(&mut self, offset: u64, status: RecordStatus) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset + STATUS_OFFSET))?;
        self.file.write_all(&[status as u8])?;
        Ok(())
    }

    fn read_blob(&mut self, offset: u64, blob_len: u32) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset + RECORD_FIXED as u64))?;
        let mut blob = vec![0u8; blob_len as usize];
        self.file.read_exact(&mut blob)?;
        Ok(blob)
    }
}

/// The client's persistent blob cache.
pub struct ClientCache {
    files: [CacheFile; 2],
    current: usize,
    limit: u64,
    /// Per-object entries, sorted by start TID ascending.
    index: HashMap<Oid, Vec<Entry>>,
}

impl ClientCache {
    /// Open (creating as needed) the cache pair `<prefix>.0` / `<prefix>.1`
    /// with a total byte budget of `limit`.
    pub fn open(prefix: &Path, limit: u64) -> Result<Self> {
        let path0 = with_suffix(prefix, ".0");
        let path1 = with_suffix(prefix, ".1");
        let mut files = [CacheFile::open(&path0)?, CacheFile::open(&path1)?];

        let mut index: HashMap<Oid, Vec<Entry>> = HashMap::new();
        let mut newest = [Tid::ZERO; 2];
        for (i, file) in files.iter_mut().enumerate() {
            newest[i] = scan_file(file, i, &mut index)?;
        }
        // The file holding the newest data keeps receiving writes.
        let current = if newest[1] > newest[0] { 1 } else { 0 };

        for entries in index.values_mut() {
            entries.sort_by_key(|e| e.start);
            // Reopened stale entries lost their exact windows; bound each by
            // the next newer revision we hold.
            for i in 0..entries.len() {
                if entries[i].status == RecordStatus::Invalidated && entries[i].end.is_none() {
                    entries[i].end = entries.get(i + 1).map(|next| next.start);
                }
            }
        }

        debug!(
            objects = index.len(),
            current, limit, "client cache opened"
        );
        Ok(ClientCache { files, current, limit, index })
    }

    /// Number of objects with at least one cached entry.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The current revision of `oid`, if cached.
    pub fn load(&mut self, oid: Oid) -> Option<(Vec<u8>, Tid)> {
        let entry = self
            .index
            .get(&oid)?
            .iter()
            .find(|e| e.status == RecordStatus::Valid && e.end.is_none())?
            .clone();
        let blob = self.files[entry.file].read_blob(entry.offset, entry.blob_len).ok()?;
        Some((blob, entry.start))
    }

    /// A revision satisfying `start < tid ≤ end`, if cached. Stale entries
    /// answer historical snapshots.
    pub fn load_before(&mut self, oid: Oid, tid: Tid) -> Option<(Vec<u8>, Tid, Option<Tid>)> {
        let entry = self
            .index
            .get(&oid)?
            .iter()
            .find(|e| {
                e.status != RecordStatus::Deleted
                    && e.start < tid
                    && e.end.map(|end| tid <= end).unwrap_or(true)
            })?
            .clone();
        let blob = self.files[entry.file].read_blob(entry.offset, entry.blob_len).ok()?;
        Some((blob, entry.start, entry.end))
    }

    /// Insert a revision. `end == None` marks it current; a bounded window
    /// caches a historical revision for `load_before`.
    pub fn store(&mut self, oid: Oid, start: Tid, end: Option<Tid>, blob: &[u8]) -> Result<()> {
        let status = if end.is_none() { RecordStatus::Valid } else { RecordStatus::Invalidated };

        if end.is_none() {
            // A load reply can race an invalidation that already told us
            // this revision is not current; our own entries carry the
            // proof. Never let a superseded revision back in as current.
            if let Some(entries) = self.index.get(&oid) {
                let superseded = entries
                    .iter()
                    .any(|e| e.start >= start || e.end.map_or(false, |t| t > start));
                if superseded {
                    return Ok(());
                }
            }
            // A new current revision supersedes whatever we believed
            // current.
            self.close_current(oid, start)?;
        }

        let record = encode_record(oid, status, start, blob);
        if self.files[self.current].len + record.len() as u64 > self.limit / 2 {
            self.flip()?;
        }
        let offset = self.files[self.current].append(&record)?;
        let entries = self.index.entry(oid).or_default();
        entries.push(Entry {
            file: self.current,
            offset,
            start,
            end,
            status,
            blob_len: blob.len() as u32,
        });
        entries.sort_by_key(|e| e.start);
        Ok(())
    }

    /// Apply a committed invalidation: any entry for `oid` whose start TID
    /// is at or below `tid` stops being current.
    pub fn invalidate(&mut self, oid: Oid, tid: Tid) -> Result<()> {
        let Some(entries) = self.index.get_mut(&oid) else { return Ok(()) };
        let mut patches = Vec::new();
        for entry in entries.iter_mut() {
            if entry.end.is_none() && entry.start <= tid {
                entry.end = Some(tid);
                entry.status = RecordStatus::Invalidated;
                patches.push((entry.file, entry.offset));
            }
        }
        for (file, offset) in patches {
            self.files[file].patch_status(offset, RecordStatus::Invalidated)?;
        }
        Ok(())
    }

    /// Drop `oid` entirely (verification said our copy is junk, or the
    /// object was deleted).
    pub fn remove(&mut self, oid: Oid) -> Result<()> {
        let Some(entries) = self.index.remove(&oid) else { return Ok(()) };
        for entry in entries {
            self.files[entry.file].patch_status(entry.offset, RecordStatus::Deleted)?;
        }
        Ok(())
    }

    /// `(oid, tid)` of every entry we believe current, for reconnect
    /// verification.
    pub fn current_contents(&self) -> Vec<(Oid, Tid)> {
        let mut out = Vec::new();
        for (oid, entries) in &self.index {
            for entry in entries {
                if entry.status == RecordStatus::Valid && entry.end.is_none() {
                    out.push((*oid, entry.start));
                }
            }
        }
        out
    }

    /// Mark the current entry (if any) as superseded at `tid` without
    /// writing a replacement.
    fn close_current(&mut self, oid: Oid, tid: Tid) -> Result<()> {
        self.invalidate(oid, tid)
    }

    /// Switch to the other file, truncating it first.
    fn flip(&mut self) -> Result<()> {
        let next = 1 - self.current;
        warn!(from = self.current, to = next, "client cache flipping files");
        self.files[next].reset()?;
        for entries in self.index.values_mut() {
            entries.retain(|e| e.file != next);
        }
        self.index.retain(|_, entries| !entries.is_empty());
        self.current = next;
        Ok(())
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    prefix.with_file_name(name)
}

fn encode_record(oid: Oid, status: RecordStatus, tid: Tid, blob: &[u8]) -> Vec<u8> {
    let total = RECORD_FIXED + blob.len() + TRAILER;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(oid.as_bytes());
    buf.push(status as u8);
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&(blob.len() as u32).to_be_bytes());
    buf.extend_from_slice(tid.as_bytes());
    buf.extend_from_slice(blob);
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf
}

/// Scan one cache file, folding usable records into `index`. Returns the
/// newest TID seen. Stops at the first structurally torn record, truncating
/// the file back to the last good one.
fn scan_file(file: &mut CacheFile, file_no: usize, index: &mut HashMap<Oid, Vec<Entry>>) -> Result<Tid> {
    let mut pos = HEADER;
    let mut newest = Tid::ZERO;
    let end = file.len;
    let mut fixed = [0u8; RECORD_FIXED];

    while pos + (RECORD_FIXED + TRAILER) as u64 <= end {
        file.file.seek(SeekFrom::Start(pos))?;
        file.file.read_exact(&mut fixed)?;
        let total = BigEndian::read_u32(&fixed[9..13]) as u64;
        let blob_len = BigEndian::read_u32(&fixed[13..17]);
        if total < (RECORD_FIXED + TRAILER) as u64
            || total != (RECORD_FIXED + TRAILER) as u64 + u64::from(blob_len)
            || pos + total > end
        {
            break;
        }
        // Trailer must repeat the total length.
        file.file.seek(SeekFrom::Start(pos + total - TRAILER as u64))?;
        let mut trailer = [0u8; TRAILER];
        file.file.read_exact(&mut trailer)?;
        if u64::from(BigEndian::read_u32(&trailer)) != total {
            break;
        }

        let mut oid = [0u8; 8];
        oid.copy_from_slice(&fixed[0..8]);
        let mut tid = [0u8; 8];
        tid.copy_from_slice(&fixed[17..25]);
        let tid = Tid(tid);
        newest = newest.max(tid);

        match RecordStatus::try_from(fixed[8]) {
            Ok(RecordStatus::Deleted) | Err(_) => {
                // Dropped entries and unknown status bytes are skipped; the
                // record frame still carries us to the next one.
            }
            Ok(status) => {
                index.entry(Oid(oid)).or_default().push(Entry {
                    file: file_no,
                    offset: pos,
                    start: tid,
                    end: None,
                    status,
                    blob_len,
                });
            }
        }
        pos += total;
    }

    if pos < end {
        warn!(path = %file.path.display(), at = pos, "cache file tail damaged, truncating");
        file.file.set_len(pos)?;
        file.len = pos;
    }
    Ok(newest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tid(n: u64) -> Tid {
        Tid((n << 32).to_be_bytes())
    }

    fn open_cache(dir: &TempDir, limit: u64) -> ClientCache {
        ClientCache::open(&dir.path().join("cache"), limit).unwrap()
    }

    #[test]
    fn test_store_load_current() {
        let dir = TempDir::new().unwrap();
        let mut cache = open_cache(&dir, 1 << 20);
        let oid = Oid::from_u64(1);
        cache.store(oid, tid(5), None, b"hello").unwrap();
        assert_eq!(cache.load(oid), Some((b"hello".to_vec(), tid(5))));
        assert_eq!(cache.load(Oid::from_u64(2)), None);
    }

    #[test]
    fn test_invalidate_keeps_load_before_window() {
        let dir = TempDir::new().unwrap();
        let mut cache = open_cache(&dir, 1 << 20);
        let oid = Oid::from_u64(1);
        cache.store(oid, tid(5), None, b"v1").unwrap();
        cache.invalidate(oid, tid(9)).unwrap();

        // No longer current...
        assert_eq!(cache.load(oid), None);
        // ...but historical snapshots inside [5, 9) still hit.
        assert_eq!(cache.load_before(oid, tid(7)), Some((b"v1".to_vec(), tid(5), Some(tid(9)))));
        // Outside the window: miss.
        assert_eq!(cache.load_before(oid, tid(5)), None);
        assert_eq!(cache.load_before(oid, tid(10)), None);
    }

    #[test]
    fn test_new_current_supersedes_old() {
        let dir = TempDir::new().unwrap();
        let mut cache = open_cache(&dir, 1 << 20);
        let oid = Oid::from_u64(1);
        cache.store(oid, tid(5), None, b"v1").unwrap();
        cache.store(oid, tid(9), None, b"v2").unwrap();

        assert_eq!(cache.load(oid), Some((b"v2".to_vec(), tid(9))));
        // The old revision remains for snapshot reads below 9.
        assert_eq!(cache.load_before(oid, tid(9)), Some((b"v1".to_vec(), tid(5), Some(tid(9)))));
    }

    #[test]
    fn test_superseded_revision_not_resurrected() {
        let dir = TempDir::new().unwrap();
        let mut cache = open_cache(&dir, 1 << 20);
        let oid = Oid::from_u64(1);
        cache.store(oid, tid(5), None, b"v1").unwrap();
        cache.invalidate(oid, tid(9)).unwrap();

        // A late load reply tries to reinstall v1 as current: refused.
        cache.store(oid, tid(5), None, b"v1").unwrap();
        assert_eq!(cache.load(oid), None);

        // The genuinely newer revision is accepted.
        cache.store(oid, tid(9), None, b"v2").unwrap();
        assert_eq!(cache.load(oid), Some((b"v2".to_vec(), tid(9))));
    }

    #[test]
    fn test_remove_drops_object() {
        let dir = TempDir::new().unwrap();
        let mut cache = open_cache(&dir, 1 << 20);
        let oid = Oid::from_u64(1);
        cache.store(oid, tid(5), None, b"v1").unwrap();
        cache.remove(oid).unwrap();
        assert_eq!(cache.load(oid), None);
        assert_eq!(cache.load_before(oid, tid(6)), None);
    }

    #[test]
    fn test_flip_bounds_disk_use() {
        let dir = TempDir::new().unwrap();
        // Budget small enough that a handful of records forces flips.
        let mut cache = open_cache(&dir, 1024);
        for i in 0..50u64 {
            cache.store(Oid::from_u64(i), tid(i + 1), None, &[0u8; 64]).unwrap();
        }
        let len0 = std::fs::metadata(dir.path().join("cache.0")).unwrap().len();
        let len1 = std::fs::metadata(dir.path().join("cache.1")).unwrap().len();
        assert!(len0 <= 1024, "file 0 holds {len0} bytes");
        assert!(len1 <= 1024, "file 1 holds {len1} bytes");
        // Recent entries survive the flips.
        assert!(cache.load(Oid::from_u64(49)).is_some());
    }

    #[test]
    fn test_reopen_recovers_current_entries() {
        let dir = TempDir::new().unwrap();
        let oid = Oid::from_u64(1);
        {
            let mut cache = open_cache(&dir, 1 << 20);
            cache.store(oid, tid(5), None, b"persisted").unwrap();
        }
        let mut cache = open_cache(&dir, 1 << 20);
        assert_eq!(cache.load(oid), Some((b"persisted".to_vec(), tid(5))));
        assert_eq!(cache.current_contents(), vec![(oid, tid(5))]);
    }

    #[test]
    fn test_reopen_bounds_stale_windows() {
        let dir = TempDir::new().unwrap();
        let oid = Oid::from_u64(1);
        {
            let mut cache = open_cache(&dir, 1 << 20);
            cache.store(oid, tid(5), None, b"v1").unwrap();
            cache.store(oid, tid(9), None, b"v2").unwrap();
        }
        let mut cache = open_cache(&dir, 1 << 20);
        // The stale v1 window is re-bounded by v2's start.
        assert_eq!(cache.load_before(oid, tid(7)), Some((b"v1".to_vec(), tid(5), Some(tid(9)))));
        assert_eq!(cache.load(oid), Some((b"v2".to_vec(), tid(9))));
    }

    #[test]
    fn test_torn_tail_truncated_on_scan() {
        let dir = TempDir::new().unwrap();
        let oid = Oid::from_u64(1);
        {
            let mut cache = open_cache(&dir, 1 << 20);
            cache.store(oid, tid(5), None, b"good").unwrap();
        }
        // Append garbage to the current file.
        let path = dir.path().join("cache.0");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"partial record junk").unwrap();
        drop(file);

        let mut cache = open_cache(&dir, 1 << 20);
        assert_eq!(cache.load(oid), Some((b"good".to_vec(), tid(5))));
    }

    #[test]
    fn test_unknown_status_skipped() {
        let dir = TempDir::new().unwrap();
        let oid1 = Oid::from_u64(1);
        let oid2 = Oid::from_u64(2);
        let first_offset;
        {
            let mut cache = open_cache(&dir, 1 << 20);
            cache.store(oid1, tid(5), None, b"weird").unwrap();
            first_offset = cache.index[&oid1][0].offset;
            cache.store(oid2, tid(6), None, b"fine").unwrap();
        }
        // Rewrite the first record's status to something from the future.
        let path = dir.path().join("cache.0");
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(first_offset + STATUS_OFFSET)).unwrap();
        file.write_all(b"z").unwrap();
        drop(file);

        let mut cache = open_cache(&dir, 1 << 20);
        assert_eq!(cache.load(oid1), None);
        assert_eq!(cache.load(oid2), Some((b"fine".to_vec(), tid(6))));
    }
}
