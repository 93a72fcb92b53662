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

//! OID → Offset Index
//!
//! Ordered in-memory map from OID to the file offset of that object's newest
//! valid data record, persisted to a checksummed sidecar file. The sidecar
//! records the safe offset it was consistent with; on open, the log tail
//! beyond that position is rescanned to absorb transactions the sidecar
//! missed. Losing the sidecar entirely costs a full log scan, never data.
//!
//! ## Sidecar Format
//!
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────┬───────┬───────────────────┬─────────┐
//! │ OIDX (4) │ SafeOff(8) │ LastTid  │ PackTid  │ Count │ (OID, Offset) × N │ CRC32   │
//! │          │            │ (8)      │ (8)      │ (8)   │ (16 each)         │ (4)     │
//! └──────────┴────────────┴──────────┴──────────┴───────┴───────────────────┴─────────┘
//! ```
//!
//! All fields big-endian; the CRC covers everything after the magic. The
//! file is replaced atomically (write temp, fsync, rename).

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use orbdb_core::{Oid, OrbError, Result, Tid};

const INDEX_MAGIC: [u8; 4] = *b"OIDX";
const FIXED_FIELDS: usize = 8 + 8 + 8 + 8;
const ENTRY_SIZE: usize = 16;

/// The OID index plus the log position it is consistent with.
#[derive(Debug, Clone, Default)]
pub struct OidIndex {
    map: BTreeMap<Oid, u64>,
    /// Highest log offset whose transactions are reflected in `map`.
    pub safe_offset: u64,
    /// TID of the newest transaction reflected in `map`.
    pub last_tid: Tid,
    /// Horizon of the most recent completed pack (zero if never packed).
    pub pack_tid: Tid,
}

impl OidIndex {
    pub fn new(safe_offset: u64) -> Self {
        OidIndex { safe_offset, ..Default::default() }
    }

    pub fn get(&self, oid: Oid) -> Option<u64> {
        self.map.get(&oid).copied()
    }

    pub fn insert(&mut self, oid: Oid, offset: u64) {
        self.map.insert(oid, offset);
    }

    pub fn remove(&mut self, oid: Oid) {
        self.map.remove(&oid);
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Oid, u64)> + '_ {
        self.map.iter().map(|(oid, offset)| (*oid, *offset))
    }

    /// Greatest allocated OID, as a counter value.
    pub fn max_oid(&self) -> u64 {
        self.map.keys().next_back().map(|oid| oid.as_u64()).unwrap_or(0)
    }

    /// Persist atomically next to the log.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut payload = Vec::with_capacity(FIXED_FIELDS + self.map.len() * ENTRY_SIZE);
        payload.extend_from_slice(&self.safe_offset.to_be_bytes());
        payload.extend_from_slice(self.last_tid.as_bytes());
        payload.extend_from_slice(self.pack_tid.as_bytes());
        payload.extend_from_slice(&(self.map.len() as u64).to_be_bytes());
        for (oid, offset) in &self.map {
            payload.extend_from_slice(oid.as_bytes());
            payload.extend_from_slice(&offset.to_be_bytes());
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let tmp = path.with_extension("index.tmp");
        {
            let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
            file.write_all(&INDEX_MAGIC)?;
            file.write_all(&payload)?;
            file.write_all(&crc.to_be_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a sidecar. A missing file yields an empty index positioned at
    /// `fallback_offset`; a damaged one is an error so the caller can decide
    /// to rebuild.
    pub fn load(path: &Path, fallback_offset: u64) -> Result<Self> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(OidIndex::new(fallback_offset));
            }
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() < 4 + FIXED_FIELDS + 4 || bytes[..4] != INDEX_MAGIC {
            return Err(OrbError::Corrupt { offset: 0, detail: "bad index sidecar header".into() });
        }
        let payload = &bytes[4..bytes.len() - 4];
        let stored_crc = BigEndian::read_u32(&bytes[bytes.len() - 4..]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(OrbError::Corrupt {
                offset: 0,
                detail: "index sidecar checksum mismatch".into(),
            });
        }

        let safe_offset = BigEndian::read_u64(&payload[0..8]);
        let mut last_tid = [0u8; 8];
        last_tid.copy_from_slice(&payload[8..16]);
        let mut pack_tid = [0u8; 8];
        pack_tid.copy_from_slice(&payload[16..24]);
        let count = BigEndian::read_u64(&payload[24..32]) as usize;
        let entries = &payload[FIXED_FIELDS..];
        if entries.len() != count * ENTRY_SIZE {
            return Err(OrbError::Corrupt {
                offset: 0,
                detail: format!("index sidecar declares {count} entries but holds {}", entries.len() / ENTRY_SIZE),
            });
        }

        let mut map = BTreeMap::new();
        for chunk in entries.chunks_exact(ENTRY_SIZE) {
            let mut oid = [0u8; 8];
            oid.copy_from_slice(&chunk[..8]);
            map.insert(Oid(oid), BigEndian::read_u64(&chunk[8..]));
        }
        Ok(OidIndex {
            map,
            safe_offset,
            last_tid: Tid(last_tid),
            pack_tid: Tid(pack_tid),
        })
    }
}

/// Default sidecar path for a log file.
pub fn index_path(log_path: &Path) -> std::path::PathBuf {
    let mut name = log_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".index");
    log_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb.index");

        let mut index = OidIndex::new(4);
        index.insert(Oid::from_u64(1), 100);
        index.insert(Oid::from_u64(7), 900);
        index.safe_offset = 1024;
        index.last_tid = Tid::from_parts(2026, 8, 7, 3, 0, 0.0);
        index.save(&path).unwrap();

        let loaded = OidIndex::load(&path, 4).unwrap();
        assert_eq!(loaded.get(Oid::from_u64(1)), Some(100));
        assert_eq!(loaded.get(Oid::from_u64(7)), Some(900));
        assert_eq!(loaded.safe_offset, 1024);
        assert_eq!(loaded.last_tid, index.last_tid);
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_missing_sidecar_yields_empty() {
        let dir = TempDir::new().unwrap();
        let index = OidIndex::load(&dir.path().join("absent"), 4).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.safe_offset, 4);
    }

    #[test]
    fn test_corrupt_sidecar_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.orb.index");

        let mut index = OidIndex::new(4);
        index.insert(Oid::from_u64(1), 100);
        index.save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(OidIndex::load(&path, 4), Err(OrbError::Corrupt { .. })));
    }

    #[test]
    fn test_max_oid() {
        let mut index = OidIndex::new(4);
        assert_eq!(index.max_oid(), 0);
        index.insert(Oid::from_u64(3), 10);
        index.insert(Oid::from_u64(12), 20);
        assert_eq!(index.max_oid(), 12);
    }
}
