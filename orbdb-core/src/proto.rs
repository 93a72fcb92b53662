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

//! Wire Protocol
//!
//! Shared by the server and the client stub. All messages travel in frames:
//!
//! ```text
//! ┌──────────────┬───────────────────┬──────────────┐
//! │ Length (4,BE)│ MAC (20, optional)│ Payload (N)  │
//! └──────────────┴───────────────────┴──────────────┘
//! ```
//!
//! The high bit of the length word signals that a 20-byte HMAC-SHA1 over the
//! payload precedes it; the remaining 31 bits give the payload length. The
//! MAC key is derived at handshake time from a shared secret and both sides'
//! nonces, so unauthenticated deployments simply never set the bit.
//!
//! ## Handshake
//!
//! Each side sends 12 bytes — its 4-byte protocol tag plus an 8-byte nonce —
//! and the lexicographically lower of the two tags governs the session.
//!
//! ## Messages
//!
//! Payloads are bincode-encoded [`Request`] / [`ServerMessage`] values.
//! A request carries `(message_id, is_async, call)`; synchronous calls get a
//! [`Response`] echoing the id, asynchronous ones get nothing and their
//! failures are logged server-side.

use std::io::{Read, Write};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use thiserror::Error;

use crate::error::{OrbError, Result};
use crate::oid::{Oid, Tid};
use crate::record::{HistoryEntry, TransactionMeta, UndoRecord};

/// Protocol tag for this revision of the wire format.
pub const PROTOCOL_V1: [u8; 4] = *b"O309";

/// Handshake blob size: tag + nonce.
pub const HANDSHAKE_SIZE: usize = 12;

/// HMAC-SHA1 output size.
pub const MAC_SIZE: usize = 20;

/// Hard ceiling on a single frame payload.
pub const MAX_FRAME: u32 = 0x4000_0000;

const MAC_FLAG: u32 = 0x8000_0000;

type HmacSha1 = Hmac<Sha1>;

/// Session MAC key derived at handshake time.
#[derive(Clone)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    /// Derive the session key from the shared secret and both nonces.
    /// Client and server pass the nonces in the same (client, server) order.
    pub fn derive(secret: &[u8], client_nonce: &[u8; 8], server_nonce: &[u8; 8]) -> Self {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(client_nonce);
        mac.update(server_nonce);
        SessionKey(mac.finalize().into_bytes().to_vec())
    }

    fn sign(&self, payload: &[u8]) -> [u8; MAC_SIZE] {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(payload);
        let mut out = [0u8; MAC_SIZE];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    fn verify(&self, payload: &[u8], tag: &[u8; MAC_SIZE]) -> bool {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(payload);
        mac.verify_slice(tag).is_ok()
    }
}

/// Write one frame, MAC'd when a session key is present.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8], key: Option<&SessionKey>) -> Result<()> {
    if payload.len() as u64 > u64::from(MAX_FRAME) {
        return Err(OrbError::Protocol(format!("frame of {} bytes exceeds limit", payload.len())));
    }
    let mut len = payload.len() as u32;
    if key.is_some() {
        len |= MAC_FLAG;
    }
    w.write_all(&len.to_be_bytes())?;
    if let Some(key) = key {
        w.write_all(&key.sign(payload))?;
    }
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Read one frame, verifying the MAC when the sender set the flag.
///
/// A set MAC flag with no session key, or a bad MAC, is a protocol error.
pub fn read_frame<R: Read>(r: &mut R, key: Option<&SessionKey>) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let raw = u32::from_be_bytes(len_buf);
    let has_mac = raw & MAC_FLAG != 0;
    let len = raw & !MAC_FLAG;
    if len > MAX_FRAME {
        return Err(OrbError::Protocol(format!("frame length {len} exceeds limit")));
    }
    let mut mac = [0u8; MAC_SIZE];
    if has_mac {
        r.read_exact(&mut mac)?;
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    if has_mac {
        let key = key.ok_or_else(|| OrbError::Protocol("peer sent MAC on unauthenticated session".into()))?;
        if !key.verify(&payload, &mac) {
            return Err(OrbError::Protocol("message authentication failed".into()));
        }
    }
    Ok(payload)
}

/// Exchange handshake blobs over `stream` and return (negotiated tag,
/// peer nonce). The caller sends first; ordering is symmetric because both
/// sides write before blocking on the read.
pub fn handshake<S: Read + Write>(stream: &mut S, nonce: &[u8; 8]) -> Result<([u8; 4], [u8; 8])> {
    let mut ours = [0u8; HANDSHAKE_SIZE];
    ours[..4].copy_from_slice(&PROTOCOL_V1);
    ours[4..].copy_from_slice(nonce);
    stream.write_all(&ours)?;
    stream.flush()?;

    let mut theirs = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut theirs)?;
    let mut tag = [0u8; 4];
    tag.copy_from_slice(&theirs[..4]);
    if !tag.iter().all(|b| b.is_ascii_graphic()) {
        return Err(OrbError::Protocol(format!("bad protocol tag {tag:02x?}")));
    }
    let mut peer_nonce = [0u8; 8];
    peer_nonce.copy_from_slice(&theirs[4..]);
    Ok((tag.min(PROTOCOL_V1), peer_nonce))
}

/// A method invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Call {
    Register { storage: String, read_only: bool },
    GetInfo,
    LastTransaction,
    GetInvalidations { from: Tid },
    Verify { oid: Oid, tid: Tid },
    EndVerify,
    NewOid,
    NewOids { count: u32 },
    Pack { tid: Tid },
    Load { oid: Oid },
    LoadBefore { oid: Oid, tid: Tid },
    LoadSerial { oid: Oid, tid: Tid },
    Storea { oid: Oid, serial: Tid, data: Vec<u8> },
    Vote,
    TpcBegin { meta: TransactionMeta },
    TpcFinish,
    TpcAbort,
    History { oid: Oid, n: u32 },
    UndoLog { first: u64, last: u64 },
    UndoInfo { first: u64, last: u64 },
    Undoa { tid: Tid },
}

impl Call {
    /// Async calls produce no response; their failures are logged on the
    /// server with OID/TID context.
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            Call::Storea { .. } | Call::Undoa { .. } | Call::Verify { .. } | Call::TpcAbort
        )
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            Call::Register { .. } => "register",
            Call::GetInfo => "get_info",
            Call::LastTransaction => "last_transaction",
            Call::GetInvalidations { .. } => "get_invalidations",
            Call::Verify { .. } => "verify",
            Call::EndVerify => "end_verify",
            Call::NewOid => "new_oid",
            Call::NewOids { .. } => "new_oids",
            Call::Pack { .. } => "pack",
            Call::Load { .. } => "load",
            Call::LoadBefore { .. } => "load_before",
            Call::LoadSerial { .. } => "load_serial",
            Call::Storea { .. } => "storea",
            Call::Vote => "vote",
            Call::TpcBegin { .. } => "tpc_begin",
            Call::TpcFinish => "tpc_finish",
            Call::TpcAbort => "tpc_abort",
            Call::History { .. } => "history",
            Call::UndoLog { .. } => "undo_log",
            Call::UndoInfo { .. } => "undo_info",
            Call::Undoa { .. } => "undoa",
        }
    }
}

/// Client → server message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub is_async: bool,
    pub call: Call,
}

/// Aggregate storage facts for `get_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub name: String,
    pub object_count: u64,
    pub size_bytes: u64,
    pub last_tid: Tid,
    pub read_only: bool,
}

/// Successful call results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    None,
    Oid(Oid),
    Oids(Vec<Oid>),
    Tid(Tid),
    /// `load`: current blob and its serial.
    Blob { data: Vec<u8>, tid: Tid },
    /// `load_before`: blob with its validity window, or nothing when the
    /// requested TID precedes the earliest revision.
    BlobBefore(Option<(Vec<u8>, Tid, Option<Tid>)>),
    /// `load_serial`: blob of the exact revision.
    SerialBlob(Vec<u8>),
    Info(StorageInfo),
    History(Vec<HistoryEntry>),
    UndoInfo(Vec<UndoRecord>),
    /// `get_invalidations`: batches in TID order, or `None` when the
    /// requested horizon is no longer covered and the client must verify.
    Invalidations(Option<Vec<(Tid, Vec<Oid>)>>),
}

/// Serializable mirror of the storage error taxonomy.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum WireError {
    #[error("no such object: {oid}")]
    KeyNotFound { oid: Oid },
    #[error("no revision of {oid} at serial {tid}")]
    RevisionNotFound { oid: Oid, tid: Tid },
    #[error("write conflict on {oid}: expected {expected}, head is {actual}")]
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
    #[error("server error: {0}")]
    Server(String),
}

impl From<&OrbError> for WireError {
    fn from(err: &OrbError) -> Self {
        match err {
            OrbError::KeyNotFound { oid } => WireError::KeyNotFound { oid: *oid },
            OrbError::RevisionNotFound { oid, tid } => WireError::RevisionNotFound { oid: *oid, tid: *tid },
            OrbError::Conflict { oid, expected, actual } => WireError::Conflict {
                oid: *oid,
                expected: *expected,
                actual: *actual,
            },
            OrbError::ReadConflict { oid } => WireError::ReadConflict { oid: *oid },
            OrbError::TransactionState { detail } => WireError::TransactionState { detail: detail.clone() },
            OrbError::Corrupt { offset, detail } => WireError::Corrupt {
                offset: *offset,
                detail: detail.clone(),
            },
            OrbError::ReadOnly => WireError::ReadOnly,
            OrbError::Unsupported(s) => WireError::Unsupported(s.clone()),
            OrbError::Undo { tid, reason } => WireError::Undo { tid: *tid, reason: reason.clone() },
            other => WireError::Server(other.to_string()),
        }
    }
}

impl From<WireError> for OrbError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::KeyNotFound { oid } => OrbError::KeyNotFound { oid },
            WireError::RevisionNotFound { oid, tid } => OrbError::RevisionNotFound { oid, tid },
            WireError::Conflict { oid, expected, actual } => OrbError::Conflict { oid, expected, actual },
            WireError::ReadConflict { oid } => OrbError::ReadConflict { oid },
            WireError::TransactionState { detail } => OrbError::TransactionState { detail },
            WireError::Corrupt { offset, detail } => OrbError::Corrupt { offset, detail },
            WireError::ReadOnly => OrbError::ReadOnly,
            WireError::Unsupported(s) => OrbError::Unsupported(s),
            WireError::Undo { tid, reason } => OrbError::Undo { tid, reason },
            WireError::Server(s) => OrbError::Protocol(s),
        }
    }
}

/// Server → client reply to a synchronous call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: std::result::Result<Value, WireError>,
}

/// Any server → client message: a reply or an unsolicited push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Reply(Response),
    /// Committed invalidation fan-out, strictly increasing TID per client.
    Invalidate { tid: Tid, oids: Vec<Oid> },
    /// Verification result: the cached entry for `oid` is stale.
    InvalidateVerify { oid: Oid },
    /// All queued `verify` calls have been answered.
    EndVerify,
}

/// Encode any serde message as a frame payload.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| OrbError::Protocol(format!("encode: {e}")))
}

/// Decode a frame payload.
pub fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| OrbError::Protocol(format!("decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_roundtrip_plain() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello", None).unwrap();
        assert_eq!(&buf[..4], &5u32.to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor, None).unwrap(), b"hello");
    }

    #[test]
    fn test_frame_roundtrip_mac() {
        let key = SessionKey::derive(b"secret", &[1; 8], &[2; 8]);
        let mut buf = Vec::new();
        write_frame(&mut buf, b"payload", Some(&key)).unwrap();
        assert_eq!(buf[0] & 0x80, 0x80);
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor, Some(&key)).unwrap(), b"payload");
    }

    #[test]
    fn test_frame_bad_mac_rejected() {
        let key = SessionKey::derive(b"secret", &[1; 8], &[2; 8]);
        let other = SessionKey::derive(b"other", &[1; 8], &[2; 8]);
        let mut buf = Vec::new();
        write_frame(&mut buf, b"payload", Some(&key)).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_frame(&mut cursor, Some(&other)), Err(OrbError::Protocol(_))));
    }

    #[test]
    fn test_frame_mac_without_key_rejected() {
        let key = SessionKey::derive(b"secret", &[1; 8], &[2; 8]);
        let mut buf = Vec::new();
        write_frame(&mut buf, b"payload", Some(&key)).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor, None).is_err());
    }

    #[test]
    fn test_session_key_symmetric() {
        let a = SessionKey::derive(b"secret", &[7; 8], &[9; 8]);
        let b = SessionKey::derive(b"secret", &[7; 8], &[9; 8]);
        assert!(b.verify(b"x", &a.sign(b"x")));
    }

    #[test]
    fn test_async_classification() {
        assert!(Call::Storea { oid: Oid::ROOT, serial: Tid::ZERO, data: vec![] }.is_async());
        assert!(Call::Undoa { tid: Tid::ZERO }.is_async());
        assert!(Call::Verify { oid: Oid::ROOT, tid: Tid::ZERO }.is_async());
        assert!(Call::TpcAbort.is_async());
        assert!(!Call::Vote.is_async());
        assert!(!Call::Load { oid: Oid::ROOT }.is_async());
    }

    #[test]
    fn test_message_roundtrip() {
        let req = Request {
            id: 42,
            is_async: false,
            call: Call::LoadBefore { oid: Oid::from_u64(5), tid: Tid::from_parts(2026, 8, 7, 0, 0, 0.0) },
        };
        let bytes = encode(&req).unwrap();
        let back: Request = decode(&bytes).unwrap();
        assert_eq!(back.id, 42);
        assert!(matches!(back.call, Call::LoadBefore { .. }));
    }

    #[test]
    fn test_wire_error_from_orb_error() {
        let err = OrbError::Conflict {
            oid: Oid::from_u64(1),
            expected: Tid::ZERO,
            actual: Tid::MAX,
        };
        assert!(matches!(WireError::from(&err), WireError::Conflict { .. }));
    }
}
