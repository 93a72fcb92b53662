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

//! Client Connection
//!
//! Synchronous storage stub over the framed wire protocol. A background
//! reader thread demultiplexes replies to waiting callers and applies
//! server pushes (invalidations, verification results) to the local cache
//! under an internal lock, in the TID order the server guarantees.
//!
//! On disconnect, pending synchronous calls fail fast; reconnecting runs
//! the verification protocol — every cached current `(oid, tid)` is sent to
//! the server, stale entries come back as `invalidate_verify` pushes, and
//! `end_verify` re-establishes coherence before the cache serves hits
//! again.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use orbdb_core::proto::{
    self, Call, Request, Response, ServerMessage, SessionKey, StorageInfo, Value, WireError,
};
use orbdb_core::record::{HistoryEntry, TransactionMeta, UndoRecord};
use orbdb_core::{Oid, Tid};

use crate::cache::ClientCache;
use crate::error::{ClientError, Result};

/// How long a synchronous call waits for its reply.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Application callback for committed invalidations (the live-object layer
/// hangs its `invalidate(oids)` contract here).
pub trait InvalidationHandler: Send + Sync {
    fn invalidate(&self, tid: Tid, oids: &[Oid]);
}

/// Default handler: cache maintenance only.
pub struct NullHandler;

impl InvalidationHandler for NullHandler {
    fn invalidate(&self, _tid: Tid, _oids: &[Oid]) {}
}

/// Connection options.
pub struct ConnectOptions {
    pub storage: String,
    pub read_only: bool,
    pub secret: Option<Vec<u8>>,
    /// `(path prefix, byte budget)` for the persistent cache.
    pub cache: Option<(std::path::PathBuf, u64)>,
    pub handler: Arc<dyn InvalidationHandler>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            storage: "main".to_string(),
            read_only: false,
            secret: None,
            cache: None,
            handler: Arc::new(NullHandler),
        }
    }
}

type ReplyResult = std::result::Result<Value, WireError>;

struct Shared {
    writer: Mutex<Option<TcpStream>>,
    key: Mutex<Option<SessionKey>>,
    pending: Mutex<HashMap<u64, Sender<ReplyResult>>>,
    next_id: AtomicU64,
    cache: Option<Mutex<ClientCache>>,
    /// TID of the last invalidation processed; pushes must arrive in order.
    last_invalidation: Mutex<Tid>,
    /// Cache may only serve hits while verified.
    verified: AtomicBool,
    verify_done: Mutex<bool>,
    verify_cond: Condvar,
    connected: AtomicBool,
    handler: Arc<dyn InvalidationHandler>,
}

impl Shared {
    fn fail_pending(&self, reason: &str) {
        let mut pending = self.pending.lock();
        for (_, sender) in pending.drain() {
            // Dropping the sender wakes the waiter with a recv error, which
            // surfaces as Disconnected.
            drop(sender);
        }
        debug!(reason, "pending calls failed");
    }
}

/// A connection to one storage on an OrbDB server.
pub struct Connection {
    address: String,
    options: ConnectOptions,
    shared: Arc<Shared>,
    /// Blobs stored in the open transaction, applied to the cache on finish.
    staged: Mutex<Vec<(Oid, Vec<u8>)>>,
}

impl Connection {
    /// Connect, handshake, and register against the configured storage.
    pub fn connect(address: &str, options: ConnectOptions) -> Result<Self> {
        let cache = match &options.cache {
            Some((prefix, limit)) => Some(Mutex::new(ClientCache::open(prefix, *limit)?)),
            None => None,
        };
        let shared = Arc::new(Shared {
            writer: Mutex::new(None),
            key: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cache,
            last_invalidation: Mutex::new(Tid::ZERO),
            verified: AtomicBool::new(false),
            verify_done: Mutex::new(false),
            verify_cond: Condvar::new(),
            connected: AtomicBool::new(false),
            handler: Arc::clone(&options.handler),
        });
        let conn = Connection {
            address: address.to_string(),
            options,
            shared,
            staged: Mutex::new(Vec::new()),
        };
        conn.dial()?;
        conn.register_and_verify()?;
        Ok(conn)
    }

    /// Re-establish the transport after a disconnect and re-verify the
    /// cache against the server.
    pub fn reconnect(&self) -> Result<()> {
        self.shared.fail_pending("reconnecting");
        self.dial()?;
        self.register_and_verify()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn dial(&self) -> Result<()> {
        let mut stream = TcpStream::connect(&self.address)?;
        stream.set_nodelay(true)?;

        let nonce: [u8; 8] = rand::random();
        let (tag, server_nonce) = proto::handshake(&mut stream, &nonce)?;
        debug!(tag = %String::from_utf8_lossy(&tag), "client handshake complete");
        let key = self
            .options
            .secret
            .as_deref()
            .map(|secret| SessionKey::derive(secret, &nonce, &server_nonce));

        *self.shared.key.lock() = key.clone();
        *self.shared.writer.lock() = Some(stream.try_clone()?);
        self.shared.connected.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || reader_loop(stream, shared, key));
        Ok(())
    }

    fn register_and_verify(&self) -> Result<()> {
        let value = self.call(Call::Register {
            storage: self.options.storage.clone(),
            read_only: self.options.read_only,
        })?;
        let baseline = match value {
            Value::Tid(tid) => tid,
            other => return Err(unexpected(&other)),
        };
        *self.shared.last_invalidation.lock() = baseline;

        // Verification: confirm every cached current entry, then wait for
        // the server's end-of-verify marker.
        if let Some(cache) = &self.shared.cache {
            let contents = cache.lock().current_contents();
            if !contents.is_empty() {
                *self.shared.verify_done.lock() = false;
                for (oid, tid) in contents {
                    self.send_async(Call::Verify { oid, tid })?;
                }
                self.call(Call::EndVerify)?;
                let mut done = self.shared.verify_done.lock();
                while !*done {
                    if self
                        .shared
                        .verify_cond
                        .wait_for(&mut done, CALL_TIMEOUT)
                        .timed_out()
                    {
                        return Err(ClientError::Timeout);
                    }
                }
            }
        }
        self.shared.verified.store(true, Ordering::Release);
        Ok(())
    }

    // ------------------------------------------------------------------
    // RPC plumbing
    // ------------------------------------------------------------------

    fn call(&self, call: Call) -> Result<Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = bounded(1);
        self.shared.pending.lock().insert(id, tx);

        let request = Request { id, is_async: false, call };
        if let Err(err) = self.write_request(&request) {
            self.shared.pending.lock().remove(&id);
            return Err(err);
        }

        match rx.recv_timeout(CALL_TIMEOUT) {
            Ok(result) => result.map_err(ClientError::Server),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                self.shared.pending.lock().remove(&id);
                Err(ClientError::Timeout)
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(ClientError::Disconnected("connection lost mid-call".to_string()))
            }
        }
    }

    fn send_async(&self, call: Call) -> Result<()> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request { id, is_async: true, call };
        self.write_request(&request)
    }

    fn write_request(&self, request: &Request) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected("not connected".to_string()));
        }
        let payload = proto::encode(request)?;
        let mut writer = self.shared.writer.lock();
        let stream = writer
            .as_mut()
            .ok_or_else(|| ClientError::Disconnected("not connected".to_string()))?;
        let key = self.shared.key.lock().clone();
        proto::write_frame(stream, &payload, key.as_ref()).map_err(|err| {
            self.shared.connected.store(false, Ordering::Release);
            err.into()
        })
    }

    // ------------------------------------------------------------------
    // Storage surface
    // ------------------------------------------------------------------

    /// Latest revision of `oid`, from cache when coherent.
    pub fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid)> {
        if self.cache_usable() {
            if let Some(cache) = &self.shared.cache {
                if let Some(hit) = cache.lock().load(oid) {
                    return Ok(hit);
                }
            }
        }
        match self.call(Call::Load { oid })? {
            Value::Blob { data, tid } => {
                if let Some(cache) = &self.shared.cache {
                    let _ = cache.lock().store(oid, tid, None, &data);
                }
                Ok((data, tid))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// The revision current just before `tid`.
    pub fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<(Vec<u8>, Tid, Option<Tid>)>> {
        if self.cache_usable() {
            if let Some(cache) = &self.shared.cache {
                if let Some(hit) = cache.lock().load_before(oid, tid) {
                    return Ok(Some(hit));
                }
            }
        }
        match self.call(Call::LoadBefore { oid, tid })? {
            Value::BlobBefore(result) => {
                if let (Some(cache), Some((data, start, end))) = (&self.shared.cache, &result) {
                    if end.is_some() {
                        let _ = cache.lock().store(oid, *start, *end, data);
                    }
                }
                Ok(result)
            }
            other => Err(unexpected(&other)),
        }
    }

    pub fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>> {
        match self.call(Call::LoadSerial { oid, tid: serial })? {
            Value::SerialBlob(data) => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    pub fn new_oid(&self) -> Result<Oid> {
        match self.call(Call::NewOid)? {
            Value::Oid(oid) => Ok(oid),
            other => Err(unexpected(&other)),
        }
    }

    pub fn new_oids(&self, count: u32) -> Result<Vec<Oid>> {
        match self.call(Call::NewOids { count })? {
            Value::Oids(oids) => Ok(oids),
            other => Err(unexpected(&other)),
        }
    }

    pub fn last_transaction(&self) -> Result<Tid> {
        match self.call(Call::LastTransaction)? {
            Value::Tid(tid) => Ok(tid),
            other => Err(unexpected(&other)),
        }
    }

    pub fn get_info(&self) -> Result<StorageInfo> {
        match self.call(Call::GetInfo)? {
            Value::Info(info) => Ok(info),
            other => Err(unexpected(&other)),
        }
    }

    pub fn tpc_begin(&self, meta: TransactionMeta) -> Result<()> {
        self.staged.lock().clear();
        match self.call(Call::TpcBegin { meta })? {
            Value::None => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Queue a write. Asynchronous: conflicts surface at `vote`.
    pub fn store(&self, oid: Oid, serial: Tid, data: Vec<u8>) -> Result<()> {
        self.send_async(Call::Storea { oid, serial, data: data.clone() })?;
        self.staged.lock().push((oid, data));
        Ok(())
    }

    /// Stage an undo of `undo_tid` in the open transaction.
    pub fn undo(&self, undo_tid: Tid) -> Result<()> {
        self.send_async(Call::Undoa { tid: undo_tid })
    }

    pub fn vote(&self) -> Result<Tid> {
        match self.call(Call::Vote)? {
            Value::Tid(tid) => Ok(tid),
            other => Err(unexpected(&other)),
        }
    }

    pub fn tpc_finish(&self) -> Result<Tid> {
        match self.call(Call::TpcFinish)? {
            Value::Tid(tid) => {
                // Fold our own writes into the cache under the commit TID;
                // the server does not echo invalidations to their writer.
                if let Some(cache) = &self.shared.cache {
                    let mut cache = cache.lock();
                    for (oid, data) in self.staged.lock().drain(..) {
                        let _ = cache.store(oid, tid, None, &data);
                    }
                }
                *self.shared.last_invalidation.lock() = tid;
                Ok(tid)
            }
            other => Err(unexpected(&other)),
        }
    }

    pub fn tpc_abort(&self) -> Result<()> {
        self.staged.lock().clear();
        self.send_async(Call::TpcAbort)
    }

    pub fn history(&self, oid: Oid, n: u32) -> Result<Vec<HistoryEntry>> {
        match self.call(Call::History { oid, n })? {
            Value::History(entries) => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    pub fn undo_log(&self, first: u64, last: u64) -> Result<Vec<UndoRecord>> {
        match self.call(Call::UndoLog { first, last })? {
            Value::UndoInfo(records) => Ok(records),
            other => Err(unexpected(&other)),
        }
    }

    pub fn undo_info(&self, first: u64, last: u64) -> Result<Vec<UndoRecord>> {
        match self.call(Call::UndoInfo { first, last })? {
            Value::UndoInfo(records) => Ok(records),
            other => Err(unexpected(&other)),
        }
    }

    pub fn pack(&self, tid: Tid) -> Result<()> {
        match self.call(Call::Pack { tid })? {
            Value::None => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Missed invalidations since `from`, or `None` when the server can no
    /// longer replay them and a full verification is required.
    pub fn get_invalidations(&self, from: Tid) -> Result<Option<Vec<(Tid, Vec<Oid>)>>> {
        match self.call(Call::GetInvalidations { from })? {
            Value::Invalidations(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    fn cache_usable(&self) -> bool {
        self.is_connected() && self.shared.verified.load(Ordering::Acquire)
    }
}

fn unexpected(value: &Value) -> ClientError {
    ClientError::Protocol(format!("unexpected reply payload: {value:?}"))
}

/// Background reader: routes replies to callers and applies pushes.
fn reader_loop(stream: TcpStream, shared: Arc<Shared>, key: Option<SessionKey>) {
    let mut reader = BufReader::new(stream);
    loop {
        let payload = match proto::read_frame(&mut reader, key.as_ref()) {
            Ok(payload) => payload,
            Err(err) => {
                shared.connected.store(false, Ordering::Release);
                shared.verified.store(false, Ordering::Release);
                shared.fail_pending("transport error");
                warn!(error = %err, "connection lost");
                return;
            }
        };
        let message: ServerMessage = match proto::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                error!(error = %err, "undecodable server message");
                continue;
            }
        };
        match message {
            ServerMessage::Reply(Response { id, result }) => {
                if let Some(sender) = shared.pending.lock().remove(&id) {
                    let _ = sender.send(result);
                }
            }
            ServerMessage::Invalidate { tid, oids } => {
                let mut last = shared.last_invalidation.lock();
                if tid <= *last {
                    // The server guarantees per-connection TID order; a
                    // repeat means we already folded this batch in.
                    debug!(%tid, last = %*last, "skipping stale invalidation");
                    continue;
                }
                if let Some(cache) = &shared.cache {
                    let mut cache = cache.lock();
                    for oid in &oids {
                        if let Err(err) = cache.invalidate(*oid, tid) {
                            error!(%oid, error = %err, "cache invalidation failed");
                        }
                    }
                }
                *last = tid;
                drop(last);
                shared.handler.invalidate(tid, &oids);
            }
            ServerMessage::InvalidateVerify { oid } => {
                if let Some(cache) = &shared.cache {
                    if let Err(err) = cache.lock().remove(oid) {
                        error!(%oid, error = %err, "cache removal failed");
                    }
                }
                shared.handler.invalidate(Tid::ZERO, &[oid]);
            }
            ServerMessage::EndVerify => {
                *shared.verify_done.lock() = true;
                shared.verify_cond.notify_all();
            }
        }
    }
}
