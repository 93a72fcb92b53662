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

//! Storage Server
//!
//! Thread-per-connection TCP front end over one or more [`ObjectStore`]s.
//!
//! Each connection runs two threads: a reader that decodes framed requests
//! and dispatches them against the storage, and a writer that drains an
//! outgoing channel of replies and pushes. Pushes and replies share one
//! ordered channel, so a client always observes invalidations in commit
//! (TID) order relative to its own calls.
//!
//! ## Invalidation fan-out
//!
//! `tpc_finish` broadcasts `(tid, oids)` to every other connection
//! registered for the storage while the commit lock is still held, which
//! serializes fan-out in TID order. A connection whose outgoing queue has
//! fallen more than [`ServerConfig::invalidation_queue`] messages behind is
//! flagged; its next `get_invalidations` answers `None`, promoting the
//! client to a full cache verification.

use std::collections::{HashMap, VecDeque};
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use orbdb_core::proto::{
    self, Call, Request, Response, ServerMessage, SessionKey, StorageInfo, Value, WireError,
};
use orbdb_core::resolver::{RawOidArray, ReferencesExtractor};
use orbdb_core::{Oid, OrbError, Result, Tid};
use orbdb_storage::{ObjectStore, TxnHandle};

/// How long a begin or vote may wait on a competing transaction.
const COMMIT_WAIT: Duration = Duration::from_secs(30);

/// How many historical invalidation batches a storage retains for
/// `get_invalidations`.
const INVALIDATION_HISTORY: usize = 1000;

/// Server configuration.
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Shared secret enabling HMAC message authentication, when present.
    pub secret: Option<Vec<u8>>,
    /// Per-connection outgoing queue bound before the connection is
    /// promoted to full verification.
    pub invalidation_queue: usize,
    /// References extractor handed to `pack`.
    pub references: Arc<dyn ReferencesExtractor>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9011".parse().expect("static address parses"),
            secret: None,
            invalidation_queue: 100,
            references: Arc::new(RawOidArray),
        }
    }
}

/// Retained invalidation batches plus the horizon below which batches have
/// been evicted and can no longer be replayed.
#[derive(Default)]
struct InvalidationHistory {
    entries: VecDeque<(Tid, Vec<Oid>)>,
    evicted_through: Tid,
}

/// A storage plus the connections registered to it.
struct SharedStorage {
    store: Arc<ObjectStore>,
    connections: Mutex<HashMap<u64, Arc<Peer>>>,
    history: Mutex<InvalidationHistory>,
}

impl SharedStorage {
    /// Fan an invalidation out to every registered connection but `from`.
    /// Runs under the commit lock, which is what makes the per-client order
    /// match TID order.
    fn broadcast(&self, from: u64, tid: Tid, oids: &[Oid], queue_bound: usize) {
        {
            let mut history = self.history.lock();
            if history.entries.len() == INVALIDATION_HISTORY {
                if let Some((evicted, _)) = history.entries.pop_front() {
                    history.evicted_through = evicted;
                }
            }
            history.entries.push_back((tid, oids.to_vec()));
        }
        let connections = self.connections.lock();
        for (id, peer) in connections.iter() {
            if *id == from {
                continue;
            }
            if peer.outgoing.len() > queue_bound {
                // Slow consumer: stop pushing and force verification later.
                if !peer.overflowed.swap(true, Ordering::AcqRel) {
                    warn!(conn = *id, %tid, "invalidation queue overflow, client must verify");
                }
                continue;
            }
            let _ = peer.outgoing.send(ServerMessage::Invalidate { tid, oids: oids.to_vec() });
        }
    }

    /// Invalidation batches with TID strictly greater than `from`, or
    /// `None` when batches newer than `from` have been evicted and the
    /// client must fall back to full verification.
    fn invalidations_since(&self, from: Tid) -> Option<Vec<(Tid, Vec<Oid>)>> {
        let history = self.history.lock();
        if from < history.evicted_through {
            return None;
        }
        Some(
            history
                .entries
                .iter()
                .filter(|(tid, _)| *tid > from)
                .cloned()
                .collect(),
        )
    }
}

/// Per-connection shared state (reader thread, writer thread, fan-out).
struct Peer {
    id: u64,
    outgoing: Sender<ServerMessage>,
    overflowed: AtomicBool,
}

/// The storage server.
pub struct Server {
    config: ServerConfig,
    storages: HashMap<String, Arc<SharedStorage>>,
    next_conn: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            storages: HashMap::new(),
            next_conn: AtomicU64::new(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Host a storage under `name`.
    pub fn add_storage(&mut self, name: &str, store: Arc<ObjectStore>) {
        self.storages.insert(
            name.to_string(),
            Arc::new(SharedStorage {
                store,
                connections: Mutex::new(HashMap::new()),
                history: Mutex::new(InvalidationHistory::default()),
            }),
        );
    }

    /// Flag checked by the accept loop; set from a signal handler thread.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Bind and serve until the shutdown flag is raised. Blocks.
    pub fn run(self: Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind)?;
        let local = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        info!(addr = %local, storages = self.storages.len(), "server listening");

        while !self.shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    let server = Arc::clone(&self);
                    std::thread::spawn(move || {
                        if let Err(err) = server.serve_connection(stream, peer_addr) {
                            debug!(peer = %peer_addr, error = %err, "connection closed");
                        }
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(err.into()),
            }
        }
        info!("server shutting down");
        Ok(local)
    }

    fn serve_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut read_half = stream.try_clone()?;

        // Handshake: exchange protocol tags and nonces, derive the session
        // key when a secret is configured.
        let nonce: [u8; 8] = rand::random();
        let (tag, peer_nonce) = proto::handshake(&mut read_half, &nonce)?;
        let key = self
            .config
            .secret
            .as_deref()
            .map(|secret| SessionKey::derive(secret, &peer_nonce, &nonce));
        debug!(peer = %peer_addr, tag = %String::from_utf8_lossy(&tag), "handshake complete");

        let conn_id = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let (outgoing, incoming) = unbounded::<ServerMessage>();
        let peer = Arc::new(Peer { id: conn_id, outgoing, overflowed: AtomicBool::new(false) });

        // Writer thread: drains replies and pushes in order.
        let write_half = stream;
        let writer_key = key.clone();
        let writer = std::thread::spawn(move || writer_loop(write_half, incoming, writer_key));

        let mut session = Session {
            conn_id,
            peer: Arc::clone(&peer),
            storage: None,
            txn: None,
            queue_bound: self.config.invalidation_queue,
            references: Arc::clone(&self.config.references),
            failures: Vec::new(),
        };

        let mut reader = BufReader::new(read_half);
        let result = loop {
            let payload = match proto::read_frame(&mut reader, key.as_ref()) {
                Ok(payload) => payload,
                Err(err) => break Err(err),
            };
            let request: Request = match proto::decode(&payload) {
                Ok(request) => request,
                Err(err) => break Err(err),
            };
            match session.dispatch(&self.storages, request) {
                Ok(Some(response)) => {
                    if peer.outgoing.send(ServerMessage::Reply(response)).is_err() {
                        break Err(OrbError::Disconnected("writer thread gone".into()));
                    }
                }
                Ok(None) => {}
                Err(err) => break Err(err),
            }
        };

        session.teardown();
        // Drop every Arc<Peer> we hold so the outgoing channel closes and
        // the writer thread drains out.
        drop(session);
        drop(peer);
        let _ = writer.join();
        result
    }
}

fn writer_loop(stream: TcpStream, incoming: Receiver<ServerMessage>, key: Option<SessionKey>) {
    let mut stream = stream;
    for message in incoming.iter() {
        let payload = match proto::encode(&message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to encode outgoing message");
                continue;
            }
        };
        if proto::write_frame(&mut stream, &payload, key.as_ref()).is_err() {
            return;
        }
    }
}

/// Per-connection dispatch state.
struct Session {
    conn_id: u64,
    peer: Arc<Peer>,
    storage: Option<Arc<SharedStorage>>,
    txn: Option<TxnHandle>,
    queue_bound: usize,
    references: Arc<dyn ReferencesExtractor>,
    /// Failures of async mutation calls (`storea`, `undoa`), surfaced to
    /// the client at vote time.
    failures: Vec<WireError>,
}

impl Session {
    /// Handle one request. `Ok(None)` for async calls (no reply).
    fn dispatch(
        &mut self,
        storages: &HashMap<String, Arc<SharedStorage>>,
        request: Request,
    ) -> Result<Option<Response>> {
        let is_async = request.call.is_async();
        let method = request.call.method_name();
        let result = self.call(storages, request.call);
        if is_async {
            if let Err(err) = result {
                // Async failures have nowhere to go but the server log.
                error!(conn = self.conn_id, method, error = %err, kind = err.kind(), "async call failed");
            }
            return Ok(None);
        }
        let result = result.map_err(|err| {
            debug!(conn = self.conn_id, method, error = %err, "call failed");
            WireError::from(&err)
        });
        Ok(Some(Response { id: request.id, result }))
    }

    fn call(
        &mut self,
        storages: &HashMap<String, Arc<SharedStorage>>,
        call: Call,
    ) -> Result<Value> {
        match call {
            Call::Register { storage, read_only: _ } => {
                let shared = storages.get(&storage).ok_or_else(|| {
                    OrbError::Unsupported(format!("no storage named {storage:?}"))
                })?;
                shared.connections.lock().insert(self.conn_id, Arc::clone(&self.peer));
                self.storage = Some(Arc::clone(shared));
                Ok(Value::Tid(shared.store.last_tid()))
            }
            Call::GetInfo => {
                let shared = self.storage()?;
                Ok(Value::Info(StorageInfo {
                    name: shared.store.name().to_string(),
                    object_count: shared.store.len(),
                    size_bytes: shared.store.size(),
                    last_tid: shared.store.last_tid(),
                    read_only: shared.store.is_read_only(),
                }))
            }
            Call::LastTransaction => Ok(Value::Tid(self.storage()?.store.last_tid())),
            Call::GetInvalidations { from } => {
                let shared = self.storage()?;
                if self.peer.overflowed.load(Ordering::Acquire) {
                    return Ok(Value::Invalidations(None));
                }
                Ok(Value::Invalidations(shared.invalidations_since(from)))
            }
            Call::Verify { oid, tid } => {
                let shared = self.storage()?;
                let stale = match shared.store.load(oid) {
                    Ok((_, current)) => current != tid,
                    Err(OrbError::KeyNotFound { .. }) => true,
                    Err(err) => return Err(err),
                };
                if stale {
                    let _ = self.peer.outgoing.send(ServerMessage::InvalidateVerify { oid });
                }
                Ok(Value::None)
            }
            Call::EndVerify => {
                let _ = self.peer.outgoing.send(ServerMessage::EndVerify);
                self.peer.overflowed.store(false, Ordering::Release);
                Ok(Value::None)
            }
            Call::NewOid => Ok(Value::Oid(self.storage()?.store.new_oid()?)),
            Call::NewOids { count } => Ok(Value::Oids(self.storage()?.store.new_oids(count)?)),
            Call::Pack { tid } => {
                let shared = self.storage()?;
                shared.store.pack(tid, self.references.as_ref())?;
                Ok(Value::None)
            }
            Call::Load { oid } => {
                let (data, tid) = self.storage()?.store.load(oid)?;
                Ok(Value::Blob { data, tid })
            }
            Call::LoadBefore { oid, tid } => {
                Ok(Value::BlobBefore(self.storage()?.store.load_before(oid, tid)?))
            }
            Call::LoadSerial { oid, tid } => {
                Ok(Value::SerialBlob(self.storage()?.store.load_serial(oid, tid)?))
            }
            Call::Storea { oid, serial, data } => {
                let txn = self.txn()?;
                if let Err(err) = self.storage()?.store.store(txn, oid, serial, data) {
                    // Async call: remember the failure for vote time.
                    self.failures.push(WireError::from(&err));
                    return Err(err);
                }
                Ok(Value::None)
            }
            Call::Vote => {
                if let Some(failure) = self.failures.first().cloned() {
                    return Err(failure.into());
                }
                let txn = self.txn()?;
                let tid = self
                    .storage()?
                    .store
                    .tpc_vote(txn, Some(Instant::now() + COMMIT_WAIT))?;
                Ok(Value::Tid(tid))
            }
            Call::TpcBegin { meta } => {
                self.failures.clear();
                let shared = self.storage()?;
                if self.txn.is_some() {
                    return Err(OrbError::TransactionState {
                        detail: "connection already has a transaction".to_string(),
                    });
                }
                let txn = shared
                    .store
                    .tpc_begin_blocking(meta, Some(Instant::now() + COMMIT_WAIT))?;
                self.txn = Some(txn);
                Ok(Value::None)
            }
            Call::TpcFinish => {
                let shared = self.storage()?;
                let txn = self.txn.take().ok_or_else(|| OrbError::TransactionState {
                    detail: "no transaction on this connection".to_string(),
                })?;
                let oids = shared.store.txn_oids(txn)?;
                let conn_id = self.conn_id;
                let bound = self.queue_bound;
                let tid = shared
                    .store
                    .tpc_finish(txn, |tid| shared.broadcast(conn_id, tid, &oids, bound))?;
                self.failures.clear();
                Ok(Value::Tid(tid))
            }
            Call::TpcAbort => {
                self.failures.clear();
                if let (Some(shared), Some(txn)) = (&self.storage, self.txn.take()) {
                    shared.store.tpc_abort(txn)?;
                }
                Ok(Value::None)
            }
            Call::History { oid, n } => {
                Ok(Value::History(self.storage()?.store.history(oid, n as usize)?))
            }
            Call::UndoLog { first, last } | Call::UndoInfo { first, last } => Ok(Value::UndoInfo(
                self.storage()?.store.undo_log(first as usize, last as usize)?,
            )),
            Call::Undoa { tid } => {
                let txn = self.txn()?;
                match self.storage()?.store.undo(tid, txn) {
                    Ok(oids) => {
                        debug!(conn = self.conn_id, %tid, objects = oids.len(), "undo staged");
                        Ok(Value::None)
                    }
                    Err(err) => {
                        self.failures.push(WireError::from(&err));
                        Err(err)
                    }
                }
            }
        }
    }

    fn storage(&self) -> Result<Arc<SharedStorage>> {
        self.storage.clone().ok_or_else(|| OrbError::Protocol("call before register".to_string()))
    }

    fn txn(&self) -> Result<TxnHandle> {
        self.txn.ok_or_else(|| OrbError::TransactionState {
            detail: "no transaction on this connection".to_string(),
        })
    }

    /// Abort any in-flight transaction and unregister from the storage.
    fn teardown(&mut self) {
        if let (Some(shared), Some(txn)) = (&self.storage, self.txn.take()) {
            warn!(conn = self.conn_id, "connection dropped mid-transaction, aborting");
            let _ = shared.store.tpc_abort(txn);
        }
        if let Some(shared) = self.storage.take() {
            shared.connections.lock().remove(&self.conn_id);
        }
    }
}
