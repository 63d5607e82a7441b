//! Per-document CRDT state and fan-out.
//!
//! Each live document owns one lock over the cohesive unit — replica,
//! awareness, connected client senders, the per-socket awareness-id index,
//! and its two timers. Applying an update and capturing what must be fanned
//! out happens under that lock, which serializes updates per document; the
//! actual socket writes run in per-connection writer tasks fed by unbounded
//! channels, so no lock is ever held across I/O. Enqueueing under the lock is
//! what keeps per-peer delivery order equal to apply order.
//!
//! ```text
//! Client A ──┐
//!             ├── SharedDoc (name) ── yrs::Doc + Awareness
//! Client B ──┘          │
//!                       ├── persist debounce (5s) ──► store  doc:<name>
//!                       └── idle destroy (30s, zero clients)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message};
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::awareness::Awareness;
use crate::protocol::{self, Frame, SyncMessage};
use crate::store::Persistence;

pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Engine timing knobs. The defaults are the production values; tests pass
/// millisecond settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long to coalesce updates before writing a snapshot.
    pub persist_debounce: Duration,
    /// How long a document may sit with zero clients before destruction.
    pub idle_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_secs(5),
            idle_grace: Duration::from_secs(30),
        }
    }
}

pub type ClientSender = mpsc::UnboundedSender<Message>;

struct DocState {
    doc: yrs::Doc,
    awareness: Awareness,
    clients: HashMap<u64, ClientSender>,
    /// Awareness client-ids each socket has ever announced.
    announced: HashMap<u64, HashSet<u64>>,
    persist_timer: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
}

impl DocState {
    /// Enqueue a frame on every open client except `skip`. Sockets whose
    /// channel is gone are dropped here, at the next broadcast touching them.
    fn fanout_except(&mut self, skip: Option<u64>, frame: &Bytes) {
        self.clients.retain(|id, tx| {
            if Some(*id) == skip {
                return true;
            }
            tx.send(Message::Binary(frame.clone())).is_ok()
        });
    }
}

/// One live document.
pub struct SharedDoc {
    name: String,
    state: Mutex<DocState>,
}

impl SharedDoc {
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct EngineInner {
    docs: RwLock<HashMap<String, Arc<SharedDoc>>>,
    /// Concurrent first connectors to the same name wait on one creation.
    creating: Mutex<HashMap<String, Arc<OnceCell<Arc<SharedDoc>>>>>,
    store: Arc<dyn Persistence>,
    config: EngineConfig,
    next_conn: AtomicU64,
}

#[derive(Clone)]
pub struct DocEngine {
    inner: Arc<EngineInner>,
}

impl DocEngine {
    pub fn new(store: Arc<dyn Persistence>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                docs: RwLock::new(HashMap::new()),
                creating: Mutex::new(HashMap::new()),
                store,
                config,
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Obtain the document, creating it (and loading any persisted snapshot)
    /// if this is the first connection.
    pub async fn get_or_create(&self, name: &str) -> Arc<SharedDoc> {
        if let Some(doc) = self.inner.docs.read().await.get(name) {
            return doc.clone();
        }

        let cell = {
            let mut creating = self.inner.creating.lock().await;
            creating
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let created = cell
            .get_or_init(|| async { self.build_doc(name) })
            .await
            .clone();

        {
            let mut docs = self.inner.docs.write().await;
            docs.entry(name.to_string())
                .or_insert_with(|| created.clone());
        }
        self.inner.creating.lock().await.remove(name);

        // Return the canonical instance from the map.
        self.inner
            .docs
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or(created)
    }

    fn build_doc(&self, name: &str) -> Arc<SharedDoc> {
        let doc = yrs::Doc::new();

        match self.inner.store.load_doc(name) {
            Ok(Some(snapshot)) => match Update::decode_v1(&snapshot) {
                Ok(update) => {
                    let mut txn = doc.transact_mut();
                    let _ = txn.apply_update(update);
                    drop(txn);
                    info!(doc = %name, bytes = snapshot.len(), "loaded persisted snapshot");
                }
                Err(e) => warn!(doc = %name, error = %e, "persisted snapshot unreadable, starting fresh"),
            },
            Ok(None) => {}
            Err(e) => warn!(doc = %name, error = %e, "snapshot load failed, starting fresh"),
        }

        Arc::new(SharedDoc {
            name: name.to_string(),
            state: Mutex::new(DocState {
                doc,
                awareness: Awareness::new(),
                clients: HashMap::new(),
                announced: HashMap::new(),
                persist_timer: None,
                idle_timer: None,
            }),
        })
    }

    /// Register a new socket on a document. The returned receiver already
    /// holds the greeting: a step-1 state-vector query, plus the known
    /// awareness states if there are any.
    pub async fn connect(&self, name: &str) -> (Arc<SharedDoc>, u64, mpsc::UnboundedReceiver<Message>) {
        let doc = self.get_or_create(name).await;
        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut st = doc.state.lock().await;
        // An arrival cancels a pending destruction.
        if let Some(timer) = st.idle_timer.take() {
            timer.abort();
        }

        let sv = {
            let txn = st.doc.transact();
            txn.state_vector().encode_v1()
        };
        let _ = tx.send(Message::Binary(protocol::encode_sync_step1(&sv).into()));

        let live = st.awareness.live_ids();
        if !live.is_empty() {
            let blob = st.awareness.encode_update(&live);
            let _ = tx.send(Message::Binary(protocol::encode_awareness(&blob).into()));
        }

        st.clients.insert(conn_id, tx);
        drop(st);

        debug!(doc = %doc.name, conn = conn_id, "client connected");
        (doc, conn_id, rx)
    }

    /// Handle one inbound binary frame from `conn_id`.
    pub async fn handle_frame(&self, doc: &Arc<SharedDoc>, conn_id: u64, data: &[u8]) {
        let frame = match protocol::decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(doc = %doc.name, conn = conn_id, error = %e, "dropping undecodable frame");
                return;
            }
        };

        match frame {
            Frame::Sync(SyncMessage::Step1(sv_bytes)) => {
                let st = doc.state.lock().await;
                let Ok(sv) = StateVector::decode_v1(sv_bytes) else {
                    debug!(doc = %doc.name, conn = conn_id, "dropping malformed state vector");
                    return;
                };
                let diff = {
                    let txn = st.doc.transact();
                    txn.encode_diff_v1(&sv)
                };
                // Replies go to the asking socket only.
                if let Some(tx) = st.clients.get(&conn_id) {
                    let _ = tx.send(Message::Binary(protocol::encode_sync_step2(&diff).into()));
                }
            }

            Frame::Sync(SyncMessage::Step2(update_bytes))
            | Frame::Sync(SyncMessage::Update(update_bytes)) => {
                let mut st = doc.state.lock().await;
                let Ok(update) = Update::decode_v1(update_bytes) else {
                    debug!(doc = %doc.name, conn = conn_id, "dropping malformed update");
                    return;
                };
                {
                    let mut txn = st.doc.transact_mut();
                    let _ = txn.apply_update(update);
                }
                let frame: Bytes = protocol::encode_sync_update(update_bytes).into();
                st.fanout_except(Some(conn_id), &frame);
                self.schedule_persist(&mut st, &doc.name);
            }

            Frame::Awareness(blob) => {
                let mut st = doc.state.lock().await;
                let change = match st.awareness.apply_update(blob) {
                    Ok(change) => change,
                    Err(e) => {
                        debug!(doc = %doc.name, conn = conn_id, error = %e, "dropping malformed awareness update");
                        return;
                    }
                };
                if change.is_empty() {
                    return;
                }
                // Remember which ids this socket owns so they can be
                // withdrawn when it goes away.
                let owned = st.announced.entry(conn_id).or_default();
                for id in change.added.iter().chain(change.updated.iter()) {
                    owned.insert(*id);
                }
                let blob_out = st.awareness.encode_update(&change.all_ids());
                let frame: Bytes = protocol::encode_awareness(&blob_out).into();
                // Awareness goes to everyone, origin included; clients filter.
                st.fanout_except(None, &frame);
            }

            Frame::FileOp => {
                let mut st = doc.state.lock().await;
                let frame = Bytes::copy_from_slice(data);
                st.fanout_except(Some(conn_id), &frame);
            }
        }
    }

    /// Unregister a socket: withdraw its awareness ids and, at zero clients,
    /// arm the idle-destroy timer.
    pub async fn disconnect(&self, doc: &Arc<SharedDoc>, conn_id: u64) {
        let mut st = doc.state.lock().await;
        st.clients.remove(&conn_id);

        if let Some(ids) = st.announced.remove(&conn_id) {
            let ids: Vec<u64> = ids.into_iter().collect();
            if !ids.is_empty() {
                let blob = st.awareness.remove(&ids);
                let frame: Bytes = protocol::encode_awareness(&blob).into();
                st.fanout_except(None, &frame);
            }
        }

        if st.clients.is_empty() {
            if let Some(timer) = st.idle_timer.take() {
                timer.abort();
            }
            let engine = self.clone();
            let name = doc.name.clone();
            let grace = self.inner.config.idle_grace;
            st.idle_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                engine.reap_idle(&name).await;
            }));
        }
        debug!(doc = %doc.name, conn = conn_id, "client disconnected");
    }

    /// Reset the single-shot persist timer for this document.
    fn schedule_persist(&self, st: &mut DocState, name: &str) {
        if let Some(timer) = st.persist_timer.take() {
            timer.abort();
        }
        let engine = self.clone();
        let name = name.to_string();
        let debounce = self.inner.config.persist_debounce;
        st.persist_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            engine.persist(&name).await;
        }));
    }

    /// Write the full replica state for `name` to the store. Failures are
    /// logged; in-memory state is untouched either way.
    pub async fn persist(&self, name: &str) {
        let doc = self.inner.docs.read().await.get(name).cloned();
        let Some(doc) = doc else { return };

        let snapshot = {
            let st = doc.state.lock().await;
            let txn = st.doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };

        if let Err(e) = self.inner.store.persist_doc(name, &snapshot) {
            warn!(doc = %name, error = %e, "snapshot persist failed");
        } else {
            debug!(doc = %name, bytes = snapshot.len(), "snapshot persisted");
        }
    }

    /// Idle-timer target: destroy the document if it is still empty.
    ///
    /// The final persist happens while the doc is still in the map, so a
    /// concurrent re-creation can never load a snapshot older than the state
    /// being destroyed. Removal afterwards re-checks that nobody arrived.
    async fn reap_idle(&self, name: &str) {
        let doc = self.inner.docs.read().await.get(name).cloned();
        let Some(doc) = doc else { return };

        {
            let mut st = doc.state.lock().await;
            if !st.clients.is_empty() {
                // Somebody arrived during the grace period.
                return;
            }
            if let Some(timer) = st.persist_timer.take() {
                timer.abort();
            }
            st.awareness.clear();
            let snapshot = {
                let txn = st.doc.transact();
                txn.encode_state_as_update_v1(&StateVector::default())
            };
            if let Err(e) = self.inner.store.persist_doc(name, &snapshot) {
                warn!(doc = %name, error = %e, "final persist before destroy failed");
            }
        }

        let mut docs = self.inner.docs.write().await;
        if let Some(current) = docs.get(name) {
            if !Arc::ptr_eq(current, &doc) {
                return;
            }
            let st = doc.state.lock().await;
            // Skip removal if a client slipped in, or if its updates still
            // owe a persist.
            if !st.clients.is_empty() || st.persist_timer.is_some() {
                return;
            }
            drop(st);
            docs.remove(name);
            info!(doc = %name, "idle document destroyed");
        }
    }

    /// Graceful shutdown: for every document cancel timers, persist once
    /// (awaited), close all sockets with code 1000, and drop the replica.
    pub async fn shutdown(&self) {
        let docs: Vec<(String, Arc<SharedDoc>)> =
            self.inner.docs.write().await.drain().collect();

        for (name, doc) in docs {
            let (snapshot, senders) = {
                let mut st = doc.state.lock().await;
                if let Some(timer) = st.persist_timer.take() {
                    timer.abort();
                }
                if let Some(timer) = st.idle_timer.take() {
                    timer.abort();
                }
                st.awareness.clear();
                let bytes = {
                    let txn = st.doc.transact();
                    txn.encode_state_as_update_v1(&StateVector::default())
                };
                let senders: Vec<ClientSender> =
                    st.clients.drain().map(|(_, tx)| tx).collect();
                (bytes, senders)
            };

            if let Err(e) = self.inner.store.persist_doc(&name, &snapshot) {
                warn!(doc = %name, error = %e, "shutdown persist failed");
            }

            for tx in senders {
                let _ = tx.send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: SHUTDOWN_REASON.into(),
                })));
            }
            info!(doc = %name, "document closed for shutdown");
        }
    }

    pub async fn doc_count(&self) -> usize {
        self.inner.docs.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        let docs: Vec<Arc<SharedDoc>> =
            self.inner.docs.read().await.values().cloned().collect();
        let mut total = 0;
        for doc in docs {
            total += doc.state.lock().await.clients.len();
        }
        total
    }

    #[cfg(test)]
    async fn awareness_live_len(&self, name: &str) -> usize {
        match self.inner.docs.read().await.get(name) {
            Some(doc) => doc.state.lock().await.awareness.live_len(),
            None => 0,
        }
    }
}
