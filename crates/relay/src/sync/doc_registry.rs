use std::collections::{hash_map::Entry, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard, RwLock};
use yrs::block::ClientID;
use yrs::sync::awareness::Event;
use yrs::sync::{Awareness, AwarenessUpdate, Timestamp};
use yrs::updates::decoder::Decode;
use yrs::{Doc, Options, Origin, ReadTxn, StateVector, Subscription, Transact, TransactionMut, Update};

use crate::error::RelayError;
use crate::metrics;

/// CRDT document and presence table for one room. The awareness instance
/// owns the document.
pub struct DocState {
    pub awareness: Awareness,
}

impl DocState {
    fn new(gc: bool) -> Self {
        let options = Options { skip_gc: !gc, ..Options::default() };
        Self { awareness: Awareness::new(Doc::with_options(options)) }
    }

    pub fn doc(&self) -> &Doc {
        self.awareness.doc()
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc().transact().state_vector()
    }

    /// v1 update holding everything the document has beyond `remote`.
    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        self.doc().transact().encode_diff_v1(remote)
    }

    pub fn encode_full_state(&self) -> Vec<u8> {
        self.encode_diff(&StateVector::default())
    }

    /// Applies a v1 update under `origin`; update observers see that origin.
    pub fn apply_update(&self, room: &str, payload: &[u8], origin: Origin) -> Result<(), RelayError> {
        let update = Update::decode_v1(payload)?;
        let mut txn = self.doc().transact_mut_with(origin);
        txn.apply_update(update).map_err(|_| RelayError::UpdateRejected { room: room.to_string() })
    }

    /// Clients that currently have a presence state, in ascending order.
    pub fn present_clients(&self) -> Vec<ClientID> {
        let mut client_ids: Vec<ClientID> = self
            .awareness
            .iter()
            .filter(|(_, state)| state.data.is_some())
            .map(|(client_id, _)| client_id)
            .collect();
        client_ids.sort_unstable();
        client_ids
    }

    /// Every present client's state, or `None` when nobody is present.
    pub fn presence_snapshot(&self) -> Result<Option<AwarenessUpdate>, RelayError> {
        let update = self.awareness.update()?;
        Ok((!update.clients.is_empty()).then_some(update))
    }

    /// Clears the presence of each listed client that still has one. Peers
    /// are notified through the awareness update event with no origin.
    pub fn clear_presence<I>(&self, client_ids: I) -> Vec<ClientID>
    where
        I: IntoIterator<Item = ClientID>,
    {
        let present = self.present_clients();
        let mut cleared: Vec<ClientID> =
            client_ids.into_iter().filter(|client_id| present.binary_search(client_id).is_ok()).collect();
        cleared.sort_unstable();
        cleared.dedup();
        for client_id in &cleared {
            self.awareness.remove_state(*client_id);
        }
        cleared
    }

    /// Clears presence not renewed within `timeout` of `now` (milliseconds
    /// since the Unix epoch, the awareness clock's unit).
    pub fn prune_presence(&self, now: Timestamp, timeout: Duration) -> Vec<ClientID> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let stale: Vec<ClientID> = self
            .awareness
            .iter()
            .filter(|(_, state)| state.data.is_some() && now.saturating_sub(state.last_updated) >= timeout_ms)
            .map(|(client_id, _)| client_id)
            .collect();
        self.clear_presence(stale)
    }
}

/// One room's document, shared by every connection naming that room.
///
/// Frame handling for a room runs under the inner lock, so a frame's effect
/// on the document and the presence table is applied atomically.
pub struct SharedDoc {
    name: String,
    state: Mutex<DocState>,
}

impl SharedDoc {
    pub fn new(name: impl Into<String>, gc: bool) -> Self {
        Self { name: name.into(), state: Mutex::new(DocState::new(gc)) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().await
    }

    /// Registers `callback` for every v1 update committed to the document.
    pub async fn observe_updates<F>(&self, callback: F) -> Result<Subscription, RelayError>
    where
        F: Fn(&TransactionMut, &[u8]) + Send + Sync + 'static,
    {
        let state = self.state.lock().await;
        state
            .doc()
            .observe_update_v1(move |txn, event| callback(txn, &event.update))
            .map_err(|_| RelayError::Observe { room: self.name.clone() })
    }

    /// Registers `callback` for every accepted presence update, renewals
    /// included.
    pub async fn observe_presence<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Awareness, &Event, Option<&Origin>) + Send + Sync + 'static,
    {
        self.state.lock().await.awareness.on_update(callback)
    }
}

struct RegisteredDoc {
    doc: Arc<SharedDoc>,
    holders: usize,
    last_touched: Instant,
}

/// Room name to live document. Documents are created on first reference and
/// are only ever dropped by [`DocRegistry::evict_idle`].
pub struct DocRegistry {
    docs: RwLock<HashMap<String, RegisteredDoc>>,
    gc: bool,
}

impl Default for DocRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl DocRegistry {
    pub fn new(gc: bool) -> Self {
        Self { docs: RwLock::new(HashMap::new()), gc }
    }

    /// Returns the room's document, creating it if needed, and counts the
    /// caller as a holder until the matching [`DocRegistry::release`].
    pub async fn resolve(&self, room: &str) -> Arc<SharedDoc> {
        let mut docs = self.docs.write().await;
        let now = Instant::now();
        match docs.entry(room.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.holders += 1;
                existing.last_touched = now;
                Arc::clone(&existing.doc)
            }
            Entry::Vacant(vacant) => {
                tracing::debug!(room, gc = self.gc, "creating document");
                let doc = Arc::new(SharedDoc::new(room, self.gc));
                vacant.insert(RegisteredDoc { doc: Arc::clone(&doc), holders: 1, last_touched: now });
                metrics::set_live_documents(docs.len());
                doc
            }
        }
    }

    pub async fn release(&self, room: &str) -> bool {
        let mut docs = self.docs.write().await;
        if let Some(registered) = docs.get_mut(room) {
            registered.holders = registered.holders.saturating_sub(1);
            registered.last_touched = Instant::now();
            true
        } else {
            false
        }
    }

    /// Drops documents nobody holds that have been idle for `idle_after`.
    pub async fn evict_idle(&self, now: Instant, idle_after: Duration) -> Vec<String> {
        let mut docs = self.docs.write().await;
        let mut evicted = Vec::new();

        docs.retain(|room, registered| {
            let should_evict = registered.holders == 0
                && now.saturating_duration_since(registered.last_touched) >= idle_after;
            if should_evict {
                evicted.push(room.clone());
                false
            } else {
                true
            }
        });

        if !evicted.is_empty() {
            metrics::set_live_documents(docs.len());
        }
        evicted
    }

    pub async fn get(&self, room: &str) -> Option<Arc<SharedDoc>> {
        self.docs.read().await.get(room).map(|registered| Arc::clone(&registered.doc))
    }

    pub async fn holders(&self, room: &str) -> Option<usize> {
        self.docs.read().await.get(room).map(|registered| registered.holders)
    }

    pub async fn all(&self) -> Vec<Arc<SharedDoc>> {
        self.docs.read().await.values().map(|registered| Arc::clone(&registered.doc)).collect()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }
}
