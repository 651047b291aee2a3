use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use yrs::sync::Timestamp;

use crate::config::RelayConfig;
use crate::connection::ConnectionId;
use crate::identity::IdentityAllocator;
use crate::metrics;
use crate::rooms::RoomMembership;
use crate::sync::DocRegistry;

/// Everything the relay shares across connections.
pub struct RelayState {
    pub config: RelayConfig,
    pub docs: DocRegistry,
    pub rooms: RoomMembership,
    pub identities: IdentityAllocator,
    next_connection_id: AtomicU64,
}

/// Outcome of one [`RelayState::maintain`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned_clients: usize,
    pub evicted_docs: Vec<String>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            docs: DocRegistry::new(config.doc_gc),
            rooms: RoomMembership::new(),
            identities: IdentityAllocator::new(config.identity_capacity),
            next_connection_id: AtomicU64::new(1),
            config,
        })
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Periodic housekeeping run alongside the liveness sweep: drops stale
    /// presence entries and, when configured, idle documents.
    pub async fn maintain(&self) -> MaintenanceReport {
        let presence_now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        self.maintain_at(Instant::now(), presence_now).await
    }

    /// `presence_now` is in the presence clock's unit: milliseconds since the
    /// Unix epoch.
    pub async fn maintain_at(&self, now: Instant, presence_now: Timestamp) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        for doc in self.docs.all().await {
            let pruned = doc.lock().await.prune_presence(presence_now, self.config.awareness_timeout);
            if !pruned.is_empty() {
                tracing::debug!(room = doc.name(), clients = ?pruned, "pruned stale presence");
                report.pruned_clients += pruned.len();
            }
        }

        if let Some(idle_after) = self.config.doc_idle_evict_after {
            report.evicted_docs = self.docs.evict_idle(now, idle_after).await;
            for room in &report.evicted_docs {
                tracing::info!(room = %room, "evicted idle document");
            }
        }

        metrics::set_live_documents(self.docs.len().await);
        report
    }
}
