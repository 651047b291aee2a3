use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
};

pub struct RelayMetrics {
    connections_opened_total: AtomicU64,
    connections_closed_total: AtomicU64,
    active_connections: AtomicI64,
    live_documents: AtomicI64,
    frames_total: Mutex<HashMap<String, u64>>,
    frame_errors_total: Mutex<HashMap<String, u64>>,
    broadcasts_total: Mutex<HashMap<String, u64>>,
    broadcast_send_failures_total: AtomicU64,
    heartbeat_terminations_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            connections_opened_total: AtomicU64::new(0),
            connections_closed_total: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            live_documents: AtomicI64::new(0),
            frames_total: Mutex::new(HashMap::new()),
            frame_errors_total: Mutex::new(HashMap::new()),
            broadcasts_total: Mutex::new(HashMap::new()),
            broadcast_send_failures_total: AtomicU64::new(0),
            heartbeat_terminations_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_opened();
    }
}

pub fn record_connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_closed();
    }
}

pub fn record_frame(kind: &str, is_error: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_frame(kind, is_error);
    }
}

pub fn record_broadcast(channel: &str, delivered: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_broadcast(channel, delivered);
    }
}

pub fn increment_broadcast_send_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_broadcast_send_failures();
    }
}

pub fn increment_heartbeat_terminations(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_heartbeat_terminations(count);
    }
}

pub fn set_live_documents(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_live_documents(count);
    }
}

impl RelayMetrics {
    pub fn record_connection_opened(&self) {
        self.connections_opened_total.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed_total.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_frame(&self, kind: &str, is_error: bool) {
        let kind = normalize_label(kind);
        increment_label_counter(&self.frames_total, &kind, 1);
        if is_error {
            increment_label_counter(&self.frame_errors_total, &kind, 1);
        }
    }

    pub fn record_broadcast(&self, channel: &str, delivered: u64) {
        increment_label_counter(&self.broadcasts_total, &normalize_label(channel), delivered);
    }

    pub fn increment_broadcast_send_failures(&self) {
        self.broadcast_send_failures_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_heartbeat_terminations(&self, count: u64) {
        self.heartbeat_terminations_total.fetch_add(count, Ordering::SeqCst);
    }

    pub fn set_live_documents(&self, count: usize) {
        self.live_documents.store(count as i64, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_connections_opened_total Total websocket connections accepted.\n");
        output.push_str("# TYPE relay_connections_opened_total counter\n");
        output.push_str(&format!(
            "relay_connections_opened_total {}\n",
            self.connections_opened_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_connections_closed_total Total websocket connections torn down.\n");
        output.push_str("# TYPE relay_connections_closed_total counter\n");
        output.push_str(&format!(
            "relay_connections_closed_total {}\n",
            self.connections_closed_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_active_connections Currently open websocket connections.\n");
        output.push_str("# TYPE relay_active_connections gauge\n");
        output.push_str(&format!(
            "relay_active_connections {}\n",
            self.active_connections.load(Ordering::SeqCst).max(0)
        ));

        output.push_str("# HELP relay_live_documents Documents held in memory.\n");
        output.push_str("# TYPE relay_live_documents gauge\n");
        output.push_str(&format!(
            "relay_live_documents {}\n",
            self.live_documents.load(Ordering::SeqCst).max(0)
        ));

        output.push_str("# HELP relay_frames_total Inbound frames by kind.\n");
        output.push_str("# TYPE relay_frames_total counter\n");
        append_label_counter_lines(&mut output, "relay_frames_total", "kind", &self.frames_total);

        output.push_str("# HELP relay_frame_errors_total Inbound frames that failed handling, by kind.\n");
        output.push_str("# TYPE relay_frame_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_frame_errors_total",
            "kind",
            &self.frame_errors_total,
        );

        output.push_str("# HELP relay_broadcasts_total Messages fanned out to peers, by channel.\n");
        output.push_str("# TYPE relay_broadcasts_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_broadcasts_total",
            "channel",
            &self.broadcasts_total,
        );

        output.push_str(
            "# HELP relay_broadcast_send_failures_total Peer sends that failed during a broadcast.\n",
        );
        output.push_str("# TYPE relay_broadcast_send_failures_total counter\n");
        output.push_str(&format!(
            "relay_broadcast_send_failures_total {}\n",
            self.broadcast_send_failures_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP relay_heartbeat_terminations_total Connections terminated for missing a heartbeat.\n",
        );
        output.push_str("# TYPE relay_heartbeat_terminations_total counter\n");
        output.push_str(&format!(
            "relay_heartbeat_terminations_total {}\n",
            self.heartbeat_terminations_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().unwrap_or_else(PoisonError::into_inner);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().unwrap_or_else(PoisonError::into_inner);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
