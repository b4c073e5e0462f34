use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

static GLOBAL_METRICS: OnceLock<Arc<GatewayMetrics>> = OnceLock::new();

/// Process-wide gateway counters, rendered at `GET /metrics`.
///
/// `presence_race_total` distinguishes the benign late-message race
/// (focus/leave arriving after a disconnect was swept) from ordinary
/// traffic; a sustained climb with stable connection counts points at a
/// client sending stale incident ids.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    ws_messages_total: Mutex<HashMap<&'static str, u64>>,
    presence_race_total: AtomicU64,
    broadcast_failures_total: AtomicU64,
    connections_rejected_total: AtomicU64,
    active_connections: AtomicI64,
    active_rooms: AtomicI64,
}

pub fn set_global_metrics(metrics: Arc<GatewayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<GatewayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_message(kind: &'static str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_message(kind);
    }
}

pub fn increment_presence_race() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_presence_race();
    }
}

pub fn increment_broadcast_failures(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_broadcast_failures(count);
    }
}

pub fn increment_connections_rejected() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_connections_rejected();
    }
}

pub fn adjust_active_connections(delta: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.adjust_active_connections(delta);
    }
}

pub fn set_active_rooms(rooms: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.set_active_rooms(rooms);
    }
}

impl GatewayMetrics {
    pub fn record_ws_message(&self, kind: &'static str) {
        let mut guard = self.ws_messages_total.lock().expect("metrics map lock poisoned");
        *guard.entry(kind).or_insert(0) += 1;
    }

    pub fn increment_presence_race(&self) {
        self.presence_race_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_broadcast_failures(&self, count: u64) {
        self.broadcast_failures_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_connections_rejected(&self) {
        self.connections_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn adjust_active_connections(&self, delta: i64) {
        self.active_connections.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_active_rooms(&self, rooms: i64) {
        self.active_rooms.store(rooms, Ordering::Relaxed);
    }

    pub fn presence_race_total(&self) -> u64 {
        self.presence_race_total.load(Ordering::Relaxed)
    }

    /// Render all counters in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE vigil_ws_messages_total counter\n");
        let mut kinds: Vec<(&'static str, u64)> = {
            let guard = self.ws_messages_total.lock().expect("metrics map lock poisoned");
            guard.iter().map(|(kind, count)| (*kind, *count)).collect()
        };
        kinds.sort_by_key(|(kind, _)| *kind);
        for (kind, count) in kinds {
            out.push_str(&format!("vigil_ws_messages_total{{kind=\"{kind}\"}} {count}\n"));
        }

        out.push_str("# TYPE vigil_presence_race_total counter\n");
        out.push_str(&format!(
            "vigil_presence_race_total {}\n",
            self.presence_race_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE vigil_broadcast_failures_total counter\n");
        out.push_str(&format!(
            "vigil_broadcast_failures_total {}\n",
            self.broadcast_failures_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE vigil_connections_rejected_total counter\n");
        out.push_str(&format!(
            "vigil_connections_rejected_total {}\n",
            self.connections_rejected_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE vigil_active_connections gauge\n");
        out.push_str(&format!(
            "vigil_active_connections {}\n",
            self.active_connections.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE vigil_active_rooms gauge\n");
        out.push_str(&format!(
            "vigil_active_rooms {}\n",
            self.active_rooms.load(Ordering::Relaxed)
        ));

        out
    }
}
