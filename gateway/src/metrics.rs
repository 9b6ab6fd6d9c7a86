//! Structured counters, in the spirit of the teacher's `Metrics`/`MResp`
//! pair: plain atomics, no external metrics backend, snapshot on demand.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub frames_gt06: AtomicU64,
    pub frames_gps303: AtomicU64,
    pub frames_tk103: AtomicU64,
    pub frames_h02: AtomicU64,
    pub frames_unknown: AtomicU64,
    pub frames_corrupt: AtomicU64,
    pub auth_ok: AtomicU64,
    pub auth_failed: AtomicU64,
    pub auth_timeout: AtomicU64,
    pub auth_displaced: AtomicU64,
    pub locations_saved: AtomicU64,
    pub alerts_saved: AtomicU64,
    pub commands_sent: AtomicU64,
    pub commands_acknowledged: AtomicU64,
    pub commands_failed: AtomicU64,
    pub bus_publish_errors: AtomicU64,
    pub bus_consume_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_gt06: self.frames_gt06.load(Ordering::Relaxed),
            frames_gps303: self.frames_gps303.load(Ordering::Relaxed),
            frames_tk103: self.frames_tk103.load(Ordering::Relaxed),
            frames_h02: self.frames_h02.load(Ordering::Relaxed),
            frames_unknown: self.frames_unknown.load(Ordering::Relaxed),
            frames_corrupt: self.frames_corrupt.load(Ordering::Relaxed),
            auth_ok: self.auth_ok.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            auth_timeout: self.auth_timeout.load(Ordering::Relaxed),
            auth_displaced: self.auth_displaced.load(Ordering::Relaxed),
            locations_saved: self.locations_saved.load(Ordering::Relaxed),
            alerts_saved: self.alerts_saved.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_acknowledged: self.commands_acknowledged.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            bus_publish_errors: self.bus_publish_errors.load(Ordering::Relaxed),
            bus_consume_errors: self.bus_consume_errors.load(Ordering::Relaxed),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub frames_gt06: u64,
    pub frames_gps303: u64,
    pub frames_tk103: u64,
    pub frames_h02: u64,
    pub frames_unknown: u64,
    pub frames_corrupt: u64,
    pub auth_ok: u64,
    pub auth_failed: u64,
    pub auth_timeout: u64,
    pub auth_displaced: u64,
    pub locations_saved: u64,
    pub alerts_saved: u64,
    pub commands_sent: u64,
    pub commands_acknowledged: u64,
    pub commands_failed: u64,
    pub bus_publish_errors: u64,
    pub bus_consume_errors: u64,
}
