//! `get_stats()` snapshot (spec §6 exposed interface) and the telemetry
//! exporter hook (spec §6 consumed interface — "optional counters/gauges").

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// A structured, point-in-time snapshot. Always populated (spec SPEC_FULL.md
/// §6): unlike the push-style `Telemetry` trait below, this requires no
/// external collaborator to be useful.
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub pending: u64,
    pub reconnects: u64,
    pub redirects: u64,
    pub slot_map_version: u64,
    pub per_node_counters: HashMap<String, NodeCounters>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeCounters {
    pub pending: u64,
    pub sent: u64,
    pub errors: u64,
}

/// Shared, lock-free counters updated on the hot path; [`ClientStats`] is
/// materialized from these on demand rather than updated eagerly.
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub pending: AtomicI64,
    pub reconnects: AtomicU64,
    pub redirects: AtomicU64,
    pub slot_map_version: AtomicU64,
}

impl StatsCounters {
    pub fn snapshot(&self, per_node: HashMap<String, NodeCounters>) -> ClientStats {
        ClientStats {
            pending: self.pending.load(Ordering::Relaxed).max(0) as u64,
            reconnects: self.reconnects.load(Ordering::Relaxed),
            redirects: self.redirects.load(Ordering::Relaxed),
            slot_map_version: self.slot_map_version.load(Ordering::Relaxed),
            per_node_counters: per_node,
        }
    }
}

/// Optional push-style exporter; no default implementation (spec §6: "optional
/// counters/gauges for pending size, reconnect attempts, redirects").
pub trait Telemetry: Send + Sync {
    fn record_pending(&self, delta: i64);
    fn record_reconnect(&self);
    fn record_redirect(&self);
}

pub type SharedTelemetry = Arc<dyn Telemetry>;
