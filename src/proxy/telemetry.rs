//! Telemetry: the event log, counters, and the periodic snapshot artifact.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// What happened to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Allowed,
    Blocked,
    StreamBlocked,
    Error,
    Completed,
}

/// One entry in the event log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_down: Option<u64>,
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_conns: u64,
    pub tcp_allowed: u64,
    pub tcp_blocked: u64,
    pub udp_relayed: u64,
    pub errors: u64,
}

/// One relay as seen by the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    pub start_time: DateTime<Utc>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub is_active: bool,
}

/// Aggregate traffic for one domain.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSnapshot {
    pub domain: String,
    pub count: u64,
    pub total_bytes: u64,
}

/// The per-second view appended to the artifact history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSnapshot {
    pub timestamp: DateTime<Utc>,
    pub connections: Vec<ConnectionSnapshot>,
    pub stats: StatsSnapshot,
    pub top_domains: Vec<DomainSnapshot>,
}

/// Counters that only go up. Relaxed ordering throughout: these count, they
/// do not protect memory accesses.
#[derive(Debug, Default)]
pub struct Counters {
    pub total_conns: AtomicU64,
    pub tcp_allowed: AtomicU64,
    pub tcp_blocked: AtomicU64,
    pub udp_relayed: AtomicU64,
    pub errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_conns: self.total_conns.load(Ordering::Relaxed),
            tcp_allowed: self.tcp_allowed.load(Ordering::Relaxed),
            tcp_blocked: self.tcp_blocked.load(Ordering::Relaxed),
            udp_relayed: self.udp_relayed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Rings {
    next_event_id: u64,
    events: VecDeque<TrafficEvent>,
    snapshots: VecDeque<TrafficSnapshot>,
    domains: HashMap<String, (u64, u64)>,
}

#[derive(Serialize)]
struct Artifact<'a> {
    snapshots: &'a VecDeque<TrafficSnapshot>,
    events: &'a VecDeque<TrafficEvent>,
}

/// Single writer of the telemetry artifact; shared query surface for the
/// supervisor, relays, and embedders.
#[derive(Debug)]
pub struct Telemetry {
    path: PathBuf,
    tmp_path: PathBuf,
    pub counters: Counters,
    rings: Mutex<Rings>,
}

impl Telemetry {
    pub fn new(path: PathBuf) -> Self {
        let tmp_path = path.with_extension("tmp");
        Self {
            path,
            tmp_path,
            counters: Counters::default(),
            rings: Mutex::new(Rings {
                next_event_id: 1,
                events: VecDeque::new(),
                snapshots: VecDeque::new(),
                domains: HashMap::new(),
            }),
        }
    }

    /// The single funnel for events: allocates the id, stamps, appends.
    /// Ids are allocated under the ring lock so the log order and the id
    /// order always agree.
    pub fn record(
        &self,
        kind: EventKind,
        host: &str,
        port: u16,
        sni: Option<String>,
        detail: impl Into<String>,
        bytes_down: Option<u64>,
    ) {
        let mut rings = self.rings.lock();
        let event = TrafficEvent {
            id: rings.next_event_id,
            timestamp: Utc::now(),
            kind,
            host: host.to_owned(),
            port,
            sni,
            detail: detail.into(),
            bytes_down,
        };
        trace!("event {}: {:?} {}:{}", event.id, kind, event.host, port);
        rings.next_event_id += 1;
        rings.events.push_back(event);
        if rings.events.len() > config::EVENT_LOG_CAP {
            rings.events.pop_front();
        }
    }

    /// Fold a closed relay into the per-domain aggregates.
    pub fn note_domain(&self, domain: &str, bytes: u64) {
        let mut rings = self.rings.lock();
        let entry = rings.domains.entry(domain.to_owned()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += bytes;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.counters.snapshot()
    }

    pub fn events(&self) -> Vec<TrafficEvent> {
        self.rings.lock().events.iter().cloned().collect()
    }

    /// Append a snapshot built from the live connection views and serialize
    /// the whole artifact.
    pub fn build_artifact(&self, connections: Vec<ConnectionSnapshot>) -> String {
        let mut rings = self.rings.lock();
        let mut top_domains: Vec<DomainSnapshot> = rings
            .domains
            .iter()
            .map(|(domain, &(count, total_bytes))| DomainSnapshot {
                domain: domain.clone(),
                count,
                total_bytes,
            })
            .collect();
        top_domains.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));
        top_domains.truncate(config::TOP_DOMAINS);
        let snapshot = TrafficSnapshot {
            timestamp: Utc::now(),
            connections,
            stats: self.counters.snapshot(),
            top_domains,
        };
        rings.snapshots.push_back(snapshot);
        if rings.snapshots.len() > config::SNAPSHOT_HISTORY {
            rings.snapshots.pop_front();
        }
        serde_json::to_string(&Artifact {
            snapshots: &rings.snapshots,
            events: &rings.events,
        })
        .expect("telemetry serialization failed (this is a bug)")
    }

    /// Write the artifact through a sibling temp file plus rename so readers
    /// never observe a partial generation. Failures are swallowed; the next
    /// tick retries.
    pub async fn write_artifact(&self, json: String) {
        if let Err(e) = tokio::fs::write(&self.tmp_path, json).await {
            trace!("telemetry write failed: {e}");
            return;
        }
        if let Err(e) = tokio::fs::rename(&self.tmp_path, &self.path).await {
            trace!("telemetry rename failed: {e}");
        }
    }
}
