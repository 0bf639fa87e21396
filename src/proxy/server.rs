//! Supervisor: the accept loop, admission control, connection dispatch, and
//! the telemetry timers.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config;
use crate::dupe::Dupe;
use crate::policy::{FilterDecision, PolicyStore};
use crate::relay::{self, RelayTracker};
use crate::socks::{self, Command};
use crate::telemetry::{ConnectionSnapshot, EventKind, StatsSnapshot, Telemetry, TrafficEvent};
use crate::udp;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Supervisor startup errors. Everything after a successful bind is
/// per-connection and recoverable.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),
}

/// State shared by the supervisor, the relays, and the UDP framers.
#[derive(Debug)]
pub(crate) struct State {
    pub policy: Arc<PolicyStore>,
    pub telemetry: Telemetry,
    /// Live relays plus the recently closed still inside the grace window.
    pub relays: RwLock<HashMap<u64, Arc<RelayTracker>>>,
    next_conn_id: AtomicU64,
    active: AtomicUsize,
}

impl State {
    pub fn new(policy: Arc<PolicyStore>, telemetry_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            policy,
            telemetry: Telemetry::new(telemetry_path),
            relays: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        })
    }

    /// Dashboard view of the relay set, newest first.
    fn connections(&self) -> Vec<ConnectionSnapshot> {
        let mut view: Vec<ConnectionSnapshot> =
            self.relays.read().values().map(|t| t.snapshot()).collect();
        view.sort_by(|a, b| b.id.cmp(&a.id));
        view
    }
}

/// A running proxy. Dropping the handle shuts it down too, but only
/// [`ProxyHandle::stop`] waits for connections to drain.
#[derive(Debug)]
pub struct ProxyHandle {
    state: Arc<State>,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    port: u16,
}

impl ProxyHandle {
    /// The bound loopback port, fixed for the proxy's lifetime.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current counter values.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.state.telemetry.stats()
    }

    /// The current event log, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<TrafficEvent> {
        self.state.telemetry.events()
    }

    /// The live relay view, newest first.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.state.connections()
    }

    /// Stop the listener, the timers, and all outstanding connections.
    /// Live relays observe the signal and run their normal close path, so
    /// their termination events and byte totals land before this returns.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.supervisor.await;
    }
}

/// Bind `127.0.0.1` on an OS-assigned port and launch the supervisor. The
/// port is reported exactly once, through the returned handle.
pub async fn start(
    policy: Arc<PolicyStore>,
    telemetry_path: impl Into<PathBuf>,
) -> Result<ProxyHandle, Error> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(Error::Bind)?;
    let port = listener.local_addr().map_err(Error::Bind)?.port();
    let state = State::new(policy, telemetry_path.into());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(supervise(listener, state.dupe(), shutdown_rx));
    info!("SOCKS5 proxy listening on 127.0.0.1:{port}");
    Ok(ProxyHandle {
        state,
        shutdown: shutdown_tx,
        supervisor,
        port,
    })
}

async fn supervise(listener: TcpListener, state: Arc<State>, mut shutdown: watch::Receiver<bool>) {
    let mut conn_tasks = JoinSet::new();
    let mut snapshot_tick = tokio::time::interval(config::SNAPSHOT_INTERVAL);
    snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats_tick = tokio::time::interval(config::STATS_INTERVAL);
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(finished) = conn_tasks.join_next() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("connection task panicked: {e}");
                    }
                }
            }
            _ = snapshot_tick.tick() => {
                let json = state.telemetry.build_artifact(state.connections());
                state.telemetry.write_artifact(json).await;
            }
            _ = stats_tick.tick() => {
                let stats = state.telemetry.stats();
                if stats.total_conns > 0 {
                    info!(
                        "conns={} allowed={} blocked={} udp={} errors={} active={}",
                        stats.total_conns,
                        stats.tcp_allowed,
                        stats.tcp_blocked,
                        stats.udp_relayed,
                        stats.errors,
                        state.active.load(Ordering::Relaxed),
                    );
                }
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("accept failed: {e}");
                        break;
                    }
                };
                let id = state.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
                if state.active.load(Ordering::Relaxed) >= config::MAX_CONNECTIONS {
                    warn!("conn {id}: rejected, connection limit reached");
                    state.telemetry.counters.errors.fetch_add(1, Ordering::Relaxed);
                    state.telemetry.record(
                        EventKind::Error,
                        "",
                        0,
                        None,
                        "Connection limit reached",
                        None,
                    );
                    continue;
                }
                state.active.fetch_add(1, Ordering::Relaxed);
                state.telemetry.counters.total_conns.fetch_add(1, Ordering::Relaxed);
                debug!("conn {id}: accepted from {peer}");
                let state = state.dupe();
                let mut shutdown = shutdown.clone();
                conn_tasks.spawn(async move {
                    handle_connection(&state, stream, id, &mut shutdown).await;
                    let _ = state
                        .active
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                            Some(n.saturating_sub(1))
                        });
                });
            }
        }
    }
    debug!("supervisor stopping, {} connections live", conn_tasks.len());
    // Every connection holds the shutdown receiver, so the relays close
    // through their normal path; abort only the stragglers that never
    // reached a signal-aware await.
    let drained = tokio::time::timeout(config::SHUTDOWN_TIMEOUT, async {
        while conn_tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("connection drain timed out, aborting the rest");
        conn_tasks.abort_all();
    }
    // One last generation so the artifact reflects the shutdown closures.
    let json = state.telemetry.build_artifact(state.connections());
    state.telemetry.write_artifact(json).await;
}

async fn handle_connection(
    state: &Arc<State>,
    stream: TcpStream,
    id: u64,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut client = BufStream::new(stream);
    if let Err(e) = socks::negotiate(&mut client).await {
        protocol_error(state, id, &e);
        return;
    }
    match socks::read_request(&mut client).await {
        Ok((Command::Connect, addr)) => {
            debug!("conn {id}: CONNECT {}:{}", addr.host, addr.port);
            match state.policy.should_allow(&addr.host, addr.port) {
                FilterDecision::Block => {
                    info!("conn {id}: {}:{} blocked", addr.host, addr.port);
                    state.telemetry.counters.tcp_blocked.fetch_add(1, Ordering::Relaxed);
                    state.telemetry.record(
                        EventKind::Blocked,
                        &addr.host,
                        addr.port,
                        None,
                        "CONNECT blocked",
                        None,
                    );
                    let _ =
                        socks::write_reply(&mut client, socks::consts::REP_CONNECTION_REFUSED)
                            .await;
                }
                FilterDecision::Allow => {
                    state.telemetry.counters.tcp_allowed.fetch_add(1, Ordering::Relaxed);
                    state.telemetry.record(
                        EventKind::Allowed,
                        &addr.host,
                        addr.port,
                        None,
                        "CONNECT allowed",
                        None,
                    );
                    relay::run(state, client, id, addr, config::TCP_RELAY_TIMEOUT, shutdown)
                        .await;
                }
            }
        }
        Ok((Command::FwdUdp, addr)) => {
            debug!("conn {id}: FWD_UDP ({}:{})", addr.host, addr.port);
            if socks::write_reply(&mut client, socks::consts::REP_SUCCEEDED)
                .await
                .is_ok()
            {
                udp::run(state, client, id, shutdown).await;
            }
        }
        Err(e) => {
            if let Some(rep) = e.reply_code() {
                let _ = socks::write_reply(&mut client, rep).await;
            }
            protocol_error(state, id, &e);
        }
    }
}

fn protocol_error(state: &State, id: u64, e: &socks::Error) {
    warn!("conn {id}: {e}");
    state.telemetry.counters.errors.fetch_add(1, Ordering::Relaxed);
    state
        .telemetry
        .record(EventKind::Error, "", 0, None, e.to_string(), None);
}
