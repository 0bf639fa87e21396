//! TCP relay engine: paired byte pumps with SNI snooping and download
//! budget enforcement.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config;
use crate::dupe::Dupe;
use crate::server::State;
use crate::sni;
use crate::socks::{self, TargetAddr};
use crate::telemetry::{ConnectionSnapshot, EventKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Accounting for one live relay. Both pumps share it; one counter per
/// direction, so the pumps never contend.
#[derive(Debug)]
pub(crate) struct RelayTracker {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub start_time: DateTime<Utc>,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    sni: Mutex<Option<String>>,
    /// Latched on the first upload chunk whether or not extraction worked.
    sni_extracted: AtomicBool,
    /// Latched by `log_relay_end`; transitions false -> true exactly once.
    closed: AtomicBool,
}

impl RelayTracker {
    fn new(id: u64, addr: &TargetAddr) -> Self {
        Self {
            id,
            host: addr.host.clone(),
            port: addr.port,
            start_time: Utc::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            sni: Mutex::new(None),
            sni_extracted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sni(&self) -> Option<String> {
        self.sni.lock().clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            host: self.host.clone(),
            port: self.port,
            sni: self.sni(),
            start_time: self.start_time,
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            is_active: !self.closed.load(Ordering::Relaxed),
        }
    }
}

/// Why a relay ended. Becomes the `detail` of its completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Complete,
    Error,
    RelayError,
    Timeout,
    StreamBlocked,
    TargetFailed,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Error => "error",
            Self::RelayError => "relay-error",
            Self::Timeout => "timeout",
            Self::StreamBlocked => "stream-blocked",
            Self::TargetFailed => "target-failed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Drive an allowed CONNECT: dial the target, reply, pump both directions
/// until one side ends, the download budget trips, the wall-clock cap
/// fires, or the proxy shuts down. All outcomes funnel through
/// `log_relay_end`.
pub(crate) async fn run<RW>(
    state: &Arc<State>,
    mut client: RW,
    id: u64,
    addr: TargetAddr,
    cap: Duration,
    shutdown: &mut watch::Receiver<bool>,
) where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let tracker = Arc::new(RelayTracker::new(id, &addr));
    state.relays.write().insert(id, tracker.dupe());

    let target = match TcpStream::connect((tracker.host.as_str(), tracker.port)).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("relay {id}: dial {}:{} failed: {e}", tracker.host, tracker.port);
            state.telemetry.counters.errors.fetch_add(1, Ordering::Relaxed);
            state.telemetry.record(
                EventKind::Error,
                &tracker.host,
                tracker.port,
                None,
                format!("connect failed: {e}"),
                None,
            );
            let _ = socks::write_reply(&mut client, socks::consts::REP_CONNECTION_REFUSED).await;
            log_relay_end(state, &tracker, CloseReason::TargetFailed);
            return;
        }
    };
    if let Err(e) = socks::write_reply(&mut client, socks::consts::REP_SUCCEEDED).await {
        debug!("relay {id}: success reply failed: {e}");
        log_relay_end(state, &tracker, CloseReason::RelayError);
        return;
    }
    debug!("relay {id}: {}:{} open", tracker.host, tracker.port);

    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut target_rx, mut target_tx) = target.into_split();
    // The cap is armed once here and never refreshed; a relay may not
    // outlive it no matter how busy it is. Losing the select drops the
    // other pump mid-await, which closes its sockets with it. A shutdown
    // signal lands here too, so stopping the proxy still closes every
    // relay through the same path.
    let reason = tokio::select! {
        reason = pump_upload(&mut client_rx, &mut target_tx, &tracker) => reason,
        reason = pump_download(&mut target_rx, &mut client_tx, &tracker, state) => reason,
        () = tokio::time::sleep(cap) => CloseReason::Timeout,
        _ = shutdown.changed() => CloseReason::Shutdown,
    };
    log_relay_end(state, &tracker, reason);
}

/// client -> target. Runs the SNI extractor on the first chunk.
async fn pump_upload<R, W>(rx: &mut R, tx: &mut W, tracker: &RelayTracker) -> CloseReason
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; config::RELAY_BUFFER_SIZE];
    loop {
        let n = match rx.read(&mut buf).await {
            Ok(0) => return CloseReason::Complete,
            Ok(n) => n,
            Err(e) => {
                trace!("relay {}: upload read: {e}", tracker.id);
                return CloseReason::Error;
            }
        };
        if !tracker.sni_extracted.swap(true, Ordering::Relaxed) {
            let sni = sni::extract_sni(&buf[..n]);
            if let Some(name) = &sni {
                debug!("relay {}: sni {name}", tracker.id);
            }
            *tracker.sni.lock() = sni;
        }
        tracker.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
        if let Err(e) = write_chunk(tx, &buf[..n]).await {
            trace!("relay {}: upload write: {e}", tracker.id);
            return CloseReason::RelayError;
        }
    }
}

/// target -> client. Enforces the download budget; the chunk that crosses
/// the threshold is counted but not forwarded.
async fn pump_download<R, W>(
    rx: &mut R,
    tx: &mut W,
    tracker: &RelayTracker,
    state: &State,
) -> CloseReason
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; config::RELAY_BUFFER_SIZE];
    loop {
        let n = match rx.read(&mut buf).await {
            Ok(0) => return CloseReason::Complete,
            Ok(n) => n,
            Err(e) => {
                trace!("relay {}: download read: {e}", tracker.id);
                return CloseReason::Error;
            }
        };
        let total = tracker.bytes_down.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
        // Policy is re-read per chunk so threshold edits apply mid-stream.
        if let Some(sni) = tracker.sni() {
            if let Some(threshold) = state.policy.stream_block_threshold(&sni) {
                if total > threshold {
                    warn!(
                        "relay {}: {sni} over download budget ({total} > {threshold})",
                        tracker.id
                    );
                    state.telemetry.record(
                        EventKind::StreamBlocked,
                        &tracker.host,
                        tracker.port,
                        Some(sni),
                        format!("download budget {threshold} exceeded"),
                        Some(total),
                    );
                    return CloseReason::StreamBlocked;
                }
            }
        }
        if let Err(e) = write_chunk(tx, &buf[..n]).await {
            trace!("relay {}: download write: {e}", tracker.id);
            return CloseReason::RelayError;
        }
    }
}

async fn write_chunk<W>(tx: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    tx.write_all(chunk).await?;
    tx.flush().await
}

/// Close bookkeeping; idempotent, the first caller wins. Emits the
/// completion event (stream-block and dial failure already emitted theirs),
/// folds the byte totals into the domain aggregates, and schedules removal
/// from the active set after the grace window.
pub(crate) fn log_relay_end(state: &Arc<State>, tracker: &Arc<RelayTracker>, reason: CloseReason) {
    if tracker.closed.swap(true, Ordering::Relaxed) {
        return;
    }
    let bytes_up = tracker.bytes_up.load(Ordering::Relaxed);
    let bytes_down = tracker.bytes_down.load(Ordering::Relaxed);
    let sni = tracker.sni();
    debug!(
        "relay {} closed ({}): up={bytes_up} down={bytes_down}",
        tracker.id,
        reason.as_str()
    );
    if !matches!(reason, CloseReason::StreamBlocked | CloseReason::TargetFailed) {
        state.telemetry.record(
            EventKind::Completed,
            &tracker.host,
            tracker.port,
            sni.clone(),
            reason.as_str(),
            Some(bytes_down),
        );
    }
    let domain = sni.unwrap_or_else(|| tracker.host.clone());
    state.telemetry.note_domain(&domain, bytes_up + bytes_down);
    let state = state.dupe();
    let id = tracker.id;
    tokio::spawn(async move {
        tokio::time::sleep(config::CLOSE_GRACE).await;
        state.relays.write().remove(&id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyStore;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn test_state() -> Arc<State> {
        State::new(
            Arc::new(PolicyStore::new()),
            std::env::temp_dir().join("warden-relay-test.json"),
        )
    }

    /// The relay cap is wall-clock, not idle: a target that keeps sending
    /// still gets cut off at the deadline.
    #[tokio::test]
    async fn relay_cap_is_wall_clock_not_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            loop {
                if peer.write_all(b"chunk").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let state = test_state();
        let (proxy_side, mut client) = tokio::io::duplex(65536);
        let drain = tokio::spawn(async move {
            // Swallow the success reply and the relayed chunks.
            let mut sink = vec![0u8; 4096];
            while client.read(&mut sink).await.map_or(false, |n| n > 0) {}
        });

        let started = Instant::now();
        let (_shutdown_tx, mut shutdown) = watch::channel(false);
        run(
            &state,
            proxy_side,
            1,
            TargetAddr {
                host: addr.ip().to_string(),
                port: addr.port(),
            },
            Duration::from_millis(300),
            &mut shutdown,
        )
        .await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(2));

        let events = state.telemetry.events();
        let completed: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::Completed)
            .collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].detail, "timeout");
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn dial_failure_replies_refused_and_records_error() {
        let state = test_state();
        // Bind then drop to get a port with no listener behind it.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (proxy_side, mut client) = tokio::io::duplex(1024);
        let (_shutdown_tx, mut shutdown) = watch::channel(false);
        run(
            &state,
            proxy_side,
            7,
            TargetAddr {
                host: "127.0.0.1".into(),
                port,
            },
            config::TCP_RELAY_TIMEOUT,
            &mut shutdown,
        )
        .await;
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], socks::consts::REP_CONNECTION_REFUSED);
        assert_eq!(state.telemetry.stats().errors, 1);
        let events = state.telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
        // Dial failures do not also emit a completion event.
        assert!(events.iter().all(|e| e.kind != EventKind::Completed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let state = test_state();
        let tracker = Arc::new(RelayTracker::new(
            9,
            &TargetAddr {
                host: "example.com".into(),
                port: 443,
            },
        ));
        tracker.bytes_down.store(17, Ordering::Relaxed);
        log_relay_end(&state, &tracker, CloseReason::Complete);
        log_relay_end(&state, &tracker, CloseReason::Error);
        log_relay_end(&state, &tracker, CloseReason::Timeout);
        let events = state.telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detail, "complete");
        assert_eq!(events[0].bytes_down, Some(17));
        assert!(!tracker.snapshot().is_active);
    }

    /// A shutdown signal ends the relay through the same close path as EOF:
    /// one completion event, tracker latched closed.
    #[tokio::test]
    async fn shutdown_signal_runs_the_close_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8];
            let _ = peer.read(&mut buf).await;
        });

        let state = test_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (proxy_side, mut client) = tokio::io::duplex(1024);
        let relay_task = {
            let state = state.dupe();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                run(
                    &state,
                    proxy_side,
                    3,
                    TargetAddr {
                        host: addr.ip().to_string(),
                        port: addr.port(),
                    },
                    config::TCP_RELAY_TIMEOUT,
                    &mut shutdown_rx,
                )
                .await;
            })
        };
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], socks::consts::REP_SUCCEEDED);

        shutdown_tx.send(true).unwrap();
        relay_task.await.unwrap();

        let events = state.telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Completed);
        assert_eq!(events[0].detail, "shutdown");
        let tracker = state.relays.read().get(&3).unwrap().dupe();
        assert!(!tracker.snapshot().is_active);
    }
}
