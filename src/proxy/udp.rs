//! FWD_UDP: UDP datagrams relayed as length-prefixed frames over the
//! client's TCP connection.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config;
use crate::policy::FilterDecision;
use crate::server::State;
use crate::socks::{self, TargetAddr};
use crate::telemetry::EventKind;
use bytes::{BufMut, BytesMut};
use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Loop on the accepted FWD_UDP connection: one frame in, at most one reply
/// frame out. Returns when the client hangs up, sends a bad frame, or the
/// proxy shuts down.
pub(crate) async fn run<RW>(
    state: &Arc<State>,
    mut client: RW,
    id: u64,
    shutdown: &mut watch::Receiver<bool>,
) where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = socks::read_udp_frame(&mut client) => frame,
            _ = shutdown.changed() => {
                trace!("udp {id}: shutting down");
                return;
            }
        };
        let payload = match frame {
            Ok(payload) => payload,
            Err(socks::Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                trace!("udp {id}: client closed");
                return;
            }
            Err(e @ socks::Error::FrameLength(_)) => {
                // Out-of-range lengths abort the connection without an event.
                warn!("udp {id}: {e}");
                state.telemetry.counters.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!("udp {id}: {e}");
                state.telemetry.counters.errors.fetch_add(1, Ordering::Relaxed);
                state
                    .telemetry
                    .record(EventKind::Error, "", 0, None, e.to_string(), None);
                return;
            }
        };
        // One reserved byte, then the address, then the datagram.
        let (addr, header_end) = match socks::parse_address(&payload, 1) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("udp {id}: bad frame address: {e}");
                state.telemetry.counters.errors.fetch_add(1, Ordering::Relaxed);
                state
                    .telemetry
                    .record(EventKind::Error, "", 0, None, format!("bad FWD_UDP frame: {e}"), None);
                return;
            }
        };
        state.telemetry.counters.udp_relayed.fetch_add(1, Ordering::Relaxed);
        if state.policy.should_allow(&addr.host, addr.port) == FilterDecision::Block {
            debug!("udp {id}: {}:{} blocked", addr.host, addr.port);
            state.telemetry.record(
                EventKind::Blocked,
                &addr.host,
                addr.port,
                None,
                "FWD_UDP blocked",
                None,
            );
            continue;
        }
        // The reserved byte and address are echoed verbatim in front of the
        // reply datagram.
        let header = &payload[..header_end];
        let datagram = &payload[header_end..];
        match forward_datagram(&addr, datagram).await {
            Ok(Some(reply)) => {
                let total = header.len() + reply.len();
                let Ok(frame_len) = u16::try_from(total) else {
                    trace!("udp {id}: oversized reply dropped ({total} bytes)");
                    continue;
                };
                let mut frame = BytesMut::with_capacity(2 + total);
                frame.put_u16(frame_len);
                frame.put_slice(header);
                frame.put_slice(&reply);
                if let Err(e) = write_frame(&mut client, &frame).await {
                    trace!("udp {id}: reply write failed: {e}");
                    return;
                }
            }
            Ok(None) => trace!("udp {id}: no reply from {}:{}", addr.host, addr.port),
            Err(e) => trace!("udp {id}: relay to {}:{} failed: {e}", addr.host, addr.port),
        }
    }
}

async fn write_frame<W>(client: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    client.write_all(frame).await?;
    client.flush().await
}

/// One-shot forward: a throwaway socket carries the datagram out and
/// collects at most one reply within the relay timeout. `Ok(None)` means
/// the reply window elapsed; the socket never outlives the frame.
async fn forward_datagram(addr: &TargetAddr, datagram: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
    let dest = lookup_host((addr.host.as_str(), addr.port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                ErrorKind::NotFound,
                format!("{} did not resolve", addr.host),
            )
        })?;
    // The wildcard bind has to match the destination's address family.
    let socket = if dest.is_ipv6() {
        UdpSocket::bind(("::", 0)).await?
    } else {
        UdpSocket::bind(("0.0.0.0", 0)).await?
    };
    socket.connect(dest).await?;
    socket.send(datagram).await?;

    let mut reply = vec![0u8; 65535];
    match tokio::time::timeout(config::UDP_RELAY_TIMEOUT, socket.recv(&mut reply)).await {
        Ok(Ok(len)) => {
            reply.truncate(len);
            Ok(Some(reply))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}
