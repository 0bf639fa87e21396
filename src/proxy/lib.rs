//! An on-device filtering SOCKS5 proxy for packet tunnels.
//!
//! Sits between tun2socks and the real network: accepts SOCKS5 handshakes on
//! loopback, filters CONNECT destinations against a shared domain policy,
//! relays TCP with per-domain download budgets enforced via the TLS SNI, and
//! forwards UDP datagrams framed over TCP (the hev-socks5-tunnel `FWD_UDP`
//! extension). A JSON telemetry artifact is rewritten every second for an
//! out-of-process dashboard.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(missing_debug_implementations)]
#![forbid(unsafe_code)]

pub mod config;
mod dupe;
mod policy;
mod relay;
mod server;
mod sni;
mod socks;
mod telemetry;
mod udp;

pub use dupe::Dupe;
pub use policy::{FilterDecision, PolicyStore};
pub use server::{start, Error, ProxyHandle};
pub use sni::extract_sni;
pub use socks::{encode_address, encode_reply, parse_address, TargetAddr};
pub use telemetry::{
    ConnectionSnapshot, DomainSnapshot, EventKind, StatsSnapshot, TrafficEvent, TrafficSnapshot,
};
