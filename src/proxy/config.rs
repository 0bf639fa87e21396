//! Proxy tunables.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::time::Duration;

/// Size of one relay pump read.
pub const RELAY_BUFFER_SIZE: usize = 65536;

/// Wall-clock cap on a TCP relay, armed once at relay start.
pub const TCP_RELAY_TIMEOUT: Duration = Duration::from_secs(120);

/// How long one forwarded datagram may wait for its single reply.
pub const UDP_RELAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum concurrently live client connections.
pub const MAX_CONNECTIONS: usize = 500;

/// FWD_UDP frames must be `1..=MAX_UDP_FRAME` bytes.
pub const MAX_UDP_FRAME: u16 = 9000;

/// Telemetry snapshot cadence.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Operational counter log cadence.
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Snapshot history ring size (5 minutes at 1 Hz).
pub const SNAPSHOT_HISTORY: usize = 300;

/// Event log ring size; oldest entries are dropped.
pub const EVENT_LOG_CAP: usize = 500;

/// Domains reported per snapshot.
pub const TOP_DOMAINS: usize = 10;

/// How long a closed relay stays visible to snapshots.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How long `stop` waits for connections to drain through their close
/// paths before aborting the stragglers.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
