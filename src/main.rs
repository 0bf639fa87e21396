//! Standalone harness for the filtering SOCKS5 proxy.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(missing_docs, missing_debug_implementations)]
#![forbid(unsafe_code)]

mod arg;

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter, fmt, prelude::*, reload};
use warden_proxy::PolicyStore;

const QUIET_QUIET_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::ERROR;
const QUIET_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::WARN;
const DEFAULT_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::INFO;
const VERBOSE_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::DEBUG;
const VERBOSE_VERBOSE_LOG_LEVEL: filter::LevelFilter = filter::LevelFilter::TRACE;

#[cfg(feature = "deadlock-detection")]
fn spawn_deadlock_detection() {
    use std::thread;

    // Create a background thread which checks for deadlocks every 10s
    thread::spawn(move || loop {
        thread::sleep(std::time::Duration::from_secs(10));
        let deadlocks = parking_lot::deadlock::check_deadlock();
        if deadlocks.is_empty() {
            continue;
        }

        error!("{} deadlocks detected", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            error!("Deadlock #{}", i);
            for t in threads {
                error!("Thread Id {:#?}", t.thread_id());
                error!("{:#?}", t.backtrace());
            }
        }
    });
}

/// Real entry point
async fn main_real() -> Result<(), warden_proxy::Error> {
    let reload_handle = {
        let fmt_layer = fmt::Layer::default()
            .compact()
            .with_timer(fmt::time::time())
            .with_writer(std::io::stderr);
        let (level_layer, reload_handle) = reload::Layer::new(DEFAULT_LOG_LEVEL);
        tracing_subscriber::registry()
            .with(level_layer)
            .with(fmt_layer)
            .init();
        reload_handle
    };
    let cli_args = arg::WardenCli::parse();
    match cli_args.verbose {
        0 => {}
        1 => reload_handle
            .reload(VERBOSE_LOG_LEVEL)
            .expect("Resetting log level failed (this is a bug)"),
        _ => reload_handle
            .reload(VERBOSE_VERBOSE_LOG_LEVEL)
            .expect("Resetting log level failed (this is a bug)"),
    };
    match cli_args.quiet {
        0 => {}
        1 => reload_handle
            .reload(QUIET_LOG_LEVEL)
            .expect("Resetting log level failed (this is a bug)"),
        _ => reload_handle
            .reload(QUIET_QUIET_LOG_LEVEL)
            .expect("Resetting log level failed (this is a bug)"),
    };
    #[cfg(feature = "deadlock-detection")]
    spawn_deadlock_detection();

    let policy = Arc::new(PolicyStore::new());
    policy.set_enabled(!cli_args.no_filter);
    for (domain, threshold) in &cli_args.rules {
        policy.set_threshold(domain.clone(), *threshold);
    }

    let proxy = warden_proxy::start(policy, cli_args.telemetry).await?;
    // The one-time port report for whoever launched us.
    println!("{}", proxy.port());
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    let stats = proxy.stats();
    proxy.stop().await;
    info!(
        "final: conns={} allowed={} blocked={} udp={} errors={}",
        stats.total_conns, stats.tcp_allowed, stats.tcp_blocked, stats.udp_relayed, stats.errors
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = main_real().await {
        error!("Giving up: {e}");
        std::process::exit(1);
    }
}
