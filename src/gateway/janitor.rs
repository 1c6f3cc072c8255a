//! Background garbage collection and coordinated shutdown.
//!
//! Two periodic sweeps run for the life of the process:
//!
//! - **Idle expiry** every 10 minutes: sessions idle for more than 30
//!   minutes are destroyed. The registry snapshot is taken first and the
//!   teardown happens outside any map lock.
//! - **Memory pressure** every 2 minutes: when resident memory crosses
//!   800 MiB, every still-unauthenticated connect attempt is cancelled.
//!   Authenticated sessions are never evicted by pressure; active users
//!   are not collateral.
//!
//! On SIGINT/SIGTERM, [`shutdown`] tears down all sessions in parallel
//! before the HTTP listener stops.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::gateway::config::{
    IDLE_SCAN_INTERVAL, IDLE_SESSION_MAX_AGE, MEMORY_PRESSURE_LIMIT_BYTES, MEMORY_SCAN_INTERVAL,
};
use crate::gateway::context::GatewayContext;
use crate::gateway::session::destroy_session;
use crate::gateway::types::{MemoryUsage, ServerEvent};

/// Spawn both janitor sweeps.
pub fn spawn(ctx: Arc<GatewayContext>) {
    tokio::spawn(idle_sweep(ctx.clone()));
    tokio::spawn(memory_sweep(ctx));
}

async fn idle_sweep(ctx: Arc<GatewayContext>) {
    let mut ticker = tokio::time::interval(IDLE_SCAN_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for session in ctx.registry.list() {
            if is_expired(session.idle_for(), IDLE_SESSION_MAX_AGE) {
                info!(
                    "Session {} idle for {:?}, destroying",
                    session.id(),
                    session.idle_for()
                );
                session.emit(ServerEvent::Ended {
                    message: "SSH session ended due to inactivity".to_string(),
                });
                destroy_session(&ctx, &session).await;
            }
        }
    }
}

/// Whether an idle duration is past the expiry cutoff.
pub(crate) fn is_expired(idle: std::time::Duration, max_age: std::time::Duration) -> bool {
    idle > max_age
}

async fn memory_sweep(ctx: Arc<GatewayContext>) {
    let mut ticker = tokio::time::interval(MEMORY_SCAN_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let usage = read_memory_usage();
        if usage.rss_bytes <= MEMORY_PRESSURE_LIMIT_BYTES {
            continue;
        }

        let pending = ctx.pending.len();
        warn!(
            "Memory pressure: rss {} MiB, cancelling {} unauthenticated connect(s)",
            usage.rss_bytes / (1024 * 1024),
            pending
        );
        for entry in ctx.pending.iter() {
            entry.value().cancel();
        }
    }
}

/// Read resident-set and data-segment sizes for this process.
///
/// Returns zeros on platforms without `/proc`, which disables the
/// pressure sweep rather than guessing.
pub(crate) fn read_memory_usage() -> MemoryUsage {
    std::fs::read_to_string("/proc/self/status")
        .map(|contents| parse_proc_status(&contents))
        .unwrap_or_default()
}

/// Extract `VmRSS` and `VmData` (reported in kB) from `/proc/self/status`.
pub(crate) fn parse_proc_status(contents: &str) -> MemoryUsage {
    let mut usage = MemoryUsage::default();
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            usage.rss_bytes = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmData:") {
            usage.data_bytes = parse_kb(rest);
        }
    }
    usage
}

fn parse_kb(rest: &str) -> u64 {
    rest.trim()
        .trim_end_matches(" kB")
        .trim()
        .parse::<u64>()
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

/// Tear down every session in parallel and clear the registry.
pub async fn shutdown(ctx: &Arc<GatewayContext>) {
    for entry in ctx.pending.iter() {
        entry.value().cancel();
    }

    let sessions = ctx.registry.list();
    info!("Shutting down, closing {} session(s)", sessions.len());
    join_all(
        sessions
            .iter()
            .map(|session| destroy_session(ctx, session)),
    )
    .await;
    ctx.registry.clear();
}
