//! Background tasks for the Ringline server.
//!
//! Includes:
//! - Reaping calls that exceed the maximum call duration.

use std::sync::Arc;

use tokio::time::{sleep, Duration};

use crate::orchestrator::Orchestrator;

/// Starts the max-duration reaper.
///
/// Runs indefinitely, checking every `max_duration_secs / 2` seconds (clamped
/// to 1..=30) for live calls that have outlived the limit.
pub async fn start_reaper_task(orchestrator: Arc<Orchestrator>, max_duration_secs: u64) {
    if max_duration_secs == 0 {
        tracing::warn!("call reaper disabled (max_duration_secs=0)");
        return;
    }

    let interval_seconds = (max_duration_secs / 2).clamp(1, 30);
    let interval = Duration::from_secs(interval_seconds);

    tracing::info!(
        max_duration_secs,
        interval_seconds,
        "starting call reaper task"
    );

    loop {
        sleep(interval).await;

        let reaped = orchestrator.reap_expired_calls().await;
        if reaped > 0 {
            tracing::info!(count = reaped, "timed out calls past max duration");
        }
    }
}
