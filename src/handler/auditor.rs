//! Background false-negative auditor.
//!
//! Periodically cross-checks the last set of truncated-out IPs against
//! fresh local alerts: a dropped IP that later produced an alert is signal
//! the scorer shed something it shouldn't have.

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::AppState;

/// Spawn the auditor task and return the handle plus a token to stop it.
///
/// Cancellation is cooperative: the task checks the token between ticks and
/// exits promptly, never mid-fetch.
pub fn spawn_auditor(state: AppState) -> (tokio::task::JoinHandle<()>, CancellationToken) {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        run(state, task_cancel).await;
    });
    (handle, cancel)
}

async fn run(state: AppState, cancel: CancellationToken) {
    let config = &state.0.config.effectiveness.false_negative_check;
    if !config.enabled {
        return;
    }
    let mut ticker = interval(config.interval);
    // The first tick fires immediately; skip it so we don't audit before
    // anything has been scored.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("false-negative auditor stopping");
                return;
            }
            _ = ticker.tick() => {
                tick(&state).await;
            }
        }
    }
}

async fn tick(state: &AppState) {
    let dropped = state.dropped_ips_snapshot().await;
    if dropped.is_empty() {
        state.touch_last_check();
        return;
    }

    let lookback = state.0.config.effectiveness.false_negative_check.lookback;
    let query = format!("since={}", humantime::format_duration(lookback));
    match state.0.upstream.get_alerts(Some(&query)).await {
        Ok(alerts) => {
            let mut found = 0u64;
            for alert in &alerts {
                let Some(ip) = alert.source_ip() else {
                    continue;
                };
                if dropped.contains(ip) {
                    found += 1;
                    warn!(
                        ip = %ip,
                        scenario = %alert.scenario,
                        alert_id = alert.id,
                        "false negative: dropped decision produced a local alert"
                    );
                }
            }
            state.record_false_negatives(found);
        }
        Err(err) => {
            warn!(error = %err, "false-negative auditor alert fetch failed");
        }
    }
    state.touch_last_check();
}
