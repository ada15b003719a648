use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HubResult;
use crate::hub::Hub;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    pub sessions_expired: usize,
    pub sanctions_expired: usize,
    pub rate_windows_pruned: usize,
    pub slots_pruned: usize,
}

/// Background task that expires stale session rows and sanctions and trims
/// in-memory state nobody is using. Stops when `shutdown` is cancelled.
pub async fn run_reaper_loop(hub: Hub, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("reaper stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        match reap_once(&hub).await {
            Ok(stats) => {
                if stats.sessions_expired > 0 || stats.sanctions_expired > 0 {
                    info!(
                        sessions = stats.sessions_expired,
                        sanctions = stats.sanctions_expired,
                        "reaper: expired stale records"
                    );
                }
                debug!(?stats, "reaper pass finished");
            }
            Err(e) => warn!("reaper error: {}", e),
        }
    }
}

pub async fn reap_once(hub: &Hub) -> HubResult<ReapStats> {
    let now = Utc::now();
    let sessions_expired = hub
        .store("expire_sessions", move |db| db.expire_sessions(now))
        .await?;
    let sanctions_expired = hub
        .store("expire_sanctions", move |db| db.expire_sanctions(now))
        .await?;

    Ok(ReapStats {
        sessions_expired,
        sanctions_expired,
        rate_windows_pruned: hub.rate_limiter().prune(std::time::Instant::now()).await,
        slots_pruned: hub.registry().prune_idle_slots().await,
    })
}
