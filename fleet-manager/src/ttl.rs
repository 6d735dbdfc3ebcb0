use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::{info, instrument};

use crate::metrics;
use crate::registry::Registry;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Drives the liveness state machine (§4.3): every 30s, classify every node
/// against `stale_threshold`/`dead_threshold`; nodes crossing into `dead`
/// are disconnected, and (if enabled) issued a best-effort shutdown command
/// on whatever stream happens to still be attached.
#[instrument(skip_all)]
pub async fn run(registry: Arc<Registry>, stale_threshold: Duration, dead_threshold: Duration, auto_terminate_dead: bool) {
    let stale = ChronoDuration::from_std(stale_threshold).expect("stale_threshold fits in chrono::Duration");
    let dead = ChronoDuration::from_std(dead_threshold).expect("dead_threshold fits in chrono::Duration");

    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    loop {
        ticker.tick().await;
        let newly_dead = registry.reconcile_ttl(stale, dead);
        for node_id in &newly_dead {
            info!(node_id, "node crossed into dead, disconnected");
            if auto_terminate_dead {
                let sent = registry.send_shutdown_command(node_id, "ttl_reconciler: dead_threshold exceeded");
                metrics::COMMANDS_SENT
                    .with_label_values(&["shutdown", if sent { "enqueued" } else { "no_stream" }])
                    .inc();
            }
        }
        metrics::observe_fleet(&registry);
    }
}
