use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::node::KademliaNode;

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub replicated: usize,
    pub refreshed: usize,
}

/// Runs [`KademliaNode::run_maintenance`] every `period` until aborted.
pub(crate) async fn run(node: KademliaNode, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let report = node.run_maintenance().await;
        trace!(?report, "Maintenance pass done");
    }
}

impl KademliaNode {
    /// Drops expired records, pushes records whose replication interval has
    /// elapsed to the nodes closest to their key and refreshes stale buckets.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let expired = self.store().write().await.remove_expired();
        if expired > 0 {
            debug!("Removed {expired} expired records");
        }

        MaintenanceReport {
            expired,
            replicated: self.replicate_due_records().await,
            refreshed: self.refresh_stale_buckets().await,
        }
    }

    async fn replicate_due_records(&self) -> usize {
        let due = self.store().read().await.keys_due_for_replication();
        let mut replicated = 0;

        for key in due {
            let record = match self.store().read().await.get(&key) {
                Ok(record) => record.clone(),
                // Expired or removed in the meantime.
                Err(_) => continue,
            };

            let peers = self.lookup_nodes(&key).await;
            let stored = self
                .replicate(
                    key,
                    record.value,
                    record.expires,
                    record.replication_interval,
                    peers,
                )
                .await;

            debug!(%key, "Replicated record to {} nodes", stored.len());
            self.store().write().await.mark_replicated(&key);
            replicated += 1;
        }

        replicated
    }

    async fn refresh_stale_buckets(&self) -> usize {
        let stale = self
            .routing_table()
            .read()
            .await
            .stale_buckets(self.config().refresh_interval());

        for &index in &stale {
            let found = self.refresh_bucket(index).await;
            trace!(bucket = index, "Refreshed bucket, {} nodes found", found.len());
        }

        stale.len()
    }
}
