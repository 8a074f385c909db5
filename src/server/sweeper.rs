//! Periodic idle eviction. Each cycle also reconciles the online set with the
//! registry in both directions: markers for users with no live connection on
//! this node are dropped, and live users missing a marker get it back. A
//! reconnect that races an offline write is therefore repaired within one cycle.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::common::models::UserId;
use crate::server::error::ImError;
use crate::server::registry::Registry;
use crate::server::store::PresenceStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<UserId>,
    pub reconciled: Vec<UserId>,
    pub restored: Vec<UserId>,
}

pub async fn sweep_once(registry: &Registry, store: &dyn PresenceStore) -> Result<SweepReport, ImError> {
    let evicted = registry.sweep().await;
    for user_id in &evicted {
        // reconnected while the sweep ran
        if registry.contains(*user_id).await {
            continue;
        }
        store.set_offline(*user_id).await?;
    }

    let online = store.online_users().await?;
    let mut reconciled = Vec::new();
    for user_id in &online {
        if evicted.contains(user_id) || registry.contains(*user_id).await {
            continue;
        }
        store.set_offline(*user_id).await?;
        reconciled.push(*user_id);
    }

    let mut restored = Vec::new();
    for user_id in registry.users().await {
        if online.contains(&user_id) {
            continue;
        }
        store.set_online(user_id).await?;
        restored.push(user_id);
    }

    Ok(SweepReport { evicted, reconciled, restored })
}

pub fn spawn(registry: Arc<Registry>, store: Arc<dyn PresenceStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("[SWEEP] Running every {:?}", interval);
        loop {
            tokio::time::sleep(interval).await;
            match sweep_once(&registry, store.as_ref()).await {
                Ok(report) if report == SweepReport::default() => {
                    debug!("[SWEEP] Nothing to do");
                }
                Ok(report) => info!(
                    "[SWEEP] Evicted {:?}, cleared stale presence {:?}, restored presence {:?}",
                    report.evicted, report.reconciled, report.restored
                ),
                Err(e) => warn!("[SWEEP] Cycle failed: {}", e),
            }
        }
    })
}
