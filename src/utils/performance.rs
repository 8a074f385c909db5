use chrono::Utc;
use log::{error, info, warn};
use std::{fs::OpenOptions, io::Write, sync::Arc, time::Duration};
use sysinfo::System;
use tokio::time;

use crate::server::database::Database;
use crate::server::registry::Registry;
use crate::server::store::PresenceStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub connections: usize,
    pub online: i64,
    pub group_messages: i64,
    pub cpu_usage: f32,
}

impl Snapshot {
    pub fn csv_line(&self, timestamp: &str) -> String {
        format!(
            "{}, {}, {}, {}, {:.1}%",
            timestamp, self.connections, self.online, self.group_messages, self.cpu_usage
        )
    }
}

/// Counters that fail to load are reported as -1 rather than skipping the line.
pub async fn collect(system: &mut System, registry: &Registry, store: &dyn PresenceStore, db: &Database) -> Snapshot {
    system.refresh_cpu();
    let cpus = system.cpus();
    let cpu_usage = if cpus.is_empty() {
        0.0
    } else {
        cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
    };

    let online = match store.online_users().await {
        Ok(users) => users.len() as i64,
        Err(e) => {
            warn!("[PERF] Failed to read online set: {}", e);
            -1
        }
    };
    let group_messages = match db.count_group_messages().await {
        Ok(count) => count,
        Err(e) => {
            warn!("[PERF] Failed to count group messages: {}", e);
            -1
        }
    };

    Snapshot { connections: registry.len().await, online, group_messages, cpu_usage }
}

pub async fn start_performance_logger(
    registry: Arc<Registry>,
    store: Arc<dyn PresenceStore>,
    db: Arc<Database>,
    log_path: &str,
    interval: Duration,
) {
    let mut system = System::new();

    if let Some(parent) = std::path::Path::new(log_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let mut file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("[PERF] Unable to open performance log file '{}': {}", log_path, e);
            return;
        }
    };

    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        if let Err(e) = writeln!(file, "# Timestamp, Connections, Online, Group_Messages, CPU_Usage") {
            error!("[PERF] Failed to write header to performance log: {}", e);
            return;
        }
        info!("[PERF] Performance log initialized: {}", log_path);
    }

    loop {
        let snapshot = collect(&mut system, &registry, store.as_ref(), &db).await;
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

        info!(
            "[PERF] Connections: {}, Online: {}, Group messages: {}, CPU: {:.1}%",
            snapshot.connections, snapshot.online, snapshot.group_messages, snapshot.cpu_usage
        );

        if let Err(e) = writeln!(file, "{}", snapshot.csv_line(&timestamp)) {
            error!("[PERF] Failed to write to performance log: {}", e);
        } else if let Err(e) = file.flush() {
            error!("[PERF] Failed to flush performance log: {}", e);
        }

        time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::ServerConfig;
    use crate::server::registry::{ChannelTransport, Connection};
    use crate::server::store::MemoryPresenceStore;

    #[tokio::test]
    async fn snapshot_counts_connections_and_presence() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let registry = Registry::from_config(&ServerConfig::default());
        let store = MemoryPresenceStore::new();
        let (t, _rx) = ChannelTransport::new();
        registry.register(Connection::new(1, t)).await;
        store.set_online(1).await.unwrap();
        store.set_online(2).await.unwrap();

        let mut system = System::new();
        let snapshot = collect(&mut system, &registry, &store, &db).await;
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.online, 2);
        assert_eq!(snapshot.group_messages, 0);
        assert!(snapshot.csv_line("t").starts_with("t, 1, 2, 0, "));
    }
}
