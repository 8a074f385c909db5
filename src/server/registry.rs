//! Sharded map from user id to the user's single live connection.
//!
//! Membership changes take one shard's lock; transport writes take only the
//! connection's own lock, so a slow socket never stalls a shard.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use uuid::Uuid;

use crate::common::models::UserId;
use crate::server::config::ServerConfig;
use crate::server::error::ImError;

/// Outbound half of a client session. Implementations are not required to be
/// safe for concurrent writes; `Connection` serializes them.
#[async_trait]
pub trait Transport: Send {
    async fn write(&mut self, frame: &str) -> anyhow::Result<()>;
    async fn close(&mut self);
}

/// Transport backed by an unbounded channel, drained by whoever holds the receiver.
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&mut self, frame: &str) -> anyhow::Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| anyhow::anyhow!("transport closed"))?;
        tx.send(frame.to_string()).map_err(|_| anyhow::anyhow!("receiver dropped"))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Connection {
    id: Uuid,
    user_id: UserId,
    transport: Mutex<Box<dyn Transport>>,
    write_timeout: Duration,
    last_active: AtomicI64,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Connection {
    pub fn new<T: Transport + 'static>(user_id: UserId, transport: T) -> Arc<Self> {
        Self::with_write_timeout(user_id, transport, DEFAULT_WRITE_TIMEOUT)
    }

    pub fn with_write_timeout<T: Transport + 'static>(user_id: UserId, transport: T, write_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            transport: Mutex::new(Box::new(transport)),
            write_timeout,
            last_active: AtomicI64::new(now_millis()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn touch(&self) {
        self.last_active.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_active(&self, millis: i64) {
        self.last_active.store(millis, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A write that does not finish within the write timeout counts as failed.
    pub async fn write(&self, frame: &str) -> anyhow::Result<()> {
        if self.is_closed() {
            anyhow::bail!("connection {} is closed", self.id);
        }
        let mut transport = self.transport.lock().await;
        let result = match tokio::time::timeout(self.write_timeout, transport.write(frame)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("write timed out after {:?}", self.write_timeout)),
        };
        // close() skipped the transport while we held it
        if self.is_closed() {
            let _ = tokio::time::timeout(self.write_timeout, transport.close()).await;
        }
        result
    }

    /// Idempotent and never waits behind an in-flight write: if the transport
    /// is busy, the writer closes it when it lets go.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_one();
        if let Ok(mut transport) = self.transport.try_lock() {
            let _ = tokio::time::timeout(self.write_timeout, transport.close()).await;
        }
    }

    /// Resolves once `close` has been called, even if it happened earlier.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.shutdown.notified().await;
    }
}

type Shard = RwLock<HashMap<UserId, Arc<Connection>>>;

pub struct Registry {
    shards: Vec<Shard>,
    send_retries: u32,
    send_retry_delay: Duration,
    max_idle_gap: Duration,
}

impl Registry {
    pub fn new(shard_count: usize, send_retries: u32, send_retry_delay: Duration, max_idle_gap: Duration) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| RwLock::new(HashMap::new())).collect();
        Self { shards, send_retries, send_retry_delay, max_idle_gap }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.shard_count, config.send_retries, config.send_retry_delay, config.max_idle_gap)
    }

    fn shard(&self, user_id: UserId) -> &Shard {
        &self.shards[(user_id % self.shards.len() as u64) as usize]
    }

    /// Inserts `connection`, closing and returning whatever it replaced.
    pub async fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let user_id = connection.user_id();
        let previous = {
            let mut shard = self.shard(user_id).write().await;
            shard.insert(user_id, connection.clone())
        };
        info!("[REGISTRY] Registered connection {} for user {}", connection.id(), user_id);
        if let Some(old) = &previous {
            if old.id() != connection.id() {
                info!("[REGISTRY] Replacing connection {} for user {}", old.id(), user_id);
                old.close().await;
            }
        }
        previous
    }

    pub async fn lookup(&self, user_id: UserId) -> Option<Arc<Connection>> {
        self.shard(user_id).read().await.get(&user_id).cloned()
    }

    pub async fn contains(&self, user_id: UserId) -> bool {
        self.shard(user_id).read().await.contains_key(&user_id)
    }

    /// Closes and deletes the user's connection. Safe on a missing entry.
    pub async fn remove(&self, user_id: UserId) -> bool {
        let removed = self.shard(user_id).write().await.remove(&user_id);
        match removed {
            Some(connection) => {
                connection.close().await;
                info!("[REGISTRY] Removed connection {} for user {}", connection.id(), user_id);
                true
            }
            None => false,
        }
    }

    /// Like `remove`, but only if the entry is still the given connection.
    pub async fn remove_connection(&self, user_id: UserId, connection_id: Uuid) -> bool {
        let removed = {
            let mut shard = self.shard(user_id).write().await;
            match shard.get(&user_id) {
                Some(current) if current.id() == connection_id => shard.remove(&user_id),
                _ => None,
            }
        };
        match removed {
            Some(connection) => {
                connection.close().await;
                debug!("[REGISTRY] Removed connection {} for user {}", connection_id, user_id);
                true
            }
            None => false,
        }
    }

    pub async fn touch(&self, user_id: UserId) {
        if let Some(connection) = self.lookup(user_id).await {
            connection.touch();
        }
    }

    /// Writes one frame, retrying `send_retries` extra times with a fixed delay.
    pub async fn send(&self, user_id: UserId, frame: &str) -> Result<(), ImError> {
        let connection = self.lookup(user_id).await.ok_or(ImError::NotConnected(user_id))?;
        let mut reason = String::new();
        for attempt in 0..=self.send_retries {
            if attempt > 0 {
                tokio::time::sleep(self.send_retry_delay).await;
            }
            match connection.write(frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("[REGISTRY] Write to user {} failed (attempt {}): {}", user_id, attempt + 1, e);
                    reason = e.to_string();
                }
            }
            if connection.is_closed() {
                break;
            }
        }
        Err(ImError::Transport { user: user_id, reason })
    }

    pub async fn sweep(&self) -> Vec<UserId> {
        self.sweep_at(now_millis()).await
    }

    /// Evicts connections idle since before `now - max_idle_gap`. Candidates are
    /// collected under the read lock and re-checked under the write lock, so a
    /// connection touched in between survives.
    pub async fn sweep_at(&self, now: i64) -> Vec<UserId> {
        let cutoff = now - self.max_idle_gap.as_millis() as i64;
        let mut evicted = Vec::new();

        for shard in &self.shards {
            let candidates: Vec<Arc<Connection>> = {
                let map = shard.read().await;
                map.values().filter(|c| c.last_active() < cutoff).cloned().collect()
            };
            if candidates.is_empty() {
                continue;
            }

            let mut doomed = Vec::new();
            {
                let mut map = shard.write().await;
                for candidate in candidates {
                    let user_id = candidate.user_id();
                    let still_idle = map
                        .get(&user_id)
                        .map(|current| Arc::ptr_eq(current, &candidate) && current.last_active() < cutoff)
                        .unwrap_or(false);
                    if still_idle {
                        map.remove(&user_id);
                        doomed.push(candidate);
                    }
                }
            }

            for connection in doomed {
                connection.close().await;
                info!("[REGISTRY] Evicted idle connection {} for user {}", connection.id(), connection.user_id());
                evicted.push(connection.user_id());
            }
        }
        evicted
    }

    pub async fn users(&self) -> Vec<UserId> {
        let mut users = Vec::new();
        for shard in &self.shards {
            users.extend(shard.read().await.keys().copied());
        }
        users
    }

    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> Registry {
        Registry::new(4, 2, Duration::from_millis(5), Duration::from_secs(60))
    }

    struct FailingTransport {
        writes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn write(&mut self, _frame: &str) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("broken pipe")
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn registering_twice_closes_the_first_connection() {
        let registry = registry();
        let (first, mut first_rx) = ChannelTransport::new();
        let (second, mut second_rx) = ChannelTransport::new();
        let a = Connection::new(7, first);
        let b = Connection::new(7, second);

        assert!(registry.register(a.clone()).await.is_none());
        let replaced = registry.register(b.clone()).await.unwrap();
        assert_eq!(replaced.id(), a.id());
        assert!(a.is_closed());
        assert_eq!(registry.lookup(7).await.unwrap().id(), b.id());

        registry.send(7, "hello").await.unwrap();
        assert_eq!(second_rx.recv().await.as_deref(), Some("hello"));
        assert!(first_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn users_land_in_distinct_shards_without_interference() {
        let registry = registry();
        for user in 1..=8u64 {
            let (transport, _rx) = ChannelTransport::new();
            registry.register(Connection::new(user, transport)).await;
        }
        assert_eq!(registry.len().await, 8);
        assert!(registry.remove(3).await);
        assert!(!registry.remove(3).await);
        assert!(registry.lookup(3).await.is_none());
        assert!(registry.lookup(7).await.is_some());
    }

    #[tokio::test]
    async fn send_to_unknown_user_is_not_connected() {
        let registry = registry();
        assert!(matches!(registry.send(99, "x").await, Err(ImError::NotConnected(99))));
    }

    #[tokio::test]
    async fn send_gives_up_after_two_extra_attempts() {
        let registry = registry();
        let writes = Arc::new(AtomicUsize::new(0));
        registry.register(Connection::new(5, FailingTransport { writes: writes.clone() })).await;

        let result = registry.send(5, "x").await;
        assert!(matches!(result, Err(ImError::Transport { user: 5, .. })));
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn remove_connection_ignores_a_replaced_entry() {
        let registry = registry();
        let (t1, _r1) = ChannelTransport::new();
        let (t2, _r2) = ChannelTransport::new();
        let old = Connection::new(4, t1);
        let new = Connection::new(4, t2);
        registry.register(old.clone()).await;
        registry.register(new.clone()).await;

        assert!(!registry.remove_connection(4, old.id()).await);
        assert_eq!(registry.lookup(4).await.unwrap().id(), new.id());
        assert!(registry.remove_connection(4, new.id()).await);
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_connections() {
        let registry = registry();
        let (idle_t, _idle_rx) = ChannelTransport::new();
        let (fresh_t, _fresh_rx) = ChannelTransport::new();
        let idle = Connection::new(1, idle_t);
        let fresh = Connection::new(2, fresh_t);
        let now = now_millis();
        idle.set_last_active(now - 61_000);
        registry.register(idle.clone()).await;
        registry.register(fresh.clone()).await;

        let evicted = registry.sweep_at(now).await;
        assert_eq!(evicted, vec![1]);
        assert!(idle.is_closed());
        assert!(!fresh.is_closed());
        assert!(registry.lookup(2).await.is_some());
    }

    #[tokio::test]
    async fn touched_connection_survives_concurrent_sweeps() {
        let registry = Arc::new(registry());
        let (t, _rx) = ChannelTransport::new();
        let conn = Connection::new(11, t);
        registry.register(conn.clone()).await;
        registry.touch(11).await;

        let now = now_millis();
        let sweeps: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.sweep_at(now).await })
            })
            .collect();
        for sweep in sweeps {
            assert!(sweep.await.unwrap().is_empty());
        }
        assert!(!conn.is_closed());
    }

    struct StuckTransport;

    #[async_trait]
    impl Transport for StuckTransport {
        async fn write(&mut self, _frame: &str) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn stalled_peer_does_not_block_sweep_or_send() {
        let registry = Arc::new(Registry::new(4, 0, Duration::from_millis(1), Duration::from_secs(60)));
        let stuck = Connection::with_write_timeout(1, StuckTransport, Duration::from_millis(100));
        let (t, _rx) = ChannelTransport::new();
        let other = Connection::new(2, t);
        registry.register(stuck.clone()).await;
        registry.register(other.clone()).await;

        let sending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.send(1, "x").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let now = now_millis();
        stuck.set_last_active(now - 61_000);
        other.set_last_active(now - 61_000);
        let evicted = tokio::time::timeout(Duration::from_secs(1), registry.sweep_at(now))
            .await
            .unwrap();
        assert_eq!(evicted.len(), 2);
        assert!(stuck.is_closed());
        assert!(other.is_closed());

        let result = tokio::time::timeout(Duration::from_secs(1), sending).await.unwrap().unwrap();
        assert!(matches!(result, Err(ImError::Transport { user: 1, .. })));
    }

    #[tokio::test]
    async fn users_lists_every_shard() {
        let registry = registry();
        for user in [1u64, 2, 7] {
            let (t, _rx) = ChannelTransport::new();
            registry.register(Connection::new(user, t)).await;
        }
        let mut users = registry.users().await;
        users.sort();
        assert_eq!(users, vec![1, 2, 7]);
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let (t, _rx) = ChannelTransport::new();
        let conn = Connection::new(3, t);
        conn.close().await;
        conn.closed().await;
        assert!(conn.write("late").await.is_err());
    }
}
