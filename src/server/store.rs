//! Presence store: online set, private offline queues and the per-(member, group)
//! ack windows. Redis in production, an in-process twin for tests and local runs.

use async_trait::async_trait;
use log::debug;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::common::models::{GroupId, UserId};
use crate::server::error::ImError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Pending,
    Acknowledged,
}

impl AckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AckStatus::Pending => "pending",
            AckStatus::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(AckStatus::Pending),
            "acknowledged" => Some(AckStatus::Acknowledged),
            _ => None,
        }
    }
}

pub fn online_users_key() -> &'static str {
    "online-users"
}

pub fn user_chat_key(user_id: UserId) -> String {
    format!("user:{}:chat", user_id)
}

pub fn ack_list_key(user_id: UserId, group_id: GroupId) -> String {
    format!("ack:{}:{}:message_list", user_id, group_id)
}

pub fn ack_status_key(user_id: UserId, group_id: GroupId) -> String {
    format!("ack:{}:{}:message_status", user_id, group_id)
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_online(&self, user_id: UserId) -> Result<(), ImError>;
    async fn set_offline(&self, user_id: UserId) -> Result<(), ImError>;
    async fn is_online(&self, user_id: UserId) -> Result<bool, ImError>;
    async fn online_users(&self) -> Result<Vec<UserId>, ImError>;

    /// Adds an encoded envelope to the user's offline queue, scored by send time.
    async fn enqueue_offline(&self, user_id: UserId, send_time: i64, frame: &str) -> Result<(), ImError>;
    /// Whole offline queue in ascending score order.
    async fn offline_frames(&self, user_id: UserId) -> Result<Vec<String>, ImError>;
    async fn remove_offline(&self, user_id: UserId, frames: &[String]) -> Result<usize, ImError>;

    /// Appends `seq_id` to the member's pending-queue and marks it pending, unless
    /// the window already tracks it. Refreshes the TTL of both structures.
    async fn push_pending(&self, user_id: UserId, group_id: GroupId, seq_id: &str, ttl: Duration) -> Result<(), ImError>;
    /// `None` when the status entry is gone (drained or expired).
    async fn ack_status(&self, user_id: UserId, group_id: GroupId, seq_id: &str) -> Result<Option<AckStatus>, ImError>;
    /// Atomically marks `seq_id` acknowledged and pops every acknowledged head.
    /// Returns the last popped sequence id, the member's new high-water mark.
    async fn acknowledge(&self, user_id: UserId, group_id: GroupId, seq_id: &str, ttl: Duration) -> Result<Option<String>, ImError>;
}

const PUSH_PENDING_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 0 then
    redis.call('RPUSH', KEYS[1], ARGV[1])
    redis.call('HSET', KEYS[2], ARGV[1], 'pending')
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('EXPIRE', KEYS[2], ARGV[2])
return 1
"#;

const ACK_DRAIN_SCRIPT: &str = r#"
redis.call('HSET', KEYS[2], ARGV[1], 'acknowledged')
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('EXPIRE', KEYS[2], ARGV[2])

local last = nil
while true do
    local head = redis.call('LINDEX', KEYS[1], 0)
    if not head then
        break
    end
    if redis.call('HGET', KEYS[2], head) == 'acknowledged' then
        redis.call('LPOP', KEYS[1])
        redis.call('HDEL', KEYS[2], head)
        last = head
    else
        break
    end
end

return last or ""
"#;

pub struct RedisPresenceStore {
    manager: ConnectionManager,
    push_pending: redis::Script,
    ack_drain: redis::Script,
}

impl RedisPresenceStore {
    pub async fn new(redis_url: &str) -> Result<Self, ImError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            push_pending: redis::Script::new(PUSH_PENDING_SCRIPT),
            ack_drain: redis::Script::new(ACK_DRAIN_SCRIPT),
        })
    }

    pub async fn health_check(&self) -> Result<bool, ImError> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_online(&self, user_id: UserId) -> Result<(), ImError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("SADD").arg(online_users_key()).arg(user_id).query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_offline(&self, user_id: UserId) -> Result<(), ImError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("SREM").arg(online_users_key()).arg(user_id).query_async(&mut conn).await?;
        Ok(())
    }

    async fn is_online(&self, user_id: UserId) -> Result<bool, ImError> {
        let mut conn = self.manager.clone();
        let member: bool = redis::cmd("SISMEMBER").arg(online_users_key()).arg(user_id).query_async(&mut conn).await?;
        Ok(member)
    }

    async fn online_users(&self) -> Result<Vec<UserId>, ImError> {
        let mut conn = self.manager.clone();
        let users: Vec<UserId> = redis::cmd("SMEMBERS").arg(online_users_key()).query_async(&mut conn).await?;
        Ok(users)
    }

    async fn enqueue_offline(&self, user_id: UserId, send_time: i64, frame: &str) -> Result<(), ImError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(user_chat_key(user_id))
            .arg(send_time)
            .arg(frame)
            .query_async(&mut conn)
            .await?;
        debug!("[STORE] Queued offline frame for user {} at {}", user_id, send_time);
        Ok(())
    }

    async fn offline_frames(&self, user_id: UserId) -> Result<Vec<String>, ImError> {
        let mut conn = self.manager.clone();
        let frames: Vec<String> = redis::cmd("ZRANGE")
            .arg(user_chat_key(user_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(frames)
    }

    async fn remove_offline(&self, user_id: UserId, frames: &[String]) -> Result<usize, ImError> {
        if frames.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let removed: usize = redis::cmd("ZREM")
            .arg(user_chat_key(user_id))
            .arg(frames)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn push_pending(&self, user_id: UserId, group_id: GroupId, seq_id: &str, ttl: Duration) -> Result<(), ImError> {
        let mut conn = self.manager.clone();
        let _: i64 = self
            .push_pending
            .key(ack_list_key(user_id, group_id))
            .key(ack_status_key(user_id, group_id))
            .arg(seq_id)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ack_status(&self, user_id: UserId, group_id: GroupId, seq_id: &str) -> Result<Option<AckStatus>, ImError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(ack_status_key(user_id, group_id))
            .arg(seq_id)
            .query_async(&mut conn)
            .await?;
        Ok(raw.as_deref().and_then(AckStatus::parse))
    }

    async fn acknowledge(&self, user_id: UserId, group_id: GroupId, seq_id: &str, ttl: Duration) -> Result<Option<String>, ImError> {
        let mut conn = self.manager.clone();
        let last: String = self
            .ack_drain
            .key(ack_list_key(user_id, group_id))
            .key(ack_status_key(user_id, group_id))
            .arg(seq_id)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(if last.is_empty() { None } else { Some(last) })
    }
}

struct AckWindow {
    queue: VecDeque<String>,
    status: HashMap<String, AckStatus>,
    expires_at: Instant,
}

impl AckWindow {
    fn new(ttl: Duration) -> Self {
        Self { queue: VecDeque::new(), status: HashMap::new(), expires_at: Instant::now() + ttl }
    }
}

#[derive(Default)]
struct MemoryState {
    online: HashSet<UserId>,
    chats: HashMap<UserId, Vec<(i64, String)>>,
    windows: HashMap<(UserId, GroupId), AckWindow>,
}

impl MemoryState {
    fn live_window(&mut self, key: (UserId, GroupId)) -> Option<&mut AckWindow> {
        let expired = self.windows.get(&key).map(|w| w.expires_at <= Instant::now()).unwrap_or(false);
        if expired {
            self.windows.remove(&key);
        }
        self.windows.get_mut(&key)
    }
}

/// Single-process store with the same semantics as the Redis one. Every
/// operation runs under one lock, which is what makes `acknowledge` atomic.
#[derive(Default)]
pub struct MemoryPresenceStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a backend outage: every call fails with `ImError::Store` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), ImError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ImError::Store("memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    /// Pending-queue contents, for inspection.
    pub async fn pending_queue(&self, user_id: UserId, group_id: GroupId) -> Vec<String> {
        let mut state = self.state.lock().await;
        state
            .live_window((user_id, group_id))
            .map(|w| w.queue.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_online(&self, user_id: UserId) -> Result<(), ImError> {
        self.check()?;
        self.state.lock().await.online.insert(user_id);
        Ok(())
    }

    async fn set_offline(&self, user_id: UserId) -> Result<(), ImError> {
        self.check()?;
        self.state.lock().await.online.remove(&user_id);
        Ok(())
    }

    async fn is_online(&self, user_id: UserId) -> Result<bool, ImError> {
        self.check()?;
        Ok(self.state.lock().await.online.contains(&user_id))
    }

    async fn online_users(&self) -> Result<Vec<UserId>, ImError> {
        self.check()?;
        Ok(self.state.lock().await.online.iter().copied().collect())
    }

    async fn enqueue_offline(&self, user_id: UserId, send_time: i64, frame: &str) -> Result<(), ImError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let queue = state.chats.entry(user_id).or_default();
        queue.retain(|(_, member)| member != frame);
        queue.push((send_time, frame.to_string()));
        queue.sort();
        Ok(())
    }

    async fn offline_frames(&self, user_id: UserId) -> Result<Vec<String>, ImError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .chats
            .get(&user_id)
            .map(|q| q.iter().map(|(_, member)| member.clone()).collect())
            .unwrap_or_default())
    }

    async fn remove_offline(&self, user_id: UserId, frames: &[String]) -> Result<usize, ImError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(queue) = state.chats.get_mut(&user_id) else {
            return Ok(0);
        };
        let before = queue.len();
        queue.retain(|(_, member)| !frames.contains(member));
        Ok(before - queue.len())
    }

    async fn push_pending(&self, user_id: UserId, group_id: GroupId, seq_id: &str, ttl: Duration) -> Result<(), ImError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let key = (user_id, group_id);
        if state.live_window(key).is_none() {
            state.windows.insert(key, AckWindow::new(ttl));
        }
        if let Some(window) = state.windows.get_mut(&key) {
            if !window.status.contains_key(seq_id) {
                window.queue.push_back(seq_id.to_string());
                window.status.insert(seq_id.to_string(), AckStatus::Pending);
            }
            window.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn ack_status(&self, user_id: UserId, group_id: GroupId, seq_id: &str) -> Result<Option<AckStatus>, ImError> {
        self.check()?;
        let mut state = self.state.lock().await;
        Ok(state.live_window((user_id, group_id)).and_then(|w| w.status.get(seq_id).copied()))
    }

    async fn acknowledge(&self, user_id: UserId, group_id: GroupId, seq_id: &str, ttl: Duration) -> Result<Option<String>, ImError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let key = (user_id, group_id);
        if state.live_window(key).is_none() {
            state.windows.insert(key, AckWindow::new(ttl));
        }
        let Some(window) = state.windows.get_mut(&key) else {
            return Ok(None);
        };
        window.status.insert(seq_id.to_string(), AckStatus::Acknowledged);
        window.expires_at = Instant::now() + ttl;

        let mut last = None;
        while let Some(head) = window.queue.front() {
            if window.status.get(head) != Some(&AckStatus::Acknowledged) {
                break;
            }
            if let Some(head) = window.queue.pop_front() {
                window.status.remove(&head);
                last = Some(head);
            }
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn ack_drain_stops_at_first_gap() {
        let store = MemoryPresenceStore::new();
        for seq in ["s1", "s2", "s3", "s4", "s5"] {
            store.push_pending(9, 1, seq, TTL).await.unwrap();
        }

        assert_eq!(store.acknowledge(9, 1, "s2", TTL).await.unwrap(), None);
        assert_eq!(store.acknowledge(9, 1, "s1", TTL).await.unwrap().as_deref(), Some("s2"));
        assert_eq!(store.acknowledge(9, 1, "s3", TTL).await.unwrap().as_deref(), Some("s3"));
        assert_eq!(store.acknowledge(9, 1, "s5", TTL).await.unwrap(), None);
        assert_eq!(store.pending_queue(9, 1).await, vec!["s4", "s5"]);
        assert_eq!(store.acknowledge(9, 1, "s4", TTL).await.unwrap().as_deref(), Some("s5"));
        assert!(store.pending_queue(9, 1).await.is_empty());
    }

    #[tokio::test]
    async fn repeated_push_does_not_duplicate_or_regress_status() {
        let store = MemoryPresenceStore::new();
        store.push_pending(2, 3, "a", TTL).await.unwrap();
        store.push_pending(2, 3, "b", TTL).await.unwrap();
        store.acknowledge(2, 3, "b", TTL).await.unwrap();
        store.push_pending(2, 3, "b", TTL).await.unwrap();
        store.push_pending(2, 3, "a", TTL).await.unwrap();

        assert_eq!(store.pending_queue(2, 3).await, vec!["a", "b"]);
        assert_eq!(store.ack_status(2, 3, "b").await.unwrap(), Some(AckStatus::Acknowledged));
        assert_eq!(store.ack_status(2, 3, "a").await.unwrap(), Some(AckStatus::Pending));
    }

    #[tokio::test]
    async fn window_expires_after_ttl() {
        let store = MemoryPresenceStore::new();
        store.push_pending(1, 1, "x", Duration::from_millis(20)).await.unwrap();
        assert_eq!(store.ack_status(1, 1, "x").await.unwrap(), Some(AckStatus::Pending));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.ack_status(1, 1, "x").await.unwrap(), None);
        assert!(store.pending_queue(1, 1).await.is_empty());
    }

    #[test]
    fn scripts_refresh_ttl_of_queue_and_status() {
        for script in [PUSH_PENDING_SCRIPT, ACK_DRAIN_SCRIPT] {
            assert!(script.contains("redis.call('EXPIRE', KEYS[1], ARGV[2])"));
            assert!(script.contains("redis.call('EXPIRE', KEYS[2], ARGV[2])"));
        }
    }

    #[tokio::test]
    async fn acknowledge_keeps_the_pending_queue_alive() {
        let store = MemoryPresenceStore::new();
        let ttl = Duration::from_millis(60);
        store.push_pending(1, 1, "a", ttl).await.unwrap();
        store.push_pending(1, 1, "b", ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.acknowledge(1, 1, "b", ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // past the push TTL but within the one refreshed by the ack
        assert_eq!(store.pending_queue(1, 1).await, vec!["a", "b"]);
        assert_eq!(store.acknowledge(1, 1, "a", ttl).await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn offline_queue_is_ordered_by_send_time() {
        let store = MemoryPresenceStore::new();
        store.enqueue_offline(4, 300, "late").await.unwrap();
        store.enqueue_offline(4, 100, "early").await.unwrap();
        store.enqueue_offline(4, 200, "middle").await.unwrap();
        assert_eq!(store.offline_frames(4).await.unwrap(), vec!["early", "middle", "late"]);

        let removed = store.remove_offline(4, &["middle".to_string(), "missing".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.offline_frames(4).await.unwrap(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn outage_surfaces_as_store_error() {
        let store = MemoryPresenceStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.is_online(1).await, Err(ImError::Store(_))));
        store.set_unavailable(false);
        assert!(!store.is_online(1).await.unwrap());
    }

    #[test]
    fn keys_follow_the_shared_schema() {
        assert_eq!(user_chat_key(5), "user:5:chat");
        assert_eq!(ack_list_key(5, 8), "ack:5:8:message_list");
        assert_eq!(ack_status_key(5, 8), "ack:5:8:message_status");
    }
}
