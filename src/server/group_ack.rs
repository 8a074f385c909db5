//! Per-member delivery of group messages with a bounded retry budget, and the
//! acknowledgment path that drains each member's pending-queue in order.
//!
//! Retry tasks run on a semaphore-bounded pool. When the pool is saturated the
//! member gets a single untracked-for-retry attempt; backfill covers the rest.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::common::models::{GroupId, UserId};
use crate::server::collaborators::GroupMessageStore;
use crate::server::config::ServerConfig;
use crate::server::error::ImError;
use crate::server::registry::Registry;
use crate::server::store::{AckStatus, PresenceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Status was acknowledged, or already drained out of the window.
    Acknowledged { attempts: u32 },
    /// Every attempt went out and the message is still pending.
    Exhausted { attempts: u32 },
    /// The member left the registry before or during delivery.
    Unreachable { attempts: u32 },
    /// The presence store failed; the message stays recoverable via backfill.
    StoreFailed { attempts: u32 },
    /// Retry pool was full, one write was made without scheduling checks.
    Untracked,
}

pub struct GroupAckProtocol {
    registry: Arc<Registry>,
    store: Arc<dyn PresenceStore>,
    messages: Arc<dyn GroupMessageStore>,
    attempts: u32,
    check_delay: Duration,
    window_ttl: Duration,
    permits: Arc<Semaphore>,
}

impl GroupAckProtocol {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn PresenceStore>,
        messages: Arc<dyn GroupMessageStore>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            messages,
            attempts: config.group_send_attempts.max(1),
            check_delay: config.ack_check_delay,
            window_ttl: config.ack_window_ttl,
            permits: Arc::new(Semaphore::new(config.max_inflight_retries.max(1))),
        }
    }

    /// Starts delivery of `frame` to every member that has a live connection
    /// here, skipping `sender_id`. Returns one handle per started delivery.
    pub async fn fan_out(
        self: &Arc<Self>,
        group_id: GroupId,
        seq_id: &str,
        sender_id: UserId,
        members: &[UserId],
        frame: &str,
    ) -> Vec<JoinHandle<DeliveryOutcome>> {
        let mut handles = Vec::new();
        for &member in members {
            if member == sender_id || !self.registry.contains(member).await {
                continue;
            }

            let protocol = Arc::clone(self);
            let seq_id = seq_id.to_string();
            let frame = frame.to_string();

            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => {
                    handles.push(tokio::spawn(async move {
                        let outcome = protocol.deliver(member, group_id, &seq_id, &frame).await;
                        drop(permit);
                        outcome
                    }));
                }
                Err(_) => {
                    warn!("[ACK] Retry pool saturated, single attempt for user {} seq {}", member, seq_id);
                    handles.push(tokio::spawn(async move {
                        protocol.deliver_once(member, group_id, &seq_id, &frame).await
                    }));
                }
            }
        }
        debug!("[ACK] Fan-out of {} in group {} to {} member(s)", seq_id, group_id, handles.len());
        handles
    }

    /// Push-pending, write, wait, check; at most `attempts` rounds.
    pub async fn deliver(&self, member: UserId, group_id: GroupId, seq_id: &str, frame: &str) -> DeliveryOutcome {
        for attempt in 1..=self.attempts {
            if let Err(e) = self.store.push_pending(member, group_id, seq_id, self.window_ttl).await {
                warn!("[ACK] Could not track {} for user {}: {}", seq_id, member, e);
                return DeliveryOutcome::StoreFailed { attempts: attempt };
            }

            match self.registry.send(member, frame).await {
                Ok(()) => {}
                Err(ImError::NotConnected(_)) => {
                    debug!("[ACK] User {} went away, leaving {} to backfill", member, seq_id);
                    return DeliveryOutcome::Unreachable { attempts: attempt };
                }
                Err(e) => warn!("[ACK] Attempt {} of {} to user {} failed: {}", attempt, seq_id, member, e),
            }

            tokio::time::sleep(self.check_delay).await;

            match self.store.ack_status(member, group_id, seq_id).await {
                Ok(Some(AckStatus::Pending)) => continue,
                // gone means drained or expired; either way nothing left to retry
                Ok(_) => return DeliveryOutcome::Acknowledged { attempts: attempt },
                Err(e) => {
                    warn!("[ACK] Status check of {} for user {} failed: {}", seq_id, member, e);
                    return DeliveryOutcome::StoreFailed { attempts: attempt };
                }
            }
        }

        info!("[ACK] Giving up on {} for user {} after {} attempts", seq_id, member, self.attempts);
        DeliveryOutcome::Exhausted { attempts: self.attempts }
    }

    async fn deliver_once(&self, member: UserId, group_id: GroupId, seq_id: &str, frame: &str) -> DeliveryOutcome {
        if let Err(e) = self.store.push_pending(member, group_id, seq_id, self.window_ttl).await {
            warn!("[ACK] Could not track {} for user {}: {}", seq_id, member, e);
            return DeliveryOutcome::StoreFailed { attempts: 1 };
        }
        if let Err(e) = self.registry.send(member, frame).await {
            debug!("[ACK] Untracked write of {} to user {} failed: {}", seq_id, member, e);
        }
        DeliveryOutcome::Untracked
    }

    /// Live ack from `member`. Drains the window atomically and persists the
    /// resulting high-water mark, which is returned.
    pub async fn acknowledge(&self, member: UserId, group_id: GroupId, seq_id: &str) -> Result<Option<String>, ImError> {
        let high_water = self.store.acknowledge(member, group_id, seq_id, self.window_ttl).await?;
        if let Some(seq) = &high_water {
            self.messages.update_last_ack(group_id, member, seq).await?;
            debug!("[ACK] User {} in group {} acknowledged through {}", member, group_id, seq);
        }
        Ok(high_water)
    }

    /// Ack for a message read from backlog. A sequence id the window does not
    /// track was never live-delivered, so the watermark moves directly.
    pub async fn acknowledge_backlog(&self, member: UserId, group_id: GroupId, seq_id: &str) -> Result<Option<String>, ImError> {
        match self.store.ack_status(member, group_id, seq_id).await? {
            Some(_) => self.acknowledge(member, group_id, seq_id).await,
            None => {
                self.messages.update_last_ack(group_id, member, seq_id).await?;
                Ok(Some(seq_id.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::StoredGroupMessage;
    use crate::server::collaborators::InsertOutcome;
    use crate::server::registry::{ChannelTransport, Connection, Transport};
    use crate::server::store::MemoryPresenceStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingMessages {
        acks: Mutex<Vec<(GroupId, UserId, String)>>,
    }

    #[async_trait]
    impl GroupMessageStore for RecordingMessages {
        async fn insert_group_message(&self, _row: &StoredGroupMessage) -> Result<InsertOutcome, ImError> {
            Ok(InsertOutcome::Inserted)
        }

        async fn query_group_messages_after(
            &self,
            _group_id: GroupId,
            _watermark: Option<&str>,
            _exclude_sender: UserId,
        ) -> Result<Vec<StoredGroupMessage>, ImError> {
            Ok(Vec::new())
        }

        async fn last_ack(&self, group_id: GroupId, user_id: UserId) -> Result<Option<String>, ImError> {
            let acks = self.acks.lock().await;
            Ok(acks.iter().rev().find(|(g, u, _)| *g == group_id && *u == user_id).map(|(_, _, s)| s.clone()))
        }

        async fn update_last_ack(&self, group_id: GroupId, user_id: UserId, seq_id: &str) -> Result<(), ImError> {
            self.acks.lock().await.push((group_id, user_id, seq_id.to_string()));
            Ok(())
        }
    }

    struct CountingFailure {
        writes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for CountingFailure {
        async fn write(&mut self, _frame: &str) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("socket reset")
        }

        async fn close(&mut self) {}
    }

    fn config() -> ServerConfig {
        ServerConfig {
            send_retries: 0,
            send_retry_delay: Duration::from_millis(1),
            group_send_attempts: 3,
            ack_check_delay: Duration::from_millis(20),
            ..ServerConfig::default()
        }
    }

    fn protocol(
        config: &ServerConfig,
    ) -> (Arc<GroupAckProtocol>, Arc<Registry>, Arc<MemoryPresenceStore>, Arc<RecordingMessages>) {
        let registry = Arc::new(Registry::from_config(config));
        let store = Arc::new(MemoryPresenceStore::new());
        let messages = Arc::new(RecordingMessages::default());
        let protocol = Arc::new(GroupAckProtocol::new(registry.clone(), store.clone(), messages.clone(), config));
        (protocol, registry, store, messages)
    }

    #[tokio::test]
    async fn failing_member_is_tried_exactly_the_configured_number_of_times() {
        let config = config();
        let (protocol, registry, store, _) = protocol(&config);
        let writes = Arc::new(AtomicUsize::new(0));
        registry.register(Connection::new(2, CountingFailure { writes: writes.clone() })).await;

        let handles = protocol.fan_out(10, "g1", 1, &[1, 2], "frame").await;
        assert_eq!(handles.len(), 1);
        let outcome = handles.into_iter().next().unwrap().await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Exhausted { attempts: 3 });
        assert_eq!(writes.load(Ordering::SeqCst), 3);
        assert_eq!(store.pending_queue(2, 10).await, vec!["g1"]);
    }

    #[tokio::test]
    async fn ack_stops_the_retries() {
        let config = config();
        let (protocol, registry, _store, messages) = protocol(&config);
        let (transport, mut rx) = ChannelTransport::new();
        registry.register(Connection::new(2, transport)).await;

        let handles = protocol.fan_out(10, "g1", 1, &[2], "frame").await;
        assert_eq!(rx.recv().await.as_deref(), Some("frame"));
        assert_eq!(protocol.acknowledge(2, 10, "g1").await.unwrap().as_deref(), Some("g1"));

        let outcome = handles.into_iter().next().unwrap().await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Acknowledged { attempts: 1 });
        assert!(rx.try_recv().is_err());
        assert_eq!(messages.last_ack(10, 2).await.unwrap().as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn offline_members_are_skipped() {
        let config = config();
        let (protocol, _registry, store, _) = protocol(&config);
        let handles = protocol.fan_out(10, "g1", 1, &[2, 3], "frame").await;
        assert!(handles.is_empty());
        assert!(store.pending_queue(2, 10).await.is_empty());
    }

    #[tokio::test]
    async fn out_of_order_acks_only_persist_the_drained_head() {
        let config = config();
        let (protocol, _registry, store, messages) = protocol(&config);
        for seq in ["s1", "s2", "s3"] {
            store.push_pending(4, 10, seq, config.ack_window_ttl).await.unwrap();
        }

        assert_eq!(protocol.acknowledge(4, 10, "s2").await.unwrap(), None);
        assert_eq!(messages.last_ack(10, 4).await.unwrap(), None);
        assert_eq!(protocol.acknowledge(4, 10, "s1").await.unwrap().as_deref(), Some("s2"));
        assert_eq!(messages.last_ack(10, 4).await.unwrap().as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn backlog_ack_of_untracked_message_moves_watermark() {
        let config = config();
        let (protocol, _registry, _store, messages) = protocol(&config);
        assert_eq!(protocol.acknowledge_backlog(6, 10, "old").await.unwrap().as_deref(), Some("old"));
        assert_eq!(messages.last_ack(10, 6).await.unwrap().as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn store_outage_abandons_delivery() {
        let config = config();
        let (protocol, registry, store, _) = protocol(&config);
        let (transport, _rx) = ChannelTransport::new();
        registry.register(Connection::new(2, transport)).await;
        store.set_unavailable(true);

        let outcome = protocol.deliver(2, 10, "g1", "frame").await;
        assert_eq!(outcome, DeliveryOutcome::StoreFailed { attempts: 1 });
    }
}
