use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::common::models::{
    Ack, CallRoute, Command, Envelope, GroupMessage, Inbound, PrivateMessage, StoredGroupMessage, UserId,
};
use crate::server::collaborators::{Directory, GroupMessageStore, InsertOutcome};
use crate::server::config::ServerConfig;
use crate::server::error::ImError;
use crate::server::group_ack::GroupAckProtocol;
use crate::server::registry::Registry;
use crate::server::store::PresenceStore;

fn malformed(e: serde_json::Error) -> ImError {
    ImError::Malformed(e.to_string())
}

/// Routes every inbound envelope of an authenticated connection.
pub struct Dispatcher {
    registry: Arc<Registry>,
    store: Arc<dyn PresenceStore>,
    directory: Arc<dyn Directory>,
    messages: Arc<dyn GroupMessageStore>,
    group_ack: Arc<GroupAckProtocol>,
    max_message_length: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn PresenceStore>,
        directory: Arc<dyn Directory>,
        messages: Arc<dyn GroupMessageStore>,
        group_ack: Arc<GroupAckProtocol>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            directory,
            messages,
            group_ack,
            max_message_length: config.max_message_length,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }

    /// Handles one raw frame from `sender`. Malformed input, unknown commands
    /// and failed best-effort writes are absorbed; only backend failures
    /// come back as errors.
    pub async fn handle(&self, sender: UserId, raw: &str) -> Result<(), ImError> {
        match self.dispatch(sender, raw).await {
            Err(e) if e.is_recoverable() => {
                debug!("[DISPATCH] Absorbed for user {}: {}", sender, e);
                Ok(())
            }
            other => other,
        }
    }

    async fn dispatch(&self, sender: UserId, raw: &str) -> Result<(), ImError> {
        if raw.len() > self.max_message_length {
            return Err(ImError::Malformed(format!("frame of {} bytes exceeds limit", raw.len())));
        }
        let envelope = Envelope::decode(raw).map_err(malformed)?;
        self.registry.touch(sender).await;

        match envelope.inbound().map_err(malformed)? {
            Inbound::Heartbeat => self.registry.send(sender, raw).await,
            Inbound::Private(message) => self.private_message(sender, message).await,
            Inbound::Group(message) => self.group_message(sender, message).await,
            Inbound::Ack(ack) => self.ack(sender, ack, raw).await,
            Inbound::CallSignal(cmd, route) => {
                self.call_signal(cmd, route, raw).await;
                Ok(())
            }
            Inbound::Reserved(cmd) => {
                debug!("[DISPATCH] Ignoring reserved command {:?} from user {}", cmd, sender);
                Ok(())
            }
            Inbound::Unknown(code) => {
                debug!("[DISPATCH] Ignoring unknown command {} from user {}", code, sender);
                Ok(())
            }
        }
    }

    async fn private_message(&self, sender: UserId, mut message: PrivateMessage) -> Result<(), ImError> {
        if message.receiver_id == 0 || message.seq_id.is_empty() {
            return Err(ImError::Malformed("private message without receiver or seq_id".to_string()));
        }
        message.sender_id = sender;
        let receiver = message.receiver_id;
        let frame = Envelope::new(Command::PrivateMessage, &message)?.encode()?;

        if self.store.is_online(receiver).await? {
            match self.registry.send(receiver, &frame).await {
                Ok(()) => {
                    debug!("[DISPATCH] {} delivered to user {}", message.seq_id, receiver);
                    return Ok(());
                }
                Err(e) => debug!("[DISPATCH] Live delivery of {} failed, queueing: {}", message.seq_id, e),
            }
        }

        self.store.enqueue_offline(receiver, message.send_time, &frame).await?;
        info!("[DISPATCH] {} stored offline for user {}", message.seq_id, receiver);

        // accepted, not yet seen
        let ack = Ack {
            seq_id: message.seq_id,
            sender_id: receiver,
            receiver_id: sender,
            is_group: false,
        };
        self.send_best_effort(sender, Command::Ack, &ack).await;
        Ok(())
    }

    async fn group_message(&self, sender: UserId, mut message: GroupMessage) -> Result<(), ImError> {
        let group_id = message.receiver_id;
        if group_id == 0 || message.seq_id.is_empty() {
            return Err(ImError::Malformed("group message without group or seq_id".to_string()));
        }
        message.sender_id = sender;

        let members = self.directory.get_group_members(group_id).await?;
        if !members.contains(&sender) {
            warn!("[DISPATCH] User {} is not a member of group {}, dropping {}", sender, group_id, message.seq_id);
            return Ok(());
        }

        let outcome = self.messages.insert_group_message(&StoredGroupMessage::from_message(&message)).await?;

        let ack = Ack {
            seq_id: message.seq_id.clone(),
            sender_id: group_id,
            receiver_id: sender,
            is_group: true,
        };
        self.send_best_effort(sender, Command::Ack, &ack).await;

        if outcome == InsertOutcome::Duplicate {
            info!("[DISPATCH] {} already recorded in group {}, skipping fan-out", message.seq_id, group_id);
            return Ok(());
        }

        self.annotate(&mut message).await;
        let frame = Envelope::new(Command::GroupMessage, &message)?.encode()?;
        self.group_ack.fan_out(group_id, &message.seq_id, sender, &members, &frame).await;
        Ok(())
    }

    async fn annotate(&self, message: &mut GroupMessage) {
        match self.directory.get_users_by_ids(&[message.sender_id]).await {
            Ok(users) => {
                if let Some(user) = users.into_iter().next() {
                    message.sender_nickname = user.nickname;
                    message.sender_avatar = user.avatar;
                }
            }
            Err(e) => warn!("[DISPATCH] Sender lookup for {} failed: {}", message.seq_id, e),
        }
        match self.directory.get_group(message.receiver_id).await {
            Ok(Some(group)) => {
                message.group_name = group.name;
                message.group_avatar = group.avatar;
            }
            Ok(None) => {}
            Err(e) => warn!("[DISPATCH] Group lookup for {} failed: {}", message.seq_id, e),
        }
    }

    async fn ack(&self, sender: UserId, ack: Ack, raw: &str) -> Result<(), ImError> {
        if ack.seq_id.is_empty() {
            return Err(ImError::Malformed("ack without seq_id".to_string()));
        }
        if ack.is_group {
            self.group_ack.acknowledge(sender, ack.receiver_id, &ack.seq_id).await?;
            return Ok(());
        }
        if let Err(e) = self.registry.send(ack.receiver_id, raw).await {
            debug!("[DISPATCH] Ack {} for user {} dropped: {}", ack.seq_id, ack.receiver_id, e);
        }
        Ok(())
    }

    async fn call_signal(&self, cmd: Command, route: CallRoute, raw: &str) {
        for target in route.targets() {
            if let Err(e) = self.registry.send(target, raw).await {
                debug!("[DISPATCH] {:?} for user {} not routed: {}", cmd, target, e);
            }
        }
    }

    /// Pushes a server-originated envelope to `user_id` if connected here.
    pub async fn notify<T: Serialize>(&self, user_id: UserId, cmd: Command, data: &T) -> Result<(), ImError> {
        let frame = Envelope::new(cmd, data)?.encode()?;
        self.registry.send(user_id, &frame).await
    }

    async fn send_best_effort<T: Serialize>(&self, user_id: UserId, cmd: Command, data: &T) {
        if let Err(e) = self.notify(user_id, cmd, data).await {
            debug!("[DISPATCH] {:?} to user {} not delivered: {}", cmd, user_id, e);
        }
    }
}
