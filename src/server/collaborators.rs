//! Narrow contracts the delivery core needs from the user/group directory and
//! the relational message store. `Database` implements both.

use async_trait::async_trait;

use crate::common::models::{GroupId, GroupProfile, StoredGroupMessage, UserId, UserProfile};
use crate::server::error::ImError;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_users_by_ids(&self, ids: &[UserId]) -> Result<Vec<UserProfile>, ImError>;
    async fn get_group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, ImError>;
    async fn get_group(&self, group_id: GroupId) -> Result<Option<GroupProfile>, ImError>;
    async fn get_user_groups(&self, user_id: UserId) -> Result<Vec<GroupId>, ImError>;
    /// Resolves a session token to its user, `None` if unknown or expired.
    async fn validate_session(&self, token: &str) -> Result<Option<UserId>, ImError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// `(group_id, seq_id)` was already recorded.
    Duplicate,
}

#[async_trait]
pub trait GroupMessageStore: Send + Sync {
    async fn insert_group_message(&self, row: &StoredGroupMessage) -> Result<InsertOutcome, ImError>;
    /// Messages stored after the row whose seq id is `watermark`, excluding
    /// `exclude_sender`'s own. Without a watermark, everything since the
    /// member joined.
    async fn query_group_messages_after(
        &self,
        group_id: GroupId,
        watermark: Option<&str>,
        exclude_sender: UserId,
    ) -> Result<Vec<StoredGroupMessage>, ImError>;
    async fn last_ack(&self, group_id: GroupId, user_id: UserId) -> Result<Option<String>, ImError>;
    /// Moves the member's pointer to `seq_id`; never backwards in storage order.
    async fn update_last_ack(&self, group_id: GroupId, user_id: UserId, seq_id: &str) -> Result<(), ImError>;
}
