use async_trait::async_trait;
use log::{debug, info};
use sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions};

use crate::common::models::{GroupId, GroupProfile, StoredGroupMessage, UserId, UserProfile};
use crate::server::collaborators::{Directory, GroupMessageStore, InsertOutcome};
use crate::server::error::ImError;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        info!("[DB] Connecting to {}", database_url);

        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            let file_path = database_url
                .strip_prefix("sqlite://")
                .or_else(|| database_url.strip_prefix("sqlite:"))
                .unwrap_or(database_url);
            let file_path = file_path.split('?').next().unwrap_or(file_path);

            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                    info!("[DB] Created directory {:?}", parent);
                }
            }
        }

        let url = if in_memory || database_url.contains("mode=") {
            database_url.to_string()
        } else if database_url.contains('?') {
            format!("{}&mode=rwc", database_url)
        } else {
            format!("{}?mode=rwc", database_url)
        };

        // every in-memory connection is its own database
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;

        info!("[DB] Connection pool ready");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                nickname TEXT NOT NULL DEFAULT '',
                avatar TEXT NOT NULL DEFAULT ''
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                avatar TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // last_ack_seq_id is the backfill resume point
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS group_members (
                group_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                joined_at INTEGER NOT NULL,
                last_ack_seq_id TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (group_id, user_id)
            );
        "#).execute(&self.pool).await?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS group_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                seq_id TEXT NOT NULL,
                sender_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                msg_type INTEGER NOT NULL,
                send_time INTEGER NOT NULL,
                UNIQUE (group_id, seq_id)
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_group_messages_group ON group_messages (group_id, id);")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn count_group_messages(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM group_messages")
            .fetch_one(&self.pool)
            .await
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> StoredGroupMessage {
    StoredGroupMessage {
        id: row.get("id"),
        group_id: row.get::<i64, _>("group_id") as GroupId,
        seq_id: row.get("seq_id"),
        sender_id: row.get::<i64, _>("sender_id") as UserId,
        content: row.get("content"),
        msg_type: row.get::<i64, _>("msg_type") as i32,
        send_time: row.get("send_time"),
    }
}

#[async_trait]
impl Directory for Database {
    async fn get_users_by_ids(&self, ids: &[UserId]) -> Result<Vec<UserProfile>, ImError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id, nickname, avatar FROM users WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id as i64);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| UserProfile {
                id: r.get::<i64, _>("id") as UserId,
                nickname: r.get("nickname"),
                avatar: r.get("avatar"),
            })
            .collect())
    }

    async fn get_group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, ImError> {
        let rows = sqlx::query("SELECT user_id FROM group_members WHERE group_id = ? ORDER BY user_id")
            .bind(group_id as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("user_id") as UserId).collect())
    }

    async fn get_group(&self, group_id: GroupId) -> Result<Option<GroupProfile>, ImError> {
        let row = sqlx::query("SELECT id, name, avatar FROM groups WHERE id = ?")
            .bind(group_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| GroupProfile {
            id: r.get::<i64, _>("id") as GroupId,
            name: r.get("name"),
            avatar: r.get("avatar"),
        }))
    }

    async fn get_user_groups(&self, user_id: UserId) -> Result<Vec<GroupId>, ImError> {
        let rows = sqlx::query("SELECT group_id FROM group_members WHERE user_id = ? ORDER BY group_id")
            .bind(user_id as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("group_id") as GroupId).collect())
    }

    async fn validate_session(&self, token: &str) -> Result<Option<UserId>, ImError> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
            .bind(token)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("user_id") as UserId))
    }
}

#[async_trait]
impl GroupMessageStore for Database {
    async fn insert_group_message(&self, row: &StoredGroupMessage) -> Result<InsertOutcome, ImError> {
        let result = sqlx::query(
            "INSERT INTO group_messages (group_id, seq_id, sender_id, content, msg_type, send_time) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(row.group_id as i64)
        .bind(&row.seq_id)
        .bind(row.sender_id as i64)
        .bind(&row.content)
        .bind(row.msg_type as i64)
        .bind(row.send_time)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                debug!("[DB] Group message {} already recorded", row.seq_id);
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn query_group_messages_after(
        &self,
        group_id: GroupId,
        watermark: Option<&str>,
        exclude_sender: UserId,
    ) -> Result<Vec<StoredGroupMessage>, ImError> {
        let rows = match watermark.filter(|w| !w.is_empty()) {
            Some(seq_id) => {
                sqlx::query(
                    r#"
                    SELECT id, group_id, seq_id, sender_id, content, msg_type, send_time
                    FROM group_messages
                    WHERE group_id = ? AND sender_id != ?
                      AND id > COALESCE((SELECT id FROM group_messages WHERE group_id = ? AND seq_id = ?), 0)
                    ORDER BY id
                    "#,
                )
                .bind(group_id as i64)
                .bind(exclude_sender as i64)
                .bind(group_id as i64)
                .bind(seq_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, group_id, seq_id, sender_id, content, msg_type, send_time
                    FROM group_messages
                    WHERE group_id = ? AND sender_id != ?
                      AND send_time >= COALESCE((SELECT joined_at FROM group_members WHERE group_id = ? AND user_id = ?), 0)
                    ORDER BY id
                    "#,
                )
                .bind(group_id as i64)
                .bind(exclude_sender as i64)
                .bind(group_id as i64)
                .bind(exclude_sender as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn last_ack(&self, group_id: GroupId, user_id: UserId) -> Result<Option<String>, ImError> {
        let row = sqlx::query("SELECT last_ack_seq_id FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id as i64)
            .bind(user_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.get::<String, _>("last_ack_seq_id"))
            .filter(|seq| !seq.is_empty()))
    }

    async fn update_last_ack(&self, group_id: GroupId, user_id: UserId, seq_id: &str) -> Result<(), ImError> {
        let result = sqlx::query(
            r#"
            UPDATE group_members SET last_ack_seq_id = ?
            WHERE group_id = ? AND user_id = ?
              AND COALESCE((SELECT id FROM group_messages WHERE group_id = ? AND seq_id = ?), 0) >
                  COALESCE((SELECT gm.id FROM group_messages gm
                            WHERE gm.group_id = group_members.group_id
                              AND gm.seq_id = group_members.last_ack_seq_id), 0)
            "#,
        )
        .bind(seq_id)
        .bind(group_id as i64)
        .bind(user_id as i64)
        .bind(group_id as i64)
        .bind(seq_id)
        .execute(&self.pool)
        .await?;
        debug!(
            "[DB] last_ack for user {} in group {} -> {} (rows={})",
            user_id, group_id, seq_id, result.rows_affected()
        );
        Ok(())
    }
}
