use ruggine_im::server::config::ServerConfig;
use ruggine_im::server::database::Database;
use sqlx::Row;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;
    let limit: i64 = std::env::args().nth(1).and_then(|a| a.parse().ok()).unwrap_or(10);
    println!("Connecting to {}", config.database_url);
    let db = Database::connect(&config.database_url).await?;

    println!("\n-- groups --");
    let rows = sqlx::query("SELECT id, name, avatar, created_at FROM groups ORDER BY id")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: i64 = r.try_get("id").unwrap_or(0);
        let name: String = r.try_get("name").unwrap_or_default();
        let created_at: i64 = r.try_get("created_at").unwrap_or(0);
        println!("id={} name={} created_at={}", id, name, created_at);
    }

    println!("\n-- group_members --");
    let rows = sqlx::query("SELECT group_id, user_id, joined_at, last_ack_seq_id FROM group_members ORDER BY group_id, user_id")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let group_id: i64 = r.try_get("group_id").unwrap_or(0);
        let user_id: i64 = r.try_get("user_id").unwrap_or(0);
        let joined_at: i64 = r.try_get("joined_at").unwrap_or(0);
        let last_ack: String = r.try_get("last_ack_seq_id").unwrap_or_default();
        let last_ack = if last_ack.is_empty() { "-".to_string() } else { last_ack };
        println!("group_id={} user_id={} joined_at={} last_ack={}", group_id, user_id, joined_at, last_ack);
    }

    println!("\n-- group_messages (last {}) --", limit);
    let rows = sqlx::query("SELECT id, group_id, seq_id, sender_id, content, send_time FROM group_messages ORDER BY id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: i64 = r.try_get("id").unwrap_or(0);
        let group_id: i64 = r.try_get("group_id").unwrap_or(0);
        let seq_id: String = r.try_get("seq_id").unwrap_or_default();
        let sender_id: i64 = r.try_get("sender_id").unwrap_or(0);
        let content: String = r.try_get("content").unwrap_or_default();
        let send_time: i64 = r.try_get("send_time").unwrap_or(0);
        println!(
            "id={} group_id={} seq_id={} sender_id={} content_len={} send_time={}",
            id, group_id, seq_id, sender_id, content.len(), send_time
        );
    }

    Ok(())
}
