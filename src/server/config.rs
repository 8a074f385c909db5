use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub enable_encryption: bool,
    pub log_level: String,
    pub shard_count: usize,
    pub sweep_interval: Duration,
    pub max_idle_gap: Duration,
    pub send_retries: u32,
    pub send_retry_delay: Duration,
    pub group_send_attempts: u32,
    pub ack_check_delay: Duration,
    pub ack_window_ttl: Duration,
    pub max_inflight_retries: usize,
    pub auth_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_length: usize,
    pub performance_log_path: String,
    pub performance_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            database_url: "sqlite:data/ruggine_im.db".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            enable_encryption: false,
            log_level: "info".to_string(),
            shard_count: 32,
            sweep_interval: Duration::from_secs(30),
            max_idle_gap: Duration::from_secs(90),
            send_retries: 2,
            send_retry_delay: Duration::from_millis(50),
            group_send_attempts: 3,
            ack_check_delay: Duration::from_millis(1000),
            ack_window_ttl: Duration::from_secs(3600),
            max_inflight_retries: 1024,
            auth_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_millis(5000),
            max_message_length: 4096,
            performance_log_path: "data/ruggine_im_performance.log".to_string(),
            performance_interval: Duration::from_secs(120),
        }
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parsed(key, default.as_secs()))
}

fn millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(parsed(key, default.as_millis() as u64))
}

impl ServerConfig {
    /// Fails when SERVER_PORT leaves no room for the WebSocket port above it.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let d = Self::default();

        let config = Self {
            host: env::var("SERVER_HOST").unwrap_or(d.host),
            port: parsed("SERVER_PORT", d.port),
            database_url: env::var("DATABASE_URL").unwrap_or(d.database_url),
            redis_url: env::var("REDIS_URL").unwrap_or(d.redis_url),
            enable_encryption: env::var("ENABLE_ENCRYPTION").map(|v| v == "true" || v == "1").unwrap_or(d.enable_encryption),
            log_level: env::var("LOG_LEVEL").unwrap_or(d.log_level),
            // zero shards would make `user_id % shard_count` panic
            shard_count: parsed("REGISTRY_SHARDS", d.shard_count).max(1),
            sweep_interval: secs("SWEEP_INTERVAL_SECS", d.sweep_interval),
            max_idle_gap: secs("MAX_IDLE_GAP_SECS", d.max_idle_gap),
            send_retries: parsed("SEND_RETRIES", d.send_retries),
            send_retry_delay: millis("SEND_RETRY_DELAY_MS", d.send_retry_delay),
            group_send_attempts: parsed("GROUP_SEND_ATTEMPTS", d.group_send_attempts).max(1),
            ack_check_delay: millis("ACK_CHECK_DELAY_MS", d.ack_check_delay),
            ack_window_ttl: secs("ACK_WINDOW_TTL_SECS", d.ack_window_ttl),
            max_inflight_retries: parsed("MAX_INFLIGHT_RETRIES", d.max_inflight_retries).max(1),
            auth_timeout: secs("AUTH_TIMEOUT_SECS", d.auth_timeout),
            write_timeout: millis("WRITE_TIMEOUT_MS", d.write_timeout),
            max_message_length: parsed("MAX_MESSAGE_LENGTH", d.max_message_length),
            performance_log_path: env::var("PERFORMANCE_LOG_PATH").unwrap_or(d.performance_log_path),
            performance_interval: secs("PERFORMANCE_INTERVAL_SECS", d.performance_interval),
        };
        config.ws_port()?;
        Ok(config)
    }

    /// The WebSocket gateway listens one port above the command server.
    pub fn ws_port(&self) -> anyhow::Result<u16> {
        self.port
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("SERVER_PORT {} leaves no room for the WebSocket port", self.port))
    }
}
