// Entry point for the ruggine_im server
use log::{error, info};
use ruggine_im::server::{
    backfill::Backfill,
    config::ServerConfig,
    connection::Server,
    database::Database,
    dispatcher::Dispatcher,
    group_ack::GroupAckProtocol,
    registry::Registry,
    store::{PresenceStore, RedisPresenceStore},
    sweeper,
    websocket::WsGateway,
};
use ruggine_im::utils::performance;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;
    std::env::set_var("RUST_LOG", &config.log_level);
    env_logger::init();

    if config.enable_encryption {
        info!("TLS is enabled; set TLS_CERT_PATH and TLS_KEY_PATH to the cert and key PEM files.");
    }

    let database = Arc::new(Database::connect(&config.database_url).await?);
    info!("[DB] Running migrations...");
    database.migrate().await.map_err(|e| {
        error!("[DB] Migration failed: {}", e);
        e
    })?;

    let redis = RedisPresenceStore::new(&config.redis_url).await?;
    if !redis.health_check().await? {
        anyhow::bail!("Redis at {} did not answer PING", config.redis_url);
    }
    info!("[STORE] Connected to {}", config.redis_url);
    let store: Arc<dyn PresenceStore> = Arc::new(redis);

    let registry = Arc::new(Registry::from_config(&config));
    let group_ack = Arc::new(GroupAckProtocol::new(registry.clone(), store.clone(), database.clone(), &config));
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        store.clone(),
        database.clone(),
        database.clone(),
        group_ack.clone(),
        &config,
    ));
    let backfill = Arc::new(Backfill::new(store.clone(), database.clone(), database.clone(), group_ack));

    sweeper::spawn(registry.clone(), store.clone(), config.sweep_interval);

    let perf_registry = registry.clone();
    let perf_store = store.clone();
    let perf_db = database.clone();
    let perf_path = config.performance_log_path.clone();
    let perf_interval = config.performance_interval;
    tokio::spawn(async move {
        performance::start_performance_logger(perf_registry, perf_store, perf_db, &perf_path, perf_interval).await;
    });

    let gateway = Arc::new(WsGateway::new(dispatcher, database.clone(), &config));
    let ws_addr = format!("{}:{}", config.host, config.ws_port()?);
    tokio::spawn(async move {
        if let Err(e) = gateway.run(&ws_addr).await {
            error!("[WS] Server error: {}", e);
        }
    });

    let addr = format!("{}:{}", config.host, config.port);
    let server = Arc::new(Server {
        backfill,
        directory: database,
        store,
        config,
    });
    server.run(&addr).await
}
