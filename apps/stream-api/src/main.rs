use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beacon_common::SnowflakeGenerator;
use stream_api::config::Config;
use stream_api::db::kv::{KeyValueStore, MemoryKv, RedisStore};
use stream_api::db::pg::PgStore;
use stream_api::db::store::StreamStore;
use stream_api::gateway::directory::RoomDirectory;
use stream_api::gateway::fanout::GatewayBroadcast;
use stream_api::gateway::presence::PresenceTracker;
use stream_api::gateway::sync::SyncAdapter;
use stream_api::gateway::sweeper;
use stream_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // Connect to PostgreSQL.
    let pool = stream_api::db::pool::connect(&config.database_url).await;
    let snowflake = Arc::new(SnowflakeGenerator::new(0));
    let store: Arc<dyn StreamStore> = Arc::new(PgStore::new(pool, snowflake));

    // Redis when configured, otherwise an in-memory store (single-process
    // deployments and local development).
    let kv: Arc<dyn KeyValueStore> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .expect("failed to connect to redis"),
        ),
        None => {
            tracing::warn!("REDIS_URL not set — using in-memory key-value store");
            Arc::new(MemoryKv::new())
        }
    };

    let state = AppState {
        store: store.clone(),
        kv: kv.clone(),
        config: Arc::new(config),
        rooms: Arc::new(RoomDirectory::new()),
        presence: Arc::new(PresenceTracker::new(kv.clone())),
        sync: Arc::new(SyncAdapter::new(store, kv)),
        broadcast: GatewayBroadcast::new(),
    };

    // Background reconciliation of orphaned rooms and stale presence.
    sweeper::spawn(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(stream_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "stream-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
