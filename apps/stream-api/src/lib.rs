pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;

use std::sync::Arc;

use config::Config;
use db::kv::KeyValueStore;
use db::store::StreamStore;
use gateway::directory::RoomDirectory;
use gateway::fanout::GatewayBroadcast;
use gateway::presence::PresenceTracker;
use gateway::sync::SyncAdapter;

/// Shared application state available to all route handlers and the gateway.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StreamStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub config: Arc<Config>,
    pub rooms: Arc<RoomDirectory>,
    pub presence: Arc<PresenceTracker>,
    pub sync: Arc<SyncAdapter>,
    pub broadcast: GatewayBroadcast,
}
