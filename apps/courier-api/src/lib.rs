pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;
pub mod store;

use std::sync::Arc;

use config::Config;
use db::kv::KeyValueStore;
use gateway::hub::Hub;
use store::ChatStore;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub hub: Hub,
    pub config: Arc<Config>,
}
