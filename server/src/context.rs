use crate::backend::{BanList, PlayerDb, World};
use crate::config::ServerConfig;
use crate::registry::Registry;
use std::sync::Arc;

/// Everything a session needs from the rest of the server.
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: Arc<Registry>,
    pub players: Arc<dyn PlayerDb>,
    pub bans: Arc<dyn BanList>,
    pub world: Arc<dyn World>,
    /// Salt for name verification, shared with the heartbeat service.
    pub salt: String,
}
