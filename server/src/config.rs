//! Server configuration.
//!
//! Values come from an optional TOML file; anything missing falls back to the
//! defaults below. The binary overlays a handful of command-line flags on top.

use crate::error::ServerError;
use serde::Deserialize;
use shared::level::Dimensions;
use std::path::Path;
use std::time::Duration;

/// How strictly the name-verification token is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VerifyNames {
    /// Every mismatch is fatal.
    Always,
    /// Fatal on a first visit or from a new IP, a warning otherwise.
    Balanced,
    /// Mismatches are logged and announced only.
    Never,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub server_name: String,
    pub motd: String,
    pub max_players: usize,
    /// 0 disables the limit.
    pub max_connections_per_ip: usize,
    pub one_connection_per_ip: bool,
    pub verify_names: VerifyNames,
    /// Upstream budget shared by all sessions, in KB/s.
    pub upload_kbps: u32,
    pub packets_per_second: u32,
    pub ticks_per_second: u32,
    /// Per-cycle cap used while nobody is logged in.
    pub idle_packet_cap: usize,
    /// 0 disables the idle kick.
    pub max_idle_minutes: u64,
    /// 0 disables autosave.
    pub autosave_secs: u64,
    pub accept_interval_ms: u64,
    pub ping_interval_ms: u64,
    pub login_timeout_ms: u64,
    pub kick_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub map_width: i16,
    pub map_height: i16,
    pub map_length: i16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25565".to_string(),
            server_name: "Classic Server".to_string(),
            motd: "Welcome!".to_string(),
            max_players: 20,
            max_connections_per_ip: 3,
            one_connection_per_ip: false,
            verify_names: VerifyNames::Balanced,
            upload_kbps: 1000,
            packets_per_second: 16_000,
            ticks_per_second: 200,
            idle_packet_cap: 100_000,
            max_idle_minutes: 0,
            autosave_secs: 300,
            accept_interval_ms: 10,
            ping_interval_ms: 2_000,
            login_timeout_ms: 10_000,
            kick_timeout_ms: 1_000,
            shutdown_grace_ms: 2_000,
            map_width: 128,
            map_height: 64,
            map_length: 128,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ServerError> {
        Ok(toml::from_str(text)?)
    }

    /// Length of one session service cycle.
    pub fn tick(&self) -> Duration {
        Duration::from_secs(1) / self.ticks_per_second.max(1)
    }

    pub fn map_dimensions(&self) -> Dimensions {
        Dimensions::new(self.map_width, self.map_height, self.map_length)
    }

    pub fn max_idle(&self) -> Option<Duration> {
        (self.max_idle_minutes > 0).then(|| Duration::from_secs(self.max_idle_minutes * 60))
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_secs > 0).then(|| Duration::from_secs(self.autosave_secs))
    }

    pub fn accept_interval(&self) -> Duration {
        Duration::from_millis(self.accept_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn kick_timeout(&self) -> Duration {
        Duration::from_millis(self.kick_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
