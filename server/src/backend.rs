//! Interfaces to the collaborators the server consumes: the player database,
//! the IP ban list and the world. All calls are synchronous and made from
//! session or scheduler threads.

use crate::player::Rank;
use crate::utils::format_ago;
use shared::{Dimensions, Position};
use std::net::IpAddr;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanInfo {
    pub by: String,
    pub reason: String,
    pub at: SystemTime,
}

impl BanInfo {
    pub fn new(by: &str, reason: &str) -> Self {
        BanInfo {
            by: by.to_string(),
            reason: reason.to_string(),
            at: SystemTime::now(),
        }
    }

    /// Kick reason for a banned player name.
    pub fn name_message(&self) -> String {
        format!(
            "Banned {} ago by {}: {}",
            format_ago(self.at),
            self.by,
            self.reason
        )
    }

    /// Kick reason for a banned address.
    pub fn ip_message(&self) -> String {
        format!(
            "IP-banned {} ago by {}: {}",
            format_ago(self.at),
            self.by,
            self.reason
        )
    }
}

/// Persistent identity of a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub name: String,
    pub rank: Rank,
    pub ban: Option<BanInfo>,
    /// Successful logins before the current one.
    pub times_visited: u32,
    pub last_ip: Option<IpAddr>,
    pub failed_logins: u32,
}

impl PlayerRecord {
    pub fn new(name: &str, rank: Rank) -> Self {
        PlayerRecord {
            name: name.to_string(),
            rank,
            ban: None,
            times_visited: 0,
            last_ip: None,
            failed_logins: 0,
        }
    }
}

pub trait PlayerDb: Send + Sync {
    fn find_or_create(&self, name: &str) -> PlayerRecord;
    fn record_login(&self, name: &str, ip: IpAddr);
    fn record_failed_login(&self, name: &str, ip: IpAddr);
    fn set_rank(&self, name: &str, rank: Rank) -> bool;
}

pub trait BanList: Send + Sync {
    fn ip_ban(&self, ip: IpAddr) -> Option<BanInfo>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChange {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub old: u8,
    pub new: u8,
    pub by: String,
    pub at: SystemTime,
}

pub trait World: Send + Sync {
    fn dimensions(&self) -> Dimensions;
    fn spawn(&self) -> Position;
    /// Copy of the block array for a level transfer.
    fn snapshot(&self) -> Vec<u8>;
    fn block(&self, x: i32, y: i32, z: i32) -> Option<u8>;
    /// Applies and records a change. Returns false when the world refuses it.
    fn set_block(&self, x: i16, y: i16, z: i16, block: u8, by: &str) -> bool;
    fn history(&self, x: i16, y: i16, z: i16) -> Vec<BlockChange>;
    fn save(&self) -> anyhow::Result<()>;
}
