//! In-memory collaborators so the server runs without external services.

use crate::backend::{BanInfo, BanList, BlockChange, PlayerDb, PlayerRecord, World};
use crate::player::Rank;
use crate::utils::lock;
use log::info;
use shared::{Dimensions, Position};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::SystemTime;

/// Player records keyed by lowercase name.
pub struct MemoryPlayerDb {
    records: Mutex<HashMap<String, PlayerRecord>>,
    default_rank: Rank,
}

impl MemoryPlayerDb {
    pub fn new(default_rank: Rank) -> Self {
        MemoryPlayerDb {
            records: Mutex::new(HashMap::new()),
            default_rank,
        }
    }

    pub fn get(&self, name: &str) -> Option<PlayerRecord> {
        lock(&self.records).get(&name.to_lowercase()).cloned()
    }

    /// Inserts or replaces a record, e.g. to seed history in tests.
    pub fn insert(&self, record: PlayerRecord) {
        lock(&self.records).insert(record.name.to_lowercase(), record);
    }

    pub fn ban(&self, name: &str, by: &str, reason: &str) {
        let mut records = lock(&self.records);
        let record = records
            .entry(name.to_lowercase())
            .or_insert_with(|| PlayerRecord::new(name, self.default_rank));
        record.ban = Some(BanInfo::new(by, reason));
    }

    pub fn unban(&self, name: &str) {
        if let Some(record) = lock(&self.records).get_mut(&name.to_lowercase()) {
            record.ban = None;
        }
    }
}

impl Default for MemoryPlayerDb {
    fn default() -> Self {
        Self::new(Rank::default())
    }
}

impl PlayerDb for MemoryPlayerDb {
    fn find_or_create(&self, name: &str) -> PlayerRecord {
        lock(&self.records)
            .entry(name.to_lowercase())
            .or_insert_with(|| PlayerRecord::new(name, self.default_rank))
            .clone()
    }

    fn record_login(&self, name: &str, ip: IpAddr) {
        if let Some(record) = lock(&self.records).get_mut(&name.to_lowercase()) {
            record.times_visited += 1;
            record.last_ip = Some(ip);
        }
    }

    fn record_failed_login(&self, name: &str, _ip: IpAddr) {
        if let Some(record) = lock(&self.records).get_mut(&name.to_lowercase()) {
            record.failed_logins += 1;
        }
    }

    fn set_rank(&self, name: &str, rank: Rank) -> bool {
        match lock(&self.records).get_mut(&name.to_lowercase()) {
            Some(record) => {
                record.rank = rank;
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
pub struct MemoryBanList {
    bans: Mutex<HashMap<IpAddr, BanInfo>>,
}

impl MemoryBanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban_ip(&self, ip: IpAddr, by: &str, reason: &str) {
        lock(&self.bans).insert(ip, BanInfo::new(by, reason));
    }

    pub fn unban_ip(&self, ip: IpAddr) -> bool {
        lock(&self.bans).remove(&ip).is_some()
    }
}

impl BanList for MemoryBanList {
    fn ip_ban(&self, ip: IpAddr) -> Option<BanInfo> {
        lock(&self.bans).get(&ip).cloned()
    }
}

pub const BLOCK_AIR: u8 = 0;
pub const BLOCK_STONE: u8 = 1;
pub const BLOCK_GRASS: u8 = 2;
pub const BLOCK_DIRT: u8 = 3;
pub const BLOCK_BEDROCK: u8 = 7;

/// A flat map: bedrock at the bottom, dirt up to half height, grass on top.
/// The bedrock layer cannot be edited.
pub struct FlatWorld {
    dimensions: Dimensions,
    blocks: RwLock<Vec<u8>>,
    history: Mutex<Vec<BlockChange>>,
    saves: AtomicUsize,
}

impl FlatWorld {
    pub fn new(dimensions: Dimensions) -> Self {
        let ground = dimensions.y as i32 / 2;
        let mut blocks = vec![BLOCK_AIR; dimensions.volume()];
        for y in 0..=ground.min(dimensions.y as i32 - 1) {
            let block = match y {
                0 => BLOCK_BEDROCK,
                y if y == ground => BLOCK_GRASS,
                _ => BLOCK_DIRT,
            };
            for z in 0..dimensions.z as i32 {
                for x in 0..dimensions.x as i32 {
                    if let Some(index) = dimensions.index(x, y, z) {
                        blocks[index] = block;
                    }
                }
            }
        }

        FlatWorld {
            dimensions,
            blocks: RwLock::new(blocks),
            history: Mutex::new(Vec::new()),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }

    pub fn change_count(&self) -> usize {
        lock(&self.history).len()
    }
}

impl World for FlatWorld {
    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn spawn(&self) -> Position {
        Position::at_block(
            self.dimensions.x as i32 / 2,
            self.dimensions.y as i32 / 2 + 1,
            self.dimensions.z as i32 / 2,
        )
    }

    fn snapshot(&self) -> Vec<u8> {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn block(&self, x: i32, y: i32, z: i32) -> Option<u8> {
        let index = self.dimensions.index(x, y, z)?;
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        blocks.get(index).copied()
    }

    fn set_block(&self, x: i16, y: i16, z: i16, block: u8, by: &str) -> bool {
        if y == 0 {
            return false;
        }
        let Some(index) = self.dimensions.index(x as i32, y as i32, z as i32) else {
            return false;
        };

        let old = {
            let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut blocks[index], block)
        };
        if old != block {
            lock(&self.history).push(BlockChange {
                x,
                y,
                z,
                old,
                new: block,
                by: by.to_string(),
                at: SystemTime::now(),
            });
        }
        true
    }

    fn history(&self, x: i16, y: i16, z: i16) -> Vec<BlockChange> {
        lock(&self.history)
            .iter()
            .filter(|change| (change.x, change.y, change.z) == (x, y, z))
            .cloned()
            .collect()
    }

    fn save(&self) -> anyhow::Result<()> {
        let count = self.saves.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            "World saved ({} changes recorded, save #{})",
            self.change_count(),
            count
        );
        Ok(())
    }
}
