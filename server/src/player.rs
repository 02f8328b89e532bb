//! Logged-in player state shared between a session and the rest of the server.

use crate::utils::lock;
use serde::Deserialize;
use shared::{Position, USER_TYPE_NORMAL, USER_TYPE_OP};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Guest,
    #[default]
    Builder,
    Operator,
    Owner,
}

impl Rank {
    pub fn can_build(self) -> bool {
        self >= Rank::Builder
    }

    /// May join while the server is full.
    pub fn has_reserved_slot(self) -> bool {
        self >= Rank::Operator
    }

    /// Value sent in the identification and set-permission packets.
    pub fn user_type(self) -> u8 {
        if self >= Rank::Operator {
            USER_TYPE_OP
        } else {
            USER_TYPE_NORMAL
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            Rank::Guest => "&7",
            Rank::Builder => "&f",
            Rank::Operator => "&c",
            Rank::Owner => "&4",
        }
    }
}

/// A logged-in player.
///
/// Identity fields are fixed at login; rank, position and the moderation
/// flags may change from any thread.
#[derive(Debug)]
pub struct Player {
    pub name: String,
    /// Entity id other clients know this player by.
    pub id: i8,
    pub ip: IpAddr,
    rank: Mutex<Rank>,
    position: Mutex<Position>,
    frozen: AtomicBool,
    hidden: AtomicBool,
    last_active: Mutex<Instant>,
}

impl Player {
    pub fn new(name: &str, id: i8, ip: IpAddr, rank: Rank, position: Position) -> Self {
        Player {
            name: name.to_string(),
            id,
            ip,
            rank: Mutex::new(rank),
            position: Mutex::new(position),
            frozen: AtomicBool::new(false),
            hidden: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn rank(&self) -> Rank {
        *lock(&self.rank)
    }

    pub fn set_rank(&self, rank: Rank) {
        *lock(&self.rank) = rank;
    }

    /// Name with the rank colour, for chat and announcements.
    pub fn display_name(&self) -> String {
        format!("{}{}", self.rank().color(), self.name)
    }

    pub fn position(&self) -> Position {
        *lock(&self.position)
    }

    pub fn set_position(&self, position: Position) {
        *lock(&self.position) = position;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::Release);
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::Acquire)
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::Release);
    }

    /// Whether `self` should receive entity packets about `other`.
    pub fn can_see(&self, other: &Player) -> bool {
        self.id != other.id && (!other.is_hidden() || self.rank() >= other.rank())
    }

    pub fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_active).elapsed()
    }

    pub fn is_idle(&self, limit: Duration) -> bool {
        self.idle_for() > limit
    }
}
