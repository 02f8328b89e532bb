//! Process-wide table of connected sessions and logged-in players.
//!
//! This module handles:
//! - Per-IP connection limits for accepted sockets
//! - Player registration with duplicate-name eviction, the one-connection-per-IP
//!   policy and the capacity limit (with reserved slots)
//! - Entity id allocation
//! - Broadcasting to all, visible or ranked players
//!
//! All mutation happens under one lock. Readers take an immutable snapshot of
//! the session or player list and iterate it without holding the lock, so a
//! broadcast may still reach a session that is tearing down; sending to such a
//! session is a harmless no-op.

use crate::config::ServerConfig;
use crate::player::{Player, Rank};
use crate::session::SessionHandle;
use crate::utils::lock;
use arc_swap::ArcSwap;
use log::{debug, error, info};
use shared::chat::wrap_packets;
use shared::{Message, Packet, Position};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Entity ids 0..=127 are usable; -1 is reserved for "self".
const MAX_ENTITY_ID: i8 = i8::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_players: usize,
    /// 0 disables the limit.
    pub max_connections_per_ip: usize,
    pub one_connection_per_ip: bool,
    pub kick_timeout: Duration,
}

impl From<&ServerConfig> for Limits {
    fn from(config: &ServerConfig) -> Self {
        Limits {
            max_players: config.max_players,
            max_connections_per_ip: config.max_connections_per_ip,
            one_connection_per_ip: config.one_connection_per_ip,
            kick_timeout: config.kick_timeout(),
        }
    }
}

/// Why a connection or login was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooManyConnections,
    AlreadyConnectedFromIp,
    ServerFull,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::TooManyConnections => "Too many connections from your IP address",
            Rejection::AlreadyConnectedFromIp => "Only one connection per IP address is allowed",
            Rejection::ServerFull => "Server is full!",
        }
    }
}

/// Identity of a player about to join.
#[derive(Debug, Clone)]
pub struct Login {
    pub name: String,
    pub ip: IpAddr,
    pub rank: Rank,
    pub spawn: Position,
}

pub struct Registration {
    pub player: Arc<Player>,
    /// Older session that held the same name; the caller must kick it.
    pub evicted: Option<Arc<SessionHandle>>,
}

#[derive(Default)]
struct State {
    sessions: Vec<Arc<SessionHandle>>,
    players: Vec<Arc<SessionHandle>>,
    ip_counts: HashMap<IpAddr, usize>,
}

pub struct Registry {
    limits: Limits,
    state: Mutex<State>,
    sessions: ArcSwap<Vec<Arc<SessionHandle>>>,
    players: ArcSwap<Vec<Arc<SessionHandle>>>,
    packet_cap: AtomicUsize,
}

impl Registry {
    pub fn new(limits: Limits) -> Self {
        Registry {
            limits,
            state: Mutex::new(State::default()),
            sessions: ArcSwap::from_pointee(Vec::new()),
            players: ArcSwap::from_pointee(Vec::new()),
            packet_cap: AtomicUsize::new(1),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Tracks a freshly accepted session, enforcing the per-IP limit.
    pub fn connect(&self, handle: &Arc<SessionHandle>) -> Result<(), Rejection> {
        let ip = handle.addr().ip();
        let mut state = lock(&self.state);
        let count = state.ip_counts.get(&ip).copied().unwrap_or(0);
        if self.limits.max_connections_per_ip > 0 && count >= self.limits.max_connections_per_ip
        {
            return Err(Rejection::TooManyConnections);
        }

        state.ip_counts.insert(ip, count + 1);
        state.sessions.push(Arc::clone(handle));
        self.sessions.store(Arc::new(state.sessions.clone()));
        Ok(())
    }

    /// Forgets a session. Calling it again is a no-op.
    pub fn disconnect(&self, handle: &SessionHandle) {
        let mut state = lock(&self.state);
        let before = state.sessions.len();
        state.sessions.retain(|session| session.id() != handle.id());
        if state.sessions.len() == before {
            return;
        }

        let ip = handle.addr().ip();
        if let Some(count) = state.ip_counts.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                state.ip_counts.remove(&ip);
            }
        }
        self.sessions.store(Arc::new(state.sessions.clone()));
    }

    /// Registers a logged-in player. A session already holding the same name
    /// is removed and returned for eviction.
    pub fn register(
        &self,
        handle: &Arc<SessionHandle>,
        login: Login,
    ) -> Result<Registration, Rejection> {
        let (player, evicted) = {
            let mut state = lock(&self.state);
            let ghost = state.players.iter().position(|session| {
                session
                    .player()
                    .map_or(false, |player| player.name.eq_ignore_ascii_case(&login.name))
            });

            let others = || {
                state
                    .players
                    .iter()
                    .enumerate()
                    .filter(move |(index, _)| Some(*index) != ghost)
                    .map(|(_, session)| session)
            };

            if self.limits.one_connection_per_ip
                && others().any(|session| session.addr().ip() == login.ip)
            {
                return Err(Rejection::AlreadyConnectedFromIp);
            }
            let remaining = others().count();
            if remaining >= self.limits.max_players && !login.rank.has_reserved_slot() {
                return Err(Rejection::ServerFull);
            }
            let id = (0..=MAX_ENTITY_ID)
                .find(|id| {
                    !others().any(|session| session.player().map(|player| player.id) == Some(*id))
                })
                .ok_or(Rejection::ServerFull)?;

            let evicted = ghost.map(|index| state.players.remove(index));
            let player = Arc::new(Player::new(
                &login.name,
                id,
                login.ip,
                login.rank,
                login.spawn,
            ));
            handle.attach(Arc::clone(&player));
            state.players.push(Arc::clone(handle));
            self.players.store(Arc::new(state.players.clone()));
            (player, evicted)
        };

        if let Some(ghost) = evicted.as_ref().and_then(|session| session.player()) {
            debug!("{} replaces a ghost session with id {}", player.name, ghost.id);
            self.broadcast_departure(ghost, false);
        }
        info!("{} joined with entity id {}", player.name, player.id);
        Ok(Registration { player, evicted })
    }

    /// Removes a player and tells everyone they left. Returns the player if
    /// the session was registered; calling it again is a no-op.
    pub fn unregister(&self, handle: &SessionHandle) -> Option<Arc<Player>> {
        let removed = {
            let mut state = lock(&self.state);
            let index = state
                .players
                .iter()
                .position(|session| session.id() == handle.id())?;
            state.players.remove(index);
            self.players.store(Arc::new(state.players.clone()));
            handle.player().cloned()
        }?;

        info!("{} left the server", removed.name);
        self.broadcast_departure(&removed, true);
        Some(removed)
    }

    fn broadcast_departure(&self, player: &Player, announce: bool) {
        if let Some(packet) = encode(&Message::RemoveEntity { id: player.id }) {
            self.broadcast_about(player, &packet);
        }
        if announce && !player.is_hidden() {
            self.broadcast_text(&format!("&e{} left the server", player.name));
        }
    }

    /// Snapshot of logged-in sessions.
    pub fn players(&self) -> Arc<Vec<Arc<SessionHandle>>> {
        self.players.load_full()
    }

    /// Snapshot of every connected session, logged in or not.
    pub fn sessions(&self) -> Arc<Vec<Arc<SessionHandle>>> {
        self.sessions.load_full()
    }

    pub fn count(&self) -> usize {
        self.players.load().len()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.load().len()
    }

    pub fn find(&self, name: &str) -> Option<Arc<SessionHandle>> {
        self.players()
            .iter()
            .find(|session| {
                session
                    .player()
                    .map_or(false, |player| player.name.eq_ignore_ascii_case(name))
            })
            .cloned()
    }

    pub fn find_by_ip(&self, ip: IpAddr) -> Vec<Arc<SessionHandle>> {
        self.sessions()
            .iter()
            .filter(|session| session.addr().ip() == ip)
            .cloned()
            .collect()
    }

    pub fn broadcast(&self, packet: &Packet) {
        for session in self.players().iter() {
            session.send(packet.clone());
        }
    }

    pub fn broadcast_except(&self, packet: &Packet, except: &SessionHandle) {
        for session in self.players().iter() {
            if session.id() != except.id() {
                session.send(packet.clone());
            }
        }
    }

    /// Sends an entity packet about `subject` to every player who can see it.
    pub fn broadcast_about(&self, subject: &Player, packet: &Packet) {
        for session in self.players().iter() {
            if let Some(viewer) = session.player() {
                if viewer.can_see(subject) {
                    session.send(packet.clone());
                }
            }
        }
    }

    pub fn broadcast_ranked(&self, min_rank: Rank, packet: &Packet) {
        for session in self.players().iter() {
            if session.player().map_or(false, |player| player.rank() >= min_rank) {
                session.send(packet.clone());
            }
        }
    }

    /// Wraps and broadcasts a chat message to everyone.
    pub fn broadcast_text(&self, text: &str) {
        for packet in wrap_text(text) {
            self.broadcast(&packet);
        }
    }

    pub fn broadcast_text_ranked(&self, min_rank: Rank, text: &str) {
        for packet in wrap_text(text) {
            self.broadcast_ranked(min_rank, &packet);
        }
    }

    /// Names of the players `viewer` can see, in join order.
    pub fn player_names(&self, viewer: Option<&Player>) -> Vec<String> {
        self.players()
            .iter()
            .filter_map(|session| session.player())
            .filter(|player| match viewer {
                Some(viewer) => viewer.id == player.id || viewer.can_see(player),
                None => !player.is_hidden(),
            })
            .map(|player| player.name.clone())
            .collect()
    }

    pub fn player_list(&self, viewer: Option<&Player>) -> String {
        let names = self.player_names(viewer);
        if names.is_empty() {
            "Nobody is online".to_string()
        } else {
            format!("Players online ({}): {}", names.len(), names.join(", "))
        }
    }

    pub fn kick_by_name(&self, name: &str, reason: &str) -> bool {
        match self.find(name) {
            Some(session) => {
                session.kick(reason, self.limits.kick_timeout);
                true
            }
            None => false,
        }
    }

    pub fn kick_by_ip(&self, ip: IpAddr, reason: &str) -> usize {
        let sessions = self.find_by_ip(ip);
        for session in &sessions {
            session.kick(reason, self.limits.kick_timeout);
        }
        sessions.len()
    }

    /// Kicks every player inactive for longer than `limit`.
    pub fn kick_idle(&self, limit: Duration, reason: &str) -> usize {
        let mut kicked = 0;
        for session in self.players().iter() {
            if session.player().map_or(false, |player| player.is_idle(limit)) {
                session.kick(reason, self.limits.kick_timeout);
                kicked += 1;
            }
        }
        kicked
    }

    /// Kicks every connected session, logged in or not.
    pub fn kick_all(&self, reason: &str) {
        for session in self.sessions().iter() {
            session.kick(reason, self.limits.kick_timeout);
        }
    }

    pub fn packet_cap(&self) -> usize {
        self.packet_cap.load(Ordering::Acquire)
    }

    pub fn set_packet_cap(&self, cap: usize) {
        self.packet_cap.store(cap.max(1), Ordering::Release);
    }
}

fn encode(message: &Message) -> Option<Packet> {
    match message.encode() {
        Ok(packet) => Some(packet),
        Err(err) => {
            error!("Failed to encode {}: {}", message.opcode(), err);
            None
        }
    }
}

fn wrap_text(text: &str) -> Vec<Packet> {
    wrap_packets(text).unwrap_or_else(|err| {
        error!("Failed to encode chat message: {}", err);
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionHandle;
    use shared::Opcode;
    use std::net::{Ipv4Addr, SocketAddr};

    fn limits(max_players: usize) -> Limits {
        Limits {
            max_players,
            max_connections_per_ip: 0,
            one_connection_per_ip: false,
            kick_timeout: Duration::from_millis(100),
        }
    }

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    fn session(registry: &Registry, last: u8, port: u16) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::detached(addr(last, port)));
        registry.connect(&handle).unwrap();
        handle
    }

    fn login(name: &str, last: u8, rank: Rank) -> Login {
        Login {
            name: name.to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
            rank,
            spawn: Position::default(),
        }
    }

    fn drain(handle: &SessionHandle) -> Vec<Packet> {
        let mut sent = Vec::new();
        handle
            .queues()
            .service(usize::MAX, |packet| {
                sent.push(packet.clone());
                Ok(())
            })
            .unwrap();
        sent
    }

    #[test]
    fn test_per_ip_connection_limit() {
        let registry = Registry::new(Limits {
            max_connections_per_ip: 2,
            ..limits(10)
        });
        let first = session(&registry, 1, 1000);
        let _second = session(&registry, 1, 1001);

        let third = Arc::new(SessionHandle::detached(addr(1, 1002)));
        assert_eq!(
            registry.connect(&third),
            Err(Rejection::TooManyConnections)
        );
        assert!(registry.connect(&Arc::new(SessionHandle::detached(addr(2, 1000)))).is_ok());

        registry.disconnect(&first);
        registry.disconnect(&first);
        assert!(registry.connect(&third).is_ok());
        assert_eq!(registry.connection_count(), 3);
    }

    #[test]
    fn test_register_assigns_lowest_free_id() {
        let registry = Registry::new(limits(10));
        let a = session(&registry, 1, 1);
        let b = session(&registry, 2, 2);
        let c = session(&registry, 3, 3);

        assert_eq!(registry.register(&a, login("A", 1, Rank::Builder)).unwrap().player.id, 0);
        assert_eq!(registry.register(&b, login("B", 2, Rank::Builder)).unwrap().player.id, 1);
        registry.unregister(&a);
        assert_eq!(registry.register(&c, login("C", 3, Rank::Builder)).unwrap().player.id, 0);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_duplicate_name_evicts_older_session() {
        let registry = Registry::new(limits(10));
        let old = session(&registry, 1, 1);
        let new = session(&registry, 2, 2);

        registry.register(&old, login("Alice", 1, Rank::Builder)).unwrap();
        let registration = registry.register(&new, login("alice", 2, Rank::Builder)).unwrap();

        let evicted = registration.evicted.expect("ghost was not evicted");
        assert_eq!(evicted.id(), old.id());
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.find("ALICE").unwrap().id(), new.id());

        // the ghost's own teardown must not remove the new session
        assert!(registry.unregister(&old).is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_one_connection_per_ip() {
        let registry = Registry::new(Limits {
            one_connection_per_ip: true,
            ..limits(10)
        });
        let a = session(&registry, 1, 1);
        let b = session(&registry, 1, 2);
        registry.register(&a, login("Alice", 1, Rank::Builder)).unwrap();
        assert_eq!(
            registry.register(&b, login("Bob", 1, Rank::Builder)).err(),
            Some(Rejection::AlreadyConnectedFromIp)
        );
    }

    #[test]
    fn test_capacity_and_reserved_slots() {
        let registry = Registry::new(limits(1));
        let a = session(&registry, 1, 1);
        let b = session(&registry, 2, 2);
        let c = session(&registry, 3, 3);

        registry.register(&a, login("Alice", 1, Rank::Builder)).unwrap();
        assert_eq!(
            registry.register(&b, login("Bob", 2, Rank::Builder)).err(),
            Some(Rejection::ServerFull)
        );
        assert!(registry.register(&c, login("Carol", 3, Rank::Operator)).is_ok());
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_relogin_when_full_replaces_ghost() {
        let registry = Registry::new(limits(1));
        let old = session(&registry, 1, 1);
        let new = session(&registry, 1, 2);
        registry.register(&old, login("Alice", 1, Rank::Builder)).unwrap();
        assert!(registry.register(&new, login("Alice", 1, Rank::Builder)).is_ok());
    }

    #[test]
    fn test_unregister_broadcasts_departure() {
        let registry = Registry::new(limits(10));
        let a = session(&registry, 1, 1);
        let b = session(&registry, 2, 2);
        registry.register(&a, login("Alice", 1, Rank::Builder)).unwrap();
        registry.register(&b, login("Bob", 2, Rank::Builder)).unwrap();
        drain(&b);

        assert!(registry.unregister(&a).is_some());
        assert!(registry.unregister(&a).is_none());

        let sent = drain(&b);
        assert_eq!(sent[0].opcode(), Some(Opcode::RemoveEntity));
        assert_eq!(sent[0].bytes()[1], 0);
        assert_eq!(sent[1].opcode(), Some(Opcode::Message));
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_broadcast_skips_sessions_that_cannot_see() {
        let registry = Registry::new(limits(10));
        let guest = session(&registry, 1, 1);
        let op = session(&registry, 2, 2);
        let ghost = session(&registry, 3, 3);
        registry.register(&guest, login("Guest", 1, Rank::Guest)).unwrap();
        registry.register(&op, login("Op", 2, Rank::Operator)).unwrap();
        let hidden = registry
            .register(&ghost, login("Ghost", 3, Rank::Operator))
            .unwrap()
            .player;
        hidden.set_hidden(true);

        let packet = Message::teleport(hidden.id, Position::default()).encode().unwrap();
        registry.broadcast_about(&hidden, &packet);

        assert!(drain(&guest).is_empty());
        assert_eq!(drain(&op).len(), 1);
        assert!(drain(&ghost).is_empty());
        assert_eq!(registry.player_names(guest.player().map(|p| p.as_ref())), vec!["Guest", "Op"]);
    }

    #[test]
    fn test_player_list_and_kicks() {
        let registry = Registry::new(limits(10));
        assert_eq!(registry.player_list(None), "Nobody is online");

        let a = session(&registry, 1, 1);
        let b = session(&registry, 2, 2);
        registry.register(&a, login("Alice", 1, Rank::Builder)).unwrap();
        registry.register(&b, login("Bob", 2, Rank::Builder)).unwrap();
        assert_eq!(registry.player_list(None), "Players online (2): Alice, Bob");

        assert!(registry.kick_by_name("bob", "Bye"));
        assert!(!registry.kick_by_name("nobody", "Bye"));
        assert_eq!(registry.kick_by_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), "Bye"), 1);

        let sent = drain(&b);
        assert_eq!(sent.last().and_then(|packet| packet.opcode()), Some(Opcode::Kick));
        assert!(!b.can_queue());
    }

    #[test]
    fn test_kick_idle_spares_active_players() {
        let registry = Registry::new(limits(10));
        let idle = session(&registry, 1, 1);
        let active = session(&registry, 2, 2);
        registry.register(&idle, login("Idle", 1, Rank::Builder)).unwrap();
        let busy = registry
            .register(&active, login("Busy", 2, Rank::Builder))
            .unwrap()
            .player;

        std::thread::sleep(Duration::from_millis(60));
        busy.touch();

        assert_eq!(registry.kick_idle(Duration::from_millis(40), "Idle too long"), 1);
        assert!(!idle.can_queue());
        assert!(active.can_queue());
        assert!(drain(&idle)
            .iter()
            .any(|packet| packet.opcode() == Some(Opcode::Kick)));
    }

    #[test]
    fn test_packet_cap_never_zero() {
        let registry = Registry::new(limits(10));
        registry.set_packet_cap(0);
        assert_eq!(registry.packet_cap(), 1);
        registry.set_packet_cap(40);
        assert_eq!(registry.packet_cap(), 40);
    }
}
