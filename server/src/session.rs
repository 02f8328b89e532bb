//! One TCP connection's worth of protocol state.
//!
//! A session moves through `Accepted → LoggingIn → Active → Disconnecting →
//! Disposed` on its own OS thread. The login handshake uses blocking reads
//! with a timeout; once active, the loop alternates between draining the
//! outbound queues and reading whatever inbound packets are available,
//! sleeping for one tick when there is nothing to do.
//!
//! Other threads talk to a session only through its [`SessionHandle`]:
//! enqueueing packets or requesting a kick.

use crate::config::VerifyNames;
use crate::context::ServerContext;
use crate::error::SessionError;
use crate::movement::{in_bounds, MovementTracker};
use crate::player::Player;
use crate::queue::{QueuePair, Serviced};
use crate::registry::Login;
use crate::utils::lock;
use log::{debug, error, info, warn};
use shared::chat::{is_valid_chat, wrap_packets};
use shared::codec::{SetBlock, SetBlockRequest, ServerIdentification};
use shared::verify::{is_valid_name, verify_name};
use shared::{
    is_valid_block, level, Message, Opcode, Packet, PaddedString, Position, Side,
    PROTOCOL_VERSION, SELF_ID,
};
use std::io::{self, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Read cycles between liveness polls.
const LIVENESS_PERIOD: u64 = 200;

const BLOCK_AIR: u8 = 0;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    LoggingIn,
    Active,
    Disconnecting,
    Disposed,
}

/// The thread-safe face of a session, shared with the registry.
pub struct SessionHandle {
    id: u64,
    addr: SocketAddr,
    socket: Option<TcpStream>,
    queues: QueuePair,
    state: Mutex<SessionState>,
    can_receive: AtomicBool,
    can_send: AtomicBool,
    can_queue: AtomicBool,
    can_dispose: AtomicBool,
    kick_deadline: Mutex<Option<Instant>>,
    player: OnceLock<Arc<Player>>,
}

impl SessionHandle {
    fn new(addr: SocketAddr, socket: Option<TcpStream>) -> Self {
        SessionHandle {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            socket,
            queues: QueuePair::new(),
            state: Mutex::new(SessionState::Accepted),
            can_receive: AtomicBool::new(true),
            can_send: AtomicBool::new(true),
            can_queue: AtomicBool::new(true),
            can_dispose: AtomicBool::new(false),
            kick_deadline: Mutex::new(None),
            player: OnceLock::new(),
        }
    }

    /// A handle with no socket behind it.
    #[cfg(test)]
    pub(crate) fn detached(addr: SocketAddr) -> Self {
        Self::new(addr, None)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn queues(&self) -> &QueuePair {
        &self.queues
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.state);
        if *current != SessionState::Disposed {
            *current = state;
        }
    }

    pub fn player(&self) -> Option<&Arc<Player>> {
        self.player.get()
    }

    pub(crate) fn attach(&self, player: Arc<Player>) {
        if self.player.set(player).is_err() {
            error!("Session {} already has a player attached", self.id);
        }
    }

    /// Player name once logged in, the remote address before that.
    pub fn describe(&self) -> String {
        match self.player() {
            Some(player) => player.name.clone(),
            None => self.addr.to_string(),
        }
    }

    pub fn can_receive(&self) -> bool {
        self.can_receive.load(Ordering::Acquire)
    }

    pub fn can_send(&self) -> bool {
        self.can_send.load(Ordering::Acquire)
    }

    pub fn can_queue(&self) -> bool {
        self.can_queue.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.can_dispose.load(Ordering::Acquire)
    }

    pub fn send(&self, packet: Packet) {
        if self.can_queue() {
            self.queues.push(packet);
        }
    }

    pub fn send_priority(&self, packet: Packet) {
        if self.can_queue() {
            self.queues.push_priority(packet);
        }
    }

    pub fn send_message(&self, message: &Message) {
        match message.encode() {
            Ok(packet) => self.send(packet),
            Err(err) => error!("Failed to encode {}: {}", message.opcode(), err),
        }
    }

    /// Wraps `text` into chat lines and queues them.
    pub fn send_text(&self, text: &str) {
        match wrap_packets(text) {
            Ok(packets) => packets.into_iter().for_each(|packet| self.send(packet)),
            Err(err) => error!("Failed to encode chat for {}: {}", self.describe(), err),
        }
    }

    /// Queues a disconnect packet ahead of everything else. The session stops
    /// reading immediately and exits once the packet is sent or `timeout`
    /// elapses. Repeated kicks are ignored.
    pub fn kick(&self, reason: &str, timeout: Duration) {
        if !self.can_queue.swap(false, Ordering::AcqRel) {
            return;
        }
        self.can_receive.store(false, Ordering::Release);
        match Message::kick(reason).encode() {
            Ok(packet) => self.queues.push_priority(packet),
            Err(err) => error!("Failed to encode kick for {}: {}", self.describe(), err),
        }
        *lock(&self.kick_deadline) = Some(Instant::now() + timeout);
        info!("Kicking {}: {}", self.describe(), reason);
    }

    fn kick_expired(&self) -> bool {
        let deadline = *lock(&self.kick_deadline);
        deadline.map_or(false, |deadline| Instant::now() >= deadline)
    }

    fn begin_disconnect(&self) {
        self.can_queue.store(false, Ordering::Release);
        self.can_receive.store(false, Ordering::Release);
        self.set_state(SessionState::Disconnecting);
    }

    /// Forcibly closes the socket, unblocking any pending read or write.
    pub fn close(&self) {
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

enum Availability {
    Data,
    Empty,
    Closed,
}

/// The I/O side of a session, owned by its thread.
pub struct Session {
    handle: Arc<SessionHandle>,
    stream: TcpStream,
    writer: BufWriter<TcpStream>,
    context: Arc<ServerContext>,
    movement: MovementTracker,
    cycles: u64,
    last_ping: Instant,
}

impl Session {
    /// Wraps an accepted connection and starts its I/O thread.
    pub fn spawn(
        stream: TcpStream,
        addr: SocketAddr,
        context: Arc<ServerContext>,
    ) -> io::Result<(Arc<SessionHandle>, JoinHandle<()>)> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;

        let handle = Arc::new(SessionHandle::new(addr, Some(stream.try_clone()?)));
        let session = Session {
            handle: Arc::clone(&handle),
            writer: BufWriter::new(stream.try_clone()?),
            stream,
            context,
            movement: MovementTracker::new(Position::default()),
            cycles: 0,
            last_ping: Instant::now(),
        };

        let thread = thread::Builder::new()
            .name(format!("session-{}", addr))
            .spawn(move || session.run())?;
        Ok((handle, thread))
    }

    fn run(mut self) {
        debug!("Accepted connection from {}", self.handle.addr());
        self.handle.set_state(SessionState::LoggingIn);

        let result = match self.context.registry.connect(&self.handle) {
            Ok(()) => match self.login() {
                Ok(Some(player)) => self.io_loop(&player),
                Ok(None) => Ok(()),
                Err(err) => Err(err),
            },
            Err(rejection) => {
                info!("Refused {}: {}", self.handle.addr(), rejection.reason());
                self.kick_now(rejection.reason())
            }
        };

        if let Err(err) = result {
            if err.is_transport() {
                info!("{} disconnected: {}", self.handle.describe(), err);
            } else {
                error!("Session {} failed: {}", self.handle.describe(), err);
            }
        }
        self.dispose();
    }

    /// Runs the handshake. Returns the player on success, `None` if the
    /// client was kicked.
    fn login(&mut self) -> Result<Option<Arc<Player>>, SessionError> {
        let context = Arc::clone(&self.context);
        let config = &context.config;
        let ip = self.handle.addr().ip();

        self.stream.set_read_timeout(Some(config.login_timeout()))?;
        self.stream.set_write_timeout(Some(config.login_timeout()))?;

        let mut opcode = [0u8; 1];
        self.stream.read_exact(&mut opcode)?;
        if opcode[0] != Opcode::Handshake.as_byte() {
            warn!(
                target: "suspicious",
                "{} sent opcode 0x{:02x} instead of a handshake",
                self.handle.addr(),
                opcode[0]
            );
            self.kick_now("Unexpected handshake message")?;
            return Ok(None);
        }

        let mut payload = vec![0u8; Opcode::Handshake.payload_len()];
        self.stream.read_exact(&mut payload)?;
        let Message::Handshake(handshake) =
            Message::decode(Opcode::Handshake, &payload, Side::Client)?
        else {
            self.kick_now("Unexpected handshake message")?;
            return Ok(None);
        };

        if handshake.protocol_version != PROTOCOL_VERSION {
            info!(
                "{} uses protocol version {}, expected {}",
                self.handle.addr(),
                handshake.protocol_version,
                PROTOCOL_VERSION
            );
            self.kick_now("Incompatible protocol version!")?;
            return Ok(None);
        }

        let name = handshake.name.to_text();
        if !is_valid_name(&name) {
            warn!(target: "suspicious", "{} tried to log in as {:?}", self.handle.addr(), name);
            self.kick_now("Invalid characters in player name!")?;
            return Ok(None);
        }

        let record = context.players.find_or_create(&name);
        if let Some(ban) = &record.ban {
            context.players.record_failed_login(&name, ip);
            info!("Banned player {} tried to log in from {}", name, ip);
            self.kick_now(&ban.name_message())?;
            return Ok(None);
        }
        if let Some(ban) = context.bans.ip_ban(ip) {
            context.players.record_failed_login(&name, ip);
            info!("{} tried to log in from banned IP {}", name, ip);
            self.kick_now(&ban.ip_message())?;
            return Ok(None);
        }

        let mut announcement = None;
        let key = handshake.verification_key.to_text();
        if !verify_name(&key, &context.salt, &name) {
            let first_visit = record.times_visited == 0;
            let ip_changed = record.last_ip != Some(ip);
            let fatal = match config.verify_names {
                VerifyNames::Always => true,
                VerifyNames::Balanced => first_visit || ip_changed,
                VerifyNames::Never => false,
            };

            if fatal {
                context.players.record_failed_login(&name, ip);
                warn!(
                    target: "suspicious",
                    "{} failed name verification from {} (first visit: {}, IP changed: {})",
                    name,
                    ip,
                    first_visit,
                    ip_changed
                );
                self.kick_now("Could not verify player name!")?;
                return Ok(None);
            }

            warn!(target: "suspicious", "{} logged in from {} without verification", name, ip);
            announcement = Some(if ip_changed {
                format!("&cName and IP of {} are unverified!", name)
            } else {
                format!("&cName of {} is unverified!", name)
            });
        }

        let login = Login {
            name: name.clone(),
            ip,
            rank: record.rank,
            spawn: context.world.spawn(),
        };
        let registration = match context.registry.register(&self.handle, login) {
            Ok(registration) => registration,
            Err(rejection) => {
                info!("Refused {}: {}", name, rejection.reason());
                self.kick_now(rejection.reason())?;
                return Ok(None);
            }
        };
        if let Some(ghost) = registration.evicted {
            ghost.kick("Connected from elsewhere!", config.kick_timeout());
        }
        context.players.record_login(&name, ip);
        let player = registration.player;

        self.send_world(&player)?;

        let presence = Message::add_entity(player.id, &player.name, player.position()).encode()?;
        context.registry.broadcast_about(&player, &presence);
        context
            .registry
            .broadcast_text(&format!("&e{} joined the server", player.name));
        if let Some(text) = announcement {
            context.registry.broadcast_text(&text);
        }

        self.movement = MovementTracker::new(player.position());
        self.handle.set_state(SessionState::Active);
        info!("{} logged in from {}", player.name, ip);
        Ok(Some(player))
    }

    /// Identification, level transfer, the players already online and the
    /// spawn, written straight to the socket.
    fn send_world(&mut self, player: &Player) -> Result<(), SessionError> {
        let context = Arc::clone(&self.context);
        let config = &context.config;

        let mut messages = vec![Message::ServerIdentification(ServerIdentification {
            protocol_version: PROTOCOL_VERSION,
            server_name: PaddedString::new(&config.server_name),
            motd: PaddedString::new(&config.motd),
            user_type: player.rank().user_type(),
        })];
        messages.extend(level::transfer(
            &context.world.snapshot(),
            context.world.dimensions(),
        )?);

        for session in context.registry.players().iter() {
            if let Some(other) = session.player() {
                if player.can_see(other) {
                    messages.push(Message::add_entity(other.id, &other.name, other.position()));
                }
            }
        }
        // The self teleport is the last packet of the login sequence.
        let spawn = player.position();
        messages.push(Message::add_entity(SELF_ID, &player.name, spawn));
        messages.push(Message::teleport(SELF_ID, spawn));

        for message in &messages {
            self.writer.write_all(message.encode()?.bytes())?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn io_loop(&mut self, player: &Arc<Player>) -> Result<(), SessionError> {
        let tick = self.context.config.tick();
        let ping_interval = self.context.config.ping_interval();

        while self.handle.can_send() {
            if self.handle.kick_expired() {
                return Err(SessionError::KickTimeout);
            }

            self.cycles += 1;
            if self.cycles % LIVENESS_PERIOD == 0 && self.last_ping.elapsed() >= ping_interval {
                self.handle.send_message(&Message::Ping);
                self.last_ping = Instant::now();
            }

            let serviced = self.service()?;
            if serviced.disconnect {
                self.handle.begin_disconnect();
                return Ok(());
            }

            while self.handle.can_receive() {
                match self.availability()? {
                    Availability::Empty => break,
                    Availability::Closed => {
                        debug!("{} closed the connection", player.name);
                        self.handle.begin_disconnect();
                        return Ok(());
                    }
                    Availability::Data => {
                        if !self.dispatch(player)? {
                            return Ok(());
                        }
                    }
                }
            }

            // One cycle per tick keeps the packet cap a per-tick budget.
            thread::sleep(tick);
        }
        Ok(())
    }

    fn service(&mut self) -> Result<Serviced, SessionError> {
        let cap = self.context.registry.packet_cap();
        let writer = &mut self.writer;
        let serviced = self
            .handle
            .queues()
            .service(cap, |packet| writer.write_all(packet.bytes()))?;
        if serviced.sent > 0 {
            writer.flush()?;
        }
        Ok(serviced)
    }

    /// Non-blocking probe for inbound data that also detects a closed peer.
    fn availability(&mut self) -> Result<Availability, SessionError> {
        let mut probe = [0u8; 1];
        self.stream.set_nonblocking(true)?;
        let result = self.stream.peek(&mut probe);
        self.stream.set_nonblocking(false)?;

        match result {
            Ok(0) => Ok(Availability::Closed),
            Ok(_) => Ok(Availability::Data),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Availability::Empty),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads and handles one packet. Returns false once the session has been
    /// kicked.
    fn dispatch(&mut self, player: &Arc<Player>) -> Result<bool, SessionError> {
        let mut opcode = [0u8; 1];
        self.stream.read_exact(&mut opcode)?;

        let Some(opcode) = Opcode::from_byte(opcode[0]) else {
            warn!(
                target: "suspicious",
                "{} sent unknown opcode 0x{:02x}",
                player.name,
                opcode[0]
            );
            self.kick_now("Unknown packet opcode")?;
            return Ok(false);
        };
        if opcode == Opcode::Handshake || !opcode.sent_by(Side::Client) {
            warn!(target: "suspicious", "{} sent unexpected {}", player.name, opcode);
            self.kick_now("Unexpected packet")?;
            return Ok(false);
        }

        let mut payload = vec![0u8; opcode.payload_len()];
        self.stream.read_exact(&mut payload)?;
        match Message::decode(opcode, &payload, Side::Client)? {
            Message::Chat(chat) => {
                let raw = String::from_utf8_lossy(chat.text.as_bytes()).into_owned();
                self.handle_chat(player, &raw)
            }
            Message::Teleport(teleport) => self.handle_move(player, teleport.position),
            Message::SetBlockRequest(request) => self.handle_set_block(player, request),
            other => {
                warn!(target: "suspicious", "{} sent unexpected {}", player.name, other.opcode());
                self.kick_now("Unexpected packet")?;
                Ok(false)
            }
        }
    }

    fn handle_chat(&mut self, player: &Arc<Player>, raw: &str) -> Result<bool, SessionError> {
        if !is_valid_chat(raw) {
            warn!(target: "suspicious", "{} sent illegal characters in chat", player.name);
            self.kick_now("Illegal character in chat message!")?;
            return Ok(false);
        }

        player.touch();
        let text = raw.trim();
        if text.is_empty() {
            return Ok(true);
        }

        match text.strip_prefix('/') {
            Some(command) => self.handle_command(player, command.trim()),
            None => {
                info!("{}: {}", player.name, text);
                self.context
                    .registry
                    .broadcast_text(&format!("{}&f: {}", player.display_name(), text));
            }
        }
        Ok(true)
    }

    fn handle_command(&self, player: &Player, command: &str) {
        let registry = &self.context.registry;
        match command.split_whitespace().next().unwrap_or_default() {
            "players" | "who" => self.handle.send_text(&registry.player_list(Some(player))),
            other => self
                .handle
                .send_text(&format!("&cUnknown command: /{}", other)),
        }
    }

    fn handle_move(&mut self, player: &Arc<Player>, position: Position) -> Result<bool, SessionError> {
        if !in_bounds(self.context.world.dimensions(), &position) {
            warn!(
                target: "suspicious",
                "{} moved out of bounds to ({}, {}, {})",
                player.name,
                position.x,
                position.y,
                position.z
            );
            self.kick_now("Hacking detected: out of map bounds")?;
            return Ok(false);
        }

        let current = player.position();
        if position.rotation_differs(&current) {
            player.touch();
        }

        let accepted = if player.is_frozen() {
            let rotated = current.with_rotation(position.yaw, position.pitch);
            if !position.delta_from(&current).is_zero() {
                self.handle.send_message(&Message::teleport(SELF_ID, rotated));
            }
            rotated
        } else {
            position
        };
        player.set_position(accepted);

        if let Some(update) = self.movement.update(player.id, accepted) {
            let packet = update.encode()?;
            self.context.registry.broadcast_about(player, &packet);
        }
        Ok(true)
    }

    fn handle_set_block(
        &mut self,
        player: &Arc<Player>,
        request: SetBlockRequest,
    ) -> Result<bool, SessionError> {
        let dimensions = self.context.world.dimensions();
        let (x, y, z) = (request.x as i32, request.y as i32, request.z as i32);
        if !dimensions.contains(x, y, z) || !is_valid_block(request.block) || request.mode > 1 {
            warn!(
                target: "suspicious",
                "{} sent an invalid block change: {:?}",
                player.name,
                request
            );
            self.kick_now("Hacking detected: invalid block change")?;
            return Ok(false);
        }

        let block = if request.mode == 0 {
            BLOCK_AIR
        } else {
            request.block
        };
        let world = &self.context.world;
        let accepted = player.rank().can_build()
            && world.set_block(request.x, request.y, request.z, block, &player.name);

        let change = |block| {
            Message::SetBlock(SetBlock {
                x: request.x,
                y: request.y,
                z: request.z,
                block,
            })
        };
        if accepted {
            let packet = change(block).encode()?;
            self.context.registry.broadcast_except(&packet, &self.handle);
        } else {
            debug!("Reverting block change by {} at ({}, {}, {})", player.name, x, y, z);
            let original = world.block(x, y, z).unwrap_or(BLOCK_AIR);
            self.handle.send_message(&change(original));
        }
        Ok(true)
    }

    /// Writes a disconnect packet straight to the socket, bypassing the
    /// queues, and stops all further work on this session.
    fn kick_now(&mut self, reason: &str) -> Result<(), SessionError> {
        self.handle.begin_disconnect();
        info!("Kicked {}: {}", self.handle.describe(), reason);
        let packet = Message::kick(reason).encode()?;
        self.writer.write_all(packet.bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    fn dispose(mut self) {
        self.handle.begin_disconnect();
        self.context.registry.unregister(&self.handle);
        self.context.registry.disconnect(&self.handle);

        self.handle.can_send.store(false, Ordering::Release);
        self.handle.queues.clear();
        let _ = self.writer.flush();
        let _ = self.stream.shutdown(Shutdown::Both);

        self.handle.can_dispose.store(true, Ordering::Release);
        self.handle.set_state(SessionState::Disposed);
        debug!("Session {} disposed", self.handle.describe());
    }
}
