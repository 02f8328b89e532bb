//! Server assembly: binds the listener, wires the collaborators together and
//! registers the recurring work with the scheduler.

use crate::backend::{BanList, PlayerDb, World};
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::error::ServerError;
use crate::memory::{FlatWorld, MemoryBanList, MemoryPlayerDb};
use crate::player::Rank;
use crate::registry::{Limits, Registry};
use crate::scheduler::{Scheduler, Task, DEFAULT_QUANTUM};
use crate::session::{Session, SessionHandle};
use crate::throttle::Throttle;
use crate::utils::lock;
use log::{debug, error, info, warn};
use shared::verify::generate_salt;
use shared::Message;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type SessionThreads = Arc<Mutex<Vec<(Arc<SessionHandle>, JoinHandle<()>)>>>;

/// Main server: owns the listener until started, then the scheduler and the
/// session threads.
pub struct Server {
    context: Arc<ServerContext>,
    scheduler: Scheduler,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    save_task: Task,
    sessions: SessionThreads,
}

impl Server {
    /// Binds the configured address. Nothing is accepted until [`Server::start`].
    pub fn bind(
        config: ServerConfig,
        players: Arc<dyn PlayerDb>,
        bans: Arc<dyn BanList>,
        world: Arc<dyn World>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind).map_err(|source| ServerError::Bind {
            addr: config.bind.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let registry = Arc::new(Registry::new(Limits::from(&config)));
        let context = Arc::new(ServerContext {
            config,
            registry,
            players,
            bans,
            world,
            salt: generate_salt(),
        });

        let save_task = {
            let world = Arc::clone(&context.world);
            Task::new("save", move |_| world.save()).background()
        };

        Ok(Server {
            context,
            scheduler: Scheduler::new(DEFAULT_QUANTUM),
            listener: Some(listener),
            local_addr,
            save_task,
            sessions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Binds with in-memory player, ban and world backends.
    pub fn with_memory_backends(config: ServerConfig) -> Result<Self, ServerError> {
        let world = FlatWorld::new(config.map_dimensions());
        Self::bind(
            config,
            Arc::new(MemoryPlayerDb::new(Rank::default())),
            Arc::new(MemoryBanList::new()),
            Arc::new(world),
        )
    }

    /// Starts the scheduler loops and registers the accept, throttle,
    /// idle-check and save tasks.
    pub fn start(&mut self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "server already started"))?;
        let config = &self.context.config;

        self.scheduler.start()?;

        let accept = {
            let context = Arc::clone(&self.context);
            let sessions = Arc::clone(&self.sessions);
            Task::new("accept", move |task| {
                if let Some(listener) = task.payload::<TcpListener>() {
                    accept_pending(&listener, &context, &sessions);
                }
                Ok(())
            })
            .with_payload(listener)
        };
        self.scheduler
            .run_forever(&accept, config.accept_interval(), Duration::ZERO)?;

        let throttle = {
            let registry = Arc::clone(&self.context.registry);
            let throttle = Throttle::new(config);
            Task::new("throttle", move |_| {
                registry.set_packet_cap(throttle.cap_for(registry.count()));
                Ok(())
            })
        };
        self.scheduler
            .run_forever(&throttle, config.tick(), Duration::ZERO)?;

        if let Some(limit) = config.max_idle() {
            let registry = Arc::clone(&self.context.registry);
            let reason = format!("Idle for more than {} minutes", config.max_idle_minutes);
            let idle = Task::new("idle-check", move |_| {
                let kicked = registry.kick_idle(limit, &reason);
                if kicked > 0 {
                    info!("Kicked {} idle players", kicked);
                }
                Ok(())
            });
            self.scheduler
                .run_forever(&idle, Duration::from_secs(1), Duration::from_secs(1))?;
        }

        if let Some(interval) = config.autosave_interval() {
            let world = Arc::clone(&self.context.world);
            let autosave = Task::new("autosave", move |_| world.save()).background();
            self.scheduler.run_forever(&autosave, interval, interval)?;
        }

        self.scheduler.run_manual(&self.save_task, None)?;
        info!(
            "Server started: {} (max {} players)",
            config.server_name, config.max_players
        );
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.context.registry
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn salt(&self) -> &str {
        &self.context.salt
    }

    /// Asks the background loop to save the world as soon as possible.
    pub fn save_now(&self) {
        self.save_task.trigger();
    }

    /// Number of completed manual saves.
    pub fn saves_completed(&self) -> u64 {
        self.save_task.executions()
    }

    /// Persists the new rank and, if the player is online, tells their client
    /// whether it may now break special blocks.
    pub fn change_rank(&self, name: &str, rank: Rank) -> bool {
        let stored = self.context.players.set_rank(name, rank);
        let Some(session) = self.context.registry.find(name) else {
            return stored;
        };
        if let Some(player) = session.player() {
            player.set_rank(rank);
            session.send_message(&Message::SetPermission {
                user_type: rank.user_type(),
            });
            session.send_text(&format!("&eYour rank is now {}{:?}", rank.color(), rank));
            info!("{} is now ranked {:?}", player.name, rank);
        }
        true
    }

    pub fn kick(&self, name: &str, reason: &str) -> bool {
        self.context.registry.kick_by_name(name, reason)
    }

    pub fn kick_ip(&self, ip: IpAddr, reason: &str) -> usize {
        self.context.registry.kick_by_ip(ip, reason)
    }

    pub fn set_frozen(&self, name: &str, frozen: bool) -> bool {
        match self.context.registry.find(name) {
            Some(session) => match session.player() {
                Some(player) => {
                    player.set_frozen(frozen);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Hides or reveals a player, spawning or despawning their entity for
    /// every viewer whose visibility changed.
    pub fn set_hidden(&self, name: &str, hidden: bool) -> bool {
        let registry = &self.context.registry;
        let Some(player) = registry
            .find(name)
            .and_then(|session| session.player().cloned())
        else {
            return false;
        };

        let viewers = registry.players();
        let before: Vec<bool> = viewers
            .iter()
            .map(|viewer| viewer.player().map_or(false, |v| v.can_see(&player)))
            .collect();
        player.set_hidden(hidden);

        for (viewer, saw) in viewers.iter().zip(before) {
            let sees = viewer.player().map_or(false, |v| v.can_see(&player));
            if saw && !sees {
                viewer.send_message(&Message::RemoveEntity { id: player.id });
            } else if !saw && sees {
                viewer.send_message(&Message::add_entity(
                    player.id,
                    &player.name,
                    player.position(),
                ));
            }
        }
        true
    }

    pub fn player_list(&self) -> String {
        self.context.registry.player_list(None)
    }

    pub fn player_count(&self) -> usize {
        self.context.registry.count()
    }

    /// Sends one chat line to everyone online as the console.
    pub fn say(&self, text: &str) {
        self.context
            .registry
            .broadcast_text(&format!("&d[Console] {}", text));
    }

    /// Kicks everyone, waits for the session threads within the grace
    /// period, saves the world and stops the scheduler.
    pub fn shutdown(&self) {
        info!("Shutting down server...");
        let config = &self.context.config;

        self.scheduler.begin_shutdown();
        self.context.registry.kick_all("Server shutting down");

        let deadline = Instant::now() + config.shutdown_grace();
        let sessions: Vec<_> = lock(&self.sessions).drain(..).collect();
        let mut stragglers = Vec::new();
        for (handle, thread) in sessions {
            while !thread.is_finished() && Instant::now() < deadline {
                thread::sleep(DEFAULT_QUANTUM);
            }
            if thread.is_finished() {
                join_session(thread);
            } else {
                stragglers.push((handle, thread));
            }
        }
        if !stragglers.is_empty() {
            warn!("Closing {} sessions that did not exit in time", stragglers.len());
        }
        for (handle, thread) in stragglers {
            handle.close();
            join_session(thread);
        }

        if let Err(err) = self.context.world.save() {
            error!("Final save failed: {:#}", err);
        }
        self.scheduler.end_shutdown();
        info!("Server stopped");
    }
}

fn accept_pending(listener: &TcpListener, context: &Arc<ServerContext>, sessions: &SessionThreads) {
    let mut sessions = lock(sessions);
    sessions.retain(|(_, thread)| !thread.is_finished());

    loop {
        match listener.accept() {
            Ok((stream, addr)) => match Session::spawn(stream, addr, Arc::clone(context)) {
                Ok(session) => sessions.push(session),
                Err(err) => error!("Failed to start session for {}: {}", addr, err),
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                warn!("Error accepting connection: {}", err);
                break;
            }
        }
    }
}

fn join_session(thread: JoinHandle<()>) {
    if thread.join().is_err() {
        error!("Session thread panicked");
    } else {
        debug!("Session thread joined");
    }
}
