//! # Block-World Server Library
//!
//! A multiplayer server for the classic block-world protocol (version 7).
//! Clients connect over TCP, log in with a name and verification key, download
//! the gzipped map and then exchange movement, chat and block changes with
//! everyone else online.
//!
//! ## Threading
//!
//! Every connection gets its own OS thread running a [`session::Session`]:
//! blocking reads during login, then a poll loop that drains the outbound
//! queues and handles inbound packets. Two scheduler threads run everything
//! else: a fast loop for the accept poll, the bandwidth throttle and idle
//! checks, and a background loop for slow work such as saving the map.
//!
//! ## Module Organization
//!
//! ### Registry (`registry`)
//! The process-wide table of sessions and players: connection limits,
//! duplicate-name eviction, entity ids and broadcasts.
//!
//! ### Session (`session`)
//! The per-connection state machine and the handle other threads use to
//! queue packets or kick.
//!
//! ### Scheduler (`scheduler`)
//! Timed and recurring tasks on the fast and background loops.
//!
//! ### Collaborators (`backend`, `memory`)
//! Player database, ban list and world storage behind traits, with in-memory
//! implementations.
//!
//! ## Outbound Flow Control
//!
//! Each session has a priority and a normal [`queue::QueuePair`]. The
//! [`throttle::Throttle`] turns the configured upload budget into a
//! per-cycle packet cap that every session obeys.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod movement;
pub mod network;
pub mod player;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod throttle;
pub mod utils;

pub use config::{ServerConfig, VerifyNames};
pub use error::{SchedulerError, ServerError, SessionError};
pub use network::Server;
pub use player::{Player, Rank};
pub use registry::Registry;
pub use scheduler::{Scheduler, Task};
