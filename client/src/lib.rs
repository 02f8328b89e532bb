//! # Headless Client Library
//!
//! A scriptable client for the classic block-world protocol, used by the
//! integration tests and the `client` binary to drive a server without a
//! renderer.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The client's mirror of server state:
//! - The downloaded map, updated by block changes
//! - Other players' entities and their positions
//! - Received chat lines and the current permission level
//!
//! ### Network Module (`network`)
//! The [`network::Bot`] connection:
//! - Login handshake and level download
//! - Sending chat, movement and block changes
//! - Waiting for specific messages with a timeout
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::network::Bot;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), client::network::BotError> {
//! let mut bot = Bot::connect("127.0.0.1:25565").await?;
//! bot.login("Builder", "").await?;
//! bot.send_chat("hello").await?;
//! let line = bot.wait_for_chat("hello", Duration::from_secs(1)).await?;
//! println!("{}", line);
//! # Ok(())
//! # }
//! ```

pub mod game;
pub mod network;

pub use game::{ClientState, RemoteEntity};
pub use network::{Bot, BotError};
