use crate::game::ClientState;
use log::{debug, info, warn};
use shared::codec::{CodecError, Handshake, ServerIdentification, SetBlockRequest, Teleport};
use shared::level::LevelError;
use shared::{Message, Opcode, PaddedString, Position, Side, PROTOCOL_VERSION, SELF_ID};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("level error: {0}")]
    Level(#[from] LevelError),

    #[error("kicked: {0}")]
    Kicked(String),

    #[error("unexpected {0} during login")]
    Unexpected(Opcode),

    #[error("timed out waiting for the server")]
    Timeout,
}

/// A headless protocol client. Every received message is applied to the
/// bot's [`ClientState`] before it is returned.
pub struct Bot {
    stream: TcpStream,
    buffer: Vec<u8>,
    state: ClientState,
    name: String,
}

impl Bot {
    pub async fn connect(server_addr: &str) -> Result<Self, BotError> {
        let stream = TcpStream::connect(server_addr).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", server_addr);

        Ok(Bot {
            stream,
            buffer: Vec::with_capacity(4096),
            state: ClientState::new(),
            name: String::new(),
        })
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends the handshake and waits for the level and the spawn teleport.
    pub async fn login(&mut self, name: &str, key: &str) -> Result<ServerIdentification, BotError> {
        self.name = name.to_string();
        self.send(&Message::Handshake(Handshake {
            protocol_version: PROTOCOL_VERSION,
            name: PaddedString::new(name),
            verification_key: PaddedString::new(key),
            unused: 0,
        }))
        .await?;

        let identification = match self.next_message().await? {
            Message::ServerIdentification(identification) => identification,
            Message::Kick { reason } => return Err(BotError::Kicked(reason.to_text())),
            other => return Err(BotError::Unexpected(other.opcode())),
        };

        let mut level_done = false;
        loop {
            match self.next_message().await? {
                Message::LevelBegin | Message::LevelChunk(_) | Message::Ping => {}
                Message::LevelEnd(_) => level_done = true,
                Message::AddEntity(_) if level_done => {}
                Message::Teleport(teleport) if level_done && teleport.id == SELF_ID => break,
                Message::Kick { reason } => return Err(BotError::Kicked(reason.to_text())),
                other => return Err(BotError::Unexpected(other.opcode())),
            }
        }

        info!(
            "{} joined {} ({})",
            name,
            identification.server_name.to_text(),
            identification.motd.to_text()
        );
        Ok(identification)
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), BotError> {
        let packet = message.encode()?;
        self.stream.write_all(packet.bytes()).await?;
        Ok(())
    }

    /// Sends raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), BotError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn send_chat(&mut self, text: &str) -> Result<(), BotError> {
        self.send(&Message::chat(text)).await
    }

    pub async fn move_to(&mut self, position: Position) -> Result<(), BotError> {
        self.state.position = position;
        self.send(&Message::Teleport(Teleport {
            id: SELF_ID,
            position,
        }))
        .await
    }

    /// Places `block` at the given coordinates, or breaks whatever is there
    /// when `place` is false.
    pub async fn set_block(
        &mut self,
        (x, y, z): (i16, i16, i16),
        place: bool,
        block: u8,
    ) -> Result<(), BotError> {
        self.send(&Message::SetBlockRequest(SetBlockRequest {
            x,
            y,
            z,
            mode: place as u8,
            block,
        }))
        .await
    }

    /// Reads the next complete message. Cancel-safe: a partially received
    /// packet stays buffered.
    pub async fn next_message(&mut self) -> Result<Message, BotError> {
        loop {
            if let Some(message) = self.take_buffered()? {
                self.state.apply(&message)?;
                return Ok(message);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(BotError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    pub async fn next_message_within(&mut self, limit: Duration) -> Result<Message, BotError> {
        timeout(limit, self.next_message())
            .await
            .map_err(|_| BotError::Timeout)?
    }

    /// Skips messages until one satisfies `predicate`. A kick that does not
    /// match ends the wait with [`BotError::Kicked`].
    pub async fn wait_for<F>(&mut self, limit: Duration, mut predicate: F) -> Result<Message, BotError>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = self.next_message_within(remaining).await?;
            if predicate(&message) {
                return Ok(message);
            }
            if let Message::Kick { reason } = message {
                return Err(BotError::Kicked(reason.to_text()));
            }
        }
    }

    /// Waits for a chat line containing `needle`.
    pub async fn wait_for_chat(&mut self, needle: &str, limit: Duration) -> Result<String, BotError> {
        let message = self
            .wait_for(limit, |message| {
                matches!(message, Message::Chat(chat) if chat.text.to_text().contains(needle))
            })
            .await?;
        match message {
            Message::Chat(chat) => Ok(chat.text.to_text()),
            other => Err(BotError::Unexpected(other.opcode())),
        }
    }

    /// Waits for the server to disconnect us and returns the reason.
    pub async fn wait_for_kick(&mut self, limit: Duration) -> Result<String, BotError> {
        match self
            .wait_for(limit, |message| matches!(message, Message::Kick { .. }))
            .await
        {
            Ok(Message::Kick { reason }) => Ok(reason.to_text()),
            Ok(other) => Err(BotError::Unexpected(other.opcode())),
            Err(err) => Err(err),
        }
    }

    /// Reads and logs messages until the connection closes.
    pub async fn run(&mut self) -> Result<(), BotError> {
        loop {
            match self.next_message().await? {
                Message::Chat(chat) => info!("{}", chat.text.to_text()),
                Message::Kick { reason } => {
                    warn!("Disconnected: {}", reason.to_text());
                    return Ok(());
                }
                Message::AddEntity(entity) if entity.id != SELF_ID => {
                    info!("{} is here", entity.name.to_text())
                }
                _ => {}
            }
        }
    }

    fn take_buffered(&mut self) -> Result<Option<Message>, BotError> {
        let Some(&first) = self.buffer.first() else {
            return Ok(None);
        };
        let opcode = Opcode::from_byte(first).ok_or(CodecError::UnknownOpcode(first))?;
        let len = 1 + opcode.payload_len();
        if self.buffer.len() < len {
            return Ok(None);
        }

        let message = Message::decode(opcode, &self.buffer[1..len], Side::Server)?;
        self.buffer.drain(..len);
        Ok(Some(message))
    }
}
