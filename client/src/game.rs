use log::debug;
use shared::codec::ServerIdentification;
use shared::level::{LevelAssembler, LevelError};
use shared::{Dimensions, Message, Position, SELF_ID};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntity {
    pub name: String,
    pub position: Position,
}

/// The client's view of the server: map, entities and chat, kept up to date
/// by applying every received message.
#[derive(Debug, Default)]
pub struct ClientState {
    pub identification: Option<ServerIdentification>,
    pub user_type: u8,
    pub position: Position,
    level: Option<(Dimensions, Vec<u8>)>,
    assembler: LevelAssembler,
    entities: HashMap<i8, RemoteEntity>,
    chat: Vec<String>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, message: &Message) -> Result<(), LevelError> {
        match message {
            Message::ServerIdentification(identification) => {
                self.user_type = identification.user_type;
                self.identification = Some(identification.clone());
            }
            Message::LevelBegin => self.assembler.begin(),
            Message::LevelChunk(chunk) => {
                let progress = self.assembler.push(chunk)?;
                debug!("Level download at {}%", progress);
            }
            Message::LevelEnd(end) => {
                self.level = Some(self.assembler.finish(*end)?);
                self.entities.clear();
            }
            Message::SetBlock(change) => {
                if let Some((dimensions, blocks)) = &mut self.level {
                    let index =
                        dimensions.index(change.x as i32, change.y as i32, change.z as i32);
                    if let Some(index) = index {
                        blocks[index] = change.block;
                    }
                }
            }
            Message::AddEntity(entity) => {
                if entity.id == SELF_ID {
                    self.position = entity.position;
                } else {
                    self.entities.insert(
                        entity.id,
                        RemoteEntity {
                            name: entity.name.to_text(),
                            position: entity.position,
                        },
                    );
                }
            }
            Message::Teleport(teleport) => {
                if teleport.id == SELF_ID {
                    self.position = teleport.position;
                } else if let Some(entity) = self.entities.get_mut(&teleport.id) {
                    entity.position = teleport.position;
                }
            }
            Message::MoveRotate(update) => {
                if let Some(entity) = self.entities.get_mut(&update.id) {
                    let moved = shift(entity.position, update.dx, update.dy, update.dz);
                    entity.position = moved.with_rotation(update.yaw, update.pitch);
                }
            }
            Message::Move(update) => {
                if let Some(entity) = self.entities.get_mut(&update.id) {
                    entity.position = shift(entity.position, update.dx, update.dy, update.dz);
                }
            }
            Message::Rotate(update) => {
                if let Some(entity) = self.entities.get_mut(&update.id) {
                    entity.position = entity.position.with_rotation(update.yaw, update.pitch);
                }
            }
            Message::RemoveEntity { id } => {
                self.entities.remove(id);
            }
            Message::Chat(chat) => self.chat.push(chat.text.to_text()),
            Message::SetPermission { user_type } => self.user_type = *user_type,
            _ => {}
        }
        Ok(())
    }

    pub fn dimensions(&self) -> Option<Dimensions> {
        self.level.as_ref().map(|(dimensions, _)| *dimensions)
    }

    pub fn block(&self, x: i32, y: i32, z: i32) -> Option<u8> {
        let (dimensions, blocks) = self.level.as_ref()?;
        blocks.get(dimensions.index(x, y, z)?).copied()
    }

    pub fn entity(&self, id: i8) -> Option<&RemoteEntity> {
        self.entities.get(&id)
    }

    pub fn find_entity(&self, name: &str) -> Option<(i8, &RemoteEntity)> {
        self.entities
            .iter()
            .find(|(_, entity)| entity.name.eq_ignore_ascii_case(name))
            .map(|(id, entity)| (*id, entity))
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn chat(&self) -> &[String] {
        &self.chat
    }
}

fn shift(position: Position, dx: i8, dy: i8, dz: i8) -> Position {
    Position {
        x: position.x.wrapping_add(dx as i16),
        y: position.y.wrapping_add(dy as i16),
        z: position.z.wrapping_add(dz as i16),
        ..position
    }
}
