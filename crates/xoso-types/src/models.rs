use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::MessageDto;
use crate::ids::{EventId, MessageId, PrivateRoomId, TempId, UserId};

/// A logical channel multiplexed over the shared connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Room {
    /// The site-wide group chat.
    Chat,
    /// A two-party conversation or a personal notification channel.
    Private(PrivateRoomId),
    /// The comment stream of one lottery event.
    Event(EventId),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => f.write_str("chat"),
            Self::Private(id) => write!(f, "private:{}", id),
            Self::Event(id) => write!(f, "event:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub name: String,
}

/// Identity of a log entry: provisional until the server has persisted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Provisional(TempId),
    Confirmed(MessageId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub key: MessageKey,
    pub author: Author,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub room: Room,
    pub likes: Vec<UserId>,
    /// Only comments carry replies; chat messages and replies leave it empty.
    pub replies: Vec<Message>,
    /// Temporary id echoed back by servers that support exact reconciliation.
    pub client_ref: Option<TempId>,
}

impl Message {
    pub fn provisional(
        temp_id: TempId,
        author: Author,
        content: String,
        created_at: DateTime<Utc>,
        room: Room,
    ) -> Self {
        Self {
            key: MessageKey::Provisional(temp_id),
            author,
            content,
            created_at,
            room,
            likes: Vec::new(),
            replies: Vec::new(),
            client_ref: Some(temp_id),
        }
    }

    /// Convert a server payload into a confirmed entry of `room`.
    pub fn from_dto(dto: MessageDto, room: Room) -> Self {
        let replies = dto
            .replies
            .into_iter()
            .map(|r| Message::from_dto(r, room.clone()))
            .collect();
        Self {
            key: MessageKey::Confirmed(dto.id),
            author: Author {
                id: dto.author.id,
                name: dto.author.username,
            },
            content: dto.content,
            created_at: dto.created_at,
            room,
            likes: dto.likes,
            replies,
            client_ref: dto.client_ref,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.key, MessageKey::Provisional(_))
    }

    pub fn server_id(&self) -> Option<&MessageId> {
        match &self.key {
            MessageKey::Confirmed(id) => Some(id),
            MessageKey::Provisional(_) => None,
        }
    }

    pub fn temp_id(&self) -> Option<TempId> {
        match self.key {
            MessageKey::Provisional(id) => Some(id),
            MessageKey::Confirmed(_) => None,
        }
    }
}

/// Connection lifecycle as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected and the credential has been transmitted.
    Authenticated,
}

impl ConnectionState {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }
}
