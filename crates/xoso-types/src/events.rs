use serde::{Deserialize, Serialize};

use crate::api::{MessageDto, UserDto};
use crate::ids::{EventId, MessageId, PrivateRoomId, UserId};
use crate::models::Room;

/// Events pushed by the socket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// A message was posted to the group chat
    #[serde(rename = "NEW_MESSAGE")]
    NewMessage { message: MessageDto },

    /// A private message between the author and `recipient_id`
    #[serde(rename = "PRIVATE_MESSAGE", rename_all = "camelCase")]
    PrivateMessage {
        message: MessageDto,
        recipient_id: UserId,
    },

    /// A comment was posted on an event
    #[serde(rename = "NEW_COMMENT", rename_all = "camelCase")]
    NewComment { event_id: EventId, comment: MessageDto },

    /// A reply was posted under a comment
    #[serde(rename = "NEW_REPLY", rename_all = "camelCase")]
    NewReply {
        event_id: EventId,
        comment_id: MessageId,
        reply: MessageDto,
    },

    /// Like set of a comment changed
    #[serde(rename = "COMMENT_LIKED", rename_all = "camelCase")]
    CommentLiked {
        event_id: EventId,
        comment_id: MessageId,
        likes: Vec<UserId>,
    },

    /// Like set of a reply changed
    #[serde(rename = "REPLY_LIKED", rename_all = "camelCase")]
    ReplyLiked {
        event_id: EventId,
        comment_id: MessageId,
        reply_id: MessageId,
        likes: Vec<UserId>,
    },

    #[serde(rename = "COMMENT_DELETED", rename_all = "camelCase")]
    CommentDeleted { event_id: EventId, comment_id: MessageId },

    #[serde(rename = "REPLY_DELETED", rename_all = "camelCase")]
    ReplyDeleted {
        event_id: EventId,
        comment_id: MessageId,
        reply_id: MessageId,
    },

    /// Profile fields of a user changed
    #[serde(rename = "USER_UPDATED")]
    UserUpdated { user: UserDto },

    /// A user came online or went offline
    #[serde(rename = "USER_STATUS_UPDATED", rename_all = "camelCase")]
    UserStatusUpdated { user_id: UserId, online: bool },

    /// The server refused the connection or the credential
    #[serde(rename = "connect_error")]
    ConnectError { message: String },
}

impl ServerEvent {
    /// The room this event belongs to. Events that return `None` are global.
    pub fn room(&self) -> Option<Room> {
        match self {
            Self::NewMessage { .. } => Some(Room::Chat),
            Self::PrivateMessage {
                message,
                recipient_id,
            } => Some(Room::Private(PrivateRoomId::pair(
                &message.author.id,
                recipient_id,
            ))),
            Self::NewComment { event_id, .. }
            | Self::NewReply { event_id, .. }
            | Self::CommentLiked { event_id, .. }
            | Self::ReplyLiked { event_id, .. }
            | Self::CommentDeleted { event_id, .. }
            | Self::ReplyDeleted { event_id, .. } => Some(Room::Event(event_id.clone())),
            // UserUpdated, UserStatusUpdated and ConnectError are global
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "NEW_MESSAGE",
            Self::PrivateMessage { .. } => "PRIVATE_MESSAGE",
            Self::NewComment { .. } => "NEW_COMMENT",
            Self::NewReply { .. } => "NEW_REPLY",
            Self::CommentLiked { .. } => "COMMENT_LIKED",
            Self::ReplyLiked { .. } => "REPLY_LIKED",
            Self::CommentDeleted { .. } => "COMMENT_DELETED",
            Self::ReplyDeleted { .. } => "REPLY_DELETED",
            Self::UserUpdated { .. } => "USER_UPDATED",
            Self::UserStatusUpdated { .. } => "USER_STATUS_UPDATED",
            Self::ConnectError { .. } => "connect_error",
        }
    }
}

/// Commands sent FROM client TO server over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientCommand {
    /// Transmit the bearer credential once per connection
    #[serde(rename = "authenticate")]
    Authenticate { token: String },

    #[serde(rename = "joinChat")]
    JoinChat,

    #[serde(rename = "joinEvent", rename_all = "camelCase")]
    JoinEvent { event_id: EventId },

    #[serde(rename = "joinPrivateRoom", rename_all = "camelCase")]
    JoinPrivateRoom { room_id: PrivateRoomId },

    #[serde(rename = "leaveRoom")]
    LeaveRoom { room: Room },
}

impl ClientCommand {
    /// The join command that subscribes the connection to `room`.
    pub fn join(room: &Room) -> Self {
        match room {
            Room::Chat => Self::JoinChat,
            Room::Event(id) => Self::JoinEvent {
                event_id: id.clone(),
            },
            Room::Private(id) => Self::JoinPrivateRoom {
                room_id: id.clone(),
            },
        }
    }
}
