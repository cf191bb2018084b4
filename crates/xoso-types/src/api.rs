use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, TempId, UserId};

// -- Users --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorDto {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Serialize)]
pub struct UsersBatchRequest {
    pub ids: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
pub struct UsersBatchResponse {
    pub users: Vec<UserDto>,
}

// -- Messages --

/// A persisted chat message, comment or reply as the backend serializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub author: AuthorDto,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<TempId>,
    #[serde(default)]
    pub likes: Vec<UserId>,
    #[serde(default)]
    pub replies: Vec<MessageDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<TempId>,
}

/// `POST /chats` and `POST /private/{room}` reply with the stored message.
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub chat: MessageDto,
}

/// `POST /events/{id}/comments` replies with the whole comment stream.
#[derive(Debug, Deserialize)]
pub struct CommentResponse {
    #[serde(default)]
    pub message: Option<String>,
    pub event: EventComments,
}

#[derive(Debug, Deserialize)]
pub struct EventComments {
    pub comments: Vec<MessageDto>,
}

/// One page of history. Chat endpoints call the list `chats`, event
/// endpoints call it `comments`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(alias = "chats", alias = "comments")]
    pub messages: Vec<MessageDto>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct MeResponse {
    pub user: UserDto,
}

#[derive(Debug, Deserialize)]
pub struct ReplyResponse {
    pub reply: MessageDto,
}

#[derive(Debug, Serialize)]
pub struct LikeRequest {
    pub liked: bool,
}

#[derive(Debug, Deserialize)]
pub struct LikeResponse {
    pub likes: Vec<UserId>,
}

/// Error body returned alongside non-success statuses.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_dto_reads_backend_shape() {
        let raw = r#"{
            "_id": "m1",
            "author": {"_id": "u1", "username": "minh"},
            "content": "chào cả nhà",
            "createdAt": "2026-10-19T09:15:00Z",
            "likes": ["u2"]
        }"#;
        let dto: MessageDto = serde_json::from_str(raw).unwrap();
        assert_eq!(dto.id.as_str(), "m1");
        assert_eq!(dto.author.username, "minh");
        assert_eq!(dto.likes.len(), 1);
        assert!(dto.replies.is_empty());
        assert!(dto.client_ref.is_none());
    }

    #[test]
    fn page_accepts_both_list_names() {
        let chats: MessagePage = serde_json::from_str(r#"{"chats": [], "hasMore": true}"#).unwrap();
        assert!(chats.has_more);
        let comments: MessagePage = serde_json::from_str(r#"{"comments": []}"#).unwrap();
        assert!(!comments.has_more);
    }
}
