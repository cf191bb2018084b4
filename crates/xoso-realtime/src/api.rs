//! REST calls against the backend that the realtime layer depends on.

use std::future::Future;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use xoso_types::api::{
    ChatResponse, CommentResponse, ErrorBody, LikeRequest, LikeResponse, MeResponse, MessagePage,
    ReplyResponse, SendMessageRequest, UserDto, UsersBatchRequest, UsersBatchResponse,
};
use xoso_types::ids::{EventId, MessageId, TempId, UserId};
use xoso_types::models::{Author, Message, Room};

use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::store::PersistOutcome;

/// One page of room history, oldest first.
#[derive(Debug, Clone)]
pub struct Page {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Backend operations used by the realtime client. Likes, replies and
/// deletes only exist on event comment streams.
pub trait MessageApi: Send + Sync + 'static {
    fn current_user(&self) -> impl Future<Output = Result<Author, ApiError>> + Send;

    fn list_messages(
        &self,
        room: &Room,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> impl Future<Output = Result<Page, ApiError>> + Send;

    fn post_message(
        &self,
        room: &Room,
        content: &str,
        client_ref: Option<TempId>,
    ) -> impl Future<Output = Result<PersistOutcome, ApiError>> + Send;

    fn post_reply(
        &self,
        event: &EventId,
        comment: &MessageId,
        content: &str,
    ) -> impl Future<Output = Result<Message, ApiError>> + Send;

    fn set_like(
        &self,
        event: &EventId,
        target: &MessageId,
        parent: Option<&MessageId>,
        liked: bool,
    ) -> impl Future<Output = Result<Vec<UserId>, ApiError>> + Send;

    fn delete(
        &self,
        event: &EventId,
        target: &MessageId,
        parent: Option<&MessageId>,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn users_batch(
        &self,
        ids: &[UserId],
    ) -> impl Future<Output = Result<Vec<UserDto>, ApiError>> + Send;
}

pub fn room_path(room: &Room) -> String {
    match room {
        Room::Chat => "/chats".to_string(),
        Room::Private(id) => format!("/private/{}", id),
        Room::Event(id) => format!("/events/{}/comments", id),
    }
}

fn target_path(event: &EventId, target: &MessageId, parent: Option<&MessageId>) -> String {
    match parent {
        Some(comment) => format!("/events/{}/comments/{}/replies/{}", event, comment, target),
        None => format!("/events/{}/comments/{}", event, target),
    }
}

/// Map a non-success status to the client error taxonomy.
pub fn status_error(status: StatusCode, message: Option<String>) -> ApiError {
    match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::FORBIDDEN => ApiError::Forbidden(
            message.unwrap_or_else(|| "Bạn không có quyền thực hiện thao tác này".into()),
        ),
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
        _ => ApiError::Status {
            status: status.as_u16(),
            message: message.unwrap_or_else(|| status.to_string()),
        },
    }
}

/// `MessageApi` over HTTP with a bearer token.
pub struct HttpApi {
    client: Client,
    base: String,
    token: RwLock<Option<String>>,
}

impl HttpApi {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.send_timeout)
            .build()
            .map_err(ApiError::from)?;
        Ok(Self {
            client,
            base: config.api_url.trim_end_matches('/').to_string(),
            token: RwLock::new(config.token.clone()),
        })
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base, path));
        match self
            .token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
        {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.json::<ErrorBody>().await.ok().map(|b| b.message);
        warn!("backend returned {}: {:?}", status, message);
        Err(status_error(status, message))
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

impl MessageApi for HttpApi {
    async fn current_user(&self) -> Result<Author, ApiError> {
        let me: MeResponse = self.json(self.request(Method::GET, "/auth/me")).await?;
        Ok(Author {
            id: me.user.id,
            name: me.user.username,
        })
    }

    async fn list_messages(
        &self,
        room: &Room,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Page, ApiError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_rfc3339()));
        }
        let page: MessagePage = self
            .json(self.request(Method::GET, &room_path(room)).query(&query))
            .await?;
        debug!("{} history page: {} messages", room, page.messages.len());
        Ok(Page {
            messages: page
                .messages
                .into_iter()
                .map(|dto| Message::from_dto(dto, room.clone()))
                .collect(),
            has_more: page.has_more,
        })
    }

    async fn post_message(
        &self,
        room: &Room,
        content: &str,
        client_ref: Option<TempId>,
    ) -> Result<PersistOutcome, ApiError> {
        let body = SendMessageRequest {
            content: content.to_string(),
            client_ref,
        };
        let builder = self.request(Method::POST, &room_path(room)).json(&body);

        match room {
            Room::Event(_) => {
                let resp: CommentResponse = self.json(builder).await?;
                Ok(PersistOutcome::CanonicalLog(
                    resp.event
                        .comments
                        .into_iter()
                        .map(|dto| Message::from_dto(dto, room.clone()))
                        .collect(),
                ))
            }
            Room::Chat | Room::Private(_) => {
                let resp: ChatResponse = self.json(builder).await?;
                Ok(PersistOutcome::Confirmed(Message::from_dto(
                    resp.chat,
                    room.clone(),
                )))
            }
        }
    }

    async fn post_reply(
        &self,
        event: &EventId,
        comment: &MessageId,
        content: &str,
    ) -> Result<Message, ApiError> {
        let body = SendMessageRequest {
            content: content.to_string(),
            client_ref: None,
        };
        let path = format!("/events/{}/comments/{}/replies", event, comment);
        let resp: ReplyResponse = self
            .json(self.request(Method::POST, &path).json(&body))
            .await?;
        Ok(Message::from_dto(resp.reply, Room::Event(event.clone())))
    }

    async fn set_like(
        &self,
        event: &EventId,
        target: &MessageId,
        parent: Option<&MessageId>,
        liked: bool,
    ) -> Result<Vec<UserId>, ApiError> {
        let path = format!("{}/like", target_path(event, target, parent));
        let resp: LikeResponse = self
            .json(self.request(Method::POST, &path).json(&LikeRequest { liked }))
            .await?;
        Ok(resp.likes)
    }

    async fn delete(
        &self,
        event: &EventId,
        target: &MessageId,
        parent: Option<&MessageId>,
    ) -> Result<(), ApiError> {
        self.send(self.request(Method::DELETE, &target_path(event, target, parent)))
            .await?;
        Ok(())
    }

    async fn users_batch(&self, ids: &[UserId]) -> Result<Vec<UserDto>, ApiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = UsersBatchRequest { ids: ids.to_vec() };
        let resp: UsersBatchResponse = self
            .json(self.request(Method::POST, "/users/batch").json(&body))
            .await?;
        Ok(resp.users)
    }
}

#[cfg(test)]
mod tests {
    use xoso_types::ids::PrivateRoomId;

    use super::*;

    #[test]
    fn room_paths() {
        assert_eq!(room_path(&Room::Chat), "/chats");
        let a = UserId::parse("a").unwrap();
        let b = UserId::parse("b").unwrap();
        assert_eq!(
            room_path(&Room::Private(PrivateRoomId::pair(&b, &a))),
            "/private/a_b"
        );
        let ev = EventId::parse("ev7").unwrap();
        assert_eq!(room_path(&Room::Event(ev.clone())), "/events/ev7/comments");

        let c = MessageId::parse("c1").unwrap();
        let r = MessageId::parse("r1").unwrap();
        assert_eq!(target_path(&ev, &c, None), "/events/ev7/comments/c1");
        assert_eq!(
            target_path(&ev, &r, Some(&c)),
            "/events/ev7/comments/c1/replies/r1"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_error(StatusCode::UNAUTHORIZED, None), ApiError::Unauthorized);
        assert_eq!(status_error(StatusCode::TOO_MANY_REQUESTS, None), ApiError::RateLimited);
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, Some("Chỉ quản trị viên được xoá".into())),
            ApiError::Forbidden("Chỉ quản trị viên được xoá".into())
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, None),
            ApiError::Status { status: 502, .. }
        ));
    }

    #[test]
    fn http_api_builds_from_config() {
        let config = ClientConfig {
            api_url: "https://xoso.example/api/".into(),
            ..ClientConfig::default()
        };
        let api = HttpApi::new(&config).unwrap();
        assert_eq!(api.base, "https://xoso.example/api");
    }
}
