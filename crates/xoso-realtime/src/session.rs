//! One open room: its store, its membership and the REST calls made on
//! behalf of it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use xoso_types::ids::{EventId, MessageId};
use xoso_types::models::{Author, Message, Room};

use crate::api::MessageApi;
use crate::config::ClientConfig;
use crate::dispatcher::{EventDispatcher, SharedStore, lock_store};
use crate::error::{ApiError, ClientError};
use crate::rooms::RoomTracker;
use crate::store::{MessageStore, Reconciled};

/// Result of loading a page of history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loaded {
    pub added: usize,
    pub has_more: bool,
}

pub struct RoomSession<A: MessageApi> {
    room: Room,
    store: SharedStore,
    api: Arc<A>,
    send_timeout: Duration,
    token: CancellationToken,
    dispatcher: EventDispatcher,
    rooms: RoomTracker,
}

impl<A: MessageApi> RoomSession<A> {
    /// Create the room's store, route pushed events to it and join the room.
    pub fn open(
        room: Room,
        me: Author,
        api: Arc<A>,
        dispatcher: &EventDispatcher,
        rooms: &RoomTracker,
        config: &ClientConfig,
    ) -> Self {
        let store = MessageStore::new(room.clone(), me).with_max_chars(config.max_message_chars);
        let store: SharedStore = Arc::new(std::sync::Mutex::new(store));
        dispatcher.register(store.clone());
        rooms.join(room.clone());
        info!("{} opened", room);

        Self {
            room,
            store,
            api,
            send_timeout: config.send_timeout,
            token: CancellationToken::new(),
            dispatcher: dispatcher.clone(),
            rooms: rooms.clone(),
        }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Snapshot of the log.
    pub fn messages(&self) -> Vec<Message> {
        lock_store(&self.store).messages().to_vec()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run an API call bounded by the send timeout and the session's
    /// lifetime.
    async fn guarded<T>(
        &self,
        call: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ClientError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(ClientError::Cancelled),
            result = tokio::time::timeout(self.send_timeout, call) => match result {
                Ok(r) => r.map_err(ClientError::from),
                Err(_) => Err(ApiError::Timeout.into()),
            },
        }
    }

    /// Show `text` right away, persist it, then reconcile or roll back.
    pub async fn send(&self, text: &str) -> Result<Reconciled, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Cancelled);
        }
        let handle = lock_store(&self.store).submit(text)?;

        let result = self
            .guarded(
                self.api
                    .post_message(&self.room, &handle.content, Some(handle.temp_id)),
            )
            .await;

        match result {
            Ok(outcome) => Ok(lock_store(&self.store).complete(&handle, outcome)),
            // the store is going away with the session
            Err(ClientError::Cancelled) => Err(ClientError::Cancelled),
            Err(e) => {
                warn!("{} send failed: {}", self.room, e);
                lock_store(&self.store).reject(&handle);
                Err(e)
            }
        }
    }

    /// Load one page of history older than `before` (newest page if `None`).
    pub async fn load_history(
        &self,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Loaded, ClientError> {
        let page = self
            .guarded(self.api.list_messages(&self.room, before, limit))
            .await?;
        let added = lock_store(&self.store).load_history(page.messages);
        debug!("{} loaded {} history entries", self.room, added);
        Ok(Loaded {
            added,
            has_more: page.has_more,
        })
    }

    /// Load the page preceding the oldest loaded entry.
    pub async fn load_older(&self, limit: u32) -> Result<Loaded, ClientError> {
        let oldest = lock_store(&self.store)
            .messages()
            .iter()
            .find(|m| !m.is_provisional())
            .map(|m| m.created_at);
        self.load_history(oldest, limit).await
    }

    fn event_id(&self) -> Result<&EventId, ClientError> {
        match &self.room {
            Room::Event(id) => Ok(id),
            Room::Chat | Room::Private(_) => Err(ClientError::Unsupported),
        }
    }

    pub async fn reply(&self, comment: &MessageId, text: &str) -> Result<Reconciled, ClientError> {
        let event = self.event_id()?;
        let content = lock_store(&self.store).validate(text)?;
        let reply = self
            .guarded(self.api.post_reply(event, comment, &content))
            .await?;
        Ok(lock_store(&self.store)
            .apply_reply(comment, reply)
            .unwrap_or(Reconciled::Ignored))
    }

    /// Like or unlike a comment, or a reply under `parent`.
    pub async fn like(
        &self,
        target: &MessageId,
        parent: Option<&MessageId>,
        liked: bool,
    ) -> Result<bool, ClientError> {
        let event = self.event_id()?;
        let likes = self
            .guarded(self.api.set_like(event, target, parent, liked))
            .await?;
        Ok(lock_store(&self.store).apply_likes(target, parent, likes))
    }

    pub async fn delete(
        &self,
        target: &MessageId,
        parent: Option<&MessageId>,
    ) -> Result<bool, ClientError> {
        let event = self.event_id()?;
        self.guarded(self.api.delete(event, target, parent)).await?;
        Ok(lock_store(&self.store).apply_delete(target, parent))
    }

    /// Cancel in-flight calls, leave the room and stop routing events to
    /// this store. Idempotent; also runs on drop.
    pub fn close(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        self.rooms.leave(&self.room);
        self.dispatcher.unregister(&self.room);
        info!("{} closed", self.room);
    }
}

impl<A: MessageApi> Drop for RoomSession<A> {
    fn drop(&mut self) {
        self.close();
    }
}
