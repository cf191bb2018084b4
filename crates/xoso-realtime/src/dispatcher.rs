use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use xoso_types::events::ServerEvent;
use xoso_types::ids::UserId;
use xoso_types::models::{Message, Room};

use crate::error::ClientError;
use crate::store::{MessageStore, Reconciled};

/// Events kept per unregistered room.
pub const BACKLOG_PER_ROOM: usize = 50;

pub type SharedStore = Arc<Mutex<MessageStore>>;

pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, MessageStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What happened to one pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A message reached a store.
    Reconciled(Reconciled),
    /// Likes or a delete were applied.
    Updated,
    /// The targeted entry is not in the store.
    Missed,
    /// The room has no store yet; kept for replay.
    Cached,
    Presence,
    /// Malformed payload, nothing was touched.
    Rejected(String),
    /// Not for the dispatcher (e.g. connection errors).
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub name: Option<String>,
    pub online: bool,
}

/// Routes pushed events to the store of the room they belong to.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    stores: Mutex<HashMap<Room, SharedStore>>,
    backlog: Mutex<HashMap<Room, VecDeque<ServerEvent>>>,
    presence: Mutex<HashMap<UserId, Presence>>,
    /// Bumped after every change to a registered store.
    revision: watch::Sender<u64>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(DispatcherInner {
                stores: Mutex::new(HashMap::new()),
                backlog: Mutex::new(HashMap::new()),
                presence: Mutex::new(HashMap::new()),
                revision,
            }),
        }
    }

    /// Route events for `room` to `store`, replaying anything cached for it.
    pub fn register(&self, store: SharedStore) {
        let room = lock_store(&store).room().clone();
        lock(&self.inner.stores).insert(room.clone(), store);

        let cached = lock(&self.inner.backlog).remove(&room).unwrap_or_default();
        if !cached.is_empty() {
            debug!("{} replaying {} cached events", room, cached.len());
        }
        for event in cached {
            self.dispatch(event);
        }
    }

    pub fn unregister(&self, room: &Room) -> Option<SharedStore> {
        lock(&self.inner.stores).remove(room)
    }

    pub fn is_registered(&self, room: &Room) -> bool {
        lock(&self.inner.stores).contains_key(room)
    }

    pub fn cached(&self, room: &Room) -> usize {
        lock(&self.inner.backlog).get(room).map_or(0, VecDeque::len)
    }

    pub fn presence(&self, user: &UserId) -> Option<Presence> {
        lock(&self.inner.presence).get(user).cloned()
    }

    /// Receiver that changes whenever a registered store changed.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    fn touched(&self) {
        self.inner.revision.send_modify(|r| *r += 1);
    }

    pub fn dispatch(&self, event: ServerEvent) -> Dispatch {
        if let Err(e) = validate(&event) {
            warn!("dropping {}: {}", event.name(), e);
            return Dispatch::Rejected(e.to_string());
        }

        match event {
            ServerEvent::ConnectError { .. } => Dispatch::Ignored,
            ServerEvent::UserStatusUpdated { user_id, online } => {
                lock(&self.inner.presence).entry(user_id).or_default().online = online;
                self.touched();
                Dispatch::Presence
            }
            ServerEvent::UserUpdated { user } => {
                lock(&self.inner.presence)
                    .entry(user.id.clone())
                    .or_default()
                    .name = Some(user.username.clone());
                let stores: Vec<SharedStore> = lock(&self.inner.stores).values().cloned().collect();
                for store in stores {
                    lock_store(&store).rename_author(&user.id, &user.username);
                }
                self.touched();
                Dispatch::Presence
            }
            event => self.route(event),
        }
    }

    fn route(&self, event: ServerEvent) -> Dispatch {
        let Some(room) = event.room() else {
            return Dispatch::Ignored;
        };
        let store = lock(&self.inner.stores).get(&room).cloned();
        let Some(store) = store else {
            let mut backlog = lock(&self.inner.backlog);
            let queue = backlog.entry(room).or_default();
            if queue.len() == BACKLOG_PER_ROOM {
                queue.pop_front();
            }
            queue.push_back(event);
            return Dispatch::Cached;
        };

        let outcome = {
            let mut store = lock_store(&store);
            apply(&mut store, room, event)
        };
        if !matches!(
            outcome,
            Dispatch::Missed | Dispatch::Reconciled(Reconciled::Duplicate)
        ) {
            self.touched();
        }
        outcome
    }

    /// Deliver events from `rx` until `token` is cancelled or the
    /// connection's event channel closes.
    pub fn spawn(
        &self,
        mut rx: broadcast::Receiver<ServerEvent>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = rx.recv() => match result {
                        Ok(event) => {
                            this.dispatch(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("event receiver lagged by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            info!("event dispatcher stopped");
        })
    }
}

fn apply(store: &mut MessageStore, room: Room, event: ServerEvent) -> Dispatch {
    let updated = |hit: bool| if hit { Dispatch::Updated } else { Dispatch::Missed };

    match event {
        ServerEvent::NewMessage { message }
        | ServerEvent::PrivateMessage { message, .. }
        | ServerEvent::NewComment {
            comment: message, ..
        } => Dispatch::Reconciled(store.on_confirmed_message(Message::from_dto(message, room))),
        ServerEvent::NewReply {
            comment_id, reply, ..
        } => match store.apply_reply(&comment_id, Message::from_dto(reply, room)) {
            Some(r) => Dispatch::Reconciled(r),
            None => Dispatch::Missed,
        },
        ServerEvent::CommentLiked {
            comment_id, likes, ..
        } => updated(store.apply_likes(&comment_id, None, likes)),
        ServerEvent::ReplyLiked {
            comment_id,
            reply_id,
            likes,
            ..
        } => updated(store.apply_likes(&reply_id, Some(&comment_id), likes)),
        ServerEvent::CommentDeleted { comment_id, .. } => {
            updated(store.apply_delete(&comment_id, None))
        }
        ServerEvent::ReplyDeleted {
            comment_id,
            reply_id,
            ..
        } => updated(store.apply_delete(&reply_id, Some(&comment_id))),
        // global events never reach a store
        ServerEvent::UserUpdated { .. }
        | ServerEvent::UserStatusUpdated { .. }
        | ServerEvent::ConnectError { .. } => Dispatch::Ignored,
    }
}

fn check(ok: bool, what: &str) -> Result<(), ClientError> {
    if ok {
        Ok(())
    } else {
        Err(ClientError::InvalidEvent(format!("malformed {}", what)))
    }
}

fn check_message(msg: &xoso_types::api::MessageDto) -> Result<(), ClientError> {
    check(msg.id.is_well_formed(), "message id")?;
    check(msg.author.id.is_well_formed(), "author id")?;
    for reply in &msg.replies {
        check_message(reply)?;
    }
    Ok(())
}

/// Every identifier an event targets must be well formed before any state
/// is touched.
fn validate(event: &ServerEvent) -> Result<(), ClientError> {
    match event {
        ServerEvent::NewMessage { message } => check_message(message),
        ServerEvent::PrivateMessage {
            message,
            recipient_id,
        } => {
            check(recipient_id.is_well_formed(), "recipient id")?;
            check_message(message)
        }
        ServerEvent::NewComment { event_id, comment } => {
            check(event_id.is_well_formed(), "event id")?;
            check_message(comment)
        }
        ServerEvent::NewReply {
            event_id,
            comment_id,
            reply,
        } => {
            check(event_id.is_well_formed(), "event id")?;
            check(comment_id.is_well_formed(), "comment id")?;
            check_message(reply)
        }
        ServerEvent::CommentLiked {
            event_id,
            comment_id,
            likes,
        } => {
            check(event_id.is_well_formed(), "event id")?;
            check(comment_id.is_well_formed(), "comment id")?;
            check(likes.iter().all(UserId::is_well_formed), "like user id")
        }
        ServerEvent::ReplyLiked {
            event_id,
            comment_id,
            reply_id,
            likes,
        } => {
            check(event_id.is_well_formed(), "event id")?;
            check(comment_id.is_well_formed(), "comment id")?;
            check(reply_id.is_well_formed(), "reply id")?;
            check(likes.iter().all(UserId::is_well_formed), "like user id")
        }
        ServerEvent::CommentDeleted {
            event_id,
            comment_id,
        } => {
            check(event_id.is_well_formed(), "event id")?;
            check(comment_id.is_well_formed(), "comment id")
        }
        ServerEvent::ReplyDeleted {
            event_id,
            comment_id,
            reply_id,
        } => {
            check(event_id.is_well_formed(), "event id")?;
            check(comment_id.is_well_formed(), "comment id")?;
            check(reply_id.is_well_formed(), "reply id")
        }
        ServerEvent::UserUpdated { user } => check(user.id.is_well_formed(), "user id"),
        ServerEvent::UserStatusUpdated { user_id, .. } => {
            check(user_id.is_well_formed(), "user id")
        }
        ServerEvent::ConnectError { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use xoso_types::api::{MessageDto, UserDto};
    use xoso_types::ids::{EventId, MessageId, PrivateRoomId};
    use xoso_types::models::Author;

    use super::*;

    fn me() -> Author {
        Author {
            id: UserId::parse("me").unwrap(),
            name: "Tôi".into(),
        }
    }

    fn dto(id: &str, author: &str, text: &str) -> MessageDto {
        serde_json::from_value(serde_json::json!({
            "_id": id,
            "author": {"_id": author, "username": author},
            "content": text,
            "createdAt": Utc.with_ymd_and_hms(2026, 10, 19, 17, 30, 0).unwrap(),
        }))
        .unwrap()
    }

    fn shared(room: Room) -> SharedStore {
        Arc::new(Mutex::new(MessageStore::new(room, me())))
    }

    fn event_room() -> (EventId, Room) {
        let id = EventId::parse("ev1").unwrap();
        (id.clone(), Room::Event(id))
    }

    #[test]
    fn routes_chat_messages_to_chat_store() {
        let dispatcher = EventDispatcher::new();
        let chat = shared(Room::Chat);
        dispatcher.register(chat.clone());

        let first = dispatcher.dispatch(ServerEvent::NewMessage {
            message: dto("m1", "lan", "xin chào"),
        });
        let again = dispatcher.dispatch(ServerEvent::NewMessage {
            message: dto("m1", "lan", "xin chào"),
        });
        assert_eq!(first, Dispatch::Reconciled(Reconciled::Appended));
        assert_eq!(again, Dispatch::Reconciled(Reconciled::Duplicate));
        assert_eq!(lock_store(&chat).len(), 1);
    }

    #[test]
    fn other_rooms_never_touch_the_active_store() {
        let dispatcher = EventDispatcher::new();
        let chat = shared(Room::Chat);
        dispatcher.register(chat.clone());
        let (event_id, room) = event_room();

        let outcome = dispatcher.dispatch(ServerEvent::NewComment {
            event_id,
            comment: dto("c1", "lan", "số đẹp"),
        });
        assert_eq!(outcome, Dispatch::Cached);
        assert!(lock_store(&chat).is_empty());
        assert_eq!(dispatcher.cached(&room), 1);

        let store = shared(room.clone());
        dispatcher.register(store.clone());
        assert_eq!(lock_store(&store).len(), 1);
        assert_eq!(dispatcher.cached(&room), 0);
    }

    #[test]
    fn backlog_is_bounded() {
        let dispatcher = EventDispatcher::new();
        let (event_id, room) = event_room();
        for i in 0..(BACKLOG_PER_ROOM + 10) {
            dispatcher.dispatch(ServerEvent::NewComment {
                event_id: event_id.clone(),
                comment: dto(&format!("c{}", i), "lan", "x"),
            });
        }
        assert_eq!(dispatcher.cached(&room), BACKLOG_PER_ROOM);
    }

    #[test]
    fn malformed_ids_are_rejected_before_mutation() {
        let dispatcher = EventDispatcher::new();
        let chat = shared(Room::Chat);
        dispatcher.register(chat.clone());

        let outcome = dispatcher.dispatch(ServerEvent::NewMessage {
            message: dto("bad id!", "lan", "x"),
        });
        assert!(matches!(outcome, Dispatch::Rejected(_)));
        assert!(lock_store(&chat).is_empty());
    }

    #[test]
    fn comment_stream_events() {
        let dispatcher = EventDispatcher::new();
        let (event_id, room) = event_room();
        let store = shared(room);
        dispatcher.register(store.clone());

        dispatcher.dispatch(ServerEvent::NewComment {
            event_id: event_id.clone(),
            comment: dto("c1", "lan", "hôm nay về 68"),
        });
        let reply = dispatcher.dispatch(ServerEvent::NewReply {
            event_id: event_id.clone(),
            comment_id: MessageId::parse("c1").unwrap(),
            reply: dto("r1", "minh", "chuẩn"),
        });
        assert_eq!(reply, Dispatch::Reconciled(Reconciled::Appended));

        let liked = dispatcher.dispatch(ServerEvent::ReplyLiked {
            event_id: event_id.clone(),
            comment_id: MessageId::parse("c1").unwrap(),
            reply_id: MessageId::parse("r1").unwrap(),
            likes: vec![UserId::parse("me").unwrap()],
        });
        assert_eq!(liked, Dispatch::Updated);

        let missed = dispatcher.dispatch(ServerEvent::CommentDeleted {
            event_id: event_id.clone(),
            comment_id: MessageId::parse("zzz").unwrap(),
        });
        assert_eq!(missed, Dispatch::Missed);

        let deleted = dispatcher.dispatch(ServerEvent::CommentDeleted {
            event_id,
            comment_id: MessageId::parse("c1").unwrap(),
        });
        assert_eq!(deleted, Dispatch::Updated);
        assert!(lock_store(&store).is_empty());
    }

    #[test]
    fn private_messages_reach_pair_room() {
        let dispatcher = EventDispatcher::new();
        let me = me().id;
        let lan = UserId::parse("lan").unwrap();
        let store = shared(Room::Private(PrivateRoomId::pair(&me, &lan)));
        dispatcher.register(store.clone());

        let outcome = dispatcher.dispatch(ServerEvent::PrivateMessage {
            message: dto("p1", "lan", "alo"),
            recipient_id: me,
        });
        assert_eq!(outcome, Dispatch::Reconciled(Reconciled::Appended));
        assert_eq!(lock_store(&store).len(), 1);
    }

    #[test]
    fn presence_and_renames() {
        let dispatcher = EventDispatcher::new();
        let chat = shared(Room::Chat);
        dispatcher.register(chat.clone());
        dispatcher.dispatch(ServerEvent::NewMessage {
            message: dto("m1", "lan", "hi"),
        });

        let lan = UserId::parse("lan").unwrap();
        dispatcher.dispatch(ServerEvent::UserStatusUpdated {
            user_id: lan.clone(),
            online: true,
        });
        dispatcher.dispatch(ServerEvent::UserUpdated {
            user: UserDto {
                id: lan.clone(),
                username: "Lan Anh".into(),
                role: None,
                online: true,
            },
        });

        assert_eq!(
            dispatcher.presence(&lan),
            Some(Presence {
                name: Some("Lan Anh".into()),
                online: true
            })
        );
        assert_eq!(lock_store(&chat).messages()[0].author.name, "Lan Anh");
    }

    #[test]
    fn changes_are_signalled() {
        let dispatcher = EventDispatcher::new();
        let rx = dispatcher.changes();
        dispatcher.register(shared(Room::Chat));
        dispatcher.dispatch(ServerEvent::NewMessage {
            message: dto("m1", "lan", "hi"),
        });
        assert_eq!(*rx.borrow(), 1);
        dispatcher.dispatch(ServerEvent::NewMessage {
            message: dto("m1", "lan", "hi"),
        });
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_cancel() {
        let dispatcher = EventDispatcher::new();
        let chat = shared(Room::Chat);
        dispatcher.register(chat.clone());

        let (tx, rx) = broadcast::channel(16);
        let token = CancellationToken::new();
        let task = dispatcher.spawn(rx, token.clone());

        let mut changes = dispatcher.changes();
        tx.send(ServerEvent::NewMessage {
            message: dto("m1", "lan", "hi"),
        })
        .unwrap();
        changes.changed().await.unwrap();
        assert_eq!(lock_store(&chat).len(), 1);

        token.cancel();
        task.await.unwrap();
        assert_eq!(tx.receiver_count(), 0);
    }
}
