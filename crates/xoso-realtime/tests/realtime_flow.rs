//! End-to-end flow over the in-process transport: a room session sends,
//! the server broadcasts, and the log ends up with exactly one entry per
//! stored message, across reconnects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use xoso_realtime::api::{MessageApi, Page};
use xoso_realtime::connection::{MemoryConnector, MemoryServerEnd};
use xoso_realtime::dispatcher::lock_store;
use xoso_realtime::error::ApiError;
use xoso_realtime::store::{PersistOutcome, Reconciled};
use xoso_realtime::{ClientConfig, ConnectionManager, EventDispatcher, RoomSession, RoomTracker};
use xoso_types::api::{MessageDto, UserDto};
use xoso_types::events::{ClientCommand, ServerEvent};
use xoso_types::ids::{EventId, MessageId, TempId, UserId};
use xoso_types::models::{Author, Message, Room};

fn me() -> Author {
    Author {
        id: UserId::parse("me").unwrap(),
        name: "Tôi".into(),
    }
}

fn dto(id: &str, author: &str, text: &str, client_ref: Option<TempId>) -> MessageDto {
    serde_json::from_value(serde_json::json!({
        "_id": id,
        "author": {"_id": author, "username": author},
        "content": text,
        "createdAt": Utc::now(),
        "clientRef": client_ref,
    }))
    .unwrap()
}

/// Backend double: `post_message` stores under `s{n}` and answers only
/// after `release` is notified.
#[derive(Default)]
struct GatedApi {
    release: Notify,
    posted: Mutex<Vec<(String, Option<TempId>)>>,
}

impl GatedApi {
    fn last_ref(&self) -> Option<TempId> {
        self.posted.lock().unwrap().last().and_then(|(_, r)| *r)
    }
}

impl MessageApi for GatedApi {
    async fn current_user(&self) -> Result<Author, ApiError> {
        Ok(me())
    }

    async fn list_messages(
        &self,
        _room: &Room,
        _before: Option<DateTime<Utc>>,
        _limit: u32,
    ) -> Result<Page, ApiError> {
        Ok(Page {
            messages: Vec::new(),
            has_more: false,
        })
    }

    async fn post_message(
        &self,
        room: &Room,
        content: &str,
        client_ref: Option<TempId>,
    ) -> Result<PersistOutcome, ApiError> {
        let n = {
            let mut posted = self.posted.lock().unwrap();
            posted.push((content.to_string(), client_ref));
            posted.len()
        };
        self.release.notified().await;
        let stored = dto(&format!("s{}", n), "me", content, client_ref);
        Ok(PersistOutcome::Confirmed(Message::from_dto(stored, room.clone())))
    }

    async fn post_reply(
        &self,
        _event: &EventId,
        _comment: &MessageId,
        _content: &str,
    ) -> Result<Message, ApiError> {
        Err(ApiError::Forbidden("không hỗ trợ".into()))
    }

    async fn set_like(
        &self,
        _event: &EventId,
        _target: &MessageId,
        _parent: Option<&MessageId>,
        _liked: bool,
    ) -> Result<Vec<UserId>, ApiError> {
        Ok(Vec::new())
    }

    async fn delete(
        &self,
        _event: &EventId,
        _target: &MessageId,
        _parent: Option<&MessageId>,
    ) -> Result<(), ApiError> {
        Ok(())
    }

    async fn users_batch(&self, _ids: &[UserId]) -> Result<Vec<UserDto>, ApiError> {
        Ok(Vec::new())
    }
}

struct Client {
    conn: ConnectionManager<MemoryConnector>,
    dispatcher: EventDispatcher,
    rooms: RoomTracker,
    config: ClientConfig,
    shutdown: CancellationToken,
}

fn client() -> (Client, tokio::sync::mpsc::UnboundedReceiver<MemoryServerEnd>) {
    let (connector, servers) = MemoryConnector::new();
    let config = ClientConfig {
        token: Some("jwt-abc".into()),
        ..ClientConfig::default()
    };
    let conn = ConnectionManager::new(connector, &config);
    let rooms = RoomTracker::attach(&conn);
    let dispatcher = EventDispatcher::new();
    let shutdown = CancellationToken::new();
    dispatcher.spawn(conn.subscribe(), shutdown.clone());
    (
        Client {
            conn,
            dispatcher,
            rooms,
            config,
            shutdown,
        },
        servers,
    )
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn broadcast_before_response_leaves_one_entry() {
    let (c, mut servers) = client();
    let api = Arc::new(GatedApi::default());
    let session = Arc::new(RoomSession::open(
        Room::Chat,
        me(),
        api.clone(),
        &c.dispatcher,
        &c.rooms,
        &c.config,
    ));

    c.conn.connect().await.unwrap();
    let mut server = servers.recv().await.unwrap();
    assert_eq!(
        server.next_command().await,
        Some(ClientCommand::Authenticate {
            token: "jwt-abc".into()
        })
    );
    assert_eq!(server.next_command().await, Some(ClientCommand::JoinChat));

    let task = {
        let session = session.clone();
        tokio::spawn(async move { session.send("hôm nay về 27").await })
    };
    wait_until(|| api.last_ref().is_some()).await;
    assert_eq!(session.messages().len(), 1);
    assert!(session.messages()[0].is_provisional());

    let mut changes = c.dispatcher.changes();
    server.push(&ServerEvent::NewMessage {
        message: dto("s1", "me", "hôm nay về 27", api.last_ref()),
    });
    changes.changed().await.unwrap();
    assert!(!session.messages()[0].is_provisional());

    api.release.notify_one();
    assert_eq!(task.await.unwrap(), Ok(Reconciled::Duplicate));

    let log = session.messages();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].server_id().map(|id| id.as_str()), Some("s1"));
    assert_eq!(lock_store(&session.store()).pending(), 0);

    c.shutdown.cancel();
    c.conn.teardown();
}

#[tokio::test]
async fn foreign_rooms_and_duplicates_do_not_leak() {
    let (c, mut servers) = client();
    let session = RoomSession::open(
        Room::Chat,
        me(),
        Arc::new(GatedApi::default()),
        &c.dispatcher,
        &c.rooms,
        &c.config,
    );
    c.conn.connect().await.unwrap();
    let server = servers.recv().await.unwrap();

    let mut changes = c.dispatcher.changes();
    let hello = ServerEvent::NewMessage {
        message: dto("m1", "lan", "chào", None),
    };
    server.push(&ServerEvent::NewComment {
        event_id: EventId::parse("ev9").unwrap(),
        comment: dto("c1", "lan", "xịt rồi", None),
    });
    server.push(&hello);
    server.push(&hello);
    changes.changed().await.unwrap();

    let ev9 = Room::Event(EventId::parse("ev9").unwrap());
    wait_until(|| c.dispatcher.cached(&ev9) == 1).await;
    let log = session.messages();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].author.name, "lan");

    c.shutdown.cancel();
    c.conn.teardown();
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_membership() {
    let (c, mut servers) = client();
    let event = Room::Event(EventId::parse("ev1").unwrap());
    let _chat = RoomSession::open(
        Room::Chat,
        me(),
        Arc::new(GatedApi::default()),
        &c.dispatcher,
        &c.rooms,
        &c.config,
    );
    let _comments = RoomSession::open(
        event,
        me(),
        Arc::new(GatedApi::default()),
        &c.dispatcher,
        &c.rooms,
        &c.config,
    );

    c.conn.connect().await.unwrap();
    let first = servers.recv().await.unwrap();
    drop(first);

    let started = tokio::time::Instant::now();
    let mut second = servers.recv().await.unwrap();
    assert!(started.elapsed() >= c.config.reconnect_delay);

    let mut commands = Vec::new();
    for _ in 0..3 {
        commands.push(second.next_command().await.unwrap());
    }
    assert_eq!(
        commands[0],
        ClientCommand::Authenticate {
            token: "jwt-abc".into()
        }
    );
    assert!(commands.contains(&ClientCommand::JoinChat));
    assert!(commands.contains(&ClientCommand::JoinEvent {
        event_id: EventId::parse("ev1").unwrap()
    }));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(c.conn.connector().attempts(), 2);

    c.shutdown.cancel();
    c.conn.teardown();
}
