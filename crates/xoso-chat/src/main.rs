use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use xoso_realtime::api::{HttpApi, MessageApi};
use xoso_realtime::connection::{ConnectionEvent, ConnectionManager, DisconnectReason, WsConnector};
use xoso_realtime::dispatcher::{EventDispatcher, SharedStore, lock_store};
use xoso_realtime::error::Banner;
use xoso_realtime::profanity;
use xoso_realtime::rooms::RoomTracker;
use xoso_realtime::schedule::{DrawRegion, LiveWindow};
use xoso_realtime::session::RoomSession;
use xoso_realtime::ClientConfig;
use xoso_types::ids::{EventId, MessageId, PrivateRoomId, UserId};
use xoso_types::models::Room;

const HISTORY_PAGE: u32 = 50;

/// `chat`, `event:<id>` or `dm:<userId>`.
fn parse_room(arg: &str, me: &UserId) -> anyhow::Result<Room> {
    match arg.split_once(':') {
        None if arg == "chat" => Ok(Room::Chat),
        Some(("event", id)) => Ok(Room::Event(EventId::parse(id)?)),
        Some(("dm", other)) => Ok(Room::Private(PrivateRoomId::pair(me, &UserId::parse(other)?))),
        _ => bail!("unknown room '{}', expected chat, event:<id> or dm:<userId>", arg),
    }
}

fn print_new(store: &SharedStore, seen: &mut HashSet<MessageId>) {
    let store = lock_store(store);
    for msg in store.messages() {
        let Some(id) = msg.server_id() else { continue };
        if seen.insert(id.clone()) {
            println!(
                "[{}] {}: {}",
                msg.created_at.format("%H:%M"),
                msg.author.name,
                profanity::mask(&msg.content)
            );
        }
    }
}

async fn render(store: SharedStore, mut changes: watch::Receiver<u64>, token: CancellationToken) {
    let mut seen = HashSet::new();
    loop {
        print_new(&store, &mut seen);
        tokio::select! {
            _ = token.cancelled() => break,
            changed = changes.changed() => if changed.is_err() { break },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xoso_chat=info,xoso_realtime=debug".into()),
        )
        .init();

    let config = ClientConfig::from_env()?;
    if config.token.is_none() {
        bail!("XOSO_TOKEN is not set; log in first");
    }

    let mut args = std::env::args().skip(1);
    let room_arg = args.next().unwrap_or_else(|| "chat".into());
    let region = args
        .next()
        .map(|r| r.parse::<DrawRegion>())
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let api = Arc::new(HttpApi::new(&config)?);
    let me = api.current_user().await.context("fetching current user")?;
    let room = parse_room(&room_arg, &me.id)?;
    info!("signed in as {} ({})", me.name, me.id);

    let shutdown = CancellationToken::new();
    let conn = ConnectionManager::new(WsConnector, &config);
    let _auth_listener = {
        let shutdown = shutdown.clone();
        conn.add_listener(move |event| {
            if let ConnectionEvent::Disconnected(DisconnectReason::AuthFailed(reason)) = event {
                error!("session expired: {}", reason);
                shutdown.cancel();
            }
        })
    };

    let rooms = RoomTracker::attach(&conn);
    let dispatcher = EventDispatcher::new();
    let dispatch_task = dispatcher.spawn(conn.subscribe(), shutdown.clone());

    // private messages are announced on the personal channel
    rooms.join(Room::Private(PrivateRoomId::personal(&me.id)));
    let session = RoomSession::open(room, me, api, &dispatcher, &rooms, &config);

    if let Err(e) = conn.connect().await {
        warn!("not connected yet, retrying in the background: {}", e);
    }
    match session.load_history(None, HISTORY_PAGE).await {
        Ok(loaded) => info!("{} loaded {} messages", session.room(), loaded.added),
        Err(e) => warn!("history unavailable: {}", e),
    }

    let render_task = tokio::spawn(render(
        session.store(),
        dispatcher.changes(),
        shutdown.clone(),
    ));

    let _live = region.map(|region| {
        let window = LiveWindow::spawn(region);
        let mut rx = window.subscribe();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let live = *rx.borrow_and_update();
                println!("-- {} draw {} --", region, if live { "is live" } else { "is not live" });
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => if changed.is_err() { break },
                }
            }
        });
        window
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        let result = match line.trim() {
            "/quit" => break,
            "/more" => session.load_older(HISTORY_PAGE).await.map(|_| ()),
            text => session.send(text).await.map(|_| ()),
        };
        if let Err(e) = result {
            match e.banner() {
                Banner::SessionExpired => {
                    eprintln!("Phiên đăng nhập đã hết hạn, vui lòng đăng nhập lại");
                    break;
                }
                Banner::Inline(message) => eprintln!("! {}", message),
                Banner::Silent => {}
            }
        }
    }

    session.close();
    shutdown.cancel();
    conn.teardown();
    let _ = render_task.await;
    let _ = dispatch_task.await;
    info!("bye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_arguments() {
        let me = UserId::parse("u2").unwrap();
        assert_eq!(parse_room("chat", &me).unwrap(), Room::Chat);
        assert_eq!(
            parse_room("event:ev42", &me).unwrap(),
            Room::Event(EventId::parse("ev42").unwrap())
        );
        assert_eq!(
            parse_room("dm:u1", &me).unwrap(),
            Room::Private(PrivateRoomId::pair(&UserId::parse("u1").unwrap(), &me))
        );
        assert!(parse_room("event:", &me).is_err());
        assert!(parse_room("lobby", &me).is_err());
    }
}
