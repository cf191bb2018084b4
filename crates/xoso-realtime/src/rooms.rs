use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use xoso_types::events::ClientCommand;
use xoso_types::models::Room;

use crate::connection::{CommandSender, ConnectionEvent, ConnectionManager, Connector, ListenerGuard};

/// Client-side record of which rooms this process should be in.
///
/// The server forgets memberships when a connection drops, so every
/// `Connected` transition re-issues a join for each tracked room.
#[derive(Clone)]
pub struct RoomTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    rooms: Arc<Mutex<BTreeSet<Room>>>,
    sender: CommandSender,
    _listener: ListenerGuard,
}

fn lock(rooms: &Mutex<BTreeSet<Room>>) -> MutexGuard<'_, BTreeSet<Room>> {
    rooms.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rejoin(rooms: &Mutex<BTreeSet<Room>>, sender: &CommandSender) -> usize {
    let snapshot: Vec<Room> = lock(rooms).iter().cloned().collect();
    let mut sent = 0;
    for room in &snapshot {
        if sender.send(&ClientCommand::join(room)).is_ok() {
            sent += 1;
        }
    }
    if sent > 0 {
        info!("rejoined {} rooms", sent);
    }
    sent
}

impl RoomTracker {
    pub fn attach<C: Connector>(conn: &ConnectionManager<C>) -> Self {
        let rooms = Arc::new(Mutex::new(BTreeSet::new()));
        let sender = conn.sender();

        let listener_rooms = rooms.clone();
        let listener_sender = sender.clone();
        let listener = conn.add_listener(move |event| {
            if *event == ConnectionEvent::Connected {
                rejoin(&listener_rooms, &listener_sender);
            }
        });

        Self {
            inner: Arc::new(TrackerInner {
                rooms,
                sender,
                _listener: listener,
            }),
        }
    }

    /// Track `room` and send its join command if connected. Safe to repeat;
    /// returns true if the room was not tracked before.
    pub fn join(&self, room: Room) -> bool {
        let cmd = ClientCommand::join(&room);
        let added = lock(&self.inner.rooms).insert(room);
        if let Err(e) = self.inner.sender.send(&cmd) {
            // sent on the next Connected transition
            debug!("join deferred: {}", e);
        }
        added
    }

    /// Send the leave command first, then forget the room.
    pub fn leave(&self, room: &Room) -> bool {
        if !lock(&self.inner.rooms).contains(room) {
            return false;
        }
        let _ = self
            .inner
            .sender
            .send(&ClientCommand::LeaveRoom { room: room.clone() });
        lock(&self.inner.rooms).remove(room)
    }

    pub fn is_member(&self, room: &Room) -> bool {
        lock(&self.inner.rooms).contains(room)
    }

    pub fn rooms(&self) -> Vec<Room> {
        lock(&self.inner.rooms).iter().cloned().collect()
    }

    /// Re-send every join. Returns how many were sent.
    pub fn rejoin_all(&self) -> usize {
        rejoin(&self.inner.rooms, &self.inner.sender)
    }
}
