//! Per-room ordered message log with optimistic inserts.
//!
//! The log is kept sorted by `created_at` ascending; entries with equal
//! timestamps keep their arrival order. At most one entry exists per
//! confirmed id.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use xoso_types::ids::{MessageId, TempId, UserId};
use xoso_types::models::{Author, Message, Room};

use crate::config::DEFAULT_MAX_MESSAGE_CHARS;
use crate::error::ValidationError;
use crate::profanity;

/// Returned by `submit`; identifies the provisional entry until it is
/// completed or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHandle {
    pub temp_id: TempId,
    pub content: String,
}

/// What a successful persistence call told us.
#[derive(Debug, Clone)]
pub enum PersistOutcome {
    /// The full, server-ordered log of the room.
    CanonicalLog(Vec<Message>),
    /// Just the stored message.
    Confirmed(Message),
    /// Nothing usable; wait for the broadcast.
    Accepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// An entry with the same server id was already present.
    Duplicate,
    /// A provisional entry was swapped for the confirmed one.
    ReplacedProvisional,
    /// Added as a new arrival.
    Appended,
    /// The log was replaced by the canonical one.
    Replaced,
    /// Input was not a confirmed message.
    Ignored,
}

pub struct MessageStore {
    room: Room,
    me: Author,
    max_chars: usize,
    entries: Vec<Message>,
}

impl MessageStore {
    pub fn new(room: Room, me: Author) -> Self {
        Self {
            room,
            me,
            max_chars: DEFAULT_MAX_MESSAGE_CHARS,
            entries: Vec::new(),
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn me(&self) -> &Author {
        &self.me
    }

    /// The log in canonical order, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|m| m.is_provisional()).count()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries.iter().find(|m| m.server_id() == Some(id))
    }

    /// Validate `text` without inserting anything.
    pub fn validate(&self, text: &str) -> Result<String, ValidationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::Empty);
        }
        if trimmed.chars().count() > self.max_chars {
            return Err(ValidationError::TooLong {
                max: self.max_chars,
            });
        }
        if profanity::is_flagged(trimmed) {
            return Err(ValidationError::Profane);
        }
        Ok(trimmed.to_string())
    }

    pub fn submit(&mut self, text: &str) -> Result<PendingHandle, ValidationError> {
        self.submit_at(text, Utc::now())
    }

    /// Insert a provisional entry stamped `now`.
    pub fn submit_at(
        &mut self,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingHandle, ValidationError> {
        let content = self.validate(text)?;
        let temp_id = TempId::new();
        self.insert_sorted(Message::provisional(
            temp_id,
            self.me.clone(),
            content.clone(),
            now,
            self.room.clone(),
        ));
        debug!("{} provisional {} inserted", self.room, temp_id);
        Ok(PendingHandle { temp_id, content })
    }

    /// Apply the result of a successful persistence call for `handle`.
    pub fn complete(&mut self, handle: &PendingHandle, outcome: PersistOutcome) -> Reconciled {
        match outcome {
            PersistOutcome::CanonicalLog(log) => {
                self.replace_log(handle, log);
                Reconciled::Replaced
            }
            PersistOutcome::Confirmed(msg) => self.confirm_pending(handle, msg),
            PersistOutcome::Accepted => Reconciled::Ignored,
        }
    }

    /// Drop the provisional entry of a failed send. Returns false if it was
    /// already reconciled or removed.
    pub fn reject(&mut self, handle: &PendingHandle) -> bool {
        match self.position_of_temp(handle.temp_id) {
            Some(pos) => {
                self.entries.remove(pos);
                debug!("{} provisional {} rolled back", self.room, handle.temp_id);
                true
            }
            None => false,
        }
    }

    /// Reconcile a server-confirmed message delivered by broadcast.
    pub fn on_confirmed_message(&mut self, msg: Message) -> Reconciled {
        let Some(id) = msg.server_id().cloned() else {
            warn!("{} ignoring unconfirmed message from broadcast", self.room);
            return Reconciled::Ignored;
        };
        if self.get(&id).is_some() {
            return Reconciled::Duplicate;
        }

        if let Some(pos) = self.matching_provisional(&msg) {
            self.replace_at(pos, msg);
            return Reconciled::ReplacedProvisional;
        }

        self.insert_sorted(msg);
        Reconciled::Appended
    }

    /// Merge a page of history. Returns how many entries were new.
    pub fn load_history(&mut self, page: Vec<Message>) -> usize {
        page.into_iter()
            .map(|m| self.on_confirmed_message(m))
            .filter(|r| *r != Reconciled::Duplicate && *r != Reconciled::Ignored)
            .count()
    }

    /// Attach a reply to a comment. `None` if the comment is not in the log.
    pub fn apply_reply(&mut self, comment_id: &MessageId, reply: Message) -> Option<Reconciled> {
        let reply_id = reply.server_id()?.clone();
        let comment = self.get_mut(comment_id)?;
        if comment.replies.iter().any(|r| r.server_id() == Some(&reply_id)) {
            return Some(Reconciled::Duplicate);
        }
        let idx = comment
            .replies
            .partition_point(|r| r.created_at <= reply.created_at);
        comment.replies.insert(idx, reply);
        Some(Reconciled::Appended)
    }

    /// Overwrite the like set of a comment, or of a reply under `parent`.
    pub fn apply_likes(
        &mut self,
        target: &MessageId,
        parent: Option<&MessageId>,
        likes: Vec<UserId>,
    ) -> bool {
        match self.target_mut(target, parent) {
            Some(msg) => {
                msg.likes = likes;
                true
            }
            None => false,
        }
    }

    /// Remove a comment, or a reply under `parent`.
    pub fn apply_delete(&mut self, target: &MessageId, parent: Option<&MessageId>) -> bool {
        let list = match parent {
            Some(parent_id) => match self.get_mut(parent_id) {
                Some(comment) => &mut comment.replies,
                None => return false,
            },
            None => &mut self.entries,
        };
        match list.iter().position(|m| m.server_id() == Some(target)) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Propagate a profile rename. Returns the number of touched entries.
    pub fn rename_author(&mut self, user: &UserId, name: &str) -> usize {
        if self.me.id == *user {
            self.me.name = name.to_string();
        }
        let mut touched = 0;
        for msg in self.entries.iter_mut() {
            touched += rename_one(msg, user, name);
            for reply in msg.replies.iter_mut() {
                touched += rename_one(reply, user, name);
            }
        }
        touched
    }

    fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.entries.iter_mut().find(|m| m.server_id() == Some(id))
    }

    fn target_mut(&mut self, target: &MessageId, parent: Option<&MessageId>) -> Option<&mut Message> {
        match parent {
            Some(parent_id) => self
                .get_mut(parent_id)?
                .replies
                .iter_mut()
                .find(|r| r.server_id() == Some(target)),
            None => self.get_mut(target),
        }
    }

    fn position_of_temp(&self, temp_id: TempId) -> Option<usize> {
        self.entries.iter().position(|m| m.temp_id() == Some(temp_id))
    }

    /// Exact match on an echoed temp id; without one, fall back to the
    /// oldest provisional entry of ours with identical text.
    fn matching_provisional(&self, msg: &Message) -> Option<usize> {
        if let Some(client_ref) = msg.client_ref {
            return self.position_of_temp(client_ref);
        }
        if msg.author.id != self.me.id {
            return None;
        }
        self.entries
            .iter()
            .position(|m| m.is_provisional() && m.content == msg.content)
    }

    fn confirm_pending(&mut self, handle: &PendingHandle, msg: Message) -> Reconciled {
        let Some(id) = msg.server_id().cloned() else {
            return Reconciled::Ignored;
        };
        match self.position_of_temp(handle.temp_id) {
            // broadcast got here first
            Some(pos) if self.get(&id).is_some() => {
                self.entries.remove(pos);
                Reconciled::Duplicate
            }
            Some(pos) => {
                self.replace_at(pos, msg);
                Reconciled::ReplacedProvisional
            }
            None => self.on_confirmed_message(msg),
        }
    }

    fn replace_log(&mut self, handle: &PendingHandle, log: Vec<Message>) {
        // other sends may still be in flight; their entries stay
        let others: Vec<Message> = self
            .entries
            .drain(..)
            .filter(|m| m.is_provisional() && m.temp_id() != Some(handle.temp_id))
            .collect();

        for msg in log {
            let Some(id) = msg.server_id().cloned() else {
                warn!("{} canonical log carried an unconfirmed entry", self.room);
                continue;
            };
            if self.get(&id).is_none() {
                self.insert_sorted(msg);
            }
        }
        for msg in others {
            self.insert_sorted(msg);
        }
    }

    /// Replace in the same slot when that keeps the order, else re-insert.
    fn replace_at(&mut self, pos: usize, msg: Message) {
        let after_prev = pos == 0 || self.entries[pos - 1].created_at <= msg.created_at;
        let before_next = self
            .entries
            .get(pos + 1)
            .is_none_or(|next| msg.created_at <= next.created_at);
        if after_prev && before_next {
            self.entries[pos] = msg;
        } else {
            self.entries.remove(pos);
            self.insert_sorted(msg);
        }
    }

    fn insert_sorted(&mut self, msg: Message) {
        let idx = self
            .entries
            .partition_point(|m| m.created_at <= msg.created_at);
        self.entries.insert(idx, msg);
    }
}

fn rename_one(msg: &mut Message, user: &UserId, name: &str) -> usize {
    if msg.author.id == *user && msg.author.name != name {
        msg.author.name = name.to_string();
        1
    } else {
        0
    }
}
