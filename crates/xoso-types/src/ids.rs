use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest identifier the backend hands out. Mongo-style ids are 24 chars,
/// usernames-as-ids a bit longer.
pub const MAX_ID_LEN: usize = 64;

/// Returned when a payload carries an identifier that cannot address anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidId(pub String);

impl fmt::Display for InvalidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed identifier '{}'", self.0)
    }
}

impl std::error::Error for InvalidId {}

fn well_formed(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_ID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validate a raw backend identifier.
            pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidId> {
                let raw = raw.into();
                if well_formed(&raw) {
                    Ok(Self(raw))
                } else {
                    Err(InvalidId(raw))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Deserialized ids skip `parse`; the dispatcher re-checks them here.
            pub fn is_well_formed(&self) -> bool {
                well_formed(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Backend user id.
    UserId
);
string_id!(
    /// Server-assigned id of a persisted chat message, comment or reply.
    MessageId
);
string_id!(
    /// Id of a lottery event (draw) whose comment stream is a room.
    EventId
);

/// Client-generated id for a provisional message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(Uuid);

impl TempId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

/// Room id for a private conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateRoomId(String);

impl PrivateRoomId {
    /// Room shared by two users. Order of the arguments does not matter.
    pub fn pair(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}_{}", lo, hi))
    }

    /// A user's personal notification channel.
    pub fn personal(user: &UserId) -> Self {
        Self(user.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrivateRoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(UserId::parse("65f1c0ffee0123456789abcd").is_ok());
        assert!(UserId::parse("").is_err());
        assert!(MessageId::parse("has space").is_err());
        assert!(EventId::parse("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn private_room_is_order_independent() {
        let a = UserId::parse("alice").unwrap();
        let b = UserId::parse("bob").unwrap();
        assert_eq!(PrivateRoomId::pair(&a, &b), PrivateRoomId::pair(&b, &a));
        assert_eq!(PrivateRoomId::pair(&b, &a).as_str(), "alice_bob");
        assert_eq!(PrivateRoomId::personal(&a).as_str(), "alice");
    }

    #[test]
    fn deserialized_ids_can_be_checked() {
        let id: MessageId = serde_json::from_str("\"bad id!\"").unwrap();
        assert!(!id.is_well_formed());
    }
}
