use serde::{Deserialize, Serialize};

/// Avatar assigned to users who never uploaded one.
pub const DEFAULT_AVATAR: &str = "/default-avatar.png";

/// Public view of a registered user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub username: String,
    pub avatar: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

/// A private message as a client submits it.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct OutgoingMessage {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attachment: Option<String>,
}

/// A validated message about to be appended to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub from: String,
    pub to: String,
    pub message: String,
    /// Empty when the message carries no attachment.
    pub attachment: String,
}

/// A persisted message. Never mutated once stored.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub from: String,
    pub to: String,
    pub message: String,
    pub attachment: String,
    /// Milliseconds since the unix epoch, strictly increasing across the log.
    pub timestamp: i64,
}

impl Message {
    /// True when the message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.from == a && self.to == b) || (self.from == b && self.to == a)
    }
}
