//! WebSocket wire events.
//!
//! Every frame is a JSON text frame of the form
//! `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::model::{Message, OutgoingMessage};

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Events a client may send.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    Join(JoinRequest),
    PrivateMessage(OutgoingMessage),
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, ChatError> {
        serde_json::from_str(text).map_err(|_| ChatError::BadEvent)
    }
}

/// Events pushed to clients.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A stored message; both participants receive the identical payload.
    PrivateMessage(Message),
    /// Full online set. Clients replace their view rather than merge.
    OnlineUsers { usernames: Vec<String> },
    /// Someone changed their profile; clients should re-fetch the directory.
    ProfileUpdated { username: String },
    Notification { message: String },
    Error { code: String, message: String },
}

impl From<&ChatError> for ServerEvent {
    fn from(err: &ChatError) -> Self {
        ServerEvent::Error {
            code: err.code().into(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_join_and_message() {
        let join = ClientEvent::parse(r#"{"event":"join","data":{"username":"alice"}}"#).unwrap();
        assert_eq!(
            join,
            ClientEvent::Join(JoinRequest {
                username: "alice".into(),
                avatar: None
            })
        );
        let msg = ClientEvent::parse(
            r#"{"event":"privateMessage","data":{"from":"alice","to":"bob","message":"hi","attachment":null}}"#,
        )
        .unwrap();
        match msg {
            ClientEvent::PrivateMessage(m) => {
                assert_eq!(m.to, "bob");
                assert_eq!(m.attachment, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_event() {
        assert!(matches!(
            ClientEvent::parse(r#"{"event":"typing","data":{}}"#),
            Err(ChatError::BadEvent)
        ));
        assert!(ClientEvent::parse("not json").is_err());
    }

    #[test]
    fn server_event_shape() {
        let ev = ServerEvent::OnlineUsers {
            usernames: vec!["alice".into()],
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"event":"onlineUsers","data":{"usernames":["alice"]}})
        );
        let err = ServerEvent::from(&ChatError::NotJoined);
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["event"], "error");
        assert_eq!(v["data"]["code"], "not_joined");
    }
}
