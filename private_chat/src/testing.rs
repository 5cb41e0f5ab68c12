//! In-memory collaborators for unit tests.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;

use crate::identity::IdentityStore;
use crate::messages::MessageLog;
use crate::model::{Message, NewMessage, UserProfile};

#[derive(Default)]
pub struct MemoryLog {
    rows: Mutex<Vec<Message>>,
}

impl MemoryLog {
    pub fn all(&self) -> Vec<Message> {
        self.rows.lock().clone()
    }
}

impl MessageLog for MemoryLog {
    fn append(&self, msg: &NewMessage) -> Result<Message> {
        let mut rows = self.rows.lock();
        let next = rows.len() as i64 + 1;
        let stored = Message {
            id: next,
            from: msg.from.clone(),
            to: msg.to.clone(),
            message: msg.message.clone(),
            attachment: msg.attachment.clone(),
            timestamp: next,
        };
        rows.push(stored.clone());
        Ok(stored)
    }

    fn query_conversation(&self, a: &str, b: &str) -> Result<Vec<Message>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect())
    }
}

pub struct FailingLog;

impl MessageLog for FailingLog {
    fn append(&self, _msg: &NewMessage) -> Result<Message> {
        Err(anyhow!("disk full"))
    }

    fn query_conversation(&self, _a: &str, _b: &str) -> Result<Vec<Message>> {
        Err(anyhow!("disk full"))
    }
}

#[derive(Default)]
pub struct StaticDirectory {
    pub users: Vec<UserProfile>,
}

impl StaticDirectory {
    pub fn with(users: &[(&str, &str)]) -> Self {
        Self {
            users: users
                .iter()
                .map(|(username, avatar)| UserProfile {
                    username: (*username).into(),
                    avatar: (*avatar).into(),
                    display_name: String::new(),
                })
                .collect(),
        }
    }
}

impl IdentityStore for StaticDirectory {
    fn find_by_username(&self, username: &str) -> Result<Option<UserProfile>> {
        Ok(self.users.iter().find(|u| u.username == username).cloned())
    }

    fn list_all(&self) -> Result<Vec<UserProfile>> {
        Ok(self.users.clone())
    }
}
