use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::presence::PresenceTable;
use crate::protocol::ServerEvent;
use crate::session::{SessionHandle, SessionId};

/// Broadcasts to every open connection, joined or not.
pub struct Fanout {
    connections: DashMap<SessionId, SessionHandle>,
    presence: Arc<PresenceTable>,
    // held across snapshot and push so online lists arrive in snapshot order
    presence_push: Mutex<()>,
}

impl Fanout {
    pub fn new(presence: Arc<PresenceTable>) -> Self {
        Self {
            connections: DashMap::new(),
            presence,
            presence_push: Mutex::new(()),
        }
    }

    pub fn attach(&self, handle: SessionHandle) {
        self.connections.insert(handle.id(), handle);
    }

    pub fn detach(&self, id: SessionId) {
        self.connections.remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Push `event` to every attached handle. Handles whose connection is
    /// gone are dropped from the list and skipped. Returns the number of
    /// sessions reached.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let targets: Vec<SessionHandle> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut reached = 0;
        for handle in targets {
            if handle.push(event.clone()).is_ok() {
                reached += 1;
            } else {
                debug!(session = %handle.id(), "skipping closed session during broadcast");
                self.detach(handle.id());
            }
        }
        reached
    }

    /// Send the complete online set to everyone.
    pub fn broadcast_presence(&self) -> usize {
        let _order = self.presence_push.lock();
        let usernames = self.presence.list_online().into_iter().collect();
        self.broadcast(&ServerEvent::OnlineUsers { usernames })
    }

    /// Tell everyone that `username` changed their profile.
    pub fn broadcast_profile_changed(&self, username: &str) -> usize {
        self.broadcast(&ServerEvent::ProfileUpdated {
            username: username.to_owned(),
        })
    }

    pub fn broadcast_join_leave(&self, username: &str, joined: bool) -> usize {
        let message = if joined {
            format!("{} joined the chat", username)
        } else {
            format!("{} left the chat", username)
        };
        self.broadcast(&ServerEvent::Notification { message })
    }

    /// Informational notice to a single session. Best effort.
    pub fn notify(&self, handle: &SessionHandle, message: &str) {
        let _ = handle.push(ServerEvent::Notification {
            message: message.to_owned(),
        });
    }
}
