use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ChatError;
use crate::hub::Hub;
use crate::model::{Message, OutgoingMessage, DEFAULT_AVATAR};
use crate::protocol::{ClientEvent, ServerEvent};

pub type SessionId = Uuid;

/// Cheap, clonable address of one connection's outbound queue.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    tx: UnboundedSender<ServerEvent>,
}

impl SessionHandle {
    pub fn channel() -> (Self, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue an event for the connection. Fails once the connection is gone.
    pub fn push(&self, event: ServerEvent) -> Result<(), ChatError> {
        self.tx.send(event).map_err(|_| ChatError::SessionClosed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, no identity yet.
    Connecting,
    Identified {
        username: String,
        /// Avatar as captured at join time.
        avatar: String,
    },
    Closed,
}

/// Server side of one client connection.
///
/// Events are applied one at a time by the connection task that owns the
/// session, which is what keeps the transitions free of re-entrancy.
pub struct Session {
    hub: Arc<Hub>,
    handle: SessionHandle,
    principal: String,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(hub: Arc<Hub>, handle: SessionHandle, principal: String) -> Self {
        Self {
            hub,
            handle,
            principal,
            state: SessionState::Connecting,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn username(&self) -> Option<&str> {
        match &self.state {
            SessionState::Identified { username, .. } => Some(username),
            _ => None,
        }
    }

    /// Apply a raw text frame. Failures are also reported to the client as
    /// an `error` event.
    pub async fn handle_frame(&mut self, text: &str) -> Result<(), ChatError> {
        let result = match ClientEvent::parse(text) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!(session = %self.id(), code = e.code(), "event rejected");
            let _ = self.handle.push(ServerEvent::from(e));
        }
        result
    }

    pub async fn handle_event(&mut self, event: ClientEvent) -> Result<(), ChatError> {
        match event {
            ClientEvent::Join(req) => self.join(req.username, req.avatar).await,
            ClientEvent::PrivateMessage(msg) => self.send(msg).await.map(|_| ()),
        }
    }

    /// `Connecting -> Identified`. A second join on the same session is
    /// refused; a join from another session for the same user takes the
    /// presence mapping over and the older session is told so.
    pub async fn join(&mut self, username: String, avatar: Option<String>) -> Result<(), ChatError> {
        match self.state {
            SessionState::Connecting => {}
            SessionState::Identified { .. } => return Err(ChatError::AlreadyJoined),
            SessionState::Closed => return Err(ChatError::SessionClosed),
        }
        if username != self.principal {
            return Err(ChatError::IdentityMismatch);
        }
        let avatar = match avatar.filter(|a| !a.trim().is_empty()) {
            Some(avatar) => avatar,
            None => self.stored_avatar(&username).await,
        };

        self.state = SessionState::Identified {
            username: username.clone(),
            avatar,
        };
        let fanout = self.hub.fanout();
        if let Some(previous) = self.hub.presence().register(&username, self.handle.clone()) {
            if previous.id() != self.handle.id() {
                info!(%username, superseded = %previous.id(), "user joined from another connection");
                fanout.notify(&previous, "signed in from another connection");
            }
        }
        info!(%username, session = %self.id(), "user joined");
        fanout.broadcast_presence();
        fanout.broadcast_join_leave(&username, true);
        Ok(())
    }

    async fn stored_avatar(&self, username: &str) -> String {
        let identity = self.hub.identity().clone();
        let name = username.to_owned();
        let found = tokio::task::spawn_blocking(move || identity.find_by_username(&name)).await;
        match found {
            Ok(Ok(Some(profile))) => profile.avatar,
            _ => DEFAULT_AVATAR.to_owned(),
        }
    }

    /// Hand a message to the router. Returns once it is stored and the echo
    /// is queued; never waits for the recipient.
    pub async fn send(&mut self, msg: OutgoingMessage) -> Result<Message, ChatError> {
        let username = match &self.state {
            SessionState::Identified { username, .. } => username.clone(),
            SessionState::Connecting => return Err(ChatError::NotJoined),
            SessionState::Closed => return Err(ChatError::SessionClosed),
        };
        if let Some(from) = msg.from.as_deref().filter(|f| !f.is_empty()) {
            if from != username {
                return Err(ChatError::IdentityMismatch);
            }
        }
        let hub = self.hub.clone();
        let handle = self.handle.clone();
        tokio::task::spawn_blocking(move || hub.router().route(&handle, &username, msg))
            .await
            .map_err(|e| ChatError::PersistenceFailure(anyhow::Error::new(e)))?
    }

    /// Move to `Closed` from any state. Safe to call more than once.
    pub fn disconnect(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }
        let fanout = self.hub.fanout();
        fanout.detach(self.handle.id());
        if let SessionState::Identified { username, .. } = previous {
            let removed = self.hub.presence().unregister(&username, &self.handle);
            fanout.broadcast_presence();
            if removed {
                info!(%username, session = %self.id(), "user left");
                fanout.broadcast_join_leave(&username, false);
            } else {
                debug!(%username, session = %self.id(), "superseded session closed");
            }
        } else {
            debug!(session = %self.id(), "connection closed before join");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
