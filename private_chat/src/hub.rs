use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::fanout::Fanout;
use crate::identity::IdentityStore;
use crate::messages::MessageLog;
use crate::presence::PresenceTable;
use crate::protocol::ServerEvent;
use crate::router::DeliveryRouter;
use crate::session::{Session, SessionHandle};

/// Shared realtime state: presence, broadcast list and router.
pub struct Hub {
    presence: Arc<PresenceTable>,
    fanout: Fanout,
    router: DeliveryRouter,
    identity: Arc<dyn IdentityStore>,
}

impl Hub {
    pub fn new(log: Arc<dyn MessageLog>, identity: Arc<dyn IdentityStore>) -> Arc<Self> {
        let presence = Arc::new(PresenceTable::new());
        Arc::new(Self {
            fanout: Fanout::new(presence.clone()),
            router: DeliveryRouter::new(log, presence.clone()),
            presence,
            identity,
        })
    }

    /// Start a session for a freshly accepted connection authenticated as
    /// `principal`. Events for the connection arrive on the returned receiver.
    pub fn open_session(
        self: &Arc<Self>,
        principal: impl Into<String>,
    ) -> (Session, UnboundedReceiver<ServerEvent>) {
        let (handle, rx) = SessionHandle::channel();
        self.fanout.attach(handle.clone());
        debug!(session = %handle.id(), "connection opened");
        (Session::new(self.clone(), handle, principal.into()), rx)
    }

    pub fn presence(&self) -> &PresenceTable {
        &self.presence
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub fn router(&self) -> &DeliveryRouter {
        &self.router
    }

    pub fn identity(&self) -> &Arc<dyn IdentityStore> {
        &self.identity
    }
}
