use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::messages::MessageLog;
use crate::model::{Message, NewMessage, OutgoingMessage};
use crate::presence::PresenceTable;
use crate::protocol::ServerEvent;
use crate::session::SessionHandle;

/// Persists private messages and pushes them to the live participants.
pub struct DeliveryRouter {
    log: Arc<dyn MessageLog>,
    presence: Arc<PresenceTable>,
}

/// Check that a message has a recipient and a body or an attachment.
pub fn validate(from: &str, msg: OutgoingMessage) -> Result<NewMessage, ChatError> {
    let attachment = msg.attachment.unwrap_or_default();
    let to = msg.to.trim();
    if to.is_empty() || (msg.message.is_empty() && attachment.is_empty()) {
        return Err(ChatError::InvalidMessage);
    }
    Ok(NewMessage {
        from: from.to_owned(),
        to: to.to_owned(),
        message: msg.message,
        attachment,
    })
}

impl DeliveryRouter {
    pub fn new(log: Arc<dyn MessageLog>, presence: Arc<PresenceTable>) -> Self {
        Self { log, presence }
    }

    pub fn log(&self) -> &Arc<dyn MessageLog> {
        &self.log
    }

    /// Route a message sent by `from` over the session `sender`.
    ///
    /// The message is committed to the log before anything is pushed, so a
    /// history fetch never misses a message a client has already seen. When
    /// the append fails nothing is pushed. Pushes are best effort: an
    /// offline or vanished recipient finds the message in history instead.
    /// The sender always gets the stored copy back.
    pub fn route(
        &self,
        sender: &SessionHandle,
        from: &str,
        msg: OutgoingMessage,
    ) -> Result<Message, ChatError> {
        let draft = validate(from, msg)?;
        let stored = self.log.append(&draft).map_err(|e| {
            warn!(from = %draft.from, to = %draft.to, error = %e, "message append failed");
            ChatError::PersistenceFailure(e)
        })?;
        let event = ServerEvent::PrivateMessage(stored.clone());

        match self.presence.lookup(&stored.to) {
            Some(recipient) if recipient.id() == sender.id() => {}
            Some(recipient) => {
                if recipient.push(event.clone()).is_err() {
                    debug!(to = %stored.to, "recipient went away before delivery");
                }
            }
            None => debug!(to = %stored.to, "recipient offline, message kept for history"),
        }
        if sender.push(event).is_err() {
            debug!(from = %stored.from, "sender went away before echo");
        }
        info!(id = stored.id, from = %stored.from, to = %stored.to, "message routed");
        Ok(stored)
    }
}
