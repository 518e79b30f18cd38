//! The seam between the connection engine and whatever serves links.

use amqphost_types::{Attach, Message};
use bytes::Bytes;

use crate::connection::{ListenerConnection, ListenerLink, ListenerSession};
use crate::error::Result;

/// Decides what happens to messages and attaches arriving on a listener.
///
/// All methods run on the connection task and must not block.
pub trait Container: Send + Sync + 'static {
    /// Decodes the payload of a complete delivery.
    fn create_message(&self, payload: Bytes) -> Result<Message> {
        Ok(Message::decode(payload)?)
    }

    /// Creates the local endpoint for a peer's attach.
    fn create_link(
        &self,
        _connection: &ListenerConnection,
        session: &ListenerSession,
        attach: &Attach,
    ) -> Result<ListenerLink> {
        Ok(ListenerLink::new(session, attach))
    }

    /// Accepts or refuses a link.
    ///
    /// `Ok(true)` completes the attach immediately. `Ok(false)` defers it
    /// until [`ListenerLink::complete_attach`] is called; an error refuses it.
    fn attach_link(
        &self,
        connection: &ListenerConnection,
        session: &ListenerSession,
        link: &ListenerLink,
        attach: &Attach,
    ) -> Result<bool>;
}
