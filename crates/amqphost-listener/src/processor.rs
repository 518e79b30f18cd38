//! Application endpoints hosted by [`crate::ContainerHost`].

use amqphost_types::{DeliveryState, Error, Message};

use crate::connection::{Delivery, ListenerLink};
use crate::error::{AmqpError, Result};

/// Consumes messages sent to an address.
///
/// `process` runs on the connection task; hand long work off to another task.
pub trait MessageProcessor: Send + Sync + 'static {
    /// Credit granted on every link attached at the address.
    fn credit(&self) -> u32;

    /// Handles one message. It stays unsettled until the context is completed.
    fn process(&self, context: MessageContext);
}

/// Answers requests sent to an address on the response link named by `reply-to`.
pub trait RequestProcessor: Send + Sync + 'static {
    /// Handles one request. The request is already settled when this is called.
    fn process(&self, context: RequestContext);
}

/// A message delivered to a [`MessageProcessor`].
#[derive(Debug)]
pub struct MessageContext {
    delivery: Delivery,
}

impl MessageContext {
    pub(crate) fn new(delivery: Delivery) -> Self {
        Self { delivery }
    }

    /// The received message.
    pub fn message(&self) -> &Message {
        self.delivery.message()
    }

    /// The link it arrived on.
    pub fn link(&self) -> &ListenerLink {
        self.delivery.link()
    }

    /// The underlying delivery.
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Settles the message as accepted.
    pub fn complete(self) {
        self.delivery.accept();
    }

    /// Settles the message as rejected with `error`.
    pub fn complete_with_error(self, error: Error) {
        self.delivery.dispose(DeliveryState::rejected(error), true);
    }
}

/// A request delivered to a [`RequestProcessor`].
#[derive(Debug)]
pub struct RequestContext {
    delivery: Delivery,
    response_link: Option<ListenerLink>,
}

impl RequestContext {
    pub(crate) fn new(delivery: Delivery, response_link: Option<ListenerLink>) -> Self {
        Self {
            delivery,
            response_link,
        }
    }

    /// The request message.
    pub fn message(&self) -> &Message {
        self.delivery.message()
    }

    /// The request link.
    pub fn link(&self) -> &ListenerLink {
        self.delivery.link()
    }

    /// The link responses go out on, if one is attached under the request's `reply-to`.
    pub fn response_link(&self) -> Option<&ListenerLink> {
        self.response_link.as_ref()
    }

    /// Sends `response`, correlated to the request by its message id.
    pub fn complete(self, mut response: Message) -> Result<()> {
        let link = self.response_link.ok_or_else(|| {
            AmqpError::not_found(format!(
                "No response link was found for reply-to {:?}",
                self.delivery.message().reply_to()
            ))
        })?;
        response.properties_mut().correlation_id = self.delivery.message().message_id().cloned();
        link.send_message(&response)?;
        Ok(())
    }
}
