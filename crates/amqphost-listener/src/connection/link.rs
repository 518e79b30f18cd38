//! Link handles given to the container and to application code.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amqphost_types::{Attach, DeliveryState, Error, Message, Role};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::{contain, Command, ListenerConnection, ListenerSession};
use crate::error::{AmqpError, Result};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Receives the messages arriving on a receiver link.
///
/// Called on the connection task; implementations must not block.
pub trait MessageHandler: Send + Sync {
    /// Handles one complete delivery.
    fn on_message(&self, delivery: Delivery);
}

impl<F> MessageHandler for F
where
    F: Fn(Delivery) + Send + Sync,
{
    fn on_message(&self, delivery: Delivery) {
        self(delivery)
    }
}

/// Receives the peer's outcomes for messages sent on a sender link.
pub trait OutcomeHandler: Send + Sync {
    /// `tag` identifies the delivery as returned by [`ListenerLink::send_message`].
    fn on_outcome(&self, tag: &Bytes, state: &DeliveryState);
}

impl<F> OutcomeHandler for F
where
    F: Fn(&Bytes, &DeliveryState) + Send + Sync,
{
    fn on_outcome(&self, tag: &Bytes, state: &DeliveryState) {
        self(tag, state)
    }
}

enum LinkSetup {
    Uninitialized,
    Receiver {
        credit: u32,
        handler: Arc<dyn MessageHandler>,
    },
    Sender {
        outcomes: Option<Arc<dyn OutcomeHandler>>,
        credit_tx: mpsc::Sender<u32>,
    },
}

type ClosedCallback = Box<dyn FnOnce(&ListenerLink, Option<&Error>) + Send>;

struct LinkShared {
    id: u64,
    session: ListenerSession,
    remote_attach: Attach,
    role: Role,
    settle_on_send: AtomicBool,
    setup: Mutex<LinkSetup>,
    credit_overflow: Arc<AtomicU32>,
    next_tag: AtomicU64,
    closed: AtomicBool,
    close_error: Mutex<Option<Error>>,
    on_closed: Mutex<Vec<ClosedCallback>>,
}

/// One attached (or attaching) link.
///
/// The local role is the opposite of the role in the peer's attach. Cloning
/// is cheap; every clone refers to the same link.
#[derive(Clone)]
pub struct ListenerLink {
    inner: Arc<LinkShared>,
}

impl std::fmt::Debug for ListenerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerLink")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("handle", &self.handle())
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ListenerLink {
    /// Creates the link answering `attach` on `session`.
    pub fn new(session: &ListenerSession, attach: &Attach) -> Self {
        Self {
            inner: Arc::new(LinkShared {
                id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
                session: session.clone(),
                remote_attach: attach.clone(),
                role: attach.role.opposite(),
                settle_on_send: AtomicBool::new(false),
                setup: Mutex::new(LinkSetup::Uninitialized),
                credit_overflow: Arc::new(AtomicU32::new(0)),
                next_tag: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                close_error: Mutex::new(None),
                on_closed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Process-wide unique id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Link name from the peer's attach.
    pub fn name(&self) -> &str {
        &self.inner.remote_attach.name
    }

    /// Handle, shared with the peer.
    pub fn handle(&self) -> u32 {
        self.inner.remote_attach.handle
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// The attach frame the peer sent.
    pub fn remote_attach(&self) -> &Attach {
        &self.inner.remote_attach
    }

    /// Owning session.
    pub fn session(&self) -> &ListenerSession {
        &self.inner.session
    }

    /// Owning connection.
    pub fn connection(&self) -> &ListenerConnection {
        self.inner.session.connection()
    }

    /// Whether messages sent on this link go out pre-settled.
    pub fn settle_on_send(&self) -> bool {
        self.inner.settle_on_send.load(Ordering::Acquire)
    }

    /// Sends subsequent messages pre-settled.
    pub fn set_settle_on_send(&self, settled: bool) {
        self.inner.settle_on_send.store(settled, Ordering::Release);
    }

    /// Makes this a receiving link granting `credit` to the peer.
    ///
    /// The peer is topped up to `credit` whenever half of it has been used.
    pub fn initialize_receiver<H>(&self, credit: u32, handler: H)
    where
        H: MessageHandler + 'static,
    {
        *self.inner.setup.lock() = LinkSetup::Receiver {
            credit,
            handler: Arc::new(handler),
        };
    }

    /// Makes this a sending link. Credit granted by the peer arrives on the
    /// returned receiver as positive increments.
    pub fn initialize_sender(&self, outcomes: Option<Arc<dyn OutcomeHandler>>) -> CreditReceiver {
        let capacity = self.connection().credit_channel_capacity().max(1);
        let (credit_tx, rx) = mpsc::channel(capacity);
        *self.inner.setup.lock() = LinkSetup::Sender {
            outcomes,
            credit_tx,
        };
        CreditReceiver {
            rx,
            overflow: self.inner.credit_overflow.clone(),
        }
    }

    /// Finishes a deferred attach. With an error the attach is refused and the link closed.
    pub fn complete_attach(&self, error: Option<Error>) -> Result<()> {
        self.command(Command::CompleteAttach {
            channel: self.session().local_channel(),
            handle: self.handle(),
            link_id: self.id(),
            error,
        })
    }

    /// Replaces the credit of a receiving link and tells the peer.
    pub fn set_credit(&self, credit: u32) -> Result<()> {
        match &mut *self.inner.setup.lock() {
            LinkSetup::Receiver { credit: current, .. } => *current = credit,
            _ => return Err(AmqpError::not_allowed("credit can only be set on a receiving link")),
        }
        self.command(Command::Flow {
            channel: self.session().local_channel(),
            handle: self.handle(),
            link_id: self.id(),
            credit,
        })
    }

    /// Queues `message` for sending and returns its delivery tag.
    ///
    /// The message leaves once the peer has granted credit and the session
    /// window allows it.
    pub fn send_message(&self, message: &Message) -> Result<Bytes> {
        if self.inner.role != Role::Sender {
            return Err(AmqpError::not_allowed("messages can only be sent on a sending link"));
        }
        if self.is_closed() {
            return Err(AmqpError::Closed("link"));
        }
        let tag = Bytes::copy_from_slice(
            &self.inner.next_tag.fetch_add(1, Ordering::Relaxed).to_be_bytes(),
        );
        self.command(Command::SendMessage {
            channel: self.session().local_channel(),
            handle: self.handle(),
            link_id: self.id(),
            payload: message.to_bytes(),
            tag: tag.clone(),
            settled: self.settle_on_send(),
        })?;
        Ok(tag)
    }

    /// Detaches and closes the link, optionally with an error.
    pub fn close(&self, error: Option<Error>) {
        if self.is_closed() {
            return;
        }
        let _ = self.command(Command::Detach {
            channel: self.session().local_channel(),
            handle: self.handle(),
            link_id: self.id(),
            error,
        });
    }

    /// Whether the link has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The error the link was closed with, if any.
    pub fn close_error(&self) -> Option<Error> {
        self.inner.close_error.lock().clone()
    }

    /// Registers a callback run once the link is closed; runs at once if it already is.
    pub fn on_closed<F>(&self, callback: F)
    where
        F: FnOnce(&ListenerLink, Option<&Error>) + Send + 'static,
    {
        {
            let mut callbacks = self.inner.on_closed.lock();
            if !self.is_closed() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        let error = self.close_error();
        callback(self, error.as_ref());
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.connection().send(command) {
            Ok(())
        } else {
            Err(AmqpError::Closed("connection"))
        }
    }

    pub(crate) fn receiver_setup(&self) -> Option<(u32, Arc<dyn MessageHandler>)> {
        match &*self.inner.setup.lock() {
            LinkSetup::Receiver { credit, handler } => Some((*credit, handler.clone())),
            _ => None,
        }
    }

    pub(crate) fn outcome_handler(&self) -> Option<Arc<dyn OutcomeHandler>> {
        match &*self.inner.setup.lock() {
            LinkSetup::Sender { outcomes, .. } => outcomes.clone(),
            _ => None,
        }
    }

    /// Passes newly granted credit to the sender's credit channel.
    pub(crate) fn grant_credit(&self, delta: u32) {
        if let LinkSetup::Sender { credit_tx, .. } = &*self.inner.setup.lock() {
            if let Err(mpsc::error::TrySendError::Full(delta)) = credit_tx.try_send(delta) {
                self.inner.credit_overflow.fetch_add(delta, Ordering::AcqRel);
            }
        }
    }

    /// Marks the link closed and runs the close callbacks. Later calls do nothing.
    pub(crate) fn mark_closed(&self, error: Option<Error>) {
        {
            let mut close_error = self.inner.close_error.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            *close_error = error.clone();
        }
        *self.inner.setup.lock() = LinkSetup::Uninitialized;
        let callbacks = std::mem::take(&mut *self.inner.on_closed.lock());
        tracing::debug!(
            link = %self.name(),
            handle = self.handle(),
            error = ?error,
            "link closed"
        );
        for callback in callbacks {
            contain("on_closed", || callback(self, error.as_ref()));
        }
    }
}

/// Credit granted to a sending link by the peer.
#[derive(Debug)]
pub struct CreditReceiver {
    rx: mpsc::Receiver<u32>,
    overflow: Arc<AtomicU32>,
}

impl CreditReceiver {
    /// Waits for the next credit increment, returning everything granted since the last call.
    pub async fn wait_for_credit(&mut self, timeout: Duration) -> Result<u32> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Err(AmqpError::Timeout("link credit")),
            Ok(None) => Err(AmqpError::Closed("link")),
            Ok(Some(delta)) => Ok(delta.saturating_add(self.overflow.swap(0, Ordering::AcqRel))),
        }
    }
}

/// A complete message received on a receiving link.
#[derive(Clone)]
pub struct Delivery {
    link: ListenerLink,
    delivery_id: u32,
    tag: Bytes,
    settled: Arc<AtomicBool>,
    message: Message,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("link", &self.link.name())
            .field("delivery_id", &self.delivery_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl Delivery {
    pub(crate) fn new(
        link: ListenerLink,
        delivery_id: u32,
        tag: Bytes,
        settled: Arc<AtomicBool>,
        message: Message,
    ) -> Self {
        Self {
            link,
            delivery_id,
            tag,
            settled,
            message,
        }
    }

    /// The decoded message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Takes the message out of the delivery.
    pub fn into_message(self) -> Message {
        self.message
    }

    /// The link the message arrived on.
    pub fn link(&self) -> &ListenerLink {
        &self.link
    }

    /// Session-scoped delivery id.
    pub fn delivery_id(&self) -> u32 {
        self.delivery_id
    }

    /// Delivery tag chosen by the peer.
    pub fn tag(&self) -> &Bytes {
        &self.tag
    }

    /// Whether the delivery is settled locally or by the peer.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Sends `state` to the peer, settling the delivery if `settled`.
    ///
    /// Does nothing once the delivery is settled.
    pub fn dispose(&self, state: DeliveryState, settled: bool) {
        if settled {
            if self.settled.swap(true, Ordering::AcqRel) {
                return;
            }
        } else if self.is_settled() {
            return;
        }
        let _ = self.link.command(Command::Dispose {
            channel: self.link.session().local_channel(),
            delivery_id: self.delivery_id,
            state: Some(state),
            settled,
        });
    }

    /// Settles the delivery as accepted.
    pub fn accept(&self) {
        self.dispose(DeliveryState::Accepted, true);
    }

    /// Settles the delivery as rejected.
    pub fn reject(&self, error: Option<Error>) {
        self.dispose(DeliveryState::Rejected { error }, true);
    }

    /// Settles the delivery as released.
    pub fn release(&self) {
        self.dispose(DeliveryState::Released, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::detached_session;
    use std::sync::atomic::AtomicUsize;

    fn attach(role: Role) -> Attach {
        Attach::new("link-1", 3, role)
    }

    #[test]
    fn test_role_is_opposite_of_peer() {
        let (session, _rx) = detached_session();
        let link = ListenerLink::new(&session, &attach(Role::Sender));
        assert_eq!(link.role(), Role::Receiver);
        assert_eq!(link.handle(), 3);
        assert_eq!(link.name(), "link-1");
        let other = ListenerLink::new(&session, &attach(Role::Receiver));
        assert_ne!(link.id(), other.id());
    }

    #[test]
    fn test_send_on_receiver_rejected() {
        let (session, _rx) = detached_session();
        let link = ListenerLink::new(&session, &attach(Role::Sender));
        assert!(link.send_message(&Message::with_value("x")).is_err());
    }

    #[test]
    fn test_send_queues_command_with_unique_tags() {
        let (session, mut rx) = detached_session();
        let link = ListenerLink::new(&session, &attach(Role::Receiver));
        link.set_settle_on_send(true);
        let a = link.send_message(&Message::with_value("a")).unwrap();
        let b = link.send_message(&Message::with_value("b")).unwrap();
        assert_ne!(a, b);
        match rx.try_recv().unwrap() {
            Command::SendMessage { settled, handle, .. } => {
                assert!(settled);
                assert_eq!(handle, 3);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_close_callbacks_run_once() {
        let (session, _rx) = detached_session();
        let link = ListenerLink::new(&session, &attach(Role::Sender));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        link.on_closed(move |_, error| {
            assert!(error.is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        link.mark_closed(Some(Error::new("amqp:link:detach-forced", "bye")));
        link.mark_closed(None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(link.is_closed());

        let late = calls.clone();
        link.on_closed(move |_, _| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_credit_overflow_is_not_lost() {
        let (session, _rx) = detached_session();
        let link = ListenerLink::new(&session, &attach(Role::Receiver));
        let mut credit = link.initialize_sender(None);
        let capacity = session.connection().credit_channel_capacity();
        for _ in 0..capacity + 5 {
            link.grant_credit(2);
        }
        let mut total = 0;
        while let Ok(delta) = credit.wait_for_credit(Duration::from_millis(10)).await {
            total += delta;
        }
        assert_eq!(total as usize, (capacity + 5) * 2);
    }

    #[tokio::test]
    async fn test_credit_wait_times_out_then_reports_close() {
        let (session, _rx) = detached_session();
        let link = ListenerLink::new(&session, &attach(Role::Receiver));
        let mut credit = link.initialize_sender(None);
        assert!(matches!(
            credit.wait_for_credit(Duration::from_millis(5)).await,
            Err(AmqpError::Timeout(_))
        ));
        link.mark_closed(None);
        assert!(matches!(
            credit.wait_for_credit(Duration::from_millis(5)).await,
            Err(AmqpError::Closed(_))
        ));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (session, mut rx) = detached_session();
        let link = ListenerLink::new(&session, &attach(Role::Sender));
        let delivery = Delivery::new(
            link,
            7,
            Bytes::from_static(b"t"),
            Arc::new(AtomicBool::new(false)),
            Message::with_value("hello"),
        );
        delivery.accept();
        delivery.accept();
        delivery.reject(None);
        assert!(delivery.is_settled());
        assert!(matches!(rx.try_recv(), Ok(Command::Dispose { delivery_id: 7, settled: true, .. })));
        assert!(rx.try_recv().is_err());
    }
}
