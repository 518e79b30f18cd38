//! Hosts message and request processors behind one or more listeners.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use amqphost_types::{condition, Attach, DeliveryState, Error, Role};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{HostConfig, ListenerSettings};
use crate::connection::{Delivery, ListenerConnection, ListenerLink, ListenerSession};
use crate::container::Container;
use crate::error::{AmqpError, Result};
use crate::listener::ConnectionListener;
use crate::metrics::{HostMetrics, MetricsSnapshot};
use crate::processor::{MessageContext, MessageProcessor, RequestContext, RequestProcessor};

/// Credit granted on request links of a request processor.
pub const REQUEST_LINK_CREDIT: u32 = 300;

fn registry_key(address: &str) -> String {
    address.to_ascii_lowercase()
}

fn unregistered() -> Error {
    Error::new(condition::DETACH_FORCED, "Processor was unregistered.")
}

struct MessageEntry {
    processor: Arc<dyn MessageProcessor>,
    links: Mutex<Vec<ListenerLink>>,
}

struct RequestEntry {
    processor: Arc<dyn RequestProcessor>,
    links: Mutex<Vec<ListenerLink>>,
    response_links: Mutex<HashMap<String, ListenerLink>>,
}

fn forget_link(links: &Mutex<Vec<ListenerLink>>, link: &ListenerLink) {
    links.lock().retain(|l| l.id() != link.id());
}

fn close_all(links: &Mutex<Vec<ListenerLink>>) {
    let links = std::mem::take(&mut *links.lock());
    for link in links {
        link.close(Some(unregistered()));
    }
}

impl RequestEntry {
    fn dispatch(&self, delivery: Delivery) {
        let response_link = delivery
            .message()
            .reply_to()
            .and_then(|reply_to| self.response_links.lock().get(&registry_key(reply_to)).cloned());
        match response_link {
            Some(_) => delivery.accept(),
            None => {
                debug!(reply_to = ?delivery.message().reply_to(), "request has no response link");
                delivery.dispose(
                    DeliveryState::rejected(Error::new(
                        condition::NOT_FOUND,
                        "No response link was found. Ensure the link is attached or reply-to is set on the request.",
                    )),
                    true,
                );
            }
        }
        self.processor.process(RequestContext::new(delivery, response_link));
    }
}

/// Routing state shared with every connection as its [`Container`].
#[derive(Default)]
struct HostRouter {
    message_processors: Mutex<HashMap<String, Arc<MessageEntry>>>,
    request_processors: Mutex<HashMap<String, Arc<RequestEntry>>>,
}

impl HostRouter {
    fn attach_message_link(
        entry: Arc<MessageEntry>,
        address: &str,
        link: &ListenerLink,
        attach: &Attach,
    ) -> Result<bool> {
        if attach.role != Role::Sender {
            return Err(AmqpError::not_allowed(format!(
                "Only sender link can be attached at {}",
                address
            )));
        }
        let processor = entry.processor.clone();
        link.initialize_receiver(processor.credit(), move |delivery: Delivery| {
            processor.process(MessageContext::new(delivery))
        });
        entry.links.lock().push(link.clone());
        let weak = Arc::downgrade(&entry);
        link.on_closed(move |link, _| {
            if let Some(entry) = weak.upgrade() {
                forget_link(&entry.links, link);
            }
        });
        Ok(true)
    }

    fn attach_request_link(
        entry: Arc<RequestEntry>,
        address: &str,
        link: &ListenerLink,
        attach: &Attach,
    ) -> Result<bool> {
        let weak: Weak<RequestEntry> = Arc::downgrade(&entry);
        if attach.role == Role::Sender {
            let dispatcher = weak.clone();
            link.initialize_receiver(REQUEST_LINK_CREDIT, move |delivery: Delivery| {
                match dispatcher.upgrade() {
                    Some(entry) => entry.dispatch(delivery),
                    None => delivery.release(),
                }
            });
            entry.links.lock().push(link.clone());
            link.on_closed(move |link, _| {
                if let Some(entry) = weak.upgrade() {
                    forget_link(&entry.links, link);
                }
            });
            return Ok(true);
        }

        let reply_to = attach.target_address().ok_or_else(|| {
            AmqpError::new(
                condition::INVALID_FIELD,
                format!("Response link at {} must have a target address", address),
            )
        })?;
        let key = registry_key(reply_to);
        {
            let mut response_links = entry.response_links.lock();
            if response_links.contains_key(&key) {
                return Err(AmqpError::not_allowed(format!(
                    "A response link is already attached at {}",
                    reply_to
                )));
            }
            response_links.insert(key.clone(), link.clone());
        }
        link.set_settle_on_send(true);
        drop(link.initialize_sender(None));
        entry.links.lock().push(link.clone());
        link.on_closed(move |link, _| {
            if let Some(entry) = weak.upgrade() {
                {
                    let mut response_links = entry.response_links.lock();
                    if response_links.get(&key).is_some_and(|l| l.id() == link.id()) {
                        response_links.remove(&key);
                    }
                }
                forget_link(&entry.links, link);
            }
        });
        Ok(true)
    }
}

impl Container for HostRouter {
    fn attach_link(
        &self,
        _connection: &ListenerConnection,
        _session: &ListenerSession,
        link: &ListenerLink,
        attach: &Attach,
    ) -> Result<bool> {
        let address = if attach.role == Role::Receiver {
            attach.source_address()
        } else {
            attach.target_address()
        }
        .unwrap_or_default();
        let key = registry_key(address);

        let message_entry = self.message_processors.lock().get(&key).cloned();
        if let Some(entry) = message_entry {
            let attached = Self::attach_message_link(entry.clone(), address, link, attach)?;
            // An unregister that ran after the lookup may have missed this link.
            if !is_registered(&self.message_processors, &key, &entry) {
                forget_link(&entry.links, link);
                return Err(not_registered(address));
            }
            return Ok(attached);
        }
        let request_entry = self.request_processors.lock().get(&key).cloned();
        if let Some(entry) = request_entry {
            let attached = Self::attach_request_link(entry.clone(), address, link, attach)?;
            if !is_registered(&self.request_processors, &key, &entry) {
                forget_link(&entry.links, link);
                entry.response_links.lock().retain(|_, l| l.id() != link.id());
                return Err(not_registered(address));
            }
            return Ok(attached);
        }
        Err(not_registered(address))
    }
}

fn not_registered(address: &str) -> AmqpError {
    AmqpError::not_found(format!("No processor was found at {}", address))
}

fn is_registered<T>(registry: &Mutex<HashMap<String, Arc<T>>>, key: &str, entry: &Arc<T>) -> bool {
    registry.lock().get(key).is_some_and(|e| Arc::ptr_eq(e, entry))
}

/// Serves registered processors on a set of listeners.
pub struct ContainerHost {
    router: Arc<HostRouter>,
    listeners: Vec<ConnectionListener>,
    metrics: Arc<HostMetrics>,
}

impl std::fmt::Debug for ContainerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHost")
            .field("listeners", &self.listeners)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl ContainerHost {
    /// Creates a host with one listener per address, all sharing `settings`.
    pub fn new<I>(addresses: I, settings: ListenerSettings) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let router = Arc::new(HostRouter::default());
        let metrics = Arc::new(HostMetrics::new());
        let container: Arc<dyn Container> = router.clone();
        let listeners = addresses
            .into_iter()
            .map(|address| {
                ConnectionListener::with_metrics(
                    address.as_ref(),
                    settings.clone(),
                    container.clone(),
                    metrics.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            router,
            listeners,
            metrics,
        })
    }

    /// Creates a host from daemon configuration.
    pub fn from_config(config: &HostConfig) -> Result<Self> {
        Self::new(&config.listen, config.listener_settings()?)
    }

    /// Starts every listener.
    pub async fn open(&mut self) -> Result<()> {
        for listener in &mut self.listeners {
            listener.open().await?;
        }
        info!(listeners = self.listeners.len(), "container host opened");
        Ok(())
    }

    /// Stops every listener. Failures are logged, not returned.
    pub async fn close(&mut self) {
        for listener in &mut self.listeners {
            if let Err(e) = listener.close().await {
                warn!(address = %listener.address(), error = %e, "failed to close listener");
            }
        }
        info!("container host closed");
    }

    /// The host's listeners, in address order.
    pub fn listeners(&self) -> &[ConnectionListener] {
        &self.listeners
    }

    /// Counters across all listeners.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Registers `processor` for links attached at `address`.
    pub fn register_message_processor(
        &self,
        address: &str,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()> {
        let mut processors = self.router.message_processors.lock();
        let key = registry_key(address);
        if processors.contains_key(&key) {
            return Err(AmqpError::not_allowed(format!("{} is already registered", address)));
        }
        processors.insert(
            key,
            Arc::new(MessageEntry {
                processor,
                links: Mutex::new(Vec::new()),
            }),
        );
        debug!(address, "message processor registered");
        Ok(())
    }

    /// Registers `processor` for request and response links attached at `address`.
    pub fn register_request_processor(
        &self,
        address: &str,
        processor: Arc<dyn RequestProcessor>,
    ) -> Result<()> {
        let mut processors = self.router.request_processors.lock();
        let key = registry_key(address);
        if processors.contains_key(&key) {
            return Err(AmqpError::not_allowed(format!("{} is already registered", address)));
        }
        processors.insert(
            key,
            Arc::new(RequestEntry {
                processor,
                links: Mutex::new(Vec::new()),
                response_links: Mutex::new(HashMap::new()),
            }),
        );
        debug!(address, "request processor registered");
        Ok(())
    }

    /// Removes the message processor at `address` and force-detaches its links.
    pub fn unregister_message_processor(&self, address: &str) {
        let entry = self.router.message_processors.lock().remove(&registry_key(address));
        if let Some(entry) = entry {
            close_all(&entry.links);
            debug!(address, "message processor unregistered");
        }
    }

    /// Removes the request processor at `address` and force-detaches its links.
    pub fn unregister_request_processor(&self, address: &str) {
        let entry = self.router.request_processors.lock().remove(&registry_key(address));
        if let Some(entry) = entry {
            entry.response_links.lock().clear();
            close_all(&entry.links);
            debug!(address, "request processor unregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::detached_session;
    use crate::connection::Command;
    use amqphost_types::{Source, Target};

    struct Sink;

    impl MessageProcessor for Sink {
        fn credit(&self) -> u32 {
            10
        }

        fn process(&self, context: MessageContext) {
            context.complete();
        }
    }

    struct Echo;

    impl RequestProcessor for Echo {
        fn process(&self, context: RequestContext) {
            let response = context.message().clone();
            let _ = context.complete(response);
        }
    }

    fn host() -> ContainerHost {
        ContainerHost::new(Vec::<String>::new(), ListenerSettings::default()).unwrap()
    }

    fn sender_attach(address: &str) -> Attach {
        let mut attach = Attach::new("to-host", 0, Role::Sender);
        attach.target = Some(Target::with_address(address));
        attach
    }

    fn receiver_attach(address: &str) -> Attach {
        let mut attach = Attach::new("from-host", 1, Role::Receiver);
        attach.source = Some(Source::with_address("svc"));
        attach.target = Some(Target::with_address(address));
        attach
    }

    fn attach(host: &ContainerHost, attach: &Attach) -> (ListenerLink, Result<bool>) {
        let (session, _rx) = detached_session();
        let link = ListenerLink::new(&session, attach);
        let result = host
            .router
            .attach_link(session.connection(), &session, &link, attach);
        (link, result)
    }

    #[test]
    fn test_duplicate_registration_is_not_allowed() {
        let host = host();
        host.register_message_processor("echo", Arc::new(Sink)).unwrap();
        let err = host.register_message_processor("ECHO", Arc::new(Sink)).unwrap_err();
        assert_eq!(err.condition(), condition::NOT_ALLOWED);
        host.unregister_message_processor("echo");
        host.register_message_processor("echo", Arc::new(Sink)).unwrap();
    }

    #[test]
    fn test_unknown_address_is_not_found() {
        let host = host();
        let (_, result) = attach(&host, &sender_attach("nowhere"));
        let err = result.unwrap_err();
        assert_eq!(err.condition(), condition::NOT_FOUND);
        assert_eq!(err.to_error().description.as_deref(), Some("No processor was found at nowhere"));
    }

    #[test]
    fn test_message_processor_wires_receiver_credit() {
        let host = host();
        host.register_message_processor("echo", Arc::new(Sink)).unwrap();
        let (link, result) = attach(&host, &sender_attach("Echo"));
        assert!(result.unwrap());
        assert_eq!(link.role(), Role::Receiver);
        assert_eq!(link.receiver_setup().map(|(credit, _)| credit), Some(10));
    }

    #[test]
    fn test_message_processor_refuses_receivers() {
        let host = host();
        host.register_message_processor("echo", Arc::new(Sink)).unwrap();
        let mut peer = Attach::new("from-host", 0, Role::Receiver);
        peer.source = Some(Source::with_address("echo"));
        let (_, result) = attach(&host, &peer);
        assert_eq!(result.unwrap_err().condition(), condition::NOT_ALLOWED);
    }

    #[test]
    fn test_request_processor_link_pair() {
        let host = host();
        host.register_request_processor("svc", Arc::new(Echo)).unwrap();
        let (request, result) = attach(&host, &sender_attach("svc"));
        assert!(result.unwrap());
        assert_eq!(
            request.receiver_setup().map(|(credit, _)| credit),
            Some(REQUEST_LINK_CREDIT)
        );

        let (response, result) = attach(&host, &receiver_attach("client-reply-1"));
        assert!(result.unwrap());
        assert!(response.settle_on_send());

        let (_, duplicate) = attach(&host, &receiver_attach("CLIENT-REPLY-1"));
        assert_eq!(duplicate.unwrap_err().condition(), condition::NOT_ALLOWED);

        response.mark_closed(None);
        let (_, again) = attach(&host, &receiver_attach("client-reply-1"));
        assert!(again.unwrap());
    }

    #[test]
    fn test_request_without_response_link_is_rejected() {
        let host = host();
        host.register_request_processor("svc", Arc::new(Echo)).unwrap();
        let (session, mut rx) = detached_session();
        let peer = sender_attach("svc");
        let link = ListenerLink::new(&session, &peer);
        host.router
            .attach_link(session.connection(), &session, &link, &peer)
            .unwrap();

        let mut request = amqphost_types::Message::with_value("hi");
        request.properties_mut().reply_to = Some("nobody".to_string());
        let (_, handler) = link.receiver_setup().unwrap();
        handler.on_message(Delivery::new(
            link.clone(),
            0,
            bytes::Bytes::from_static(b"0"),
            Arc::new(std::sync::atomic::AtomicBool::new(false)),
            request,
        ));
        match rx.try_recv() {
            Ok(Command::Dispose {
                state: Some(DeliveryState::Rejected { error: Some(error) }),
                settled: true,
                ..
            }) => assert_eq!(error.condition, condition::NOT_FOUND),
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Unregisters itself while its link is being attached.
    struct Vanishing {
        router: Mutex<Option<Arc<HostRouter>>>,
    }

    impl MessageProcessor for Vanishing {
        fn credit(&self) -> u32 {
            if let Some(router) = self.router.lock().take() {
                let entry = router.message_processors.lock().remove("gone");
                if let Some(entry) = entry {
                    close_all(&entry.links);
                }
            }
            5
        }

        fn process(&self, context: MessageContext) {
            context.complete();
        }
    }

    #[test]
    fn test_attach_racing_unregister_is_refused() {
        let host = host();
        let processor = Arc::new(Vanishing {
            router: Mutex::new(Some(host.router.clone())),
        });
        host.register_message_processor("gone", processor.clone()).unwrap();
        let entry = host.router.message_processors.lock().get("gone").cloned().unwrap();

        let (session, mut rx) = detached_session();
        let peer = sender_attach("gone");
        let link = ListenerLink::new(&session, &peer);
        let err = host
            .router
            .attach_link(session.connection(), &session, &link, &peer)
            .unwrap_err();
        assert_eq!(err.condition(), condition::NOT_FOUND);
        assert!(entry.links.lock().is_empty());
        assert!(rx.try_recv().is_err());
        assert!(processor.router.lock().is_none());
    }

    #[test]
    fn test_unregister_detaches_links() {
        let host = host();
        host.register_message_processor("echo", Arc::new(Sink)).unwrap();
        let (session, mut rx) = detached_session();
        let peer = sender_attach("echo");
        let link = ListenerLink::new(&session, &peer);
        host.router
            .attach_link(session.connection(), &session, &link, &peer)
            .unwrap();
        host.unregister_message_processor("echo");
        match rx.try_recv() {
            Ok(Command::Detach { error: Some(error), .. }) => {
                assert_eq!(error.condition, condition::DETACH_FORCED);
                assert_eq!(error.description.as_deref(), Some("Processor was unregistered."));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
