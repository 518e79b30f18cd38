//! Sessions: windows, delivery ids, settlement tables and the links they carry.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use amqphost_types::{
    condition, Attach, Begin, DeliveryState, Detach, Disposition, Error, Flow, Role,
    SenderSettleMode, Transfer,
};
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::actor::FrameSink;
use super::link::{Delivery, ListenerLink};
use super::{contain, Command, ListenerConnection};
use crate::config::ConnectionSettings;
use crate::container::Container;
use crate::error::AmqpError;

struct SessionShared {
    connection: ListenerConnection,
    local_channel: u16,
    remote_channel: u16,
}

/// Handle to a session begun by the peer.
#[derive(Clone)]
pub struct ListenerSession {
    inner: Arc<SessionShared>,
}

impl std::fmt::Debug for ListenerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSession")
            .field("connection", &self.inner.connection.id())
            .field("local_channel", &self.inner.local_channel)
            .field("remote_channel", &self.inner.remote_channel)
            .finish()
    }
}

impl ListenerSession {
    pub(crate) fn new(connection: ListenerConnection, local_channel: u16, remote_channel: u16) -> Self {
        Self {
            inner: Arc::new(SessionShared {
                connection,
                local_channel,
                remote_channel,
            }),
        }
    }

    /// Owning connection.
    pub fn connection(&self) -> &ListenerConnection {
        &self.inner.connection
    }

    /// Channel this side sends the session's frames on.
    pub fn local_channel(&self) -> u16 {
        self.inner.local_channel
    }

    /// Channel the peer sends the session's frames on.
    pub fn remote_channel(&self) -> u16 {
        self.inner.remote_channel
    }

    /// Ends the session, sending `error` in the `end` frame.
    pub fn close(&self, error: Option<Error>) {
        self.inner.connection.send(Command::EndSession {
            channel: self.local_channel(),
            error,
        });
    }
}

/// Failures raised while handling a session frame, by the scope they end.
#[derive(Debug)]
pub(crate) enum Fault {
    /// Ends the session.
    Session(Error),
    /// Closes the connection.
    Connection(Error),
}

/// Per-connection collaborators a session calls into.
pub(crate) struct SessionEnv<'a> {
    pub container: &'a dyn Container,
    pub connection: &'a ListenerConnection,
    pub settings: &'a ConnectionSettings,
}

struct PartialDelivery {
    delivery_id: u32,
    tag: Bytes,
    settled: bool,
    buffer: BytesMut,
}

struct OutgoingMessage {
    payload: Bytes,
    tag: Bytes,
    settled: bool,
}

#[derive(Clone)]
struct UnsettledOutgoing {
    handle: u32,
    link_id: u64,
    tag: Bytes,
}

pub(crate) struct LinkState {
    link: ListenerLink,
    attached: bool,
    attach_deadline: Option<Instant>,
    detach_sent: bool,
    delivery_count: u32,
    link_credit: u32,
    credit: u32,
    delivered_since_flow: u32,
    partial: Option<PartialDelivery>,
    outgoing: VecDeque<OutgoingMessage>,
}

impl LinkState {
    fn new(link: ListenerLink, attach_deadline: Instant) -> Self {
        Self {
            link,
            attached: false,
            attach_deadline: Some(attach_deadline),
            detach_sent: false,
            delivery_count: 0,
            link_credit: 0,
            credit: 0,
            delivered_since_flow: 0,
            partial: None,
            outgoing: VecDeque::new(),
        }
    }
}

/// Protocol state of one session, owned by the connection task.
pub(crate) struct SessionState {
    handle: ListenerSession,
    handle_max: u32,
    next_outgoing_id: u32,
    outgoing_window: u32,
    incoming_window: u32,
    incoming_remaining: u32,
    next_incoming_id: u32,
    remote_incoming_window: u32,
    remote_outgoing_window: u32,
    next_delivery_id: u32,
    links: HashMap<u32, LinkState>,
    incoming_unsettled: BTreeMap<u32, Arc<AtomicBool>>,
    outgoing_unsettled: BTreeMap<u32, UnsettledOutgoing>,
    end_sent: bool,
}

impl SessionState {
    pub(crate) fn new(handle: ListenerSession, begin: &Begin, settings: &ConnectionSettings) -> Self {
        Self {
            handle,
            handle_max: settings.handle_max.min(begin.handle_max),
            next_outgoing_id: 0,
            outgoing_window: settings.outgoing_window,
            incoming_window: settings.incoming_window,
            incoming_remaining: settings.incoming_window,
            next_incoming_id: begin.next_outgoing_id,
            remote_incoming_window: begin.incoming_window,
            remote_outgoing_window: begin.outgoing_window,
            next_delivery_id: 0,
            links: HashMap::new(),
            incoming_unsettled: BTreeMap::new(),
            outgoing_unsettled: BTreeMap::new(),
            end_sent: false,
        }
    }

    pub(crate) fn handle(&self) -> &ListenerSession {
        &self.handle
    }

    pub(crate) fn local_channel(&self) -> u16 {
        self.handle.local_channel()
    }

    pub(crate) fn is_ending(&self) -> bool {
        self.end_sent
    }

    pub(crate) fn set_ending(&mut self) {
        self.end_sent = true;
    }

    /// The `begin` answering the peer's.
    pub(crate) fn begin_reply(&self) -> Begin {
        Begin {
            remote_channel: Some(self.handle.remote_channel()),
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_remaining,
            outgoing_window: self.outgoing_window,
            handle_max: self.handle_max,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }

    fn session_flow(&self) -> Flow {
        Flow {
            next_incoming_id: Some(self.next_incoming_id),
            incoming_window: self.incoming_remaining,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            ..Default::default()
        }
    }

    fn link_flow(&self, handle: u32) -> Option<Flow> {
        let state = self.links.get(&handle)?;
        Some(Flow {
            handle: Some(handle),
            delivery_count: Some(state.delivery_count),
            link_credit: Some(state.link_credit),
            ..self.session_flow()
        })
    }

    fn send_link_flow(&self, handle: u32, out: &mut FrameSink) {
        if let Some(flow) = self.link_flow(handle) {
            out.send(self.local_channel(), flow);
        }
    }

    fn link_state(&mut self, handle: u32, link_id: u64) -> Option<&mut LinkState> {
        self.links
            .get_mut(&handle)
            .filter(|state| state.link.id() == link_id)
    }

    pub(crate) fn on_attach(
        &mut self,
        attach: Attach,
        env: &SessionEnv<'_>,
        out: &mut FrameSink,
    ) -> Result<(), Fault> {
        if attach.handle > self.handle_max {
            return Err(Fault::Session(Error::new(
                condition::NOT_ALLOWED,
                format!("handle {} exceeds handle-max {}", attach.handle, self.handle_max),
            )));
        }
        if self.links.contains_key(&attach.handle) {
            return Err(Fault::Session(Error::new(
                condition::HANDLE_IN_USE,
                format!("handle {} is already attached", attach.handle),
            )));
        }
        debug!(
            link = %attach.name,
            handle = attach.handle,
            role = ?attach.role,
            source = ?attach.source_address(),
            target = ?attach.target_address(),
            "attach received"
        );

        let created = contain("create_link", || {
            env.container.create_link(env.connection, &self.handle, &attach)
        })
        .unwrap_or_else(|| Err(AmqpError::internal("link could not be created")));
        let link = match created {
            Ok(link) => link,
            Err(e) => {
                self.refuse_attach(&attach, e.to_error(), out);
                return Ok(());
            }
        };
        let id = link.id();
        let handle = attach.handle;
        self.links.insert(
            handle,
            LinkState::new(link.clone(), Instant::now() + env.settings.attach_timeout()),
        );

        let attached = contain("attach_link", || {
            env.container.attach_link(env.connection, &self.handle, &link, &attach)
        })
        .unwrap_or_else(|| Err(AmqpError::internal("link could not be attached")));
        match attached {
            Ok(true) => self.complete_attach(handle, id, None, out),
            Ok(false) => trace!(link = %attach.name, "attach deferred"),
            Err(e) => self.complete_attach(handle, id, Some(e.to_error()), out),
        }
        Ok(())
    }

    /// Refuses an attach that never produced a link.
    fn refuse_attach(&mut self, attach: &Attach, error: Error, out: &mut FrameSink) {
        warn!(link = %attach.name, error = ?error, "attach refused");
        let channel = self.local_channel();
        out.send(channel, Attach::new(attach.name.clone(), attach.handle, attach.role.opposite()));
        out.send(
            channel,
            Detach {
                handle: attach.handle,
                closed: true,
                error: Some(error),
            },
        );
        out.metrics().attach_rejected();
    }

    /// Answers a pending attach, accepting it or refusing it with `error`.
    pub(crate) fn complete_attach(
        &mut self,
        handle: u32,
        link_id: u64,
        error: Option<Error>,
        out: &mut FrameSink,
    ) {
        let channel = self.local_channel();
        let Some(state) = self.link_state(handle, link_id) else {
            return;
        };
        if state.attached || state.detach_sent {
            return;
        }
        state.attach_deadline = None;
        let link = state.link.clone();
        let peer = link.remote_attach();
        let mut reply = Attach::new(peer.name.clone(), handle, link.role());
        reply.rcv_settle_mode = peer.rcv_settle_mode;
        reply.snd_settle_mode = peer.snd_settle_mode;
        if link.role() == Role::Sender {
            reply.initial_delivery_count = Some(0);
            if link.settle_on_send() {
                reply.snd_settle_mode = SenderSettleMode::Settled;
            }
        }

        match error {
            None => {
                reply.source = peer.source.clone();
                reply.target = peer.target.clone();
                out.send(channel, reply);
                state.attached = true;
                if let Some((credit, _)) = link.receiver_setup() {
                    state.credit = credit;
                    state.link_credit = credit;
                    self.send_link_flow(handle, out);
                }
                out.metrics().attach_accepted();
                debug!(link = %link.name(), handle, role = ?link.role(), "link attached");
                self.pump_link(handle, out);
            }
            Some(error) => {
                warn!(link = %link.name(), error = ?error, "attach refused");
                out.send(channel, reply);
                out.send(
                    channel,
                    Detach {
                        handle,
                        closed: true,
                        error: Some(error.clone()),
                    },
                );
                state.detach_sent = true;
                out.metrics().attach_rejected();
                link.mark_closed(Some(error));
            }
        }
    }

    /// Refuses attaches the container left pending past their deadline.
    pub(crate) fn expire_attaches(&mut self, now: Instant, out: &mut FrameSink) {
        let expired: Vec<(u32, u64)> = self
            .links
            .iter()
            .filter(|(_, s)| s.attach_deadline.is_some_and(|d| d <= now))
            .map(|(handle, s)| (*handle, s.link.id()))
            .collect();
        for (handle, link_id) in expired {
            self.complete_attach(
                handle,
                link_id,
                Some(Error::new(condition::INTERNAL_ERROR, "attach was not completed in time")),
                out,
            );
        }
    }

    pub(crate) fn on_flow(&mut self, flow: Flow, out: &mut FrameSink) -> Result<(), Fault> {
        self.remote_incoming_window = match flow.next_incoming_id {
            Some(next_incoming_id) => next_incoming_id
                .wrapping_add(flow.incoming_window)
                .wrapping_sub(self.next_outgoing_id),
            None => flow.incoming_window,
        };
        self.remote_outgoing_window = flow.outgoing_window;

        let Some(handle) = flow.handle else {
            if flow.echo {
                out.send(self.local_channel(), self.session_flow());
            }
            self.pump_all(out);
            return Ok(());
        };

        let Some(state) = self.links.get_mut(&handle) else {
            return Err(unattached(handle));
        };
        let mut reply = flow.echo;
        if state.link.role() == Role::Sender {
            let their_count = flow.delivery_count.unwrap_or(state.delivery_count);
            let limit = their_count.wrapping_add(flow.link_credit.unwrap_or(0));
            let current = state.delivery_count.wrapping_add(state.link_credit);
            let delta = limit.wrapping_sub(current) as i32;
            state.link_credit = limit.wrapping_sub(state.delivery_count);
            if delta > 0 {
                state.link.grant_credit(delta as u32);
            }
            if flow.drain && state.outgoing.is_empty() {
                state.delivery_count = state.delivery_count.wrapping_add(state.link_credit);
                state.link_credit = 0;
                reply = true;
            }
        }
        if reply {
            self.send_link_flow(handle, out);
        }
        self.pump_all(out);
        Ok(())
    }

    pub(crate) fn on_transfer(
        &mut self,
        transfer: Transfer,
        payload: Bytes,
        env: &SessionEnv<'_>,
        out: &mut FrameSink,
    ) -> Result<(), Fault> {
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        if self.incoming_remaining == 0 {
            return Err(Fault::Session(Error::new(
                condition::WINDOW_VIOLATION,
                "transfer exceeds the incoming window",
            )));
        }
        self.incoming_remaining -= 1;
        self.remote_outgoing_window = self.remote_outgoing_window.saturating_sub(1);

        let handle = transfer.handle;
        let Some(state) = self.links.get_mut(&handle) else {
            return Err(unattached(handle));
        };
        if state.detach_sent {
            return Ok(());
        }
        if state.link.role() != Role::Receiver || !state.attached {
            return Err(Fault::Session(Error::new(
                condition::ERRANT_LINK,
                format!("link {} cannot receive transfers", handle),
            )));
        }
        if transfer.aborted {
            state.partial = None;
            return Ok(());
        }

        let complete = match state.partial.take() {
            None => {
                let delivery_id = transfer.delivery_id.ok_or_else(|| {
                    Fault::Session(Error::new(
                        condition::INVALID_FIELD,
                        "first transfer of a delivery has no delivery-id",
                    ))
                })?;
                let tag = transfer.delivery_tag.clone().unwrap_or_default();
                let settled = transfer.settled.unwrap_or(false);
                if transfer.more {
                    let mut buffer = BytesMut::with_capacity(payload.len() * 2);
                    buffer.extend_from_slice(&payload);
                    state.partial = Some(PartialDelivery {
                        delivery_id,
                        tag,
                        settled,
                        buffer,
                    });
                    None
                } else {
                    Some((delivery_id, tag, settled, payload))
                }
            }
            Some(mut partial) => {
                partial.buffer.extend_from_slice(&payload);
                partial.settled |= transfer.settled.unwrap_or(false);
                if transfer.more {
                    state.partial = Some(partial);
                    None
                } else {
                    Some((partial.delivery_id, partial.tag, partial.settled, partial.buffer.freeze()))
                }
            }
        };

        if let Some((delivery_id, tag, settled, payload)) = complete {
            self.deliver(handle, delivery_id, tag, settled, payload, env, out);
        }

        if self.incoming_remaining < self.incoming_window / 2 {
            self.incoming_remaining = self.incoming_window;
            out.send(self.local_channel(), self.session_flow());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &mut self,
        handle: u32,
        delivery_id: u32,
        tag: Bytes,
        settled: bool,
        payload: Bytes,
        env: &SessionEnv<'_>,
        out: &mut FrameSink,
    ) {
        let Some(state) = self.links.get_mut(&handle) else {
            return;
        };
        state.delivery_count = state.delivery_count.wrapping_add(1);
        state.link_credit = state.link_credit.saturating_sub(1);
        state.delivered_since_flow += 1;
        let link = state.link.clone();
        let refill = state.credit > 0 && state.delivered_since_flow >= (state.credit / 2).max(1);
        if refill {
            state.link_credit = state.credit;
            state.delivered_since_flow = 0;
        }

        let decoded = contain("create_message", || env.container.create_message(payload))
            .unwrap_or_else(|| Err(AmqpError::internal("message could not be created")));
        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                warn!(link = %link.name(), delivery_id, error = %e, "undecodable message");
                self.detach_link(handle, link.id(), Some(Error::new(condition::DECODE_ERROR, e.to_string())), out);
                return;
            }
        };
        if refill {
            self.send_link_flow(handle, out);
        }

        let settled_flag = Arc::new(AtomicBool::new(settled));
        if !settled {
            self.incoming_unsettled.insert(delivery_id, settled_flag.clone());
        }
        out.metrics().message_received();
        trace!(link = %link.name(), delivery_id, settled, "message received");
        match link.receiver_setup() {
            Some((_, handler)) => {
                let name = link.name().to_string();
                let delivery = Delivery::new(link, delivery_id, tag, settled_flag, message);
                if contain("on_message", || handler.on_message(delivery)).is_none() {
                    warn!(link = %name, delivery_id, "delivery left unsettled after handler panic");
                }
            }
            None => warn!(link = %link.name(), delivery_id, "no handler for received message"),
        }
    }

    pub(crate) fn on_disposition(&mut self, disposition: Disposition, out: &mut FrameSink) {
        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);
        if first > last {
            return;
        }
        match disposition.role {
            Role::Receiver => {
                let ids: Vec<u32> = self
                    .outgoing_unsettled
                    .range(first..=last)
                    .map(|(id, _)| *id)
                    .collect();
                let terminal = disposition.state.as_ref().is_some_and(DeliveryState::is_outcome);
                for id in &ids {
                    let entry = if disposition.settled || terminal {
                        self.outgoing_unsettled.remove(id)
                    } else {
                        self.outgoing_unsettled.get(id).cloned()
                    };
                    let (Some(entry), Some(delivery_state)) = (entry, disposition.state.as_ref()) else {
                        continue;
                    };
                    let handler = self
                        .links
                        .get(&entry.handle)
                        .filter(|s| s.link.id() == entry.link_id)
                        .and_then(|s| s.link.outcome_handler());
                    if let Some(handler) = handler {
                        contain("on_outcome", || handler.on_outcome(&entry.tag, delivery_state));
                    }
                }
                if !ids.is_empty() && !disposition.settled && terminal {
                    out.send(
                        self.local_channel(),
                        Disposition {
                            role: Role::Sender,
                            first,
                            last: disposition.last,
                            settled: true,
                            state: disposition.state,
                            batchable: false,
                        },
                    );
                }
            }
            Role::Sender => {
                if !disposition.settled {
                    return;
                }
                let ids: Vec<u32> = self
                    .incoming_unsettled
                    .range(first..=last)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    if let Some(flag) = self.incoming_unsettled.remove(&id) {
                        flag.store(true, Ordering::Release);
                    }
                }
            }
        }
    }

    /// Sends the local outcome of a received delivery. Unknown or settled deliveries are ignored.
    pub(crate) fn dispose(
        &mut self,
        delivery_id: u32,
        state: Option<DeliveryState>,
        settled: bool,
        out: &mut FrameSink,
    ) {
        if !self.incoming_unsettled.contains_key(&delivery_id) {
            return;
        }
        if settled {
            if let Some(flag) = self.incoming_unsettled.remove(&delivery_id) {
                flag.store(true, Ordering::Release);
            }
        }
        out.send(
            self.local_channel(),
            Disposition {
                role: Role::Receiver,
                first: delivery_id,
                last: None,
                settled,
                state,
                batchable: false,
            },
        );
    }

    pub(crate) fn send_message(
        &mut self,
        handle: u32,
        link_id: u64,
        payload: Bytes,
        tag: Bytes,
        settled: bool,
        out: &mut FrameSink,
    ) {
        match self.link_state(handle, link_id) {
            Some(state) if !state.detach_sent => {
                state.outgoing.push_back(OutgoingMessage {
                    payload,
                    tag,
                    settled,
                });
            }
            _ => {
                debug!(handle, "message dropped for detached link");
                return;
            }
        }
        self.pump_link(handle, out);
    }

    /// Sends queued messages while link credit and the peer's window allow.
    fn pump_link(&mut self, handle: u32, out: &mut FrameSink) {
        let channel = self.local_channel();
        loop {
            if self.remote_incoming_window == 0 {
                return;
            }
            let Some(state) = self.links.get_mut(&handle) else {
                return;
            };
            if !state.attached || state.detach_sent || state.link_credit == 0 {
                return;
            }
            let Some(message) = state.outgoing.pop_front() else {
                return;
            };
            let delivery_id = self.next_delivery_id;
            self.next_delivery_id = delivery_id.wrapping_add(1);
            state.delivery_count = state.delivery_count.wrapping_add(1);
            state.link_credit -= 1;
            let link_id = state.link.id();
            self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
            self.remote_incoming_window -= 1;
            if !message.settled {
                self.outgoing_unsettled.insert(
                    delivery_id,
                    UnsettledOutgoing {
                        handle,
                        link_id,
                        tag: message.tag.clone(),
                    },
                );
            }
            let transfer = Transfer {
                handle,
                delivery_id: Some(delivery_id),
                delivery_tag: Some(message.tag),
                message_format: Some(0),
                settled: Some(message.settled),
                ..Default::default()
            };
            out.send_transfer(channel, transfer, message.payload);
            out.metrics().message_sent();
        }
    }

    fn pump_all(&mut self, out: &mut FrameSink) {
        let handles: Vec<u32> = self
            .links
            .iter()
            .filter(|(_, s)| !s.outgoing.is_empty())
            .map(|(handle, _)| *handle)
            .collect();
        for handle in handles {
            self.pump_link(handle, out);
        }
    }

    /// Replaces the credit of a receiving link and sends it.
    pub(crate) fn set_credit(&mut self, handle: u32, link_id: u64, credit: u32, out: &mut FrameSink) {
        let Some(state) = self.link_state(handle, link_id) else {
            return;
        };
        if !state.attached || state.detach_sent {
            return;
        }
        state.credit = credit;
        state.link_credit = credit;
        state.delivered_since_flow = 0;
        self.send_link_flow(handle, out);
    }

    /// Detaches a link from this side.
    pub(crate) fn detach_link(
        &mut self,
        handle: u32,
        link_id: u64,
        error: Option<Error>,
        out: &mut FrameSink,
    ) {
        let channel = self.local_channel();
        let Some(state) = self.link_state(handle, link_id) else {
            return;
        };
        if state.detach_sent {
            return;
        }
        out.send(
            channel,
            Detach {
                handle,
                closed: true,
                error: error.clone(),
            },
        );
        state.detach_sent = true;
        state.attach_deadline = None;
        state.partial = None;
        state.outgoing.clear();
        state.link.mark_closed(error);
    }

    pub(crate) fn on_detach(&mut self, detach: Detach, out: &mut FrameSink) -> Result<(), Fault> {
        let Some(state) = self.links.remove(&detach.handle) else {
            return Err(unattached(detach.handle));
        };
        if !state.detach_sent {
            out.send(
                self.local_channel(),
                Detach {
                    handle: detach.handle,
                    closed: detach.closed,
                    error: None,
                },
            );
        }
        let link_id = state.link.id();
        self.outgoing_unsettled.retain(|_, entry| entry.link_id != link_id);
        state.link.mark_closed(detach.error);
        Ok(())
    }

    /// Closes every link of the session.
    pub(crate) fn close_links(&mut self, error: Option<&Error>) {
        for (_, state) in self.links.drain() {
            state.link.mark_closed(error.cloned());
        }
        self.incoming_unsettled.clear();
        self.outgoing_unsettled.clear();
    }
}

fn unattached(handle: u32) -> Fault {
    Fault::Session(Error::new(
        condition::UNATTACHED_HANDLE,
        format!("handle {} is not attached", handle),
    ))
}
