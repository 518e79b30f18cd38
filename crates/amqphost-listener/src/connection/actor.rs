//! The connection task: connection state machine, timers and frame dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use amqphost_transport::Writer;
use amqphost_types::{
    condition, decode_frame, encode_frame, encode_transfer, Begin, Close, End, Error, FrameBody,
    Open, Performative, ProtocolHeader, Transfer, HEARTBEAT, MIN_MAX_FRAME_SIZE,
};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::session::{Fault, ListenerSession, SessionEnv, SessionState};
use super::{Command, ConnectionContext, ListenerConnection};
use crate::config::ConnectionSettings;
use crate::container::Container;
use crate::error::{AmqpError, Result};
use crate::metrics::HostMetrics;

/// Timer resolution for idle, heartbeat, attach and close deadlines.
const TICK: Duration = Duration::from_millis(100);

/// Encodes frames onto the connection's writer.
pub(crate) struct FrameSink {
    writer: Writer,
    metrics: Arc<HostMetrics>,
    max_frame_size: u32,
    last_write: Instant,
}

impl FrameSink {
    pub(crate) fn new(writer: Writer, metrics: Arc<HostMetrics>, max_frame_size: u32) -> Self {
        Self {
            writer,
            metrics,
            max_frame_size,
            last_write: Instant::now(),
        }
    }

    pub(crate) fn send(&mut self, channel: u16, performative: impl Into<Performative>) {
        let performative = performative.into();
        trace!(channel, frame = performative.name(), "send");
        self.write(encode_frame(channel, &performative, &[]));
    }

    /// Sends a delivery, split into as many transfers as the frame size requires.
    pub(crate) fn send_transfer(&mut self, channel: u16, transfer: Transfer, payload: Bytes) {
        for frame in encode_transfer(channel, &transfer, payload, self.max_frame_size) {
            self.write(frame);
        }
    }

    pub(crate) fn metrics(&self) -> &HostMetrics {
        &self.metrics
    }

    /// Waits until everything written so far reached the transport.
    pub(crate) async fn flush(&self) {
        self.writer.flush().await
    }

    fn write(&mut self, frame: Bytes) {
        self.metrics.frame_sent(frame.len());
        self.last_write = Instant::now();
        self.writer.write(frame);
    }
}

/// Connection lifecycle as seen from the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Start,
    HeaderExchanged,
    Opened,
    CloseSent,
    End,
}

pub(crate) struct ConnectionActor {
    connection: ListenerConnection,
    settings: Arc<ConnectionSettings>,
    container: Arc<dyn Container>,
    container_id: String,
    out: FrameSink,
    state: ConnectionState,
    sessions: HashMap<u16, SessionState>,
    remote_channels: HashMap<u16, u16>,
    channel_max: u16,
    remote_idle_timeout: Option<Duration>,
    started: Instant,
    last_received: Instant,
    close_deadline: Option<Instant>,
    close_error: Option<Error>,
}

impl ConnectionActor {
    pub(crate) fn new(connection: ListenerConnection, context: &ConnectionContext, writer: Writer) -> Self {
        let settings = context.settings.clone();
        let container_id = settings
            .container_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Instant::now();
        Self {
            connection,
            container: context.container.clone(),
            container_id,
            out: FrameSink::new(
                writer,
                context.metrics.clone(),
                settings.max_frame_size.max(MIN_MAX_FRAME_SIZE),
            ),
            state: ConnectionState::Start,
            sessions: HashMap::new(),
            remote_channels: HashMap::new(),
            channel_max: settings.channel_max,
            remote_idle_timeout: None,
            started: now,
            last_received: now,
            close_deadline: None,
            close_error: None,
            settings,
        }
    }

    /// Runs until both sides closed, the transport failed or a deadline passed.
    pub(crate) async fn run(
        mut self,
        header: ProtocolHeader,
        mut frames: mpsc::Receiver<Bytes>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> Result<()> {
        trace!(?header, "protocol header accepted");
        self.out.write(Bytes::copy_from_slice(&ProtocolHeader::amqp().to_bytes()));
        self.state = ConnectionState::HeaderExchanged;

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => break Ok(()),
                },
                command = commands.recv() => match command {
                    Some(Command::IoError(e)) => break Err(AmqpError::Transport(e)),
                    Some(command) => self.on_command(command),
                    None => break Ok(()),
                },
                _ = ticker.tick() => self.on_tick(Instant::now()),
            }
            if self.state == ConnectionState::End {
                break Ok(());
            }
        };

        self.teardown(result.as_ref().err());
        let _ = tokio::time::timeout(self.settings.close_timeout(), self.out.flush()).await;
        result
    }

    fn on_frame(&mut self, frame: Bytes) {
        self.last_received = Instant::now();
        self.out.metrics.frame_received(frame.len());
        let frame = match decode_frame(frame) {
            Ok(frame) => frame,
            Err(e) => {
                self.close_with(Some(Error::new(condition::DECODE_ERROR, e.to_string())));
                return;
            }
        };
        match frame.body {
            FrameBody::Empty => trace!("heartbeat received"),
            FrameBody::Sasl(_) => self.close_with(Some(Error::new(
                condition::NOT_ALLOWED,
                "SASL frame after negotiation",
            ))),
            FrameBody::Amqp(performative) => {
                trace!(channel = frame.channel, frame = performative.name(), "received");
                self.on_performative(frame.channel, performative, frame.payload)
            }
        }
    }

    fn on_performative(&mut self, channel: u16, performative: Performative, payload: Bytes) {
        if self.state == ConnectionState::CloseSent && !matches!(performative, Performative::Close(_)) {
            return;
        }
        match performative {
            Performative::Open(open) => self.on_open(open),
            Performative::Close(close) => self.on_close(close),
            other if self.state != ConnectionState::Opened => self.close_with(Some(Error::new(
                condition::ILLEGAL_STATE,
                format!("{} received before open", other.name()),
            ))),
            Performative::Begin(begin) => self.on_begin(channel, begin),
            Performative::End(end) => self.on_end(channel, end),
            other => self.on_session_frame(channel, other, payload),
        }
    }

    fn on_open(&mut self, open: Open) {
        if self.state != ConnectionState::HeaderExchanged {
            self.close_with(Some(Error::new(condition::ILLEGAL_STATE, "duplicate open")));
            return;
        }
        self.connection.set_remote_container_id(open.container_id.clone());
        self.out.max_frame_size = self
            .settings
            .max_frame_size
            .min(open.max_frame_size)
            .max(MIN_MAX_FRAME_SIZE);
        self.channel_max = self.settings.channel_max.min(open.channel_max);
        self.remote_idle_timeout = open
            .idle_time_out
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64));
        self.send_open();
        self.state = ConnectionState::Opened;
        info!(
            peer = %self.connection.peer_addr(),
            container_id = %open.container_id,
            max_frame_size = self.out.max_frame_size,
            channel_max = self.channel_max,
            "connection opened"
        );
    }

    fn send_open(&mut self) {
        let mut open = Open::new(self.container_id.clone());
        open.max_frame_size = self.settings.max_frame_size.max(MIN_MAX_FRAME_SIZE);
        open.channel_max = self.settings.channel_max;
        open.idle_time_out = self.settings.idle_timeout_ms.filter(|ms| *ms > 0);
        self.out.send(0, open);
    }

    fn on_close(&mut self, close: Close) {
        match &close.error {
            Some(error) => warn!(peer = %self.connection.peer_addr(), error = ?error, "peer closed connection with error"),
            None => debug!(peer = %self.connection.peer_addr(), "peer closed connection"),
        }
        if self.state != ConnectionState::CloseSent {
            if self.state == ConnectionState::HeaderExchanged {
                self.send_open();
            }
            self.out.send(0, Close { error: None });
        }
        if self.close_error.is_none() {
            self.close_error = close.error;
        }
        self.state = ConnectionState::End;
    }

    /// Sends `close` and waits for the peer's, bounded by the close timeout.
    fn close_with(&mut self, error: Option<Error>) {
        match self.state {
            ConnectionState::CloseSent | ConnectionState::End => return,
            ConnectionState::Start | ConnectionState::HeaderExchanged => self.send_open(),
            ConnectionState::Opened => {}
        }
        if let Some(error) = &error {
            warn!(peer = %self.connection.peer_addr(), error = ?error, "closing connection");
        }
        self.out.send(0, Close { error: error.clone() });
        self.state = ConnectionState::CloseSent;
        self.close_deadline = Some(Instant::now() + self.settings.close_timeout());
        self.close_error = error;
        self.close_sessions();
    }

    fn on_begin(&mut self, channel: u16, begin: Begin) {
        if self.remote_channels.contains_key(&channel) {
            self.close_with(Some(Error::new(
                condition::ILLEGAL_STATE,
                format!("channel {} already has a session", channel),
            )));
            return;
        }
        if channel > self.channel_max {
            self.close_with(Some(Error::new(
                condition::NOT_ALLOWED,
                format!("channel {} exceeds channel-max {}", channel, self.channel_max),
            )));
            return;
        }
        let Some(local) = (0..=self.channel_max).find(|c| !self.sessions.contains_key(c)) else {
            self.close_with(Some(Error::new(
                condition::NOT_ALLOWED,
                format!("channel-max {} reached", self.channel_max),
            )));
            return;
        };
        let handle = ListenerSession::new(self.connection.clone(), local, channel);
        let session = SessionState::new(handle, &begin, &self.settings);
        self.out.send(local, session.begin_reply());
        debug!(peer = %self.connection.peer_addr(), local, remote = channel, "session begun");
        self.sessions.insert(local, session);
        self.remote_channels.insert(channel, local);
    }

    fn on_end(&mut self, channel: u16, end: End) {
        let Some(local) = self.remote_channels.remove(&channel) else {
            self.close_with(Some(no_session(channel)));
            return;
        };
        let Some(mut session) = self.sessions.remove(&local) else {
            return;
        };
        if !session.is_ending() {
            self.out.send(local, End { error: None });
        }
        if let Some(error) = &end.error {
            warn!(channel, error = ?error, "peer ended session with error");
        }
        session.close_links(end.error.as_ref());
        debug!(local, remote = channel, "session ended");
    }

    fn on_session_frame(&mut self, channel: u16, performative: Performative, payload: Bytes) {
        let Some(&local) = self.remote_channels.get(&channel) else {
            self.close_with(Some(no_session(channel)));
            return;
        };
        let Some(session) = self.sessions.get_mut(&local) else {
            return;
        };
        if session.is_ending() {
            return;
        }
        let env = SessionEnv {
            container: &*self.container,
            connection: &self.connection,
            settings: &self.settings,
        };
        let result = match performative {
            Performative::Attach(attach) => session.on_attach(attach, &env, &mut self.out),
            Performative::Flow(flow) => session.on_flow(flow, &mut self.out),
            Performative::Transfer(transfer) => {
                session.on_transfer(transfer, payload, &env, &mut self.out)
            }
            Performative::Disposition(disposition) => {
                session.on_disposition(disposition, &mut self.out);
                Ok(())
            }
            Performative::Detach(detach) => session.on_detach(detach, &mut self.out),
            _ => Ok(()),
        };
        match result {
            Ok(()) => {}
            Err(Fault::Session(error)) => self.end_session(local, Some(error)),
            Err(Fault::Connection(error)) => self.close_with(Some(error)),
        }
    }

    /// Ends a session from this side; its channel stays reserved until the peer's `end`.
    fn end_session(&mut self, local: u16, error: Option<Error>) {
        let Some(session) = self.sessions.get_mut(&local) else {
            return;
        };
        if session.is_ending() {
            return;
        }
        if let Some(error) = &error {
            warn!(channel = local, error = ?error, "ending session");
        }
        self.out.send(local, End { error: error.clone() });
        session.set_ending();
        session.close_links(error.as_ref());
    }

    fn on_command(&mut self, command: Command) {
        if self.state != ConnectionState::Opened {
            return;
        }
        match command {
            Command::Close { error } => self.close_with(error),
            Command::EndSession { channel, error } => self.end_session(channel, error),
            Command::SendMessage {
                channel,
                handle,
                link_id,
                payload,
                tag,
                settled,
            } => {
                if let Some(session) = active_session(&mut self.sessions, channel) {
                    session.send_message(handle, link_id, payload, tag, settled, &mut self.out);
                }
            }
            Command::Dispose {
                channel,
                delivery_id,
                state,
                settled,
            } => {
                if let Some(session) = active_session(&mut self.sessions, channel) {
                    session.dispose(delivery_id, state, settled, &mut self.out);
                }
            }
            Command::Flow {
                channel,
                handle,
                link_id,
                credit,
            } => {
                if let Some(session) = active_session(&mut self.sessions, channel) {
                    session.set_credit(handle, link_id, credit, &mut self.out);
                }
            }
            Command::CompleteAttach {
                channel,
                handle,
                link_id,
                error,
            } => {
                if let Some(session) = active_session(&mut self.sessions, channel) {
                    session.complete_attach(handle, link_id, error, &mut self.out);
                }
            }
            Command::Detach {
                channel,
                handle,
                link_id,
                error,
            } => {
                if let Some(session) = active_session(&mut self.sessions, channel) {
                    session.detach_link(handle, link_id, error, &mut self.out);
                }
            }
            Command::IoError(_) => {}
        }
    }

    fn on_tick(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Start | ConnectionState::HeaderExchanged => {
                if now.duration_since(self.started) > self.settings.handshake_timeout() {
                    debug!(peer = %self.connection.peer_addr(), "no open received in time");
                    self.state = ConnectionState::End;
                }
            }
            ConnectionState::CloseSent => {
                if self.close_deadline.is_some_and(|d| d <= now) {
                    debug!(peer = %self.connection.peer_addr(), "no close received in time");
                    self.state = ConnectionState::End;
                }
            }
            ConnectionState::Opened => {
                if let Some(idle) = self.settings.idle_timeout() {
                    if now.duration_since(self.last_received) > idle {
                        self.close_with(Some(Error::new(
                            condition::RESOURCE_LIMIT_EXCEEDED,
                            "local-idle-timeout expired",
                        )));
                        return;
                    }
                }
                if let Some(remote) = self.remote_idle_timeout {
                    if now.duration_since(self.out.last_write) >= remote / 2 {
                        self.out.write(Bytes::from_static(&HEARTBEAT));
                    }
                }
                for session in self.sessions.values_mut() {
                    if !session.is_ending() {
                        session.expire_attaches(now, &mut self.out);
                    }
                }
            }
            ConnectionState::End => {}
        }
    }

    fn close_sessions(&mut self) {
        let error = self.close_error.clone();
        for session in self.sessions.values_mut() {
            session.close_links(error.as_ref());
        }
    }

    fn teardown(&mut self, failure: Option<&AmqpError>) {
        let error = match failure {
            Some(e) if self.close_error.is_none() => {
                Some(Error::new(condition::CONNECTION_FORCED, e.to_string()))
            }
            _ => self.close_error.clone(),
        };
        for (_, mut session) in self.sessions.drain() {
            session.close_links(error.as_ref());
        }
        self.remote_channels.clear();
        self.state = ConnectionState::End;
    }
}

fn active_session(sessions: &mut HashMap<u16, SessionState>, channel: u16) -> Option<&mut SessionState> {
    sessions.get_mut(&channel).filter(|s| !s.is_ending())
}

fn no_session(channel: u16) -> Error {
    Error::new(condition::NOT_FOUND, format!("no session on channel {}", channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::link::ListenerLink;
    use crate::connection::tests::{recorded_frames, Recorder};
    use amqphost_types::{Attach, Detach, Frame, Role};

    struct RefuseAll;

    impl Container for RefuseAll {
        fn attach_link(
            &self,
            _connection: &ListenerConnection,
            _session: &ListenerSession,
            _link: &ListenerLink,
            _attach: &Attach,
        ) -> Result<bool> {
            Err(AmqpError::not_found("nothing here"))
        }
    }

    /// Accepts every link and keeps it.
    #[derive(Default)]
    struct KeepAll {
        links: parking_lot::Mutex<Vec<ListenerLink>>,
    }

    impl Container for KeepAll {
        fn attach_link(
            &self,
            _connection: &ListenerConnection,
            _session: &ListenerSession,
            link: &ListenerLink,
            _attach: &Attach,
        ) -> Result<bool> {
            self.links.lock().push(link.clone());
            Ok(true)
        }
    }

    fn actor() -> (ConnectionActor, Arc<Recorder>) {
        actor_with(Arc::new(RefuseAll))
    }

    fn actor_with(container: Arc<dyn Container>) -> (ConnectionActor, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let (connection, _rx) = ListenerConnection::new("peer".into(), "local".into(), 4);
        let context = ConnectionContext {
            settings: Arc::new(ConnectionSettings {
                container_id: Some("host".into()),
                ..Default::default()
            }),
            container,
            mechanisms: Arc::new(Vec::new()),
            metrics: Arc::new(HostMetrics::default()),
        };
        let writer = Writer::new(recorder.clone(), |_| {});
        let mut actor = ConnectionActor::new(connection, &context, writer);
        actor.state = ConnectionState::HeaderExchanged;
        (actor, recorder)
    }

    async fn sent_frames(actor: &ConnectionActor, recorder: &Recorder) -> Vec<Frame> {
        actor.out.flush().await;
        recorded_frames(recorder)
    }

    fn frame(channel: u16, performative: impl Into<Performative>) -> Bytes {
        encode_frame(channel, &performative.into(), &[])
    }

    fn performative(frame: &Frame) -> &Performative {
        match &frame.body {
            FrameBody::Amqp(p) => p,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    fn begin() -> Begin {
        Begin {
            remote_channel: None,
            next_outgoing_id: 0,
            incoming_window: 100,
            outgoing_window: 100,
            handle_max: 10,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }

    #[tokio::test]
    async fn test_open_negotiates_limits() {
        let (mut actor, recorder) = actor();
        let mut open = Open::new("client");
        open.max_frame_size = 4096;
        open.channel_max = 3;
        actor.on_frame(frame(0, open));
        assert_eq!(actor.state, ConnectionState::Opened);
        assert_eq!(actor.out.max_frame_size, 4096);
        assert_eq!(actor.channel_max, 3);
        assert_eq!(actor.connection.remote_container_id().as_deref(), Some("client"));

        let frames = sent_frames(&actor, &recorder).await;
        match performative(&frames[0]) {
            Performative::Open(open) => assert_eq!(open.container_id, "host"),
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_begin_before_open_closes_with_illegal_state() {
        let (mut actor, recorder) = actor();
        actor.on_frame(frame(0, begin()));
        assert_eq!(actor.state, ConnectionState::CloseSent);
        let frames = sent_frames(&actor, &recorder).await;
        assert!(matches!(performative(&frames[0]), Performative::Open(_)));
        match performative(&frames[1]) {
            Performative::Close(close) => {
                assert_eq!(close.error.as_ref().unwrap().condition, condition::ILLEGAL_STATE)
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_attach_sends_attach_then_detach() {
        let (mut actor, recorder) = actor();
        actor.on_frame(frame(0, Open::new("client")));
        actor.on_frame(frame(5, begin()));
        let mut attach = Attach::new("l1", 0, Role::Sender);
        attach.target = Some(amqphost_types::Target::with_address("missing"));
        actor.on_frame(frame(5, attach));

        let frames = sent_frames(&actor, &recorder).await;
        match performative(&frames[1]) {
            Performative::Begin(begin) => assert_eq!(begin.remote_channel, Some(5)),
            other => panic!("expected begin, got {:?}", other),
        }
        match performative(&frames[2]) {
            Performative::Attach(reply) => {
                assert_eq!(reply.role, Role::Receiver);
                assert!(reply.target.is_none());
            }
            other => panic!("expected attach, got {:?}", other),
        }
        match performative(&frames[3]) {
            Performative::Detach(Detach { closed, error, .. }) => {
                assert!(*closed);
                assert_eq!(error.as_ref().unwrap().condition, condition::NOT_FOUND);
            }
            other => panic!("expected detach, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_link_commands_reach_their_session() {
        let container = Arc::new(KeepAll::default());
        let (mut actor, recorder) = actor_with(container.clone());
        actor.on_frame(frame(0, Open::new("client")));
        actor.on_frame(frame(3, begin()));
        let mut attach = Attach::new("l1", 0, Role::Receiver);
        attach.source = Some(amqphost_types::Source::with_address("queue"));
        actor.on_frame(frame(3, attach));
        let link = container.links.lock()[0].clone();

        actor.on_command(Command::Detach {
            channel: 0,
            handle: 0,
            link_id: link.id(),
            error: None,
        });
        actor.on_command(Command::Detach {
            channel: 7,
            handle: 0,
            link_id: link.id(),
            error: None,
        });
        assert!(link.is_closed());

        let frames = sent_frames(&actor, &recorder).await;
        let detaches: Vec<_> = frames
            .iter()
            .filter(|f| matches!(performative(f), Performative::Detach(_)))
            .collect();
        assert_eq!(detaches.len(), 1);
        assert_eq!(detaches[0].channel, 0);
    }

    #[tokio::test]
    async fn test_commands_for_ending_session_are_ignored() {
        let container = Arc::new(KeepAll::default());
        let (mut actor, recorder) = actor_with(container.clone());
        actor.on_frame(frame(0, Open::new("client")));
        actor.on_frame(frame(3, begin()));
        actor.on_frame(frame(3, Attach::new("l1", 0, Role::Receiver)));
        let link = container.links.lock()[0].clone();

        actor.on_command(Command::EndSession {
            channel: 0,
            error: None,
        });
        actor.on_command(Command::Flow {
            channel: 0,
            handle: 0,
            link_id: link.id(),
            credit: 5,
        });

        let frames = sent_frames(&actor, &recorder).await;
        assert!(matches!(performative(frames.last().unwrap()), Performative::End(_)));
        assert!(!frames
            .iter()
            .any(|f| matches!(performative(f), Performative::Flow(_))));
    }

    #[tokio::test]
    async fn test_frame_on_unknown_channel_closes_with_not_found() {
        let (mut actor, recorder) = actor();
        actor.on_frame(frame(0, Open::new("client")));
        actor.on_frame(frame(9, Attach::new("l1", 0, Role::Sender)));
        let frames = sent_frames(&actor, &recorder).await;
        match performative(frames.last().unwrap()) {
            Performative::Close(close) => {
                assert_eq!(close.error.as_ref().unwrap().condition, condition::NOT_FOUND)
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_sent_at_half_remote_idle_timeout() {
        let (mut actor, recorder) = actor();
        let mut open = Open::new("client");
        open.idle_time_out = Some(1000);
        actor.on_frame(frame(0, open));
        actor.on_tick(Instant::now() + Duration::from_millis(600));
        let frames = sent_frames(&actor, &recorder).await;
        assert!(matches!(frames.last().unwrap().body, FrameBody::Empty));
    }

    #[tokio::test]
    async fn test_close_deadline_ends_connection() {
        let (mut actor, _recorder) = actor();
        actor.on_frame(frame(0, Open::new("client")));
        actor.close_with(None);
        assert_eq!(actor.state, ConnectionState::CloseSent);
        actor.on_tick(Instant::now() + Duration::from_secs(10));
        assert_eq!(actor.state, ConnectionState::End);
    }
}
