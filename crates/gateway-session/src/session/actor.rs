//! The task that owns a session's transport.
//!
//! Every input (commands from handles, inbound frames, transport failures and
//! all timers) is handled by one `select!` loop, so state transitions never
//! interleave.

use crate::error::{CodecError, ConnectionError, Error, FrameError, ProtocolError, Result};
use crate::protocol::codec;
use crate::protocol::framing::{EnvelopeFraming, FrameCodec};
use crate::protocol::message::{MessageRole, Record, Request, confirmation_name};
use crate::protocol::registry::{KEEPALIVE_REQUEST, LOGIN_ACCEPTED, LOGIN_REQUEST, OpcodeRegistry};
use crate::session::Session;
use crate::session::config::{FrameCodecFactory, SessionConfig};
use crate::session::events::{Diagnostic, LifecycleEvent, NotificationRouter};
use crate::session::pending::PendingTable;
use crate::transport::{BoxedTransport, Connector};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::future::{pending, poll_fn};
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep, sleep, timeout};
use tokio_util::codec::{Encoder, Framed};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 32;

type Framing = Framed<BoxedTransport, EnvelopeFraming<Box<dyn FrameCodec>>>;
type FrameItem = io::Result<std::result::Result<Bytes, FrameError>>;
type Opening = BoxFuture<'static, Result<BoxedTransport>>;
type Deadline = Option<Pin<Box<Sleep>>>;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport.
    Idle,
    /// Opening the transport or logging in.
    Connecting,
    /// Logged in.
    Connected,
    /// Closing the transport gracefully.
    Disconnecting,
}

pub(crate) enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Request(Request, oneshot::Sender<Result<Record>>),
    End(oneshot::Sender<()>),
    Destroy(oneshot::Sender<()>),
}

enum TransportIo {
    Frame(Option<FrameItem>),
    Flushed(io::Result<()>),
}

/// Who is waiting on a confirmation.
enum Waiter {
    Caller(oneshot::Sender<Result<Record>>),
    Login { generation: u64 },
    KeepAlive { generation: u64 },
}

pub(crate) struct SessionActor {
    config: SessionConfig,
    registry: Arc<dyn OpcodeRegistry>,
    connector: Arc<dyn Connector>,
    frame_codec: FrameCodecFactory,

    commands: mpsc::Receiver<Command>,
    state: watch::Sender<SessionState>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    notifications: Arc<NotificationRouter>,
    diagnostics: broadcast::Sender<Diagnostic>,

    transport: Option<Framing>,
    opening: Option<Opening>,
    pending: PendingTable<Waiter>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    deferred: Vec<(Request, oneshot::Sender<Result<Record>>)>,

    /// Bumped whenever a transport is opened or closed; internal waiters from
    /// an older generation are ignored.
    generation: u64,
    is_reconnect: bool,
    login_failed: bool,
    should_stay_connected: bool,

    connect_deadline: Deadline,
    reconnect_deadline: Deadline,
    keepalive_deadline: Deadline,
    /// Armed while written frames wait to be flushed.
    write_deadline: Deadline,
}

impl SessionActor {
    pub(crate) fn spawn(
        config: SessionConfig,
        registry: Arc<dyn OpcodeRegistry>,
        connector: Arc<dyn Connector>,
        frame_codec: FrameCodecFactory,
    ) -> Session {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (state, state_rx) = watch::channel(SessionState::Idle);
        let (lifecycle, _) = broadcast::channel(config.event_capacity);
        let (diagnostics, _) = broadcast::channel(config.event_capacity);
        let notifications = Arc::new(NotificationRouter::new(config.event_capacity));

        let session = Session::new(
            commands_tx,
            state_rx,
            lifecycle.clone(),
            Arc::clone(&notifications),
            diagnostics.clone(),
            Arc::clone(&registry),
        );

        let actor = Self {
            pending: PendingTable::new(config.request_timeout),
            config,
            registry,
            connector,
            frame_codec,
            commands,
            state,
            lifecycle,
            notifications,
            diagnostics,
            transport: None,
            opening: None,
            connect_waiters: Vec::new(),
            deferred: Vec::new(),
            generation: 0,
            is_reconnect: false,
            login_failed: false,
            should_stay_connected: false,
            connect_deadline: None,
            reconnect_deadline: None,
            keepalive_deadline: None,
            write_deadline: None,
        };
        tokio::spawn(actor.run());

        session
    }

    async fn run(mut self) {
        loop {
            let flushing = self.write_deadline.is_some();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                result = opened(&mut self.opening) => {
                    self.opening = None;
                    self.on_transport_opened(result);
                }
                io = transport_io(&mut self.transport, flushing) => match io {
                    TransportIo::Frame(frame) => self.on_frame(frame),
                    TransportIo::Flushed(result) => self.on_flushed(result),
                },
                (confirmation, waiter) = expired(&mut self.pending) => {
                    self.on_request_timeout(confirmation, waiter);
                }
                () = elapsed(&mut self.connect_deadline) => {
                    self.connect_deadline = None;
                    self.on_connect_timeout();
                }
                () = elapsed(&mut self.reconnect_deadline) => {
                    self.reconnect_deadline = None;
                    self.on_reconnect();
                }
                () = elapsed(&mut self.keepalive_deadline) => {
                    self.keepalive_deadline = None;
                    self.on_keepalive();
                }
                () = elapsed(&mut self.write_deadline) => {
                    self.write_deadline = None;
                    self.on_write_stalled();
                }
            }
        }

        debug!("All session handles dropped, shutting down");
        self.should_stay_connected = false;
        self.reject_waiters(&Error::ChannelClosed);
        self.on_transport_closed(false);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                // An explicit connect overrides an earlier login refusal.
                self.login_failed = false;
                self.should_stay_connected = true;
                self.reconnect_deadline = None;

                match self.current_state() {
                    SessionState::Connected => {
                        let _ = reply.send(Ok(()));
                    }
                    SessionState::Connecting => self.connect_waiters.push(reply),
                    SessionState::Idle | SessionState::Disconnecting => {
                        self.connect_waiters.push(reply);
                        self.start_connect(false);
                    }
                }
            }
            Command::Request(request, reply) => match self.current_state() {
                SessionState::Connected => self.send_request(request, Waiter::Caller(reply)),
                SessionState::Connecting => self.deferred.push((request, reply)),
                SessionState::Idle | SessionState::Disconnecting => {
                    if self.config.auto_connect {
                        debug!("Connecting on demand");
                        self.deferred.push((request, reply));
                        self.should_stay_connected = true;
                        self.reconnect_deadline = None;
                        self.start_connect(false);
                    } else {
                        let _ = reply.send(Err(Error::NotConnected));
                    }
                }
            },
            Command::End(reply) => {
                self.end().await;
                let _ = reply.send(());
            }
            Command::Destroy(reply) => {
                info!("Destroying session");
                self.suppress_reconnect();
                self.reject_waiters(&ConnectionError::ShuttingDown.into());
                self.on_transport_closed(false);
                let _ = reply.send(());
            }
        }
    }

    fn start_connect(&mut self, is_reconnect: bool) {
        self.transport = None;
        self.generation += 1;
        self.is_reconnect = is_reconnect;
        self.set_state(SessionState::Connecting);
        self.emit(LifecycleEvent::Connecting { is_reconnect });
        info!(is_reconnect, "Connecting to gateway");

        let connector = Arc::clone(&self.connector);
        self.opening = Some(Box::pin(async move { connector.connect().await }));
        self.connect_deadline = Some(Box::pin(sleep(self.config.connect_timeout)));
    }

    fn on_transport_opened(&mut self, opened: Result<BoxedTransport>) {
        self.connect_deadline = None;

        match opened {
            Ok(stream) => {
                debug!("Transport open, logging in");
                let framing = EnvelopeFraming::new((self.frame_codec)());
                self.transport = Some(Framed::new(stream, framing));

                let login = Request::by_name(LOGIN_REQUEST)
                    .with_field("password", self.config.password.clone());
                let generation = self.generation;
                self.send_request(login, Waiter::Login { generation });
            }
            Err(e) => {
                warn!("Failed to open transport: {}", e);
                let _ = self.diagnostics.send(Diagnostic::TransportError(e.clone()));
                self.reject_waiters(&e);
                self.on_transport_closed(true);
            }
        }
    }

    fn on_connect_timeout(&mut self) {
        warn!(
            "No transport after {:?}, giving up on this attempt",
            self.config.connect_timeout
        );
        self.opening = None;
        self.emit(LifecycleEvent::ConnectionFailed);
        self.reject_waiters(&Error::Timeout(self.config.connect_timeout));
        self.on_transport_closed(true);
    }

    fn on_reconnect(&mut self) {
        if self.should_stay_connected && self.current_state() == SessionState::Idle {
            self.start_connect(true);
        }
    }

    fn on_keepalive(&mut self) {
        if self.current_state() != SessionState::Connected {
            return;
        }

        debug!("Connection idle, sending keepalive");
        self.arm_keepalive();
        let generation = self.generation;
        self.send_request(
            Request::by_name(KEEPALIVE_REQUEST),
            Waiter::KeepAlive { generation },
        );
    }

    async fn end(&mut self) {
        info!("Ending session");
        self.suppress_reconnect();
        self.reject_waiters(&ConnectionError::ShuttingDown.into());

        if self.transport.is_some() {
            self.set_state(SessionState::Disconnecting);
        }
        if let Some(transport) = self.transport.as_mut() {
            match timeout(self.config.request_timeout, SinkExt::<Bytes>::close(transport)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Error while closing transport: {}", e),
                Err(_) => debug!("Transport did not close in time"),
            }
        }

        self.on_transport_closed(false);
    }

    /// Single close path for every way a transport or attempt can end.
    fn on_transport_closed(&mut self, had_error: bool) {
        let was_open = self.transport.take().is_some();
        self.opening = None;
        self.connect_deadline = None;
        self.keepalive_deadline = None;
        self.write_deadline = None;
        self.generation += 1;

        for waiter in self.pending.drain() {
            self.fail_waiter(waiter, ConnectionError::Closed.into());
        }
        self.reject_waiters(&ConnectionError::Closed.into());

        let will_reconnect =
            self.should_stay_connected && !self.login_failed && self.config.auto_reconnect;
        self.set_state(SessionState::Idle);

        if was_open {
            info!(had_error, will_reconnect, "Disconnected from gateway");
            self.emit(LifecycleEvent::Disconnected {
                had_error,
                will_reconnect,
            });
        }

        if will_reconnect {
            debug!("Reconnecting in {:?}", self.config.reconnect_delay);
            self.reconnect_deadline = Some(Box::pin(sleep(self.config.reconnect_delay)));
        }
    }

    fn on_frame(&mut self, frame: Option<FrameItem>) {
        match frame {
            None => {
                debug!("Gateway closed the transport");
                self.on_transport_closed(false);
            }
            Some(Err(e)) => {
                warn!("Transport error: {}", e);
                let _ = self.diagnostics.send(Diagnostic::TransportError(e.into()));
                self.on_transport_closed(true);
            }
            Some(Ok(Err(e))) => {
                self.arm_keepalive();
                warn!("Dropping malformed frame: {}", e);
                let _ = self
                    .diagnostics
                    .send(Diagnostic::ProtocolError(ProtocolError::Frame(e)));
            }
            Some(Ok(Ok(envelope))) => {
                self.arm_keepalive();
                self.on_envelope(&envelope);
            }
        }
    }

    fn on_envelope(&mut self, envelope: &[u8]) {
        if let Err(e) = codec::verify(envelope) {
            warn!("Dropping envelope: {}", e);
            let _ = self.diagnostics.send(Diagnostic::ProtocolError(e));
            return;
        }

        let record = codec::decode(&*self.registry, envelope);
        if record.role() == Some(MessageRole::Notification) {
            debug!(opcode = record.opcode_name, "Notification");
            self.notifications.route(record);
            return;
        }

        match record.opcode.and_then(|opcode| self.pending.resolve(opcode)) {
            Some(waiter) => self.on_confirmation(waiter, record),
            None => {
                warn!(
                    opcode = ?record.opcode,
                    name = record.opcode_name,
                    "Unsolicited confirmation"
                );
                let _ = self
                    .diagnostics
                    .send(Diagnostic::UnsolicitedConfirmation(record));
            }
        }
    }

    fn on_confirmation(&mut self, waiter: Waiter, record: Record) {
        match waiter {
            Waiter::Caller(reply) => {
                let _ = reply.send(Ok(record));
            }
            Waiter::Login { generation } if generation == self.generation => {
                if record.field_u64("status") == Some(LOGIN_ACCEPTED) {
                    self.on_login_succeeded();
                } else {
                    self.on_login_failed(Error::LoginRefused);
                }
            }
            Waiter::KeepAlive { generation } if generation == self.generation => {
                debug!("Keepalive confirmed");
            }
            Waiter::Login { .. } | Waiter::KeepAlive { .. } => {}
        }
    }

    fn on_request_timeout(&mut self, confirmation: u16, waiter: Waiter) {
        debug!(confirmation, "Request timed out");
        self.fail_waiter(waiter, Error::Timeout(self.config.request_timeout));
    }

    fn on_login_succeeded(&mut self) {
        info!(is_reconnect = self.is_reconnect, "Connected to gateway");
        self.login_failed = false;
        self.set_state(SessionState::Connected);
        self.arm_keepalive();
        self.emit(LifecycleEvent::Connected {
            is_reconnect: self.is_reconnect,
        });

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        for (request, reply) in mem::take(&mut self.deferred) {
            self.send_request(request, Waiter::Caller(reply));
        }
    }

    fn on_login_failed(&mut self, error: Error) {
        warn!("Login failed: {}", error);
        self.login_failed = true;
        self.reject_waiters(&error);
        self.on_transport_closed(false);
    }

    fn fail_waiter(&mut self, waiter: Waiter, error: Error) {
        match waiter {
            Waiter::Caller(reply) => {
                let _ = reply.send(Err(error));
            }
            Waiter::Login { generation } if generation == self.generation => {
                self.on_login_failed(error);
            }
            Waiter::KeepAlive { generation } if generation == self.generation => {
                warn!("Keepalive failed: {}", error);
                let _ = self.diagnostics.send(Diagnostic::TransportError(error));
                self.on_transport_closed(true);
            }
            Waiter::Login { .. } | Waiter::KeepAlive { .. } => {}
        }
    }

    /// Frame the request into the transport's write buffer and register its
    /// waiter. The buffer is flushed by the run loop, so a gateway that stops
    /// reading never blocks commands or timers.
    fn send_request(&mut self, request: Request, waiter: Waiter) {
        let (confirmation, envelope) = match self.prepare(&request) {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!("Rejecting request {:?}: {}", request.opcode, e);
                self.fail_waiter(waiter, e);
                return;
            }
        };

        let Some(transport) = self.transport.as_mut() else {
            self.fail_waiter(waiter, Error::NotConnected);
            return;
        };

        let mut frame = BytesMut::new();
        if let Err(e) = transport.codec_mut().encode(envelope, &mut frame) {
            // Framing rejected this envelope only; the transport is intact.
            debug!("Rejecting request {:?}: {}", request.opcode, e);
            self.fail_waiter(waiter, e.into());
            return;
        }
        transport.write_buffer_mut().extend_from_slice(&frame);

        debug!(opcode = ?request.opcode, confirmation, "Sending request");
        self.pending.register(confirmation, waiter);
        if self.write_deadline.is_none() {
            self.write_deadline = Some(Box::pin(sleep(self.config.request_timeout)));
        }
    }

    fn on_flushed(&mut self, result: io::Result<()>) {
        match result {
            Ok(()) => self.write_deadline = None,
            Err(e) => {
                warn!("Failed to write to transport: {}", e);
                let _ = self.diagnostics.send(Diagnostic::TransportError(e.into()));
                self.on_transport_closed(true);
            }
        }
    }

    fn on_write_stalled(&mut self) {
        warn!(
            "Gateway has not drained writes for {:?}, dropping transport",
            self.config.request_timeout
        );
        let _ = self.diagnostics.send(Diagnostic::TransportError(Error::Timeout(
            self.config.request_timeout,
        )));
        self.on_transport_closed(true);
    }

    /// Resolve the confirmation opcode and encode the envelope.
    fn prepare(&self, request: &Request) -> Result<(u16, Bytes)> {
        let (_, name) = codec::resolve(&*self.registry, &request.opcode)?;
        if MessageRole::of(name) != Some(MessageRole::Request) {
            return Err(CodecError::NotARequest(name).into());
        }

        let confirmation = confirmation_name(name)
            .and_then(|cfm| self.registry.opcode_for_name(&cfm))
            .ok_or_else(|| CodecError::UnknownName(format!("confirmation of {name}")))?;
        let envelope = codec::encode(&*self.registry, request)?;
        Ok((confirmation, envelope))
    }

    fn reject_waiters(&mut self, error: &Error) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for (_, reply) in self.deferred.drain(..) {
            let _ = reply.send(Err(error.clone()));
        }
    }

    fn suppress_reconnect(&mut self) {
        self.should_stay_connected = false;
        self.connect_deadline = None;
        self.reconnect_deadline = None;
    }

    fn arm_keepalive(&mut self) {
        if self.current_state() != SessionState::Connected {
            return;
        }
        let deadline = Instant::now() + self.config.keepalive_interval;
        match self.keepalive_deadline.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.keepalive_deadline = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session state {:?} -> {:?}", previous, state);
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.lifecycle.send(event);
    }
}

async fn opened(opening: &mut Option<Opening>) -> Result<BoxedTransport> {
    match opening {
        Some(future) => future.await,
        None => pending().await,
    }
}

/// Flushes buffered writes while `flushing`, and reads the next frame.
async fn transport_io(transport: &mut Option<Framing>, flushing: bool) -> TransportIo {
    let Some(transport) = transport else {
        return pending().await;
    };
    poll_fn(|cx| {
        let flushed = if flushing {
            SinkExt::<Bytes>::poll_flush_unpin(transport, cx)
        } else {
            Poll::Pending
        };
        if let Poll::Ready(result) = flushed {
            return Poll::Ready(TransportIo::Flushed(result));
        }
        transport.poll_next_unpin(cx).map(TransportIo::Frame)
    })
    .await
}

async fn elapsed(deadline: &mut Deadline) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn expired(table: &mut PendingTable<Waiter>) -> (u16, Waiter) {
    poll_fn(|cx| match table.poll_expired(cx) {
        Poll::Ready(Some(expired)) => Poll::Ready(expired),
        Poll::Ready(None) | Poll::Pending => Poll::Pending,
    })
    .await
}
