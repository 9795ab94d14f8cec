//! Gateway sessions.
//!
//! A [`Session`] is a cheap, cloneable handle to a task that owns the
//! transport. The task logs in after the transport opens, correlates
//! confirmations with requests, routes notifications, keeps the connection
//! alive and reconnects after unexpected closes.

mod actor;
pub mod config;
pub mod events;
mod pending;

pub use actor::SessionState;
pub use config::{DEFAULT_PORT, FrameCodecFactory, SessionBuilder, SessionConfig};
pub use events::{Diagnostic, LifecycleEvent, NotificationRouter};

use crate::error::{CodecError, Error, Result};
use crate::protocol::message::{Record, Request};
use crate::protocol::registry::OpcodeRegistry;
use actor::Command;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::instrument;

/// Handle to a gateway session.
///
/// Dropping the last handle shuts the session down and closes its transport.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    notifications: Arc<NotificationRouter>,
    diagnostics: broadcast::Sender<Diagnostic>,
    registry: Arc<dyn OpcodeRegistry>,
}

impl Session {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        state: watch::Receiver<SessionState>,
        lifecycle: broadcast::Sender<LifecycleEvent>,
        notifications: Arc<NotificationRouter>,
        diagnostics: broadcast::Sender<Diagnostic>,
        registry: Arc<dyn OpcodeRegistry>,
    ) -> Self {
        Self {
            commands,
            state,
            lifecycle,
            notifications,
            diagnostics,
            registry,
        }
    }

    /// Create a session builder.
    #[must_use]
    pub fn builder(host: impl Into<String>, password: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(host, password)
    }

    /// Open the transport and log in.
    ///
    /// Calls made while a connection is in progress join it instead of opening
    /// a second transport. Calling this while connected succeeds immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be opened within the connect
    /// timeout, or the gateway refuses the login.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Connect(tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Send a request and wait for its confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be encoded, the session is not
    /// connected, or no confirmation arrives within the request timeout.
    #[instrument(skip(self, request), fields(opcode = ?request.opcode))]
    pub async fn request(&self, request: Request) -> Result<Record> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Request(request, tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Close the transport gracefully. No reconnect follows.
    ///
    /// # Errors
    ///
    /// Returns an error if the session task is gone.
    #[instrument(skip(self))]
    pub async fn end(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::End(tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Drop the transport immediately. No reconnect follows.
    ///
    /// # Errors
    ///
    /// Returns an error if the session task is gone.
    #[instrument(skip(self))]
    pub async fn destroy(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Destroy(tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session task is gone.
    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| Error::ChannelClosed)
    }

    /// Subscribe to connection lifecycle changes.
    #[must_use]
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Subscribe to every notification.
    #[must_use]
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Record> {
        self.notifications.subscribe()
    }

    /// Every notification as a stream.
    #[must_use]
    pub fn notification_stream(&self) -> BroadcastStream<Record> {
        BroadcastStream::new(self.notifications.subscribe())
    }

    /// Subscribe to notifications with one opcode name.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry does not know the name.
    pub fn subscribe_opcode(&self, name: &str) -> Result<broadcast::Receiver<Record>> {
        let opcode = self
            .registry
            .opcode_for_name(name)
            .ok_or_else(|| CodecError::UnknownName(name.to_string()))?;
        Ok(self.notifications.subscribe_opcode(opcode))
    }

    /// Subscribe to notifications with one numeric opcode.
    #[must_use]
    pub fn subscribe_opcode_id(&self, opcode: u16) -> broadcast::Receiver<Record> {
        self.notifications.subscribe_opcode(opcode)
    }

    /// Subscribe to unsolicited confirmations, dropped frames and transport
    /// errors.
    #[must_use]
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
