//! Shared helpers for session tests: an in-memory connector and a scripted
//! gateway on the other end of it.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use proven_gateway_session::protocol::framing::{EnvelopeFraming, SlipCodec};
use proven_gateway_session::transport::BoxedTransport;
use proven_gateway_session::{
    Connector, Error, LifecycleEvent, Session, SessionBuilder, codec,
};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing_subscriber::EnvFilter;

pub const PASSWORD: &str = "secret";

/// How the mock connector answers the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Accept,
    Hang,
    Refuse,
}

#[derive(Clone)]
pub struct MockConnector {
    attempts: Arc<AtomicUsize>,
    mode: Arc<Mutex<Mode>>,
    gateways: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> proven_gateway_session::Result<BoxedTransport> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        match mode {
            Mode::Accept => {
                let (client, server) = duplex(4096);
                let _ = self.gateways.send(server);
                Ok(Box::new(client))
            }
            Mode::Hang => std::future::pending().await,
            Mode::Refuse => Err(Error::from(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            ))),
        }
    }
}

pub struct Harness {
    pub session: Session,
    attempts: Arc<AtomicUsize>,
    mode: Arc<Mutex<Mode>>,
    gateways: mpsc::UnboundedReceiver<DuplexStream>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    pub fn with(configure: impl FnOnce(SessionBuilder) -> SessionBuilder) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let (tx, gateways) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let mode = Arc::new(Mutex::new(Mode::Accept));
        let connector = MockConnector {
            attempts: Arc::clone(&attempts),
            mode: Arc::clone(&mode),
            gateways: tx,
        };

        let builder = Session::builder("gateway.local", PASSWORD).connector(connector);
        let session = configure(builder).build().unwrap();

        Self {
            session,
            attempts,
            mode,
            gateways,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    /// Wait for the session to open a transport.
    pub async fn accept(&mut self) -> Gateway {
        let stream = self.gateways.recv().await.unwrap();
        Gateway {
            framed: Framed::new(stream, EnvelopeFraming::new(SlipCodec::new())),
        }
    }

    /// Connect and log in, returning the gateway end.
    pub async fn connect(&mut self) -> Gateway {
        let session = self.session.clone();
        let connecting = tokio::spawn(async move { session.connect().await });

        let mut gateway = self.accept().await;
        gateway.accept_login().await;
        connecting.await.unwrap().unwrap();
        gateway
    }
}

/// Scripted gateway end of a transport.
pub struct Gateway {
    framed: Framed<DuplexStream, EnvelopeFraming<SlipCodec>>,
}

impl Gateway {
    /// Next envelope from the session, split into opcode and payload.
    pub async fn next_request(&mut self) -> (u16, Bytes) {
        let envelope = self
            .next_envelope()
            .await
            .expect("session closed the transport");
        codec::verify(&envelope).unwrap();

        let opcode = u16::from_be_bytes([envelope[2], envelope[3]]);
        (opcode, envelope.slice(4..envelope.len() - 1))
    }

    /// Next envelope, or `None` once the session closed the transport.
    pub async fn next_envelope(&mut self) -> Option<Bytes> {
        match self.framed.next().await {
            Some(Ok(frame)) => Some(frame.unwrap()),
            Some(Err(_)) | None => None,
        }
    }

    pub async fn reply(&mut self, opcode: u16, payload: &[u8]) {
        let envelope = codec::encode_envelope(opcode, payload).unwrap();
        self.send_envelope(envelope).await;
    }

    pub async fn send_envelope(&mut self, envelope: Bytes) {
        self.framed.send(envelope).await.unwrap();
    }

    /// Write bytes to the stream without framing them.
    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.framed.get_mut().write_all(bytes).await.unwrap();
    }

    pub async fn accept_login(&mut self) {
        self.answer_login(1).await;
    }

    pub async fn refuse_login(&mut self) {
        self.answer_login(0).await;
    }

    async fn answer_login(&mut self, status: u8) {
        let (opcode, payload) = self.next_request().await;
        assert_eq!(opcode, 0x3000);
        assert_eq!(&payload[..PASSWORD.len()], PASSWORD.as_bytes());
        self.reply(0x3001, &[status]).await;
    }
}

pub async fn next_event(events: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    events.recv().await.unwrap()
}
