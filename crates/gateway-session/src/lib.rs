//! Client session engine for home-automation gateways.
//!
//! This crate keeps one authenticated, long-lived session with a gateway that
//! speaks a binary command protocol over TLS. It frames and checks envelopes,
//! correlates confirmations with requests, routes notifications and recovers
//! from connection loss.
//!
//! # Features
//!
//! - **Single owner**: One task owns the transport and every timer
//! - **Login**: The password is sent as soon as the transport opens
//! - **Keepalive**: An idle connection is probed every five minutes
//! - **Reconnect**: Unexpected closes are retried after a fixed delay
//! - **Pluggable**: Opcode registry, framing and transport are traits
//!
//! # Example
//!
//! ```no_run
//! use proven_gateway_session::{Request, Session};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::builder("192.168.0.10", "velux123").build()?;
//!     session.connect().await?;
//!
//!     let version = session.request(Request::by_name("GW_GET_VERSION_REQ")).await?;
//!     println!("{:?}", version.field_str("software_version"));
//!
//!     let mut notifications = session.subscribe_opcode("GW_NODE_STATE_POSITION_CHANGED_NTF")?;
//!     while let Ok(record) = notifications.recv().await {
//!         println!("node {:?} moved", record.field_u64("node_id"));
//!     }
//!
//!     session.end().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use error::{CodecError, ConnectionError, Error, FrameError, ProtocolError, Result};
pub use protocol::{
    codec,
    message::{Fields, MessageRole, OpcodeRef, Record, Request},
    registry::{OpcodeRegistry, StandardRegistry},
};
pub use session::{
    Diagnostic, LifecycleEvent, Session, SessionBuilder, SessionConfig, SessionState,
};
pub use transport::{ClientIdentity, Connector, TlsConnector};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
