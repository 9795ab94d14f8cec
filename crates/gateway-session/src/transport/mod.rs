//! Transports a session runs over.

pub mod connector;

pub use connector::{BoxedTransport, ClientIdentity, Connector, TlsConnector, Transport};
