//! Events published by a session.
//!
//! Each category has its own channel: lifecycle changes, gateway
//! notifications and diagnostics.

use crate::error::{Error, ProtocolError};
use crate::protocol::message::Record;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Connection lifecycle changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A connection attempt started.
    Connecting {
        /// Whether the attempt was scheduled by the reconnect policy.
        is_reconnect: bool,
    },
    /// Login succeeded; requests can be issued.
    Connected {
        /// Whether the attempt was scheduled by the reconnect policy.
        is_reconnect: bool,
    },
    /// An open transport closed.
    Disconnected {
        /// Whether the close was caused by a transport failure.
        had_error: bool,
        /// Whether a reconnect attempt has been scheduled.
        will_reconnect: bool,
    },
    /// No transport opened within the connect timeout.
    ConnectionFailed,
}

/// Observations that do not fail any caller.
#[derive(Debug, Clone)]
pub enum Diagnostic {
    /// A confirmation arrived with no waiter.
    UnsolicitedConfirmation(Record),
    /// A frame was dropped.
    ProtocolError(ProtocolError),
    /// The transport failed.
    TransportError(Error),
}

/// Fans notification records out to subscribers.
#[derive(Debug)]
pub struct NotificationRouter {
    all: broadcast::Sender<Record>,
    by_opcode: RwLock<HashMap<u16, broadcast::Sender<Record>>>,
    capacity: usize,
}

impl NotificationRouter {
    /// Create a router whose subscribers buffer up to `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        Self {
            all,
            by_opcode: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Receive every notification.
    pub fn subscribe(&self) -> broadcast::Receiver<Record> {
        self.all.subscribe()
    }

    /// Receive notifications carrying one opcode.
    pub fn subscribe_opcode(&self, opcode: u16) -> broadcast::Receiver<Record> {
        self.by_opcode
            .write()
            .entry(opcode)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Deliver a notification to the generic and opcode-specific subscribers.
    pub fn route(&self, record: Record) {
        if let Some(opcode) = record.opcode {
            let delivered = self
                .by_opcode
                .read()
                .get(&opcode)
                .map(|tx| tx.send(record.clone()).is_ok());

            if delivered == Some(false) {
                let mut by_opcode = self.by_opcode.write();
                if by_opcode
                    .get(&opcode)
                    .is_some_and(|tx| tx.receiver_count() == 0)
                {
                    by_opcode.remove(&opcode);
                }
            }
        }

        if self.all.send(record).is_err() {
            trace!("Notification dropped, no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Fields;

    fn notification(opcode: u16) -> Record {
        Record {
            id: 0,
            opcode: Some(opcode),
            opcode_name: Some("GW_SESSION_FINISHED_NTF"),
            checksum_valid: true,
            fields: Fields::new(),
        }
    }

    #[test]
    fn test_route_to_all_and_opcode_subscribers() {
        let router = NotificationRouter::new(8);
        let mut all = router.subscribe();
        let mut finished = router.subscribe_opcode(0x0304);
        let mut other = router.subscribe_opcode(0x0211);

        router.route(notification(0x0304));

        assert_eq!(all.try_recv().unwrap().opcode, Some(0x0304));
        assert_eq!(finished.try_recv().unwrap().opcode, Some(0x0304));
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_abandoned_opcode_channel_is_pruned() {
        let router = NotificationRouter::new(8);
        drop(router.subscribe_opcode(0x0304));

        router.route(notification(0x0304));

        assert!(router.by_opcode.read().is_empty());
    }
}
