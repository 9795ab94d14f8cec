//! Outstanding requests awaiting their confirmation.

use std::collections::{HashMap, VecDeque};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::time::{DelayQueue, delay_queue};

struct Entry<W> {
    id: u64,
    waiter: W,
    timer: delay_queue::Key,
}

/// Waiters keyed by confirmation opcode, resolved first-in first-out.
///
/// Each entry owns its timeout; resolving an entry cancels it and an expired
/// entry is gone before its waiter is handed back.
pub struct PendingTable<W> {
    queues: HashMap<u16, VecDeque<Entry<W>>>,
    timers: DelayQueue<(u16, u64)>,
    timeout: Duration,
    next_id: u64,
}

impl<W> PendingTable<W> {
    /// Create an empty table whose entries expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            queues: HashMap::new(),
            timers: DelayQueue::new(),
            timeout,
            next_id: 0,
        }
    }

    /// Number of live entries.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Whether no entry is waiting.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Register a waiter for `confirmation` and start its timeout.
    pub fn register(&mut self, confirmation: u16, waiter: W) {
        let id = self.next_id;
        self.next_id += 1;

        let timer = self.timers.insert((confirmation, id), self.timeout);
        self.queues
            .entry(confirmation)
            .or_default()
            .push_back(Entry { id, waiter, timer });
    }

    /// Hand back the oldest waiter for `confirmation`, cancelling its timeout.
    ///
    /// `None` means the confirmation is unsolicited.
    pub fn resolve(&mut self, confirmation: u16) -> Option<W> {
        let queue = self.queues.get_mut(&confirmation)?;
        let entry = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(&confirmation);
        }

        self.timers.remove(&entry.timer);
        Some(entry.waiter)
    }

    /// Poll for the next entry whose timeout elapsed.
    ///
    /// Returns `Poll::Ready(None)` when nothing is pending.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<(u16, W)>> {
        loop {
            match self.timers.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    let (confirmation, id) = expired.into_inner();
                    if let Some(entry) = self.take(confirmation, id) {
                        return Poll::Ready(Some((confirmation, entry.waiter)));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    /// Withdraw every entry, oldest first per confirmation.
    pub fn drain(&mut self) -> Vec<W> {
        self.timers.clear();
        self.queues
            .drain()
            .flat_map(|(_, queue)| queue.into_iter().map(|entry| entry.waiter))
            .collect()
    }

    fn take(&mut self, confirmation: u16, id: u64) -> Option<Entry<W>> {
        let queue = self.queues.get_mut(&confirmation)?;
        let position = queue.iter().position(|entry| entry.id == id)?;
        let entry = queue.remove(position);
        if queue.is_empty() {
            self.queues.remove(&confirmation);
        }
        entry
    }
}
