//! Pending outbound work queue
//!
//! A bounded FIFO of (packet, token) pairs between operation submission and
//! the transport. The engine drains it cooperatively, gated by the pause
//! flag (asserted on connection end, released after retry replay) and by the
//! server's receive-maximum window for QoS>0 publishes.

use std::collections::VecDeque;

use crate::error::ClientError;
use crate::protocol::Packet;
use crate::token::TokenHandle;

/// What to do with a new entry when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Fail the new entry with `BufferFull`
    #[default]
    Reject,
    /// Evict the oldest entry, failing its token with `BufferDiscarded`
    DropOldest,
}

/// One unit of pending outbound work
pub struct QueueEntry {
    pub packet: Packet,
    pub token: Option<TokenHandle>,
}

/// Bounded FIFO of pending outbound packets
pub struct ToDoQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
    policy: OverflowPolicy,
    paused: bool,
}

impl ToDoQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            policy,
            paused: false,
        }
    }

    /// Append an entry, applying the overflow policy when full.
    /// Returns false when the entry was rejected (its token has been failed).
    pub fn add(&mut self, packet: Packet, token: Option<TokenHandle>) -> bool {
        if self.entries.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Reject => {
                    if let Some(token) = token {
                        token.fail(ClientError::BufferFull);
                    }
                    return false;
                }
                OverflowPolicy::DropOldest => {
                    if let Some(evicted) = self.entries.pop_front() {
                        if let Some(token) = evicted.token {
                            token.fail(ClientError::BufferDiscarded);
                        }
                    }
                }
            }
        }

        self.entries.push_back(QueueEntry { packet, token });
        true
    }

    /// Suppress draining (connection ended, replay in progress).
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Allow draining again.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// The entry that would be drained next.
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Remove and return the head entry.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Inspect a buffered entry by position.
    pub fn get(&self, index: usize) -> Option<&QueueEntry> {
        self.entries.get(index)
    }

    /// Remove a buffered entry by position.
    pub fn remove(&mut self, index: usize) -> Option<QueueEntry> {
        self.entries.remove(index)
    }

    /// Mutable walk over buffered entries, head first.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut QueueEntry> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Drain everything, failing each token. Used on close.
    pub fn shutdown(&mut self) {
        for entry in self.entries.drain(..) {
            if let Some(token) = entry.token {
                token.fail(ClientError::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Publish;

    fn publish_packet(topic: &str) -> Packet {
        Packet::Publish(Publish {
            topic: topic.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_reject_policy_fails_new_entry() {
        let mut queue = ToDoQueue::new(1, OverflowPolicy::Reject);

        assert!(queue.add(publish_packet("a"), None));

        let (token, rx) = TokenHandle::pair();
        assert!(!queue.add(publish_packet("b"), Some(token)));
        assert!(matches!(rx.wait().await, Err(ClientError::BufferFull)));

        // Head is untouched
        assert_eq!(queue.len(), 1);
        match &queue.peek().unwrap().packet {
            Packet::Publish(p) => assert_eq!(&*p.topic, "a"),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_policy_evicts_head() {
        let mut queue = ToDoQueue::new(1, OverflowPolicy::DropOldest);

        let (token, rx) = TokenHandle::pair();
        assert!(queue.add(publish_packet("old"), Some(token)));
        assert!(queue.add(publish_packet("new"), None));

        assert!(matches!(rx.wait().await, Err(ClientError::BufferDiscarded)));
        assert_eq!(queue.len(), 1);
        match &queue.peek().unwrap().packet {
            Packet::Publish(p) => assert_eq!(&*p.topic, "new"),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_pause_and_positional_access() {
        let mut queue = ToDoQueue::new(8, OverflowPolicy::Reject);
        queue.add(publish_packet("a"), None);
        queue.add(publish_packet("b"), None);

        queue.pause();
        assert!(queue.is_paused());
        queue.resume();
        assert!(!queue.is_paused());

        assert!(queue.get(1).is_some());
        let removed = queue.remove(0).unwrap();
        match removed.packet {
            Packet::Publish(p) => assert_eq!(&*p.topic, "a"),
            other => panic!("unexpected packet: {:?}", other),
        }
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_tokens() {
        let mut queue = ToDoQueue::new(8, OverflowPolicy::Reject);
        let (token, rx) = TokenHandle::pair();
        queue.add(publish_packet("a"), Some(token));

        queue.shutdown();
        assert!(queue.is_empty());
        assert!(matches!(rx.wait().await, Err(ClientError::Closed)));
    }
}
