//! Durable per-session state
//!
//! Survives reconnects when the session was established with
//! `clean_start = false` and a non-zero session expiry, and survives process
//! restarts through the [`StateStore`]: in-flight outbound messages and
//! inbound QoS 2 packet ids are mirrored to the store as they change.
//!
//! Allocation invariant: a packet id lives in at most one of `out_tokens`,
//! `retry_queue` or the free pool. Every `retry_queue` entry has a matching
//! `out_tokens` entry except after restart, when persisted messages are
//! restored without tokens (their acks free the id but complete no one).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use tracing::debug;

use crate::error::ClientError;
use crate::persistence::{inbound_key, outbound_key, StateStore};
use crate::protocol::{PubRel, Publish};
use crate::token::TokenHandle;
use crate::topic::topic_matches_filter;

/// Callback receiving inbound publishes matched to a subscription
pub type MessageListener = Arc<dyn Fn(Publish) + Send + Sync>;

/// An in-flight outbound message awaiting the next handshake step
#[derive(Debug, Clone)]
pub enum RetryEntry {
    /// PUBLISH awaiting PUBACK (QoS 1) or PUBREC (QoS 2)
    Publish(Publish),
    /// PUBREL awaiting PUBCOMP
    Release(PubRel),
}

/// A registered message listener
struct ListenerEntry {
    subscription_id: Option<u32>,
    filter: String,
    listener: MessageListener,
}

/// Durable per-session data
pub struct SessionState {
    /// Outbound operations awaiting their terminal acknowledgement
    out_tokens: AHashMap<u16, TokenHandle>,
    /// In-flight outbound messages in packet-id order, mirrored durably
    retry_queue: BTreeMap<u16, RetryEntry>,
    /// Inbound QoS 2 ids for which PUBREC was sent but PUBREL not yet
    /// processed, mirrored durably
    inbound_qos2: BTreeSet<u16>,
    /// Message listeners in registration order
    listeners: Vec<ListenerEntry>,
    /// Packet id allocation cursor
    next_packet_id: u16,
    /// User intent: drives automatic reconnection
    pub should_be_connected: bool,
    /// Client identifier; the broker may reassign it via CONNACK
    pub client_id: String,
}

impl SessionState {
    pub fn new(client_id: String) -> Self {
        Self {
            out_tokens: AHashMap::new(),
            retry_queue: BTreeMap::new(),
            inbound_qos2: BTreeSet::new(),
            listeners: Vec::new(),
            next_packet_id: 1,
            should_be_connected: false,
            client_id,
        }
    }

    /// Allocate the next free packet identifier.
    ///
    /// Scans from the cursor with wrap at 65535 -> 1, skipping ids currently
    /// held by `out_tokens` or `retry_queue`. Fails after a full rotation.
    pub fn next_packet_id(&mut self) -> Result<u16, ClientError> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = if id == u16::MAX { 1 } else { id + 1 };

            if !self.out_tokens.contains_key(&id) && !self.retry_queue.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ClientError::NoPacketIdsAvailable)
    }

    /// Register a token for an outbound operation. The id must be free.
    pub fn register_outbound(&mut self, packet_id: u16, token: TokenHandle) {
        debug_assert!(!self.out_tokens.contains_key(&packet_id));
        self.out_tokens.insert(packet_id, token);
    }

    /// Number of operations awaiting a terminal acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.out_tokens.len()
    }

    /// Free a packet id on its terminal acknowledgement.
    ///
    /// Removes the retry entry and its durable blob unconditionally; a
    /// broker-rejected PUBACK/PUBCOMP still counts as delivered. Returns the
    /// token, absent after tokenless post-restart recovery.
    pub async fn complete_outbound(
        &mut self,
        store: &dyn StateStore,
        packet_id: u16,
    ) -> Result<Option<TokenHandle>, ClientError> {
        let token = self.out_tokens.remove(&packet_id);
        if self.retry_queue.remove(&packet_id).is_some() {
            store.remove(&outbound_key(packet_id)).await?;
        }
        Ok(token)
    }

    /// Look up the token for an in-flight id without freeing it.
    pub fn outbound_token(&mut self, packet_id: u16) -> Option<&mut TokenHandle> {
        self.out_tokens.get_mut(&packet_id)
    }

    /// Withdraw a token whose message never reached the wire (queue
    /// eviction). Touches no durable state.
    pub fn remove_outbound(&mut self, packet_id: u16) -> Option<TokenHandle> {
        self.out_tokens.remove(&packet_id)
    }

    /// Record an in-flight outbound message, durably, keyed by packet id.
    /// `wire` carries the encoded packet exactly as it goes on the wire.
    pub async fn add_retry(
        &mut self,
        store: &dyn StateStore,
        packet_id: u16,
        entry: RetryEntry,
        wire: Bytes,
    ) -> Result<(), ClientError> {
        store.put(&outbound_key(packet_id), wire).await?;
        self.retry_queue.insert(packet_id, entry);
        Ok(())
    }

    /// Rewrite the retry entry from PUBLISH to PUBREL when PUBREC arrives.
    pub async fn retry_to_release(
        &mut self,
        store: &dyn StateStore,
        packet_id: u16,
        release: PubRel,
        wire: Bytes,
    ) -> Result<(), ClientError> {
        store.put(&outbound_key(packet_id), wire).await?;
        self.retry_queue
            .insert(packet_id, RetryEntry::Release(release));
        Ok(())
    }

    /// Whether an outbound PUBLISH for this id is still awaiting PUBREC.
    pub fn awaiting_pubrec(&self, packet_id: u16) -> bool {
        matches!(
            self.retry_queue.get(&packet_id),
            Some(RetryEntry::Publish(_))
        )
    }

    /// Whether any in-flight entry exists for this id.
    pub fn has_retry(&self, packet_id: u16) -> bool {
        self.retry_queue.contains_key(&packet_id)
    }

    /// In-flight messages in packet-id order, for retry replay.
    pub fn retry_entries(&self) -> impl Iterator<Item = (u16, &RetryEntry)> {
        self.retry_queue.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn retry_len(&self) -> usize {
        self.retry_queue.len()
    }

    /// Record an inbound QoS 2 packet id, durably, before PUBREC goes out.
    /// Returns false when the id was already present (duplicate delivery).
    pub async fn add_inbound_qos2(
        &mut self,
        store: &dyn StateStore,
        packet_id: u16,
    ) -> Result<bool, ClientError> {
        if self.inbound_qos2.contains(&packet_id) {
            return Ok(false);
        }
        store.put(&inbound_key(packet_id), Bytes::new()).await?;
        self.inbound_qos2.insert(packet_id);
        Ok(true)
    }

    /// Forget an inbound QoS 2 packet id, durably, after PUBCOMP went out.
    pub async fn complete_inbound_qos2(
        &mut self,
        store: &dyn StateStore,
        packet_id: u16,
    ) -> Result<(), ClientError> {
        if self.inbound_qos2.remove(&packet_id) {
            store.remove(&inbound_key(packet_id)).await?;
        }
        Ok(())
    }

    pub fn has_inbound_qos2(&self, packet_id: u16) -> bool {
        self.inbound_qos2.contains(&packet_id)
    }

    /// Drop all session data and reset the packet id cursor.
    ///
    /// Invoked on clean start and on connection end when the session expiry
    /// is zero. Returns the orphaned tokens with their freed ids; the engine
    /// re-keys the ones whose messages never reached the wire and fails the
    /// rest.
    pub async fn clear(
        &mut self,
        store: &dyn StateStore,
    ) -> Result<Vec<(u16, TokenHandle)>, ClientError> {
        let tokens = self.out_tokens.drain().collect();
        self.retry_queue.clear();
        self.inbound_qos2.clear();
        self.next_packet_id = 1;
        store.clear().await?;
        Ok(tokens)
    }

    /// Restore an in-flight outbound message loaded from the store.
    /// Post-restart entries have no token (tokenless recovery).
    pub fn restore_retry(&mut self, packet_id: u16, entry: RetryEntry) {
        debug!(packet_id, "restored in-flight outbound message");
        self.retry_queue.insert(packet_id, entry);
    }

    /// Restore an inbound QoS 2 id loaded from the store.
    pub fn restore_inbound_qos2(&mut self, packet_id: u16) {
        debug!(packet_id, "restored inbound QoS 2 id");
        self.inbound_qos2.insert(packet_id);
    }

    /// Register a listener for (subscription identifier, topic filter).
    pub fn add_listener(
        &mut self,
        subscription_id: Option<u32>,
        filter: String,
        listener: MessageListener,
    ) {
        // Re-registering a filter replaces its listener
        self.listeners
            .retain(|e| e.filter != filter || e.subscription_id != subscription_id);
        self.listeners.push(ListenerEntry {
            subscription_id,
            filter,
            listener,
        });
    }

    /// Drop listeners for an unsubscribed filter.
    pub fn remove_listeners(&mut self, filter: &str) {
        self.listeners.retain(|e| e.filter != filter);
    }

    /// Resolve the listener for an inbound publish.
    ///
    /// Resolution order: (a) when the publish carries subscription
    /// identifiers, the first listener registered under one of them; else
    /// (b) the first listener whose filter matches the topic.
    pub fn get_message_listener(&self, publish: &Publish) -> Option<&MessageListener> {
        let sub_ids = &publish.properties.subscription_identifiers;
        if !sub_ids.is_empty() {
            if let Some(entry) = self.listeners.iter().find(|e| {
                e.subscription_id
                    .is_some_and(|id| sub_ids.contains(&id))
            }) {
                return Some(&entry.listener);
            }
        }

        self.listeners
            .iter()
            .find(|e| topic_matches_filter(&publish.topic, &e.filter))
            .map(|e| &e.listener)
    }
}
