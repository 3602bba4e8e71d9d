//! Session engine event loop
//!
//! A single task owns the transport, the session state, the connection state
//! and the outbound queue; every mutation happens here, between await
//! points, so none of it needs locking. User operations arrive over the
//! command channel, broker traffic over the transport, and liveness over the
//! keep-alive tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant as TokioInstant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::codec::{Codec, Decoder};
use crate::connection::{ConnectionState, KeepAliveAction};
use crate::error::ClientError;
use crate::persistence::{packet_id_from_key, StateStore, INBOUND_PREFIX, OUTBOUND_PREFIX};
use crate::protocol::{
    ConnAck, Packet, Properties, ProtocolError, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    ReasonCode, Subscribe, Unsubscribe,
};
use crate::queue::{OverflowPolicy, QueueEntry, ToDoQueue};
use crate::session::{MessageListener, RetryEntry, SessionState};
use crate::token::TokenHandle;
use crate::transport::{dial, ServerUri, Stream};

use super::{AuthListener, Command, ConnectionStatus};

/// Why a connection ended
enum End {
    /// User-requested disconnect; no reconnect
    Graceful,
    /// Engine shutdown
    Closed,
    /// Transport or protocol failure; reconnect policy applies
    Failed(ClientError),
}

/// What woke the engine while disconnected
enum Trigger {
    /// User called connect
    Connect(TokenHandle),
    /// Reconnect backoff elapsed
    Retry,
    /// Close command or facade dropped
    Shutdown,
}

/// A freshly established connection, CONNACK accepted
struct Established {
    stream: Stream,
    codec: Codec,
    conn: ConnectionState,
    connack: ConnAck,
}

pub(crate) struct Engine {
    options: super::ConnectOptions,
    store: Arc<dyn StateStore>,
    session: SessionState,
    queue: ToDoQueue,
    command_rx: mpsc::Receiver<Command>,
    status: Arc<RwLock<ConnectionStatus>>,
    default_listener: Option<MessageListener>,
    auth_listener: Option<AuthListener>,
    server_uris: Vec<ServerUri>,
    /// Current reconnect delay; doubles per failed attempt, resets on CONNACK
    current_delay: Duration,
    next_retry_at: Option<TokioInstant>,
    /// Filters of unsubscribes awaiting UNSUBACK, for listener removal
    pending_unsubs: AHashMap<u16, Vec<String>>,
}

impl Engine {
    pub(crate) fn new(
        options: super::ConnectOptions,
        store: Arc<dyn StateStore>,
        command_rx: mpsc::Receiver<Command>,
        status: Arc<RwLock<ConnectionStatus>>,
    ) -> Self {
        let mut queue = ToDoQueue::new(options.buffer_size, options.overflow_policy);
        // Nothing drains until the first CONNACK
        queue.pause();

        let session = SessionState::new(options.client_id.clone());
        let current_delay = options.reconnect_min_delay;

        Self {
            options,
            store,
            session,
            queue,
            command_rx,
            status,
            default_listener: None,
            auth_listener: None,
            server_uris: Vec::new(),
            current_delay,
            next_retry_at: None,
            pending_unsubs: AHashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(e) = self.restore().await {
            warn!(error = %e, "failed to restore persisted session state");
        }

        loop {
            let mut connect_token = match self.await_trigger().await {
                Trigger::Connect(token) => Some(token),
                Trigger::Retry => None,
                Trigger::Shutdown => break,
            };

            self.set_status(if connect_token.is_some() {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Reconnecting
            });

            let mut est = match self.establish().await {
                Ok(est) => est,
                Err(e) => {
                    match connect_token.take() {
                        Some(token) => {
                            self.set_status(ConnectionStatus::Disconnected);
                            token.fail(e);
                        }
                        None => {
                            self.current_delay = (self.current_delay * 2)
                                .min(self.options.reconnect_max_delay);
                            self.schedule_retry();
                        }
                    }
                    continue;
                }
            };

            if let Err(e) = self.connection_start(&mut est).await {
                warn!(error = %e, "connection start-up failed");
                match connect_token.take() {
                    Some(token) => {
                        self.set_status(ConnectionStatus::Disconnected);
                        token.fail(e);
                    }
                    None => {
                        self.current_delay =
                            (self.current_delay * 2).min(self.options.reconnect_max_delay);
                        self.schedule_retry();
                    }
                }
                continue;
            }

            if let Some(mut token) = connect_token.take() {
                token.push_reason(est.connack.reason_code);
                token.complete(Some(Packet::ConnAck(est.connack.clone())));
            }

            let end = self.connected(est.stream, est.codec, est.conn).await;
            self.queue.pause();

            match end {
                End::Closed => break,
                End::Graceful => {
                    info!("disconnected");
                    self.set_status(ConnectionStatus::Disconnected);
                    self.end_of_session().await;
                }
                End::Failed(e) => {
                    warn!(error = %e, "connection lost");
                    self.end_of_session().await;
                    self.schedule_retry();
                }
            }
        }

        self.shutdown().await;
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }

    /// Clear session state at connection end when the session has no
    /// lifetime beyond the connection.
    async fn end_of_session(&mut self) {
        if !self.options.session_expiry.is_zero() {
            return;
        }
        if let Err(e) = self.clear_session(ClientError::NotConnected).await {
            warn!(error = %e, "failed to clear session state");
        }
    }

    async fn clear_session(&mut self, err: ClientError) -> Result<(), ClientError> {
        let mut orphans: AHashMap<u16, TokenHandle> =
            self.session.clear(&*self.store).await?.into_iter().collect();

        // Buffered QoS>0 publishes never reached the wire; re-key them into
        // the fresh id space instead of losing them with the session
        for entry in self.queue.entries_mut() {
            let Packet::Publish(publish) = &mut entry.packet else {
                continue;
            };
            let Some(old_id) = publish.packet_id else {
                continue;
            };
            let Some(token) = orphans.remove(&old_id) else {
                continue;
            };
            match self.session.next_packet_id() {
                Ok(id) => {
                    publish.packet_id = Some(id);
                    self.session.register_outbound(id, token);
                }
                Err(e) => token.fail(e),
            }
        }

        // What remains was in flight on a previous connection; its acks
        // will never arrive
        for (_, token) in orphans {
            token.fail(err.clone());
        }
        Ok(())
    }

    fn schedule_retry(&mut self) {
        let reconnect = self.session.should_be_connected
            && self.options.automatic_reconnect
            && !self.server_uris.is_empty();
        if reconnect {
            debug!(delay = ?self.current_delay, "scheduling reconnect");
            self.set_status(ConnectionStatus::Reconnecting);
            self.next_retry_at = Some(TokioInstant::now() + self.current_delay);
        } else {
            self.set_status(ConnectionStatus::Disconnected);
            self.next_retry_at = None;
        }
    }

    /// Wait for a connect command or the reconnect deadline.
    async fn await_trigger(&mut self) -> Trigger {
        loop {
            match self.next_retry_at {
                Some(at) => {
                    tokio::select! {
                        cmd = self.command_rx.recv() => {
                            let Some(cmd) = cmd else { return Trigger::Shutdown };
                            if let Some(trigger) = self.handle_offline_command(cmd) {
                                return trigger;
                            }
                        }
                        _ = sleep_until(at) => {
                            self.next_retry_at = None;
                            return Trigger::Retry;
                        }
                    }
                }
                None => {
                    let Some(cmd) = self.command_rx.recv().await else {
                        return Trigger::Shutdown;
                    };
                    if let Some(trigger) = self.handle_offline_command(cmd) {
                        return trigger;
                    }
                }
            }
        }
    }

    fn handle_offline_command(&mut self, command: Command) -> Option<Trigger> {
        match command {
            Command::Connect { uris, token } => {
                self.server_uris = uris;
                return Some(Trigger::Connect(token));
            }
            Command::Publish { publish, token } => {
                if self.options.buffer_enabled {
                    self.submit_publish(publish, token);
                } else {
                    token.fail(ClientError::NotConnected);
                }
            }
            Command::Subscribe { token, .. } | Command::Unsubscribe { token, .. } => {
                token.fail(ClientError::NotConnected);
            }
            Command::Disconnect { token, .. } => {
                // Already disconnected: cancel any reconnect and finish
                self.session.should_be_connected = false;
                self.next_retry_at = None;
                self.set_status(ConnectionStatus::Disconnected);
                token.complete(None);
            }
            Command::SetDefaultListener(listener) => self.default_listener = Some(listener),
            Command::SetAuthListener(listener) => self.auth_listener = Some(listener),
            Command::Close => return Some(Trigger::Shutdown),
        }
        None
    }

    /// Restore in-flight state persisted by a previous process.
    async fn restore(&mut self) -> Result<(), ClientError> {
        self.store.open().await?;

        let decoder = Decoder::new();
        for key in self.store.keys().await? {
            if let Some(id) = packet_id_from_key(&key, OUTBOUND_PREFIX) {
                let Some(blob) = self.store.get(&key).await? else {
                    continue;
                };
                match decoder.decode(&blob) {
                    Ok(Some((Packet::Publish(publish), _))) => {
                        self.session.restore_retry(id, RetryEntry::Publish(publish));
                    }
                    Ok(Some((Packet::PubRel(release), _))) => {
                        self.session.restore_retry(id, RetryEntry::Release(release));
                    }
                    _ => {
                        warn!(key = %key, "discarding unreadable persisted message");
                        self.store.remove(&key).await?;
                    }
                }
            } else if let Some(id) = packet_id_from_key(&key, INBOUND_PREFIX) {
                self.session.restore_inbound_qos2(id);
            }
        }

        if self.session.retry_len() > 0 {
            info!(count = self.session.retry_len(), "restored in-flight messages");
        }
        Ok(())
    }

    /// Try every server URI in listed order.
    async fn establish(&mut self) -> Result<Established, ClientError> {
        let uris = self.server_uris.clone();
        let mut last_err = ClientError::ServersUnavailable;
        for uri in &uris {
            match self.attempt(uri).await {
                Ok(est) => return Ok(est),
                Err(e) => {
                    warn!(%uri, error = %e, "connect attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// One transport connect + CONNECT/CONNACK exchange.
    async fn attempt(&mut self, uri: &ServerUri) -> Result<Established, ClientError> {
        let mut stream = dial(uri, self.options.connect_timeout).await?;

        let mut codec = Codec::new();
        if let Some(max) = self.options.maximum_packet_size {
            codec = codec.with_max_packet_size(max as usize);
        }

        let connect = self.options.connect_packet(&self.session.client_id);
        let mut buf = BytesMut::new();
        codec.encode(&Packet::Connect(Box::new(connect)), &mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        let connack = timeout(self.options.connect_timeout, async {
            let mut read_buf = vec![0u8; 4096];
            loop {
                if let Some(packet) = codec.next_packet()? {
                    match packet {
                        Packet::ConnAck(ack) => return Ok(ack),
                        _ => {
                            return Err(ClientError::Protocol(ProtocolError::UnexpectedPacket(
                                "expected CONNACK",
                            )))
                        }
                    }
                }
                let n = stream.read(&mut read_buf).await?;
                if n == 0 {
                    return Err(ClientError::Transport(
                        "connection closed before CONNACK".into(),
                    ));
                }
                codec.feed(&read_buf[..n]);
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        if connack.reason_code.is_error() {
            return Err(ClientError::ConnectionRefused(connack.reason_code));
        }

        let mut conn = ConnectionState::new(Instant::now(), self.options.topic_alias_maximum);
        conn.apply_connack(&connack.properties);

        Ok(Established {
            stream,
            codec,
            conn,
            connack,
        })
    }

    /// CONNACK accepted: adopt the server's view of the session, replay
    /// in-flight messages, then release the queue.
    async fn connection_start(&mut self, est: &mut Established) -> Result<(), ClientError> {
        if let Some(assigned) = &est.connack.properties.assigned_client_identifier {
            debug!(client_id = %assigned, "server assigned client id");
            self.session.client_id = assigned.clone();
        }

        // A clean start, or a server without our session, invalidates
        // everything carried over
        if self.options.clean_start || !est.connack.session_present {
            self.clear_session(ClientError::NotConnected).await?;
        }

        self.session.should_be_connected = true;
        self.current_delay = self.options.reconnect_min_delay;

        info!(
            client_id = %self.session.client_id,
            session_present = est.connack.session_present,
            "connected"
        );
        self.set_status(ConnectionStatus::Connected);

        self.replay(est).await?;
        self.queue.resume();
        Ok(())
    }

    /// Re-send in-flight messages in packet-id order, one write at a time.
    /// The queue stays paused until replay completes.
    async fn replay(&mut self, est: &mut Established) -> Result<(), ClientError> {
        let entries: Vec<(u16, RetryEntry)> = self
            .session
            .retry_entries()
            .map(|(id, entry)| (id, entry.clone()))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }

        info!(count = entries.len(), "replaying in-flight messages");
        let mut buf = BytesMut::new();
        for (id, entry) in entries {
            let packet = match entry {
                RetryEntry::Publish(mut publish) => {
                    publish.dup = true;
                    est.conn.reserve_send_quota();
                    Packet::Publish(publish)
                }
                RetryEntry::Release(release) => Packet::PubRel(release),
            };
            debug!(packet_id = id, "replaying");
            buf.clear();
            est.codec.encode(&packet, &mut buf)?;
            est.stream.write_all(&buf).await?;
            est.conn.register_outbound_activity(Instant::now());
        }
        est.stream.flush().await?;
        Ok(())
    }

    /// The connected event loop. Returns why the connection ended.
    async fn connected(
        &mut self,
        mut stream: Stream,
        mut codec: Codec,
        mut conn: ConnectionState,
    ) -> End {
        let keep_alive = self
            .options
            .effective_keep_alive(conn.limits.server_keep_alive);
        let tick_period = if keep_alive.is_zero() {
            Duration::from_secs(30)
        } else {
            (keep_alive / 2).max(Duration::from_millis(100))
        };
        let mut tick = tokio::time::interval(tick_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut read_buf = vec![0u8; 8192];

        loop {
            if let Err(e) = self.drain(&mut stream, &mut codec, &mut conn).await {
                return End::Failed(e);
            }

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else { return End::Closed };
                    match self.handle_online_command(cmd, &mut stream, &mut codec, &mut conn).await {
                        Ok(Some(end)) => return end,
                        Ok(None) => {}
                        Err(e) => return End::Failed(e),
                    }
                }
                result = stream.read(&mut read_buf) => {
                    let n = match result {
                        Ok(0) => return End::Failed(ClientError::Transport(
                            "connection closed by server".into(),
                        )),
                        Ok(n) => n,
                        Err(e) => return End::Failed(e.into()),
                    };
                    conn.register_inbound_activity(Instant::now());
                    codec.feed(&read_buf[..n]);
                    loop {
                        match codec.next_packet() {
                            Ok(Some(packet)) => {
                                match self.dispatch(packet, &mut stream, &mut codec, &mut conn).await {
                                    Ok(Some(end)) => return end,
                                    Ok(None) => {}
                                    Err(e) => return End::Failed(e),
                                }
                            }
                            Ok(None) => break,
                            Err(e) => return End::Failed(e.into()),
                        }
                    }
                }
                _ = tick.tick() => {
                    match conn.keep_alive(Instant::now(), keep_alive) {
                        KeepAliveAction::SendPing => {
                            debug!("sending PINGREQ");
                            if let Err(e) = self.write_packet(
                                &Packet::PingReq, &mut stream, &codec, &mut conn,
                            ).await {
                                return End::Failed(e);
                            }
                            conn.ping_sent(Instant::now());
                        }
                        KeepAliveAction::Timeout => {
                            warn!("no PINGRESP within deadline, closing connection");
                            return End::Failed(ClientError::Timeout);
                        }
                        KeepAliveAction::Idle => {}
                    }
                }
            }
        }
    }

    /// Serialize one packet straight to the transport.
    async fn write_packet(
        &self,
        packet: &Packet,
        stream: &mut Stream,
        codec: &Codec,
        conn: &mut ConnectionState,
    ) -> Result<(), ClientError> {
        let mut buf = BytesMut::new();
        codec.encode(packet, &mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;
        conn.register_outbound_activity(Instant::now());
        Ok(())
    }

    /// Cooperative queue drain: stops at the pause flag, an empty queue, or
    /// a QoS>0 publish at the head with no receive-maximum quota left.
    async fn drain(
        &mut self,
        stream: &mut Stream,
        codec: &mut Codec,
        conn: &mut ConnectionState,
    ) -> Result<(), ClientError> {
        while !self.queue.is_paused() {
            let head_needs_quota = match self.queue.peek() {
                None => break,
                Some(entry) => {
                    matches!(&entry.packet, Packet::Publish(p) if p.qos != QoS::AtMostOnce)
                }
            };
            if head_needs_quota && conn.send_quota() == 0 {
                break;
            }

            let Some(entry) = self.queue.pop() else { break };
            match entry.packet {
                Packet::Publish(publish) if publish.qos != QoS::AtMostOnce => {
                    let Some(id) = publish.packet_id else {
                        continue;
                    };
                    conn.reserve_send_quota();

                    // Persist the un-aliased form: a replay on a future
                    // connection must carry the full topic
                    let mut wire = BytesMut::new();
                    codec.encode(&Packet::Publish(publish.clone()), &mut wire)?;
                    self.session
                        .add_retry(
                            &*self.store,
                            id,
                            RetryEntry::Publish(publish.clone()),
                            wire.freeze(),
                        )
                        .await?;

                    let aliased = conn.set_topic_alias(publish);
                    self.write_packet(&Packet::Publish(aliased), stream, codec, conn)
                        .await?;
                }
                Packet::Publish(publish) => {
                    let aliased = conn.set_topic_alias(publish);
                    self.write_packet(&Packet::Publish(aliased), stream, codec, conn)
                        .await?;
                    // QoS 0 completes on successful transport write
                    if let Some(token) = entry.token {
                        token.complete(None);
                    }
                }
                other => {
                    self.write_packet(&other, stream, codec, conn).await?;
                    if let Some(token) = entry.token {
                        token.complete(None);
                    }
                }
            }
        }
        Ok(())
    }

    /// Make room in the queue per the overflow policy.
    fn ensure_queue_capacity(&mut self) -> Result<(), ClientError> {
        if !self.queue.is_full() {
            return Ok(());
        }
        match self.options.overflow_policy {
            OverflowPolicy::Reject => Err(ClientError::BufferFull),
            OverflowPolicy::DropOldest => {
                if let Some(evicted) = self.queue.pop() {
                    self.discard_entry(evicted);
                }
                Ok(())
            }
        }
    }

    /// Fail an entry that will never reach the wire.
    fn discard_entry(&mut self, entry: QueueEntry) {
        if let Packet::Publish(ref publish) = entry.packet {
            if let Some(id) = publish.packet_id {
                if let Some(token) = self.session.remove_outbound(id) {
                    token.fail(ClientError::BufferDiscarded);
                }
            }
        }
        if let Some(token) = entry.token {
            token.fail(ClientError::BufferDiscarded);
        }
    }

    /// Queue a publish: QoS 0 rides the queue with its token, QoS>0 gets a
    /// packet id and a registered token first.
    fn submit_publish(&mut self, mut publish: Publish, token: TokenHandle) {
        if let Err(e) = self.ensure_queue_capacity() {
            token.fail(e);
            return;
        }

        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = None;
            self.queue.add(Packet::Publish(publish), Some(token));
            return;
        }

        match self.session.next_packet_id() {
            Ok(id) => {
                publish.packet_id = Some(id);
                self.session.register_outbound(id, token);
                self.queue.add(Packet::Publish(publish), None);
            }
            Err(e) => token.fail(e),
        }
    }

    async fn handle_online_command(
        &mut self,
        command: Command,
        stream: &mut Stream,
        codec: &mut Codec,
        conn: &mut ConnectionState,
    ) -> Result<Option<End>, ClientError> {
        match command {
            Command::Connect { token, .. } => {
                token.fail(ClientError::InvalidInput("already connected"));
            }
            Command::Publish { publish, token } => {
                self.submit_publish(publish, token);
            }
            Command::Subscribe {
                subscriptions,
                properties,
                listener,
                token,
            } => {
                if let Err(e) = self.ensure_queue_capacity() {
                    token.fail(e);
                    return Ok(None);
                }
                let id = match self.session.next_packet_id() {
                    Ok(id) => id,
                    Err(e) => {
                        token.fail(e);
                        return Ok(None);
                    }
                };
                self.session.register_outbound(id, token);

                if let Some(listener) = listener {
                    let sub_id = properties.subscription_identifiers.first().copied();
                    for sub in &subscriptions {
                        self.session
                            .add_listener(sub_id, sub.filter.clone(), listener.clone());
                    }
                }

                self.queue.add(
                    Packet::Subscribe(Subscribe {
                        packet_id: id,
                        subscriptions,
                        properties,
                    }),
                    None,
                );
            }
            Command::Unsubscribe {
                filters,
                properties,
                token,
            } => {
                if let Err(e) = self.ensure_queue_capacity() {
                    token.fail(e);
                    return Ok(None);
                }
                let id = match self.session.next_packet_id() {
                    Ok(id) => id,
                    Err(e) => {
                        token.fail(e);
                        return Ok(None);
                    }
                };
                self.session.register_outbound(id, token);
                self.pending_unsubs.insert(id, filters.clone());

                self.queue.add(
                    Packet::Unsubscribe(Unsubscribe {
                        packet_id: id,
                        filters,
                        properties,
                    }),
                    None,
                );
            }
            Command::Disconnect { disconnect, token } => {
                self.session.should_be_connected = false;

                // Flush the DISCONNECT before tearing the socket
                let result = self
                    .write_packet(&Packet::Disconnect(disconnect), stream, codec, conn)
                    .await;
                if let Err(e) = &result {
                    debug!(error = %e, "DISCONNECT write failed during teardown");
                }
                let _ = stream.shutdown().await;
                token.complete(None);
                return Ok(Some(End::Graceful));
            }
            Command::SetDefaultListener(listener) => self.default_listener = Some(listener),
            Command::SetAuthListener(listener) => self.auth_listener = Some(listener),
            Command::Close => {
                let _ = stream.shutdown().await;
                return Ok(Some(End::Closed));
            }
        }
        Ok(None)
    }

    /// Route one inbound packet to its state updates and replies.
    async fn dispatch(
        &mut self,
        packet: Packet,
        stream: &mut Stream,
        codec: &mut Codec,
        conn: &mut ConnectionState,
    ) -> Result<Option<End>, ClientError> {
        match packet {
            Packet::Publish(publish) => {
                self.handle_inbound_publish(publish, stream, codec, conn)
                    .await?;
            }
            Packet::PubAck(ack) => {
                conn.release_send_quota();
                match self
                    .session
                    .complete_outbound(&*self.store, ack.packet_id)
                    .await?
                {
                    Some(mut token) => {
                        token.push_reason(ack.reason_code);
                        token.complete(Some(Packet::PubAck(ack)));
                    }
                    // Recovered after restart: the id is freed, no caller waits
                    None => debug!(packet_id = ack.packet_id, "PUBACK without token"),
                }
            }
            Packet::PubRec(rec) => {
                self.handle_pubrec(rec, stream, codec, conn).await?;
            }
            Packet::PubComp(comp) => {
                conn.release_send_quota();
                match self
                    .session
                    .complete_outbound(&*self.store, comp.packet_id)
                    .await?
                {
                    Some(mut token) => {
                        token.push_reason(comp.reason_code);
                        token.complete(Some(Packet::PubComp(comp)));
                    }
                    None => debug!(packet_id = comp.packet_id, "PUBCOMP without token"),
                }
            }
            Packet::PubRel(release) => {
                // PUBCOMP must be on the wire before the id is forgotten
                let id = release.packet_id;
                self.write_packet(&Packet::PubComp(PubComp::new(id)), stream, codec, conn)
                    .await?;
                self.session
                    .complete_inbound_qos2(&*self.store, id)
                    .await?;
            }
            Packet::SubAck(ack) => {
                match self
                    .session
                    .complete_outbound(&*self.store, ack.packet_id)
                    .await?
                {
                    Some(mut token) => {
                        token.extend_reasons(&ack.reason_codes);
                        token.complete(Some(Packet::SubAck(ack)));
                    }
                    None => debug!(packet_id = ack.packet_id, "SUBACK without token"),
                }
            }
            Packet::UnsubAck(ack) => {
                if let Some(filters) = self.pending_unsubs.remove(&ack.packet_id) {
                    for filter in &filters {
                        self.session.remove_listeners(filter);
                    }
                }
                match self
                    .session
                    .complete_outbound(&*self.store, ack.packet_id)
                    .await?
                {
                    Some(mut token) => {
                        token.extend_reasons(&ack.reason_codes);
                        token.complete(Some(Packet::UnsubAck(ack)));
                    }
                    None => debug!(packet_id = ack.packet_id, "UNSUBACK without token"),
                }
            }
            Packet::PingResp => {
                debug!("PINGRESP received");
                conn.ping_received();
            }
            Packet::Disconnect(disconnect) => {
                warn!(reason = %disconnect.reason_code, "server sent DISCONNECT");
                return Ok(Some(End::Failed(ClientError::Transport(format!(
                    "server disconnected: {}",
                    disconnect.reason_code
                )))));
            }
            Packet::Auth(auth) => match &self.auth_listener {
                Some(listener) => listener(auth),
                None => debug!(reason = %auth.reason_code, "AUTH received, no listener"),
            },
            Packet::ConnAck(_) => {
                return Err(ClientError::Protocol(ProtocolError::UnexpectedPacket(
                    "CONNACK on established connection",
                )));
            }
            Packet::Connect(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_)
            | Packet::PingReq => {
                return Err(ClientError::Protocol(ProtocolError::UnexpectedPacket(
                    "client-to-server packet from server",
                )));
            }
        }
        Ok(None)
    }

    /// PUBREC: rewrite the in-flight entry to PUBREL and emit it. A broker
    /// rejection terminates the delivery instead; the message counts as
    /// handled either way.
    async fn handle_pubrec(
        &mut self,
        rec: PubRec,
        stream: &mut Stream,
        codec: &mut Codec,
        conn: &mut ConnectionState,
    ) -> Result<(), ClientError> {
        let id = rec.packet_id;

        if rec.reason_code.is_error() {
            conn.release_send_quota();
            match self.session.complete_outbound(&*self.store, id).await? {
                Some(mut token) => {
                    token.push_reason(rec.reason_code);
                    token.complete(Some(Packet::PubRec(rec)));
                }
                None => debug!(packet_id = id, "failed PUBREC without token"),
            }
            return Ok(());
        }

        // A PUBREC for an id with no in-flight state gets a PUBREL carrying
        // "packet identifier not found" and leaves the session untouched
        if !self.session.has_retry(id) && self.session.outbound_token(id).is_none() {
            debug!(packet_id = id, "PUBREC for unknown packet id");
            let release = PubRel {
                packet_id: id,
                reason_code: ReasonCode::PacketIdNotFound,
                properties: Properties::default(),
            };
            return self
                .write_packet(&Packet::PubRel(release), stream, codec, conn)
                .await;
        }

        if let Some(token) = self.session.outbound_token(id) {
            // Carried until PUBCOMP closes the handshake
            token.push_reason(rec.reason_code);
        }

        let release = PubRel::new(id);
        let mut wire = BytesMut::new();
        codec.encode(&Packet::PubRel(release.clone()), &mut wire)?;
        self.session
            .retry_to_release(&*self.store, id, release.clone(), wire.freeze())
            .await?;

        self.write_packet(&Packet::PubRel(release), stream, codec, conn)
            .await
    }

    async fn handle_inbound_publish(
        &mut self,
        publish: Publish,
        stream: &mut Stream,
        codec: &mut Codec,
        conn: &mut ConnectionState,
    ) -> Result<(), ClientError> {
        let publish = conn
            .resolve_topic_alias(publish)
            .map_err(ClientError::Protocol)?;

        match publish.qos {
            QoS::AtMostOnce => {
                self.deliver(publish);
            }
            QoS::AtLeastOnce => {
                let Some(id) = publish.packet_id else {
                    return Err(ClientError::Protocol(ProtocolError::ProtocolViolation(
                        "QoS 1 publish without packet id",
                    )));
                };
                self.deliver(publish);
                self.write_packet(&Packet::PubAck(PubAck::new(id)), stream, codec, conn)
                    .await?;
            }
            QoS::ExactlyOnce => {
                let Some(id) = publish.packet_id else {
                    return Err(ClientError::Protocol(ProtocolError::ProtocolViolation(
                        "QoS 2 publish without packet id",
                    )));
                };
                // Registered durably before the PUBREC goes out; a replayed
                // id suppresses delivery but still gets its PUBREC
                let fresh = self.session.add_inbound_qos2(&*self.store, id).await?;
                if fresh {
                    self.deliver(publish);
                } else {
                    debug!(packet_id = id, "duplicate QoS 2 publish suppressed");
                }
                self.write_packet(&Packet::PubRec(PubRec::new(id)), stream, codec, conn)
                    .await?;
            }
        }
        Ok(())
    }

    fn deliver(&self, publish: Publish) {
        let listener = self
            .session
            .get_message_listener(&publish)
            .cloned()
            .or_else(|| self.default_listener.clone());
        match listener {
            Some(listener) => listener(publish),
            None => debug!(topic = %publish.topic, "no listener for inbound publish"),
        }
    }

    async fn shutdown(&mut self) {
        self.session.should_be_connected = false;
        self.next_retry_at = None;
        self.queue.shutdown();
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "failed to close state store");
        }
        self.set_status(ConnectionStatus::Closed);
        info!("client closed");
    }
}
