//! Asynchronous MQTT v5.0 client
//!
//! [`Client`] is a thin handle over the session engine: every operation
//! crosses a command channel into a single engine task that owns the
//! transport, the session state and the outbound queue. Operations return a
//! [`Token`] that completes when the broker acknowledges the work.

mod engine;
mod options;

pub use options::{ConnectOptions, WillOptions};

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::persistence::{MemoryStore, StateStore};
use crate::protocol::{
    Auth, Disconnect, Properties, Publish, QoS, ReasonCode, Subscription, SubscriptionOptions,
};
use crate::session::MessageListener;
use crate::token::{Token, TokenHandle};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::ServerUri;

use engine::Engine;

/// Callback receiving broker-initiated AUTH packets
pub type AuthListener = Arc<dyn Fn(Auth) + Send + Sync>;

/// Connection status visible from the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection and none pending
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// CONNACK accepted; operations flow
    Connected,
    /// Connection lost; automatic reconnect scheduled
    Reconnecting,
    /// The client has been closed
    Closed,
}

/// Operations crossing from the facade into the engine task
pub(crate) enum Command {
    Connect {
        uris: Vec<ServerUri>,
        token: TokenHandle,
    },
    Publish {
        publish: Publish,
        token: TokenHandle,
    },
    Subscribe {
        subscriptions: Vec<Subscription>,
        properties: Properties,
        listener: Option<MessageListener>,
        token: TokenHandle,
    },
    Unsubscribe {
        filters: Vec<String>,
        properties: Properties,
        token: TokenHandle,
    },
    Disconnect {
        disconnect: Disconnect,
        token: TokenHandle,
    },
    SetDefaultListener(MessageListener),
    SetAuthListener(AuthListener),
    Close,
}

/// Asynchronous MQTT v5.0 client handle
#[derive(Clone)]
pub struct Client {
    command_tx: mpsc::Sender<Command>,
    status: Arc<RwLock<ConnectionStatus>>,
}

impl Client {
    /// Create a client whose session state is mirrored to `store`.
    pub fn new(options: ConnectOptions, store: Arc<dyn StateStore>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(1024);
        let status = Arc::new(RwLock::new(ConnectionStatus::Disconnected));

        let engine = Engine::new(options, store, command_rx, status.clone());
        tokio::spawn(engine.run());

        Self { command_tx, status }
    }

    /// Create a client with in-process session state only.
    pub fn with_memory_store(options: ConnectOptions) -> Self {
        Self::new(options, Arc::new(MemoryStore::new()))
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Connect to the first reachable server URI, in listed order.
    ///
    /// Accepted forms: `tcp://host:port`, `ssl://host:port`,
    /// `ws://host:port/mqtt`, `wss://host:port/mqtt`.
    pub async fn connect(&self, server_uris: &[impl AsRef<str>]) -> Result<Token, ClientError> {
        if server_uris.is_empty() {
            return Err(ClientError::InvalidInput("no server URIs"));
        }
        let uris = server_uris
            .iter()
            .map(|s| ServerUri::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let (handle, token) = TokenHandle::pair();
        self.send(Command::Connect {
            uris,
            token: handle,
        })
        .await?;
        Ok(token)
    }

    /// Publish a message. The token completes on PUBACK (QoS 1), PUBCOMP
    /// (QoS 2) or successful transport write (QoS 0).
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Token, ClientError> {
        self.publish_with(Publish {
            qos,
            retain,
            topic: Arc::from(topic),
            payload: payload.into(),
            ..Default::default()
        })
        .await
    }

    /// Publish a fully specified message (properties, correlation data, ...).
    pub async fn publish_with(&self, publish: Publish) -> Result<Token, ClientError> {
        validate_topic_name(&publish.topic).map_err(ClientError::InvalidInput)?;

        let (handle, token) = TokenHandle::pair();
        self.send(Command::Publish {
            publish,
            token: handle,
        })
        .await?;
        Ok(token)
    }

    /// Subscribe to a single filter.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Token, ClientError> {
        self.subscribe_with(
            vec![Subscription {
                filter: filter.to_string(),
                options: SubscriptionOptions {
                    qos,
                    ..Default::default()
                },
            }],
            Properties::default(),
            None,
        )
        .await
    }

    /// Subscribe with full per-filter options, optional SUBSCRIBE properties
    /// (e.g. a subscription identifier) and an optional listener receiving
    /// publishes matched to these filters.
    pub async fn subscribe_with(
        &self,
        subscriptions: Vec<Subscription>,
        properties: Properties,
        listener: Option<MessageListener>,
    ) -> Result<Token, ClientError> {
        if subscriptions.is_empty() {
            return Err(ClientError::InvalidInput("no subscriptions"));
        }
        for sub in &subscriptions {
            validate_topic_filter(&sub.filter).map_err(ClientError::InvalidInput)?;
        }

        let (handle, token) = TokenHandle::pair();
        self.send(Command::Subscribe {
            subscriptions,
            properties,
            listener,
            token: handle,
        })
        .await?;
        Ok(token)
    }

    /// Unsubscribe from the given filters.
    pub async fn unsubscribe(&self, filters: &[&str]) -> Result<Token, ClientError> {
        if filters.is_empty() {
            return Err(ClientError::InvalidInput("no filters"));
        }
        for filter in filters {
            validate_topic_filter(filter).map_err(ClientError::InvalidInput)?;
        }

        let (handle, token) = TokenHandle::pair();
        self.send(Command::Unsubscribe {
            filters: filters.iter().map(|s| s.to_string()).collect(),
            properties: Properties::default(),
            token: handle,
        })
        .await?;
        Ok(token)
    }

    /// Gracefully disconnect: the DISCONNECT packet is flushed before the
    /// socket closes. Completes immediately when already disconnected.
    pub async fn disconnect(&self) -> Result<Token, ClientError> {
        self.disconnect_with(ReasonCode::Success, Properties::default())
            .await
    }

    pub async fn disconnect_with(
        &self,
        reason_code: ReasonCode,
        properties: Properties,
    ) -> Result<Token, ClientError> {
        let (handle, token) = TokenHandle::pair();
        self.send(Command::Disconnect {
            disconnect: Disconnect {
                reason_code,
                properties,
            },
            token: handle,
        })
        .await?;
        Ok(token)
    }

    /// Listener for publishes no subscription-specific listener claims.
    pub async fn set_default_listener(&self, listener: MessageListener) -> Result<(), ClientError> {
        self.send(Command::SetDefaultListener(listener)).await
    }

    /// Callback for broker-initiated AUTH packets.
    pub async fn set_auth_listener(&self, listener: AuthListener) -> Result<(), ClientError> {
        self.send(Command::SetAuthListener(listener)).await
    }

    /// Shut the client down: cancels any pending reconnect, clears the
    /// reconnect intent and fails all buffered work.
    pub async fn close(&self) {
        let _ = self.send(Command::Close).await;
    }

    async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }
}
