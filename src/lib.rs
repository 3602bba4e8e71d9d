//! LarkMQ - Asynchronous MQTT v5.0 client
//!
//! A session engine that multiplexes user operations onto a single broker
//! connection, drives the QoS 1/2 delivery handshakes, persists in-flight
//! work across reconnects and process restarts, and owns keep-alive and
//! automatic reconnection policy.

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod token;
pub mod topic;
pub mod transport;

pub use client::{Client, ConnectOptions, ConnectionStatus, WillOptions};
pub use connection::{ConnectionState, KeepAliveAction, ServerLimits};
pub use error::ClientError;
pub use persistence::{FjallStore, MemoryStore, StateStore};
pub use protocol::{Packet, Properties, QoS, ReasonCode};
pub use queue::{OverflowPolicy, ToDoQueue};
pub use session::{MessageListener, SessionState};
pub use token::{Ack, Token};
pub use transport::ServerUri;
