//! Connect options
//!
//! Everything the engine needs to know before and during a connection:
//! identity, session lifetime, keep alive, reconnect policy, offline
//! buffering and the CONNECT properties advertised to the server.

use std::time::Duration;

use bytes::Bytes;

use crate::protocol::{Connect, Properties, QoS, Will};
use crate::queue::OverflowPolicy;

/// Will message configuration
#[derive(Debug, Clone)]
pub struct WillOptions {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Client identifier; empty requests a server-assigned one
    pub client_id: String,
    /// Discard any existing session state on connect
    pub clean_start: bool,
    /// Keep alive interval; zero disables the liveness protocol
    pub keep_alive: Duration,
    /// How long the server keeps the session after disconnect; zero means
    /// the session (and local durable state) is cleared on disconnect
    pub session_expiry: Duration,
    /// Deadline for one transport connect + CONNACK exchange
    pub connect_timeout: Duration,
    /// Reconnect automatically after an unexpected connection loss
    pub automatic_reconnect: bool,
    /// First reconnect delay
    pub reconnect_min_delay: Duration,
    /// Ceiling for the doubling reconnect delay
    pub reconnect_max_delay: Duration,
    /// Queue publishes while disconnected
    pub buffer_enabled: bool,
    /// Capacity of the outbound work queue
    pub buffer_size: usize,
    /// What to do with new work when the queue is full
    pub overflow_policy: OverflowPolicy,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<WillOptions>,
    /// Bound on concurrent inbound QoS>0 publishes we advertise
    pub receive_maximum: Option<u16>,
    /// Highest inbound topic alias we accept (0 disables)
    pub topic_alias_maximum: u16,
    /// Largest packet we accept
    pub maximum_packet_size: Option<u32>,
    pub request_response_information: bool,
    pub request_problem_information: bool,
    pub user_properties: Vec<(String, String)>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_start: true,
            keep_alive: Duration::from_secs(60),
            session_expiry: Duration::ZERO,
            connect_timeout: Duration::from_secs(30),
            automatic_reconnect: false,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(120),
            buffer_enabled: false,
            buffer_size: 5000,
            overflow_policy: OverflowPolicy::Reject,
            username: None,
            password: None,
            will: None,
            receive_maximum: None,
            topic_alias_maximum: 0,
            maximum_packet_size: None,
            request_response_information: false,
            request_problem_information: false,
            user_properties: Vec::new(),
            authentication_method: None,
            authentication_data: None,
        }
    }
}

impl ConnectOptions {
    /// Build the CONNECT packet for the given (possibly server-reassigned)
    /// client id.
    pub(crate) fn connect_packet(&self, client_id: &str) -> Connect {
        let mut properties = Properties::default();
        let expiry_secs = self.session_expiry.as_secs();
        if expiry_secs > 0 {
            properties.session_expiry_interval = Some(expiry_secs.min(u32::MAX as u64) as u32);
        }
        properties.receive_maximum = self.receive_maximum;
        if self.topic_alias_maximum > 0 {
            properties.topic_alias_maximum = Some(self.topic_alias_maximum);
        }
        properties.maximum_packet_size = self.maximum_packet_size;
        if self.request_response_information {
            properties.request_response_information = Some(1);
        }
        if self.request_problem_information {
            properties.request_problem_information = Some(1);
        }
        properties.user_properties = self.user_properties.clone();
        properties.authentication_method = self.authentication_method.clone();
        properties.authentication_data = self.authentication_data.clone();

        Connect {
            client_id: client_id.to_string(),
            clean_start: self.clean_start,
            keep_alive: self.keep_alive.as_secs().min(u16::MAX as u64) as u16,
            username: self.username.clone(),
            password: self.password.clone(),
            will: self.will.as_ref().map(|w| Will {
                topic: w.topic.clone(),
                payload: w.payload.clone(),
                qos: w.qos,
                retain: w.retain,
                properties: w.properties.clone(),
            }),
            properties,
        }
    }

    /// Keep alive actually used on a connection: the minimum of the
    /// configured interval and the server-advertised one.
    pub(crate) fn effective_keep_alive(&self, server_keep_alive: Option<u16>) -> Duration {
        match server_keep_alive {
            Some(server) => {
                let server = Duration::from_secs(server as u64);
                if self.keep_alive.is_zero() {
                    server
                } else {
                    self.keep_alive.min(server)
                }
            }
            None => self.keep_alive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_packet_reads_password_from_password_field() {
        let opts = ConnectOptions {
            username: Some("alice".into()),
            password: Some(Bytes::from_static(b"secret")),
            ..Default::default()
        };
        let connect = opts.connect_packet("cl1");
        assert_eq!(connect.username.as_deref(), Some("alice"));
        assert_eq!(connect.password, Some(Bytes::from_static(b"secret")));
    }

    #[test]
    fn test_connect_packet_properties() {
        let opts = ConnectOptions {
            session_expiry: Duration::from_secs(300),
            receive_maximum: Some(20),
            topic_alias_maximum: 5,
            ..Default::default()
        };
        let connect = opts.connect_packet("cl1");
        assert_eq!(connect.properties.session_expiry_interval, Some(300));
        assert_eq!(connect.properties.receive_maximum, Some(20));
        assert_eq!(connect.properties.topic_alias_maximum, Some(5));
    }

    #[test]
    fn test_effective_keep_alive_takes_minimum() {
        let opts = ConnectOptions {
            keep_alive: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(opts.effective_keep_alive(None), Duration::from_secs(60));
        assert_eq!(
            opts.effective_keep_alive(Some(30)),
            Duration::from_secs(30)
        );
        assert_eq!(
            opts.effective_keep_alive(Some(90)),
            Duration::from_secs(60)
        );

        let disabled = ConnectOptions {
            keep_alive: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            disabled.effective_keep_alive(Some(30)),
            Duration::from_secs(30)
        );
    }
}
