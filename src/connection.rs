//! Ephemeral per-connection state
//!
//! Everything here is reset when a new TCP/WebSocket connection is
//! established: activity timestamps feeding the keep-alive protocol, topic
//! alias maps in both directions, the server's advertised limits from
//! CONNACK, and the send quota implementing the receive-maximum window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::protocol::{Properties, ProtocolError, Publish, QoS};

/// Server limits advertised in CONNACK properties
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Bound on concurrent unacknowledged QoS>0 publishes
    pub receive_maximum: u16,
    /// Largest packet the server accepts
    pub maximum_packet_size: Option<u32>,
    /// Highest outbound topic alias the server accepts (0 = none)
    pub topic_alias_maximum: u16,
    /// Keep alive the server requires instead of the requested one
    pub server_keep_alive: Option<u16>,
    /// Highest QoS the server supports
    pub maximum_qos: QoS,
    pub retain_available: bool,
    pub wildcard_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    pub shared_subscriptions_available: bool,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            receive_maximum: 65535,
            maximum_packet_size: None,
            topic_alias_maximum: 0,
            server_keep_alive: None,
            maximum_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscriptions_available: true,
        }
    }
}

impl ServerLimits {
    pub fn from_connack(props: &Properties) -> Self {
        let defaults = Self::default();
        Self {
            receive_maximum: props.receive_maximum.unwrap_or(defaults.receive_maximum),
            maximum_packet_size: props.maximum_packet_size,
            topic_alias_maximum: props.topic_alias_maximum.unwrap_or(0),
            server_keep_alive: props.server_keep_alive,
            maximum_qos: props
                .maximum_qos
                .and_then(QoS::from_u8)
                .unwrap_or(QoS::ExactlyOnce),
            retain_available: props.retain_available != Some(0),
            wildcard_subscription_available: props.wildcard_subscription_available != Some(0),
            subscription_identifiers_available: props.subscription_identifier_available
                != Some(0),
            shared_subscriptions_available: props.shared_subscription_available != Some(0),
        }
    }
}

/// Outcome of a keep-alive check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Nothing to do
    Idle,
    /// The outbound side has been idle for the interval: emit PINGREQ
    SendPing,
    /// An outstanding ping went unanswered past the deadline: the
    /// connection is dead
    Timeout,
}

/// State of one TCP/WebSocket connection lifetime
pub struct ConnectionState {
    last_inbound: Instant,
    last_outbound: Instant,
    ping_outstanding: bool,
    ping_sent_at: Option<Instant>,
    /// topic -> alias, for outbound publishes
    outbound_aliases: AHashMap<Arc<str>, u16>,
    next_alias: u16,
    /// alias -> topic, learned from broker publishes
    inbound_aliases: AHashMap<u16, Arc<str>>,
    /// Highest inbound alias we advertised in CONNECT
    inbound_alias_maximum: u16,
    /// Limits from CONNACK
    pub limits: ServerLimits,
    send_quota: u16,
}

impl ConnectionState {
    pub fn new(now: Instant, inbound_alias_maximum: u16) -> Self {
        Self {
            last_inbound: now,
            last_outbound: now,
            ping_outstanding: false,
            ping_sent_at: None,
            outbound_aliases: AHashMap::new(),
            next_alias: 1,
            inbound_aliases: AHashMap::new(),
            inbound_alias_maximum,
            limits: ServerLimits::default(),
            send_quota: 65535,
        }
    }

    /// Record the server's CONNACK limits and arm the send quota.
    pub fn apply_connack(&mut self, props: &Properties) {
        self.limits = ServerLimits::from_connack(props);
        self.send_quota = self.limits.receive_maximum;
    }

    pub fn register_inbound_activity(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    pub fn register_outbound_activity(&mut self, now: Instant) {
        self.last_outbound = now;
    }

    /// Stamp a PINGREQ emission.
    pub fn ping_sent(&mut self, now: Instant) {
        self.ping_outstanding = true;
        self.ping_sent_at = Some(now);
        self.last_outbound = now;
    }

    /// PINGRESP arrived.
    pub fn ping_received(&mut self) {
        self.ping_outstanding = false;
        self.ping_sent_at = None;
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_outstanding
    }

    /// Periodic keep-alive check.
    ///
    /// With no outbound traffic for a full interval a PINGREQ is due; an
    /// outstanding ping unanswered for 1.5 x interval means the connection
    /// is dead.
    pub fn keep_alive(&self, now: Instant, interval: Duration) -> KeepAliveAction {
        if interval.is_zero() {
            return KeepAliveAction::Idle;
        }

        if self.ping_outstanding {
            let deadline = interval + interval / 2;
            if let Some(sent_at) = self.ping_sent_at {
                if now.duration_since(sent_at) >= deadline {
                    return KeepAliveAction::Timeout;
                }
            }
            return KeepAliveAction::Idle;
        }

        if now.duration_since(self.last_outbound) >= interval {
            return KeepAliveAction::SendPing;
        }

        KeepAliveAction::Idle
    }

    /// Apply outbound topic aliasing to a publish.
    ///
    /// A topic already aliased goes out with an empty topic and the alias.
    /// While the alias table has capacity a new alias is allocated and sent
    /// together with the full topic so the broker learns the pair.
    /// Otherwise the publish is unchanged.
    pub fn set_topic_alias(&mut self, mut publish: Publish) -> Publish {
        if self.limits.topic_alias_maximum == 0 {
            return publish;
        }

        if let Some(&alias) = self.outbound_aliases.get(&publish.topic) {
            publish.properties.topic_alias = Some(alias);
            publish.topic = Arc::from("");
            return publish;
        }

        if self.next_alias <= self.limits.topic_alias_maximum {
            let alias = self.next_alias;
            self.next_alias += 1;
            self.outbound_aliases.insert(publish.topic.clone(), alias);
            publish.properties.topic_alias = Some(alias);
        }

        publish
    }

    /// Resolve an inbound publish's topic alias.
    ///
    /// An alias with an empty topic is replaced from the learned map; an
    /// alias alongside a topic teaches the pair. An unknown or out-of-range
    /// alias is a protocol error.
    pub fn resolve_topic_alias(&mut self, mut publish: Publish) -> Result<Publish, ProtocolError> {
        let alias = match publish.properties.topic_alias {
            Some(alias) => alias,
            None => {
                if publish.topic.is_empty() {
                    return Err(ProtocolError::ProtocolViolation(
                        "publish with neither topic nor alias",
                    ));
                }
                return Ok(publish);
            }
        };

        if alias == 0 || alias > self.inbound_alias_maximum {
            return Err(ProtocolError::TopicAliasInvalid(alias));
        }

        if publish.topic.is_empty() {
            match self.inbound_aliases.get(&alias) {
                Some(topic) => publish.topic = topic.clone(),
                None => return Err(ProtocolError::TopicAliasInvalid(alias)),
            }
        } else {
            self.inbound_aliases.insert(alias, publish.topic.clone());
        }

        Ok(publish)
    }

    /// Take one slot of the receive-maximum window for a QoS>0 publish.
    pub fn reserve_send_quota(&mut self) -> bool {
        if self.send_quota == 0 {
            return false;
        }
        self.send_quota -= 1;
        true
    }

    /// Return a window slot on PUBACK / PUBCOMP (or failed PUBREC).
    pub fn release_send_quota(&mut self) {
        if self.send_quota < self.limits.receive_maximum {
            self.send_quota += 1;
        }
    }

    pub fn send_quota(&self) -> u16 {
        self.send_quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(alias_max: u16) -> (ConnectionState, Instant) {
        let now = Instant::now();
        (ConnectionState::new(now, alias_max), now)
    }

    #[test]
    fn test_keep_alive_pings_after_idle_interval() {
        let (mut c, now) = conn(0);
        let interval = Duration::from_secs(30);

        assert_eq!(c.keep_alive(now, interval), KeepAliveAction::Idle);

        let later = now + Duration::from_secs(30);
        assert_eq!(c.keep_alive(later, interval), KeepAliveAction::SendPing);

        // Outbound traffic resets the clock
        c.register_outbound_activity(later);
        assert_eq!(c.keep_alive(later, interval), KeepAliveAction::Idle);
    }

    #[test]
    fn test_keep_alive_times_out_unanswered_ping() {
        let (mut c, now) = conn(0);
        let interval = Duration::from_secs(30);

        c.ping_sent(now);
        assert_eq!(
            c.keep_alive(now + Duration::from_secs(44), interval),
            KeepAliveAction::Idle
        );
        assert_eq!(
            c.keep_alive(now + Duration::from_secs(45), interval),
            KeepAliveAction::Timeout
        );

        // PINGRESP clears the outstanding state
        c.ping_received();
        assert!(!c.ping_outstanding());
        assert_eq!(
            c.keep_alive(now + Duration::from_secs(45), interval),
            KeepAliveAction::SendPing
        );
    }

    #[test]
    fn test_keep_alive_disabled() {
        let (mut c, now) = conn(0);
        c.ping_sent(now);
        assert_eq!(
            c.keep_alive(now + Duration::from_secs(3600), Duration::ZERO),
            KeepAliveAction::Idle
        );
    }

    #[test]
    fn test_outbound_alias_allocation_and_reuse() {
        let (mut c, _) = conn(0);
        let mut props = Properties::default();
        props.topic_alias_maximum = Some(1);
        c.apply_connack(&props);

        // First use: alias allocated, topic still present
        let p = Publish {
            topic: Arc::from("a/b"),
            ..Default::default()
        };
        let p = c.set_topic_alias(p);
        assert_eq!(p.properties.topic_alias, Some(1));
        assert_eq!(&*p.topic, "a/b");

        // Second use: empty topic + alias
        let p = Publish {
            topic: Arc::from("a/b"),
            ..Default::default()
        };
        let p = c.set_topic_alias(p);
        assert_eq!(p.properties.topic_alias, Some(1));
        assert!(p.topic.is_empty());

        // Table full: different topic goes out unaliased
        let p = Publish {
            topic: Arc::from("c/d"),
            ..Default::default()
        };
        let p = c.set_topic_alias(p);
        assert_eq!(p.properties.topic_alias, None);
        assert_eq!(&*p.topic, "c/d");
    }

    #[test]
    fn test_inbound_alias_learn_and_resolve() {
        let (mut c, _) = conn(10);

        let mut p = Publish {
            topic: Arc::from("sensors/1"),
            ..Default::default()
        };
        p.properties.topic_alias = Some(4);
        let p = c.resolve_topic_alias(p).unwrap();
        assert_eq!(&*p.topic, "sensors/1");

        let mut p = Publish::default();
        p.properties.topic_alias = Some(4);
        let p = c.resolve_topic_alias(p).unwrap();
        assert_eq!(&*p.topic, "sensors/1");

        // Unknown alias with no topic
        let mut p = Publish::default();
        p.properties.topic_alias = Some(5);
        assert!(c.resolve_topic_alias(p).is_err());

        // Alias beyond what we advertised
        let mut p = Publish::default();
        p.properties.topic_alias = Some(11);
        assert!(c.resolve_topic_alias(p).is_err());
    }

    #[test]
    fn test_send_quota_window() {
        let (mut c, _) = conn(0);
        let mut props = Properties::default();
        props.receive_maximum = Some(2);
        c.apply_connack(&props);

        assert!(c.reserve_send_quota());
        assert!(c.reserve_send_quota());
        assert!(!c.reserve_send_quota());

        c.release_send_quota();
        assert_eq!(c.send_quota(), 1);
        // Never exceeds the advertised maximum
        c.release_send_quota();
        c.release_send_quota();
        assert_eq!(c.send_quota(), 2);
    }
}
