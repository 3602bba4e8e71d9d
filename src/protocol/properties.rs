//! MQTT v5.0 properties
//!
//! The property set from Table 2-4 of the v5.0 specification, decoded into a
//! flat struct so lookups on the hot path (topic alias, subscription
//! identifiers, receive maximum) are field reads rather than list scans.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_binary, read_string, read_variable_int, variable_int_len, write_binary, write_string,
    write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers as defined in Table 2-4 of the MQTT v5.0 spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

impl PropertyId {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(PropertyId::PayloadFormatIndicator),
            0x02 => Some(PropertyId::MessageExpiryInterval),
            0x03 => Some(PropertyId::ContentType),
            0x08 => Some(PropertyId::ResponseTopic),
            0x09 => Some(PropertyId::CorrelationData),
            0x0B => Some(PropertyId::SubscriptionIdentifier),
            0x11 => Some(PropertyId::SessionExpiryInterval),
            0x12 => Some(PropertyId::AssignedClientIdentifier),
            0x13 => Some(PropertyId::ServerKeepAlive),
            0x15 => Some(PropertyId::AuthenticationMethod),
            0x16 => Some(PropertyId::AuthenticationData),
            0x17 => Some(PropertyId::RequestProblemInformation),
            0x18 => Some(PropertyId::WillDelayInterval),
            0x19 => Some(PropertyId::RequestResponseInformation),
            0x1A => Some(PropertyId::ResponseInformation),
            0x1C => Some(PropertyId::ServerReference),
            0x1F => Some(PropertyId::ReasonString),
            0x21 => Some(PropertyId::ReceiveMaximum),
            0x22 => Some(PropertyId::TopicAliasMaximum),
            0x23 => Some(PropertyId::TopicAlias),
            0x24 => Some(PropertyId::MaximumQoS),
            0x25 => Some(PropertyId::RetainAvailable),
            0x26 => Some(PropertyId::UserProperty),
            0x27 => Some(PropertyId::MaximumPacketSize),
            0x28 => Some(PropertyId::WildcardSubscriptionAvailable),
            0x29 => Some(PropertyId::SubscriptionIdentifierAvailable),
            0x2A => Some(PropertyId::SharedSubscriptionAvailable),
            _ => None,
        }
    }
}

/// A single property value, used where callers hand over ad-hoc property
/// lists (user-facing connect options).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Bytes),
    SubscriptionIdentifier(u32),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(String),
    ServerKeepAlive(u16),
    AuthenticationMethod(String),
    AuthenticationData(Bytes),
    RequestProblemInformation(u8),
    WillDelayInterval(u32),
    RequestResponseInformation(u8),
    ResponseInformation(String),
    ServerReference(String),
    ReasonString(String),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQoS(u8),
    RetainAvailable(u8),
    UserProperty(String, String),
    MaximumPacketSize(u32),
    WildcardSubscriptionAvailable(u8),
    SubscriptionIdentifierAvailable(u8),
    SharedSubscriptionAvailable(u8),
}

/// Collection of MQTT v5.0 properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

/// Read cursor over the properties block, bounds-checked against its
/// declared length.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= self.end {
            return Err(DecodeError::InsufficientData);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        if self.pos + 2 > self.end {
            return Err(DecodeError::InsufficientData);
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        if self.pos + 4 > self.end {
            return Err(DecodeError::InsufficientData);
        }
        let v = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    fn varint(&mut self) -> Result<u32, DecodeError> {
        let (v, n) = read_variable_int(&self.buf[self.pos..self.end])?;
        self.pos += n;
        Ok(v)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let (s, n) = read_string(&self.buf[self.pos..self.end])?;
        self.pos += n;
        Ok(s.to_string())
    }

    fn binary(&mut self) -> Result<Bytes, DecodeError> {
        let (d, n) = read_binary(&self.buf[self.pos..self.end])?;
        let out = Bytes::copy_from_slice(d);
        self.pos += n;
        Ok(out)
    }
}

/// Store into an Option slot, rejecting a second occurrence of the property.
fn once<T>(slot: &mut Option<T>, value: T, id: PropertyId) -> Result<(), DecodeError> {
    if slot.is_some() {
        return Err(DecodeError::DuplicateProperty(id as u8));
    }
    *slot = Some(value);
    Ok(())
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded_size() == 0
    }

    /// Calculate the encoded size of properties (excluding the length prefix)
    pub fn encoded_size(&self) -> usize {
        fn str_field(s: &Option<String>) -> usize {
            s.as_ref().map_or(0, |s| 3 + s.len())
        }
        fn bin_field(d: &Option<Bytes>) -> usize {
            d.as_ref().map_or(0, |d| 3 + d.len())
        }
        fn fixed<T>(v: &Option<T>, width: usize) -> usize {
            v.as_ref().map_or(0, |_| 1 + width)
        }

        let mut size = 0;
        size += fixed(&self.payload_format_indicator, 1);
        size += fixed(&self.message_expiry_interval, 4);
        size += str_field(&self.content_type);
        size += str_field(&self.response_topic);
        size += bin_field(&self.correlation_data);
        for id in &self.subscription_identifiers {
            size += 1 + variable_int_len(*id);
        }
        size += fixed(&self.session_expiry_interval, 4);
        size += str_field(&self.assigned_client_identifier);
        size += fixed(&self.server_keep_alive, 2);
        size += str_field(&self.authentication_method);
        size += bin_field(&self.authentication_data);
        size += fixed(&self.request_problem_information, 1);
        size += fixed(&self.will_delay_interval, 4);
        size += fixed(&self.request_response_information, 1);
        size += str_field(&self.response_information);
        size += str_field(&self.server_reference);
        size += str_field(&self.reason_string);
        size += fixed(&self.receive_maximum, 2);
        size += fixed(&self.topic_alias_maximum, 2);
        size += fixed(&self.topic_alias, 2);
        size += fixed(&self.maximum_qos, 1);
        size += fixed(&self.retain_available, 1);
        for (k, v) in &self.user_properties {
            size += 1 + 2 + k.len() + 2 + v.len();
        }
        size += fixed(&self.maximum_packet_size, 4);
        size += fixed(&self.wildcard_subscription_available, 1);
        size += fixed(&self.subscription_identifier_available, 1);
        size += fixed(&self.shared_subscription_available, 1);
        size
    }

    /// Decode a properties block (length prefix included).
    /// Returns the properties and the total bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::InsufficientData);
        }

        let (prop_len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + prop_len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let mut props = Properties::new();
        let mut cur = Cursor {
            buf,
            pos: len_bytes,
            end,
        };

        while cur.pos < cur.end {
            let raw = cur.varint()?;
            let id = PropertyId::from_u8(raw as u8)
                .ok_or(DecodeError::InvalidPropertyId(raw as u8))?;

            use PropertyId::*;
            match id {
                PayloadFormatIndicator => {
                    let v = cur.u8()?;
                    once(&mut props.payload_format_indicator, v, id)?;
                }
                MessageExpiryInterval => {
                    let v = cur.u32()?;
                    once(&mut props.message_expiry_interval, v, id)?;
                }
                ContentType => {
                    let v = cur.string()?;
                    once(&mut props.content_type, v, id)?;
                }
                ResponseTopic => {
                    let v = cur.string()?;
                    once(&mut props.response_topic, v, id)?;
                }
                CorrelationData => {
                    let v = cur.binary()?;
                    once(&mut props.correlation_data, v, id)?;
                }
                SubscriptionIdentifier => {
                    let v = cur.varint()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket(
                            "subscription identifier cannot be 0",
                        ));
                    }
                    props.subscription_identifiers.push(v);
                }
                SessionExpiryInterval => {
                    let v = cur.u32()?;
                    once(&mut props.session_expiry_interval, v, id)?;
                }
                AssignedClientIdentifier => {
                    let v = cur.string()?;
                    once(&mut props.assigned_client_identifier, v, id)?;
                }
                ServerKeepAlive => {
                    let v = cur.u16()?;
                    once(&mut props.server_keep_alive, v, id)?;
                }
                AuthenticationMethod => {
                    let v = cur.string()?;
                    once(&mut props.authentication_method, v, id)?;
                }
                AuthenticationData => {
                    let v = cur.binary()?;
                    once(&mut props.authentication_data, v, id)?;
                }
                RequestProblemInformation => {
                    let v = cur.u8()?;
                    once(&mut props.request_problem_information, v, id)?;
                }
                WillDelayInterval => {
                    let v = cur.u32()?;
                    once(&mut props.will_delay_interval, v, id)?;
                }
                RequestResponseInformation => {
                    let v = cur.u8()?;
                    once(&mut props.request_response_information, v, id)?;
                }
                ResponseInformation => {
                    let v = cur.string()?;
                    once(&mut props.response_information, v, id)?;
                }
                ServerReference => {
                    let v = cur.string()?;
                    once(&mut props.server_reference, v, id)?;
                }
                ReasonString => {
                    let v = cur.string()?;
                    once(&mut props.reason_string, v, id)?;
                }
                ReceiveMaximum => {
                    let v = cur.u16()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket("receive maximum cannot be 0"));
                    }
                    once(&mut props.receive_maximum, v, id)?;
                }
                TopicAliasMaximum => {
                    let v = cur.u16()?;
                    once(&mut props.topic_alias_maximum, v, id)?;
                }
                TopicAlias => {
                    let v = cur.u16()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket("topic alias cannot be 0"));
                    }
                    once(&mut props.topic_alias, v, id)?;
                }
                MaximumQoS => {
                    let v = cur.u8()?;
                    once(&mut props.maximum_qos, v, id)?;
                }
                RetainAvailable => {
                    let v = cur.u8()?;
                    once(&mut props.retain_available, v, id)?;
                }
                UserProperty => {
                    let k = cur.string()?;
                    let v = cur.string()?;
                    props.user_properties.push((k, v));
                }
                MaximumPacketSize => {
                    let v = cur.u32()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket(
                            "maximum packet size cannot be 0",
                        ));
                    }
                    once(&mut props.maximum_packet_size, v, id)?;
                }
                WildcardSubscriptionAvailable => {
                    let v = cur.u8()?;
                    once(&mut props.wildcard_subscription_available, v, id)?;
                }
                SubscriptionIdentifierAvailable => {
                    let v = cur.u8()?;
                    once(&mut props.subscription_identifier_available, v, id)?;
                }
                SharedSubscriptionAvailable => {
                    let v = cur.u8()?;
                    once(&mut props.shared_subscription_available, v, id)?;
                }
            }
        }

        Ok((props, end))
    }

    /// Encode the properties block, length prefix included.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let size = self.encoded_size();
        write_variable_int(buf, size as u32)?;

        if let Some(v) = self.payload_format_indicator {
            buf.put_u8(PropertyId::PayloadFormatIndicator as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.message_expiry_interval {
            buf.put_u8(PropertyId::MessageExpiryInterval as u8);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.content_type {
            buf.put_u8(PropertyId::ContentType as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.response_topic {
            buf.put_u8(PropertyId::ResponseTopic as u8);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.correlation_data {
            buf.put_u8(PropertyId::CorrelationData as u8);
            write_binary(buf, d)?;
        }
        for id in &self.subscription_identifiers {
            buf.put_u8(PropertyId::SubscriptionIdentifier as u8);
            write_variable_int(buf, *id)?;
        }
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(PropertyId::SessionExpiryInterval as u8);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(PropertyId::AssignedClientIdentifier as u8);
            write_string(buf, s)?;
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(PropertyId::ServerKeepAlive as u8);
            buf.put_u16(v);
        }
        if let Some(ref s) = self.authentication_method {
            buf.put_u8(PropertyId::AuthenticationMethod as u8);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.authentication_data {
            buf.put_u8(PropertyId::AuthenticationData as u8);
            write_binary(buf, d)?;
        }
        if let Some(v) = self.request_problem_information {
            buf.put_u8(PropertyId::RequestProblemInformation as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.will_delay_interval {
            buf.put_u8(PropertyId::WillDelayInterval as u8);
            buf.put_u32(v);
        }
        if let Some(v) = self.request_response_information {
            buf.put_u8(PropertyId::RequestResponseInformation as u8);
            buf.put_u8(v);
        }
        if let Some(ref s) = self.response_information {
            buf.put_u8(PropertyId::ResponseInformation as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.server_reference {
            buf.put_u8(PropertyId::ServerReference as u8);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(PropertyId::ReasonString as u8);
            write_string(buf, s)?;
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(PropertyId::ReceiveMaximum as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            buf.put_u8(PropertyId::TopicAliasMaximum as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias {
            buf.put_u8(PropertyId::TopicAlias as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            buf.put_u8(PropertyId::MaximumQoS as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.retain_available {
            buf.put_u8(PropertyId::RetainAvailable as u8);
            buf.put_u8(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(PropertyId::UserProperty as u8);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(PropertyId::MaximumPacketSize as u8);
            buf.put_u32(v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            buf.put_u8(PropertyId::WildcardSubscriptionAvailable as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.subscription_identifier_available {
            buf.put_u8(PropertyId::SubscriptionIdentifierAvailable as u8);
            buf.put_u8(v);
        }
        if let Some(v) = self.shared_subscription_available {
            buf.put_u8(PropertyId::SharedSubscriptionAvailable as u8);
            buf.put_u8(v);
        }

        Ok(())
    }
}
