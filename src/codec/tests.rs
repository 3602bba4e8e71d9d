//! Codec tests
//!
//! Round trips, malformed frames and streaming deframer behavior for the
//! MQTT v5.0 wire format.

#![allow(clippy::field_reassign_with_default)]

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use test_case::test_case;

use crate::codec::{
    read_variable_int, write_variable_int, Codec, Decoder, Encoder, MAX_REMAINING_LENGTH,
};
use crate::protocol::{
    Auth, ConnAck, Connect, DecodeError, Disconnect, EncodeError, Packet, Properties, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, RetainHandling, SubAck, Subscribe,
    Subscription, SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

// ============================================================================
// Helpers
// ============================================================================

fn encode_packet(packet: &Packet) -> BytesMut {
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    let decoder = Decoder::new();
    match decoder.decode(buf)? {
        Some((packet, _)) => Ok(packet),
        None => Err(DecodeError::InsufficientData),
    }
}

fn round_trip(packet: Packet) {
    let encoded = encode_packet(&packet);
    let decoded = decode_packet(&encoded).unwrap();
    assert_eq!(packet, decoded);
}

// ============================================================================
// Variable Byte Integer
// ============================================================================

#[test_case(0, &[0x00])]
#[test_case(127, &[0x7F])]
#[test_case(128, &[0x80, 0x01])]
#[test_case(16_383, &[0xFF, 0x7F])]
#[test_case(16_384, &[0x80, 0x80, 0x01])]
#[test_case(2_097_151, &[0xFF, 0xFF, 0x7F])]
#[test_case(2_097_152, &[0x80, 0x80, 0x80, 0x01])]
#[test_case(268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F])]
fn test_variable_int_boundaries(value: u32, bytes: &[u8]) {
    let mut buf = BytesMut::new();
    let written = write_variable_int(&mut buf, value).unwrap();
    assert_eq!(&buf[..], bytes);
    assert_eq!(written, bytes.len());

    let (decoded, consumed) = read_variable_int(bytes).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn test_variable_int_rejects_over_maximum() {
    let mut buf = BytesMut::new();
    assert_eq!(
        write_variable_int(&mut buf, MAX_REMAINING_LENGTH as u32 + 1),
        Err(EncodeError::PacketTooLarge)
    );
}

#[test]
fn test_variable_int_rejects_five_byte_encoding() {
    // Continuation bit still set on the fourth byte
    assert_eq!(
        read_variable_int(&[0x80, 0x80, 0x80, 0x80, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
    assert_eq!(
        read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF]),
        Err(DecodeError::InvalidRemainingLength)
    );
}

#[test]
fn test_variable_int_incomplete() {
    assert_eq!(
        read_variable_int(&[0x80]),
        Err(DecodeError::InsufficientData)
    );
    assert_eq!(read_variable_int(&[]), Err(DecodeError::InsufficientData));
}

// ============================================================================
// CONNECT
// ============================================================================

#[test]
fn test_connect_minimal() {
    round_trip(Packet::Connect(Box::new(Connect::default())));
}

#[test]
fn test_connect_full() {
    let mut props = Properties::default();
    props.session_expiry_interval = Some(3600);
    props.receive_maximum = Some(100);
    props.maximum_packet_size = Some(1024 * 1024);
    props.topic_alias_maximum = Some(10);
    props.request_response_information = Some(1);
    props.request_problem_information = Some(1);
    props.user_properties.push(("origin".into(), "test".into()));

    let mut will_props = Properties::default();
    will_props.will_delay_interval = Some(30);
    will_props.message_expiry_interval = Some(3600);
    will_props.content_type = Some("application/json".to_string());

    round_trip(Packet::Connect(Box::new(Connect {
        client_id: "test-client-123".to_string(),
        clean_start: false,
        keep_alive: 300,
        username: Some("user".to_string()),
        password: Some(Bytes::from("password")),
        will: Some(Will {
            topic: "status/offline".to_string(),
            payload: Bytes::from(r#"{"status":"offline"}"#),
            qos: QoS::AtLeastOnce,
            retain: true,
            properties: will_props,
        }),
        properties: props,
    })));
}

#[test]
fn test_connect_password_without_username() {
    // Valid in v5.0: the password flag no longer requires the username flag
    round_trip(Packet::Connect(Box::new(Connect {
        client_id: "c".to_string(),
        password: Some(Bytes::from("token")),
        ..Default::default()
    })));
}

#[test]
fn test_connect_invalid_protocol_name() {
    let invalid = [
        0x10, 0x0D, // CONNECT, remaining length
        0x00, 0x04, b'X', b'Q', b'T', b'T', // invalid name
        0x05, // protocol level 5
        0x02, // clean start
        0x00, 0x3C, // keep alive 60
        0x00, // empty properties
        0x00, 0x00, // empty client id
    ];
    assert!(matches!(
        decode_packet(&invalid),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_connect_reserved_flag_bit_set() {
    let invalid = [
        0x10, 0x0D, //
        0x00, 0x04, b'M', b'Q', b'T', b'T', //
        0x05, //
        0x03, // reserved bit set
        0x00, 0x3C, //
        0x00, //
        0x00, 0x00, //
    ];
    assert_eq!(decode_packet(&invalid), Err(DecodeError::InvalidFlags));
}

// ============================================================================
// CONNACK
// ============================================================================

#[test]
fn test_connack_with_server_limits() {
    let mut props = Properties::default();
    props.receive_maximum = Some(10);
    props.topic_alias_maximum = Some(5);
    props.server_keep_alive = Some(30);
    props.assigned_client_identifier = Some("assigned-1".to_string());
    props.maximum_qos = Some(1);

    round_trip(Packet::ConnAck(ConnAck {
        session_present: true,
        reason_code: ReasonCode::Success,
        properties: props,
    }));
}

#[test]
fn test_connack_refused() {
    round_trip(Packet::ConnAck(ConnAck {
        session_present: false,
        reason_code: ReasonCode::NotAuthorized,
        properties: Properties::default(),
    }));
}

#[test]
fn test_connack_invalid_ack_flags() {
    let invalid = [0x20, 0x03, 0x02, 0x00, 0x00];
    assert_eq!(decode_packet(&invalid), Err(DecodeError::InvalidFlags));
}

// ============================================================================
// PUBLISH
// ============================================================================

#[test]
fn test_publish_qos0() {
    round_trip(Packet::Publish(Publish {
        topic: "sensors/temp".into(),
        payload: Bytes::from("21.5"),
        ..Default::default()
    }));
}

#[test]
fn test_publish_qos2_with_properties() {
    let mut props = Properties::default();
    props.message_expiry_interval = Some(60);
    props.content_type = Some("text/plain".to_string());
    props.response_topic = Some("replies/1".to_string());
    props.correlation_data = Some(Bytes::from_static(b"\x01\x02"));
    props.subscription_identifiers.push(12);

    round_trip(Packet::Publish(Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        retain: true,
        topic: "a/b/c".into(),
        packet_id: Some(42),
        payload: Bytes::from("payload"),
        properties: props,
    }));
}

#[test]
fn test_publish_with_topic_alias_and_empty_topic() {
    let mut props = Properties::default();
    props.topic_alias = Some(3);

    round_trip(Packet::Publish(Publish {
        topic: "".into(),
        packet_id: None,
        payload: Bytes::from("x"),
        properties: props,
        ..Default::default()
    }));
}

#[test]
fn test_publish_dup_on_qos0_rejected() {
    // flags 1000: DUP set, QoS 0
    let invalid = [0x38, 0x05, 0x00, 0x01, b'a', 0x00, b'x'];
    assert!(matches!(
        decode_packet(&invalid),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_publish_wildcard_topic_rejected() {
    let packet = Packet::Publish(Publish {
        topic: "a/+/b".into(),
        payload: Bytes::from("x"),
        ..Default::default()
    });
    let encoded = encode_packet(&packet);
    assert!(matches!(
        decode_packet(&encoded),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_publish_zero_packet_id_rejected() {
    // QoS 1 with packet id 0
    let invalid = [0x32, 0x07, 0x00, 0x01, b'a', 0x00, 0x00, 0x00, b'x'];
    assert!(matches!(
        decode_packet(&invalid),
        Err(DecodeError::MalformedPacket(_))
    ));
}

// ============================================================================
// PUBACK / PUBREC / PUBREL / PUBCOMP
// ============================================================================

#[test]
fn test_puback_short_form() {
    let packet = Packet::PubAck(PubAck::new(7));
    let encoded = encode_packet(&packet);
    // Success + no properties uses the two-byte form
    assert_eq!(&encoded[..], &[0x40, 0x02, 0x00, 0x07]);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_puback_with_reason() {
    round_trip(Packet::PubAck(PubAck {
        packet_id: 7,
        reason_code: ReasonCode::QuotaExceeded,
        properties: Properties::default(),
    }));
}

#[test]
fn test_pubrec_pubrel_pubcomp_round_trip() {
    round_trip(Packet::PubRec(PubRec::new(1)));
    round_trip(Packet::PubRel(PubRel::new(1)));
    round_trip(Packet::PubComp(PubComp::new(1)));

    let mut props = Properties::default();
    props.reason_string = Some("stale".to_string());
    round_trip(Packet::PubRec(PubRec {
        packet_id: 9,
        reason_code: ReasonCode::UnspecifiedError,
        properties: props,
    }));
}

#[test]
fn test_pubrel_requires_flags_0010() {
    let packet = Packet::PubRel(PubRel::new(3));
    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x62);

    // Same body with wrong flags
    let invalid = [0x60, 0x02, 0x00, 0x03];
    assert_eq!(decode_packet(&invalid), Err(DecodeError::InvalidFlags));
}

// ============================================================================
// SUBSCRIBE / SUBACK
// ============================================================================

#[test]
fn test_subscribe_round_trip() {
    let mut props = Properties::default();
    props.subscription_identifiers.push(5);

    round_trip(Packet::Subscribe(Subscribe {
        packet_id: 11,
        subscriptions: vec![
            Subscription {
                filter: "a/+/c".to_string(),
                options: SubscriptionOptions {
                    qos: QoS::AtLeastOnce,
                    no_local: true,
                    retain_as_published: true,
                    retain_handling: RetainHandling::SendAtSubscribeIfNew,
                },
            },
            Subscription {
                filter: "d/#".to_string(),
                options: SubscriptionOptions::default(),
            },
        ],
        properties: props,
    }));
}

#[test]
fn test_subscribe_empty_rejected() {
    // Valid header but no subscription entries
    let invalid = [0x82, 0x03, 0x00, 0x01, 0x00];
    assert!(matches!(
        decode_packet(&invalid),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_suback_round_trip() {
    round_trip(Packet::SubAck(SubAck {
        packet_id: 11,
        reason_codes: vec![
            ReasonCode::GrantedQoS1,
            ReasonCode::GrantedQoS2,
            ReasonCode::TopicFilterInvalid,
        ],
        properties: Properties::default(),
    }));
}

// ============================================================================
// UNSUBSCRIBE / UNSUBACK
// ============================================================================

#[test]
fn test_unsubscribe_round_trip() {
    round_trip(Packet::Unsubscribe(Unsubscribe {
        packet_id: 12,
        filters: vec!["a/b".to_string(), "c/#".to_string()],
        properties: Properties::default(),
    }));
}

#[test]
fn test_unsuback_round_trip() {
    round_trip(Packet::UnsubAck(UnsubAck {
        packet_id: 12,
        reason_codes: vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted],
        properties: Properties::default(),
    }));
}

// ============================================================================
// PING / DISCONNECT / AUTH
// ============================================================================

#[test]
fn test_pingreq_pingresp() {
    assert_eq!(&encode_packet(&Packet::PingReq)[..], &[0xC0, 0x00]);
    assert_eq!(&encode_packet(&Packet::PingResp)[..], &[0xD0, 0x00]);
    round_trip(Packet::PingReq);
    round_trip(Packet::PingResp);
}

#[test]
fn test_pingreq_with_flags_rejected() {
    assert_eq!(decode_packet(&[0xC1, 0x00]), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_disconnect_round_trip() {
    round_trip(Packet::Disconnect(Disconnect::default()));

    let mut props = Properties::default();
    props.reason_string = Some("going away".to_string());
    round_trip(Packet::Disconnect(Disconnect {
        reason_code: ReasonCode::ServerShuttingDown,
        properties: props,
    }));
}

#[test]
fn test_auth_round_trip() {
    let mut props = Properties::default();
    props.authentication_method = Some("SCRAM-SHA-1".to_string());
    props.authentication_data = Some(Bytes::from_static(b"challenge"));
    round_trip(Packet::Auth(Auth {
        reason_code: ReasonCode::ContinueAuthentication,
        properties: props,
    }));
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn test_duplicate_property_rejected() {
    // Two session-expiry-interval properties in a CONNACK
    let invalid = [
        0x20, 0x0D, // CONNACK
        0x00, 0x00, // flags, reason
        0x0A, // property length 10
        0x11, 0x00, 0x00, 0x00, 0x01, // session expiry 1
        0x11, 0x00, 0x00, 0x00, 0x02, // session expiry 2
    ];
    assert_eq!(
        decode_packet(&invalid),
        Err(DecodeError::DuplicateProperty(0x11))
    );
}

#[test]
fn test_zero_receive_maximum_rejected() {
    let invalid = [
        0x20, 0x06, //
        0x00, 0x00, //
        0x03, // property length 3
        0x21, 0x00, 0x00, // receive maximum 0
    ];
    assert!(matches!(
        decode_packet(&invalid),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_unknown_property_rejected() {
    let invalid = [
        0x20, 0x05, //
        0x00, 0x00, //
        0x02, // property length 2
        0x7F, 0x01, // bogus property id
    ];
    assert_eq!(
        decode_packet(&invalid),
        Err(DecodeError::InvalidPropertyId(0x7F))
    );
}

// ============================================================================
// Streaming deframer
// ============================================================================

#[test]
fn test_codec_streams_partial_reads() {
    let packets = vec![
        Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: "a/b".into(),
            packet_id: Some(1),
            payload: Bytes::from("hello"),
            ..Default::default()
        }),
        Packet::PingResp,
        Packet::PubAck(PubAck::new(1)),
    ];

    let mut wire = BytesMut::new();
    let encoder = Encoder::new();
    for packet in &packets {
        encoder.encode(packet, &mut wire).unwrap();
    }

    // Feed one byte at a time; packets must pop out whole and in order
    let mut codec = Codec::new();
    let mut decoded = Vec::new();
    for byte in wire.iter() {
        codec.feed(&[*byte]);
        while let Some(packet) = codec.next_packet().unwrap() {
            decoded.push(packet);
        }
    }

    assert_eq!(decoded, packets);
    assert_eq!(codec.buffered(), 0);
}

#[test]
fn test_codec_emits_multiple_packets_from_one_feed() {
    let mut wire = BytesMut::new();
    let encoder = Encoder::new();
    encoder.encode(&Packet::PingReq, &mut wire).unwrap();
    encoder.encode(&Packet::PingResp, &mut wire).unwrap();

    let mut codec = Codec::new();
    codec.feed(&wire);
    assert_eq!(codec.next_packet().unwrap(), Some(Packet::PingReq));
    assert_eq!(codec.next_packet().unwrap(), Some(Packet::PingResp));
    assert_eq!(codec.next_packet().unwrap(), None);
}

#[test]
fn test_codec_waits_for_length_prefix() {
    let mut codec = Codec::new();
    // PUBLISH fixed header with a multi-byte remaining length, fed partially
    codec.feed(&[0x30, 0x80]);
    assert_eq!(codec.next_packet().unwrap(), None);
    assert_eq!(codec.buffered(), 2);
}

#[test]
fn test_codec_surfaces_malformed_length() {
    let mut codec = Codec::new();
    codec.feed(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]);
    assert!(codec.next_packet().is_err());
}

#[test]
fn test_codec_enforces_max_packet_size() {
    let mut codec = Codec::new().with_max_packet_size(16);
    let packet = Packet::Publish(Publish {
        topic: "t".into(),
        payload: Bytes::from(vec![0u8; 64]),
        ..Default::default()
    });
    let mut wire = BytesMut::new();
    Encoder::new().encode(&packet, &mut wire).unwrap();

    codec.feed(&wire);
    assert_eq!(codec.next_packet(), Err(DecodeError::PacketTooLarge));
}

// ============================================================================
// Property-based round trips
// ============================================================================

fn arb_qos() -> impl Strategy<Value = QoS> {
    prop_oneof![
        Just(QoS::AtMostOnce),
        Just(QoS::AtLeastOnce),
        Just(QoS::ExactlyOnce),
    ]
}

fn arb_topic() -> impl Strategy<Value = String> {
    "[a-z]{1,8}(/[a-z0-9]{1,8}){0,3}"
}

prop_compose! {
    fn arb_publish()(
        topic in arb_topic(),
        qos in arb_qos(),
        retain in any::<bool>(),
        dup in any::<bool>(),
        packet_id in 1u16..,
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        expiry in proptest::option::of(any::<u32>()),
    ) -> Publish {
        let mut properties = Properties::default();
        properties.message_expiry_interval = expiry;
        Publish {
            dup: dup && qos != QoS::AtMostOnce,
            qos,
            retain,
            topic: topic.as_str().into(),
            packet_id: (qos != QoS::AtMostOnce).then_some(packet_id),
            payload: Bytes::from(payload),
            properties,
        }
    }
}

proptest! {
    #[test]
    fn prop_variable_int_round_trip(value in 0u32..=MAX_REMAINING_LENGTH as u32) {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, value).unwrap();
        let (decoded, consumed) = read_variable_int(&buf).unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(consumed, buf.len());
    }

    #[test]
    fn prop_publish_round_trip(publish in arb_publish()) {
        let packet = Packet::Publish(publish);
        let encoded = encode_packet(&packet);
        let decoded = decode_packet(&encoded).unwrap();
        prop_assert_eq!(packet, decoded);
    }

    #[test]
    fn prop_suback_round_trip(
        packet_id in 1u16..,
        codes in proptest::collection::vec(
            prop_oneof![
                Just(ReasonCode::Success),
                Just(ReasonCode::GrantedQoS1),
                Just(ReasonCode::GrantedQoS2),
                Just(ReasonCode::UnspecifiedError),
            ],
            1..8,
        ),
    ) {
        let packet = Packet::SubAck(SubAck {
            packet_id,
            reason_codes: codes,
            properties: Properties::default(),
        });
        let encoded = encode_packet(&packet);
        let decoded = decode_packet(&encoded).unwrap();
        prop_assert_eq!(packet, decoded);
    }
}
