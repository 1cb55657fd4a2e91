use std::time::Duration;

use bytes::Bytes;

use crate::client::{SensorProfile, UplinkClient};
use crate::coap::block::Block1;
use crate::coap::engine::{RequestEngine, RequestError, DEFAULT_HOST};
use crate::coap::packet::{
    CoapCode, CoapPacket, CoapType, Token, BLOCK1, CONTENT_FORMAT, OCTET_STREAM, SIZE1, URI_PATH,
};
use crate::modem::registration::{CellTechnology, ModemSession, RegistrationError};
use crate::transport::{EndpointAddr, TransportError};

use util::*;

const SERIAL: &str = "sensor-7A3F01";

fn response(kind: CoapType, code: CoapCode, mid: u16, token: &[u8]) -> CoapPacket {
    let mut packet = CoapPacket::new(kind, code, mid);
    packet.token = Token::new(token);
    packet
}

//
// CoAP request engine
//

#[test]
fn fetch_config_piggyback_response() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1234_04d2]);
    let mut engine = RequestEngine::new();

    let mut reply = response(CoapType::Ack, CoapCode::CONTENT, 0x04d2, &[0x12, 0x34]);
    reply.payload = Bytes::from_static(b"{}");
    transport.push_response(&reply);

    let out = engine.get(&mut transport, &mut rng, SERIAL).unwrap();
    assert_eq!(out.code, CoapCode::CONTENT);
    assert_eq!(&out.payload[..], b"{}");

    // exactly one datagram went out; a piggyback response needs no ACK
    assert_eq!(transport.sent.len(), 1);
    let request = transport.sent_packet(0);
    assert_eq!(request.kind, CoapType::Con);
    assert_eq!(request.code, CoapCode::GET);
    assert_eq!(request.message_id, 0x04d2);
    assert_eq!(&request.token[..], &[0x12, 0x34]);
    assert_eq!(
        request.option(URI_PATH).unwrap().value,
        SERIAL.as_bytes().to_vec()
    );
    assert!(request.option(CONTENT_FORMAT).is_none());
}

#[test]
fn fetch_config_separate_response() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1234_04d2]);
    let mut engine = RequestEngine::new();

    // empty ACK first, then the real response as CON under a fresh mid
    transport.push_response(&response(CoapType::Ack, CoapCode::EMPTY, 0x04d2, &[]));
    let mut reply = response(CoapType::Con, CoapCode::CONTENT, 0x07d0, &[0x12, 0x34]);
    reply.payload = Bytes::from_static(b"{}");
    transport.push_response(&reply);

    let out = engine.get(&mut transport, &mut rng, SERIAL).unwrap();
    assert_eq!(out.code, CoapCode::CONTENT);
    assert_eq!(&out.payload[..], b"{}");

    // the separate CON response is acknowledged under its own message id
    assert_eq!(transport.sent.len(), 2);
    let ack = transport.sent_packet(1);
    assert_eq!(ack.kind, CoapType::Ack);
    assert_eq!(ack.code, CoapCode::EMPTY);
    assert_eq!(ack.message_id, 0x07d0);
    assert!(ack.token.is_empty());
}

#[test]
fn direct_con_response_is_acked() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1234_04d2]);
    let mut engine = RequestEngine::new();

    transport.push_response(&response(
        CoapType::Con,
        CoapCode::CONTENT,
        0x04d2,
        &[0x12, 0x34],
    ));

    engine.get(&mut transport, &mut rng, SERIAL).unwrap();
    assert_eq!(transport.sent.len(), 2);
    let ack = transport.sent_packet(1);
    assert_eq!(ack.kind, CoapType::Ack);
    assert_eq!(ack.code, CoapCode::EMPTY);
    assert_eq!(ack.message_id, 0x04d2);
}

#[test]
fn block1_post_fragments_oversized_payload() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1335_04d2]);
    let mut engine = RequestEngine::new();

    let token = [0x13, 0x35];
    transport.push_response(&response(CoapType::Ack, CoapCode::CONTINUE, 0x04d2, &token));
    transport.push_response(&response(CoapType::Ack, CoapCode::CONTINUE, 0x04d3, &token));
    transport.push_response(&response(CoapType::Ack, CoapCode::CHANGED, 0x04d4, &token));

    let payload: Vec<u8> = (0..2600u32).map(|i| i as u8).collect();
    let out = engine
        .post(&mut transport, &mut rng, SERIAL, &payload)
        .unwrap();
    assert_eq!(out.code, CoapCode::CHANGED);

    assert_eq!(transport.sent.len(), 3);
    let expected = [
        // (num, more, payload length)
        (0u32, true, 1024usize),
        (1, true, 1024),
        (2, false, 552),
    ];
    for (n, (num, more, len)) in expected.iter().enumerate() {
        let request = transport.sent_packet(n);
        assert_eq!(request.code, CoapCode::POST);
        assert_eq!(request.message_id, 0x04d2 + n as u16);
        assert_eq!(&request.token[..], &token);
        assert_eq!(
            request.option(CONTENT_FORMAT).unwrap().uint_value(),
            Some(u32::from(OCTET_STREAM))
        );

        let block = Block1::parse(&request.option(BLOCK1).unwrap().value).unwrap();
        assert_eq!(block.num, *num);
        assert_eq!(block.more, *more);
        assert_eq!(block.szx, 6);
        assert_eq!(request.payload.len(), *len);

        // total size travels only on the first block
        match n {
            0 => assert_eq!(request.option(SIZE1).unwrap().uint_value(), Some(2600)),
            _ => assert!(request.option(SIZE1).is_none()),
        }
    }

    // reassemble and compare
    let mut reassembled = Vec::new();
    for n in 0..3 {
        reassembled.extend_from_slice(&transport.sent_packet(n).payload);
    }
    assert_eq!(reassembled, payload);
}

#[test]
fn block1_intermediate_must_continue() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1335_04d2]);
    let mut engine = RequestEngine::new();

    // final-looking answer to a non-final block
    transport.push_response(&response(
        CoapType::Ack,
        CoapCode::CHANGED,
        0x04d2,
        &[0x13, 0x35],
    ));

    let payload = vec![0u8; 1500];
    let err = engine
        .post(&mut transport, &mut rng, SERIAL, &payload)
        .unwrap_err();
    assert_eq!(err, RequestError::UnexpectedResponse(CoapCode::CHANGED));
    assert_eq!(transport.sent.len(), 1);
}

#[test]
fn small_post_is_a_single_exchange() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1335_04d2]);
    let mut engine = RequestEngine::new();

    transport.push_response(&response(
        CoapType::Ack,
        CoapCode::CHANGED,
        0x04d2,
        &[0x13, 0x35],
    ));

    engine
        .post(&mut transport, &mut rng, SERIAL, &[0xab; 14])
        .unwrap();
    assert_eq!(transport.sent.len(), 1);
    let request = transport.sent_packet(0);
    assert!(request.option(BLOCK1).is_none());
    assert!(request.option(SIZE1).is_none());
    assert_eq!(request.payload.len(), 14);
}

#[test]
fn retry_reuses_token_and_message_id() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1234_04d2]);
    let mut engine = RequestEngine::new();

    transport.push_timeout();
    let mut reply = response(CoapType::Ack, CoapCode::CONTENT, 0x04d2, &[0x12, 0x34]);
    reply.payload = Bytes::from_static(b"{}");
    transport.push_response(&reply);

    engine.get(&mut transport, &mut rng, SERIAL).unwrap();
    assert_eq!(transport.sent.len(), 2);
    assert_eq!(transport.sent[0], transport.sent[1]);
}

#[test]
fn malformed_response_is_retried() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1234_04d2]);
    let mut engine = RequestEngine::new();

    transport.push_raw(vec![0xde, 0xad, 0xbe]);
    let mut reply = response(CoapType::Ack, CoapCode::CONTENT, 0x04d2, &[0x12, 0x34]);
    reply.payload = Bytes::from_static(b"{}");
    transport.push_response(&reply);

    let out = engine.get(&mut transport, &mut rng, SERIAL).unwrap();
    assert_eq!(out.code, CoapCode::CONTENT);
    assert_eq!(transport.sent.len(), 2);
}

#[test]
fn mismatched_ids_exhaust_the_retry_budget() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1234_04d2]);
    let mut engine = RequestEngine::new();

    for _ in 0..3 {
        transport.push_response(&response(
            CoapType::Ack,
            CoapCode::CONTENT,
            0x9999,
            &[0x12, 0x34],
        ));
    }

    let err = engine.get(&mut transport, &mut rng, SERIAL).unwrap_err();
    assert_eq!(
        err,
        RequestError::IdMismatch {
            expected: 0x04d2,
            actual: 0x9999,
        }
    );
    assert_eq!(transport.sent.len(), 3);
    // id mismatches are not timeouts; no DNS fallback happened
    assert_eq!(transport.disconnects, 0);
}

#[test]
fn token_mismatch_fails_without_fallback() {
    subscribe();
    let mut transport = SimTransport::new();
    transport.dns = Some("10.11.12.13".to_owned());
    let mut rng = entropy(&[0x1234_04d2]);
    let mut engine = RequestEngine::new();

    for _ in 0..3 {
        transport.push_response(&response(
            CoapType::Ack,
            CoapCode::CONTENT,
            0x04d2,
            &[0xde, 0xad],
        ));
    }

    let err = engine.get(&mut transport, &mut rng, SERIAL).unwrap_err();
    assert_eq!(err, RequestError::TokenMismatch);
    assert_eq!(transport.disconnects, 0);
    assert_eq!(engine.endpoint().0, &EndpointAddr::Ip(DEFAULT_HOST));
}

#[test]
fn all_timeouts_trigger_dns_fallback() {
    subscribe();
    let mut transport = SimTransport::new();
    transport.dns = Some("10.11.12.13".to_owned());
    let mut rng = entropy(&[0x1234_04d2]);
    let mut engine = RequestEngine::new();

    for _ in 0..3 {
        transport.push_timeout();
    }
    let mut reply = response(CoapType::Ack, CoapCode::CONTENT, 0x04d2, &[0x12, 0x34]);
    reply.payload = Bytes::from_static(b"{}");
    transport.push_response(&reply);

    let out = engine.get(&mut transport, &mut rng, SERIAL).unwrap();
    assert_eq!(out.code, CoapCode::CONTENT);

    // reconnected against the resolved address and repeated the request
    assert_eq!(transport.sent.len(), 4);
    assert_eq!(transport.disconnects, 1);
    assert_eq!(transport.connects, 2);
    let resolved = EndpointAddr::Ip("10.11.12.13".parse().unwrap());
    assert_eq!(engine.endpoint().0, &resolved);
    assert_eq!(transport.connected_to, Some((resolved, 5683)));
}

#[test]
fn fallback_failure_surfaces_the_timeout() {
    subscribe();
    let mut transport = SimTransport::new();
    transport.dns = Some("10.11.12.13".to_owned());
    let mut rng = entropy(&[0x1234_04d2]);
    let mut engine = RequestEngine::new();

    let err = engine.get(&mut transport, &mut rng, SERIAL).unwrap_err();
    assert_eq!(err, RequestError::Transport(TransportError::Timeout));
    // three attempts against the default address, three after the fallback
    assert_eq!(transport.sent.len(), 6);
}

#[test]
fn fallback_only_from_the_default_endpoint() {
    subscribe();
    let mut transport = SimTransport::new();
    transport.dns = Some("10.11.12.13".to_owned());
    let mut rng = entropy(&[0x1234_04d2]);
    let mut engine = RequestEngine::new();
    engine.set_endpoint(EndpointAddr::Name("coap.example.org".to_owned()), 5683);

    let err = engine.get(&mut transport, &mut rng, SERIAL).unwrap_err();
    assert_eq!(err, RequestError::Transport(TransportError::Timeout));
    assert_eq!(transport.sent.len(), 3);
    assert_eq!(transport.disconnects, 0);
}

//
// Client flag semantics
//

#[test]
fn fetch_rejection_clears_server_registration_flag() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1234_04d2]);
    let mut client = UplinkClient::new(
        SimAtChannel::new(),
        SimClock::new(),
        SERIAL,
        SensorProfile::OutdoorFull,
    );

    transport.push_response(&response(
        CoapType::Ack,
        CoapCode::BAD_REQUEST,
        0x04d2,
        &[0x12, 0x34],
    ));

    let err = client
        .fetch_config(&mut transport, &mut rng, false)
        .unwrap_err();
    assert_eq!(err, RequestError::ErrorResponse(CoapCode::BAD_REQUEST));
    assert!(!client.last_fetch_succeeded());
    assert!(!client.is_registered_on_server());
    // a class-4 response is a soft failure; the connection stays up
    assert_eq!(transport.disconnects, 0);
}

#[test]
fn successful_fetch_restores_flags_and_disconnects() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1234_04d2]);
    let mut client = UplinkClient::new(
        SimAtChannel::new(),
        SimClock::new(),
        SERIAL,
        SensorProfile::OutdoorFull,
    );

    let mut reply = response(CoapType::Ack, CoapCode::CONTENT, 0x04d2, &[0x12, 0x34]);
    reply.payload = Bytes::from_static(b"{\"interval\":5}");
    transport.push_response(&reply);

    let config = client.fetch_config(&mut transport, &mut rng, false).unwrap();
    assert_eq!(&config[..], b"{\"interval\":5}");
    assert!(client.last_fetch_succeeded());
    assert!(client.is_registered_on_server());
    assert_eq!(transport.disconnects, 1);
}

#[test]
fn keep_connection_leaves_socket_up() {
    subscribe();
    let mut transport = SimTransport::new();
    let mut rng = entropy(&[0x1335_04d2, 0x1335_04d3]);
    let mut client = UplinkClient::new(
        SimAtChannel::new(),
        SimClock::new(),
        SERIAL,
        SensorProfile::OutdoorFull,
    );

    transport.push_response(&response(
        CoapType::Ack,
        CoapCode::CHANGED,
        0x04d2,
        &[0x13, 0x35],
    ));
    client
        .post_raw_measures(&mut transport, &mut rng, &[1, 2, 3], true)
        .unwrap();
    assert!(client.last_post_succeeded());
    assert_eq!(transport.disconnects, 0);
    assert_eq!(transport.connects, 1);

    // the next request reuses the connection
    transport.push_response(&response(
        CoapType::Ack,
        CoapCode::CHANGED,
        0x04d3,
        &[0x13, 0x35],
    ));
    client
        .post_raw_measures(&mut transport, &mut rng, &[4, 5, 6], false)
        .unwrap();
    assert_eq!(transport.connects, 1);
    assert_eq!(transport.disconnects, 1);
}

#[test]
fn hard_transport_failure_clears_client_ready() {
    subscribe();
    let mut at = SimAtChannel::new();
    script_happy_modem(&mut at);
    let mut client = UplinkClient::new(at, SimClock::new(), SERIAL, SensorProfile::OutdoorFull);
    client.set_registration_timeout(Duration::from_secs(600));
    client.begin().unwrap();
    assert!(client.is_client_ready());
    assert_eq!(client.iccid(), Some("89882390000446917853"));

    let mut transport = SimTransport::new();
    for _ in 0..3 {
        transport.incoming.push_back(Incoming::Error);
    }
    let mut rng = entropy(&[0x1234_04d2]);
    let err = client
        .fetch_config(&mut transport, &mut rng, false)
        .unwrap_err();
    assert_eq!(err, RequestError::Transport(TransportError::Io));
    assert!(!client.is_client_ready());
    assert!(!client.last_fetch_succeeded());
}

//
// Registration state machine
//

const SCAN_TWO_OPERATORS: &str = "\r\n+COPS: (2,\"First Net\",\"First\",\"26201\",7),(1,\"Second Net\",\"Second\",\"26202\",7),,(0,1,2,3,4),(0,1,2)\r\n\r\nOK\r\n";

fn script_happy_modem(at: &mut SimAtChannel) {
    at.on("+CPIN?", &["\r\n+CPIN: READY\r\n\r\nOK\r\n"]);
    at.on("+CICCID", &["\r\n+ICCID: 89882390000446917853\r\n\r\nOK\r\n"]);
    at.on("+COPS=?", &[SCAN_TWO_OPERATORS]);
    at.on(
        "+CREG?",
        &[
            "\r\n+CREG: 0,2\r\n\r\nOK\r\n",
            "\r\n+CREG: 0,1\r\n\r\nOK\r\n",
        ],
    );
    at.on("+CSQ", &["\r\n+CSQ: 25,99\r\n\r\nOK\r\n"]);
    at.on("+CNSMOD?", &["\r\n+CNSMOD: 0,8\r\n\r\nOK\r\n"]);
    at.on("+CGATT?", &["\r\n+CGATT: 1\r\n\r\nOK\r\n"]);
    at.on("+CGPADDR=1", &["\r\n+CGPADDR: 1,10.82.4.117\r\n\r\nOK\r\n"]);
}

fn lte_session(at: SimAtChannel) -> ModemSession<SimAtChannel, SimClock> {
    ModemSession::new(at, SimClock::new())
}

#[test]
fn registration_happy_path() {
    subscribe();
    let mut at = SimAtChannel::new();
    script_happy_modem(&mut at);
    at.on("+CEREG?", &["\r\n+CEREG: 0,1\r\n\r\nOK\r\n"]);

    let mut session = lte_session(at);
    session
        .register(
            CellTechnology::Lte,
            "internet",
            Duration::from_secs(600),
            Duration::from_secs(600),
        )
        .unwrap();

    assert_eq!(session.current_plmn(), 26201);
    assert_eq!(session.serialized_operators(), "26201:7,26202:7");

    let at = session.channel();
    assert_eq!(at.sent_count("+CNMP=38"), 1);
    assert_eq!(at.sent_count("+CEREG=0"), 1);
    assert!(at.sent.contains(&"+CGDCONT=1,\"IP\",\"internet\"".to_owned()));
    assert!(at.sent.contains(&"+COPS=1,2,\"26201\",7".to_owned()));
    assert_eq!(at.sent_count("+CGACT=1,1"), 1);
}

#[test]
fn weak_signal_advances_to_next_operator() {
    subscribe();
    let mut at = SimAtChannel::new();
    script_happy_modem(&mut at);
    at.on("+CEREG?", &["\r\n+CEREG: 0,1\r\n\r\nOK\r\n"]);
    // first operator registers with an unusable signal
    at.replace(
        "+CSQ",
        &["\r\n+CSQ: 5,99\r\n\r\nOK\r\n", "\r\n+CSQ: 25,99\r\n\r\nOK\r\n"],
    );

    let mut session = lte_session(at);
    session
        .register(
            CellTechnology::Lte,
            "internet",
            Duration::from_secs(600),
            Duration::from_secs(600),
        )
        .unwrap();

    assert_eq!(session.current_plmn(), 26202);
    let at = session.channel();
    assert!(at.sent.contains(&"+COPS=1,2,\"26201\",7".to_owned()));
    assert!(at.sent.contains(&"+COPS=1,2,\"26202\",7".to_owned()));
}

#[test]
fn transient_denial_recovers_during_confirmation() {
    subscribe();
    let mut at = SimAtChannel::new();
    script_happy_modem(&mut at);
    at.on(
        "+CEREG?",
        &[
            "\r\n+CEREG: 0,3\r\n\r\nOK\r\n",
            "\r\n+CEREG: 0,1\r\n\r\nOK\r\n",
        ],
    );

    let mut session = lte_session(at);
    session
        .register(
            CellTechnology::Lte,
            "internet",
            Duration::from_secs(600),
            Duration::from_secs(600),
        )
        .unwrap();

    // the denial was transient; the first operator carried registration
    assert_eq!(session.current_plmn(), 26201);
    assert_eq!(session.channel().sent_count("+COPS=1"), 1);
}

#[test]
fn persistent_denial_exhausts_operator_list() {
    subscribe();
    let mut at = SimAtChannel::new();
    script_happy_modem(&mut at);
    at.on("+CEREG?", &["\r\n+CEREG: 0,3\r\n\r\nOK\r\n"]);

    let mut session = lte_session(at);
    let err = session
        .register(
            CellTechnology::Lte,
            "internet",
            Duration::from_secs(3600),
            Duration::from_secs(600),
        )
        .unwrap_err();
    assert_eq!(err, RegistrationError::OperatorsExhausted);

    // two recovery resets happen before the third pass gives up
    assert!(session.operators().is_empty());
    assert_eq!(session.current_plmn(), 0);
    assert_eq!(session.channel().sent_count("+CRESET"), 2);
}

#[test]
fn unregistered_operator_times_out_and_list_exhausts() {
    subscribe();
    let mut at = SimAtChannel::new();
    script_happy_modem(&mut at);
    // searching forever
    at.on("+CEREG?", &["\r\n+CEREG: 0,2\r\n\r\nOK\r\n"]);

    let mut session = lte_session(at);
    let err = session
        .register(
            CellTechnology::Lte,
            "internet",
            Duration::from_secs(3600),
            Duration::from_secs(600),
        )
        .unwrap_err();
    assert_eq!(err, RegistrationError::OperatorsExhausted);
    // every pass walked both scanned operators
    assert_eq!(session.channel().sent_count("+COPS=1"), 6);
}

#[test]
fn persisted_operator_tried_first() {
    subscribe();
    let mut at = SimAtChannel::new();
    script_happy_modem(&mut at);
    at.on("+CEREG?", &["\r\n+CEREG: 0,1\r\n\r\nOK\r\n"]);

    let mut session = lte_session(at);
    session.load_operators("26201:7,26202:7", 26202);
    session
        .register(
            CellTechnology::Lte,
            "internet",
            Duration::from_secs(600),
            Duration::from_secs(600),
        )
        .unwrap();

    assert_eq!(session.current_plmn(), 26202);
    let at = session.channel();
    // the list came from persisted state, so no scan ran, and the saved
    // operator was selected directly
    assert_eq!(at.sent_count("+COPS=?"), 0);
    assert_eq!(at.sent_count("+COPS=1"), 1);
    assert!(at.sent.contains(&"+COPS=1,2,\"26202\",7".to_owned()));
}

#[test]
fn no_service_falls_back_to_registration_checks() {
    subscribe();
    let mut at = SimAtChannel::new();
    script_happy_modem(&mut at);
    at.on("+CEREG?", &["\r\n+CEREG: 0,1\r\n\r\nOK\r\n"]);
    at.replace("+CNSMOD?", &["\r\n+CNSMOD: 0,0\r\n\r\nOK\r\n"]);

    let mut session = lte_session(at);
    let err = session
        .register(
            CellTechnology::Lte,
            "internet",
            Duration::from_secs(120),
            Duration::from_secs(600),
        )
        .unwrap_err();
    assert_eq!(err, RegistrationError::OperationTimeout);

    // the 30s service budget expired at least once and registration was
    // re-checked before the operation deadline ended the run
    let at = session.channel();
    assert!(at.sent_count("+CNSMOD?") > 30);
    assert!(at.sent_count("+CEREG?") >= 2);
}

#[test]
fn modem_power_cycle_when_reset_rejected() {
    subscribe();
    let mut at = SimAtChannel::new();
    at.on("+CRESET", &["\r\nERROR\r\n"]);
    let mut session = ModemSession::with_power_pin(at, SimClock::new(), SimPowerPin::default());
    session.hard_reset();

    assert_eq!(session.channel().sent_count("+CRESET"), 1);
    // forced off pulse, then the power-on key sequence
    let pin = session.power_pin().unwrap();
    assert_eq!(pin.transitions, vec![true, false, false, true, false]);
}
