mod helpers;

use std::time::Duration;

use helpers::{session, session_with_nodes, wait_until, Reply};
use icolink::identifier::{block, configuration, eeprom, product_data, system};
use icolink::{
    send_and_await, DriverError, Frame, Identifier, ProtocolError, RetryPolicy, SPU1, STH1,
};

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_millis(20))
}

#[test]
fn command_is_acknowledged() {
    let (session, node) = session();
    let entry = session
        .send_command(
            STH1,
            block::SYSTEM,
            system::GET_SET_STATE,
            &[0],
            &RetryPolicy::default(),
        )
        .unwrap();

    let request = Identifier::request(block::SYSTEM, system::GET_SET_STATE, SPU1, STH1);
    assert_eq!(entry.frame.identifier, request.ack());
    assert_eq!(entry.frame.payload(), &[0]);
    assert_eq!(node.writes().len(), 1);
}

#[test]
fn retries_are_bounded() {
    let (session, node) = session();
    node.reply(block::PRODUCT_DATA, product_data::GTIN, Reply::Silent);

    let err = session
        .send_command(STH1, block::PRODUCT_DATA, product_data::GTIN, &[], &fast_policy(2))
        .unwrap_err();

    assert!(matches!(
        err,
        DriverError::Protocol(ProtocolError::RetriesExceeded { attempts: 3, .. })
    ));
    assert!(err.requires_reconnect());
    assert!(!err.is_retryable());
    assert_eq!(node.writes().len(), 3);
}

#[test]
fn self_addressed_request_fails_fast() {
    let (session, node) = session_with_nodes(STH1, STH1);
    let err = session
        .send_command(STH1, block::SYSTEM, system::RESET, &[], &fast_policy(5))
        .unwrap_err();

    assert!(matches!(
        err,
        DriverError::Protocol(ProtocolError::Unroutable { .. })
    ));
    // Sent once, never retried.
    assert_eq!(node.writes().len(), 1);
}

#[test]
fn error_acknowledgement_is_returned() {
    let (session, node) = session();
    node.reply(
        block::PRODUCT_DATA,
        product_data::FIRMWARE_VERSION,
        Reply::ErrorAck(vec![0xFF]),
    );

    let entry = session
        .send_command(
            STH1,
            block::PRODUCT_DATA,
            product_data::FIRMWARE_VERSION,
            &[],
            &fast_policy(0),
        )
        .unwrap();
    assert!(entry.frame.identifier.error);
    assert_eq!(entry.frame.payload(), &[0xFF]);

    let err = session.firmware_version(STH1).unwrap_err();
    assert!(matches!(
        err,
        DriverError::Protocol(ProtocolError::Rejected { .. })
    ));
}

#[test]
fn timeout_below_floor_is_rejected_before_sending() {
    let (session, node) = session();
    let policy = RetryPolicy::new(3, Duration::from_millis(2));
    let err = session
        .send_command(STH1, block::SYSTEM, system::RESET, &[], &policy)
        .unwrap_err();
    assert!(matches!(err, DriverError::Config(_)));
    assert!(node.writes().is_empty());
}

#[test]
fn acknowledgements_logged_before_the_request_are_ignored() {
    let (session, node) = session();
    let request = Identifier::request(block::SYSTEM, system::GET_SET_STATE, SPU1, STH1);
    node.inject(Frame::new(request.ack(), &[0xEE]).unwrap());
    wait_until(|| session.index() == 1);

    let entry = session
        .send_command(STH1, block::SYSTEM, system::GET_SET_STATE, &[2], &fast_policy(0))
        .unwrap();
    assert_eq!(entry.frame.payload(), &[2]);
}

#[test]
fn expected_payload_must_prefix_the_reply() {
    let (session, _node) = session();
    let request = Identifier::request(block::SYSTEM, system::GET_SET_STATE, SPU1, STH1);
    let frame = Frame::new(request, &[2, 7]).unwrap();

    let entry = send_and_await(session.transport(), &frame, &fast_policy(0), Some(&[2])).unwrap();
    assert_eq!(entry.frame.payload(), &[2, 7]);

    let err = send_and_await(session.transport(), &frame, &fast_policy(0), Some(&[3])).unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn closed_session_refuses_to_send() {
    let (mut session, _node) = session();
    session.close();
    let err = session
        .send_command(STH1, block::SYSTEM, system::RESET, &[], &fast_policy(0))
        .unwrap_err();
    assert!(err.requires_reconnect());
}

#[test]
fn concurrent_commands_each_get_their_own_reply() {
    let (session, node) = session();
    let commands = [
        (block::SYSTEM, system::GET_SET_STATE),
        (block::PRODUCT_DATA, product_data::GTIN),
        (block::CONFIGURATION, configuration::ADC),
        (block::EEPROM, eeprom::READ),
    ];

    std::thread::scope(|scope| {
        for (tag, &(block, command)) in commands.iter().enumerate() {
            let session = &session;
            scope.spawn(move || {
                let request = Identifier::request(block, command, SPU1, STH1);
                for round in 0..50u8 {
                    let payload = [tag as u8, round];
                    let entry = session
                        .send_command(STH1, block, command, &payload, &RetryPolicy::default())
                        .unwrap();
                    assert_eq!(entry.frame.identifier, request.ack());
                    assert_eq!(entry.frame.payload(), &payload);
                }
            });
        }
    });

    assert_eq!(node.writes().len(), commands.len() * 50);
}
