mod helpers;

use helpers::{session, Reply};
use icolink::identifier::{block, configuration, eeprom, product_data, statistical_data, system};
use icolink::{
    AdcConfig, CalibrationFactor, DriverError, NodeState, PowerCycles, ProtocolError, Version,
    STH1, STU1,
};

#[test]
fn firmware_version_from_reply() {
    let (session, node) = session();
    node.reply(
        block::PRODUCT_DATA,
        product_data::FIRMWARE_VERSION,
        Reply::Ack(vec![0, 0, 0, 0, 0, 2, 1, 10]),
    );
    let version = session.firmware_version(STH1).unwrap();
    assert_eq!(
        version,
        Version {
            major: 2,
            minor: 1,
            patch: 10
        }
    );
}

#[test]
fn short_version_reply_is_malformed() {
    let (session, node) = session();
    node.reply(
        block::PRODUCT_DATA,
        product_data::HARDWARE_VERSION,
        Reply::Ack(vec![1, 2]),
    );
    assert!(matches!(
        session.hardware_version(STH1),
        Err(DriverError::Protocol(ProtocolError::Malformed(_)))
    ));
}

#[test]
fn rejected_command() {
    let (session, node) = session();
    node.reply(block::SYSTEM, system::RESET, Reply::ErrorAck(vec![0x01]));
    let err = session.reset_node(STH1).unwrap_err();
    match err {
        DriverError::Protocol(ProtocolError::Rejected {
            identifier,
            payload,
        }) => {
            assert_eq!(identifier.command, system::RESET);
            assert!(identifier.request);
            assert_eq!(payload, vec![0x01]);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn node_state_masks_set_bit() {
    let (session, node) = session();
    node.reply(block::SYSTEM, system::GET_SET_STATE, Reply::Ack(vec![0x82]));
    assert_eq!(session.node_state(STH1).unwrap(), NodeState::Operating);
}

#[test]
fn adc_configuration_is_echoed() {
    let (session, node) = session();
    let adc = AdcConfig {
        prescaler: 4,
        acquisition_time: 16,
        oversampling: 128,
        reference_mv: 1250,
    };
    assert_eq!(session.set_adc_config(STH1, &adc).unwrap(), adc);

    let request = node.writes().pop().unwrap();
    assert_eq!(request.identifier.block, block::CONFIGURATION);
    assert_eq!(request.payload(), &[0x80, 0, 4, 5, 7, 25, 0, 0]);

    node.reply(
        block::CONFIGURATION,
        configuration::ADC,
        Reply::Ack(AdcConfig::default().to_payload(false).unwrap().to_vec()),
    );
    assert_eq!(session.adc_config(STH1).unwrap(), AdcConfig::default());
}

#[test]
fn adc_configuration_mismatch() {
    let (session, node) = session();
    node.reply(
        block::CONFIGURATION,
        configuration::ADC,
        Reply::Ack(vec![0x80, 0, 9, 4, 6, 66, 0, 0]),
    );
    let err = session.set_adc_config(STH1, &AdcConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        DriverError::Protocol(ProtocolError::PayloadMismatch { .. })
    ));
}

#[test]
fn invalid_adc_configuration_is_not_sent() {
    let (session, node) = session();
    let adc = AdcConfig {
        oversampling: 3,
        ..AdcConfig::default()
    };
    assert!(matches!(
        session.set_adc_config(STH1, &adc),
        Err(DriverError::Config(_))
    ));
    assert!(node.writes().is_empty());
}

#[test]
fn calibration_factor_roundtrip() {
    let (session, node) = session();
    node.reply(
        block::CONFIGURATION,
        configuration::CALIBRATION_FACTOR_K,
        Reply::With(|req| {
            let mut reply = vec![req[0], 0, 0, 0];
            reply.extend_from_slice(&1.5f32.to_le_bytes());
            reply
        }),
    );
    let k = session
        .calibration_factor(STH1, CalibrationFactor::K, 1)
        .unwrap();
    assert_eq!(k, 1.5);

    // D is echoed by default.
    session
        .set_calibration_factor(STH1, CalibrationFactor::D, 2, -0.25)
        .unwrap();
    let request = node.writes().pop().unwrap();
    assert_eq!(request.identifier.command, configuration::CALIBRATION_FACTOR_D);
    assert_eq!(&request.payload()[..2], &[2, 0x80]);
    assert_eq!(&request.payload()[4..], &(-0.25f32).to_le_bytes());
}

#[test]
fn eeprom_is_read_in_chunks() {
    let (session, node) = session();
    // Every byte holds its own offset.
    node.reply(
        block::EEPROM,
        eeprom::READ,
        Reply::With(|req| {
            let mut reply = req[..4].to_vec();
            reply.extend((0..req[2]).map(|i| req[1] + i));
            reply
        }),
    );
    let data = session.read_eeprom(STH1, 0, 10, 6).unwrap();
    assert_eq!(data, vec![10, 11, 12, 13, 14, 15]);
    assert_eq!(node.writes().len(), 2);
}

#[test]
fn eeprom_is_written_in_chunks() {
    let (session, node) = session();
    session
        .write_eeprom(STH1, 1, 8, &[1, 2, 3, 4, 5, 6])
        .unwrap();
    let writes = node.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].payload(), &[1, 8, 4, 0, 1, 2, 3, 4]);
    assert_eq!(writes[1].payload(), &[1, 12, 2, 0, 5, 6]);
}

#[test]
fn eeprom_access_across_page_end_is_refused() {
    let (session, node) = session();
    assert!(matches!(
        session.read_eeprom(STH1, 0, 250, 10),
        Err(DriverError::Config(_))
    ));
    assert!(node.writes().is_empty());
}

#[test]
fn serial_number_spans_four_requests() {
    let (session, node) = session();
    node.reply(
        block::PRODUCT_DATA,
        product_data::SERIAL_NUMBER_1,
        Reply::Ack(b"SN-00042".to_vec()),
    );
    for command in product_data::SERIAL_NUMBER_1 + 1..product_data::SERIAL_NUMBER_1 + 4 {
        node.reply(block::PRODUCT_DATA, command, Reply::Ack(vec![0; 8]));
    }
    assert_eq!(session.serial_number(STH1).unwrap(), "SN-00042");
    assert_eq!(node.writes().len(), 4);
}

#[test]
fn power_cycle_counters() {
    let (session, node) = session();
    node.reply(
        block::STATISTICAL_DATA,
        statistical_data::POWER_ON_OFF,
        Reply::Ack(vec![12, 0, 0, 0, 11, 0, 0, 0]),
    );
    assert_eq!(
        session.power_cycles(STH1).unwrap(),
        PowerCycles {
            power_on: 12,
            power_off: 11
        }
    );
}

#[test]
fn bridge_relays_radio_queries() {
    let (session, node) = session();
    node.reply(
        block::SYSTEM,
        system::BLUETOOTH,
        Reply::With(|req| match req[0] {
            // MAC address, least significant byte first
            0x11 => vec![req[0], req[1], 0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
            // RSSI
            0x0C => vec![req[0], req[1], (-60i8) as u8],
            _ => req.to_vec(),
        }),
    );

    let mac = session.bluetooth_mac_address(STU1, 0).unwrap();
    assert_eq!(mac, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    assert_eq!(session.bluetooth_rssi(STU1, 0).unwrap(), -60);
    session.bluetooth_activate(STU1).unwrap();

    let writes = node.writes();
    assert_eq!(writes.len(), 3);
    assert!(writes.iter().all(|w| w.identifier.receiver == STU1));
}
