//! Typed commands on top of [`Session::send_command`].
//!
//! Replies share a few conventions: multi-byte integers are little endian,
//! version triples occupy the last three payload bytes, and text fields are
//! ASCII padded with NUL bytes. Radio relay commands go to a bridge node and
//! carry a sub-command in byte 0 and the device number in byte 1, followed by
//! the data.

use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};
use crate::identifier::{
    block, bluetooth, configuration, eeprom, product_data, statistical_data, system,
};
use crate::request::RetryPolicy;
use crate::session::Session;
use crate::streaming::AdcConfig;

/// Data bytes carried by one EEPROM frame.
pub const EEPROM_CHUNK: usize = 4;

/// Size of one EEPROM page.
pub const EEPROM_PAGE_SIZE: usize = 256;

const SET_BIT: u8 = 0x80;

// ============================================================================
// Reply types
// ============================================================================

/// Operating state reported by a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Startup,
    Operating,
    Bootloader,
    Error,
    Unknown(u8),
}

impl NodeState {
    fn from_code(code: u8) -> Self {
        match code {
            1 => NodeState::Startup,
            2 => NodeState::Operating,
            3 => NodeState::Bootloader,
            4 => NodeState::Error,
            other => NodeState::Unknown(other),
        }
    }
}

/// Hardware or firmware version triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCycles {
    pub power_on: u32,
    pub power_off: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingTime {
    pub since_reset: Duration,
    pub total: Duration,
}

/// Linear calibration `value = k * raw + d`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalibrationFactor {
    K,
    D,
}

impl CalibrationFactor {
    fn command(self) -> u8 {
        match self {
            CalibrationFactor::K => configuration::CALIBRATION_FACTOR_K,
            CalibrationFactor::D => configuration::CALIBRATION_FACTOR_D,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationMethod {
    Inject = 1,
    Eject = 2,
    Measure = 3,
}

/// Reference elements a node can switch onto its ADC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationElement {
    Temperature = 1,
    Voltage = 2,
    Vss = 3,
    Avdd = 4,
    RegulatedInternalPower = 5,
    OpAmp2Output = 6,
}

/// One calibration measurement request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationMeasurement {
    pub method: CalibrationMethod,
    pub element: CalibrationElement,
    /// Axis (channel) the element is switched to, 1 based.
    pub axis: u8,
    /// ADC reference voltage in millivolts.
    pub reference_mv: u16,
}

impl CalibrationMeasurement {
    fn to_payload(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        payload[0] = SET_BIT | ((self.method as u8) << 5) | (self.element as u8 & 0x1F);
        payload[1] = self.axis;
        payload[2] = (self.reference_mv / 50) as u8;
        payload
    }
}

// ============================================================================
// Reply parsing
// ============================================================================

fn require_len(payload: &[u8], len: usize, what: &str) -> Result<()> {
    if payload.len() < len {
        return Err(ProtocolError::Malformed(format!(
            "{what} needs {len} bytes, got {}",
            payload.len()
        ))
        .into());
    }
    Ok(())
}

fn u32_at(payload: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

/// ASCII text with trailing NUL padding removed.
pub(crate) fn text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

fn version_of(payload: &[u8], what: &str) -> Result<Version> {
    require_len(payload, 8, what)?;
    Ok(Version {
        major: payload[5],
        minor: payload[6],
        patch: payload[7],
    })
}

fn check_echo(expected: &[u8], actual: &[u8]) -> Result<()> {
    if !actual.starts_with(expected) {
        return Err(ProtocolError::PayloadMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
        .into());
    }
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

impl Session {
    /// Send a command with the default policy and return the reply payload.
    ///
    /// An error acknowledgement becomes [`ProtocolError::Rejected`].
    fn query(&self, receiver: u8, block: u8, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let entry = self.send_command(receiver, block, command, payload, &RetryPolicy::default())?;
        let reply = entry.frame;
        if reply.identifier.error {
            return Err(ProtocolError::Rejected {
                identifier: self.request_id(receiver, block, command),
                payload: reply.payload().to_vec(),
            }
            .into());
        }
        Ok(reply.payload().to_vec())
    }

    fn concat_text(&self, receiver: u8, block: u8, first: u8, count: u8) -> Result<String> {
        let mut bytes = Vec::with_capacity(8 * count as usize);
        for command in first..first + count {
            bytes.extend(self.query(receiver, block, command, &[])?);
        }
        Ok(text(&bytes))
    }

    // ------------------------------------------------------------------------
    // System
    // ------------------------------------------------------------------------

    /// Restart a node. It comes back in the startup state.
    pub fn reset_node(&self, receiver: u8) -> Result<()> {
        self.query(receiver, block::SYSTEM, system::RESET, &[])?;
        info!("node {receiver} reset");
        Ok(())
    }

    pub fn node_state(&self, receiver: u8) -> Result<NodeState> {
        let reply = self.query(receiver, block::SYSTEM, system::GET_SET_STATE, &[0])?;
        require_len(&reply, 1, "node state")?;
        Ok(NodeState::from_code(reply[0] & 0x7F))
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn adc_config(&self, receiver: u8) -> Result<AdcConfig> {
        let reply = self.query(receiver, block::CONFIGURATION, configuration::ADC, &[0; 8])?;
        AdcConfig::from_payload(&reply)
    }

    /// Write `adc` and check that the node echoes it back unchanged.
    pub fn set_adc_config(&self, receiver: u8, adc: &AdcConfig) -> Result<AdcConfig> {
        let payload = adc.to_payload(true)?;
        let reply = self.query(receiver, block::CONFIGURATION, configuration::ADC, &payload)?;
        require_len(&reply, 6, "ADC configuration")?;
        check_echo(&payload[2..6], &reply[2..6])?;
        debug!("node {receiver} ADC configuration set to {adc:?}");
        AdcConfig::from_payload(&reply)
    }

    pub fn calibration_factor(
        &self,
        receiver: u8,
        factor: CalibrationFactor,
        axis: u8,
    ) -> Result<f32> {
        let reply = self.query(receiver, block::CONFIGURATION, factor.command(), &[axis, 0, 0, 0])?;
        require_len(&reply, 8, "calibration factor")?;
        Ok(f32::from_bits(u32_at(&reply, 4)))
    }

    pub fn set_calibration_factor(
        &self,
        receiver: u8,
        factor: CalibrationFactor,
        axis: u8,
        value: f32,
    ) -> Result<()> {
        let mut payload = [axis, SET_BIT, 0, 0, 0, 0, 0, 0];
        payload[4..].copy_from_slice(&value.to_le_bytes());
        let reply = self.query(receiver, block::CONFIGURATION, factor.command(), &payload)?;
        check_echo(&payload, &reply)
    }

    /// Switch a reference element onto the ADC (or measure it) and return the
    /// raw reading.
    pub fn calibration_measurement(
        &self,
        receiver: u8,
        measurement: &CalibrationMeasurement,
    ) -> Result<u16> {
        let reply = self.query(
            receiver,
            block::CONFIGURATION,
            configuration::CALIBRATE_MEASUREMENT,
            &measurement.to_payload(),
        )?;
        require_len(&reply, 6, "calibration measurement")?;
        Ok(u16::from_le_bytes([reply[4], reply[5]]))
    }

    // ------------------------------------------------------------------------
    // EEPROM
    // ------------------------------------------------------------------------

    fn check_eeprom_span(offset: u8, len: usize) -> Result<()> {
        if offset as usize + len > EEPROM_PAGE_SIZE {
            return Err(crate::DriverError::Config(format!(
                "{len} bytes at offset {offset} cross the EEPROM page end"
            )));
        }
        Ok(())
    }

    /// Read `len` bytes of an EEPROM page, four bytes per request.
    pub fn read_eeprom(&self, receiver: u8, page: u8, offset: u8, len: usize) -> Result<Vec<u8>> {
        Self::check_eeprom_span(offset, len)?;
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let at = offset as usize + data.len();
            let chunk = (len - data.len()).min(EEPROM_CHUNK);
            let reply = self.query(
                receiver,
                block::EEPROM,
                eeprom::READ,
                &[page, at as u8, chunk as u8, 0],
            )?;
            require_len(&reply, 4 + chunk, "EEPROM read")?;
            data.extend_from_slice(&reply[4..4 + chunk]);
        }
        Ok(data)
    }

    /// Write `data` to an EEPROM page, four bytes per request.
    pub fn write_eeprom(&self, receiver: u8, page: u8, offset: u8, data: &[u8]) -> Result<()> {
        Self::check_eeprom_span(offset, data.len())?;
        for (n, chunk) in data.chunks(EEPROM_CHUNK).enumerate() {
            let at = offset as usize + n * EEPROM_CHUNK;
            let mut payload = vec![page, at as u8, chunk.len() as u8, 0];
            payload.extend_from_slice(chunk);
            let reply = self.query(receiver, block::EEPROM, eeprom::WRITE, &payload)?;
            check_echo(&payload, &reply)?;
        }
        debug!("wrote {} bytes to page {page} of node {receiver}", data.len());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Product data
    // ------------------------------------------------------------------------

    /// Global trade item number.
    pub fn gtin(&self, receiver: u8) -> Result<u64> {
        let reply = self.query(receiver, block::PRODUCT_DATA, product_data::GTIN, &[])?;
        require_len(&reply, 8, "GTIN")?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&reply[..8]);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn hardware_version(&self, receiver: u8) -> Result<Version> {
        let reply = self.query(receiver, block::PRODUCT_DATA, product_data::HARDWARE_VERSION, &[])?;
        version_of(&reply, "hardware version")
    }

    pub fn firmware_version(&self, receiver: u8) -> Result<Version> {
        let reply = self.query(receiver, block::PRODUCT_DATA, product_data::FIRMWARE_VERSION, &[])?;
        version_of(&reply, "firmware version")
    }

    pub fn release_name(&self, receiver: u8) -> Result<String> {
        let reply = self.query(receiver, block::PRODUCT_DATA, product_data::RELEASE_NAME, &[])?;
        Ok(text(&reply))
    }

    /// Serial number, spread over four requests of eight characters.
    pub fn serial_number(&self, receiver: u8) -> Result<String> {
        self.concat_text(receiver, block::PRODUCT_DATA, product_data::SERIAL_NUMBER_1, 4)
    }

    /// Product name, spread over eight requests of eight characters.
    pub fn product_name(&self, receiver: u8) -> Result<String> {
        self.concat_text(receiver, block::PRODUCT_DATA, product_data::NAME_1, 8)
    }

    // ------------------------------------------------------------------------
    // Statistical data
    // ------------------------------------------------------------------------

    pub fn power_cycles(&self, receiver: u8) -> Result<PowerCycles> {
        let reply = self.query(
            receiver,
            block::STATISTICAL_DATA,
            statistical_data::POWER_ON_OFF,
            &[],
        )?;
        require_len(&reply, 8, "power cycles")?;
        Ok(PowerCycles {
            power_on: u32_at(&reply, 0),
            power_off: u32_at(&reply, 4),
        })
    }

    pub fn operating_time(&self, receiver: u8) -> Result<OperatingTime> {
        let reply = self.query(
            receiver,
            block::STATISTICAL_DATA,
            statistical_data::OPERATING_TIME,
            &[],
        )?;
        require_len(&reply, 8, "operating time")?;
        Ok(OperatingTime {
            since_reset: Duration::from_secs(u32_at(&reply, 0) as u64),
            total: Duration::from_secs(u32_at(&reply, 4) as u64),
        })
    }

    // ------------------------------------------------------------------------
    // Radio relay (bridge nodes)
    // ------------------------------------------------------------------------

    fn relay(&self, bridge: u8, subcommand: u8, device: u8) -> Result<Vec<u8>> {
        let reply = self.query(
            bridge,
            block::SYSTEM,
            system::BLUETOOTH,
            &[subcommand, device, 0, 0, 0, 0, 0, 0],
        )?;
        require_len(&reply, 3, "radio relay reply")?;
        Ok(reply)
    }

    /// Power up the radio of a bridge node and start scanning.
    pub fn bluetooth_activate(&self, bridge: u8) -> Result<()> {
        self.relay(bridge, bluetooth::ACTIVATE, 0)?;
        Ok(())
    }

    /// Sensor nodes found by the last scan.
    pub fn bluetooth_device_count(&self, bridge: u8) -> Result<u8> {
        Ok(self.relay(bridge, bluetooth::DEVICE_COUNT, 0)?[2])
    }

    pub fn bluetooth_device_name(&self, bridge: u8, device: u8) -> Result<String> {
        let mut bytes = self.relay(bridge, bluetooth::DEVICE_NAME_1, device)?[2..].to_vec();
        bytes.extend_from_slice(&self.relay(bridge, bluetooth::DEVICE_NAME_2, device)?[2..]);
        Ok(text(&bytes))
    }

    pub fn bluetooth_connect_device(&self, bridge: u8, device: u8) -> Result<()> {
        self.relay(bridge, bluetooth::CONNECT_DEVICE, device)?;
        info!("bridge {bridge} connecting to device {device}");
        Ok(())
    }

    pub fn bluetooth_is_connected(&self, bridge: u8) -> Result<bool> {
        Ok(self.relay(bridge, bluetooth::CHECK_CONNECTED, 0)?[2] != 0)
    }

    pub fn bluetooth_disconnect(&self, bridge: u8) -> Result<()> {
        self.relay(bridge, bluetooth::DISCONNECT, 0)?;
        Ok(())
    }

    /// Received signal strength in dBm.
    pub fn bluetooth_rssi(&self, bridge: u8, device: u8) -> Result<i8> {
        Ok(self.relay(bridge, bluetooth::RSSI, device)?[2] as i8)
    }

    /// Radio MAC address, most significant byte first.
    pub fn bluetooth_mac_address(&self, bridge: u8, device: u8) -> Result<[u8; 6]> {
        let reply = self.relay(bridge, bluetooth::MAC_ADDRESS, device)?;
        require_len(&reply, 8, "MAC address")?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&reply[2..8]);
        mac.reverse();
        Ok(mac)
    }
}
