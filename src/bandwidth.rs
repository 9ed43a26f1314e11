//! Bus load estimate of a streaming configuration.

use crate::streaming::{expected_sample_rate, AdcConfig};

/// Samples carried by one data frame.
const SAMPLES_PER_FRAME: f64 = 3.0;

/// Bits a data frame occupies on the CAN bus, framing and stuffing included.
const CAN_BITS_PER_FRAME: f64 = 128.0;

/// Bits a relayed data frame occupies on the radio link.
const RADIO_BITS_PER_FRAME: f64 = 256.0;

/// Required `(can_bps, radio_bps)` when `axes` channels stream with `adc`.
pub fn bandwidth(adc: &AdcConfig, axes: usize) -> (f64, f64) {
    let frames_per_second = expected_sample_rate(adc) * axes as f64 / SAMPLES_PER_FRAME;
    (
        frames_per_second * CAN_BITS_PER_FRAME,
        frames_per_second * RADIO_BITS_PER_FRAME,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_axes_send_one_frame_per_sample() {
        let adc = AdcConfig::default();
        let rate = expected_sample_rate(&adc);
        let (can, radio) = bandwidth(&adc, 3);
        assert!((can - rate * 128.0).abs() < 1e-6);
        assert!((radio - rate * 256.0).abs() < 1e-6);
    }

    #[test]
    fn radio_costs_twice_the_bus() {
        let (can, radio) = bandwidth(&AdcConfig::default(), 1);
        assert!((radio - 2.0 * can).abs() < 1e-6);
        assert_eq!(bandwidth(&AdcConfig::default(), 0), (0.0, 0.0));
    }
}
