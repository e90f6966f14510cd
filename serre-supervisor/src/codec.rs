//! Register codec: raw Modbus words to physical quantities.
//!
//! Every function here is pure and total. Passing the wrong number of words
//! is a caller bug, which is why the two-word decoders take the words
//! separately instead of a slice.

/// Full-scale voltage of the TCW241 analog inputs.
pub const HUMIDITY_FULL_SCALE_VOLTS: f64 = 5.0;

/// Combine two big-endian registers (high word first) into an IEEE-754 float.
pub fn decode_float32(high: u16, low: u16) -> f32 {
    f32::from_bits((u32::from(high) << 16) | u32::from(low))
}

/// Split a float into the two registers `decode_float32` expects.
pub fn encode_float32(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits >> 16) as u16, (bits & 0xFFFF) as u16]
}

/// Scale a 0-5 V analog humidity signal to percent.
///
/// Not clamped: a sensor outside its range yields a value outside 0-100.
pub fn decode_humidity_from_volts(volts: f64) -> f64 {
    (volts / HUMIDITY_FULL_SCALE_VOLTS) * 100.0
}

/// Boolean value of a coil or discrete input bit.
pub fn decode_discrete(bit: bool) -> bool {
    bit
}

/// Two's-complement interpretation of a single register.
pub fn decode_i16(word: u16) -> i16 {
    word as i16
}

/// Signed register multiplied by a scale factor (e.g. 0.1 for tenths of a degree).
pub fn decode_scaled(word: u16, scale: f64) -> f64 {
    f64::from(decode_i16(word)) * scale
}

/// Unsigned interpretation of a counter register.
pub fn decode_counter(word: u16) -> u32 {
    u32::from(word)
}

/// Arithmetic mean of the three humidity channels of one poll.
pub fn mean_humidity(h1: f64, h2: f64, h3: f64) -> f64 {
    (h1 + h2 + h3) / 3.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_float32_big_endian() {
        // 123.456 in IEEE 754 = 0x42F6E979
        let value = decode_float32(0x42F6, 0xE979);
        assert!((value - 123.456).abs() < 0.001);
    }

    #[test]
    fn test_float32_roundtrip_is_bit_exact() {
        for value in [0.0f32, -0.0, 21.375, -12.5, 3.3, f32::MIN_POSITIVE, f32::MAX] {
            let [high, low] = encode_float32(value);
            assert_eq!(decode_float32(high, low).to_bits(), value.to_bits());
        }
    }

    #[test]
    fn test_humidity_scaling() {
        assert_eq!(decode_humidity_from_volts(0.0), 0.0);
        assert_eq!(decode_humidity_from_volts(5.0), 100.0);
        assert_eq!(decode_humidity_from_volts(2.5), 50.0);
    }

    #[test]
    fn test_humidity_is_not_clamped() {
        assert_eq!(decode_humidity_from_volts(6.0), 120.0);
        assert!(decode_humidity_from_volts(-0.5) < 0.0);
    }

    #[test]
    fn test_signed_and_scaled_registers() {
        assert_eq!(decode_i16(0xFFFB), -5);
        assert_eq!(decode_scaled(0xFFFB, 1.0), -5.0);
        assert_eq!(decode_scaled(215, 0.1), 21.5);
        assert_eq!(decode_counter(0xFFFF), 65535);
    }

    #[test]
    fn test_mean_and_discrete() {
        assert_eq!(mean_humidity(40.0, 50.0, 60.0), 50.0);
        assert!(decode_discrete(true));
        assert!(!decode_discrete(false));
    }
}
