//! 12-bit sequence number arithmetic
//!
//! This module contains the circular arithmetic for 802.11 sequence numbers
//! and the conversion to non-wrapping 64-bit sequence numbers used by the
//! reorder buffer.

/// 12-bit wrapping sequence number, stored in the low bits of a u16
pub type SequenceNumber = u16;

/// Largest 12-bit sequence number
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = 4095;

/// Modulus of the sequence number space
pub const SEQUENCE_NUMBER_MODULUS: u16 = 4096;

/// Circular less-than over the 12-bit space. A number is "less" when it is
/// at most half the space (2047) behind the other.
pub fn is_less_than(left: SequenceNumber, right: SequenceNumber) -> bool {
    debug_assert!(left <= MAX_SEQUENCE_NUMBER && right <= MAX_SEQUENCE_NUMBER);

    ((left < right) && ((right - left) <= 2047)) || ((left > right) && ((left - right) > 2047))
}

/// Signed circular difference `left - right`. For distinct operands the
/// result is antisymmetric and its magnitude stays below 2048.
pub fn circular_difference(left: SequenceNumber, right: SequenceNumber) -> i32 {
    debug_assert!(left <= MAX_SEQUENCE_NUMBER && right <= MAX_SEQUENCE_NUMBER);

    if is_less_than(left, right) {
        if left <= right {
            left as i32 - right as i32
        } else {
            (left as i32 - SEQUENCE_NUMBER_MODULUS as i32) - right as i32
        }
    } else if left >= right {
        left as i32 - right as i32
    } else {
        left as i32 + (SEQUENCE_NUMBER_MODULUS as i32 - right as i32)
    }
}

/// Increment with wraparound past 4095.
pub fn next_sequence_number(sequence_number: SequenceNumber) -> SequenceNumber {
    debug_assert!(sequence_number <= MAX_SEQUENCE_NUMBER);

    if sequence_number == MAX_SEQUENCE_NUMBER {
        0
    } else {
        sequence_number + 1
    }
}

/// Add an offset modulo the sequence space.
pub fn add(sequence_number: SequenceNumber, count: u16) -> SequenceNumber {
    debug_assert!(sequence_number <= MAX_SEQUENCE_NUMBER);

    (sequence_number.wrapping_add(count)) % SEQUENCE_NUMBER_MODULUS
}

/// Subtract an offset modulo the sequence space.
pub fn subtract(sequence_number: SequenceNumber, count: u16) -> SequenceNumber {
    debug_assert!(sequence_number <= MAX_SEQUENCE_NUMBER);

    let count = count % SEQUENCE_NUMBER_MODULUS;
    (sequence_number + SEQUENCE_NUMBER_MODULUS - count) % SEQUENCE_NUMBER_MODULUS
}

/// Truncate a non-wrapping sequence number to the 12-bit wire value.
pub fn to_wire_sequence_number(non_wrapping: u64) -> SequenceNumber {
    (non_wrapping & 0xFFF) as SequenceNumber
}

/// Map a 12-bit wire sequence number onto the non-wrapping number line,
/// choosing the value circularly closest to `reference`.
pub fn to_non_wrapping_sequence_number(reference: u64, sequence_number: SequenceNumber) -> u64 {
    let difference = circular_difference(sequence_number, to_wire_sequence_number(reference));

    if difference >= 0 {
        reference + difference as u64
    } else {
        debug_assert!(reference >= (-difference) as u64);
        reference - (-difference) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_less_than() {
        assert!(is_less_than(1, 2));
        assert!(!is_less_than(2, 1));
        assert!(!is_less_than(5, 5));
        // Wraparound: 4095 is just behind 0.
        assert!(is_less_than(4095, 0));
        assert!(!is_less_than(0, 4095));
        assert!(is_less_than(4000, 100));
        // Exactly half the space apart.
        assert!(is_less_than(0, 2047));
        assert!(!is_less_than(0, 2048));
    }

    #[test]
    fn test_circular_difference() {
        assert_eq!(circular_difference(5, 3), 2);
        assert_eq!(circular_difference(3, 5), -2);
        assert_eq!(circular_difference(7, 7), 0);
        assert_eq!(circular_difference(0, 4095), 1);
        assert_eq!(circular_difference(4095, 0), -1);
        assert_eq!(circular_difference(10, 4090), 16);
    }

    #[test]
    fn test_circular_difference_antisymmetry() {
        let samples = [0u16, 1, 63, 64, 100, 2000, 2047, 2048, 2049, 4000, 4095];
        for &a in &samples {
            for &b in &samples {
                if a == b {
                    continue;
                }
                let forward = circular_difference(a, b);
                let backward = circular_difference(b, a);
                assert_eq!(forward, -backward, "a={} b={}", a, b);
                assert!(forward.unsigned_abs() < 2048, "a={} b={}", a, b);
            }
        }
    }

    #[test]
    fn test_increment_wraps() {
        assert_eq!(next_sequence_number(0), 1);
        assert_eq!(next_sequence_number(4094), 4095);
        assert_eq!(next_sequence_number(4095), 0);
    }

    #[test]
    fn test_add_subtract() {
        assert_eq!(add(4090, 10), 4);
        assert_eq!(subtract(4, 10), 4090);
        assert_eq!(add(0, 0), 0);
        assert_eq!(subtract(0, 1), 4095);
    }

    #[test]
    fn test_non_wrapping_conversion() {
        // Forward of the reference.
        assert_eq!(to_non_wrapping_sequence_number(100, 105), 105);
        // Behind the reference.
        assert_eq!(to_non_wrapping_sequence_number(100, 95), 95);
        // Across a wrap boundary: reference logical 4100 has wire value 4.
        assert_eq!(to_non_wrapping_sequence_number(4100, 10), 4106);
        assert_eq!(to_non_wrapping_sequence_number(4100, 4095), 4095);
    }

    #[test]
    fn test_non_wrapping_conversion_is_stable_over_windows() {
        let mut logical = 1u64;
        let mut wire = 1u16;
        for _ in 0..10_000 {
            assert_eq!(to_non_wrapping_sequence_number(logical + 64, wire), logical);
            logical += 1;
            wire = next_sequence_number(wire);
        }
    }
}
