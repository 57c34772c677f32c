//! Simulation time base
//!
//! This module contains the microsecond time base shared by the engine and
//! its callers, along with the wire duration field conversions.

/// Simulation time in microseconds
pub type SimTime = u64;

/// A point in time that never arrives
pub const INFINITE_TIME: SimTime = u64::MAX;

/// The zero time
pub const ZERO_TIME: SimTime = 0;

/// Smallest representable time step
pub const EPSILON_TIME: SimTime = 1;

pub const MICRO_SECOND: SimTime = 1;
pub const MILLI_SECOND: SimTime = 1_000 * MICRO_SECOND;
pub const SECOND: SimTime = 1_000 * MILLI_SECOND;

/// 802.11 Time Unit (TU)
pub const TIME_UNIT: SimTime = 1024 * MICRO_SECOND;

/// Wire representation of a frame duration, in microseconds
pub type DurationField = u16;

/// Largest value the 16-bit duration field may carry
pub const MAX_DURATION_FIELD: DurationField = 32768;

/// Association ID assigned by an access point
pub type AssociationId = u16;

/// Largest valid association ID (13 bits on the 802.11ah wire)
pub const MAX_ASSOCIATION_ID: AssociationId = 8191;

/// Clamp a time interval to the 16-bit wire duration field.
pub fn duration_field_from_time(time: SimTime) -> DurationField {
    if time >= MAX_DURATION_FIELD as SimTime {
        MAX_DURATION_FIELD
    } else {
        time as DurationField
    }
}

/// Widen a wire duration field back to a time interval.
pub fn time_from_duration_field(duration: DurationField) -> SimTime {
    duration as SimTime
}
