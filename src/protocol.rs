use crate::{
    error::{PitPatError, Result},
    types::{Mode, RawFields, TreadmillState},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Minimum length of a telemetry notification
pub const NOTIFICATION_MIN_LEN: usize = 31;

/// Length of a command frame
pub const COMMAND_FRAME_LEN: usize = 23;

/// Length byte of a command frame
pub const LENGTH_BYTE: u8 = 0x17;

/// First byte of every outbound frame
pub const START_BYTE: u8 = 0x6A;

/// Last byte of every outbound frame
pub const END_BYTE: u8 = 0x43;

/// Keep-alive frame sent on every notification when no command is pending
pub const HEARTBEAT: [u8; 5] = [0x6A, 0x05, 0xFD, 0xF8, 0x43];

/// Speed carried by start, pause and stop frames (1.00 km/h)
pub const DEFAULT_SPEED_UNITS: u16 = 1000;

/// User identifier the vendor app writes into every command frame
pub const USER_ID: u64 = 58_965_456_623;

/// Body weight field of command frames, kg
pub const DEFAULT_WEIGHT: u8 = 80;

/// Offset of the checksum byte in a command frame
pub const CHECKSUM_OFFSET: usize = 21;

const SPEED_OFFSET: usize = 3;
const DISTANCE_OFFSET: usize = 7;
const STEPS_OFFSET: usize = 14;
const CALORIES_OFFSET: usize = 18;
const DURATION_OFFSET: usize = 20;
const FLAGS_OFFSET: usize = 26;

const RUNNING_STATE_MASK: u8 = 0x18;
const IMPERIAL_UNIT_FLAG: u8 = 0x80;
const IMPERIAL_COMMAND_BIT: u8 = 0x08;

/// Command kinds understood by the treadmill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Start the belt
    Start,
    /// Pause the belt
    Pause,
    /// Stop the belt and end the workout
    Stop,
    /// Change the belt speed
    SetSpeed,
}

impl CommandKind {
    /// Mode discriminator byte (offset 8)
    #[must_use]
    pub const fn discriminator(self) -> u8 {
        match self {
            Self::SetSpeed => 5,
            Self::Start | Self::Pause | Self::Stop => 1,
        }
    }

    /// Command byte (offset 12), metric units
    #[must_use]
    pub const fn command_byte(self) -> u8 {
        let cmd = match self {
            Self::Start | Self::SetSpeed => 4,
            Self::Pause => 2,
            Self::Stop => 0,
        };
        cmd & !IMPERIAL_COMMAND_BIT
    }
}

/// Telemetry decoded from one notification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    /// Derived state
    pub state: TreadmillState,
    /// Belt mode from the flag byte
    pub mode: Mode,
}

/// XOR of bytes 1 through 20 of a command frame
///
/// # Panics
///
/// Panics if `frame` is shorter than [`CHECKSUM_OFFSET`].
#[must_use]
pub fn checksum(frame: &[u8]) -> u8 {
    frame[1..CHECKSUM_OFFSET].iter().fold(0, |acc, b| acc ^ b)
}

/// Build a command frame
///
/// Layout (big-endian):
/// - Byte 0: start byte `0x6A`
/// - Byte 1: length `0x17`
/// - Bytes 2-5: reserved
/// - Bytes 6-7: speed, 1000 units = 1.00 km/h
/// - Byte 8: mode discriminator (5 for set speed, 1 otherwise)
/// - Byte 9: incline (always 0)
/// - Byte 10: weight
/// - Byte 11: reserved
/// - Byte 12: command byte, bit 3 clear for km/h
/// - Bytes 13-20: user identifier
/// - Byte 21: checksum
/// - Byte 22: end byte `0x43`
#[must_use]
pub fn encode(kind: CommandKind, speed_units: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(COMMAND_FRAME_LEN);

    buf.put_u8(START_BYTE);
    buf.put_u8(LENGTH_BYTE);
    buf.put_bytes(0, 4);
    buf.put_u16(speed_units);
    buf.put_u8(kind.discriminator());
    buf.put_u8(0);
    buf.put_u8(DEFAULT_WEIGHT);
    buf.put_u8(0);
    buf.put_u8(kind.command_byte());
    buf.put_u64(USER_ID);

    let sum = checksum(&buf);
    buf.put_u8(sum);
    buf.put_u8(END_BYTE);

    buf.freeze()
}

/// Heartbeat frame
#[must_use]
pub fn heartbeat() -> Bytes {
    Bytes::from_static(&HEARTBEAT)
}

/// Map the flag byte of a notification to a belt mode
#[must_use]
pub const fn mode_from_flags(flags: u8) -> Mode {
    match flags & RUNNING_STATE_MASK {
        0x18 => Mode::Starting,
        0x08 => Mode::Running,
        0x10 => Mode::Paused,
        _ => Mode::Stopped,
    }
}

/// Parse a telemetry notification
///
/// Frame fields (big-endian):
/// - Bytes 3-4: speed, 0.001 km/h
/// - Bytes 7-10: distance, metres
/// - Bytes 14-17: steps
/// - Bytes 18-19: kcal
/// - Bytes 20-23: elapsed time, ms
/// - Byte 26: flags (bits 0x18 running state, bit 0x80 imperial display)
///
/// The firmware sometimes reports stale counters while stopped, so distance,
/// calories, steps and duration are zeroed whenever the decoded mode is
/// [`Mode::Stopped`]. Speed is kept.
///
/// # Errors
///
/// Returns [`PitPatError::MalformedNotification`] if the payload is shorter than
/// [`NOTIFICATION_MIN_LEN`].
pub fn decode(data: &[u8]) -> Result<Telemetry> {
    if data.len() < NOTIFICATION_MIN_LEN {
        return Err(PitPatError::MalformedNotification { len: data.len() });
    }

    let flags = data[FLAGS_OFFSET];
    let mode = mode_from_flags(flags);

    let mut raw = RawFields {
        current_speed: (&data[SPEED_OFFSET..]).get_u16(),
        distance: (&data[DISTANCE_OFFSET..]).get_u32(),
        calories: (&data[CALORIES_OFFSET..]).get_u16(),
        steps: (&data[STEPS_OFFSET..]).get_u32(),
        duration: (&data[DURATION_OFFSET..]).get_u32(),
        imperial_unit_default: flags & IMPERIAL_UNIT_FLAG != 0,
    };

    if mode == Mode::Stopped {
        raw.distance = 0;
        raw.calories = 0;
        raw.steps = 0;
        raw.duration = 0;
    }

    Ok(Telemetry {
        state: TreadmillState::from_raw(raw),
        mode,
    })
}
