use serde::{Deserialize, Serialize};
use std::fmt;

/// Device convention for converting kilometres to miles.
///
/// The treadmill firmware uses 0.625 rather than the exact 0.621371 factor, and the
/// speed field of outbound frames is scaled with the same constant. Keep it as is so
/// values shown to the user match the device's own display.
pub const KM_TO_MILES: f64 = 0.625;

/// Lowest speed the device accepts, in speed units (1000 units = 1.00 km/h)
pub const MIN_SPEED_UNITS: u16 = 1000;

/// Highest speed the device accepts, in speed units (1000 units = 1.00 km/h)
pub const MAX_SPEED_UNITS: u16 = 6000;

/// Speed unit for treadmill operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedUnit {
    /// Kilometers per hour
    Kilometers,
    /// Miles per hour
    Miles,
}

impl SpeedUnit {
    /// Convert a speed in this unit into the device's 16-bit speed units
    ///
    /// # Errors
    ///
    /// Returns [`PitPatError::InvalidParameters`](crate::PitPatError::InvalidParameters)
    /// if the value is negative, not finite, or does not fit the speed field.
    pub fn to_speed_units(self, speed: f64) -> crate::Result<u16> {
        let units = match self {
            Self::Kilometers => (speed * 1000.0).round(),
            Self::Miles => (speed * 1000.0 / KM_TO_MILES).round(),
        };

        if !units.is_finite() || !(0.0..=f64::from(u16::MAX)).contains(&units) {
            return Err(crate::PitPatError::InvalidParameters(format!(
                "Speed {speed} {self} does not fit the device speed field"
            )));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let units = units as u16;
        Ok(units)
    }
}

impl fmt::Display for SpeedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kilometers => write!(f, "km/h"),
            Self::Miles => write!(f, "mph"),
        }
    }
}

/// Belt mode reported by the treadmill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Belt is spinning up after a start command
    Starting,
    /// Belt is running
    Running,
    /// Belt is paused
    Paused,
    /// Belt is stopped
    Stopped,
    /// No session with the device
    #[default]
    Disconnected,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Connection lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link to the device
    #[default]
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Notifications are subscribed and the heartbeat is running
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Integers read from a telemetry frame before unit conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawFields {
    /// Belt speed, 0.001 km/h per unit
    pub current_speed: u16,
    /// Distance, metres
    pub distance: u32,
    /// Energy, kcal
    pub calories: u16,
    /// Step count
    pub steps: u32,
    /// Elapsed time, milliseconds
    pub duration: u32,
    /// Units preference bit (0x80) of the flag byte
    pub imperial_unit_default: bool,
}

/// Decoded telemetry, replaced wholesale on every notification
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TreadmillState {
    /// Belt speed in km/h
    pub speed_kph: f64,
    /// Belt speed in mph (device convention, see [`KM_TO_MILES`])
    pub speed_mph: f64,
    /// Distance in km
    pub distance_km: f64,
    /// Distance in miles (device convention, see [`KM_TO_MILES`])
    pub distance_mi: f64,
    /// Energy burned
    pub kilocalories: u32,
    /// Step count
    pub steps: u32,
    /// Elapsed time in whole seconds
    pub duration: u32,
    /// Integers the values above were derived from
    pub raw: RawFields,
}

impl TreadmillState {
    /// Derive the user-facing values from raw frame fields
    #[must_use]
    pub fn from_raw(raw: RawFields) -> Self {
        let speed_kph = f64::from(raw.current_speed) / 1000.0;
        let distance_km = f64::from(raw.distance) / 1000.0;
        let duration = (u64::from(raw.duration) + 500) / 1000;

        Self {
            speed_kph,
            speed_mph: speed_kph * KM_TO_MILES,
            distance_km,
            distance_mi: distance_km * KM_TO_MILES,
            kilocalories: u32::from(raw.calories),
            steps: raw.steps,
            duration: u32::try_from(duration).unwrap_or(u32::MAX),
            raw,
        }
    }

    /// Speed in the requested unit
    #[must_use]
    pub const fn speed(&self, unit: SpeedUnit) -> f64 {
        match unit {
            SpeedUnit::Kilometers => self.speed_kph,
            SpeedUnit::Miles => self.speed_mph,
        }
    }

    /// Distance in the requested unit
    #[must_use]
    pub const fn distance(&self, unit: SpeedUnit) -> f64 {
        match unit {
            SpeedUnit::Kilometers => self.distance_km,
            SpeedUnit::Miles => self.distance_mi,
        }
    }
}

/// Everything an observer needs to render the session
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Connection lifecycle
    pub connection: ConnectionState,
    /// Belt mode
    pub mode: Mode,
    /// Latest telemetry
    pub state: TreadmillState,
}

impl SessionSnapshot {
    /// Check if the session is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// GATT connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Advertised local names accepted in addition to the service UUID
    pub device_names: Vec<String>,
    /// Buffer size of the state-change channel
    pub event_capacity: usize,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            device_names: vec!["PitPat-T01".to_string(), "Mindtree-HID".to_string()],
            event_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_raw() {
        let state = TreadmillState::from_raw(RawFields {
            current_speed: 1000,
            distance: 2500,
            calories: 42,
            steps: 3100,
            duration: 61_499,
            imperial_unit_default: false,
        });

        assert!((state.speed_kph - 1.0).abs() < f64::EPSILON);
        assert!((state.speed_mph - 0.625).abs() < f64::EPSILON);
        assert!((state.distance_km - 2.5).abs() < f64::EPSILON);
        assert!((state.distance_mi - 1.5625).abs() < f64::EPSILON);
        assert_eq!(state.kilocalories, 42);
        assert_eq!(state.steps, 3100);
        assert_eq!(state.duration, 61);
    }

    #[test]
    fn test_unit_accessors() {
        let state = TreadmillState::from_raw(RawFields {
            current_speed: 4000,
            distance: 8000,
            ..RawFields::default()
        });

        assert!((state.speed(SpeedUnit::Kilometers) - 4.0).abs() < f64::EPSILON);
        assert!((state.speed(SpeedUnit::Miles) - 2.5).abs() < f64::EPSILON);
        assert!((state.distance(SpeedUnit::Kilometers) - 8.0).abs() < f64::EPSILON);
        assert!((state.distance(SpeedUnit::Miles) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duration_rounds_half_up() {
        let raw = RawFields {
            duration: 1500,
            ..RawFields::default()
        };
        assert_eq!(TreadmillState::from_raw(raw).duration, 2);

        let raw = RawFields {
            duration: u32::MAX,
            ..RawFields::default()
        };
        assert_eq!(TreadmillState::from_raw(raw).duration, 4_294_967);
    }

    #[test]
    fn test_speed_unit_conversion() {
        assert_eq!(SpeedUnit::Kilometers.to_speed_units(2.5).unwrap(), 2500);
        assert_eq!(SpeedUnit::Kilometers.to_speed_units(1.0004).unwrap(), 1000);
        // 2.0 mph / 0.625 = 3.2 km/h
        assert_eq!(SpeedUnit::Miles.to_speed_units(2.0).unwrap(), 3200);
        assert_eq!(SpeedUnit::Miles.to_speed_units(1.2345).unwrap(), 1975);
    }

    #[test]
    fn test_speed_unit_rejects_unrepresentable_values() {
        assert!(SpeedUnit::Kilometers.to_speed_units(-1.0).is_err());
        assert!(SpeedUnit::Kilometers.to_speed_units(f64::NAN).is_err());
        assert!(SpeedUnit::Kilometers.to_speed_units(70.0).is_err());
        assert!(SpeedUnit::Miles.to_speed_units(f64::INFINITY).is_err());
    }

    #[test]
    fn test_defaults() {
        let snapshot = SessionSnapshot::default();
        assert_eq!(snapshot.mode, Mode::Disconnected);
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);
        assert!(!snapshot.is_connected());
        assert_eq!(snapshot.state, TreadmillState::default());

        let params = ConnectionParams::default();
        assert_eq!(params.scan_timeout_ms, 10_000);
        assert_eq!(params.device_names, vec!["PitPat-T01", "Mindtree-HID"]);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(Mode::Starting.to_string(), "Starting");
        assert_eq!(Mode::Disconnected.to_string(), "Disconnected");
        assert_eq!(SpeedUnit::Miles.to_string(), "mph");
    }
}
