use thiserror::Error;

/// Errors that can occur when working with a PitPat treadmill
#[derive(Error, Debug)]
pub enum PitPatError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No adapter or no matching device was found during scanning
    #[error("PitPat device not found")]
    DeviceNotFound,

    /// Discovery or GATT connection was rejected
    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    /// Neither the direct service lookup nor the fallback scan found the characteristic
    #[error("Characteristic {uuid} not found")]
    CharacteristicNotFound {
        /// UUID of the missing characteristic
        uuid: uuid::Uuid,
    },

    /// Command or heartbeat transmission was rejected by the stack
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Notification payload shorter than the telemetry frame
    #[error("Malformed notification: {len} bytes, expected at least {min}", min = crate::protocol::NOTIFICATION_MIN_LEN)]
    MalformedNotification {
        /// Length of the received payload
        len: usize,
    },

    /// Device disconnected
    #[error("Device disconnected")]
    Disconnected,

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for PitPat operations
pub type Result<T> = std::result::Result<T, PitPatError>;

impl PitPatError {
    /// Check if this error ends a connection attempt
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionRejected(_)
                | Self::CharacteristicNotFound { .. }
                | Self::Disconnected
                | Self::DeviceNotFound
        )
    }

    /// Check if this error leaves the session usable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::WriteFailed(_) | Self::MalformedNotification { .. } | Self::InvalidParameters(_)
        )
    }
}
