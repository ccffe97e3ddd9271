#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # PitPat
//!
//! A Rust library for controlling PitPat walking treadmills via Bluetooth Low Energy.
//!
//! The treadmill speaks a small proprietary protocol over one GATT service:
//!
//! - **Telemetry**: the device notifies a 31-byte (or longer) frame several times a
//!   second with speed, distance, steps, calories, elapsed time and belt mode.
//! - **Heartbeat pacing**: the device is the bus master. Every notification must be
//!   answered with exactly one write, either the pending command or a 5-byte
//!   heartbeat that keeps the session alive.
//! - **Commands**: fixed 23-byte frames for start, pause, stop and set-speed,
//!   protected by an XOR checksum.
//!
//! Control calls never write directly. They replace a single pending-command slot
//! which is flushed on the next notification; the last command issued between two
//! notifications wins.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pitpat::PitPatTreadmill;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let treadmill = PitPatTreadmill::new();
//!
//!     // Scan, connect and subscribe to telemetry
//!     treadmill.connect().await?;
//!
//!     // Start the belt, then walk at 3 km/h
//!     treadmill.start();
//!     treadmill.set_speed_kph(3.0)?;
//!
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport
pub mod ble;
/// Main device control interface
pub mod device;
/// Heartbeat-paced command delivery
pub mod dispatcher;
/// Error types and handling
pub mod error;
/// Frame encoding and telemetry decoding
pub mod protocol;
/// Connection and belt-mode state machine
pub mod session;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{BleConnector, Connector, LinkEvent, OpenedLink, TreadmillLink};
pub use device::{PitPatTreadmill, StateSubscription};
pub use error::{PitPatError, Result};
pub use protocol::CommandKind;
pub use types::{
    ConnectionParams, ConnectionState, Mode, RawFields, SessionSnapshot, SpeedUnit,
    TreadmillState, KM_TO_MILES, MAX_SPEED_UNITS, MIN_SPEED_UNITS,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Primary service carrying the treadmill protocol
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fba0_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic commands and heartbeats are written to
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_fba1_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic the device notifies telemetry on
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_fba2_0000_1000_8000_0080_5f9b_34fb);
