use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, Service, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{collections::BTreeSet, future::Future, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{PitPatError, Result},
    types::ConnectionParams,
    NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID,
};

/// Event delivered by an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Value of the notify characteristic changed
    Notification(Vec<u8>),
    /// The platform reported the device as disconnected
    Disconnected,
}

/// Outbound half of an open link
#[async_trait]
pub trait TreadmillLink: Send + Sync {
    /// Write one frame to the write characteristic
    async fn write(&self, data: &[u8]) -> Result<()>;
}

/// A link that finished the connection handshake
pub struct OpenedLink {
    /// Write path
    pub link: Arc<dyn TreadmillLink>,
    /// Notifications followed by a single `Disconnected`
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links to a treadmill
///
/// Implementations perform discovery, GATT connection, characteristic resolution
/// and notification subscription, in that order.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Run the connection handshake
    async fn open(&self, params: &ConnectionParams) -> Result<OpenedLink>;
}

/// btleplug-backed [`Connector`]
#[derive(Debug, Default, Clone, Copy)]
pub struct BleConnector;

impl BleConnector {
    /// Create a new connector
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn find_device(central: &Adapter, params: &ConnectionParams) -> Result<Peripheral> {
        info!("Starting scan for PitPat devices...");

        central
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(|e| PitPatError::ConnectionRejected(format!("Scan failed: {e}")))?;

        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;

        central.stop_scan().await?;

        for peripheral in central.peripherals().await? {
            if is_pitpat_device(&peripheral, params).await {
                return Ok(peripheral);
            }
        }

        Err(PitPatError::DeviceNotFound)
    }
}

#[async_trait]
impl Connector for BleConnector {
    async fn open(&self, params: &ConnectionParams) -> Result<OpenedLink> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(PitPatError::DeviceNotFound)?;

        // Subscribe before connecting so no disconnect event is missed
        let central_events = central.events().await?;

        let peripheral = Self::find_device(&central, params).await?;
        info!("Connecting to device {}", peripheral.address());

        timeout(
            Duration::from_millis(params.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| {
            PitPatError::ConnectionRejected(format!(
                "GATT connect timed out after {}ms",
                params.connect_timeout_ms
            ))
        })?
        .map_err(|e| PitPatError::ConnectionRejected(e.to_string()))?;

        // Past this point the link is up, so any failure must release it
        let setup = async {
            peripheral
                .discover_services()
                .await
                .map_err(|e| PitPatError::ConnectionRejected(e.to_string()))?;

            let services = peripheral.services();
            debug!(
                "Primary services: {:?}",
                services
                    .iter()
                    .filter(|s| s.primary)
                    .map(|s| s.uuid)
                    .collect::<Vec<_>>()
            );

            let notify_char = resolve_characteristic(&services, NOTIFY_CHAR_UUID)?;
            let write_char = resolve_characteristic(&services, WRITE_CHAR_UUID)?;

            let notifications = peripheral.notifications().await?;
            peripheral.subscribe(&notify_char).await?;

            Ok::<_, PitPatError>((write_char, notifications))
        };
        let release = async { peripheral.disconnect().await.map_err(PitPatError::from) };
        let (write_char, notifications) = release_on_error(setup, release).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let peripheral_id = peripheral.id();
        tokio::spawn(async move {
            let mut notifications = notifications;
            let mut central_events = central_events;
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == NOTIFY_CHAR_UUID => {
                            if tx.send(LinkEvent::Notification(n.value)).is_err() {
                                return;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => break,
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            let _ = tx.send(LinkEvent::Disconnected);
        });

        info!("Successfully connected to {}", peripheral.address());

        Ok(OpenedLink {
            link: Arc::new(BleLink {
                peripheral,
                write_char,
            }),
            events: rx,
        })
    }
}

/// Write path of a connected peripheral
struct BleLink {
    peripheral: Peripheral,
    write_char: Characteristic,
}

#[async_trait]
impl TreadmillLink for BleLink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        let write_type = if self.write_char.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral
            .write(&self.write_char, data, write_type)
            .await
            .map_err(|e| PitPatError::WriteFailed(e.to_string()))
    }
}

/// Run a setup step, running `release` before passing its error on
///
/// A failure of `release` itself is only logged; the setup error is the one
/// returned.
async fn release_on_error<T>(
    setup: impl Future<Output = Result<T>>,
    release: impl Future<Output = Result<()>>,
) -> Result<T> {
    match setup.await {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("Connection setup failed, disconnecting: {e}");
            if let Err(release_err) = release.await {
                warn!("Failed to disconnect after setup error: {release_err}");
            }
            Err(e)
        }
    }
}

/// Find a characteristic by UUID
///
/// Looks in the PitPat service first. Some firmware revisions expose the
/// characteristics under another primary service, so every primary service is
/// probed when the direct lookup fails.
///
/// # Errors
///
/// Returns [`PitPatError::CharacteristicNotFound`] if no primary service carries
/// the characteristic.
pub fn resolve_characteristic(
    services: &BTreeSet<Service>,
    uuid: Uuid,
) -> Result<Characteristic> {
    let direct = services
        .iter()
        .find(|s| s.uuid == SERVICE_UUID)
        .and_then(|s| s.characteristics.iter().find(|c| c.uuid == uuid));

    if let Some(characteristic) = direct {
        return Ok(characteristic.clone());
    }

    warn!("Characteristic {uuid} not under service {SERVICE_UUID}, scanning all primary services");

    services
        .iter()
        .filter(|s| s.primary)
        .find_map(|s| s.characteristics.iter().find(|c| c.uuid == uuid))
        .cloned()
        .ok_or(PitPatError::CharacteristicNotFound { uuid })
}

/// Check if the advertised properties indicate a PitPat device
async fn is_pitpat_device(peripheral: &Peripheral, params: &ConnectionParams) -> bool {
    if let Ok(Some(properties)) = peripheral.properties().await {
        return advertises_pitpat(
            properties.local_name.as_deref(),
            &properties.services,
            params,
        );
    }

    false
}

fn advertises_pitpat(
    local_name: Option<&str>,
    services: &[Uuid],
    params: &ConnectionParams,
) -> bool {
    services.contains(&SERVICE_UUID)
        || local_name.is_some_and(|name| params.device_names.iter().any(|n| n == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn characteristic(uuid: Uuid, service_uuid: Uuid) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid,
            properties: CharPropFlags::WRITE | CharPropFlags::NOTIFY,
            descriptors: BTreeSet::new(),
        }
    }

    fn service(uuid: Uuid, primary: bool, chars: &[Uuid]) -> Service {
        Service {
            uuid,
            primary,
            characteristics: chars.iter().map(|c| characteristic(*c, uuid)).collect(),
        }
    }

    #[test]
    fn test_resolve_direct() {
        let services: BTreeSet<_> = [service(
            SERVICE_UUID,
            true,
            &[WRITE_CHAR_UUID, NOTIFY_CHAR_UUID],
        )]
        .into_iter()
        .collect();

        let found = resolve_characteristic(&services, NOTIFY_CHAR_UUID).unwrap();
        assert_eq!(found.uuid, NOTIFY_CHAR_UUID);
        assert_eq!(found.service_uuid, SERVICE_UUID);
    }

    #[test]
    fn test_resolve_falls_back_to_other_primary_services() {
        let other = Uuid::from_u128(0x0000_fff0_0000_1000_8000_0080_5f9b_34fb);
        let services: BTreeSet<_> = [
            service(SERVICE_UUID, true, &[]),
            service(other, true, &[WRITE_CHAR_UUID, NOTIFY_CHAR_UUID]),
        ]
        .into_iter()
        .collect();

        let found = resolve_characteristic(&services, WRITE_CHAR_UUID).unwrap();
        assert_eq!(found.service_uuid, other);
    }

    #[test]
    fn test_resolve_skips_secondary_services() {
        let other = Uuid::from_u128(0x0000_fff0_0000_1000_8000_0080_5f9b_34fb);
        let services: BTreeSet<_> = [service(other, false, &[NOTIFY_CHAR_UUID])]
            .into_iter()
            .collect();

        assert!(matches!(
            resolve_characteristic(&services, NOTIFY_CHAR_UUID),
            Err(PitPatError::CharacteristicNotFound { uuid }) if uuid == NOTIFY_CHAR_UUID
        ));
    }

    #[tokio::test]
    async fn test_setup_error_releases_link() {
        let released = AtomicBool::new(false);

        let result: Result<()> = release_on_error(
            async {
                Err(PitPatError::CharacteristicNotFound {
                    uuid: WRITE_CHAR_UUID,
                })
            },
            async {
                released.store(true, Ordering::SeqCst);
                Err(PitPatError::Disconnected)
            },
        )
        .await;

        // The setup error wins over the failed release
        assert!(matches!(
            result,
            Err(PitPatError::CharacteristicNotFound { uuid }) if uuid == WRITE_CHAR_UUID
        ));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_successful_setup_keeps_link() {
        let released = AtomicBool::new(false);

        let result = release_on_error(async { Ok(7) }, async {
            released.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert!(!released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_device_matching() {
        let params = ConnectionParams::default();

        assert!(advertises_pitpat(None, &[SERVICE_UUID], &params));
        assert!(advertises_pitpat(Some("PitPat-T01"), &[], &params));
        assert!(advertises_pitpat(Some("Mindtree-HID"), &[], &params));
        assert!(!advertises_pitpat(Some("WalkingPad"), &[], &params));
        assert!(!advertises_pitpat(None, &[], &params));
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "0000fba0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            WRITE_CHAR_UUID.to_string(),
            "0000fba1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            NOTIFY_CHAR_UUID.to_string(),
            "0000fba2-0000-1000-8000-00805f9b34fb"
        );
    }
}
