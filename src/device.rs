use crate::{
    ble::{BleConnector, Connector, LinkEvent},
    dispatcher::{Dispatcher, FrameWriter},
    error::Result,
    protocol::{encode, CommandKind, DEFAULT_SPEED_UNITS},
    session::Session,
    types::{ConnectionParams, Mode, SessionSnapshot, SpeedUnit, TreadmillState},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

/// Main interface for controlling a PitPat treadmill
///
/// `PitPatTreadmill` owns one device session: the connection handshake, telemetry
/// decoding and heartbeat-paced command delivery. Control methods only fill the
/// pending-command slot; the frame goes out on the next notification from the
/// device, which also carries the heartbeat when nothing is pending.
///
/// State changes are published to every [`StateSubscription`].
///
/// # Examples
///
/// ```no_run
/// use pitpat::{PitPatTreadmill, SpeedUnit};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let treadmill = PitPatTreadmill::new();
///     let mut updates = treadmill.subscribe();
///
///     treadmill.connect().await?;
///     treadmill.start();
///     treadmill.set_speed(3.5, SpeedUnit::Kilometers)?;
///
///     while let Some(snapshot) = updates.recv().await {
///         println!("{} at {:.2} km/h", snapshot.mode, snapshot.state.speed_kph);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct PitPatTreadmill {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Box<dyn Connector>,
    params: ConnectionParams,
    session: Mutex<Session>,
    dispatcher: Dispatcher,
    events: broadcast::Sender<SessionSnapshot>,
}

impl Default for PitPatTreadmill {
    fn default() -> Self {
        Self::new()
    }
}

impl PitPatTreadmill {
    /// Create a disconnected treadmill handle using Bluetooth and default parameters
    #[must_use]
    pub fn new() -> Self {
        Self::with_params(ConnectionParams::default())
    }

    /// Create a disconnected treadmill handle using Bluetooth
    #[must_use]
    pub fn with_params(params: ConnectionParams) -> Self {
        Self::with_connector(BleConnector::new(), params)
    }

    /// Create a disconnected treadmill handle on a custom transport
    #[must_use]
    pub fn with_connector(connector: impl Connector + 'static, params: ConnectionParams) -> Self {
        let (events, _) = broadcast::channel(params.event_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                connector: Box::new(connector),
                params,
                session: Mutex::new(Session::new()),
                dispatcher: Dispatcher::new(),
                events,
            }),
        }
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> StateSubscription {
        StateSubscription {
            receiver: self.inner.events.subscribe(),
        }
    }

    /// Current connection, mode and telemetry
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.session().snapshot()
    }

    /// Current belt mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.inner.session().mode()
    }

    /// Latest telemetry
    #[must_use]
    pub fn state(&self) -> TreadmillState {
        *self.inner.session().state()
    }

    /// Check if the device is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.snapshot().is_connected()
    }

    /// Check if a command is waiting for the next notification
    #[must_use]
    pub fn has_pending_command(&self) -> bool {
        self.inner.dispatcher.has_pending()
    }

    /// Connect to the treadmill
    ///
    /// Runs discovery, GATT connection, characteristic resolution and notification
    /// subscription. On success the session is connected with the belt stopped;
    /// on failure, or if the returned future is dropped before it completes, it
    /// is disconnected again and a fresh call is needed. Every outcome is
    /// published to subscribers.
    ///
    /// Returns `Ok(false)` without doing anything if a connection attempt is in
    /// flight or the session is already connected.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed handshake step, for example
    /// [`PitPatError::DeviceNotFound`](crate::PitPatError::DeviceNotFound),
    /// [`PitPatError::ConnectionRejected`](crate::PitPatError::ConnectionRejected) or
    /// [`PitPatError::CharacteristicNotFound`](crate::PitPatError::CharacteristicNotFound).
    pub async fn connect(&self) -> Result<bool> {
        {
            let mut session = self.inner.session();
            if !session.begin_connect() {
                return Ok(false);
            }
            self.inner.publish(session.snapshot());
        }

        // Resets the session if this future is dropped before the handshake ends
        let attempt = ConnectAttempt {
            inner: &self.inner,
            armed: true,
        };

        info!("Connecting to PitPat treadmill");

        match self.inner.connector.open(&self.inner.params).await {
            Ok(opened) => {
                attempt.disarm();
                let writer = FrameWriter::spawn(opened.link);
                self.inner.dispatcher.clear();
                self.inner.transition(Session::connect_succeeded);
                tokio::spawn(Arc::clone(&self.inner).run(opened.events, writer));
                info!("Connected, belt stopped");
                Ok(true)
            }
            Err(e) => {
                error!("Bluetooth connection error: {e}");
                drop(attempt);
                Err(e)
            }
        }
    }

    /// Start the belt
    pub fn start(&self) {
        self.send(CommandKind::Start, DEFAULT_SPEED_UNITS);
    }

    /// Stop the belt
    pub fn stop(&self) {
        self.send(CommandKind::Stop, DEFAULT_SPEED_UNITS);
    }

    /// Pause the belt
    pub fn pause(&self) {
        self.send(CommandKind::Pause, DEFAULT_SPEED_UNITS);
    }

    /// Set the belt speed
    ///
    /// The device accepts 1.00 to 6.00 km/h (see
    /// [`MIN_SPEED_UNITS`](crate::MIN_SPEED_UNITS) and
    /// [`MAX_SPEED_UNITS`](crate::MAX_SPEED_UNITS)). Values outside that range are
    /// sent as given; keeping the user inside it is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`PitPatError::InvalidParameters`](crate::PitPatError::InvalidParameters)
    /// if the speed is negative, not finite, or too large for the speed field.
    pub fn set_speed(&self, speed: f64, unit: SpeedUnit) -> Result<()> {
        let units = unit.to_speed_units(speed)?;
        debug!("Setting speed to {speed:.2} {unit} ({units} units)");
        self.send(CommandKind::SetSpeed, units);
        Ok(())
    }

    /// Set the belt speed in km/h
    ///
    /// # Errors
    ///
    /// See [`PitPatTreadmill::set_speed`].
    pub fn set_speed_kph(&self, kph: f64) -> Result<()> {
        self.set_speed(kph, SpeedUnit::Kilometers)
    }

    /// Set the belt speed in mph, using the device's 0.625 mile convention
    ///
    /// # Errors
    ///
    /// See [`PitPatTreadmill::set_speed`].
    pub fn set_speed_mph(&self, mph: f64) -> Result<()> {
        self.set_speed(mph, SpeedUnit::Miles)
    }

    fn send(&self, kind: CommandKind, speed_units: u16) {
        debug!("Queueing {kind:?} ({speed_units} units)");
        self.inner.dispatcher.enqueue(encode(kind, speed_units));
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, snapshot: SessionSnapshot) {
        // No subscribers is fine
        let _ = self.events.send(snapshot);
    }

    fn transition(&self, f: impl FnOnce(&mut Session) -> bool) {
        let mut session = self.session();
        if f(&mut session) {
            self.publish(session.snapshot());
        }
    }

    /// Event loop of one connected session
    async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        writer: FrameWriter,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Notification(data) => self.handle_notification(&data, &writer),
                LinkEvent::Disconnected => break,
            }
        }

        info!("Device disconnected");
        self.dispatcher.clear();
        self.transition(Session::disconnected);
        writer.shutdown().await;
    }

    fn handle_notification(&self, data: &[u8], writer: &FrameWriter) {
        debug!("Received notification ({} bytes): {:02X?}", data.len(), data);

        let mut session = self.session();
        let applied = session.apply_notification(data);
        // Only full telemetry frames are answered; the pending command waits
        if applied.decoded {
            self.dispatcher.dispatch(writer);
        }
        if applied.changed {
            self.publish(session.snapshot());
        }
    }
}

/// An in-flight connection attempt
///
/// Dropping it while armed moves the session from `Connecting` back to
/// `Disconnected`, whether the handshake failed or the `connect()` future was
/// cancelled.
struct ConnectAttempt<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl ConnectAttempt<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Connection attempt ended without a link");
            self.inner.transition(Session::connect_failed);
        }
    }
}

/// A subscription to state changes
pub struct StateSubscription {
    receiver: broadcast::Receiver<SessionSnapshot>,
}

impl StateSubscription {
    /// Receive the next state change
    ///
    /// Returns `None` once every clone of the treadmill handle has been dropped
    /// and no session is running. A connected session keeps the channel open
    /// until the device disconnects. A subscriber that falls behind skips to the
    /// oldest snapshot still buffered.
    pub async fn recv(&mut self) -> Option<SessionSnapshot> {
        loop {
            match self.receiver.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("State subscriber lagged, skipped {skipped} snapshots");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take a buffered state change without waiting
    pub fn try_recv(&mut self) -> Option<SessionSnapshot> {
        loop {
            match self.receiver.try_recv() {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}
