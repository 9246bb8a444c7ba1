use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::link::{Connection, EndHook, LogFormatter, SessionEnd, utf8_log_formatter};
use crate::Result;
use crate::config::LinkConfig;
use crate::device::{Device, DeviceId, DiscoveryEvent};
use crate::error::{HardwareError, HardwareErrorKind, TransportError};
use crate::events::EventStream;
use crate::hardware::{HardwareEvent, HardwareEventSink, RadioCentral, RestoredLinkState, StackState};
use crate::registry::DeviceRegistry;
use crate::state::TransportStatus;

/// A session the OS kept alive across an interruption, rewrapped for the caller
#[derive(Debug, Clone)]
pub struct RestoredConnection {
    pub connection: Connection,
    /// The link had to be re-established, so the radio's configuration must
    /// be downloaded again
    pub needs_full_config: bool,
}

enum Command {
    Initialize,
    Discover {
        reply: oneshot::Sender<Result<EventStream<DiscoveryEvent>>>,
    },
    StopDiscovery {
        session: u64,
    },
    Connect {
        device: Device,
        attempt: u64,
        require_known: bool,
        reply: oneshot::Sender<Result<Connection>>,
    },
    AbortConnect {
        attempt: u64,
    },
    SessionEnded {
        session: u64,
        end: SessionEnd,
    },
    Devices {
        reply: oneshot::Sender<Vec<Device>>,
    },
    ActiveConnection {
        reply: oneshot::Sender<Option<Connection>>,
    },
}

/// Entry point of the transport.
///
/// Owns the radio hardware manager, the device registry and the single
/// active session. All bookkeeping happens on one background task; this
/// handle only sends it requests.
pub struct TransportManager {
    commands: mpsc::UnboundedSender<Command>,
    central: Arc<dyn RadioCentral>,
    status: watch::Receiver<TransportStatus>,
    next_id: Arc<AtomicU64>,
    restored: Mutex<Option<EventStream<RestoredConnection>>>,
}

impl TransportManager {
    pub fn new(central: Arc<dyn RadioCentral>, config: LinkConfig) -> Self {
        Self::with_log_formatter(central, config, utf8_log_formatter())
    }

    /// Like [`TransportManager::new`], rendering radio log records with `log_formatter`
    pub fn with_log_formatter(
        central: Arc<dyn RadioCentral>,
        config: LinkConfig,
        log_formatter: LogFormatter,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (hardware_tx, hardware_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(TransportStatus::Uninitialized);
        let (restored_tx, restored_rx) = mpsc::unbounded_channel();
        let next_id = Arc::new(AtomicU64::new(1));

        let transport = Transport {
            central: central.clone(),
            registry: DeviceRegistry::new(config.eviction_after),
            config,
            log_formatter,
            commands: commands.downgrade(),
            hardware_sink: HardwareEventSink::new(hardware_tx),
            status_tx,
            next_id: next_id.clone(),
            initialized: false,
            stack: StackState::Unknown,
            discovery_waiters: Vec::new(),
            discovery: None,
            scanning: false,
            cleanup: None,
            connecting: None,
            active: None,
            restoring: None,
            restored_tx,
        };
        tokio::spawn(transport.run(commands_rx, hardware_rx));

        Self {
            commands,
            central,
            status,
            next_id,
            restored: Mutex::new(Some(EventStream::new(restored_rx))),
        }
    }

    /// Bring up the radio hardware ahead of the first discovery.
    /// Needed to receive state-restore callbacks before scanning.
    pub fn initialize(&self) -> Result<()> {
        self.command(Command::Initialize)
    }

    pub fn status(&self) -> TransportStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }

    pub fn supports_manual_connection(&self) -> bool {
        self.central.supports_manual_connection()
    }

    /// Sessions handed back by the OS. Can be taken once.
    pub fn take_restored_connections(&self) -> Option<EventStream<RestoredConnection>> {
        self.restored.lock().ok().and_then(|mut restored| restored.take())
    }

    /// Start scanning and stream changes to the set of nearby radios.
    ///
    /// Waits for the Bluetooth stack to power on. Dropping the stream stops
    /// scanning and clears the registry. Starting a new discovery ends the
    /// previous stream.
    pub async fn discover_devices(&self) -> Result<EventStream<DiscoveryEvent>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Discover { reply })?;
        rx.await.unwrap_or(Err(TransportError::ManagerClosed))
    }

    /// Snapshot of the devices currently in the registry
    pub async fn devices(&self) -> Result<Vec<Device>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Devices { reply })?;
        rx.await.map_err(|_| TransportError::ManagerClosed)
    }

    pub async fn active_connection(&self) -> Result<Option<Connection>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::ActiveConnection { reply })?;
        rx.await.map_err(|_| TransportError::ManagerClosed)
    }

    /// Establish a link to a discovered device.
    ///
    /// Fails at once with [`TransportError::Busy`] while another attempt is
    /// in flight or a session is active. Dropping the future cancels the
    /// attempt. The returned connection still needs [`Connection::connect`].
    pub async fn connect(&self, device: &Device) -> Result<Connection> {
        self.connect_device(device.clone(), true).await
    }

    /// Connect to a radio addressed by a typed-in string
    pub async fn manually_connect(&self, address: &str) -> Result<Connection> {
        if !self.central.supports_manual_connection() {
            return Err(TransportError::Unsupported(
                "This transport does not support manual connections".into(),
            ));
        }
        let device = self
            .central
            .device_for_manual_connection(address)
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))?;
        self.connect_device(device, false).await
    }

    async fn connect_device(&self, device: Device, require_known: bool) -> Result<Connection> {
        let attempt = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            device,
            attempt,
            require_known,
            reply,
        })?;

        let mut guard = AbortGuard {
            commands: &self.commands,
            attempt,
            armed: true,
        };
        let result = rx.await.unwrap_or(Err(TransportError::ManagerClosed));
        guard.armed = false;
        result
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::ManagerClosed)
    }
}

struct AbortGuard<'a> {
    commands: &'a mpsc::UnboundedSender<Command>,
    attempt: u64,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.send(Command::AbortConnect {
                attempt: self.attempt,
            });
        }
    }
}

/// Latest signal strength per device whose `SignalUpdated` is still queued
type PendingSignals = Arc<Mutex<HashMap<DeviceId, i16>>>;

struct DiscoverySession {
    session: u64,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    signals: PendingSignals,
}

impl DiscoverySession {
    /// Queue an event. A signal update for a device that already has one
    /// queued only refreshes the value the consumer will see.
    fn send(&self, event: DiscoveryEvent) -> bool {
        if let DiscoveryEvent::SignalUpdated(id, rssi) = &event
            && let Ok(mut pending) = self.signals.lock()
            && pending.insert(id.clone(), *rssi).is_some()
        {
            return true;
        }
        self.events.send(event).is_ok()
    }
}

/// Swap a dequeued signal update's value for the latest one seen
fn latest_signal(signals: &PendingSignals, event: DiscoveryEvent) -> DiscoveryEvent {
    match event {
        DiscoveryEvent::SignalUpdated(id, rssi) => {
            let latest = signals
                .lock()
                .ok()
                .and_then(|mut pending| pending.remove(&id))
                .unwrap_or(rssi);
            DiscoveryEvent::SignalUpdated(id, latest)
        }
        other => other,
    }
}

struct PendingConnect {
    attempt: u64,
    device: Device,
    reply: oneshot::Sender<Result<Connection>>,
}

struct ActiveSession {
    session: u64,
    connection: Connection,
}

struct PendingRestore {
    device: Device,
    connect_issued: bool,
}

struct Transport {
    central: Arc<dyn RadioCentral>,
    config: LinkConfig,
    log_formatter: LogFormatter,
    commands: mpsc::WeakUnboundedSender<Command>,
    hardware_sink: HardwareEventSink,
    status_tx: watch::Sender<TransportStatus>,
    next_id: Arc<AtomicU64>,
    initialized: bool,
    stack: StackState,
    /// Discovery requests parked until the stack powers on
    discovery_waiters: Vec<oneshot::Sender<Result<EventStream<DiscoveryEvent>>>>,
    registry: DeviceRegistry,
    discovery: Option<DiscoverySession>,
    scanning: bool,
    cleanup: Option<Interval>,
    connecting: Option<PendingConnect>,
    active: Option<ActiveSession>,
    restoring: Option<PendingRestore>,
    restored_tx: mpsc::UnboundedSender<RestoredConnection>,
}

async fn next_cleanup(cleanup: &mut Option<Interval>) {
    match cleanup {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Transport {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut hardware: mpsc::UnboundedReceiver<HardwareEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = hardware.recv() => self.handle_hardware(event),
                _ = next_cleanup(&mut self.cleanup) => self.sweep_registry(),
            }
        }

        info!("Transport manager shutting down");
        if self.scanning {
            self.central.stop_scan();
        }
        if let Some(active) = self.active.take() {
            active.connection.fail(TransportError::ManagerClosed);
        }
    }

    fn set_status(&self, status: TransportStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!("Transport status: {:?} -> {:?}", current, status);
            *current = status;
            true
        });
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_started(&mut self) {
        if !self.initialized {
            info!("Starting radio hardware");
            self.initialized = true;
            self.central.start(self.hardware_sink.clone());
        }
    }

    fn restore_in_progress(&self) -> bool {
        self.restoring.is_some()
    }

    fn announce(&self, event: DiscoveryEvent) {
        if let Some(discovery) = &self.discovery
            && !discovery.send(event)
        {
            debug!("Discovery stream closed by consumer");
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize => self.ensure_started(),
            Command::Discover { reply } => {
                self.ensure_started();
                match self.stack {
                    StackState::PoweredOn => {
                        let stream = self.start_discovery();
                        let _ = reply.send(Ok(stream));
                    }
                    StackState::Unauthorized | StackState::Unsupported => {
                        let _ = reply.send(Err(self.stack_error()));
                    }
                    _ => {
                        debug!("Discovery waiting for Bluetooth to power on");
                        self.discovery_waiters.push(reply);
                    }
                }
            }
            Command::StopDiscovery { session } => {
                if self.discovery.as_ref().is_some_and(|d| d.session == session) {
                    self.stop_discovery();
                }
            }
            Command::Connect {
                device,
                attempt,
                require_known,
                reply,
            } => self.begin_connect(device, attempt, require_known, reply),
            Command::AbortConnect { attempt } => self.abort_connect(attempt),
            Command::SessionEnded { session, end } => self.end_session(session, end),
            Command::Devices { reply } => {
                let _ = reply.send(self.registry.devices());
            }
            Command::ActiveConnection { reply } => {
                let _ = reply.send(self.active.as_ref().map(|a| a.connection.clone()));
            }
        }
    }

    fn stack_error(&self) -> TransportError {
        let reason = match self.stack {
            StackState::Unauthorized => "Bluetooth is unauthorized",
            StackState::Unsupported => "Bluetooth is unsupported",
            StackState::PoweredOff => "Bluetooth is powered off",
            _ => "Bluetooth is not ready",
        };
        TransportError::StackUnavailable(reason.into())
    }

    fn start_discovery(&mut self) -> EventStream<DiscoveryEvent> {
        let session = self.next_id();
        let (events, rx) = mpsc::unbounded_channel();

        if self.discovery.is_some() {
            debug!("Replacing the previous discovery stream");
        }
        let signals = PendingSignals::default();
        self.discovery = Some(DiscoverySession {
            session,
            events,
            signals: signals.clone(),
        });

        if !self.restore_in_progress() {
            self.start_scanning();
            for device in self.registry.devices() {
                self.announce(DiscoveryEvent::Found(device));
            }
        }

        let period = self.config.cleanup_interval;
        let mut cleanup = tokio::time::interval_at(Instant::now() + period, period);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.cleanup = Some(cleanup);
        self.set_status(TransportStatus::Discovering);

        let commands = self.commands.clone();
        EventStream::with_drop_hook(rx, move || {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::StopDiscovery { session });
            }
        })
        .map_received(move |event| latest_signal(&signals, event))
    }

    fn start_scanning(&mut self) {
        if !self.scanning {
            info!("Scanning for mesh radios");
            self.central.scan();
            self.scanning = true;
        }
    }

    fn stop_discovery(&mut self) {
        debug!("Discovery stream ended, stopping scan");
        if self.scanning {
            self.central.stop_scan();
            self.scanning = false;
        }
        self.registry.clear();
        self.discovery = None;
        self.cleanup = None;
        if self.stack == StackState::PoweredOn {
            self.set_status(TransportStatus::Ready);
        } else if !self.status_tx.borrow().is_error() {
            self.set_status(TransportStatus::Uninitialized);
        }
    }

    fn sweep_registry(&mut self) {
        for id in self.registry.evict_stale(Instant::now()) {
            debug!(device = %id, "Device silent too long, evicting");
            self.announce(DiscoveryEvent::Lost(id));
        }
    }

    fn begin_connect(
        &mut self,
        device: Device,
        attempt: u64,
        require_known: bool,
        reply: oneshot::Sender<Result<Connection>>,
    ) {
        if self.connecting.is_some() || self.active.is_some() || self.restoring.is_some() {
            warn!(device = %device.id, "Connect rejected, transport is busy");
            let _ = reply.send(Err(TransportError::Busy));
            return;
        }
        if require_known && !self.registry.contains(&device.id) {
            let _ = reply.send(Err(TransportError::DeviceNotFound(device.id.to_string())));
            return;
        }
        if self.stack != StackState::PoweredOn {
            let _ = reply.send(Err(self.stack_error()));
            return;
        }

        info!(device = %device.id, name = %device.name, "Connecting");
        self.central.connect(&device.id);
        self.connecting = Some(PendingConnect {
            attempt,
            device,
            reply,
        });
    }

    fn abort_connect(&mut self, attempt: u64) {
        if self.connecting.as_ref().is_some_and(|c| c.attempt == attempt) {
            if let Some(pending) = self.connecting.take() {
                info!(device = %pending.device.id, "Connect attempt cancelled");
                self.central.cancel_connect(&pending.device.id);
            }
        } else if self.active.as_ref().is_some_and(|a| a.session == attempt) {
            // Linked, but the caller went away before receiving the connection
            if let Some(active) = self.active.take() {
                info!(device = %active.connection.id(), "Connect cancelled after link-up");
                active.connection.fail(TransportError::Cancelled);
            }
        }
    }

    fn spawn_connection(&self, device: Device, session: u64) -> Connection {
        let commands = self.commands.clone();
        let on_end: EndHook = Arc::new(move |end| {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::SessionEnded { session, end });
            }
        });
        Connection::spawn(
            device,
            self.central.clone(),
            self.config.clone(),
            self.log_formatter.clone(),
            on_end,
        )
    }

    /// Forget the active session. A closed session also drops the device from
    /// the registry so it is announced again when next seen.
    fn end_session(&mut self, session: u64, end: SessionEnd) {
        if !self.active.as_ref().is_some_and(|a| a.session == session) {
            return;
        }
        let Some(active) = self.active.take() else {
            return;
        };
        let id = active.connection.id().clone();
        info!(device = %id, ?end, "Session ended");
        if end == SessionEnd::Closed && self.registry.remove(&id).is_some() {
            self.announce(DiscoveryEvent::Lost(id));
        }
    }

    fn handle_hardware(&mut self, event: HardwareEvent) {
        match event {
            HardwareEvent::StateChanged(state) => self.on_stack_state(state),
            HardwareEvent::Advertisement { id, name, rssi } => {
                if self.restore_in_progress() || self.discovery.is_none() {
                    return;
                }
                let event = self.registry.observe(id, name, rssi, Instant::now());
                if let DiscoveryEvent::Found(device) = &event {
                    debug!(device = %device.id, name = %device.name, rssi, "Discovered new device");
                }
                self.announce(event);
            }
            HardwareEvent::Connected(id) => self.on_connected(id),
            HardwareEvent::ConnectFailed { id, error } => self.on_connect_failed(id, error),
            HardwareEvent::Disconnected { id, error } => self.on_disconnected(id, error),
            HardwareEvent::StateRestored { id, name, state } => self.on_restore(id, name, state),
            other => self.route_to_active(other),
        }
    }

    fn route_to_active(&self, event: HardwareEvent) {
        match (&self.active, event.device_id()) {
            (Some(active), Some(id)) if active.connection.id() == id => {
                active.connection.deliver(event);
            }
            _ => debug!("Dropping event for inactive peripheral: {:?}", event),
        }
    }

    fn on_stack_state(&mut self, state: StackState) {
        info!(%state, "Bluetooth stack state changed");
        self.stack = state;
        match state {
            StackState::PoweredOn => {
                if self.active.is_some() {
                    info!("Bluetooth powered on with an already active connection");
                }
                self.set_status(TransportStatus::Ready);

                for reply in std::mem::take(&mut self.discovery_waiters) {
                    let stream = self.start_discovery();
                    let _ = reply.send(Ok(stream));
                }
                // Scanning was interrupted by a power cycle
                if self.discovery.is_some() && !self.restore_in_progress() {
                    self.start_scanning();
                    self.set_status(TransportStatus::Discovering);
                }
                if let Some(restore) = self.restoring.as_mut()
                    && !restore.connect_issued
                {
                    info!(device = %restore.device.id, "Re-issuing connect for restored peripheral");
                    restore.connect_issued = true;
                    self.central.connect(&restore.device.id);
                }
            }
            StackState::PoweredOff => {
                self.set_status(TransportStatus::Error("Bluetooth is powered off".into()));
                self.scanning = false;
                if let Some(pending) = self.connecting.take() {
                    let _ = pending.reply.send(Err(self.stack_error()));
                }
                // The restore's connect request died with the stack
                if let Some(restore) = self.restoring.take() {
                    warn!(device = %restore.device.id, "Bluetooth powered off during restore, abandoning it");
                }
                if let Some(active) = &self.active {
                    error!("Bluetooth powered off during active connection, cleaning up");
                    let session = active.session;
                    active
                        .connection
                        .fail(TransportError::link_lost("Bluetooth powered off"));
                    self.end_session(session, SessionEnd::Closed);
                }
            }
            StackState::Unauthorized | StackState::Unsupported => {
                let message = match state {
                    StackState::Unauthorized => "Bluetooth access is unauthorized",
                    _ => "Bluetooth is unsupported on this device",
                };
                self.set_status(TransportStatus::Error(message.into()));
                for reply in std::mem::take(&mut self.discovery_waiters) {
                    let _ = reply.send(Err(self.stack_error()));
                }
                if let Some(pending) = self.connecting.take() {
                    let _ = pending.reply.send(Err(self.stack_error()));
                }
                self.restoring = None;
            }
            StackState::Resetting => {
                self.set_status(TransportStatus::Error("Bluetooth is resetting".into()));
            }
            StackState::Unknown => {
                self.set_status(TransportStatus::Error("Bluetooth state is unknown".into()));
            }
        }
    }

    fn on_connected(&mut self, id: DeviceId) {
        if self.restoring.as_ref().is_some_and(|r| r.device.id == id) {
            if let Some(restore) = self.restoring.take() {
                info!(device = %id, "Restored peripheral reconnected");
                self.install_restored(restore.device, true);
            }
            return;
        }

        match self.connecting.take() {
            Some(pending) if pending.device.id == id => {
                info!(device = %id, "Connected");
                let session = pending.attempt;
                let connection = self.spawn_connection(pending.device, session);
                self.active = Some(ActiveSession {
                    session,
                    connection: connection.clone(),
                });
                if pending.reply.send(Ok(connection)).is_err() {
                    debug!(device = %id, "Connect caller went away, awaiting abort");
                }
            }
            other => {
                self.connecting = other;
                warn!(device = %id, "Connected to a peripheral nobody asked for, releasing it");
                self.central.cancel_connect(&id);
            }
        }
    }

    fn on_connect_failed(&mut self, id: DeviceId, error: Option<HardwareError>) {
        if self.restoring.as_ref().is_some_and(|r| r.device.id == id) {
            warn!(device = %id, "Connection failed during restoration");
            self.restoring = None;
            self.resume_scanning_after_restore();
            return;
        }
        match self.connecting.take() {
            Some(pending) if pending.device.id == id => {
                let error = error.unwrap_or_else(|| {
                    HardwareError::new(HardwareErrorKind::ConnectionFailed, "Connection failed")
                });
                warn!(device = %id, "Connect failed: {}", error);
                let _ = pending.reply.send(Err(error.into()));
            }
            other => self.connecting = other,
        }
    }

    /// The single routing point for link loss: a pending attempt fails, an
    /// active session is handed the event and runs its own teardown.
    fn on_disconnected(&mut self, id: DeviceId, error: Option<HardwareError>) {
        match &error {
            Some(e) => warn!(device = %id, "Peripheral disconnected with error: {}", e),
            None => info!(device = %id, "Peripheral disconnected"),
        }

        if self.connecting.as_ref().is_some_and(|c| c.device.id == id) {
            if let Some(pending) = self.connecting.take() {
                let cause = error
                    .map(TransportError::Hardware)
                    .unwrap_or_else(|| TransportError::link_lost("BLE connection lost"));
                let _ = pending.reply.send(Err(cause));
            }
            return;
        }

        if let Some(active) = &self.active
            && active.connection.id() == &id
        {
            let session = active.session;
            active
                .connection
                .deliver(HardwareEvent::Disconnected { id, error });
            self.end_session(session, SessionEnd::Closed);
            return;
        }

        if self.restoring.as_ref().is_some_and(|r| r.device.id == id) {
            self.restoring = None;
            self.resume_scanning_after_restore();
            return;
        }
        debug!(device = %id, "Disconnect for a peripheral with no session");
    }

    fn on_restore(&mut self, id: DeviceId, name: Option<String>, state: RestoredLinkState) {
        warn!(device = %id, %state, "Restoring connection handed back by the OS");
        if self.active.is_some() || self.connecting.is_some() {
            warn!("Restore ignored, a session already exists");
            return;
        }

        let device = Device::restored(id, name.unwrap_or_else(|| "Unknown".into()));
        match state {
            RestoredLinkState::Connected => {
                self.registry.insert(device.clone(), Instant::now());
                self.install_restored(device, false);
            }
            RestoredLinkState::Connecting => {
                self.registry.insert(device.clone(), Instant::now());
                let connect_issued = self.stack == StackState::PoweredOn;
                if connect_issued {
                    self.central.connect(&device.id);
                } else {
                    debug!("Waiting for Bluetooth to power on before finishing restore");
                }
                self.restoring = Some(PendingRestore {
                    device,
                    connect_issued,
                });
            }
            RestoredLinkState::Disconnected => {
                debug!(device = %device.id, "Restored peripheral is not linked, nothing to restore");
            }
        }
    }

    fn install_restored(&mut self, device: Device, needs_full_config: bool) {
        let session = self.next_id();
        let connection = self.spawn_connection(device, session);
        self.active = Some(ActiveSession {
            session,
            connection: connection.clone(),
        });
        if self
            .restored_tx
            .send(RestoredConnection {
                connection,
                needs_full_config,
            })
            .is_err()
        {
            warn!("Nobody is listening for restored connections");
        }
        info!("Connection state successfully restored");
        self.resume_scanning_after_restore();
    }

    fn resume_scanning_after_restore(&mut self) {
        if self.discovery.is_some() && self.stack == StackState::PoweredOn {
            self.start_scanning();
        }
    }
}
