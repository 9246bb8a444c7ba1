//! One session with one remote radio.
//!
//! A [`Connection`] is a cheap handle onto a task that owns all session state:
//! resolved endpoints, the FIFO tables of pending write and read completions,
//! the signal poller and the drain worker. User calls and hardware callbacks
//! are both messages on that task's inbox, so every mutation is serialised.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::tasks::{spawn_drain_worker, spawn_signal_poller};
use crate::Result;
use crate::config::LinkConfig;
use crate::device::{Device, DeviceId};
use crate::error::{HardwareError, TransportError, should_reconnect};
use crate::events::{ConnectionEvent, ConnectionEvents, EventStream};
use crate::hardware::{DiscoveredEndpoint, Endpoint, EndpointProperties, HardwareEvent, RadioCentral, WriteMode};
use crate::state::ConnectionState;

/// Renders a LOGRADIO payload into a log line. Returning `None` drops it.
pub type LogFormatter = Arc<dyn Fn(&[u8]) -> Option<String> + Send + Sync>;

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// The caller abandoned the attempt before it completed
    Cancelled,
    Closed,
}

/// Called when a session ends, by whichever path ends it first
pub(crate) type EndHook = Arc<dyn Fn(SessionEnd) + Send + Sync>;

pub fn utf8_log_formatter() -> LogFormatter {
    Arc::new(|bytes: &[u8]| {
        let line = String::from_utf8_lossy(bytes).trim_end().to_string();
        (!line.is_empty()).then_some(line)
    })
}

pub(crate) enum Command {
    Connect(oneshot::Sender<Result<ConnectionEvents>>),
    /// The caller abandoned `connect()`. The link has already been released.
    CancelConnect,
    Send(Vec<u8>, oneshot::Sender<Result<()>>),
    Read(oneshot::Sender<Result<Vec<u8>>>),
    Disconnect {
        cause: Option<TransportError>,
        should_reconnect: bool,
        done: oneshot::Sender<()>,
    },
    /// Tear down with a classified error
    Fail(TransportError),
    Hardware(HardwareEvent),
    /// A frame produced by the drain worker
    Deliver(Vec<u8>),
    EnterBackground,
    BecomeActive,
}

/// Handle to an active session with one radio
#[derive(Clone)]
pub struct Connection {
    device: Device,
    inbox: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    central: Arc<dyn RadioCentral>,
    on_end: EndHook,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.device.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Connection {
    pub(crate) fn spawn(
        device: Device,
        central: Arc<dyn RadioCentral>,
        config: LinkConfig,
        log_formatter: LogFormatter,
        on_end: EndHook,
    ) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Idle);

        let session = Session {
            id: device.id.clone(),
            central: central.clone(),
            config,
            log_formatter,
            on_end: on_end.clone(),
            inbox: inbox.clone(),
            state: ConnectionState::Idle,
            state_tx,
            link_up: true,
            endpoints: None,
            events: None,
            pending_connect: None,
            writes: VecDeque::new(),
            reads: VecDeque::new(),
            poller: None,
            drainer: None,
            drain_wake: Arc::new(Notify::new()),
        };
        tokio::spawn(session.run(rx));

        Self {
            device,
            inbox,
            state,
            central,
            on_end,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn id(&self) -> &DeviceId {
        &self.device.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Resolve the mesh service endpoints and start the session.
    ///
    /// Returns the event stream for inbound data, log lines, signal updates and
    /// the terminal disconnect. Dropping the returned future before it
    /// completes cancels the attempt and releases the link.
    pub async fn connect(&self) -> Result<ConnectionEvents> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx))?;

        let mut guard = ConnectGuard {
            connection: self,
            armed: true,
        };
        let result = rx
            .await
            .unwrap_or_else(|_| Err(TransportError::disconnected("connection task ended")));
        guard.armed = false;
        result
    }

    /// Write one frame to TORADIO. Completes once the radio acknowledged it,
    /// or immediately when the endpoint takes unacknowledged writes.
    pub async fn send(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Send(data.into(), tx))?;
        rx.await
            .unwrap_or_else(|_| Err(TransportError::disconnected("connection task ended")))
    }

    /// Read one frame from FROMRADIO. An empty frame means nothing is queued.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Read(tx))?;
        rx.await
            .unwrap_or_else(|_| Err(TransportError::disconnected("connection task ended")))
    }

    /// End the session. `reason` is reported on the event stream as an
    /// `Error` event; without it a plain `Disconnected` is emitted.
    pub async fn disconnect(
        &self,
        reason: Option<TransportError>,
        should_reconnect: bool,
    ) -> Result<()> {
        let (done, rx) = oneshot::channel();
        if self
            .inbox
            .send(Command::Disconnect {
                cause: reason,
                should_reconnect,
                done,
            })
            .is_err()
        {
            // Already torn down
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Suspend signal polling while the host app is in the background
    pub fn app_did_enter_background(&self) {
        let _ = self.inbox.send(Command::EnterBackground);
    }

    /// Resume signal polling when the host app returns to the foreground
    pub fn app_did_become_active(&self) {
        let _ = self.inbox.send(Command::BecomeActive);
    }

    pub(crate) fn deliver(&self, event: HardwareEvent) {
        let _ = self.inbox.send(Command::Hardware(event));
    }

    pub(crate) fn fail(&self, cause: TransportError) {
        let _ = self.inbox.send(Command::Fail(cause));
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inbox
            .send(command)
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Rolls back a `connect()` whose future was dropped mid-flight
struct ConnectGuard<'a> {
    connection: &'a Connection,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let connection = self.connection;
        info!(device = %connection.device.id, "Connect cancelled, releasing link");
        connection.central.cancel_connect(&connection.device.id);
        let _ = connection.inbox.send(Command::CancelConnect);
        (connection.on_end)(SessionEnd::Cancelled);
    }
}

/// Endpoint facts needed after resolution
#[derive(Debug, Clone, Copy)]
struct ResolvedEndpoints {
    write: EndpointProperties,
    has_log: bool,
}

fn resolve_endpoints(discovered: &[DiscoveredEndpoint]) -> Result<ResolvedEndpoints> {
    let find = |endpoint: Endpoint| discovered.iter().find(|d| d.endpoint == endpoint);

    match (
        find(Endpoint::ToRadio),
        find(Endpoint::FromRadio),
        find(Endpoint::FromNum),
    ) {
        (Some(write), Some(_), Some(_)) => Ok(ResolvedEndpoints {
            write: write.properties,
            has_log: find(Endpoint::LogRadio).is_some(),
        }),
        _ => Err(TransportError::discovery("Missing required characteristics")),
    }
}

struct Session {
    id: DeviceId,
    central: Arc<dyn RadioCentral>,
    config: LinkConfig,
    log_formatter: LogFormatter,
    on_end: EndHook,
    inbox: mpsc::UnboundedSender<Command>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    /// False once the stack reported the link gone
    link_up: bool,
    endpoints: Option<ResolvedEndpoints>,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    pending_connect: Option<oneshot::Sender<Result<ConnectionEvents>>>,
    writes: VecDeque<oneshot::Sender<Result<()>>>,
    reads: VecDeque<oneshot::Sender<Result<Vec<u8>>>>,
    poller: Option<JoinHandle<()>>,
    drainer: Option<JoinHandle<()>>,
    drain_wake: Arc<Notify>,
}

impl Session {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!(device = %self.id, "Connection task started");
        while let Some(command) = rx.recv().await {
            self.handle(command);
            if self.state.is_terminal() {
                break;
            }
        }
        if !self.state.is_terminal() {
            self.teardown(None, false, true);
        }
        debug!(device = %self.id, "Connection task ended");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.begin_connect(reply),
            Command::CancelConnect => {
                self.teardown(Some(TransportError::Cancelled), false, false);
            }
            Command::Send(data, reply) => self.send(data, reply),
            Command::Read(reply) => self.read(reply),
            Command::Disconnect {
                cause,
                should_reconnect,
                done,
            } => {
                self.teardown(cause, should_reconnect, true);
                let _ = done.send(());
            }
            Command::Fail(cause) => self.fail(cause),
            Command::Hardware(event) => self.on_hardware(event),
            Command::Deliver(frame) => {
                trace!(device = %self.id, len = frame.len(), frame = %hex::encode(&frame), "RX");
                self.emit(ConnectionEvent::Data(frame));
            }
            Command::EnterBackground => {
                if let Some(poller) = self.poller.take() {
                    info!(device = %self.id, "App entering background, suspending signal reports");
                    poller.abort();
                }
            }
            Command::BecomeActive => {
                if self.poller.is_none() && self.state == ConnectionState::Ready {
                    info!(device = %self.id, "App is active, restarting signal reports");
                    self.start_poller();
                }
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!(device = %self.id, from = %self.state, to = %state, "Connection state change");
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events
            && events.send(event).is_err()
        {
            debug!(device = %self.id, "Event stream dropped by consumer");
        }
    }

    fn begin_connect(&mut self, reply: oneshot::Sender<Result<ConnectionEvents>>) {
        if self.state != ConnectionState::Idle {
            let _ = reply.send(Err(TransportError::InvalidState(format!(
                "connect() called in state {}",
                self.state
            ))));
            return;
        }
        self.pending_connect = Some(reply);
        self.set_state(ConnectionState::Connecting);
        info!(device = %self.id, "Discovering mesh service");
        self.central.discover_services(&self.id);
    }

    fn send(&mut self, data: Vec<u8>, reply: oneshot::Sender<Result<()>>) {
        let Some(endpoints) = self.endpoints.filter(|_| self.state == ConnectionState::Ready)
        else {
            let _ = reply.send(Err(TransportError::NotConnected));
            return;
        };

        trace!(device = %self.id, len = data.len(), frame = %hex::encode(&data), "TX");
        if endpoints.write.write_without_response {
            self.central
                .write(&self.id, data, WriteMode::WithoutResponse);
            let _ = reply.send(Ok(()));
        } else if endpoints.write.write {
            self.writes.push_back(reply);
            self.central.write(&self.id, data, WriteMode::WithResponse);
        } else {
            let _ = reply.send(Err(TransportError::io(
                "Characteristic does not support write",
            )));
        }
    }

    fn read(&mut self, reply: oneshot::Sender<Result<Vec<u8>>>) {
        if self.state != ConnectionState::Ready {
            let _ = reply.send(Err(TransportError::NotConnected));
            return;
        }
        self.reads.push_back(reply);
        self.central.read(&self.id, Endpoint::FromRadio);
    }

    fn on_hardware(&mut self, event: HardwareEvent) {
        match event {
            HardwareEvent::ServicesDiscovered { result, .. } => self.on_services(result),
            HardwareEvent::EndpointsDiscovered { result, .. } => self.on_endpoints(result),
            HardwareEvent::ValueUpdated {
                endpoint, result, ..
            } => self.on_value(endpoint, result),
            HardwareEvent::WriteCompleted { result, .. } => self.on_write_completed(result),
            HardwareEvent::SignalRead { result, .. } => match result {
                Ok(rssi) => self.emit(ConnectionEvent::SignalUpdated(rssi)),
                Err(e) => warn!(device = %self.id, "Error reading signal strength: {}", e),
            },
            HardwareEvent::Disconnected { error, .. } => {
                self.link_up = false;
                let cause = error
                    .map(TransportError::Hardware)
                    .unwrap_or_else(|| TransportError::link_lost("BLE connection lost"));
                self.fail(cause);
            }
            other => debug!(device = %self.id, "Ignoring hardware event {:?}", other),
        }
    }

    fn on_services(&mut self, result: std::result::Result<bool, HardwareError>) {
        if self.state != ConnectionState::Connecting {
            debug!(device = %self.id, "Services discovered outside of connect, ignoring");
            return;
        }
        match result {
            Ok(true) => {
                info!(device = %self.id, "Mesh service discovered, resolving endpoints");
                self.set_state(ConnectionState::ResolvingEndpoints);
                self.central.discover_endpoints(&self.id);
            }
            Ok(false) => self.fail(TransportError::discovery("Mesh service not found")),
            Err(e) => self.fail(e.into()),
        }
    }

    fn on_endpoints(&mut self, result: std::result::Result<Vec<DiscoveredEndpoint>, HardwareError>) {
        if self.state != ConnectionState::ResolvingEndpoints {
            debug!(device = %self.id, "Endpoints discovered outside of connect, ignoring");
            return;
        }
        let endpoints = match result.map_err(TransportError::from).and_then(|d| resolve_endpoints(&d)) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(device = %self.id, "Endpoint resolution failed: {}", e);
                self.fail(e);
                return;
            }
        };

        info!(device = %self.id, has_log = endpoints.has_log, "Endpoints ready");
        self.endpoints = Some(endpoints);
        self.central.set_notify(&self.id, Endpoint::FromNum, true);
        if endpoints.has_log {
            self.central.set_notify(&self.id, Endpoint::LogRadio, true);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events = Some(events_tx);

        self.central.read_signal(&self.id);
        self.start_poller();
        self.drainer = Some(spawn_drain_worker(
            self.inbox.clone(),
            self.drain_wake.clone(),
        ));
        self.set_state(ConnectionState::Ready);

        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Ok(EventStream::new(events_rx)));
        }
    }

    fn on_value(&mut self, endpoint: Endpoint, result: std::result::Result<Vec<u8>, HardwareError>) {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                debug!(device = %self.id, %endpoint, "Error updating value: {}", e);
                if endpoint == Endpoint::FromRadio
                    && let Some(reply) = self.reads.pop_front()
                {
                    let _ = reply.send(Err(e.clone().into()));
                }
                self.fail(e.into());
                return;
            }
        };

        match endpoint {
            Endpoint::FromRadio => match self.reads.pop_front() {
                Some(reply) => {
                    if value.is_empty() {
                        trace!(device = %self.id, "Received empty frame, nothing left to drain");
                    }
                    let _ = reply.send(Ok(value));
                }
                None => warn!(device = %self.id, "FROMRADIO value with no pending read"),
            },
            Endpoint::FromNum => {
                if self.state == ConnectionState::Ready {
                    self.drain_wake.notify_one();
                }
            }
            Endpoint::LogRadio => {
                if let Some(line) = (self.log_formatter)(&value) {
                    self.emit(ConnectionEvent::LogLine(line));
                }
            }
            Endpoint::ToRadio => {}
        }
    }

    fn on_write_completed(&mut self, result: std::result::Result<(), HardwareError>) {
        let Some(reply) = self.writes.pop_front() else {
            error!(device = %self.id, "Write completion with no waiting sender");
            return;
        };
        match result {
            Ok(()) => {
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                error!(device = %self.id, "Write failed: {}", e);
                let _ = reply.send(Err(e.clone().into()));
                self.fail(e.into());
            }
        }
    }

    fn start_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.poller = Some(spawn_signal_poller(
            self.central.clone(),
            self.id.clone(),
            self.config.signal_poll_interval,
        ));
    }

    fn fail(&mut self, cause: TransportError) {
        let reconnect = should_reconnect(&cause);
        warn!(device = %self.id, should_reconnect = reconnect, "Connection failed: {}", cause);
        self.teardown(Some(cause), reconnect, true);
    }

    /// The one exit path. Releases hardware resources, stops background tasks,
    /// fails every pending completion, then emits the terminal event and closes
    /// the stream. `release_link` is false when the link was already released.
    fn teardown(&mut self, cause: Option<TransportError>, should_reconnect: bool, release_link: bool) {
        if self.state.is_terminal() {
            return;
        }
        info!(device = %self.id, ?cause, should_reconnect, "Disconnecting");
        let end = match &cause {
            Some(cause) if cause.is_cancelled() => SessionEnd::Cancelled,
            _ => SessionEnd::Closed,
        };

        if release_link {
            if self.link_up
                && let Some(endpoints) = self.endpoints
            {
                self.central.set_notify(&self.id, Endpoint::FromNum, false);
                if endpoints.has_log {
                    self.central.set_notify(&self.id, Endpoint::LogRadio, false);
                }
            }
            self.central.cancel_connect(&self.id);
        }

        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if let Some(drainer) = self.drainer.take() {
            drainer.abort();
        }

        let reason = cause
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "connection closed".to_string());
        for reply in self.writes.drain(..) {
            let _ = reply.send(Err(TransportError::disconnected(reason.clone())));
        }
        for reply in self.reads.drain(..) {
            let _ = reply.send(Err(TransportError::disconnected(reason.clone())));
        }
        if let Some(reply) = self.pending_connect.take() {
            let err = cause
                .clone()
                .unwrap_or_else(|| TransportError::disconnected("disconnected while connecting"));
            let _ = reply.send(Err(err));
        }

        if let Some(events) = self.events.take() {
            let terminal = match cause {
                Some(cause) => ConnectionEvent::Error {
                    should_reconnect,
                    cause,
                },
                None => ConnectionEvent::Disconnected { should_reconnect },
            };
            let _ = events.send(terminal);
        }

        self.set_state(ConnectionState::Disconnected);
        (self.on_end)(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::EndpointProperties;

    fn endpoint(endpoint: Endpoint) -> DiscoveredEndpoint {
        DiscoveredEndpoint {
            endpoint,
            properties: EndpointProperties::default(),
        }
    }

    #[test]
    fn test_resolve_requires_mandatory_endpoints() {
        let all = [
            endpoint(Endpoint::ToRadio),
            endpoint(Endpoint::FromRadio),
            endpoint(Endpoint::FromNum),
        ];
        let resolved = resolve_endpoints(&all);
        assert!(resolved.is_ok_and(|r| !r.has_log));

        for missing in 0..all.len() {
            let partial: Vec<_> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != missing)
                .map(|(_, e)| *e)
                .collect();
            assert_eq!(
                resolve_endpoints(&partial).err(),
                Some(TransportError::discovery("Missing required characteristics"))
            );
        }
    }

    #[test]
    fn test_resolve_optional_log() {
        let all = [
            endpoint(Endpoint::LogRadio),
            endpoint(Endpoint::ToRadio),
            endpoint(Endpoint::FromRadio),
            endpoint(Endpoint::FromNum),
        ];
        assert!(resolve_endpoints(&all).is_ok_and(|r| r.has_log));
    }

    #[test]
    fn test_utf8_log_formatter() {
        let format = utf8_log_formatter();
        assert_eq!(format(b"DEBUG | radio up\n"), Some("DEBUG | radio up".to_string()));
        assert_eq!(format(b"  \n"), None);
    }
}
