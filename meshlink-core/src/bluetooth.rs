//! Radio hardware backend built on btleplug.
//!
//! Requests are queued to a worker task that owns the adapter. Each link gets
//! its own task that connects and then performs I/O strictly in request
//! order, so write completions come back in submission order.

use btleplug::api::{
    CentralEvent, CentralState, CharPropFlags, Characteristic, Central as _, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::device::DeviceId;
use crate::error::{HardwareError, HardwareErrorKind};
use crate::hardware::{
    DiscoveredEndpoint, Endpoint, EndpointProperties, HardwareEvent, HardwareEventSink,
    MESH_SERVICE_UUID, RadioCentral, StackState, WriteMode,
};

/// Reported when the stack has no RSSI for an advertisement
const UNKNOWN_RSSI: i16 = -100;

enum Request {
    Scan,
    StopScan,
    Connect(DeviceId),
    CancelConnect(DeviceId),
    Link(DeviceId, LinkRequest),
}

enum LinkRequest {
    DiscoverServices,
    DiscoverEndpoints,
    SetNotify(Endpoint, bool),
    Write(Vec<u8>, WriteMode),
    Read(Endpoint),
    ReadSignal,
}

/// [`RadioCentral`] for the host's first Bluetooth adapter
pub struct BtleplugCentral {
    requests: mpsc::UnboundedSender<Request>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
}

impl Default for BtleplugCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl BtleplugCentral {
    pub fn new() -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        Self {
            requests,
            pending: Mutex::new(Some(rx)),
        }
    }

    fn request(&self, request: Request) {
        if self.requests.send(request).is_err() {
            warn!("Bluetooth worker is not running, request dropped");
        }
    }

    fn link(&self, id: &DeviceId, request: LinkRequest) {
        self.request(Request::Link(id.clone(), request));
    }
}

impl RadioCentral for BtleplugCentral {
    fn start(&self, sink: HardwareEventSink) {
        let requests = self.pending.lock().ok().and_then(|mut pending| pending.take());
        match requests {
            Some(requests) => {
                tokio::spawn(run_worker(requests, sink));
            }
            None => warn!("Bluetooth backend already started"),
        }
    }

    fn scan(&self) {
        self.request(Request::Scan);
    }

    fn stop_scan(&self) {
        self.request(Request::StopScan);
    }

    fn connect(&self, id: &DeviceId) {
        self.request(Request::Connect(id.clone()));
    }

    fn cancel_connect(&self, id: &DeviceId) {
        self.request(Request::CancelConnect(id.clone()));
    }

    fn discover_services(&self, id: &DeviceId) {
        self.link(id, LinkRequest::DiscoverServices);
    }

    fn discover_endpoints(&self, id: &DeviceId) {
        self.link(id, LinkRequest::DiscoverEndpoints);
    }

    fn set_notify(&self, id: &DeviceId, endpoint: Endpoint, enabled: bool) {
        self.link(id, LinkRequest::SetNotify(endpoint, enabled));
    }

    fn write(&self, id: &DeviceId, data: Vec<u8>, mode: WriteMode) {
        self.link(id, LinkRequest::Write(data, mode));
    }

    fn read(&self, id: &DeviceId, endpoint: Endpoint) {
        self.link(id, LinkRequest::Read(endpoint));
    }

    fn read_signal(&self, id: &DeviceId) {
        self.link(id, LinkRequest::ReadSignal);
    }
}

/// The ATT status code in a stack message such as
/// "Operation failed with ATT error: 0x05"
fn att_code(message: &str) -> Option<u8> {
    let (_, rest) = message.split_once("ATT error: 0x")?;
    let digits: String = rest.chars().take_while(char::is_ascii_hexdigit).collect();
    u8::from_str_radix(&digits, 16).ok()
}

fn hardware_error(err: btleplug::Error) -> HardwareError {
    let message = err.to_string();
    let kind = match &err {
        btleplug::Error::PermissionDenied => HardwareErrorKind::AttAuthorization,
        btleplug::Error::DeviceNotFound => HardwareErrorKind::UnknownDevice,
        btleplug::Error::NotConnected => HardwareErrorKind::NotConnected,
        btleplug::Error::NotSupported(_) => HardwareErrorKind::OperationNotSupported,
        btleplug::Error::TimedOut(_) => HardwareErrorKind::ConnectionTimeout,
        _ => att_code(&message)
            .map(HardwareErrorKind::from_att_code)
            .unwrap_or(HardwareErrorKind::Unknown),
    };
    HardwareError::new(kind, message)
}

fn stack_state(state: CentralState) -> StackState {
    match state {
        CentralState::PoweredOn => StackState::PoweredOn,
        CentralState::PoweredOff => StackState::PoweredOff,
        _ => StackState::Unknown,
    }
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::new(format!("{id:?}"))
}

fn endpoint_properties(flags: CharPropFlags) -> EndpointProperties {
    EndpointProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
    }
}

async fn first_adapter() -> btleplug::Result<Option<Adapter>> {
    let manager = Manager::new().await?;
    Ok(manager.adapters().await?.into_iter().next())
}

async fn run_worker(requests: mpsc::UnboundedReceiver<Request>, sink: HardwareEventSink) {
    let adapter = match first_adapter().await {
        Ok(Some(adapter)) => adapter,
        Ok(None) => {
            error!("No Bluetooth adapters found");
            sink.emit(HardwareEvent::StateChanged(StackState::Unsupported));
            return;
        }
        Err(btleplug::Error::PermissionDenied) => {
            error!("Bluetooth access denied");
            sink.emit(HardwareEvent::StateChanged(StackState::Unauthorized));
            return;
        }
        Err(e) => {
            error!("Failed to initialise Bluetooth: {}", e);
            sink.emit(HardwareEvent::StateChanged(StackState::PoweredOff));
            return;
        }
    };

    let events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to subscribe to adapter events: {}", e);
            sink.emit(HardwareEvent::StateChanged(StackState::PoweredOff));
            return;
        }
    };

    let state = match adapter.adapter_state().await {
        Ok(state) => stack_state(state),
        // Not every platform reports adapter power; an adapter that answered is usable
        Err(e) => {
            debug!("Adapter state unavailable: {}", e);
            StackState::PoweredOn
        }
    };
    info!(%state, "Bluetooth adapter ready");
    sink.emit(HardwareEvent::StateChanged(state));

    let worker = Worker {
        adapter,
        sink,
        peripherals: HashMap::new(),
        links: HashMap::new(),
    };
    worker.run(requests, events).await;
}

struct LinkHandle {
    requests: mpsc::UnboundedSender<LinkRequest>,
    task: JoinHandle<()>,
}

struct Worker {
    adapter: Adapter,
    sink: HardwareEventSink,
    peripherals: HashMap<DeviceId, Peripheral>,
    links: HashMap<DeviceId, LinkHandle>,
}

impl Worker {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                event = events.next() => match event {
                    Some(event) => self.on_central_event(event).await,
                    None => {
                        warn!("Adapter event stream ended");
                        self.sink.emit(HardwareEvent::StateChanged(StackState::PoweredOff));
                        break;
                    }
                },
            }
        }

        for (_, link) in self.links.drain() {
            link.task.abort();
        }
        debug!("Bluetooth worker stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Scan => {
                let filter = ScanFilter {
                    services: vec![MESH_SERVICE_UUID],
                };
                if let Err(e) = self.adapter.start_scan(filter).await {
                    error!("Failed to start scan: {}", e);
                }
            }
            Request::StopScan => {
                if let Err(e) = self.adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            Request::Connect(id) => self.connect(id),
            Request::CancelConnect(id) => {
                if let Some(link) = self.links.remove(&id) {
                    link.task.abort();
                }
                if let Some(peripheral) = self.peripherals.get(&id).cloned() {
                    tokio::spawn(async move {
                        if let Err(e) = peripheral.disconnect().await {
                            debug!("Disconnect after cancel failed: {}", e);
                        }
                    });
                }
            }
            Request::Link(id, request) => match self.links.get(&id) {
                Some(link) => {
                    let _ = link.requests.send(request);
                }
                None => debug!(device = %id, "No link for request, dropping"),
            },
        }
    }

    fn connect(&mut self, id: DeviceId) {
        let Some(peripheral) = self.peripherals.get(&id).cloned() else {
            self.sink.emit(HardwareEvent::ConnectFailed {
                id,
                error: Some(HardwareError::new(
                    HardwareErrorKind::UnknownDevice,
                    "Peripheral has not been discovered",
                )),
            });
            return;
        };
        if let Some(stale) = self.links.remove(&id) {
            stale.task.abort();
        }

        let (requests, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_link(id.clone(), peripheral, self.sink.clone(), rx));
        self.links.insert(id, LinkHandle { requests, task });
    }

    async fn on_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(pid) | CentralEvent::DeviceUpdated(pid) => {
                self.on_advertisement(pid).await;
            }
            CentralEvent::StateUpdate(state) => {
                let state = stack_state(state);
                info!(%state, "Adapter state changed");
                if state != StackState::PoweredOn {
                    // Links do not survive the adapter going down
                    for (_, link) in self.links.drain() {
                        link.task.abort();
                    }
                }
                self.sink.emit(HardwareEvent::StateChanged(state));
            }
            CentralEvent::DeviceDisconnected(pid) => {
                let id = device_id(&pid);
                if let Some(link) = self.links.remove(&id) {
                    link.task.abort();
                    self.sink.emit(HardwareEvent::Disconnected { id, error: None });
                }
            }
            other => trace!("Ignoring adapter event: {:?}", other),
        }
    }

    async fn on_advertisement(&mut self, pid: PeripheralId) {
        let peripheral = match self.adapter.peripheral(&pid).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!("Advertisement for unknown peripheral: {}", e);
                return;
            }
        };
        let Ok(Some(properties)) = peripheral.properties().await else {
            return;
        };
        if !properties.services.contains(&MESH_SERVICE_UUID) {
            return;
        }

        let id = device_id(&pid);
        self.peripherals.insert(id.clone(), peripheral);
        self.sink.emit(HardwareEvent::Advertisement {
            id,
            name: properties.local_name,
            rssi: properties.rssi.unwrap_or(UNKNOWN_RSSI),
        });
    }
}

/// Connect, then serve the link's I/O requests one at a time
async fn run_link(
    id: DeviceId,
    peripheral: Peripheral,
    sink: HardwareEventSink,
    mut requests: mpsc::UnboundedReceiver<LinkRequest>,
) {
    if let Err(e) = peripheral.connect().await {
        sink.emit(HardwareEvent::ConnectFailed {
            id,
            error: Some(hardware_error(e)),
        });
        return;
    }
    sink.emit(HardwareEvent::Connected(id.clone()));

    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(device = %id, "Notifications unavailable: {}", e);
            None
        }
    };

    let mut link = Link {
        id,
        peripheral,
        sink,
        characteristics: HashMap::new(),
    };

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => link.handle(request).await,
                None => break,
            },
            Some(notification) = async {
                match notifications.as_mut() {
                    Some(stream) => stream.next().await,
                    None => std::future::pending().await,
                }
            } => {
                if let Some(endpoint) = Endpoint::from_uuid(notification.uuid) {
                    link.sink.emit(HardwareEvent::ValueUpdated {
                        id: link.id.clone(),
                        endpoint,
                        result: Ok(notification.value),
                    });
                }
            }
        }
    }
}

struct Link {
    id: DeviceId,
    peripheral: Peripheral,
    sink: HardwareEventSink,
    characteristics: HashMap<Endpoint, Characteristic>,
}

impl Link {
    fn characteristic(&self, endpoint: Endpoint) -> Result<&Characteristic, HardwareError> {
        self.characteristics.get(&endpoint).ok_or_else(|| {
            HardwareError::new(
                HardwareErrorKind::InvalidHandle,
                format!("{endpoint} has not been resolved"),
            )
        })
    }

    async fn handle(&mut self, request: LinkRequest) {
        let id = self.id.clone();
        match request {
            LinkRequest::DiscoverServices => {
                let result = self
                    .peripheral
                    .discover_services()
                    .await
                    .map(|_| {
                        self.peripheral
                            .services()
                            .iter()
                            .any(|s| s.uuid == MESH_SERVICE_UUID)
                    })
                    .map_err(hardware_error);
                self.sink
                    .emit(HardwareEvent::ServicesDiscovered { id, result });
            }
            LinkRequest::DiscoverEndpoints => {
                self.characteristics = self
                    .peripheral
                    .characteristics()
                    .into_iter()
                    .filter(|c| c.service_uuid == MESH_SERVICE_UUID)
                    .filter_map(|c| Endpoint::from_uuid(c.uuid).map(|e| (e, c)))
                    .collect();
                let discovered = self
                    .characteristics
                    .iter()
                    .map(|(endpoint, c)| DiscoveredEndpoint {
                        endpoint: *endpoint,
                        properties: endpoint_properties(c.properties),
                    })
                    .collect();
                self.sink.emit(HardwareEvent::EndpointsDiscovered {
                    id,
                    result: Ok(discovered),
                });
            }
            LinkRequest::SetNotify(endpoint, enabled) => {
                let result = match self.characteristic(endpoint) {
                    Ok(c) if enabled => self.peripheral.subscribe(c).await.map_err(hardware_error),
                    Ok(c) => self.peripheral.unsubscribe(c).await.map_err(hardware_error),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(device = %id, %endpoint, enabled, "Failed to change notifications: {}", e);
                }
            }
            LinkRequest::Write(data, mode) => {
                let write_type = match mode {
                    WriteMode::WithResponse => WriteType::WithResponse,
                    WriteMode::WithoutResponse => WriteType::WithoutResponse,
                };
                let result = match self.characteristic(Endpoint::ToRadio) {
                    Ok(c) => self
                        .peripheral
                        .write(c, &data, write_type)
                        .await
                        .map_err(hardware_error),
                    Err(e) => Err(e),
                };
                match mode {
                    WriteMode::WithResponse => {
                        self.sink.emit(HardwareEvent::WriteCompleted { id, result });
                    }
                    WriteMode::WithoutResponse => {
                        if let Err(e) = result {
                            warn!(device = %id, "Unacknowledged write failed: {}", e);
                        }
                    }
                }
            }
            LinkRequest::Read(endpoint) => {
                let result = match self.characteristic(endpoint) {
                    Ok(c) => self.peripheral.read(c).await.map_err(hardware_error),
                    Err(e) => Err(e),
                };
                self.sink.emit(HardwareEvent::ValueUpdated {
                    id,
                    endpoint,
                    result,
                });
            }
            LinkRequest::ReadSignal => {
                let result = match self.peripheral.properties().await {
                    Ok(Some(properties)) => properties.rssi.ok_or_else(|| {
                        HardwareError::new(HardwareErrorKind::Unknown, "RSSI unavailable")
                    }),
                    Ok(None) => Err(HardwareError::new(
                        HardwareErrorKind::UnknownDevice,
                        "Peripheral properties unavailable",
                    )),
                    Err(e) => Err(hardware_error(e)),
                };
                self.sink.emit(HardwareEvent::SignalRead { id, result });
            }
        }
    }
}
