//! Scripted radios for tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use btleplug::api::{CharPropFlags, Characteristic, Descriptor, Service, ValueNotification};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::watch;
use uuid::Uuid;

use crate::device::constants::{CLIENT_CHARACTERISTIC_CONFIG, UART_CHARACTERISTIC, UART_SERVICE};
use crate::device::types::{DiscoveredDevice, TransportKind};
use crate::error::LinkError;
use crate::link::permission::{Permission, PermissionGate};
use crate::transport::{ClassicConnector, GattPeripheral, Radio};
use crate::workers::lock;

/// Waits until the watched value satisfies `accept`, failing the test after five seconds.
pub async fn wait_until<T: Clone>(receiver: &mut watch::Receiver<T>, accept: impl Fn(&T) -> bool) -> T {
    let wait = async {
        loop {
            {
                let value = receiver.borrow_and_update();
                if accept(&value) {
                    return value.clone();
                }
            }
            receiver.changed().await.expect("state sender dropped");
        }
    };

    tokio::time::timeout(Duration::from_secs(5), wait).await.expect("timed out waiting for state")
}

#[derive(Default)]
struct RadioInner {
    unsupported: HashSet<TransportKind>,
    fail_scan: bool,
    scans: HashMap<TransportKind, UnboundedSender<DiscoveredDevice>>,
    started: Vec<TransportKind>,
    stopped: Vec<TransportKind>,
    peripherals: HashMap<String, FakePeripheral>,
}

#[derive(Clone, Default)]
pub struct FakeRadio {
    inner: Arc<Mutex<RadioInner>>,
}

impl FakeRadio {
    pub fn new() -> Self {
        FakeRadio::default()
    }

    pub fn set_supported(&self, kind: TransportKind, supported: bool) {
        let mut inner = lock(&self.inner);
        if supported {
            inner.unsupported.remove(&kind);
        } else {
            inner.unsupported.insert(kind);
        }
    }

    pub fn fail_scans(&self) {
        lock(&self.inner).fail_scan = true;
    }

    pub fn add_peripheral(&self, address: &str, peripheral: FakePeripheral) {
        lock(&self.inner).peripherals.insert(address.to_string(), peripheral);
    }

    /// Reports a sighting on the running scan of `kind`. Returns false if no scan is running.
    pub fn discover(&self, kind: TransportKind, device: DiscoveredDevice) -> bool {
        match lock(&self.inner).scans.get(&kind) {
            Some(sender) => sender.unbounded_send(device).is_ok(),
            None => false,
        }
    }

    pub fn is_scanning(&self, kind: TransportKind) -> bool {
        lock(&self.inner).scans.contains_key(&kind)
    }

    pub fn started(&self) -> Vec<TransportKind> {
        lock(&self.inner).started.clone()
    }

    pub fn stopped(&self) -> Vec<TransportKind> {
        lock(&self.inner).stopped.clone()
    }
}

impl Radio for FakeRadio {
    type Peripheral = FakePeripheral;

    async fn is_supported(&self, kind: TransportKind) -> bool {
        !lock(&self.inner).unsupported.contains(&kind)
    }

    async fn start_scan(&self, kind: TransportKind) -> Result<BoxStream<'static, DiscoveredDevice>, LinkError> {
        let mut inner = lock(&self.inner);
        if inner.fail_scan {
            return Err(LinkError::from(io::Error::new(io::ErrorKind::Other, "adapter busy")));
        }

        let (sender, receiver) = unbounded();
        inner.scans.insert(kind, sender);
        inner.started.push(kind);
        Ok(receiver.boxed())
    }

    async fn stop_scan(&self, kind: TransportKind) -> Result<(), LinkError> {
        let mut inner = lock(&self.inner);
        inner.scans.remove(&kind);
        inner.stopped.push(kind);
        Ok(())
    }

    async fn peripheral(&self, address: &str) -> Result<FakePeripheral, LinkError> {
        lock(&self.inner).peripherals
            .get(address)
            .cloned()
            .ok_or_else(|| LinkError::DeviceNotFound(address.to_string()))
    }
}

struct PeripheralInner {
    services: Vec<Service>,
    fail_connect: bool,
    fail_descriptor_write: bool,
    discovery_delay: Option<Duration>,
    connected: bool,
    disconnects: usize,
    subscribed: Vec<Uuid>,
    descriptor_writes: Vec<(Uuid, Vec<u8>)>,
    writes: Vec<Vec<u8>>,
    notifications: Option<UnboundedSender<ValueNotification>>,
}

#[derive(Clone)]
pub struct FakePeripheral {
    inner: Arc<Mutex<PeripheralInner>>,
}

fn uart_service(with_cccd: bool) -> Service {
    let mut descriptors = BTreeSet::new();
    if with_cccd {
        descriptors.insert(Descriptor {
            uuid: CLIENT_CHARACTERISTIC_CONFIG,
            service_uuid: UART_SERVICE,
            characteristic_uuid: UART_CHARACTERISTIC,
        });
    }

    let characteristic = Characteristic {
        uuid: UART_CHARACTERISTIC,
        service_uuid: UART_SERVICE,
        properties: CharPropFlags::READ | CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::NOTIFY,
        descriptors,
    };

    Service {
        uuid: UART_SERVICE,
        primary: true,
        characteristics: BTreeSet::from([characteristic]),
    }
}

impl FakePeripheral {
    fn with_services(services: Vec<Service>) -> Self {
        FakePeripheral {
            inner: Arc::new(Mutex::new(PeripheralInner {
                services,
                fail_connect: false,
                fail_descriptor_write: false,
                discovery_delay: None,
                connected: false,
                disconnects: 0,
                subscribed: Vec::new(),
                descriptor_writes: Vec::new(),
                writes: Vec::new(),
                notifications: None,
            })),
        }
    }

    /// An HM-10 style module exposing the UART service.
    pub fn uart() -> Self {
        FakePeripheral::with_services(vec![uart_service(true)])
    }

    pub fn without_cccd() -> Self {
        FakePeripheral::with_services(vec![uart_service(false)])
    }

    pub fn without_characteristic() -> Self {
        let mut service = uart_service(true);
        service.characteristics.clear();
        FakePeripheral::with_services(vec![service])
    }

    pub fn without_service() -> Self {
        let battery = Service {
            uuid: Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb),
            primary: true,
            characteristics: BTreeSet::new(),
        };
        FakePeripheral::with_services(vec![battery])
    }

    pub fn fail_connect(self) -> Self {
        lock(&self.inner).fail_connect = true;
        self
    }

    pub fn fail_descriptor_write(self) -> Self {
        lock(&self.inner).fail_descriptor_write = true;
        self
    }

    /// Service discovery takes `delay` before answering.
    pub fn slow_discovery(self, delay: Duration) -> Self {
        lock(&self.inner).discovery_delay = Some(delay);
        self
    }

    /// Emits a notification; returns false if nobody holds the notification stream.
    pub fn notify(&self, uuid: Uuid, value: &[u8]) -> bool {
        match &lock(&self.inner).notifications {
            Some(sender) => sender.unbounded_send(ValueNotification { uuid, value: value.to_vec() }).is_ok(),
            None => false,
        }
    }

    /// Simulates the remote dropping the link: the notification stream ends.
    pub fn drop_link(&self) {
        let mut inner = lock(&self.inner);
        inner.connected = false;
        inner.notifications = None;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.inner).disconnects
    }

    pub fn subscribed(&self) -> Vec<Uuid> {
        lock(&self.inner).subscribed.clone()
    }

    pub fn descriptor_writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.inner).descriptor_writes.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.inner).writes.clone()
    }
}

fn link_lost() -> LinkError {
    LinkError::from(io::Error::new(io::ErrorKind::NotConnected, "peripheral not connected"))
}

impl GattPeripheral for FakePeripheral {
    async fn connect(&self) -> Result<(), LinkError> {
        let mut inner = lock(&self.inner);
        if inner.fail_connect {
            return Err(LinkError::from(io::Error::new(io::ErrorKind::TimedOut, "connection timed out")));
        }
        inner.connected = true;
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<Service>, LinkError> {
        let delay = lock(&self.inner).discovery_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = lock(&self.inner);
        if !inner.connected {
            return Err(link_lost());
        }
        Ok(inner.services.clone())
    }

    async fn set_notify(&self, characteristic: &Characteristic) -> Result<(), LinkError> {
        lock(&self.inner).subscribed.push(characteristic.uuid);
        Ok(())
    }

    async fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<(), LinkError> {
        let mut inner = lock(&self.inner);
        if inner.fail_descriptor_write {
            return Err(LinkError::from(io::Error::new(io::ErrorKind::Other, "descriptor write rejected")));
        }
        inner.descriptor_writes.push((descriptor.uuid, value.to_vec()));
        Ok(())
    }

    async fn write(&self, _characteristic: &Characteristic, value: &[u8]) -> Result<(), LinkError> {
        let mut inner = lock(&self.inner);
        if !inner.connected {
            return Err(link_lost());
        }
        inner.writes.push(value.to_vec());
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, ValueNotification>, LinkError> {
        let (sender, receiver) = unbounded();
        lock(&self.inner).notifications = Some(sender);
        Ok(receiver.boxed())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let mut inner = lock(&self.inner);
        inner.connected = false;
        inner.disconnects += 1;
        inner.notifications = None;
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorInner {
    denied: bool,
    plugged: HashMap<String, DuplexStream>,
    attempts: Vec<(String, Uuid)>,
}

/// Classic connector backed by in-memory pipes.
#[derive(Clone, Default)]
pub struct FakeConnector {
    inner: Arc<Mutex<ConnectorInner>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        FakeConnector::default()
    }

    /// Makes `address` connectable once; returns the remote end of the pipe.
    pub fn plug(&self, address: &str) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(1024);
        lock(&self.inner).plugged.insert(address.to_string(), local);
        remote
    }

    pub fn deny(&self) {
        lock(&self.inner).denied = true;
    }

    pub fn attempts(&self) -> Vec<(String, Uuid)> {
        lock(&self.inner).attempts.clone()
    }
}

impl ClassicConnector for FakeConnector {
    type Stream = DuplexStream;

    async fn connect(&self, address: &str, service: Uuid) -> Result<DuplexStream, LinkError> {
        let mut inner = lock(&self.inner);
        inner.attempts.push((address.to_string(), service));

        if inner.denied {
            return Err(LinkError::from(io::Error::new(io::ErrorKind::PermissionDenied, "rfcomm access denied")));
        }

        inner.plugged
            .remove(address)
            .ok_or_else(|| LinkError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "host is down")))
    }
}

pub struct FakePermissions {
    granted: Mutex<HashSet<Permission>>,
    grant_on_request: AtomicBool,
    requests: AtomicUsize,
}

impl FakePermissions {
    pub fn granted() -> Self {
        FakePermissions {
            granted: Mutex::new(HashSet::from([Permission::Scan, Permission::Connect])),
            grant_on_request: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn missing(grant_on_request: bool) -> Self {
        FakePermissions {
            granted: Mutex::new(HashSet::new()),
            grant_on_request: AtomicBool::new(grant_on_request),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl PermissionGate for FakePermissions {
    fn check(&self, permission: Permission) -> bool {
        lock(&self.granted).contains(&permission)
    }

    fn request(&self, permission: Permission) -> BoxFuture<'_, bool> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let granted = self.grant_on_request.load(Ordering::SeqCst);
        if granted {
            lock(&self.granted).insert(permission);
        }
        future::ready(granted).boxed()
    }
}
