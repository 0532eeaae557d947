use std::sync::Mutex;
use tokio::sync::{broadcast, watch};

use crate::device::telemetry::SensorValues;
use crate::device::types::{Activity, BleState, ConnectionState, DiscoveredDevice, Notice, TransportKind};
use crate::error::LinkError;
use crate::workers::lock;

const NOTICE_CAPACITY: usize = 16;

/// Observable link state. Every container is a snapshot: a new subscriber immediately sees the
/// last published value, then every later one. Ordering holds per container, never across them.
pub struct LinkState {
    classic: watch::Sender<ConnectionState>,
    ble: watch::Sender<BleState>,
    is_connected: watch::Sender<bool>,
    activity: watch::Sender<Activity>,
    devices: watch::Sender<Vec<DiscoveredDevice>>,
    sensor_values: watch::Sender<SensorValues>,
    inferred_text: watch::Sender<String>,
    notices: broadcast::Sender<Notice>,
    /// The transport that is connecting or connected, held from the start of its connect
    /// until it disconnects, fails or loses the link.
    active: Mutex<Option<TransportKind>>,
}

impl LinkState {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        LinkState {
            classic: watch::channel(ConnectionState::Disconnected).0,
            ble: watch::channel(BleState::Idle).0,
            is_connected: watch::channel(false).0,
            activity: watch::channel(Activity::Idle).0,
            devices: watch::channel(Vec::new()).0,
            sensor_values: watch::channel(SensorValues::default()).0,
            inferred_text: watch::channel(String::new()).0,
            notices,
            active: Mutex::new(None),
        }
    }

    /// Reserves the link for `kind`. Fails while the other transport holds it.
    pub fn claim(&self, kind: TransportKind) -> Result<(), LinkError> {
        let mut active = lock(&self.active);
        match *active {
            Some(other) if other != kind => Err(LinkError::AlreadyConnected(other)),
            _ => {
                *active = Some(kind);
                Ok(())
            },
        }
    }

    /// Gives up the link, if `kind` holds it.
    pub fn release(&self, kind: TransportKind) {
        let mut active = lock(&self.active);
        if *active == Some(kind) {
            *active = None;
        }
    }

    pub fn active_transport(&self) -> Option<TransportKind> {
        *lock(&self.active)
    }

    pub fn publish_classic(&self, state: ConnectionState) {
        self.classic.send_replace(state);
        self.refresh_is_connected();
    }

    pub fn publish_ble(&self, state: BleState) {
        self.ble.send_replace(state);
        self.refresh_is_connected();
    }

    fn refresh_is_connected(&self) {
        let connected = self.connected_transport().is_some();
        self.is_connected.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
    }

    pub fn publish_activity(&self, activity: Activity) {
        self.activity.send_replace(activity);
    }

    pub fn publish_devices(&self, devices: Vec<DiscoveredDevice>) {
        self.devices.send_replace(devices);
    }

    pub fn publish_sensor_values(&self, values: SensorValues) {
        self.sensor_values.send_replace(values);
    }

    pub fn publish_inferred_text(&self, text: String) {
        self.inferred_text.send_replace(text);
    }

    pub fn notify(&self, notice: Notice) {
        // nobody listening is fine: notices are not retained
        let _ = self.notices.send(notice);
    }

    pub fn classic_state(&self) -> ConnectionState {
        self.classic.borrow().clone()
    }

    pub fn ble_state(&self) -> BleState {
        self.ble.borrow().clone()
    }

    pub fn activity(&self) -> Activity {
        self.activity.borrow().clone()
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.borrow().clone()
    }

    pub fn sensor_values(&self) -> SensorValues {
        self.sensor_values.borrow().clone()
    }

    pub fn inferred_text(&self) -> String {
        self.inferred_text.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.is_connected.borrow()
    }

    pub fn connected_transport(&self) -> Option<TransportKind> {
        if self.classic.borrow().is_connected() {
            Some(TransportKind::Classic)
        } else if self.ble.borrow().connection_state().is_connected() {
            Some(TransportKind::Ble)
        } else {
            None
        }
    }

    pub fn subscribe_classic(&self) -> watch::Receiver<ConnectionState> {
        self.classic.subscribe()
    }

    pub fn subscribe_ble(&self) -> watch::Receiver<BleState> {
        self.ble.subscribe()
    }

    pub fn subscribe_is_connected(&self) -> watch::Receiver<bool> {
        self.is_connected.subscribe()
    }

    pub fn subscribe_activity(&self) -> watch::Receiver<Activity> {
        self.activity.subscribe()
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.devices.subscribe()
    }

    pub fn subscribe_sensor_values(&self) -> watch::Receiver<SensorValues> {
        self.sensor_values.subscribe()
    }

    pub fn subscribe_inferred_text(&self) -> watch::Receiver<String> {
        self.inferred_text.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}

impl Default for LinkState {
    fn default() -> Self {
        LinkState::new()
    }
}
