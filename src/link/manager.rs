use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::store::SettingsStore;
use crate::device::constants::SERIAL_PORT_SERVICE;
use crate::device::protocol::{parse_assignment_response, Assignment};
use crate::device::registry::DeviceRegistry;
use crate::device::telemetry::parse_sensor_line;
use crate::device::types::{Activity, BleState, ConnectionState, DiscoveredDevice, Inbound, TransportKind};
use crate::error::{Failure, LinkError};
use crate::link::permission::{Permission, PermissionGate};
use crate::link::state::LinkState;
use crate::transport::ble::{BleSession, InboundSink};
use crate::transport::classic::ClassicSession;
use crate::transport::{ClassicConnector, Radio};
use crate::workers::{lock, Workers};

struct ActiveScan {
    id: u64,
    cancel: CancellationToken,
}

/// Owns both transport sessions and the observable [`LinkState`].
pub struct LinkManager<R: Radio, C: ClassicConnector> {
    radio: Arc<R>,
    state: Arc<LinkState>,
    settings: Arc<dyn SettingsStore>,
    permissions: Arc<dyn PermissionGate>,
    workers: Workers,
    classic: ClassicSession<C>,
    ble: BleSession<R>,
    registry: Arc<Mutex<DeviceRegistry>>,
    scans: Arc<Mutex<HashMap<TransportKind, ActiveScan>>>,
    next_scan: AtomicU64,
    scan_timeout: Option<Duration>,
}

/// Assignment replies become notices, other text is the glove's inferred word.
fn dispatch_inbound(state: &LinkState, message: Inbound) {
    match message {
        Inbound::Telemetry(values) => state.publish_sensor_values(values),
        Inbound::Text(text) => {
            let text = text.trim();

            match parse_assignment_response(text) {
                Some(notice) => {
                    info!("{}", notice);
                    state.notify(notice);
                    state.publish_inferred_text(String::new());
                },
                None => state.publish_inferred_text(text.to_string()),
            }
        },
    }
}

impl<R: Radio, C: ClassicConnector> LinkManager<R, C> {
    pub fn new(radio: R, connector: C, settings: Arc<dyn SettingsStore>, permissions: Arc<dyn PermissionGate>) -> Self {
        let radio = Arc::new(radio);
        let state = Arc::new(LinkState::new());
        let workers = Workers::new();

        let sink_state = state.clone();
        let sink: InboundSink = Arc::new(move |message| dispatch_inbound(&sink_state, message));

        LinkManager {
            classic: ClassicSession::new(connector, settings.clone(), state.clone(), workers.clone()),
            ble: BleSession::new(radio.clone(), state.clone(), workers.clone(), sink),
            radio,
            state,
            settings,
            permissions,
            workers,
            registry: Arc::new(Mutex::new(DeviceRegistry::new())),
            scans: Arc::new(Mutex::new(HashMap::new())),
            next_scan: AtomicU64::new(0),
            scan_timeout: None,
        }
    }

    /// Overrides `Settings.scan_timeout_secs`.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> &Arc<LinkState> {
        &self.state
    }

    /// Checks a permission, asking for it when it is missing.
    pub async fn ensure_permission(&self, permission: Permission) -> bool {
        self.permissions.check(permission) || self.permissions.request(permission).await
    }

    /// Starts a scan that runs until the timeout, or until replaced by another scan of
    /// the same kind. Every newly seen device is published and passed to `on_device`.
    pub async fn start_scan<F>(&self, kind: TransportKind, mut on_device: F) -> Result<(), LinkError>
    where
        F: FnMut(&DiscoveredDevice) + Send + 'static,
    {
        if !self.radio.is_supported(kind).await {
            return Err(self.scan_failed(kind, LinkError::Unsupported(kind)));
        }
        if !self.ensure_permission(Permission::Scan).await {
            return Err(self.scan_failed(kind, LinkError::PermissionDenied("bluetooth scan permission was not granted".to_string())));
        }

        let previous = lock(&self.scans).remove(&kind);
        if let Some(previous) = previous {
            info!("Replacing the running {} scan", kind);
            previous.cancel.cancel();
            if let Err(err) = self.radio.stop_scan(kind).await {
                warn!("Failed to stop the replaced {} scan: {}", kind, err);
            }
        }

        lock(&self.registry).reset();
        self.state.publish_devices(Vec::new());

        let mut devices = match self.radio.start_scan(kind).await {
            Ok(devices) => devices,
            Err(err) => return Err(self.scan_failed(kind, err)),
        };

        let id = self.next_scan.fetch_add(1, Ordering::SeqCst);
        let cancel = self.workers.child_token();
        lock(&self.scans).insert(kind, ActiveScan { id, cancel: cancel.clone() });

        let timeout = self.scan_timeout.unwrap_or_else(|| self.settings.get().scan_timeout());
        info!("Scanning ({}) for {:?}...", kind, timeout);
        if kind == TransportKind::Ble {
            self.ble.mark_scanning(true);
        }
        self.state.publish_activity(Activity::Scanning(kind));

        let radio = self.radio.clone();
        let state = self.state.clone();
        let registry = self.registry.clone();
        let scans = self.scans.clone();
        let ble = self.ble.clone();

        self.workers.spawn("scan", async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            'mainloop: loop {
                let device = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("{} scan {} cancelled", kind, id);
                        return;
                    },
                    _ = &mut deadline => {
                        info!("{} scan timed out", kind);
                        break 'mainloop;
                    },
                    device = devices.next() => device,
                };

                let Some(device) = device else {
                    info!("{} scan ended by the radio", kind);
                    break 'mainloop;
                };

                let listed = {
                    let mut registry = lock(&registry);
                    if registry.add_if_new(device.clone()) {
                        Some(registry.list())
                    } else {
                        None
                    }
                };
                if let Some(listed) = listed {
                    debug!("Found {} {}", device.address, device.display_name());
                    state.publish_devices(listed);
                    on_device(&device);
                }
            }

            let current = {
                let mut scans = lock(&scans);
                match scans.get(&kind) {
                    Some(active) if active.id == id => scans.remove(&kind).is_some(),
                    _ => false,
                }
            };
            if !current {
                return;
            }

            if let Err(err) = radio.stop_scan(kind).await {
                warn!("Failed to stop the {} scan: {}", kind, err);
            }
            if kind == TransportKind::Ble {
                ble.mark_scanning(false);
            }
            state.publish_activity(Activity::ScanFinished(kind));
        });

        Ok(())
    }

    fn scan_failed(&self, kind: TransportKind, err: LinkError) -> LinkError {
        warn!("{} scan failed: {}", kind, err);
        self.state.publish_activity(Activity::ScanFailed(kind, Failure::from(&err)));
        err
    }

    pub fn is_scanning(&self, kind: TransportKind) -> bool {
        lock(&self.scans).contains_key(&kind)
    }

    /// Devices in discovery order.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        lock(&self.registry).list()
    }

    pub fn device(&self, address: &str) -> Option<DiscoveredDevice> {
        lock(&self.registry).get(address).cloned()
    }

    /// Lists the Classic devices with a bound serial port in place of the scan results.
    pub fn load_paired_devices(&self) -> Vec<DiscoveredDevice> {
        let paired = self.settings.get().classic_ports;

        let listed = {
            let mut registry = lock(&self.registry);
            registry.reset();
            for address in paired.into_keys() {
                registry.add_if_new(DiscoveredDevice::new(address, None, TransportKind::Classic));
            }
            registry.list()
        };

        info!("Loaded {} paired devices", listed.len());
        self.state.publish_devices(listed.clone());
        listed
    }

    /// The sessions enforce mutual exclusion themselves by claiming the link.
    async fn check_connect(&self, kind: TransportKind) -> Result<(), LinkError> {
        if !self.radio.is_supported(kind).await {
            return Err(LinkError::Unsupported(kind));
        }
        if !self.ensure_permission(Permission::Connect).await {
            return Err(LinkError::PermissionDenied("bluetooth connect permission was not granted".to_string()));
        }
        Ok(())
    }

    /// Connects over RFCOMM in the background; `on_complete` runs once with the outcome.
    /// Fails while a BLE connect is in progress or established.
    pub async fn connect_classic<F>(&self, address: &str, on_complete: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        if let Err(err) = self.check_connect(TransportKind::Classic).await {
            warn!("Not connecting (Classic) to {}: {}", address, err);
            self.state.publish_classic(ConnectionState::Failed(Failure::from(&err)));
            on_complete(false);
            return;
        }

        self.classic.connect(address, SERIAL_PORT_SERVICE, on_complete);
    }

    pub async fn connect_ble(&self, address: &str) -> Result<(), LinkError> {
        if let Err(err) = self.check_connect(TransportKind::Ble).await {
            warn!("Not connecting (BLE) to {}: {}", address, err);
            self.state.publish_ble(BleState::Failed(Failure::from(&err)));
            return Err(err);
        }

        self.ble.connect(address).await
    }

    /// Closes both transports. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.classic.disconnect();
        self.ble.disconnect().await;
    }

    /// Sends over whichever transport is connected.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        match self.state.connected_transport() {
            Some(TransportKind::Classic) => self.classic.send(bytes),
            Some(TransportKind::Ble) => self.ble.send(&bytes).await,
            None => {
                warn!("Dropping {} bytes: no device is connected", bytes.len());
                Err(LinkError::Disconnected)
            },
        }
    }

    pub async fn assign(&self, assignment: &Assignment) -> Result<(), LinkError> {
        let message = assignment.encode();
        info!("Assigning {}", message);
        self.send(message.into_bytes()).await
    }

    /// Reads Classic lines into `sensor_values`. Assignment replies become notices.
    pub fn start_sensor_stream(&self) -> Result<(), LinkError> {
        let state = self.state.clone();

        self.classic.read_lines(move |line| {
            if let Some(notice) = parse_assignment_response(line.trim()) {
                info!("{}", notice);
                state.notify(notice);
            } else if let Some(values) = parse_sensor_line(&line) {
                state.publish_sensor_values(values);
            }
        })
    }

    /// Raw Classic chunks, for callers that frame the stream themselves.
    pub fn receive_classic<F>(&self, on_chunk: F) -> Result<(), LinkError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.classic.receive(on_chunk)
    }

    pub fn clear_inferred_text(&self) {
        self.state.publish_inferred_text(String::new());
    }

    /// Reconnects (Classic) to the last connected device, asking for the connect permission
    /// first if needed. A denial leaves the link disconnected.
    pub async fn restore_last_connection<F>(&self, on_complete: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let Some(address) = self.settings.get().last_connected_device else {
            info!("No previously connected device to restore");
            on_complete(false);
            return;
        };

        if !self.ensure_permission(Permission::Connect).await {
            warn!("Connect permission denied; not reconnecting to {}", address);
            on_complete(false);
            return;
        }

        info!("Restoring connection to {}", address);
        self.connect_classic(&address, on_complete).await;
    }

    /// Stops running scans, disconnects, and waits for every worker to exit.
    pub async fn shutdown(&self) {
        let scans: Vec<(TransportKind, ActiveScan)> = lock(&self.scans).drain().collect();

        for (kind, scan) in scans {
            scan.cancel.cancel();
            if let Err(err) = self.radio.stop_scan(kind).await {
                warn!("Failed to stop the {} scan: {}", kind, err);
            }
            if kind == TransportKind::Ble {
                self.ble.mark_scanning(false);
            }
            self.state.publish_activity(Activity::ScanFinished(kind));
        }

        self.disconnect().await;
        self.workers.shutdown().await;
        info!("Link manager shut down");
    }
}
