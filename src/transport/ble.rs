use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use btleplug::api::{Characteristic, ValueNotification};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::device::constants::{CLIENT_CHARACTERISTIC_CONFIG, ENABLE_NOTIFICATION_VALUE, UART_CHARACTERISTIC, UART_SERVICE};
use crate::device::protocol::route_notification;
use crate::device::types::{Activity, BleState, Inbound, TransportKind};
use crate::error::{Failure, LinkError};
use crate::link::state::LinkState;
use crate::transport::{GattPeripheral, Radio};
use crate::workers::{lock, Workers};

/// Receives every decoded notification of the ready link.
pub type InboundSink = Arc<dyn Fn(Inbound) + Send + Sync>;

struct Link<P> {
    id: u64,
    address: String,
    peripheral: P,
    characteristic: Characteristic,
    cancel: CancellationToken,
}

struct Inner<R: Radio> {
    radio: Arc<R>,
    state: Arc<LinkState>,
    workers: Workers,
    sink: InboundSink,
    link: Mutex<Option<Link<R::Peripheral>>>,
    /// Bumped by every connect and disconnect; a connect that finishes behind a newer bump is abandoned.
    attempt: AtomicU64,
    next_id: AtomicU64,
}

/// A GATT client bound to the UART profile of the glove.
pub struct BleSession<R: Radio> {
    inner: Arc<Inner<R>>,
}

impl<R: Radio> Clone for BleSession<R> {
    fn clone(&self) -> Self {
        BleSession { inner: self.inner.clone() }
    }
}

impl<R: Radio> BleSession<R> {
    pub fn new(radio: Arc<R>, state: Arc<LinkState>, workers: Workers, sink: InboundSink) -> Self {
        BleSession {
            inner: Arc::new(Inner {
                radio,
                state,
                workers,
                sink,
                link: Mutex::new(None),
                attempt: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.inner.link).is_some()
    }

    pub fn connected_address(&self) -> Option<String> {
        lock(&self.inner.link).as_ref().map(|link| link.address.clone())
    }

    /// Connects, discovers the UART characteristic and enables its notifications.
    /// Any failure is terminal for this attempt and leaves the session `Failed`.
    /// A disconnect made meanwhile wins: the attempt ends with `Cancelled` and publishes nothing.
    pub async fn connect(&self, address: &str) -> Result<(), LinkError> {
        if self.is_ready() {
            self.disconnect().await;
        }

        let claimed = {
            let _link = lock(&self.inner.link);
            self.inner.state.claim(TransportKind::Ble).map(|()| {
                self.inner.state.publish_ble(BleState::Connecting);
                self.inner.attempt.fetch_add(1, Ordering::SeqCst) + 1
            })
        };
        let attempt = match claimed {
            Ok(attempt) => attempt,
            Err(err) => {
                warn!("Not connecting (BLE) to {}: {}", address, err);
                self.inner.state.publish_ble(BleState::Failed(Failure::from(&err)));
                return Err(err);
            },
        };
        info!("Connecting (BLE) to {}...", address);

        let peripheral = match self.inner.radio.peripheral(address).await {
            Ok(peripheral) => peripheral,
            Err(err) => return Err(self.fail(address, attempt, err)),
        };
        if let Err(err) = peripheral.connect().await {
            return Err(self.fail(address, attempt, err));
        }

        let (characteristic, notifications) = match self.configure(attempt, &peripheral).await {
            Ok(configured) => configured,
            Err(err) => {
                if let Err(disconnect_err) = peripheral.disconnect().await {
                    debug!("Disconnect after failed setup also failed: {}", disconnect_err);
                }
                return Err(self.fail(address, attempt, err));
            },
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = self.inner.workers.child_token();
        let installed = {
            let mut link = lock(&self.inner.link);
            let current = self.is_current(attempt);
            if current {
                let previous = link.replace(Link {
                    id,
                    address: address.to_string(),
                    peripheral: peripheral.clone(),
                    characteristic,
                    cancel: cancel.clone(),
                });
                if let Some(previous) = previous {
                    previous.cancel.cancel();
                }
                self.inner.state.publish_ble(BleState::Ready);
            }
            current
        };

        if !installed {
            info!("BLE connection to {} was abandoned", address);
            if let Err(err) = peripheral.disconnect().await {
                debug!("Disconnect of the abandoned link failed: {}", err);
            }
            return Err(LinkError::Cancelled);
        }

        info!("BLE UART ready on {}", address);
        self.spawn_notifications(id, notifications, cancel);
        Ok(())
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.inner.attempt.load(Ordering::SeqCst) == attempt
            && self.inner.state.active_transport() == Some(TransportKind::Ble)
    }

    /// Publishes a setup stage, unless the attempt has been superseded.
    fn advance(&self, attempt: u64, stage: BleState) -> Result<(), LinkError> {
        let _link = lock(&self.inner.link);
        if !self.is_current(attempt) {
            return Err(LinkError::Cancelled);
        }
        self.inner.state.publish_ble(stage);
        Ok(())
    }

    async fn configure(&self, attempt: u64, peripheral: &R::Peripheral) -> Result<(Characteristic, BoxStream<'static, ValueNotification>), LinkError> {
        self.advance(attempt, BleState::ServiceDiscovery)?;
        info!("Connected; Discovering services...");
        let services = peripheral.discover_services().await?;

        let service = services
            .iter()
            .find(|service| service.uuid == UART_SERVICE)
            .ok_or(LinkError::ProtocolMismatch("service"))?;
        let characteristic = service.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == UART_CHARACTERISTIC)
            .cloned()
            .ok_or(LinkError::ProtocolMismatch("characteristic"))?;

        self.advance(attempt, BleState::NotificationSetup)?;
        info!("Subscribing to characteristic {:?} {:?}", service.uuid, characteristic.uuid);
        peripheral.set_notify(&characteristic).await?;

        let descriptor = characteristic.descriptors
            .iter()
            .find(|descriptor| descriptor.uuid == CLIENT_CHARACTERISTIC_CONFIG)
            .ok_or(LinkError::ProtocolMismatch("descriptor"))?;
        peripheral.write_descriptor(descriptor, &ENABLE_NOTIFICATION_VALUE).await?;

        let notifications = peripheral.notifications().await?;
        Ok((characteristic, notifications))
    }

    fn fail(&self, address: &str, attempt: u64, err: LinkError) -> LinkError {
        let _link = lock(&self.inner.link);
        if !self.is_current(attempt) {
            info!("Abandoned BLE connection to {} failed: {}", address, err);
            return err;
        }

        warn!("BLE connection to {} failed: {}", address, err);
        self.inner.state.release(TransportKind::Ble);
        self.inner.state.publish_ble(BleState::Failed(Failure::from(&err)));
        err
    }

    fn spawn_notifications(&self, id: u64, mut notifications: BoxStream<'static, ValueNotification>, cancel: CancellationToken) {
        let inner = self.inner.clone();

        self.inner.workers.spawn("ble-notifications", async move {
            'mainloop: loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break 'mainloop,
                    next = notifications.next() => next,
                };

                match next {
                    Some(notification) if notification.uuid == UART_CHARACTERISTIC => {
                        if let Some(message) = route_notification(&notification.value) {
                            (inner.sink)(message);
                        }
                    },
                    Some(notification) => {
                        debug!("Ignoring notification of {:?}", notification.uuid);
                    },
                    None => {
                        inner.link_lost(id);
                        break 'mainloop;
                    },
                }
            }
        });
    }

    /// Writes to the UART characteristic; the outcome is also published as activity.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let target = lock(&self.inner.link)
            .as_ref()
            .map(|link| (link.peripheral.clone(), link.characteristic.clone()));

        let result = match target {
            Some((peripheral, characteristic)) => peripheral.write(&characteristic, bytes).await,
            None => Err(LinkError::NotConnected(TransportKind::Ble)),
        };

        match &result {
            Ok(()) => {
                debug!("Sent {} bytes (BLE)", bytes.len());
                self.inner.state.publish_activity(Activity::DataSent(TransportKind::Ble));
            },
            Err(err) => {
                warn!("BLE send failed: {}", err);
                self.inner.state.publish_activity(Activity::SendFailed(TransportKind::Ble, Failure::from(err)));
            },
        }
        result
    }

    /// Releases the GATT link if there is one. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let link = {
            let mut link = lock(&self.inner.link);
            self.inner.attempt.fetch_add(1, Ordering::SeqCst);
            self.inner.state.release(TransportKind::Ble);
            self.inner.state.publish_ble(BleState::Disconnected);
            link.take()
        };

        if let Some(link) = link {
            info!("Disconnecting (BLE) from {}", link.address);
            link.cancel.cancel();
            if let Err(err) = link.peripheral.disconnect().await {
                warn!("Error while disconnecting from {}: {}", link.address, err);
            }
        }
    }

    /// An idle session mirrors a running BLE scan.
    pub fn mark_scanning(&self, scanning: bool) {
        let current = self.inner.state.ble_state();

        if scanning && current.is_idle() {
            self.inner.state.publish_ble(BleState::Scanning);
        } else if !scanning && current == BleState::Scanning {
            self.inner.state.publish_ble(BleState::Idle);
        }
    }
}

impl<R: Radio> Inner<R> {
    fn link_lost(&self, id: u64) {
        let lost = {
            let mut link = lock(&self.link);
            let lost = match link.as_ref() {
                Some(current) if current.id == id => link.take(),
                _ => None,
            };
            if lost.is_some() {
                self.state.release(TransportKind::Ble);
                self.state.publish_ble(BleState::Disconnected);
            }
            lost
        };

        if let Some(lost) = lost {
            info!("BLE link to {} lost", lost.address);
            lost.cancel.cancel();
        }
    }
}
