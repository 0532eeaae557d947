use std::collections::HashSet;
use std::sync::Mutex;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Descriptor, Manager as _, Peripheral as PeripheralApi, ScanFilter, Service, ValueNotification, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::{debug, info, warn};

use crate::device::constants::CLIENT_CHARACTERISTIC_CONFIG;
use crate::device::types::{DiscoveredDevice, TransportKind};
use crate::error::LinkError;
use crate::transport::{GattPeripheral, Radio};
use crate::workers::lock;

/// The host's bluetooth adapters, through btleplug.
pub struct BtleRadio {
    _manager: Manager,
    adapters: Vec<Adapter>,
    /// Scan kinds currently running. The adapters scan while this is non empty.
    active: Mutex<HashSet<TransportKind>>,
}

impl BtleRadio {
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;

        for adapter in &adapters {
            info!("Found adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        }
        if adapters.is_empty() {
            warn!("No bluetooth adapters found");
        }

        Ok(BtleRadio {
            _manager: manager,
            adapters,
            active: Mutex::new(HashSet::new()),
        })
    }

    async fn start_adapters(&self) -> Result<(), LinkError> {
        for adapter in &self.adapters {
            info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
            adapter.start_scan(ScanFilter::default()).await?;
        }
        Ok(())
    }
}

async fn sighting(adapter: Adapter, event: CentralEvent, kind: TransportKind) -> Option<DiscoveredDevice> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
        _ => return None,
    };

    let peripheral = match adapter.peripheral(&id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            debug!("Discovered peripheral vanished: {}", err);
            return None;
        },
    };

    match peripheral.properties().await {
        Ok(Some(properties)) => Some(DiscoveredDevice::new(properties.address.to_string(), properties.local_name, kind)),
        Ok(None) => None,
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
    }
}

impl Radio for BtleRadio {
    type Peripheral = Peripheral;

    async fn is_supported(&self, _kind: TransportKind) -> bool {
        !self.adapters.is_empty()
    }

    async fn start_scan(&self, kind: TransportKind) -> Result<BoxStream<'static, DiscoveredDevice>, LinkError> {
        if self.adapters.is_empty() {
            return Err(LinkError::Unsupported(kind));
        }

        let first = {
            let mut active = lock(&self.active);
            let first = active.is_empty();
            active.insert(kind);
            first
        };
        if first {
            if let Err(err) = self.start_adapters().await {
                lock(&self.active).remove(&kind);
                return Err(err);
            }
        }

        let mut sightings = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let events = adapter.events().await?;
            let adapter = adapter.clone();

            sightings.push(events.filter_map(move |event| sighting(adapter.clone(), event, kind)).boxed());
        }

        Ok(stream::select_all(sightings).boxed())
    }

    async fn stop_scan(&self, kind: TransportKind) -> Result<(), LinkError> {
        let last = {
            let mut active = lock(&self.active);
            active.remove(&kind) && active.is_empty()
        };

        if last {
            for adapter in &self.adapters {
                info!("Stopping scan on adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
                adapter.stop_scan().await?;
            }
        }
        Ok(())
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral, LinkError> {
        for adapter in &self.adapters {
            let peripherals = match adapter.peripherals().await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Failed to query BLE adapter for peripherals: {}", err);
                    continue;
                },
            };

            if let Some(peripheral) = peripherals
                .into_iter()
                .find(|peripheral| peripheral.address().to_string().eq_ignore_ascii_case(address))
            {
                return Ok(peripheral);
            }
        }

        Err(LinkError::DeviceNotFound(address.to_string()))
    }
}

fn write_type(characteristic: &Characteristic) -> WriteType {
    if characteristic.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}

impl GattPeripheral for Peripheral {
    async fn connect(&self) -> Result<(), LinkError> {
        Ok(PeripheralApi::connect(self).await?)
    }

    async fn discover_services(&self) -> Result<Vec<Service>, LinkError> {
        PeripheralApi::discover_services(self).await?;
        Ok(self.services().into_iter().collect())
    }

    async fn set_notify(&self, characteristic: &Characteristic) -> Result<(), LinkError> {
        Ok(PeripheralApi::subscribe(self, characteristic).await?)
    }

    async fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<(), LinkError> {
        match PeripheralApi::write_descriptor(self, descriptor, value).await {
            Ok(()) => Ok(()),
            // BlueZ owns the CCCD and refuses direct writes; subscribe has already written it
            Err(err) if descriptor.uuid == CLIENT_CHARACTERISTIC_CONFIG => {
                warn!("Platform refused the notification descriptor write, relying on subscribe: {}", err);
                Ok(())
            },
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, characteristic: &Characteristic, value: &[u8]) -> Result<(), LinkError> {
        Ok(PeripheralApi::write(self, characteristic, value, write_type(characteristic)).await?)
    }

    async fn notifications(&self) -> Result<BoxStream<'static, ValueNotification>, LinkError> {
        Ok(PeripheralApi::notifications(self).await?)
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        Ok(PeripheralApi::disconnect(self).await?)
    }
}
