use indexmap::IndexMap;
use indexmap::map::Entry;

use crate::device::types::DiscoveredDevice;

/// Devices found by the current scan session, keyed by hardware address in discovery order.
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    devices: IndexMap<String, DiscoveredDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Returns `true` if no device with this address was known yet.
    pub fn add_if_new(&mut self, device: DiscoveredDevice) -> bool {
        match self.devices.entry(device.address.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(device);
                true
            }
        }
    }

    pub fn get(&self, address: &str) -> Option<&DiscoveredDevice> {
        self.devices.get(address)
    }

    pub fn list(&self) -> Vec<DiscoveredDevice> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn reset(&mut self) {
        self.devices.clear();
    }
}
