use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use log::info;
use tokio::fs::{File, OpenOptions};
use uuid::Uuid;

use crate::config::store::SettingsStore;
use crate::error::LinkError;
use crate::transport::ClassicConnector;

/// Opens the serial device bound to a Classic device's RFCOMM channel (e.g. `/dev/rfcomm0`,
/// or `COM5` on Windows). The binding per address lives in the settings.
pub struct PortConnector {
    settings: Arc<dyn SettingsStore>,
}

impl PortConnector {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        PortConnector { settings }
    }

    fn port_of(&self, address: &str) -> Option<PathBuf> {
        self.settings.get().classic_ports
            .into_iter()
            .find(|(bound, _)| bound.eq_ignore_ascii_case(address))
            .map(|(_, path)| path)
    }
}

impl ClassicConnector for PortConnector {
    type Stream = File;

    async fn connect(&self, address: &str, service: Uuid) -> Result<File, LinkError> {
        let path = self.port_of(address).ok_or_else(|| LinkError::DeviceNotFound(address.to_string()))?;
        info!("Opening serial channel {} of {} at {}", service, address, path.to_string_lossy());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::PermissionDenied => LinkError::PermissionDenied(format!("{}: {}", path.to_string_lossy(), err)),
                _ => LinkError::from(err),
            })?;

        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::store::MemorySettings;
    use crate::config::types::SettingsField;
    use crate::device::constants::SERIAL_PORT_SERVICE;
    use crate::error::FailureKind;

    #[tokio::test]
    async fn unbound_address_is_not_found() {
        let connector = PortConnector::new(Arc::new(MemorySettings::default()));

        let err = connector.connect("98:D3:31:F5:1A:2B", SERIAL_PORT_SERVICE).await.unwrap_err();
        assert!(matches!(err, LinkError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn opens_the_bound_port() {
        let path = std::env::temp_dir().join(format!("glove-link-port-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();

        let settings = Arc::new(MemorySettings::default());
        settings.set(SettingsField::ClassicPort { address: "98:D3:31:F5:1A:2B".to_string(), path: Some(path.clone()) }).await.unwrap();
        let connector = PortConnector::new(settings);

        assert!(connector.connect("98:d3:31:f5:1a:2b", SERIAL_PORT_SERVICE).await.is_ok());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_device_node_is_transient() {
        let settings = Arc::new(MemorySettings::default());
        let path = std::env::temp_dir().join("glove-link-no-such-port").join("rfcomm0");
        settings.set(SettingsField::ClassicPort { address: "AA:BB".to_string(), path: Some(path) }).await.unwrap();
        let connector = PortConnector::new(settings);

        let err = connector.connect("AA:BB", SERIAL_PORT_SERVICE).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transient);
    }
}
