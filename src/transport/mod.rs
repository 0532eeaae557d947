//! Radio seams.
//!
//! The link manager and both sessions are generic over these traits so that the btleplug radio
//! and the RFCOMM serial connector can be swapped for scripted fakes in tests.

use std::future::Future;
use btleplug::api::{Characteristic, Descriptor, Service, ValueNotification};
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::device::types::{DiscoveredDevice, TransportKind};
use crate::error::LinkError;

pub mod ble;
pub mod btle;
pub mod classic;
pub mod port;

#[cfg(test)]
pub(crate) mod fake;

/// Device discovery and GATT peripheral lookup.
pub trait Radio: Send + Sync + 'static {
    type Peripheral: GattPeripheral;

    fn is_supported(&self, kind: TransportKind) -> impl Future<Output = bool> + Send;

    /// Starts a radio scan. The stream yields every sighting, duplicates included.
    fn start_scan(&self, kind: TransportKind) -> impl Future<Output = Result<BoxStream<'static, DiscoveredDevice>, LinkError>> + Send;

    fn stop_scan(&self, kind: TransportKind) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn peripheral(&self, address: &str) -> impl Future<Output = Result<Self::Peripheral, LinkError>> + Send;
}

/// The GATT client operations the BLE session needs.
pub trait GattPeripheral: Clone + Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn discover_services(&self) -> impl Future<Output = Result<Vec<Service>, LinkError>> + Send;

    /// Routes notifications of this characteristic to [`GattPeripheral::notifications`].
    fn set_notify(&self, characteristic: &Characteristic) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn write(&self, characteristic: &Characteristic, value: &[u8]) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn notifications(&self) -> impl Future<Output = Result<BoxStream<'static, ValueNotification>, LinkError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), LinkError>> + Send;
}

/// Opens the RFCOMM serial channel of a Classic device.
pub trait ClassicConnector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    fn connect(&self, address: &str, service: Uuid) -> impl Future<Output = Result<Self::Stream, LinkError>> + Send;
}
