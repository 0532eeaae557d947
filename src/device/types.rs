use std::fmt::{Display, Formatter};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::device::telemetry::SensorValues;
use crate::error::Failure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    Classic,
    Ble,
}

impl TransportKind {
    pub fn other(&self) -> TransportKind {
        match self {
            TransportKind::Classic => TransportKind::Ble,
            TransportKind::Ble => TransportKind::Classic,
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            TransportKind::Classic => "Classic",
            TransportKind::Ble => "BLE",
        };

        write!(f, "{}", result)
    }
}

/// A device seen during a scan. Identity is the hardware address; the name is metadata.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub transport: TransportKind,
}

impl DiscoveredDevice {
    pub fn new(address: impl Into<String>, name: Option<String>, transport: TransportKind) -> Self {
        DiscoveredDevice { address: address.into(), name, transport }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl PartialEq for DiscoveredDevice {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed(Failure),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting..."),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Failed(failure) => write!(f, "Connection failed: {}", failure),
        }
    }
}

/// Lifecycle of a BLE GATT session.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BleState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    NotificationSetup,
    Ready,
    Disconnected,
    Failed(Failure),
}

impl BleState {
    /// Collapses the GATT lifecycle onto the transport-neutral connection state.
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            BleState::Idle | BleState::Scanning | BleState::Disconnected => ConnectionState::Disconnected,
            BleState::Connecting | BleState::ServiceDiscovery | BleState::NotificationSetup => ConnectionState::Connecting,
            BleState::Ready => ConnectionState::Connected,
            BleState::Failed(failure) => ConnectionState::Failed(failure.clone()),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, BleState::Idle | BleState::Disconnected | BleState::Failed(_))
    }
}

impl Display for BleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BleState::Idle => write!(f, "Idle"),
            BleState::Scanning => write!(f, "Scanning (BLE)..."),
            BleState::Connecting => write!(f, "Connecting (BLE)..."),
            BleState::ServiceDiscovery => write!(f, "Discovering services..."),
            BleState::NotificationSetup => write!(f, "Enabling notifications..."),
            BleState::Ready => write!(f, "BLE UART Ready"),
            BleState::Disconnected => write!(f, "Disconnected (BLE)"),
            BleState::Failed(failure) => write!(f, "BLE failed: {}", failure),
        }
    }
}

/// The general-purpose status channel: scans and data transfer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Activity {
    #[default]
    Idle,
    Scanning(TransportKind),
    ScanFinished(TransportKind),
    ScanFailed(TransportKind, Failure),
    DataSent(TransportKind),
    SendFailed(TransportKind, Failure),
    ReceiveFailed(TransportKind, Failure),
}

impl Display for Activity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Activity::Idle => write!(f, "Idle"),
            Activity::Scanning(kind) => write!(f, "Scanning ({})...", kind),
            Activity::ScanFinished(kind) => write!(f, "{} scan finished", kind),
            Activity::ScanFailed(kind, failure) => write!(f, "{} scan failed: {}", kind, failure),
            Activity::DataSent(kind) => write!(f, "Data sent ({})", kind),
            Activity::SendFailed(kind, failure) => write!(f, "Send failed ({}): {}", kind, failure),
            Activity::ReceiveFailed(kind, failure) => write!(f, "Receive failed ({}): {}", kind, failure),
        }
    }
}

/// A decoded message from the glove.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Telemetry(SensorValues),
    Text(String),
}

/// One-shot notifications for the user, not retained as state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Assignment { successful: bool, status: String },
}

impl Display for Notice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::Assignment { successful: true, .. } => write!(f, "Value assigned to gesture!"),
            Notice::Assignment { successful: false, status } => write!(f, "Assignment failed! ({})", status),
        }
    }
}
