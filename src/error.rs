use std::io;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

use crate::device::types::TransportKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("{0} is not supported on this device")]
    Unsupported(TransportKind),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Bluetooth I/O failed: {source}")]
    Io { #[from] source: io::Error },

    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("A required bluetooth {0} is not available on the device")]
    ProtocolMismatch(&'static str),

    #[error("No device known with address {0}")]
    DeviceNotFound(String),

    #[error("No {0} connection is open")]
    NotConnected(TransportKind),

    #[error("{0} is already connecting or connected; disconnect it first")]
    AlreadyConnected(TransportKind),

    #[error("The connection attempt was cancelled by a disconnect")]
    Cancelled,

    #[error("No device is connected")]
    Disconnected,

    #[error("A receive loop is already running on this connection")]
    ReceiverBusy,

    #[error("Invalid assignment: {0}")]
    InvalidAssignment(String),
}

/// Failure taxonomy shared by every transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No radio, or the radio lacks the transport. Permanent.
    Unsupported,
    /// The OS capability grant is missing. Recoverable by requesting it and retrying.
    PermissionDenied,
    /// Connect/read/write failure. Never retried automatically.
    Transient,
    /// The remote device lacks the expected service, characteristic or descriptor.
    ProtocolMismatch,
}

impl LinkError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LinkError::Unsupported(_) => FailureKind::Unsupported,
            LinkError::PermissionDenied(_) => FailureKind::PermissionDenied,
            LinkError::Io { source } if source.kind() == io::ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
            LinkError::Btle { source: btleplug::Error::PermissionDenied } => FailureKind::PermissionDenied,
            LinkError::ProtocolMismatch(_) => FailureKind::ProtocolMismatch,
            _ => FailureKind::Transient,
        }
    }
}

/// A cloneable record of a [`LinkError`], stored inside observable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Failure { kind, message: message.into() }
    }
}

impl From<&LinkError> for Failure {
    fn from(err: &LinkError) -> Self {
        Failure::new(err.kind(), err.to_string())
    }
}

impl From<LinkError> for Failure {
    fn from(err: LinkError) -> Self {
        Failure::from(&err)
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Error, Debug)]
pub enum GestureError {
    #[error("Failed to read gesture asset {path}: {source}")]
    Asset { path: PathBuf, source: io::Error },

    #[error("Failed to parse gesture asset: {source}")]
    Json { #[from] source: serde_json::Error },

    #[error("The label map does not contain any labels")]
    EmptyLabels,

    #[error("Expected {expected} features, got {actual}")]
    FeatureLength { expected: usize, actual: usize },

    #[error("Classifier failed: {0}")]
    Classifier(String),
}

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("Translation failed: {0}")]
    Translation(String),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Bluetooth link failed: {source}")]
    LinkError { #[from] source: LinkError },

    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Failed to start async runtime: {source}")]
    Runtime { source: std::io::Error },
}
