use std::time::Duration;
use uuid::Uuid;

/**
 * The serial port profile service the Classic transport opens an RFCOMM channel to.
 */
pub const SERIAL_PORT_SERVICE: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/**
 * The UUID of the BLE UART service exposed by the glove.
 */
pub const UART_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/**
 * The UART characteristic, used both for notifications (glove to app) and writes (app to glove).
 */
pub const UART_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/**
 * Client characteristic configuration descriptor (CCCD).
 */
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/**
 * How long a scan runs before it is force-stopped.
 */
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/**
 * Size of a single read from the Classic stream.
 */
pub const READ_CHUNK_SIZE: usize = 1024;

/**
 * Notifications whose text starts with this prefix carry sensor telemetry.
 */
pub const TELEMETRY_PREFIX: &str = "F1";

/**
 * Inferred-text responses to an assignment start with this prefix.
 */
pub const ASSIGNMENT_RESPONSE_PREFIX: &str = "Assignment:";

pub const ASSIGNMENT_TERMINATOR: char = '~';
pub const ASSIGNMENT_MAX_CHARS: usize = 70;
pub const PHRASE_SLOTS: u8 = 5;
pub const LETTER_SLOTS: u8 = 15;

pub const FLEX_SENSORS: [&str; 5] = ["F1", "F2", "F3", "F4", "F5"];
pub const GYRO_AXES: [&str; 3] = ["X", "Y", "Z"];
