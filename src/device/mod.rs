pub mod constants;
pub mod protocol;
pub mod registry;
pub mod telemetry;
pub mod types;
