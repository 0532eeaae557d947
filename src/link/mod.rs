pub mod manager;
pub mod permission;
pub mod state;
