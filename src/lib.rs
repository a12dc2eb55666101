//! Smart Oil Gauge bridge library
//!
//! Polls the Smart Oil Gauge cloud for tank telemetry and republishes each tank
//! as battery, level and fill percentage sensors in Home Assistant.

pub mod config_entry;
pub mod config_flow;
pub mod home_assistant;
pub mod sensor;
pub mod sensor_publisher;
pub mod smart_oil_gauge;
pub mod tank;
pub mod tank_coordinator;

// Re-export commonly used types for easier access
pub use config_entry::{setup_entry, ConfigEntry, EntrySetupError};
pub use config_flow::SetupFlow;
pub use home_assistant::HomeAssistantAPI;
pub use smart_oil_gauge::SmartOilGaugeClient;
pub use tank::TankInfo;
pub use tank_coordinator::{Snapshot, TankCoordinator, UpdateFailed};
