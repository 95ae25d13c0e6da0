pub mod config;
pub mod entity;
pub mod extract;
pub mod topics;
pub mod types;

pub use config::{BridgeConfig, ConfigError, DeviceConfig, HttpConfig, MqttConfig, PollConfig};
pub use entity::{entities_for, entity_for, snapshot_entities, EntityState, SensorKind};
pub use extract::{extract, extract_with, try_extract, ExtractOptions, PayloadError};
pub use topics::*;
pub use types::{SensorRecord, Snapshot, STATUS_ONLINE};
