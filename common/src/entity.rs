use serde::Serialize;

use crate::types::{SensorRecord, Snapshot};

pub const DOMAIN: &str = "aiseg2_bridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Temperature,
    Humidity,
}

impl SensorKind {
    pub const ALL: [SensorKind; 2] = [SensorKind::Temperature, SensorKind::Humidity];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Temperature => "Temperature",
            Self::Humidity => "Humidity",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityAttributes {
    pub location: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    #[serde(rename = "uniqueId")]
    pub unique_id: String,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    pub name: &'static str,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "deviceClass")]
    pub kind: SensorKind,
    pub unit: &'static str,
    pub value: f64,
    pub available: bool,
    pub attributes: EntityAttributes,
}

pub fn entity_for(kind: SensorKind, record: &SensorRecord, host: &str) -> Option<EntityState> {
    let value = match kind {
        SensorKind::Temperature => record.temperature?,
        SensorKind::Humidity => f64::from(record.humidity?),
    };

    Some(EntityState {
        unique_id: format!("{DOMAIN}-{host}-{}-{}", record.device_id, kind.as_str()),
        entity_id: format!("sensor.aiseg2_{}_{}", safe_name(&record.name), kind.as_str()),
        name: kind.display_name(),
        device_name: format!("{} (温湿度センサー)", record.name),
        kind,
        unit: kind.unit(),
        value,
        available: record.is_online(),
        attributes: EntityAttributes {
            location: record.location.clone(),
            device_id: record.device_id.clone(),
        },
    })
}

pub fn entities_for(record: &SensorRecord, host: &str) -> Vec<EntityState> {
    SensorKind::ALL
        .iter()
        .filter_map(|kind| entity_for(*kind, record, host))
        .collect()
}

pub fn snapshot_entities(snapshot: &Snapshot, host: &str) -> Vec<EntityState> {
    snapshot
        .records()
        .iter()
        .flat_map(|record| entities_for(record, host))
        .collect()
}

fn safe_name(name: &str) -> String {
    name.to_lowercase().replace([' ', '　'], "_")
}
