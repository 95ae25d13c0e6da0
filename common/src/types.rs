use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub name: String,
    pub location: String,
    pub temperature: Option<f64>,
    pub humidity: Option<u8>,
    pub status: String,
    #[serde(rename = "rawLabel")]
    pub raw_label: String,
}

impl SensorRecord {
    pub fn is_online(&self) -> bool {
        self.status == STATUS_ONLINE
    }

    pub fn has_reading(&self) -> bool {
        self.temperature.is_some() || self.humidity.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    #[serde(rename = "fetchedAt")]
    fetched_at: Option<DateTime<Utc>>,
    records: Vec<SensorRecord>,
}

impl Snapshot {
    pub fn new(records: Vec<SensorRecord>, fetched_at: DateTime<Utc>) -> Self {
        let mut seen = HashSet::with_capacity(records.len());
        let mut unique = Vec::with_capacity(records.len());

        for record in records {
            if !seen.insert(record.device_id.clone()) {
                warn!(
                    device_id = %record.device_id,
                    name = %record.name,
                    "dropping sensor with duplicate device id"
                );
                continue;
            }
            unique.push(record);
        }

        Self {
            fetched_at: Some(fetched_at),
            records: unique,
        }
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    pub fn records(&self) -> &[SensorRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, device_id: &str) -> Option<&SensorRecord> {
        self.records
            .iter()
            .find(|record| record.device_id == device_id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&SensorRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    pub fn is_available(&self, device_id: &str) -> bool {
        self.get(device_id).is_some_and(SensorRecord::is_online)
    }
}
