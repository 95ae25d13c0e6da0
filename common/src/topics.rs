use crate::entity::SensorKind;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

pub fn bridge_status_topic(prefix: &str) -> String {
    format!("{prefix}/bridge/status")
}

pub fn sensor_state_topic(prefix: &str, device_id: &str, kind: SensorKind) -> String {
    format!("{prefix}/sensor/{}/{}", topic_segment(device_id), kind.as_str())
}

pub fn sensor_availability_topic(prefix: &str, device_id: &str) -> String {
    format!("{prefix}/sensor/{}/availability", topic_segment(device_id))
}

// Device ids come from the device; keep them from introducing levels or wildcards.
fn topic_segment(device_id: &str) -> String {
    if device_id.is_empty() {
        return "unknown".to_string();
    }
    device_id.replace(['/', '+', '#'], "_")
}
