use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;

/// A stored sensor reading. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub id: i64,
    pub device_id: DeviceId,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub fan_rpm: Option<i64>,
    pub received_at: String,
}

/// Sensor values as posted by a controller. Every sensor field is optional
/// since not all boards carry every sensor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewReading {
    #[serde(default)]
    pub device_id: DeviceId,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub fan_rpm: Option<i64>,
}
