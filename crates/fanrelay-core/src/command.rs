use serde::{Deserialize, Serialize};

use crate::ids::{CommandId, DeviceId};

/// A command row as stored and as sent to devices inside a `command` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub device_id: DeviceId,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub delivered: bool,
    pub created_at: String,
}

/// Operator-submitted command before the store assigns it an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewCommand {
    #[serde(default)]
    pub device_id: DeviceId,
    #[serde(default)]
    pub command_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewCommand {
    pub fn new(
        device_id: impl Into<String>,
        command_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            device_id: DeviceId::from_raw(device_id),
            command_type: command_type.into(),
            payload,
        }
    }
}
