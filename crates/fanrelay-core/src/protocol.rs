//! Wire envelopes exchanged over live connections.
//!
//! Every frame is a JSON object tagged by `type`. Inbound frames are parsed
//! into [`InboundMessage`] at the boundary; anything that does not match one
//! of its variants exactly is rejected with a [`ProtocolError`] and never
//! reaches the dispatcher.

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::ids::{CommandId, DeviceId};
use crate::reading::TelemetryReading;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid `{kind}` message: {detail}")]
    InvalidFields { kind: String, detail: String },

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Messages a connection may send to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Bind this connection to a device id and trigger a drain.
    Register { device_id: DeviceId },
    /// Confirm receipt of one command.
    Ack { id: CommandId },
}

const INBOUND_TYPES: &[&str] = &["register", "ack"];

impl InboundMessage {
    /// Parse one text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = match value.get("type") {
            Some(serde_json::Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };
        if !INBOUND_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        let message: Self =
            serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
                kind: kind.clone(),
                detail: e.to_string(),
            })?;

        if let Self::Register { device_id } = &message {
            if device_id.is_blank() {
                return Err(ProtocolError::InvalidFields {
                    kind,
                    detail: "device_id must not be empty".into(),
                });
            }
        }

        Ok(message)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Ack { .. } => "ack",
        }
    }
}

/// Messages the server pushes to connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Telemetry { data: TelemetryReading },
    Command { data: Command },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Telemetry { .. } => "telemetry",
            Self::Command { .. } => "command",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}
