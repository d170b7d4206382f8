pub mod command;
pub mod ids;
pub mod protocol;
pub mod reading;

pub use command::{Command, NewCommand};
pub use ids::{CommandId, ConnectionId, DeviceId};
pub use protocol::{InboundMessage, OutboundMessage, ProtocolError};
pub use reading::{NewReading, TelemetryReading};
