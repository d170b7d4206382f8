pub mod connection;
pub mod delivery;
pub mod fanout;
pub mod handler;
pub mod registry;
pub mod routes;
pub mod server;
pub mod session;

pub use delivery::{AckPolicy, DeliveryEngine, DeliveryError, DrainOutcome, DrainReport, SubmitReport};
pub use fanout::TelemetryFanout;
pub use registry::{BroadcastReport, SessionRegistry};
pub use server::{build_router, build_state, start, AppState, ServerConfig, ServerHandle};
pub use session::{SendOutcome, SessionHandle};
