//! Inbound frame dispatch.

use std::sync::Arc;

use fanrelay_core::{CommandId, InboundMessage, ProtocolError};
use tracing::{info, warn};

use crate::delivery::{DeliveryEngine, DeliveryError, DrainReport};
use crate::session::SessionHandle;

/// What a single inbound frame resulted in.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatched {
    Registered(DrainReport),
    Acknowledged { id: CommandId, newly_marked: bool },
    /// The frame was unusable and has been dropped. The connection stays open.
    Ignored(ProtocolError),
}

/// Handle one text frame from `handle`'s connection.
///
/// Protocol violations are never fatal; only store failures surface as
/// errors, and even those leave the connection usable.
pub async fn dispatch(
    engine: &DeliveryEngine,
    handle: &Arc<SessionHandle>,
    raw: &str,
) -> Result<Dispatched, DeliveryError> {
    let message = match InboundMessage::parse(raw) {
        Ok(message) => message,
        Err(error) => {
            warn!(connection_id = %handle.id, %error, "ignoring inbound frame");
            return Ok(Dispatched::Ignored(error));
        }
    };

    match message {
        InboundMessage::Register { device_id } => {
            info!(connection_id = %handle.id, device_id = %device_id, "device registered");
            let report = engine.register_and_drain(&device_id, handle).await?;
            Ok(Dispatched::Registered(report))
        }
        InboundMessage::Ack { id } => {
            let newly_marked = engine.acknowledge(id)?;
            Ok(Dispatched::Acknowledged { id, newly_marked })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanrelay_core::{DeviceId, NewCommand};
    use fanrelay_store::{CommandRepo, CommandStore, Database};
    use serde_json::json;

    use crate::delivery::{AckPolicy, DrainOutcome};
    use crate::registry::SessionRegistry;

    fn engine() -> (Arc<CommandRepo>, DeliveryEngine) {
        let repo = Arc::new(CommandRepo::new(Database::in_memory().unwrap()));
        let store: Arc<dyn CommandStore> = repo.clone();
        let engine = DeliveryEngine::new(store, Arc::new(SessionRegistry::new()), AckPolicy::OnSend);
        (repo, engine)
    }

    #[tokio::test]
    async fn register_frame_drains() {
        let (repo, engine) = engine();
        let cmd = repo
            .insert(&NewCommand::new("esp01", "set_fan_speed", json!({"speed": 40})))
            .unwrap();
        let (handle, mut rx) = SessionHandle::channel(4);

        let result = dispatch(&engine, &handle, r#"{"type":"register","device_id":"esp01"}"#)
            .await
            .unwrap();
        let Dispatched::Registered(report) = result else {
            panic!("expected registration, got {result:?}");
        };
        assert_eq!(report.sent, vec![cmd.id]);
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert!(rx.try_recv().is_ok());
        assert!(engine
            .registry()
            .is_current(&DeviceId::from_raw("esp01"), &handle.id));
    }

    #[tokio::test]
    async fn ack_frame_marks_command() {
        let (repo, engine) = engine();
        let cmd = repo
            .insert(&NewCommand::new("esp01", "reboot", serde_json::Value::Null))
            .unwrap();
        let (handle, _rx) = SessionHandle::channel(4);
        let frame = format!(r#"{{"type":"ack","id":{}}}"#, cmd.id);

        assert_eq!(
            dispatch(&engine, &handle, &frame).await.unwrap(),
            Dispatched::Acknowledged {
                id: cmd.id,
                newly_marked: true
            }
        );
        assert!(repo.get(cmd.id).unwrap().delivered);

        assert_eq!(
            dispatch(&engine, &handle, &frame).await.unwrap(),
            Dispatched::Acknowledged {
                id: cmd.id,
                newly_marked: false
            }
        );
    }

    #[tokio::test]
    async fn bad_frames_are_ignored() {
        let (_repo, engine) = engine();
        let (handle, _rx) = SessionHandle::channel(4);

        for (raw, expected) in [
            ("not json", "malformed"),
            (r#"{"device_id":"esp01"}"#, "missing"),
            (r#"{"type":"telemetry"}"#, "unknown"),
            (r#"{"type":"register"}"#, "invalid"),
            (r#"{"type":"ack","id":"seven"}"#, "invalid"),
        ] {
            let result = dispatch(&engine, &handle, raw).await.unwrap();
            let Dispatched::Ignored(error) = result else {
                panic!("{raw} should be ignored, got {result:?}");
            };
            let matched = match expected {
                "malformed" => matches!(error, ProtocolError::Malformed(_)),
                "missing" => matches!(error, ProtocolError::MissingType),
                "unknown" => matches!(error, ProtocolError::UnknownType(_)),
                _ => matches!(error, ProtocolError::InvalidFields { .. }),
            };
            assert!(matched, "{raw}: unexpected {error:?}");
        }
        assert_eq!(engine.registry().device_count(), 0);
    }
}
