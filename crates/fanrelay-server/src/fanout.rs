//! Live telemetry fan-out to every open connection.

use std::sync::Arc;

use fanrelay_core::{OutboundMessage, TelemetryReading};
use tracing::debug;

use crate::registry::{BroadcastReport, SessionRegistry};

/// Pushes stored readings to dashboards and devices alike.
///
/// Delivery is best effort: a reading that a slow connection cannot take is
/// dropped for that connection only. Nothing is replayed on reconnect.
#[derive(Clone)]
pub struct TelemetryFanout {
    registry: Arc<SessionRegistry>,
}

impl TelemetryFanout {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn publish(&self, reading: &TelemetryReading) -> BroadcastReport {
        let report = self.registry.broadcast_to_all(&OutboundMessage::Telemetry {
            data: reading.clone(),
        });
        debug!(
            device_id = %reading.device_id,
            reading_id = reading.id,
            recipients = report.recipients,
            dropped = report.dropped,
            "telemetry published"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanrelay_core::DeviceId;

    use crate::session::SessionHandle;

    fn reading(id: i64, temperature: f64) -> TelemetryReading {
        TelemetryReading {
            id,
            device_id: DeviceId::from_raw("esp01"),
            temperature: Some(temperature),
            humidity: None,
            fan_rpm: Some(1200),
            received_at: "2026-01-01T00:00:00.000000Z".into(),
        }
    }

    #[test]
    fn every_connection_receives_readings_in_order() {
        let registry = Arc::new(SessionRegistry::new());
        let fanout = TelemetryFanout::new(Arc::clone(&registry));

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (dashboard, rx) = SessionHandle::channel(8);
            registry.attach(dashboard);
            receivers.push(rx);
        }
        let (device, rx) = SessionHandle::channel(8);
        registry.register(DeviceId::from_raw("esp02"), device);
        receivers.push(rx);

        let first = fanout.publish(&reading(1, 21.5));
        fanout.publish(&reading(2, 22.0));
        assert_eq!(first.recipients, 4);
        assert_eq!(first.sent, 4);

        for mut rx in receivers {
            let ids: Vec<i64> = std::iter::from_fn(|| rx.try_recv().ok())
                .map(|frame| {
                    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
                    assert_eq!(value["type"], "telemetry");
                    assert_eq!(value["data"]["device_id"], "esp01");
                    value["data"]["id"].as_i64().unwrap()
                })
                .collect();
            assert_eq!(ids, vec![1, 2]);
        }
    }

    #[test]
    fn publish_with_no_connections_is_a_noop() {
        let fanout = TelemetryFanout::new(Arc::new(SessionRegistry::new()));
        assert_eq!(fanout.publish(&reading(1, 20.0)), BroadcastReport::default());
    }
}
