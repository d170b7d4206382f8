//! Live session bookkeeping.
//!
//! Two views over the same handles:
//!
//! | Map | Key | Purpose |
//! |-----|-----|---------|
//! | `connections` | connection id | every live socket, target of fan-out |
//! | `devices` | device id | the one authoritative session per device |
//!
//! `bindings` remembers which device a connection registered as, so that a
//! close can be resolved back to its device without tagging the handle.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fanrelay_core::{ConnectionId, DeviceId, OutboundMessage};
use tracing::{debug, info, warn};

use crate::session::{SendOutcome, SessionHandle};

/// Lifetime drops after which a slow session is disconnected.
const MAX_TOTAL_DROPS: u64 = 100;

/// What happened during one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub sent: usize,
    pub dropped: usize,
    pub removed: usize,
}

#[derive(Default)]
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, Arc<SessionHandle>>,
    devices: DashMap<DeviceId, Arc<SessionHandle>>,
    bindings: DashMap<ConnectionId, DeviceId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly opened connection for fan-out.
    pub fn attach(&self, handle: Arc<SessionHandle>) {
        let _ = self.connections.insert(handle.id.clone(), handle);
    }

    /// Make `handle` the session for `device_id` (last register wins).
    ///
    /// Returns the replaced session, if it was a different connection. The
    /// replaced connection stays open; it just stops being authoritative.
    pub fn register(
        &self,
        device_id: DeviceId,
        handle: Arc<SessionHandle>,
    ) -> Option<Arc<SessionHandle>> {
        if let Some(previous_device) = self.bindings.insert(handle.id.clone(), device_id.clone()) {
            if previous_device != device_id {
                let _ = self
                    .devices
                    .remove_if(&previous_device, |_, current| current.id == handle.id);
            }
        }
        let _ = self
            .connections
            .entry(handle.id.clone())
            .or_insert_with(|| Arc::clone(&handle));

        let previous = self.devices.insert(device_id.clone(), Arc::clone(&handle));
        debug!(device_id = %device_id, connection_id = %handle.id, "device registered");

        if handle.is_closed() {
            let _ = self.unregister(&handle.id);
        }

        previous.filter(|p| p.id != handle.id)
    }

    /// Forget a connection. The device mapping is removed only if it still
    /// points at this connection; returns whether that happened.
    pub fn unregister(&self, connection_id: &ConnectionId) -> bool {
        let _ = self.connections.remove(connection_id);
        let Some((_, device_id)) = self.bindings.remove(connection_id) else {
            return false;
        };
        let removed = self
            .devices
            .remove_if(&device_id, |_, current| current.id == *connection_id)
            .is_some();
        if removed {
            debug!(device_id = %device_id, connection_id = %connection_id, "device unregistered");
        } else {
            debug!(device_id = %device_id, connection_id = %connection_id, "stale unregister ignored");
        }
        removed
    }

    pub fn lookup(&self, device_id: &DeviceId) -> Option<Arc<SessionHandle>> {
        self.devices.get(device_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `connection_id` is still the authoritative session for `device_id`.
    pub fn is_current(&self, device_id: &DeviceId, connection_id: &ConnectionId) -> bool {
        self.devices
            .get(device_id)
            .is_some_and(|entry| entry.id == *connection_id)
    }

    /// Send one message to every live session.
    pub fn broadcast_to_all(&self, message: &OutboundMessage) -> BroadcastReport {
        let frame = match message.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to encode broadcast");
                return BroadcastReport::default();
            }
        };

        let targets: Vec<Arc<SessionHandle>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut report = BroadcastReport {
            recipients: targets.len(),
            ..Default::default()
        };
        let mut to_remove = Vec::new();

        for session in &targets {
            match session.send(Arc::clone(&frame)) {
                SendOutcome::Sent => report.sent += 1,
                SendOutcome::Full => {
                    report.dropped += 1;
                    let drops = session.drop_count();
                    if drops >= MAX_TOTAL_DROPS {
                        warn!(connection_id = %session.id, drops, "disconnecting slow session");
                        session.close();
                        to_remove.push(session.id.clone());
                    } else {
                        warn!(connection_id = %session.id, drops, "send queue full, dropping broadcast");
                    }
                }
                SendOutcome::Closed => to_remove.push(session.id.clone()),
            }
        }

        for id in &to_remove {
            let _ = self.unregister(id);
        }
        report.removed = to_remove.len();

        debug!(kind = message.kind(), recipients = report.recipients, sent = report.sent, "broadcast");
        report
    }

    /// Close and forget sessions that have not answered a ping within `timeout`.
    pub fn close_stale(&self, timeout: Duration) -> usize {
        let stale: Vec<Arc<SessionHandle>> = self
            .connections
            .iter()
            .filter(|entry| entry.value().idle_for() >= timeout)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in &stale {
            session.close();
            let _ = self.unregister(&session.id);
            info!(connection_id = %session.id, "closed unresponsive session");
        }
        stale.len()
    }

    /// Close every session (server shutdown).
    pub fn close_all(&self) {
        let all: Vec<Arc<SessionHandle>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in all {
            session.close();
            let _ = self.unregister(&session.id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Currently registered device ids, sorted.
    pub fn registered_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
