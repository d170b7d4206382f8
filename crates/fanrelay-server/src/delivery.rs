//! Durable command delivery.
//!
//! Commands live in the store until delivered. A device's queue is drained
//! in creation order whenever it registers, and new commands are pushed
//! straight through when the device is online. Both paths hold a per-device
//! lock, so a drain and a submit for the same device never interleave.

use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use fanrelay_core::{Command, CommandId, DeviceId, NewCommand, OutboundMessage, ProtocolError};
use fanrelay_store::{CommandStore, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;
use crate::session::{SendOutcome, SessionHandle};

/// When a command counts as delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// A successful send marks the command delivered; `ack` is a no-op
    /// confirmation for commands already marked.
    #[default]
    OnSend,
    /// Only an explicit `ack` marks a command delivered. Unacked commands are
    /// sent again on every registration.
    OnAck,
}

impl FromStr for AckPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-send" | "on_send" => Ok(Self::OnSend),
            "on-ack" | "on_ack" => Ok(Self::OnAck),
            other => Err(format!("unknown ack policy: {other}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Why a drain stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every pending command was sent.
    Completed,
    /// Another connection registered for the device mid-drain.
    Superseded,
    /// The session's connection went away.
    ChannelClosed,
    /// The session's outbound queue filled up.
    ChannelBacklogged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainReport {
    /// Commands handed to the session, in send order.
    pub sent: Vec<CommandId>,
    /// Pending commands left for the next registration.
    pub remaining: usize,
    pub outcome: DrainOutcome,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmitReport {
    pub command: Command,
    /// Whether the command went out over a live session immediately.
    pub pushed: bool,
}

pub struct DeliveryEngine {
    store: Arc<dyn CommandStore>,
    registry: Arc<SessionRegistry>,
    policy: AckPolicy,
    device_locks: DashMap<DeviceId, Arc<Mutex<()>>>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn CommandStore>,
        registry: Arc<SessionRegistry>,
        policy: AckPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            device_locks: DashMap::new(),
        }
    }

    pub fn policy(&self) -> AckPolicy {
        self.policy
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn device_lock(&self, device_id: &DeviceId) -> Arc<Mutex<()>> {
        let entry = self.device_locks.entry(device_id.clone()).or_default();
        Arc::clone(entry.value())
    }

    /// Install `handle` as the device's session and drain its queue.
    pub async fn register_and_drain(
        &self,
        device_id: &DeviceId,
        handle: &Arc<SessionHandle>,
    ) -> Result<DrainReport, DeliveryError> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        if let Some(previous) = self.registry.register(device_id.clone(), Arc::clone(handle)) {
            info!(
                device_id = %device_id,
                connection_id = %handle.id,
                replaced = %previous.id,
                "device session replaced"
            );
        }

        self.drain_locked(device_id, handle)
    }

    /// Caller must hold the device lock.
    fn drain_locked(
        &self,
        device_id: &DeviceId,
        handle: &Arc<SessionHandle>,
    ) -> Result<DrainReport, DeliveryError> {
        let pending = self.store.undelivered_for_device(device_id)?;
        let total = pending.len();
        let mut sent = Vec::with_capacity(total);
        let mut outcome = DrainOutcome::Completed;

        for command in pending {
            if !self.registry.is_current(device_id, &handle.id) {
                outcome = DrainOutcome::Superseded;
                break;
            }

            let id = command.id;
            let frame = Arc::new(OutboundMessage::Command { data: command }.to_json()?);
            match handle.send(frame) {
                SendOutcome::Sent => {}
                SendOutcome::Closed => {
                    let _ = self.registry.unregister(&handle.id);
                    outcome = DrainOutcome::ChannelClosed;
                    break;
                }
                SendOutcome::Full => {
                    outcome = DrainOutcome::ChannelBacklogged;
                    break;
                }
            }

            if self.policy == AckPolicy::OnSend {
                let _ = self.store.mark_delivered(id)?;
            }
            sent.push(id);
        }

        let report = DrainReport {
            remaining: total - sent.len(),
            sent,
            outcome,
        };

        if report.outcome == DrainOutcome::Completed {
            debug!(device_id = %device_id, sent = report.sent.len(), "drain complete");
        } else {
            warn!(
                device_id = %device_id,
                connection_id = %handle.id,
                outcome = ?report.outcome,
                sent = report.sent.len(),
                remaining = report.remaining,
                "drain stopped early"
            );
        }
        Ok(report)
    }

    /// Record a device's confirmation for one command. Works whether or not
    /// the device is connected. Returns whether the command was newly marked.
    pub fn acknowledge(&self, id: CommandId) -> Result<bool, DeliveryError> {
        let newly_marked = self.store.mark_delivered(id)?;
        if newly_marked {
            debug!(command_id = %id, "command acknowledged");
        } else if self.policy == AckPolicy::OnAck {
            warn!(command_id = %id, "ack for unknown or already delivered command");
        } else {
            debug!(command_id = %id, "ack for command already marked on send");
        }
        Ok(newly_marked)
    }

    /// Store a new command and, if its device is online, send it right away.
    pub async fn submit(&self, new_command: &NewCommand) -> Result<SubmitReport, DeliveryError> {
        let device_id = &new_command.device_id;
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let command = self.store.insert(new_command)?;

        let Some(handle) = self.registry.lookup(device_id) else {
            debug!(device_id = %device_id, command_id = %command.id, "device offline, command queued");
            return Ok(SubmitReport {
                command,
                pushed: false,
            });
        };

        match self.policy {
            // A drain sends anything still queued ahead of this command first.
            AckPolicy::OnSend => {
                let report = self.drain_locked(device_id, &handle)?;
                let pushed = report.sent.contains(&command.id);
                Ok(SubmitReport {
                    command: Command {
                        delivered: pushed,
                        ..command
                    },
                    pushed,
                })
            }
            // Earlier unacked commands are in flight already; resending them
            // on every submit would flood the device.
            AckPolicy::OnAck => {
                let frame = Arc::new(
                    OutboundMessage::Command {
                        data: command.clone(),
                    }
                    .to_json()?,
                );
                let pushed = match handle.send(frame) {
                    SendOutcome::Sent => true,
                    SendOutcome::Closed => {
                        let _ = self.registry.unregister(&handle.id);
                        false
                    }
                    SendOutcome::Full => false,
                };
                Ok(SubmitReport { command, pushed })
            }
        }
    }
}
