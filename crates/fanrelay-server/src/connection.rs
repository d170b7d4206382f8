//! Per-connection WebSocket loop.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, Instrument};

use crate::handler::{self, Dispatched};
use crate::registry::SessionRegistry;
use crate::server::AppState;
use crate::session::SessionHandle;

const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Drive one upgraded socket until either side hangs up or the registry
/// closes the session. Unregisters exactly once on the way out.
pub async fn serve_connection(socket: WebSocket, state: AppState) {
    let (handle, rx) = SessionHandle::channel(state.config.max_send_queue);
    state.registry.attach(Arc::clone(&handle));
    let span = tracing::info_span!("connection", connection_id = %handle.id);

    async move {
        info!("connection opened");
        let (ws_tx, mut ws_rx) = socket.split();

        let writer = tokio::spawn(
            write_frames(ws_tx, rx, Arc::clone(&handle), state.config.heartbeat_interval)
                .in_current_span(),
        );

        loop {
            let frame = tokio::select! {
                _ = handle.closed() => break,
                frame = ws_rx.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match handler::dispatch(&state.engine, &handle, text.as_str()).await {
                        Ok(Dispatched::Registered(report)) => {
                            debug!(sent = report.sent.len(), outcome = ?report.outcome, "registered");
                        }
                        Ok(Dispatched::Acknowledged { id, newly_marked }) => {
                            trace!(command_id = %id, newly_marked, "acked");
                        }
                        Ok(Dispatched::Ignored(_)) => {}
                        Err(e) => error!(error = %e, "failed to handle frame"),
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => handle.record_pong(),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "socket read failed");
                    break;
                }
            }
        }

        teardown(&state.registry, &handle, writer).await;
        info!("connection closed");
    }
    .instrument(span)
    .await;
}

/// Unregister first so a writer blocked on a dead peer cannot hold the
/// device mapping, then give the writer a bounded window to flush.
async fn teardown(registry: &SessionRegistry, handle: &SessionHandle, writer: JoinHandle<()>) {
    handle.close();
    let _ = registry.unregister(&handle.id);

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_GRACE, writer).await.is_err() {
        debug!("writer did not finish, aborting");
        abort.abort();
    }
}

/// Queue to socket, plus periodic pings. Ends when the handle is closed or
/// the socket refuses a write.
async fn write_frames(
    mut ws_tx: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Arc<String>>,
    handle: Arc<SessionHandle>,
    heartbeat: Duration,
) {
    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = handle.closed() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                break;
            }
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(WsMessage::Text(String::clone(&frame).into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                trace!("sent ping");
            }
        }
    }
    // Wake the reader if the write side failed first.
    handle.close();
}

/// Periodically close sessions that stopped answering pings.
pub fn start_stale_sweeper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let closed = registry.close_stale(timeout);
            if closed > 0 {
                info!(closed, "stale session sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sweeper_closes_idle_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let (handle, _rx) = SessionHandle::channel(4);
        registry.attach(Arc::clone(&handle));
        // Pretend the last pong was long ago.
        handle
            .last_pong_ms
            .store(0, std::sync::atomic::Ordering::Relaxed);

        let sweeper = start_stale_sweeper(
            Arc::clone(&registry),
            Duration::from_secs(1),
            Duration::from_secs(90),
        );
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(handle.is_closed());
        assert_eq!(registry.connection_count(), 0);
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_unregisters_before_waiting_on_a_stuck_writer() {
        use fanrelay_core::DeviceId;

        let registry = Arc::new(SessionRegistry::new());
        let (handle, _rx) = SessionHandle::channel(4);
        let device = DeviceId::from_raw("esp01");
        registry.register(device.clone(), Arc::clone(&handle));

        // Writer that notices the close, reports what the registry looks like
        // at that moment, then hangs like a send to a peer that stopped reading.
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let writer = {
            let registry = Arc::clone(&registry);
            let handle = Arc::clone(&handle);
            let device = device.clone();
            tokio::spawn(async move {
                handle.closed().await;
                let _ = seen_tx.send(registry.lookup(&device).is_some());
                std::future::pending::<()>().await;
            })
        };

        // Returns after the grace period instead of hanging on the writer.
        teardown(&registry, &handle, writer).await;

        assert!(!seen_rx.await.unwrap(), "device still mapped while writer ran");
        assert!(registry.lookup(&device).is_none());
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_keeps_live_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let (handle, _rx) = SessionHandle::channel(4);
        registry.attach(Arc::clone(&handle));

        let sweeper = start_stale_sweeper(
            Arc::clone(&registry),
            Duration::from_secs(1),
            Duration::from_secs(90),
        );
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!handle.is_closed());
        assert_eq!(registry.connection_count(), 1);
        sweeper.abort();
    }
}
