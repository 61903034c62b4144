//! Long-lived websocket session with heartbeats and reconnect backoff.
//!
//! The channel is used only when the operator enables sub-batch-interval
//! propagation. It never silently drops an item: a send either comes back
//! acknowledged or the caller is told to fall back to batch sync.

use crate::envelope::RealtimeMessage;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{ChannelError, DeviceId, ItemId, RetryPolicy, SyncItem};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;

// ============================================================================
// CONFIGURATION AND EVENTS
// ============================================================================

/// Connection settings for the realtime channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// `wss://` endpoint of the realtime service.
    pub url: String,
    /// Bearer credential presented during the connect handshake.
    pub auth_token: String,
    pub device_id: DeviceId,
    pub heartbeat_interval: Duration,
    /// How long a sent item may wait for its ack.
    pub ack_timeout: Duration,
    /// Consecutive missed remote heartbeats before reconnecting.
    pub max_missed_heartbeats: u32,
    pub retry: RetryPolicy,
}

/// Lifecycle and traffic events surfaced to the sync manager.
#[derive(Debug)]
pub enum ChannelEvent {
    Connected,
    /// An item pushed by the remote outside the batch cycle.
    ItemReceived(SyncItem),
    /// An ack that no send call was waiting for (e.g. it arrived after the
    /// delivery timeout already expired).
    AckConfirmed { item_id: ItemId, success: bool },
    RemoteError {
        code: String,
        message: String,
        recoverable: bool,
    },
    Disconnected { error: ChannelError },
    /// Reconnect attempts are exhausted; batch sync is now the only path
    /// until an explicit [`RealtimeChannel::reconnect`].
    GaveUp { attempts: u32 },
}

/// Where the channel currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connected,
    GaveUp,
}

enum SessionEnd {
    Shutdown,
    /// The connect handshake itself failed.
    ConnectFailed(ChannelError),
    /// A live session dropped.
    Lost(ChannelError),
}

// ============================================================================
// CHANNEL
// ============================================================================

/// Handle to the realtime session. The connect/reconnect loop runs in a
/// spawned task; this handle sends items and reports status.
pub struct RealtimeChannel {
    config: ChannelConfig,
    outbound_tx: mpsc::Sender<RealtimeMessage>,
    pending_acks: Mutex<HashMap<ItemId, oneshot::Sender<bool>>>,
    status_tx: watch::Sender<ChannelStatus>,
    reconnect_notify: Notify,
}

impl RealtimeChannel {
    /// Start the channel. Lifecycle and traffic events flow through
    /// `events`; the session task runs until `shutdown` flips true.
    pub fn spawn(
        config: ChannelConfig,
        events: mpsc::Sender<ChannelEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (status_tx, _status_rx) = watch::channel(ChannelStatus::Disconnected);
        let channel = Arc::new(Self {
            config,
            outbound_tx,
            pending_acks: Mutex::new(HashMap::new()),
            status_tx,
            reconnect_notify: Notify::new(),
        });
        tokio::spawn(run_channel(channel.clone(), outbound_rx, events, shutdown));
        channel
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status_tx.borrow()
    }

    /// Wake a channel that gave up and start a fresh reconnect sequence.
    pub fn reconnect(&self) {
        self.reconnect_notify.notify_one();
    }

    /// Send one item and wait for its acknowledgement.
    ///
    /// `Ok(true)` means the remote applied it; `Ok(false)` means the remote
    /// refused it (the batch push will surface the proper rejection). Any
    /// `Err` means "not delivered" - the item must go through batch sync.
    pub async fn send_item(&self, item: SyncItem) -> Result<bool, ChannelError> {
        if self.status() != ChannelStatus::Connected {
            return Err(ChannelError::Closed);
        }
        let item_id = item.id;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.register_ack(item_id, ack_tx);

        if self
            .outbound_tx
            .send(RealtimeMessage::Item { item })
            .await
            .is_err()
        {
            self.forget_ack(item_id);
            return Err(ChannelError::Closed);
        }

        match timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(success)) => Ok(success),
            // Session dropped and cleared the waiters, or the timeout hit.
            Ok(Err(_)) => {
                self.forget_ack(item_id);
                Err(ChannelError::AckTimeout { item_id })
            }
            Err(_) => {
                self.forget_ack(item_id);
                Err(ChannelError::AckTimeout { item_id })
            }
        }
    }

    fn register_ack(&self, item_id: ItemId, waiter: oneshot::Sender<bool>) {
        self.acks_guard().insert(item_id, waiter);
    }

    fn forget_ack(&self, item_id: ItemId) {
        self.acks_guard().remove(&item_id);
    }

    /// Route an ack to its waiter, or report it as unclaimed.
    fn resolve_ack(&self, item_id: ItemId, success: bool) -> bool {
        match self.acks_guard().remove(&item_id) {
            Some(waiter) => {
                let _ = waiter.send(success);
                true
            }
            None => false,
        }
    }

    /// Drop all waiters when a session dies; their sends report not
    /// delivered instead of hanging until the timeout.
    fn clear_acks(&self) {
        self.acks_guard().clear();
    }

    fn acks_guard(&self) -> std::sync::MutexGuard<'_, HashMap<ItemId, oneshot::Sender<bool>>> {
        self.pending_acks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: ChannelStatus) {
        self.status_tx.send_replace(status);
    }
}

// ============================================================================
// SESSION LOOP
// ============================================================================

async fn run_channel(
    channel: Arc<RealtimeChannel>,
    mut outbound_rx: mpsc::Receiver<RealtimeMessage>,
    events: mpsc::Sender<ChannelEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let retry = channel.config.retry.clone();
    let mut failed_attempts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let end = run_session(&channel, &mut outbound_rx, &events, &mut shutdown).await;
        channel.set_status(ChannelStatus::Disconnected);
        channel.clear_acks();

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Lost(error) => {
                tracing::warn!(error = %error, "Realtime session lost");
                let _ = events.send(ChannelEvent::Disconnected { error }).await;
                // A session that connected resets the backoff sequence.
                failed_attempts = 1;
            }
            SessionEnd::ConnectFailed(error) => {
                tracing::debug!(error = %error, "Realtime connect failed");
                let _ = events.send(ChannelEvent::Disconnected { error }).await;
                failed_attempts += 1;
            }
        }

        if !retry.attempts_remaining(failed_attempts) {
            channel.set_status(ChannelStatus::GaveUp);
            tracing::warn!(
                attempts = failed_attempts,
                "Realtime channel gave up; batch sync continues alone"
            );
            let _ = events
                .send(ChannelEvent::GaveUp {
                    attempts: failed_attempts,
                })
                .await;
            tokio::select! {
                _ = channel.reconnect_notify.notified() => {
                    failed_attempts = 0;
                    continue;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            continue;
        }

        let delay = retry.jittered_delay_for(failed_attempts.saturating_sub(1));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_session(
    channel: &RealtimeChannel,
    outbound_rx: &mut mpsc::Receiver<RealtimeMessage>,
    events: &mpsc::Sender<ChannelEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut request = match channel.config.url.as_str().into_client_request() {
        Ok(request) => request,
        Err(err) => {
            return SessionEnd::ConnectFailed(ChannelError::Connect {
                reason: format!("invalid url: {err}"),
            })
        }
    };

    // Bearer credential plus device identifier on the connect handshake.
    let bearer = format!("Bearer {}", channel.config.auth_token);
    match HeaderValue::from_str(&bearer) {
        Ok(value) => {
            request.headers_mut().insert("authorization", value);
        }
        Err(err) => {
            return SessionEnd::ConnectFailed(ChannelError::AuthRejected {
                reason: format!("invalid credential: {err}"),
            })
        }
    }
    if let Ok(value) = HeaderValue::from_str(&channel.config.device_id.to_string()) {
        request.headers_mut().insert("x-device-id", value);
    }

    let (socket, _response) = match connect_async(request).await {
        Ok(ok) => ok,
        Err(WsError::Http(response)) if response.status().as_u16() == 401 => {
            return SessionEnd::ConnectFailed(ChannelError::AuthRejected {
                reason: format!("server returned {}", response.status()),
            })
        }
        Err(err) => {
            return SessionEnd::ConnectFailed(ChannelError::Connect {
                reason: err.to_string(),
            })
        }
    };

    channel.set_status(ChannelStatus::Connected);
    let _ = events.send(ChannelEvent::Connected).await;
    tracing::info!(url = %channel.config.url, "Realtime channel connected");

    let (mut sink, mut stream) = socket.split();

    let mut heartbeat = interval(channel.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let max_silence = channel.config.heartbeat_interval * channel.config.max_missed_heartbeats;
    let mut last_remote_heartbeat = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }

            _ = heartbeat.tick() => {
                if last_remote_heartbeat.elapsed() > max_silence {
                    return SessionEnd::Lost(ChannelError::HeartbeatLost {
                        missed: channel.config.max_missed_heartbeats,
                    });
                }
                let beat = RealtimeMessage::Heartbeat {
                    timestamp: Utc::now(),
                    health: "ok".to_string(),
                };
                if let Err(err) = send_message(&mut sink, &beat).await {
                    return SessionEnd::Lost(err);
                }
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if let Err(err) = send_message(&mut sink, &message).await {
                            return SessionEnd::Lost(err);
                        }
                    }
                    // All senders dropped; the channel handle is gone.
                    None => return SessionEnd::Shutdown,
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(channel, &text, events, &mut last_remote_heartbeat).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost(ChannelError::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return SessionEnd::Lost(ChannelError::Connect {
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
    }
}

async fn send_message<S>(sink: &mut S, message: &RealtimeMessage) -> Result<(), ChannelError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(message)?;
    sink.send(Message::Text(text))
        .await
        .map_err(|err| ChannelError::Connect {
            reason: err.to_string(),
        })
}

async fn dispatch(
    channel: &RealtimeChannel,
    text: &str,
    events: &mpsc::Sender<ChannelEvent>,
    last_remote_heartbeat: &mut Instant,
) {
    let message: RealtimeMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(error = %err, "Realtime envelope decode error");
            return;
        }
    };

    match message {
        RealtimeMessage::Item { item } => {
            let _ = events.send(ChannelEvent::ItemReceived(item)).await;
        }
        RealtimeMessage::Ack { item_id, success } => {
            if !channel.resolve_ack(item_id, success) {
                let _ = events
                    .send(ChannelEvent::AckConfirmed { item_id, success })
                    .await;
            }
        }
        RealtimeMessage::Heartbeat { .. } => {
            *last_remote_heartbeat = Instant::now();
        }
        RealtimeMessage::Error {
            code,
            message,
            recoverable,
        } => {
            tracing::warn!(code = %code, recoverable, "Realtime remote error: {message}");
            let _ = events
                .send(ChannelEvent::RemoteError {
                    code,
                    message,
                    recoverable,
                })
                .await;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
