//! Realtime channel with heartbeats and bounded reconnection.
//!
//! The channel owns one background run loop per `connect()`. The loop dials
//! the transport, replays every registered subscription, then multiplexes
//! heartbeats, outbound frames and inbound messages. An unexpected drop
//! re-dials with exponential backoff until the attempt budget is spent;
//! `disconnect()` always wins over reconnection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ChannelConfig;
use crate::error::{CoreError, CoreResult};
use crate::event_bus::{CoreEvent, EventBus};
use crate::realtime::protocol::{ImportProgress, InboundMessage, OutboundFrame};
use crate::realtime::subscriptions::{ProgressHandler, SubscriptionRegistry};
use crate::realtime::transport::ChannelTransport;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {})", attempt)
            }
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Capacity for frames queued while the run loop is between polls
const OUTBOUND_QUEUE_CAPACITY: usize = 32;

/// What the run loop should do next, resolved from one poll of all sources
enum LoopStep {
    Shutdown,
    Heartbeat,
    Send(OutboundFrame),
    Inbound(CoreResult<Option<InboundMessage>>),
}

/// Client endpoint of the realtime import-progress channel
pub struct RealtimeChannel {
    transport: Arc<dyn ChannelTransport>,
    config: ChannelConfig,
    tenant_id: String,
    registry: SubscriptionRegistry,
    event_bus: Arc<EventBus>,
    state: Arc<RwLock<ConnectionState>>,
    outbound: Arc<RwLock<Option<mpsc::Sender<OutboundFrame>>>>,
    shutdown: Arc<RwLock<Option<mpsc::Sender<()>>>>,
    run_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl Clone for RealtimeChannel {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            tenant_id: self.tenant_id.clone(),
            registry: self.registry.clone(),
            event_bus: Arc::clone(&self.event_bus),
            state: Arc::clone(&self.state),
            outbound: Arc::clone(&self.outbound),
            shutdown: Arc::clone(&self.shutdown),
            run_task: Arc::clone(&self.run_task),
        }
    }
}

impl RealtimeChannel {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        config: ChannelConfig,
        tenant_id: impl Into<String>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            transport,
            config,
            tenant_id: tenant_id.into(),
            registry: SubscriptionRegistry::new(),
            event_bus,
            state: Arc::new(RwLock::new(ConnectionState::Closed)),
            outbound: Arc::new(RwLock::new(None)),
            shutdown: Arc::new(RwLock::new(None)),
            run_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the run loop with the given access token. A channel that is
    /// already running is left alone.
    pub async fn connect(&self, access_token: &str) -> CoreResult<()> {
        let mut task_slot = self.run_task.write().await;
        if task_slot.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Channel already running, connect is a no-op");
            return Ok(());
        }

        let url = format!(
            "{}?tenant_id={}&token={}",
            self.config.url, self.tenant_id, access_token
        );
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.outbound.write().await = Some(outbound_tx);
        *self.shutdown.write().await = Some(shutdown_tx);

        let channel = self.clone();
        *task_slot = Some(tokio::spawn(async move {
            channel.run(url, outbound_rx, shutdown_rx).await;
        }));
        Ok(())
    }

    /// Close the connection and stop reconnecting. Registered subscriptions
    /// are kept and will be replayed by the next `connect()`.
    pub async fn disconnect(&self) {
        if let Some(shutdown) = self.shutdown.write().await.take() {
            let _ = shutdown.send(()).await;
        }
        *self.outbound.write().await = None;
        if let Some(task) = self.run_task.write().await.take() {
            let _ = task.await;
        }
    }

    /// Register a progress handler for an import batch.
    ///
    /// Registration is connection-independent: while disconnected only the
    /// registry changes, and the subscribe frame goes out on (re)connect.
    pub async fn subscribe(&self, batch_id: &str, handler: ProgressHandler) -> CoreResult<()> {
        self.registry.insert(batch_id, handler);
        self.send_if_open(OutboundFrame::SubscribeImport {
            batch_id: batch_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Drop the subscription for a batch, notifying the server when open
    pub async fn unsubscribe(&self, batch_id: &str) -> CoreResult<()> {
        if self.registry.remove(batch_id) {
            self.send_if_open(OutboundFrame::UnsubscribeImport {
                batch_id: batch_id.to_string(),
            })
            .await;
        }
        Ok(())
    }

    /// Request an immediate progress snapshot for a batch
    pub async fn request_progress(&self, batch_id: &str) -> CoreResult<()> {
        let state = *self.state.read().await;
        if state != ConnectionState::Open {
            return Err(CoreError::illegal_state(
                "request_progress",
                state.to_string(),
            ));
        }
        self.send_if_open(OutboundFrame::GetProgress {
            batch_id: batch_id.to_string(),
        })
        .await;
        Ok(())
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// Hand a frame to the run loop, but only while the channel is open.
    /// Anything not open relies on the reconnect replay instead; queueing
    /// here as well would deliver the frame twice.
    async fn send_if_open(&self, frame: OutboundFrame) {
        if *self.state.read().await != ConnectionState::Open {
            debug!("Channel not open, frame not queued");
            return;
        }
        let sender = self.outbound.read().await.clone();
        if let Some(sender) = sender {
            if sender.send(frame).await.is_err() {
                debug!("Run loop gone, dropping outbound frame");
            }
        }
    }

    async fn set_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.write().await;
            if *state == new_state {
                return;
            }
            *state = new_state;
        }
        debug!(state = %new_state, "Channel state changed");
        self.event_bus
            .publish(CoreEvent::ConnectionChanged { state: new_state })
            .await;
    }

    async fn run(
        self,
        url: String,
        mut outbound_rx: mpsc::Receiver<OutboundFrame>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        // 0 is the initial dial; n >= 1 is the n-th reconnect attempt
        let mut attempt: u32 = 0;

        'dial: loop {
            if attempt == 0 {
                self.set_state(ConnectionState::Connecting).await;
            } else {
                if attempt > self.config.max_reconnect_attempts {
                    error!(
                        attempts = self.config.max_reconnect_attempts,
                        "Reconnect budget exhausted, giving up"
                    );
                    self.set_state(ConnectionState::Failed).await;
                    self.event_bus
                        .publish(CoreEvent::ChannelError {
                            message: CoreError::ReconnectExhausted {
                                attempts: self.config.max_reconnect_attempts,
                            }
                            .to_string(),
                            batch_id: None,
                        })
                        .await;
                    break;
                }
                self.set_state(ConnectionState::Reconnecting { attempt }).await;
                let delay = self.config.reconnect_delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => {
                        self.set_state(ConnectionState::Closed).await;
                        break;
                    }
                }
            }

            let mut conn = match self.transport.connect(&url).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(attempt, error = %e, "Channel connect failed");
                    attempt += 1;
                    continue;
                }
            };

            info!("Realtime channel connected");
            self.set_state(ConnectionState::Open).await;
            // Sole reset of the backoff counter; every failure path below
            // increments from here
            attempt = 0;

            // Replay every registered subscription on the fresh connection
            for batch_id in self.registry.batch_ids() {
                if let Err(e) = conn
                    .send(&OutboundFrame::SubscribeImport { batch_id })
                    .await
                {
                    warn!(error = %e, "Subscription replay failed, reconnecting");
                    attempt += 1;
                    continue 'dial;
                }
            }

            let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the first real beat is one period in
            heartbeat.tick().await;

            loop {
                let step = tokio::select! {
                    _ = shutdown_rx.recv() => LoopStep::Shutdown,
                    _ = heartbeat.tick() => LoopStep::Heartbeat,
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => LoopStep::Send(frame),
                        None => LoopStep::Shutdown,
                    },
                    message = conn.next_message() => LoopStep::Inbound(message),
                };

                match step {
                    LoopStep::Shutdown => {
                        conn.close().await;
                        self.set_state(ConnectionState::Closed).await;
                        break 'dial;
                    }
                    LoopStep::Heartbeat => {
                        if let Err(e) = conn.send(&OutboundFrame::Ping).await {
                            warn!(error = %e, "Heartbeat failed, reconnecting");
                            attempt += 1;
                            continue 'dial;
                        }
                    }
                    LoopStep::Send(frame) => {
                        if let Err(e) = conn.send(&frame).await {
                            warn!(error = %e, "Send failed, reconnecting");
                            attempt += 1;
                            continue 'dial;
                        }
                    }
                    LoopStep::Inbound(Ok(Some(message))) => self.dispatch(message).await,
                    LoopStep::Inbound(Ok(None)) => {
                        info!("Channel closed by server");
                        self.set_state(ConnectionState::Closed).await;
                        break 'dial;
                    }
                    LoopStep::Inbound(Err(e)) => {
                        warn!(error = %e, "Channel read failed, reconnecting");
                        attempt += 1;
                        continue 'dial;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, message: InboundMessage) {
        match message {
            InboundMessage::ConnectionEstablished { connection_id } => {
                debug!(connection_id = ?connection_id, "Server acknowledged connection");
            }
            InboundMessage::ImportProgress { progress }
            | InboundMessage::ImportStatusChange { progress } => {
                self.registry.dispatch(progress);
            }
            InboundMessage::ImportError { batch_id, message } => {
                let message = message.unwrap_or_else(|| "import failed".to_string());
                warn!(batch_id = %batch_id, message = %message, "Server reported import failure");
                self.registry
                    .dispatch(ImportProgress::failed(batch_id.clone(), message.clone()));
                self.event_bus
                    .publish(CoreEvent::ChannelError {
                        message,
                        batch_id: Some(batch_id),
                    })
                    .await;
            }
            InboundMessage::SubscriptionConfirmed { batch_id } => {
                debug!(batch_id = %batch_id, "Subscription confirmed");
                self.event_bus
                    .publish(CoreEvent::SubscriptionConfirmed { batch_id })
                    .await;
            }
            InboundMessage::Pong => {
                debug!("Heartbeat acknowledged");
            }
            InboundMessage::Error { message } => {
                let message = message.unwrap_or_else(|| "unspecified channel error".to_string());
                warn!(message = %message, "Server reported channel error");
                self.event_bus
                    .publish(CoreEvent::ChannelError {
                        message,
                        batch_id: None,
                    })
                    .await;
            }
            InboundMessage::Unknown => {
                debug!("Ignoring unrecognized channel message");
            }
        }
    }
}
