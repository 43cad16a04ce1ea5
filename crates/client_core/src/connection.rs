//! Persistent websocket to the chat server: handshake, auth frame, send,
//! receive, and reconnection after unexpected closes.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, Weak,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use shared::{domain::ConnectionState, protocol::ClientFrame};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ReconnectPolicy,
    error::ClientResult,
    normalize::{parse_frame, InboundEvent},
};

pub type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

#[derive(Default)]
struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(u64, EventHandler)>>,
}

impl HandlerRegistry {
    fn add(&self, handler: EventHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    fn remove(&self, id: u64) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    fn dispatch(&self, event: &InboundEvent) {
        // Snapshot so a handler may unsubscribe itself.
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

/// Token returned by [`ConnectionManager::subscribe`].
pub struct Subscription {
    id: u64,
    registry: Weak<HandlerRegistry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Delay generator for one run of reconnection attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    next: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            next: policy.initial_delay,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        let cap = self.policy.max_delay.max(self.policy.initial_delay);
        self.attempt = self.attempt.saturating_add(1);
        let multiplier = if self.policy.multiplier.is_finite() {
            self.policy.multiplier.max(1.0)
        } else {
            1.0
        };
        let grown = base.as_secs_f64() * multiplier;
        self.next = if grown < cap.as_secs_f64() {
            Duration::from_secs_f64(grown)
        } else {
            cap
        };

        let jitter = if self.policy.jitter.is_finite() {
            self.policy.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next = self.policy.initial_delay;
    }
}

struct Link {
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    shutdown: Option<oneshot::Sender<()>>,
}

enum SessionEnd {
    Shutdown,
    Closed,
}

pub struct ConnectionManager {
    ws_url: Url,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    handlers: Arc<HandlerRegistry>,
    link: Mutex<Link>,
}

impl ConnectionManager {
    pub fn new(ws_url: &str, policy: ReconnectPolicy) -> ClientResult<Arc<Self>> {
        let ws_url = Url::parse(ws_url)?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Arc::new(Self {
            ws_url,
            policy,
            state,
            handlers: Arc::new(HandlerRegistry::default()),
            link: Mutex::new(Link {
                generation: 0,
                outbound: None,
                shutdown: None,
            }),
        }))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Handshake URI: the configured URL plus the credential as `token`.
    pub fn handshake_url(&self, credential: &str) -> Url {
        let mut url = self.ws_url.clone();
        url.query_pairs_mut().append_pair("token", credential);
        url
    }

    /// Registers a callback run once per classified inbound frame, in arrival order.
    pub fn subscribe(&self, handler: impl Fn(&InboundEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.handlers.add(Arc::new(handler));
        Subscription {
            id,
            registry: Arc::downgrade(&self.handlers),
        }
    }

    /// Opens the transport, superseding any previous connection. Resolves
    /// `true` once a transport reports open (auth is not awaited), or `false`
    /// if `disconnect` or a newer `connect` wins first.
    pub async fn connect(self: &Arc<Self>, credential: &str) -> bool {
        let (open_tx, open_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let generation = {
            let mut link = self.link.lock().await;
            if let Some(previous) = link.shutdown.take() {
                let _ = previous.send(());
            }
            link.generation += 1;
            link.outbound = None;
            link.shutdown = Some(shutdown_tx);
            self.state.send_replace(ConnectionState::Connecting);
            link.generation
        };

        let manager = Arc::clone(self);
        let credential = credential.to_string();
        tokio::spawn(async move {
            manager
                .supervise(generation, credential, open_tx, shutdown_rx)
                .await;
        });

        open_rx.await.unwrap_or(false)
    }

    /// Closes the transport; no reconnect happens until the next `connect`.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        self.close_link(&mut link);
    }

    /// `disconnect` for synchronous teardown paths. Returns `false`, doing
    /// nothing, when the link is held elsewhere.
    pub fn try_disconnect(&self) -> bool {
        match self.link.try_lock() {
            Ok(mut link) => {
                self.close_link(&mut link);
                true
            }
            Err(_) => false,
        }
    }

    fn close_link(&self, link: &mut Link) {
        link.generation += 1;
        link.outbound = None;
        if let Some(shutdown) = link.shutdown.take() {
            let _ = shutdown.send(());
            info!("ws: disconnected by client");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Queues a frame while connected. Anything sent in another state is
    /// dropped; returns whether the frame was queued.
    pub async fn send(&self, frame: &ClientFrame) -> bool {
        let link = self.link.lock().await;
        let outbound = match (self.state(), link.outbound.as_ref()) {
            (ConnectionState::Connected, Some(outbound)) => outbound,
            (state, _) => {
                debug!(?state, "ws: dropping outbound frame while not connected");
                return false;
            }
        };
        match serde_json::to_string(frame) {
            Ok(text) => outbound.send(WsMessage::Text(text)).is_ok(),
            Err(err) => {
                warn!(%err, "ws: failed to encode outbound frame");
                false
            }
        }
    }

    async fn set_state_for(&self, generation: u64, state: ConnectionState) -> bool {
        let link = self.link.lock().await;
        if link.generation != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    async fn dispatch_for(&self, generation: u64, event: &InboundEvent) -> bool {
        let link = self.link.lock().await;
        if link.generation != generation {
            return false;
        }
        self.handlers.dispatch(event);
        drop(link);
        true
    }

    async fn supervise(
        self: Arc<Self>,
        generation: u64,
        credential: String,
        open_tx: oneshot::Sender<bool>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let url = self.handshake_url(&credential);
        let mut open_tx = Some(open_tx);
        let mut backoff = Backoff::new(self.policy);

        loop {
            if !self
                .set_state_for(generation, ConnectionState::Connecting)
                .await
            {
                return;
            }
            info!(url = %self.ws_url, attempt = backoff.attempt(), "ws: connecting");

            let connected = tokio::select! {
                biased;
                _ = &mut shutdown_rx => return,
                result = connect_async(url.as_str()) => result,
            };

            match connected {
                Ok((stream, _)) => {
                    backoff.reset();
                    let end = self
                        .run_session(generation, stream, &credential, &mut open_tx, &mut shutdown_rx)
                        .await;
                    if let SessionEnd::Shutdown = end {
                        return;
                    }
                    warn!("ws: connection closed unexpectedly");
                }
                Err(err) => warn!(%err, "ws: connect attempt failed"),
            }

            if !self
                .set_state_for(generation, ConnectionState::Connecting)
                .await
            {
                return;
            }
            let delay = backoff.next_delay();
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempt(),
                "ws: scheduling reconnect"
            );
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session<S>(
        &self,
        generation: u64,
        stream: tokio_tungstenite::WebSocketStream<S>,
        credential: &str,
        open_tx: &mut Option<oneshot::Sender<bool>>,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        {
            let mut link = self.link.lock().await;
            if link.generation != generation {
                let _ = sink.send(WsMessage::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            link.outbound = Some(outbound_tx);
            self.state.send_replace(ConnectionState::Connected);
        }
        info!("ws: connected");

        match serde_json::to_string(&ClientFrame::auth(credential)) {
            Ok(text) => {
                if let Err(err) = sink.send(WsMessage::Text(text)).await {
                    warn!(%err, "ws: failed to send auth frame");
                }
            }
            Err(err) => warn!(%err, "ws: failed to encode auth frame"),
        }
        if let Some(open) = open_tx.take() {
            let _ = open.send(true);
        }

        let end = loop {
            tokio::select! {
                biased;
                _ = &mut *shutdown_rx => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
                Some(outbound) = outbound_rx.recv() => {
                    if let Err(err) = sink.send(outbound).await {
                        warn!(%err, "ws: send failed");
                        break SessionEnd::Closed;
                    }
                }
                incoming = source.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let event = parse_frame(&text);
                        if event == InboundEvent::Ignored {
                            debug!(frame = %text, "ws: ignoring frame");
                            continue;
                        }
                        if !self.dispatch_for(generation, &event).await {
                            break SessionEnd::Shutdown;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(?frame, "ws: server closed connection");
                        break SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "ws: receive failed");
                        break SessionEnd::Closed;
                    }
                    None => break SessionEnd::Closed,
                },
            }
        };

        let mut link = self.link.lock().await;
        if link.generation == generation {
            link.outbound = None;
        }
        end
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
