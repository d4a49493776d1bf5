//! WebSocket connection to the signaling relay.
//!
//! One background task owns the socket. It reconnects with exponential
//! backoff and re-sends the last `join-room` as the first frame of every new
//! connection, so room membership survives a dropped socket. After
//! `max_attempts` consecutive failures it reports
//! [`TransportEvent::Unavailable`] and exits.

use std::time::Duration;

use blocklearn_shared::protocol::{self, ClientEvent, ServerEvent};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, ReconnectPolicy};
use crate::error::TransportError;

const OUTBOUND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected,
    /// Gave up after this many consecutive failed attempts.
    Unavailable { attempts: u32 },
    Message(ServerEvent),
}

/// Sending side of the transport, owned by the engine.
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::Sender<ClientEvent>,
    shutdown: watch::Sender<bool>,
}

impl TransportHandle {
    /// Queue a frame. Never waits for the socket.
    pub fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::SendFailed("outbound queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Close the socket after flushing queued frames.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }

    /// In-process transport: frames emitted through the handle come out of
    /// [`Loopback::sent`], events pushed into [`Loopback::inject`] reach the
    /// engine.
    pub fn loopback() -> (Self, mpsc::Receiver<TransportEvent>, Loopback) {
        let (outbound, sent) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inject, events) = mpsc::channel(EVENT_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        (
            Self { outbound, shutdown },
            events,
            Loopback {
                sent,
                inject,
                shutdown: shutdown_rx,
            },
        )
    }
}

pub struct Loopback {
    pub sent: mpsc::Receiver<ClientEvent>,
    pub inject: mpsc::Sender<TransportEvent>,
    pub shutdown: watch::Receiver<bool>,
}

pub struct SignalingTransport;

impl SignalingTransport {
    /// Validate the relay URL and spawn the connection task. `join` is sent
    /// as the first frame of every connection until replaced by a later
    /// `join-room` or cleared by a `leave-room`.
    pub fn connect(
        config: &EngineConfig,
        join: ClientEvent,
    ) -> Result<(TransportHandle, mpsc::Receiver<TransportEvent>), TransportError> {
        let url = config.signaling_url.as_str();
        let parsed = url::Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(format!(
                "expected ws:// or wss://, got {url}"
            )));
        }

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(run(
            parsed.to_string(),
            config.reconnect.clone(),
            Some(join),
            outbound_rx,
            shutdown_rx,
            events_tx,
        ));

        Ok((TransportHandle { outbound, shutdown }, events_rx))
    }
}

enum SessionEnd {
    Shutdown,
    Lost,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run(
    url: String,
    policy: ReconnectPolicy,
    mut join: Option<ClientEvent>,
    mut outbound: mpsc::Receiver<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        info!(%url, attempt, "connecting to signaling relay");
        let connected = tokio::select! {
            res = connect_async(url.as_str()) => res,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok((ws, _)) => {
                attempt = 0;
                if events.send(TransportEvent::Connected).await.is_err() {
                    break;
                }

                let end = pump(ws, &mut join, &mut outbound, &mut shutdown, &events).await;
                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost => {
                        info!("signaling connection lost");
                        if events.send(TransportEvent::Disconnected).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(%url, error = %e, "signaling connect failed"),
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            error!(attempts = policy.max_attempts, "signaling relay unavailable");
            let _ = events
                .send(TransportEvent::Unavailable {
                    attempts: policy.max_attempts,
                })
                .await;
            break;
        }

        let delay = backoff(attempt, &policy, &mut rand::thread_rng());
        if events
            .send(TransportEvent::Reconnecting { attempt, delay })
            .await
            .is_err()
        {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!("signaling task exited");
}

/// Drive one connection until it drops or we are told to stop.
async fn pump(
    ws: WsStream,
    join: &mut Option<ClientEvent>,
    outbound: &mut mpsc::Receiver<ClientEvent>,
    shutdown: &mut watch::Receiver<bool>,
    events: &mpsc::Sender<TransportEvent>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    if let Some(join) = join.as_ref() {
        match protocol::encode(join) {
            Ok(text) => {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!(error = %e, "failed to send join");
                    return SessionEnd::Lost;
                }
            }
            Err(e) => error!(error = %e, "failed to encode join"),
        }
    }

    loop {
        tokio::select! {
            biased;

            msg = outbound.recv() => {
                let Some(event) = msg else {
                    return SessionEnd::Shutdown;
                };
                match &event {
                    ClientEvent::JoinRoom { .. } => *join = Some(event.clone()),
                    ClientEvent::LeaveRoom { .. } => *join = None,
                    _ => {}
                }
                let text = match protocol::encode(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!(error = %e, "signaling write failed");
                    return SessionEnd::Lost;
                }
            }

            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match protocol::decode::<ServerEvent>(&text) {
                    Ok(event) => {
                        if events.send(TransportEvent::Message(event)).await.is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "relay closed the connection");
                    return SessionEnd::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "signaling read failed");
                    return SessionEnd::Lost;
                }
                None => return SessionEnd::Lost,
            },
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): exponential from
/// `base_delay_ms`, capped at `max_delay_ms`, with +/-`jitter` spread.
pub fn backoff(attempt: u32, policy: &ReconnectPolicy, rng: &mut impl Rng) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = policy
        .base_delay_ms
        .saturating_mul(1u64 << exp)
        .min(policy.max_delay_ms);

    let jitter = policy.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        rng.gen_range(1.0 - jitter..=1.0 + jitter)
    } else {
        1.0
    };
    let ms = ((raw as f64) * factor).round() as u64;
    Duration::from_millis(ms.min(policy.max_delay_ms))
}
