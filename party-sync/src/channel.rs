//! The realtime channel: one duplex broker connection per party view.
//!
//! `PartyChannel` dials the broker, performs the STOMP handshake,
//! subscribes to the party topic and then relays traffic both ways. A
//! dropped connection is redialed after a fixed delay until the channel
//! is disconnected; the dispatcher sees the outage only as a
//! `Disconnected`/`Reconnected` pair in the event stream.
//!
//! Delivery is at-most-once. Publishing while the connection is down
//! drops the action, and nothing is replayed after a reconnect; accurate
//! state is re-established by a sync request, not by the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{
    chat_destination, control_destination, party_topic, PartyAction, PartyEvent, UserIdentity,
};
use crate::stomp::{Command, Frame};

const SUBSCRIPTION_ID: &str = "sub-0";

/// Fixed redial delay after a dropped connection.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// What the dispatcher sees from the channel.
///
/// `Reconnected` is distinct from the first `Connected` so a guest can
/// re-converge after an outage. `Event` carries every event on the party
/// topic, the subscriber's own echoes included.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Reconnected,
    Disconnected,
    Event(PartyEvent),
}

/// Connection parameters for one party.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Broker handshake endpoint, e.g. `ws://127.0.0.1:9090/ws`.
    pub broker_url: String,
    pub party_id: String,
    pub identity: UserIdentity,
    pub reconnect_delay: Duration,
}

impl ChannelConfig {
    pub fn new(broker_url: impl Into<String>, party_id: impl Into<String>, identity: UserIdentity) -> Self {
        Self {
            broker_url: broker_url.into(),
            party_id: party_id.into(),
            identity,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Handle to the connection supervisor task.
///
/// Dropping the handle tears the connection down, same as
/// [`disconnect`](Self::disconnect).
pub struct PartyChannel {
    outbound_tx: mpsc::UnboundedSender<PartyAction>,
    event_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    shutdown_tx: mpsc::Sender<()>,
    connected: Arc<AtomicBool>,
}

impl PartyChannel {
    /// Spawn the supervisor and start dialing. Connection progress is
    /// reported on the event stream, not returned from here.
    pub fn connect(config: ChannelConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_loop(
            config,
            event_tx,
            outbound_rx,
            shutdown_rx,
            connected.clone(),
        ));

        Self {
            outbound_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            connected,
        }
    }

    /// The channel event stream. Can only be taken once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.event_rx.take()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Publish a local action on the party topic. Identity and timestamp
    /// are injected; chat routes to the chat destination, everything else
    /// to control. Dropped while disconnected.
    pub fn publish(&self, action: PartyAction) {
        if !self.is_connected() {
            log::debug!("Channel down, dropped outbound {:?}", action.event_type());
            return;
        }
        let _ = self.outbound_tx.send(action);
    }

    /// Stop the supervisor and close the connection. Idempotent.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.try_send(());
    }
}

enum SessionEnd {
    Shutdown,
    Dropped { handshaken: bool },
}

async fn run_loop(
    config: ChannelConfig,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<PartyAction>,
    mut shutdown_rx: mpsc::Receiver<()>,
    connected: Arc<AtomicBool>,
) {
    let mut handshakes: u32 = 0;
    loop {
        let end = run_session(
            &config,
            &event_tx,
            &mut outbound_rx,
            &mut shutdown_rx,
            &connected,
            &mut handshakes,
        )
        .await;
        connected.store(false, Ordering::SeqCst);
        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Dropped { handshaken } => {
                if handshaken {
                    let _ = event_tx.send(ChannelEvent::Disconnected);
                }
                log::info!(
                    "Redialing broker for party {} in {:?}",
                    config.party_id,
                    config.reconnect_delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(config.reconnect_delay) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
        }
    }
    log::info!("Channel for party {} stopped", config.party_id);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run_session(
    config: &ChannelConfig,
    event_tx: &mpsc::UnboundedSender<ChannelEvent>,
    outbound_rx: &mut mpsc::UnboundedReceiver<PartyAction>,
    shutdown_rx: &mut mpsc::Receiver<()>,
    connected: &AtomicBool,
    handshakes: &mut u32,
) -> SessionEnd {
    let ws: WsStream = match connect_async(&config.broker_url).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            log::warn!("Broker dial failed: {e}");
            return SessionEnd::Dropped { handshaken: false };
        }
    };
    let (mut sink, mut stream) = ws.split();

    // STOMP handshake, then the topic subscription.
    let connect_frame = Frame::connect(&config.broker_url).encode();
    if sink.send(Message::text(connect_frame)).await.is_err() {
        return SessionEnd::Dropped { handshaken: false };
    }
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                    Ok(frame) if frame.command == Command::Connected => break,
                    Ok(frame) => {
                        log::warn!("Broker sent {:?} before CONNECTED", frame.command);
                        return SessionEnd::Dropped { handshaken: false };
                    }
                    Err(e) => {
                        log::warn!("Bad handshake frame: {e}");
                        return SessionEnd::Dropped { handshaken: false };
                    }
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Handshake failed: {e}");
                    return SessionEnd::Dropped { handshaken: false };
                }
                None => return SessionEnd::Dropped { handshaken: false },
            },
            _ = shutdown_rx.recv() => return SessionEnd::Shutdown,
        }
    }
    let subscribe = Frame::subscribe(SUBSCRIPTION_ID, &party_topic(&config.party_id)).encode();
    if sink.send(Message::text(subscribe)).await.is_err() {
        return SessionEnd::Dropped { handshaken: false };
    }

    // Anything queued during the outage is stale, not a backlog.
    while outbound_rx.try_recv().is_ok() {}

    connected.store(true, Ordering::SeqCst);
    let lifecycle = if *handshakes == 0 {
        ChannelEvent::Connected
    } else {
        ChannelEvent::Reconnected
    };
    *handshakes += 1;
    let _ = event_tx.send(lifecycle);
    log::info!("Subscribed to party {}", config.party_id);

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_inbound(text.as_str(), event_tx);
                }
                Some(Ok(Message::Close(_))) | None => {
                    return SessionEnd::Dropped { handshaken: true };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Connection error: {e}");
                    return SessionEnd::Dropped { handshaken: true };
                }
            },
            Some(action) = outbound_rx.recv() => {
                let event = PartyEvent::from_action(&config.party_id, &config.identity, &action);
                let body = match event.encode() {
                    Ok(body) => body,
                    Err(e) => {
                        log::warn!("Could not encode outbound event: {e}");
                        continue;
                    }
                };
                let destination = if action.event_type().is_control() {
                    control_destination(&config.party_id)
                } else {
                    chat_destination(&config.party_id)
                };
                let frame = Frame::send(&destination, body).encode();
                if sink.send(Message::text(frame)).await.is_err() {
                    return SessionEnd::Dropped { handshaken: true };
                }
            },
            _ = shutdown_rx.recv() => {
                let _ = sink.send(Message::text(Frame::disconnect().encode())).await;
                let _ = sink.close().await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

fn handle_inbound(raw: &str, event_tx: &mpsc::UnboundedSender<ChannelEvent>) {
    let frame = match Frame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Dropped unparseable frame: {e}");
            return;
        }
    };
    match frame.command {
        Command::Message => match PartyEvent::decode(&frame.body) {
            Ok(event) => {
                let _ = event_tx.send(ChannelEvent::Event(event));
            }
            Err(e) => log::warn!("Dropped undecodable event: {e}"),
        },
        Command::Error => {
            log::warn!(
                "Broker error: {}",
                frame.get("message").unwrap_or("unspecified")
            );
        }
        other => log::debug!("Ignoring {other:?} frame"),
    }
}
