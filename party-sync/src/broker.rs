//! In-process relay broker for local development and the integration
//! tests.
//!
//! Speaks the same STOMP subset as the channel: one fan-out group per
//! party, every subscriber gets every event, the publisher included.
//! Before fanning out, an inbound event is normalized the way the real
//! room backend does it: the party id from the destination overrides the
//! body, a missing timestamp is stamped, and events on the chat
//! destination are forced to `CHAT`.
//!
//! The broker keeps no history and replays nothing. It is not the room
//! management API and emits no membership events of its own.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::protocol::{EventTimestamp, PartyEvent, PartyEventType, ProtocolError};
use crate::stomp::{Command, Frame};

const FANOUT_CAPACITY: usize = 128;

#[derive(Debug)]
pub enum BrokerError {
    Io(std::io::Error),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Broker I/O error: {e}"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// One broadcast group per party, created on first subscribe and dropped
/// when the last subscriber leaves.
#[derive(Default)]
struct TopicRegistry {
    groups: HashMap<String, broadcast::Sender<String>>,
}

impl TopicRegistry {
    fn subscribe(&mut self, party_id: &str) -> broadcast::Receiver<String> {
        self.groups
            .entry(party_id.to_string())
            .or_insert_with(|| broadcast::channel(FANOUT_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, party_id: &str, body: String) {
        if let Some(group) = self.groups.get(party_id) {
            // Send only fails with no subscribers, which is fine.
            let _ = group.send(body);
        }
    }

    fn drop_if_idle(&mut self, party_id: &str) {
        if let Some(group) = self.groups.get(party_id) {
            if group.receiver_count() == 0 {
                self.groups.remove(party_id);
                log::debug!("Dropped idle party group {party_id}");
            }
        }
    }
}

/// Relay broker handle. The accept loop runs until shutdown or drop.
pub struct PartyBroker {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl PartyBroker {
    pub async fn bind(addr: &str) -> Result<Self, BrokerError> {
        let listener = TcpListener::bind(addr).await.map_err(BrokerError::Io)?;
        let local_addr = listener.local_addr().map_err(BrokerError::Io)?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let registry = Arc::new(Mutex::new(TopicRegistry::default()));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((tcp, peer)) => {
                            log::debug!("Session from {peer}");
                            tokio::spawn(handle_session(tcp, registry.clone()));
                        }
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            log::info!("Broker on {local_addr} stopped");
        });

        log::info!("Broker listening on {local_addr}");
        Ok(Self {
            local_addr,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handshake URL for clients.
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Stop accepting sessions. Idempotent. Live sessions finish on their
    /// own when their peers hang up.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

struct Subscription {
    id: String,
    party_id: String,
    rx: broadcast::Receiver<String>,
}

/// Pending forever while unsubscribed, so the fan-out select arm only
/// fires for an active subscription.
async fn recv_fanout(subscription: &mut Option<Subscription>) -> Result<String, broadcast::error::RecvError> {
    match subscription {
        Some(sub) => sub.rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_session(tcp: TcpStream, registry: Arc<Mutex<TopicRegistry>>) {
    let ws: WebSocketStream<TcpStream> = match accept_async(tcp).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("Websocket handshake failed: {e}");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    let mut subscription: Option<Subscription> = None;

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match handle_frame(text.as_str(), &registry, &mut subscription).await {
                        Ok(Some(reply)) => {
                            if sink.send(Message::text(reply.encode())).await.is_err() {
                                break;
                            }
                            if reply.command == Command::Error {
                                log::warn!(
                                    "Rejected frame: {}",
                                    reply.get("message").unwrap_or("unspecified")
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(()) => break,
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Session error: {e}");
                    break;
                }
            },
            fanned = recv_fanout(&mut subscription) => {
                match fanned {
                    Ok(body) => {
                        if let Some(sub) = &subscription {
                            let topic = crate::protocol::party_topic(&sub.party_id);
                            let frame = Frame::message(&topic, &sub.id, body);
                            if sink.send(Message::text(frame.encode())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Session lagged, {n} events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        subscription = None;
                    }
                }
            }
        }
    }

    if let Some(sub) = subscription.take() {
        drop(sub.rx);
        registry.lock().await.drop_if_idle(&sub.party_id);
    }
}

/// Process one client frame. `Ok(Some(frame))` is a reply to send,
/// `Err(())` means the session should end.
async fn handle_frame(
    raw: &str,
    registry: &Arc<Mutex<TopicRegistry>>,
    subscription: &mut Option<Subscription>,
) -> Result<Option<Frame>, ()> {
    let frame = match Frame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => return Ok(Some(Frame::error(&format!("unparseable frame: {e}")))),
    };
    match frame.command {
        Command::Connect => Ok(Some(Frame::connected())),
        Command::Subscribe => {
            let destination = frame.get("destination").unwrap_or("");
            let Some(party_id) = destination.strip_prefix("/topic/party/") else {
                return Ok(Some(Frame::error(&format!(
                    "cannot subscribe to {destination}"
                ))));
            };
            let rx = registry.lock().await.subscribe(party_id);
            *subscription = Some(Subscription {
                id: frame.get("id").unwrap_or("sub-0").to_string(),
                party_id: party_id.to_string(),
                rx,
            });
            Ok(None)
        }
        Command::Unsubscribe => {
            if let Some(sub) = subscription.take() {
                drop(sub.rx);
                registry.lock().await.drop_if_idle(&sub.party_id);
            }
            Ok(None)
        }
        Command::Send => {
            let destination = frame.get("destination").unwrap_or("").to_string();
            let Some((party_id, kind)) = parse_app_destination(&destination) else {
                return Ok(Some(Frame::error(&format!(
                    "cannot send to {destination}"
                ))));
            };
            match normalize(&frame.body, party_id, kind == "chat") {
                Ok(body) => {
                    registry.lock().await.publish(party_id, body);
                    Ok(None)
                }
                Err(e) => Ok(Some(Frame::error(&format!("bad event: {e}")))),
            }
        }
        Command::Disconnect => Err(()),
        other => Ok(Some(Frame::error(&format!(
            "unexpected {other:?} from client"
        )))),
    }
}

/// `/app/party/{id}/control` or `/app/party/{id}/chat`.
fn parse_app_destination(destination: &str) -> Option<(&str, &str)> {
    let rest = destination.strip_prefix("/app/party/")?;
    let (party_id, kind) = rest.split_once('/')?;
    if party_id.is_empty() || !matches!(kind, "control" | "chat") {
        return None;
    }
    Some((party_id, kind))
}

/// Re-stamp the event the way the room backend does before fan-out.
fn normalize(body: &str, party_id: &str, force_chat: bool) -> Result<String, ProtocolError> {
    let mut event = PartyEvent::decode(body)?;
    event.party_id = party_id.to_string();
    if event.timestamp.is_none() {
        event.timestamp = Some(EventTimestamp::now());
    }
    if force_chat {
        event.event_type = PartyEventType::Chat;
    }
    event.encode()
}
