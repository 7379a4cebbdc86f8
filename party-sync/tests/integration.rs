//! Integration tests for end-to-end watch-party synchronization.
//!
//! These tests start a real in-process broker and connect real channels,
//! verifying the full pipeline from player observation to remote effect.

use party_sync::broker::PartyBroker;
use party_sync::channel::{ChannelConfig, ChannelEvent, PartyChannel};
use party_sync::dispatcher::{DispatcherConfig, EventDispatcher, Notice};
use party_sync::player::{PlayerAdapter, PlayerEvent};
use party_sync::protocol::{PartyAction, PartyEvent, PartyEventType, UserIdentity};
use party_sync::session::{PartyRole, RoomApi, SessionManager, SessionStore};
use party_sync::stomp::{Command, Frame};

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

#[derive(Debug, Default)]
struct Probe {
    plays: u32,
    pauses: u32,
    seeks: Vec<f64>,
    time: f64,
    before_play: bool,
}

struct MockPlayer(Arc<Mutex<Probe>>);

impl PlayerAdapter for MockPlayer {
    fn play(&mut self) {
        self.0.lock().unwrap().plays += 1;
    }
    fn pause(&mut self) {
        self.0.lock().unwrap().pauses += 1;
    }
    fn seek(&mut self, time: f64) {
        self.0.lock().unwrap().seeks.push(time);
    }
    fn current_time(&self) -> f64 {
        self.0.lock().unwrap().time
    }
    fn is_before_play(&self) -> bool {
        self.0.lock().unwrap().before_play
    }
    fn bind(&mut self, _observations: mpsc::UnboundedSender<PlayerEvent>) {}
}

/// One participant: dispatcher wired to a channel on the broker, driven
/// step by step from the test body.
struct Member {
    dispatcher: EventDispatcher,
    probe: Arc<Mutex<Probe>>,
    channel: PartyChannel,
    channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<PartyAction>,
    notices: mpsc::UnboundedReceiver<Notice>,
}

impl Member {
    async fn connect(
        broker: &PartyBroker,
        party_id: &str,
        identity: UserIdentity,
        role: PartyRole,
        host_id: u64,
    ) -> Member {
        let probe = Arc::new(Mutex::new(Probe::default()));
        let config = DispatcherConfig {
            party_id: party_id.to_string(),
            identity: identity.clone(),
            role,
            host_id: Some(host_id),
        };
        let (mut dispatcher, _observations) =
            EventDispatcher::new(config, Box::new(MockPlayer(probe.clone())));
        let outbound = dispatcher.take_outbound_rx().unwrap();
        let notices = dispatcher.take_notice_rx().unwrap();

        let mut channel =
            PartyChannel::connect(ChannelConfig::new(broker.url(), party_id, identity));
        let mut channel_rx = channel.take_event_rx().unwrap();

        // Wait for the subscription before anything is published.
        match timeout(Duration::from_secs(2), channel_rx.recv()).await {
            Ok(Some(ChannelEvent::Connected)) => {}
            other => panic!("Expected Connected, got {other:?}"),
        }

        Member {
            dispatcher,
            probe,
            channel,
            channel_rx,
            outbound,
            notices,
        }
    }

    /// Push everything the dispatcher wants to say onto the wire.
    fn flush_outbound(&mut self) {
        while let Ok(action) = self.outbound.try_recv() {
            self.channel.publish(action);
        }
    }

    /// Next party event off the wire, lifecycle transitions skipped.
    async fn next_event(&mut self) -> PartyEvent {
        loop {
            match timeout(Duration::from_secs(2), self.channel_rx.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("channel stream closed")
            {
                ChannelEvent::Event(event) => return event,
                _ => continue,
            }
        }
    }

    /// Receive one event and run it through the dispatcher.
    async fn reconcile_next(&mut self) -> PartyEvent {
        let event = self.next_event().await;
        self.dispatcher
            .handle_channel_event(ChannelEvent::Event(event.clone()));
        self.flush_outbound();
        event
    }
}

/// One-shot HTTP stub answering every request with the given JSON body.
async fn serve_json(body: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let mut head = Vec::new();
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            head.extend_from_slice(&buf[..n]);
            if n == 0 || head.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let resp = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(resp.as_bytes()).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_broker_accepts_connections() {
    let broker = PartyBroker::bind("127.0.0.1:0").await.unwrap();
    let result = tokio_tungstenite::connect_async(broker.url()).await;
    assert!(result.is_ok(), "Should connect to broker");
    broker.shutdown();
}

#[tokio::test]
async fn test_channel_connects_and_subscribes() {
    let broker = PartyBroker::bind("127.0.0.1:0").await.unwrap();
    let mut channel = PartyChannel::connect(ChannelConfig::new(
        broker.url(),
        "P1",
        UserIdentity::new(1, "Alice"),
    ));
    let mut events = channel.take_event_rx().unwrap();

    let event = timeout(Duration::from_secs(2), events.recv()).await;
    assert_eq!(event.unwrap(), Some(ChannelEvent::Connected));
    assert!(channel.is_connected());

    channel.disconnect();
    broker.shutdown();
}

#[tokio::test]
async fn test_publish_fans_out_to_all_members() {
    let broker = PartyBroker::bind("127.0.0.1:0").await.unwrap();
    let host_id = UserIdentity::new(1, "Alice");
    let mut host = Member::connect(&broker, "P1", host_id.clone(), PartyRole::Host, 1).await;
    let mut guest =
        Member::connect(&broker, "P1", UserIdentity::new(2, "Bob"), PartyRole::Guest, 1).await;

    host.channel.publish(PartyAction::Pause);

    // The publisher hears its own echo too.
    let seen = host.next_event().await;
    assert_eq!(seen.event_type, PartyEventType::Pause);
    assert_eq!(seen.user_id, Some(1));
    assert_eq!(seen.user_name.as_deref(), Some("Alice"));
    assert!(seen.timestamp.is_some());

    let seen = guest.next_event().await;
    assert_eq!(seen.event_type, PartyEventType::Pause);
    assert_eq!(seen.party_id, "P1");

    broker.shutdown();
}

#[tokio::test]
async fn test_chat_roundtrip_between_members() {
    let broker = PartyBroker::bind("127.0.0.1:0").await.unwrap();
    let mut host =
        Member::connect(&broker, "P1", UserIdentity::new(1, "Alice"), PartyRole::Host, 1).await;
    let mut guest =
        Member::connect(&broker, "P1", UserIdentity::new(2, "Bob"), PartyRole::Guest, 1).await;
    let mut guest_chat = guest.dispatcher.take_chat_rx().unwrap();

    host.dispatcher.chat_handle().send("ready when you are");
    host.flush_outbound();

    let event = guest.reconcile_next().await;
    assert_eq!(event.event_type, PartyEventType::Chat);

    let line = guest_chat.try_recv().unwrap();
    assert_eq!(line.sender, "Alice");
    assert_eq!(line.content, "ready when you are");

    broker.shutdown();
}

/// The full scenario: create, join, play, seek, end.
#[tokio::test]
async fn test_watch_party_end_to_end() {
    // Host creates the party for movie M1.
    let create_url = serve_json(
        r#"{"partyId":"P1","movieId":"M1","hostId":1,"status":"ACTIVE","createdAt":"2026-08-24T10:00:00"}"#
            .to_string(),
    )
    .await;
    let host_dir = tempfile::tempdir().unwrap();
    let mut host_mgr =
        SessionManager::new(SessionStore::new(host_dir.path()), RoomApi::new(create_url));
    host_mgr.resolve_identity(UserIdentity::new(1, "Alice"));
    let room = host_mgr.create_party("M1").await.unwrap();
    assert_eq!(room.party_id, "P1");
    assert_eq!(host_mgr.session().unwrap().role, PartyRole::Host);

    // Guest joins it.
    let join_url = serve_json(
        r#"{"partyId":"P1","movieId":"M1","hostId":1,"status":"ACTIVE","members":[{"userId":1},{"userId":2}]}"#
            .to_string(),
    )
    .await;
    let guest_dir = tempfile::tempdir().unwrap();
    let mut guest_mgr =
        SessionManager::new(SessionStore::new(guest_dir.path()), RoomApi::new(join_url));
    guest_mgr.resolve_identity(UserIdentity::new(2, "Bob"));
    guest_mgr.join_party("P1").await.unwrap();
    assert_eq!(guest_mgr.session().unwrap().role, PartyRole::Guest);

    // Both come online.
    let broker = PartyBroker::bind("127.0.0.1:0").await.unwrap();
    let mut host =
        Member::connect(&broker, "P1", UserIdentity::new(1, "Alice"), PartyRole::Host, 1).await;
    let mut guest =
        Member::connect(&broker, "P1", UserIdentity::new(2, "Bob"), PartyRole::Guest, 1).await;

    // Host's first play is the unlock gesture: sync request only.
    host.dispatcher.handle_player_event(PlayerEvent::Play);
    host.flush_outbound();
    assert_eq!(host.reconcile_next().await.event_type, PartyEventType::SyncRequest);
    // Answering its own request, the host broadcasts its position.
    assert_eq!(guest.reconcile_next().await.event_type, PartyEventType::SyncRequest);
    assert_eq!(host.reconcile_next().await.event_type, PartyEventType::Seek);
    assert_eq!(guest.reconcile_next().await.event_type, PartyEventType::Seek);
    // Host at t=0, guest at t=0: inside the dead-zone, nobody seeks.
    assert!(guest.probe.lock().unwrap().seeks.is_empty());

    // Host presses play again: sync request, then PLAY. The host's seek
    // answer to its own request lands after both.
    host.dispatcher.handle_player_event(PlayerEvent::Play);
    host.flush_outbound();
    assert_eq!(host.reconcile_next().await.event_type, PartyEventType::SyncRequest);
    // Guest is not the host, so the request produces no guest outbound.
    assert_eq!(guest.reconcile_next().await.event_type, PartyEventType::SyncRequest);
    assert_eq!(host.reconcile_next().await.event_type, PartyEventType::Play);
    assert_eq!(guest.reconcile_next().await.event_type, PartyEventType::Play);
    assert_eq!(guest.probe.lock().unwrap().plays, 1, "guest player starts");
    assert_eq!(host.reconcile_next().await.event_type, PartyEventType::Seek);
    assert_eq!(guest.reconcile_next().await.event_type, PartyEventType::Seek);

    // Host seeks to t=120 while the guest sits at t=5.
    host.probe.lock().unwrap().time = 120.0;
    guest.probe.lock().unwrap().time = 5.0;
    host.dispatcher.handle_player_event(PlayerEvent::Seek { time: 120.0 });
    host.flush_outbound();
    let event = host.reconcile_next().await;
    assert_eq!(event.event_type, PartyEventType::Seek);
    assert_eq!(guest.reconcile_next().await.event_type, PartyEventType::Seek);
    assert_eq!(guest.probe.lock().unwrap().seeks, vec![120.0]);
    // The host's own echo was within the dead-zone.
    assert!(host.probe.lock().unwrap().seeks.is_empty());

    // Host ends the party. The API is down, the session clears anyway.
    assert!(host_mgr.leave_or_end_party().await.is_err());
    assert!(host_mgr.session().is_none());

    // The backend's teardown notification reaches the guest.
    host.channel.publish(PartyAction::PartyDeleted {
        notice: Some("The party has ended".to_string()),
    });
    assert_eq!(
        guest.reconcile_next().await.event_type,
        PartyEventType::PartyDeleted
    );
    assert!(guest.dispatcher.is_terminated());
    assert_eq!(
        guest.notices.try_recv().unwrap(),
        Notice::PartyEnded {
            text: "The party has ended".to_string()
        }
    );
    guest_mgr.clear_session();
    assert!(guest_mgr.session().is_none());

    broker.shutdown();
}

/// A broker that speaks one full session, hangs up, then accepts again.
async fn flaky_broker() -> String {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for session in 0..2u32 {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let frame = Frame::decode(text.as_str()).unwrap();
                    match frame.command {
                        Command::Connect => {
                            ws.send(Message::text(Frame::connected().encode())).await.unwrap();
                        }
                        Command::Subscribe if session == 0 => {
                            // First session dies right after the subscription.
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
        // Keep the second session open until the test ends.
        std::future::pending::<()>().await;
    });
    format!("ws://{addr}")
}

#[tokio::test]
async fn test_reconnect_is_reported_distinctly() {
    let url = flaky_broker().await;
    let mut config = ChannelConfig::new(url, "P1", UserIdentity::new(2, "Bob"));
    config.reconnect_delay = Duration::from_millis(50);
    let mut channel = PartyChannel::connect(config);
    let mut events = channel.take_event_rx().unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            ChannelEvent::Connected,
            ChannelEvent::Disconnected,
            ChannelEvent::Reconnected,
        ]
    );
    channel.disconnect();
}

#[tokio::test]
async fn test_guest_resyncs_after_reconnect() {
    let probe = Arc::new(Mutex::new(Probe::default()));
    let config = DispatcherConfig {
        party_id: "P1".to_string(),
        identity: UserIdentity::new(2, "Bob"),
        role: PartyRole::Guest,
        host_id: Some(1),
    };
    let (mut dispatcher, _observations) =
        EventDispatcher::new(config, Box::new(MockPlayer(probe)));
    let mut outbound = dispatcher.take_outbound_rx().unwrap();

    dispatcher.handle_channel_event(ChannelEvent::Disconnected);
    assert!(outbound.try_recv().is_err());

    dispatcher.handle_channel_event(ChannelEvent::Reconnected);
    assert_eq!(outbound.try_recv().unwrap(), PartyAction::SyncRequest);
}

#[tokio::test]
async fn test_publish_while_disconnected_is_lost() {
    let broker = PartyBroker::bind("127.0.0.1:0").await.unwrap();
    let mut silent = Member::connect(
        &broker,
        "P1",
        UserIdentity::new(3, "Carol"),
        PartyRole::Guest,
        1,
    )
    .await;
    let mut witness =
        Member::connect(&broker, "P1", UserIdentity::new(2, "Bob"), PartyRole::Guest, 1).await;

    silent.channel.disconnect();
    // Let the teardown land before publishing into the void.
    tokio::time::sleep(Duration::from_millis(50)).await;
    silent.channel.publish(PartyAction::Play);

    // Nothing arrives; a later publish from the witness proves the topic
    // is still live and ordered.
    witness.channel.publish(PartyAction::Pause);
    let event = witness.next_event().await;
    assert_eq!(event.event_type, PartyEventType::Pause);
    assert_eq!(event.user_id, Some(2));

    broker.shutdown();
}
