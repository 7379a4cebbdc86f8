//! The reconciler: decides how local player observations and inbound party
//! events turn into effects.
//!
//! Two input streams feed it. Native observations from the bound
//! [`PlayerAdapter`] become outbound broadcasts, unless a suppression token
//! marks them as echoes of commands the dispatcher itself issued. Channel
//! events become player commands, chat lines and notices, filtered by the
//! pre-playback gate, the drift dead-zone and the host authority rule.
//!
//! Events are consumed strictly in delivery order. No reordering buffer,
//! no logical clocks; near-simultaneous control events from different
//! peers resolve as last-delivered-wins, with the dead-zone damping the
//! thrash.

use tokio::sync::mpsc;

use crate::channel::ChannelEvent;
use crate::chat::{ChatMessage, ChatRelay};
use crate::player::{PlayerAdapter, PlayerEvent};
use crate::protocol::{PartyAction, PartyEvent, UserIdentity};
use crate::session::PartyRole;

/// Maximum tolerated playback divergence in seconds. A corrective seek is
/// applied only when the divergence exceeds this, so small drift never
/// causes visible jitter.
pub const LAG_THRESHOLD_SECS: f64 = 2.0;

/// Applying one inbound command arms one token; rapid bursts can arm a
/// few more before the player callbacks drain them. Anything past this is
/// a leak, not a backlog.
const SUPPRESSION_CAP: u8 = 8;

/// User-facing notifications the dispatcher surfaces. `PartyEnded` is
/// terminal: the view should navigate away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    UserJoined { text: String },
    UserLeft { text: String },
    PartyEnded { text: String },
}

/// Per-kind "suppress the next N observations" counters.
///
/// Issuing a command to the player arms a token for that kind; the
/// player's native callback consumes it instead of rebroadcasting. This
/// stays correct when a second inbound command lands before the first
/// callback fires, which a single shared flag does not.
#[derive(Debug, Default)]
struct SuppressionWindow {
    play: u8,
    pause: u8,
    seek: u8,
}

impl SuppressionWindow {
    fn slot(&mut self, event: &PlayerEvent) -> &mut u8 {
        match event {
            PlayerEvent::Play => &mut self.play,
            PlayerEvent::Pause => &mut self.pause,
            PlayerEvent::Seek { .. } => &mut self.seek,
        }
    }

    fn arm(&mut self, event: &PlayerEvent) {
        let slot = self.slot(event);
        *slot = (*slot + 1).min(SUPPRESSION_CAP);
    }

    /// Consume one token for this kind. Returns true when the observation
    /// was an echo and must not be rebroadcast.
    fn consume(&mut self, event: &PlayerEvent) -> bool {
        let slot = self.slot(event);
        if *slot > 0 {
            *slot -= 1;
            true
        } else {
            false
        }
    }
}

/// Static facts about the local member, fixed for one party-view mount.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub party_id: String,
    pub identity: UserIdentity,
    pub role: PartyRole,
    /// Authoritative host id from the room snapshot, when known. A host
    /// answers `SYNC_REQUEST` only if its own id matches; local role
    /// state alone is not trusted.
    pub host_id: Option<u64>,
}

/// The per-party state machine. Owns the playback adapter exclusively for
/// the lifetime of one party-view mount.
pub struct EventDispatcher {
    config: DispatcherConfig,
    player: Box<dyn PlayerAdapter>,
    suppression: SuppressionWindow,
    /// Latched by the first genuine local play observation (the unlock
    /// gesture). Until then outbound `PLAY` and `SEEK` are withheld.
    unlocked: bool,
    /// Set by `PARTY_DELETED`; every later event is dropped.
    terminated: bool,
    chat: ChatRelay,
    outbound_tx: mpsc::UnboundedSender<PartyAction>,
    outbound_rx: Option<mpsc::UnboundedReceiver<PartyAction>>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    notice_rx: Option<mpsc::UnboundedReceiver<Notice>>,
    chat_rx: Option<mpsc::UnboundedReceiver<ChatMessage>>,
}

impl EventDispatcher {
    pub fn new(config: DispatcherConfig, mut player: Box<dyn PlayerAdapter>) -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (observation_tx, observation_rx) = mpsc::unbounded_channel();
        player.bind(observation_tx);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (chat_msg_tx, chat_rx) = mpsc::unbounded_channel();
        let chat = ChatRelay::new(config.identity.clone(), outbound_tx.clone(), chat_msg_tx);

        let dispatcher = Self {
            config,
            player,
            suppression: SuppressionWindow::default(),
            unlocked: false,
            terminated: false,
            chat,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            notice_tx,
            notice_rx: Some(notice_rx),
            chat_rx: Some(chat_rx),
        };
        (dispatcher, observation_rx)
    }

    /// Receiver for outbound actions to pump into the channel. Can only
    /// be taken once.
    pub fn take_outbound_rx(&mut self) -> Option<mpsc::UnboundedReceiver<PartyAction>> {
        self.outbound_rx.take()
    }

    /// Receiver for user-facing notices. Can only be taken once.
    pub fn take_notice_rx(&mut self) -> Option<mpsc::UnboundedReceiver<Notice>> {
        self.notice_rx.take()
    }

    /// Receiver for displayable chat messages. Can only be taken once.
    pub fn take_chat_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ChatMessage>> {
        self.chat_rx.take()
    }

    /// A chat handle for the UI. Clones share the dispatcher's outbound
    /// and message streams.
    pub fn chat_handle(&self) -> ChatRelay {
        self.chat.clone()
    }

    /// True once `PARTY_DELETED` has been processed.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Drive the dispatcher until the channel closes or the party is
    /// deleted.
    pub async fn run(
        mut self,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        mut observations: mpsc::UnboundedReceiver<PlayerEvent>,
    ) {
        loop {
            tokio::select! {
                channel_event = channel_rx.recv() => match channel_event {
                    Some(event) => {
                        self.handle_channel_event(event);
                        if self.terminated {
                            break;
                        }
                    }
                    None => break,
                },
                Some(observation) = observations.recv() => {
                    self.handle_player_event(observation);
                }
            }
        }
        log::info!("Dispatcher for party {} stopped", self.config.party_id);
    }

    /// A native observation from the player: either a genuine user
    /// gesture to broadcast, or the echo of a command we issued.
    pub fn handle_player_event(&mut self, event: PlayerEvent) {
        if self.terminated {
            return;
        }
        if self.suppression.consume(&event) {
            log::debug!("Suppressed echo of {event:?}");
            return;
        }
        match event {
            PlayerEvent::Play => {
                if !self.unlocked {
                    // The unlock gesture. The player could not have been
                    // commanded before it, so only ask where the host is;
                    // broadcasting PLAY here would desynchronize the host.
                    self.unlocked = true;
                    self.publish(PartyAction::SyncRequest);
                } else {
                    self.publish(PartyAction::SyncRequest);
                    self.publish(PartyAction::Play);
                }
            }
            PlayerEvent::Pause => {
                self.publish(PartyAction::Pause);
            }
            PlayerEvent::Seek { time } => {
                // Seeks before first play are initialization artifacts.
                if self.unlocked {
                    self.publish(PartyAction::Seek { time });
                } else {
                    log::debug!("Dropped pre-playback seek to {time}");
                }
            }
        }
    }

    /// A channel-level event: lifecycle transition or inbound party event.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                log::info!("Channel up for party {}", self.config.party_id);
                self.request_sync_if_guest();
            }
            ChannelEvent::Reconnected => {
                log::info!("Channel back up for party {}", self.config.party_id);
                self.request_sync_if_guest();
            }
            ChannelEvent::Disconnected => {
                log::warn!("Channel down for party {}", self.config.party_id);
            }
            ChannelEvent::Event(event) => self.handle_party_event(event),
        }
    }

    /// Guests re-converge on the host position whenever the channel comes
    /// up, unless still pre-playback (the player cannot apply the answer
    /// yet, and the unlock gesture will ask again).
    fn request_sync_if_guest(&mut self) {
        if self.config.role == PartyRole::Guest && !self.player.is_before_play() {
            self.publish(PartyAction::SyncRequest);
        }
    }

    fn handle_party_event(&mut self, event: PartyEvent) {
        if self.terminated {
            log::debug!("Dropped {:?} after party end", event.event_type);
            return;
        }
        if event.party_id != self.config.party_id {
            log::warn!(
                "Dropped event for foreign party {} (expected {})",
                event.party_id,
                self.config.party_id
            );
            return;
        }
        let action = match event.action() {
            Ok(action) => action,
            Err(e) => {
                log::warn!("Dropped malformed {:?} event: {e}", event.event_type);
                return;
            }
        };
        match action {
            PartyAction::Chat { message } => {
                self.chat
                    .on_chat(event.user_id, event.user_name.as_deref(), &message);
            }
            PartyAction::Play => {
                if self.gate_open() {
                    self.suppression.arm(&PlayerEvent::Play);
                    self.player.play();
                }
            }
            PartyAction::Pause => {
                if self.gate_open() {
                    self.suppression.arm(&PlayerEvent::Pause);
                    self.player.pause();
                }
            }
            PartyAction::Seek { time } => {
                if self.gate_open() {
                    let divergence = (self.player.current_time() - time).abs();
                    if divergence > LAG_THRESHOLD_SECS {
                        self.suppression.arm(&PlayerEvent::Seek { time });
                        self.player.seek(time);
                    } else {
                        log::debug!("Within dead-zone ({divergence:.2}s), no corrective seek");
                    }
                }
            }
            PartyAction::SyncRequest => {
                if self.is_authoritative_host() {
                    self.publish(PartyAction::Seek {
                        time: self.player.current_time(),
                    });
                }
            }
            PartyAction::UserJoined { notice } => {
                let text = notice.unwrap_or_else(|| "Someone joined the party".to_string());
                self.chat.on_system(&text);
                let _ = self.notice_tx.send(Notice::UserJoined { text });
            }
            PartyAction::UserLeft { notice } => {
                let text = notice.unwrap_or_else(|| "Someone left the party".to_string());
                self.chat.on_system(&text);
                let _ = self.notice_tx.send(Notice::UserLeft { text });
            }
            PartyAction::PartyDeleted { notice } => {
                let text = notice.unwrap_or_else(|| "The party has ended".to_string());
                log::info!("Party {} deleted", self.config.party_id);
                self.chat.on_system(&text);
                let _ = self.notice_tx.send(Notice::PartyEnded { text });
                self.terminated = true;
            }
        }
    }

    /// Remote playback commands apply only after the local unlock gesture.
    fn gate_open(&mut self) -> bool {
        if self.player.is_before_play() {
            log::debug!("Pre-playback, remote command ignored");
            false
        } else {
            true
        }
    }

    /// Role says host, and the room snapshot (when we have it) agrees.
    fn is_authoritative_host(&self) -> bool {
        self.config.role == PartyRole::Host
            && self
                .config
                .host_id
                .map(|id| id == self.config.identity.user_id)
                .unwrap_or(true)
    }

    fn publish(&self, action: PartyAction) {
        let _ = self.outbound_tx.send(action);
    }
}
