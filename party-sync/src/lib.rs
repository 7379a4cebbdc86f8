//! # party-sync — Watch-party realtime synchronization core
//!
//! Keeps any number of clients watching the same video in lock-step,
//! mediated by a publish/subscribe broker. The core coordinates intent
//! (play, pause, seek, chat) within a tolerance window; it never touches
//! media and never renders UI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  observations  ┌─────────────────┐  actions  ┌──────────────┐
//! │ PlayerAdapter│ ─────────────► │ EventDispatcher │ ────────► │ PartyChannel │
//! │ (any player) │ ◄───────────── │ (reconciler)    │ ◄──────── │ (STOMP/ws)   │
//! └──────────────┘    commands    └───────┬─────────┘   events  └──────┬───────┘
//!                                         │                            │
//!                                 ┌───────┴───────┐            ┌───────┴───────┐
//!                                 │   ChatRelay   │            │  PartyBroker  │
//!                                 │ lines, colors │            │ topic fan-out │
//!                                 └───────────────┘            └───────────────┘
//!
//! ┌────────────────┐     REST      ┌─────────────────────┐
//! │ SessionManager │ ────────────► │ Room management API │
//! │ (one party max)│               │ (external)          │
//! └────────────────┘               └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire events and topic addressing
//! - [`stomp`] — the STOMP 1.2 frame subset used on the wire
//! - [`channel`] — broker connection with automatic reconnection
//! - [`player`] — the playback adapter contract
//! - [`dispatcher`] — reconciliation: echo suppression, drift correction,
//!   host authority
//! - [`chat`] — chat relay with deterministic per-user colors
//! - [`session`] — party lifecycle and the persisted session slot
//! - [`broker`] — in-process relay for development and tests

pub mod broker;
pub mod channel;
pub mod chat;
pub mod dispatcher;
pub mod player;
pub mod protocol;
pub mod session;
pub mod stomp;

// Re-exports for convenience
pub use broker::{BrokerError, PartyBroker};
pub use channel::{ChannelConfig, ChannelEvent, PartyChannel, DEFAULT_RECONNECT_DELAY};
pub use chat::{color_for_user, ChatKind, ChatMessage, ChatRelay, CHAT_COLORS, SYSTEM_COLOR};
pub use dispatcher::{
    DispatcherConfig, EventDispatcher, Notice, LAG_THRESHOLD_SECS,
};
pub use player::{PlayerAdapter, PlayerEvent};
pub use protocol::{
    chat_destination, control_destination, party_topic, EventPayload, EventTimestamp, PartyAction,
    PartyEvent, PartyEventType, ProtocolError, UserIdentity,
};
pub use session::{
    PartyDescriptor, PartyMember, PartyRole, PartySession, RoomApi, SessionError, SessionManager,
    SessionStore,
};
pub use stomp::{Command, Frame, StompError};
