//! Chat relay: free-text messages and system lines over the party channel.
//!
//! Chat rides the same topic as playback control, on its own
//! sub-destination. Inbound `CHAT` events and the membership/teardown
//! notifications are synthesized into displayable [`ChatMessage`]s; the
//! message shape itself never goes on the wire.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{PartyAction, UserIdentity};

/// Display palette. Indexed by a stable hash of the user id so every peer
/// renders a given user in the same color, across reconnects too.
pub const CHAT_COLORS: [&str; 16] = [
    "#FF6B6B", "#4ECDC4", "#FFE66D", "#95E1D3", "#F38181", "#AA96DA", "#FCBAD3", "#A8D8EA",
    "#FFD93D", "#6BCB77", "#4D96FF", "#FF8C42", "#C77DFF", "#52B788", "#06FFA5", "#E0AFA0",
];

/// Color for system lines.
pub const SYSTEM_COLOR: &str = "#85C1E2";

/// Stable palette color for a user id.
///
/// Char-code hash over the decimal id, the same function every client
/// runs, so the mapping is identical on all peers.
pub fn color_for_user(user_id: u64) -> &'static str {
    let mut acc: i64 = 0;
    for b in user_id.to_string().bytes() {
        acc = (b as i64).wrapping_add(acc.wrapping_shl(5).wrapping_sub(acc));
    }
    CHAT_COLORS[(acc.unsigned_abs() % CHAT_COLORS.len() as u64) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    System,
    Text,
}

/// A displayable chat line, client-local only.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: String,
    pub kind: ChatKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub color: &'static str,
}

/// Publishes local chat lines and synthesizes inbound events into
/// [`ChatMessage`]s for the UI. Clones share the same streams.
#[derive(Clone)]
pub struct ChatRelay {
    identity: UserIdentity,
    outbound: mpsc::UnboundedSender<PartyAction>,
    messages: mpsc::UnboundedSender<ChatMessage>,
}

impl ChatRelay {
    pub(crate) fn new(
        identity: UserIdentity,
        outbound: mpsc::UnboundedSender<PartyAction>,
        messages: mpsc::UnboundedSender<ChatMessage>,
    ) -> Self {
        Self {
            identity,
            outbound,
            messages,
        }
    }

    /// Publish a chat line. Blank input is ignored.
    ///
    /// Chat is exempt from echo suppression: it is always a genuine local
    /// origination, never a side effect of applying a remote event.
    pub fn send(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let _ = self.outbound.send(PartyAction::Chat {
            message: text.to_string(),
        });
    }

    /// Inbound `CHAT` event from any peer (our own echo included).
    pub(crate) fn on_chat(&self, sender_id: Option<u64>, sender_name: Option<&str>, message: &str) {
        let color = sender_id.map(color_for_user).unwrap_or(CHAT_COLORS[0]);
        self.push(ChatMessage {
            id: Uuid::new_v4(),
            sender: sender_name.unwrap_or("Someone").to_string(),
            kind: ChatKind::Text,
            content: message.to_string(),
            timestamp: Utc::now(),
            color,
        });
    }

    /// Synthesized system line (membership, teardown).
    pub(crate) fn on_system(&self, content: &str) {
        self.push(ChatMessage {
            id: Uuid::new_v4(),
            sender: "System".to_string(),
            kind: ChatKind::System,
            content: content.to_string(),
            timestamp: Utc::now(),
            color: SYSTEM_COLOR,
        });
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    fn push(&self, message: ChatMessage) {
        let _ = self.messages.send(message);
    }
}
