//! The playback adapter seam.
//!
//! The dispatcher drives any concrete player through [`PlayerAdapter`] and
//! never sees the player itself. Commands and observations are split:
//! commands go through the trait methods, native callbacks come back as
//! [`PlayerEvent`]s on the sender handed to [`PlayerAdapter::bind`]. The
//! same gesture class can therefore be told apart by direction, which is
//! what makes echo suppression possible.

use tokio::sync::mpsc;

/// Native observations a player reports: user gestures, or the side
/// effects of commands the dispatcher itself issued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerEvent {
    Play,
    Pause,
    Seek { time: f64 },
}

/// Capability surface for a concrete embeddable player.
pub trait PlayerAdapter: Send {
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, time: f64);

    /// Current playback position in seconds.
    fn current_time(&self) -> f64;

    /// True until the very first user-initiated play. While true, remote
    /// commands must not be applied (autoplay policies require a real
    /// gesture before the player can be commanded).
    fn is_before_play(&self) -> bool;

    /// Called once at initialization. The adapter forwards its native
    /// play/pause/seek callbacks into `observations`.
    fn bind(&mut self, observations: mpsc::UnboundedSender<PlayerEvent>);
}
