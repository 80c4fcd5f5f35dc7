//! Voice transport boundary
//!
//! Contracts between the capture/mixing engine and the external voice-call
//! connectivity layer. The Discord implementation lives in `bot`.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifier of one speaker in a voice call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeakerId(pub u64);

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a joinable voice channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRef {
    pub guild_id: u64,
    pub channel_id: u64,
}

/// Events delivered by a connected transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A speaker started transmitting audio
    SpeakingStarted { speaker: SpeakerId },
    /// One compressed audio frame for a speaker
    Frame { speaker: SpeakerId, payload: Vec<u8> },
    /// A speaker left the call; their subscription should wind down
    SpeakerLeft { speaker: SpeakerId },
    /// The whole voice connection was lost
    Disconnected,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to join voice channel: {0}")]
    Join(String),
    #[error("Failed to leave voice channel: {0}")]
    Leave(String),
}

/// External voice connectivity layer
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Join a voice channel. Events for the connection are pushed into
    /// `events` until the returned handle is disconnected.
    async fn connect(
        &self,
        channel: ChannelRef,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// A live voice connection
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Leave the voice channel and stop event delivery
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
