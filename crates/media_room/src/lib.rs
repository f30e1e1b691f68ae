use std::sync::Arc;

use async_trait::async_trait;
use shared::domain::CallId;
use tokio::sync::broadcast;

mod token;

pub use token::{TokenClaims, TokenError, VideoGrant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomOptions {
    pub call_id: CallId,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTrack {
    Microphone,
    Camera,
    ScreenShare,
    ScreenShareAudio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub participant_id: String,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    ParticipantJoined(RemoteParticipant),
    ParticipantLeft { participant_id: String },
    /// A remote participant's screen-share track became available. Whether
    /// its video is actually subscribed is the caller's decision.
    ScreenShareStarted { identity: String },
    ScreenShareStopped { identity: String },
    Disconnected { reason: String },
}

/// Live connection to one media room. Obtained from a [`RoomConnector`];
/// all operations suspend without blocking.
#[async_trait]
pub trait RoomSession: Send + Sync {
    async fn publish_local_track(&self, track: LocalTrack) -> anyhow::Result<()>;
    async fn unpublish_local_track(&self, track: LocalTrack) -> anyhow::Result<()>;
    async fn unpublish_local_tracks(&self) -> anyhow::Result<()>;
    async fn set_microphone_muted(&self, muted: bool) -> anyhow::Result<()>;
    async fn set_playback_deafened(&self, deafened: bool) -> anyhow::Result<()>;
    async fn subscribe_screen_share(&self, identity: &str) -> anyhow::Result<()>;
    async fn unsubscribe_screen_share(&self, identity: &str) -> anyhow::Result<()>;
    async fn leave(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent>;
}

#[async_trait]
pub trait RoomConnector: Send + Sync {
    async fn connect(&self, options: RoomOptions) -> anyhow::Result<Arc<dyn RoomSession>>;
}
