use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use capture::{backend_for, detect_platform, DesktopShell, SystemAudioCapture};
use media_room::{RoomConnector, RoomOptions, RoomSession};
use shared::{
    domain::{MessageId, UserId},
    protocol::EnvelopeBody,
};
use storage::KeyValueStore;
use tracing::warn;
use url::Url;

pub mod auth;
pub mod call;
pub mod config;
pub mod directory;
pub mod error;
pub mod transport;

pub use auth::{AccountChange, AuthClient, AuthError, CallAuthorizer};
pub use call::{
    CallConfig, CallError, CallEvent, CallManager, CallPhase, CallSnapshot, ScreenShareOutcome,
};
pub use config::{load_settings, ClientSettings};
pub use directory::{Conversation, DirectoryEvent, UserDirectory, UserRecord};
pub use error::ClientError;
pub use transport::{
    PushEvent, PushKind, SessionTransport, TransportConfig, TransportError, TungsteniteConnector,
    WireConnector, WireSocket,
};

/// Single-slot "current error" surface. Any core component may set it to
/// redirect the UI to an error view; last write wins, it is not a queue.
pub trait ErrorSurface: Send + Sync {
    fn report(&self, message: &str, description: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfacedError {
    pub message: String,
    pub description: String,
}

#[derive(Default)]
pub struct LastErrorSlot {
    current: std::sync::Mutex<Option<SurfacedError>>,
}

impl LastErrorSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> Option<SurfacedError> {
        self.current.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.current.lock() {
            *slot = None;
        }
    }
}

impl ErrorSurface for LastErrorSlot {
    fn report(&self, message: &str, description: &str) {
        if let Ok(mut slot) = self.current.lock() {
            *slot = Some(SurfacedError {
                message: message.to_string(),
                description: description.to_string(),
            });
        }
    }
}

/// Stand-in for an absent media room provider; every connect fails.
pub struct MissingRoomConnector;

#[async_trait]
impl RoomConnector for MissingRoomConnector {
    async fn connect(&self, _options: RoomOptions) -> anyhow::Result<Arc<dyn RoomSession>> {
        Err(anyhow!("media room connector is unavailable"))
    }
}

/// Everything the session core needs from its environment. Swap individual
/// collaborators for fakes in tests.
pub struct ClientDependencies {
    pub wire: Arc<dyn WireConnector>,
    pub authorizer: Arc<dyn CallAuthorizer>,
    pub room_connector: Arc<dyn RoomConnector>,
    pub capture: Arc<dyn SystemAudioCapture>,
    pub store: Option<Arc<dyn KeyValueStore>>,
}

/// Top-level assembly of the session layer: one transport, one directory,
/// one call manager, one error slot.
pub struct SessionClient {
    settings: ClientSettings,
    transport: Arc<SessionTransport>,
    auth: Arc<AuthClient>,
    directory: Arc<UserDirectory>,
    calls: Arc<CallManager>,
    errors: Arc<LastErrorSlot>,
}

impl SessionClient {
    /// Production wiring: tokio-tungstenite socket, HTTP authorizer, the
    /// platform's capture backend. The media room connector is injected per
    /// deployment; without one, call connects fail cleanly.
    pub async fn new(settings: ClientSettings) -> Arc<Self> {
        let auth = Arc::new(AuthClient::new(settings.auth_base_url.clone()));
        let dependencies = ClientDependencies {
            wire: Arc::new(TungsteniteConnector),
            authorizer: Arc::clone(&auth) as Arc<dyn CallAuthorizer>,
            room_connector: Arc::new(MissingRoomConnector),
            capture: backend_for(detect_platform(), None),
            store: None,
        };
        Self::with_dependencies(settings, dependencies).await
    }

    pub async fn with_dependencies(
        settings: ClientSettings,
        dependencies: ClientDependencies,
    ) -> Arc<Self> {
        let errors = LastErrorSlot::new();
        let transport = SessionTransport::new(dependencies.wire, settings.transport.clone());
        let directory = UserDirectory::new(Arc::clone(&transport), dependencies.store).await;
        let calls = CallManager::new(
            Arc::clone(&transport),
            dependencies.authorizer,
            dependencies.room_connector,
            dependencies.capture,
            Arc::clone(&errors) as Arc<dyn ErrorSurface>,
            settings.call.clone(),
        );
        let auth = Arc::new(AuthClient::new(settings.auth_base_url.clone()));

        Arc::new(Self {
            settings,
            transport,
            auth,
            directory,
            calls,
            errors,
        })
    }

    /// Desktop-shell-brokered capture backend, for wrapped deployments where
    /// the shell owns audio-source enumeration and permission prompts.
    pub fn capture_backend_with_shell(shell: Arc<dyn DesktopShell>) -> Arc<dyn SystemAudioCapture> {
        backend_for(detect_platform(), Some(shell))
    }

    pub async fn open(&self) -> Result<(), ClientError> {
        self.open_url(&self.settings.ws_url).await
    }

    /// Connects the anonymous endpoint instead of the authenticated one.
    pub async fn open_guest(&self) -> Result<(), ClientError> {
        self.open_url(&self.settings.guest_ws_url).await
    }

    async fn open_url(&self, raw: &str) -> Result<(), ClientError> {
        let url =
            Url::parse(raw).map_err(|err| ClientError::Protocol(format!("bad ws url: {err}")))?;
        self.transport
            .open(url)
            .await
            .map_err(|err| ClientError::Protocol(err.to_string()))
    }

    pub async fn close(&self) {
        self.calls.hangup().await;
        self.transport.close().await;
    }

    /// Resolves the local account by username and binds it to the call
    /// layer so outgoing invites carry the right sender.
    pub async fn sign_in(&self, username: &str) -> Result<UserRecord, ClientError> {
        let payload = self.auth.get_user_by_username(username).await?;
        self.calls.set_local_user(payload.user_id).await;
        Ok(UserRecord::from_payload(payload))
    }

    pub async fn send_message(&self, to: UserId, body: String) -> Result<MessageId, ClientError> {
        match self
            .transport
            .request(EnvelopeBody::SendMessage { to, body })
            .await?
        {
            EnvelopeBody::MessageAck { message_id } => Ok(message_id),
            other => {
                warn!(kind = other.kind_name(), "unexpected send_message response");
                Err(ClientError::Protocol(format!(
                    "unexpected response kind '{}'",
                    other.kind_name()
                )))
            }
        }
    }

    pub fn transport(&self) -> &Arc<SessionTransport> {
        &self.transport
    }

    pub fn directory(&self) -> &Arc<UserDirectory> {
        &self.directory
    }

    pub fn calls(&self) -> &Arc<CallManager> {
        &self.calls
    }

    pub fn auth(&self) -> &Arc<AuthClient> {
        &self.auth
    }

    pub fn current_error(&self) -> Option<SurfacedError> {
        self.errors.current()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
