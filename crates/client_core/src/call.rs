//! Call signaling state machine.
//!
//! Turns a call identifier into a live media session: token exchange over
//! HTTP, invite over the session transport, room connection through the
//! media-room provider. At most one session is active at a time; the slot is
//! explicit and transition functions reject loudly instead of relying on
//! caller discipline.

use std::{collections::HashSet, sync::Arc, time::Duration};

use capture::{CaptureConstraints, SystemAudioCapture, SystemAudioStream};
use chrono::Utc;
use media_room::{
    LocalTrack, RemoteParticipant, RoomConnector, RoomEvent, RoomOptions, RoomSession, TokenClaims,
};
use shared::{
    domain::{CallId, UserId},
    protocol::EnvelopeBody,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthError, CallAuthorizer},
    transport::SessionTransport,
    ErrorSurface,
};

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// The room provider enforces no useful bound of its own, so connect
    /// attempts carry an explicit deadline before routing to `Failed`.
    pub connect_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Authoritative connection phase of the (single) call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    RequestingToken,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call session is already active")]
    SessionActive,
    #[error("not connected to a call")]
    NotConnected,
    #[error("call token request failed: {0}")]
    TokenRequest(#[from] AuthError),
    #[error("call token is expired")]
    TokenExpired,
    #[error("failed to connect media room: {0}")]
    Connect(String),
    #[error("media room connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("failed to subscribe screen share of '{identity}': {message}")]
    Subscribe { identity: String, message: String },
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    ParticipantsUpdated {
        call_id: CallId,
        participants: Vec<RemoteParticipant>,
    },
    /// A remote participant started or stopped sharing. Availability is
    /// always visible; video is only subscribed for watched participants.
    ScreenShareAvailability {
        identity: String,
        available: bool,
    },
    /// Transient, non-fatal user-facing notice (toast).
    Notice(String),
    Ended {
        call_id: CallId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenShareOutcome {
    pub audio_captured: bool,
}

/// Point-in-time view of the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub watching: HashSet<String>,
    pub dont_send_invite: bool,
}

struct ActiveCall {
    call_id: CallId,
    is_muted: bool,
    is_deafened: bool,
    watching: HashSet<String>,
    dont_send_invite: bool,
    room: Arc<dyn RoomSession>,
    event_task: JoinHandle<()>,
    participants: Vec<RemoteParticipant>,
    share_audio: Option<SystemAudioStream>,
}

struct CallState {
    phase: CallPhase,
    session: Option<ActiveCall>,
    dont_send_invite: bool,
}

pub struct CallManager {
    transport: Arc<SessionTransport>,
    authorizer: Arc<dyn CallAuthorizer>,
    connector: Arc<dyn RoomConnector>,
    capture: Arc<dyn SystemAudioCapture>,
    errors: Arc<dyn ErrorSurface>,
    config: CallConfig,
    local_user: Mutex<Option<UserId>>,
    state: Mutex<CallState>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManager {
    pub fn new(
        transport: Arc<SessionTransport>,
        authorizer: Arc<dyn CallAuthorizer>,
        connector: Arc<dyn RoomConnector>,
        capture: Arc<dyn SystemAudioCapture>,
        errors: Arc<dyn ErrorSurface>,
        config: CallConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            transport,
            authorizer,
            connector,
            capture,
            errors,
            config,
            local_user: Mutex::new(None),
            state: Mutex::new(CallState {
                phase: CallPhase::Idle,
                session: None,
                dont_send_invite: false,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn set_local_user(&self, user_id: UserId) {
        *self.local_user.lock().await = Some(user_id);
    }

    pub async fn phase(&self) -> CallPhase {
        self.state.lock().await.phase
    }

    pub async fn current_call(&self) -> Option<CallSnapshot> {
        let state = self.state.lock().await;
        state.session.as_ref().map(|session| CallSnapshot {
            call_id: session.call_id.clone(),
            is_muted: session.is_muted,
            is_deafened: session.is_deafened,
            watching: session.watching.clone(),
            dont_send_invite: session.dont_send_invite,
        })
    }

    /// Arms invite suppression for the next `connect`. Used when joining a
    /// call this client did not originate.
    pub async fn set_dont_send_invite(&self, dont_send_invite: bool) {
        self.state.lock().await.dont_send_invite = dont_send_invite;
    }

    /// Fetches an authorization token bound to `call_id` from the HTTP
    /// endpoint. The session slot stays free until `connect`; failure routes
    /// to `Failed` and surfaces immediately (call setup is never retried
    /// behind the user's back).
    pub async fn get_call_token(&self, call_id: &CallId) -> Result<String, CallError> {
        {
            let mut state = self.state.lock().await;
            if state.session.is_some() {
                return Err(CallError::SessionActive);
            }
            state.phase = CallPhase::RequestingToken;
        }
        self.emit_phase(CallPhase::RequestingToken);

        match self.authorizer.issue_call_token(call_id).await {
            Ok(token) => Ok(token),
            Err(err) => {
                self.fail(format!("Could not start call {call_id}"), err.to_string())
                    .await;
                Err(CallError::TokenRequest(err))
            }
        }
    }

    /// Connects the media room. Emits one invite envelope addressed to
    /// `invitee` before the connect attempt, unless suppression was armed.
    pub async fn connect(
        self: &Arc<Self>,
        token: String,
        call_id: CallId,
        invitee: Option<UserId>,
    ) -> Result<(), CallError> {
        let dont_send_invite = {
            let mut state = self.state.lock().await;
            if state.session.is_some() || state.phase == CallPhase::Connecting {
                return Err(CallError::SessionActive);
            }
            state.phase = CallPhase::Connecting;
            std::mem::take(&mut state.dont_send_invite)
        };
        self.emit_phase(CallPhase::Connecting);

        if let Ok(claims) = TokenClaims::decode(&token) {
            if claims.is_expired_at(Utc::now()) {
                self.fail(
                    format!("Could not join call {call_id}"),
                    "call token is expired".into(),
                )
                .await;
                return Err(CallError::TokenExpired);
            }
        } else {
            debug!(call_id = %call_id, "call token is not a JWT; skipping claims check");
        }

        if !dont_send_invite {
            if let Some(to) = invitee {
                match *self.local_user.lock().await {
                    Some(from) => {
                        if let Err(err) = self.transport.send(EnvelopeBody::CallInvite {
                            call_id: call_id.clone(),
                            from,
                            to,
                        }) {
                            warn!(call_id = %call_id, "failed to queue call invite: {err}");
                        }
                    }
                    None => warn!(
                        call_id = %call_id,
                        "no local user set; skipping call invite"
                    ),
                }
            }
        }

        let connect = self.connector.connect(RoomOptions {
            call_id: call_id.clone(),
            token,
        });
        let room = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(room)) => room,
            Ok(Err(err)) => {
                self.fail(
                    format!("Could not join call {call_id}"),
                    err.to_string(),
                )
                .await;
                return Err(CallError::Connect(err.to_string()));
            }
            Err(_elapsed) => {
                self.fail(
                    format!("Could not join call {call_id}"),
                    format!(
                        "media room did not answer within {:?}",
                        self.config.connect_timeout
                    ),
                )
                .await;
                return Err(CallError::ConnectTimeout(self.config.connect_timeout));
            }
        };

        let event_task = self.spawn_room_event_task(call_id.clone(), Arc::clone(&room));

        {
            let mut state = self.state.lock().await;
            state.phase = CallPhase::Connected;
            // Fresh session: flags back to defaults, nobody watched yet.
            state.session = Some(ActiveCall {
                call_id: call_id.clone(),
                is_muted: false,
                is_deafened: false,
                watching: HashSet::new(),
                dont_send_invite,
                room,
                event_task,
                participants: Vec::new(),
                share_audio: None,
            });
        }
        self.emit_phase(CallPhase::Connected);
        info!(call_id = %call_id, "call connected");
        Ok(())
    }

    /// Tears the session down from any state and returns to `Idle`.
    pub async fn hangup(&self) {
        let session = {
            let mut state = self.state.lock().await;
            state.phase = CallPhase::Disconnecting;
            state.session.take()
        };
        self.emit_phase(CallPhase::Disconnecting);

        if let Some(mut session) = session {
            if let Some(mut share_audio) = session.share_audio.take() {
                share_audio.stop();
            }
            if let Err(err) = session.room.unpublish_local_tracks().await {
                warn!(call_id = %session.call_id, "failed to unpublish tracks: {err}");
            }
            if let Err(err) = session.room.leave().await {
                warn!(call_id = %session.call_id, "failed to leave room: {err}");
            }
            session.event_task.abort();
            let _ = self.events.send(CallEvent::Ended {
                call_id: session.call_id,
            });
        }

        self.state.lock().await.phase = CallPhase::Idle;
        self.emit_phase(CallPhase::Idle);
    }

    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let (room, muted) = {
            let mut state = self.state.lock().await;
            let session = Self::connected_session(&mut state)?;
            session.is_muted = !session.is_muted;
            (Arc::clone(&session.room), session.is_muted)
        };
        if let Err(err) = room.set_microphone_muted(muted).await {
            warn!("failed to apply mute to local track: {err}");
        }
        Ok(muted)
    }

    pub async fn toggle_deafen(&self) -> Result<bool, CallError> {
        let (room, deafened) = {
            let mut state = self.state.lock().await;
            let session = Self::connected_session(&mut state)?;
            session.is_deafened = !session.is_deafened;
            (Arc::clone(&session.room), session.is_deafened)
        };
        if let Err(err) = room.set_playback_deafened(deafened).await {
            warn!("failed to apply deafen to playback: {err}");
        }
        Ok(deafened)
    }

    pub async fn is_muted(&self) -> bool {
        let state = self.state.lock().await;
        state
            .session
            .as_ref()
            .is_some_and(|session| session.is_muted)
    }

    pub async fn is_deafened(&self) -> bool {
        let state = self.state.lock().await;
        state
            .session
            .as_ref()
            .is_some_and(|session| session.is_deafened)
    }

    pub async fn watching(&self) -> HashSet<String> {
        let state = self.state.lock().await;
        state
            .session
            .as_ref()
            .map(|session| session.watching.clone())
            .unwrap_or_default()
    }

    /// Subscribes to `identity`'s screen-share video. Watch state bounds
    /// bandwidth: availability is visible for everyone, video only flows for
    /// participants the user selected.
    pub async fn start_watching(self: &Arc<Self>, identity: &str) -> Result<(), CallError> {
        let (call_id, room) = {
            let mut state = self.state.lock().await;
            let session = Self::connected_session(&mut state)?;
            if !session.watching.insert(identity.to_string()) {
                return Ok(());
            }
            (session.call_id.clone(), Arc::clone(&session.room))
        };

        if let Err(err) = room.subscribe_screen_share(identity).await {
            let mut state = self.state.lock().await;
            if let Some(session) = state.session.as_mut() {
                if session.call_id == call_id {
                    session.watching.remove(identity);
                }
            }
            return Err(CallError::Subscribe {
                identity: identity.to_string(),
                message: err.to_string(),
            });
        }

        // The call may have ended while the subscribe was in flight; its
        // room is gone, nothing to undo.
        Ok(())
    }

    /// Idempotent: unwatching an identity that is not watched is a no-op.
    pub async fn stop_watching(&self, identity: &str) -> Result<(), CallError> {
        let room = {
            let mut state = self.state.lock().await;
            let session = Self::connected_session(&mut state)?;
            if !session.watching.remove(identity) {
                return Ok(());
            }
            Arc::clone(&session.room)
        };
        if let Err(err) = room.unsubscribe_screen_share(identity).await {
            warn!(identity, "failed to unsubscribe screen share: {err}");
        }
        Ok(())
    }

    /// Publishes the screen-share video track, with system audio when a
    /// source is given. A failed audio capture degrades to video-only with a
    /// notice; microphone audio is never substituted.
    pub async fn start_screen_share(
        &self,
        audio_source: Option<&str>,
    ) -> Result<ScreenShareOutcome, CallError> {
        let room = {
            let mut state = self.state.lock().await;
            let session = Self::connected_session(&mut state)?;
            Arc::clone(&session.room)
        };

        if let Err(err) = room.publish_local_track(LocalTrack::ScreenShare).await {
            return Err(CallError::Connect(err.to_string()));
        }

        let Some(source_id) = audio_source else {
            return Ok(ScreenShareOutcome {
                audio_captured: false,
            });
        };

        match self
            .capture
            .capture(source_id, &CaptureConstraints::default())
            .await
        {
            Ok(stream) => {
                if let Err(err) = room.publish_local_track(LocalTrack::ScreenShareAudio).await {
                    warn!(source_id, "failed to publish system audio track: {err}");
                    let _ = self.events.send(CallEvent::Notice(
                        "Sharing without computer sound".into(),
                    ));
                    return Ok(ScreenShareOutcome {
                        audio_captured: false,
                    });
                }
                let mut state = self.state.lock().await;
                if let Some(session) = state.session.as_mut() {
                    session.share_audio = Some(stream);
                }
                Ok(ScreenShareOutcome {
                    audio_captured: true,
                })
            }
            Err(err) => {
                // Video-only degrade, by contract never the microphone.
                warn!(source_id, "system audio capture failed: {err}");
                let notice = if capture::is_permission_error(&err) {
                    "Computer sound is blocked by the OS; sharing without audio"
                } else {
                    "Computer sound is unavailable; sharing without audio"
                };
                let _ = self.events.send(CallEvent::Notice(notice.into()));
                Ok(ScreenShareOutcome {
                    audio_captured: false,
                })
            }
        }
    }

    pub async fn stop_screen_share(&self) {
        let room = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.as_mut() else {
                return;
            };
            if let Some(mut share_audio) = session.share_audio.take() {
                share_audio.stop();
            }
            Arc::clone(&session.room)
        };
        for track in [LocalTrack::ScreenShareAudio, LocalTrack::ScreenShare] {
            if let Err(err) = room.unpublish_local_track(track).await {
                warn!("failed to unpublish screen share track: {err}");
            }
        }
    }

    fn connected_session(state: &mut CallState) -> Result<&mut ActiveCall, CallError> {
        if state.phase != CallPhase::Connected {
            return Err(CallError::NotConnected);
        }
        state.session.as_mut().ok_or(CallError::NotConnected)
    }

    fn emit_phase(&self, phase: CallPhase) {
        let _ = self.events.send(CallEvent::PhaseChanged(phase));
    }

    async fn fail(&self, message: String, description: String) {
        {
            let mut state = self.state.lock().await;
            state.phase = CallPhase::Failed;
        }
        self.emit_phase(CallPhase::Failed);
        self.errors.report(&message, &description);
    }

    fn spawn_room_event_task(
        self: &Arc<Self>,
        call_id: CallId,
        room: Arc<dyn RoomSession>,
    ) -> JoinHandle<()> {
        let mut events = room.subscribe_events();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    RoomEvent::ParticipantJoined(participant) => {
                        manager
                            .update_participants(&call_id, |participants| {
                                participants
                                    .retain(|p| p.participant_id != participant.participant_id);
                                participants.push(participant);
                            })
                            .await;
                    }
                    RoomEvent::ParticipantLeft { participant_id } => {
                        manager
                            .update_participants(&call_id, |participants| {
                                participants.retain(|p| p.participant_id != participant_id);
                            })
                            .await;
                    }
                    RoomEvent::ScreenShareStarted { identity } => {
                        let _ = manager.events.send(CallEvent::ScreenShareAvailability {
                            identity,
                            available: true,
                        });
                    }
                    RoomEvent::ScreenShareStopped { identity } => {
                        let _ = manager.events.send(CallEvent::ScreenShareAvailability {
                            identity,
                            available: false,
                        });
                    }
                    RoomEvent::Disconnected { reason } => {
                        warn!(call_id = %call_id, "media room disconnected: {reason}");
                        manager
                            .errors
                            .report("Call disconnected", &reason);
                        let manager = Arc::clone(&manager);
                        // Tear down outside this task; hangup aborts it.
                        tokio::spawn(async move {
                            manager.hangup().await;
                        });
                        return;
                    }
                }
            }
        })
    }

    async fn update_participants(
        &self,
        call_id: &CallId,
        apply: impl FnOnce(&mut Vec<RemoteParticipant>),
    ) {
        let participants = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.as_mut() else {
                return;
            };
            if session.call_id != *call_id {
                return;
            }
            apply(&mut session.participants);
            session.participants.clone()
        };
        let _ = self.events.send(CallEvent::ParticipantsUpdated {
            call_id: call_id.clone(),
            participants,
        });
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
