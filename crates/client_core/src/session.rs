//! Per-channel session actor.
//!
//! One task owns the channel store and the composer. Renderer commands,
//! transport deltas, upload reports and timers all funnel into its loop, so
//! neither component is ever touched from two places at once. Snapshots go
//! out through `watch` channels after each step is fully applied.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{AttachmentKind, ChannelId, MessageId, UserId},
    error::{ErrorCode, UserNotice},
    protocol::{ChannelDelta, ChannelPatch, OutgoingMessage, TypingEventKind},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::{
    channel_state::{ChannelState, ChannelStateStore},
    composer::{
        ComposerEvent, ComposerMode, ComposerState, ComposerStateMachine, PermissionState,
        SelectionChange,
    },
    config::CoreSettings,
    error::{CoreError, DataIntegrityWarning},
    transport::{ChannelTransport, UploadTransport},
    uploads::{AttachmentDraft, AttachmentId, AttachmentUploadManager, UploadEvent},
};

const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

enum SessionCommand {
    ApplyDelta {
        channel_id: ChannelId,
        delta: ChannelDelta,
    },
    SetText(String),
    SelectCandidate(usize),
    SelectAttachment {
        draft: AttachmentDraft,
        reply: oneshot::Sender<Result<AttachmentId, CoreError>>,
    },
    ToggleAttachment {
        draft: AttachmentDraft,
        reply: oneshot::Sender<Result<Option<AttachmentId>, CoreError>>,
    },
    CaptureMedia {
        draft: AttachmentDraft,
        reply: oneshot::Sender<Result<AttachmentId, CoreError>>,
    },
    CancelAttachment {
        id: AttachmentId,
        reply: oneshot::Sender<bool>,
    },
    OpenMode {
        mode: ComposerMode,
        reply: oneshot::Sender<bool>,
    },
    OpenUploadPicker {
        kind: AttachmentKind,
        reply: oneshot::Sender<bool>,
    },
    CloseMode,
    BeginEdit {
        message_id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    SetPermissions(PermissionState),
    Submit {
        reply: oneshot::Sender<Option<OutgoingMessage>>,
    },
    DiscardDraft,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Outbound {
    Typing(TypingEventKind),
    Message(OutgoingMessage),
}

/// Renderer-side handle to a running [`ChannelSession`].
#[derive(Clone)]
pub struct SessionHandle {
    channel_id: ChannelId,
    commands: mpsc::Sender<SessionCommand>,
    channel_state: watch::Receiver<Arc<ChannelState>>,
    composer_state: watch::Receiver<ComposerState>,
    notices: broadcast::Sender<UserNotice>,
    selection_changes: broadcast::Sender<SelectionChange>,
}

impl SessionHandle {
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn channel_state(&self) -> Arc<ChannelState> {
        self.channel_state.borrow().clone()
    }

    pub fn composer_state(&self) -> ComposerState {
        self.composer_state.borrow().clone()
    }

    /// Current snapshot first, then every later one.
    pub fn observe_channel_state(&self) -> WatchStream<Arc<ChannelState>> {
        WatchStream::new(self.channel_state.clone())
    }

    pub fn observe_composer_state(&self) -> WatchStream<ComposerState> {
        WatchStream::new(self.composer_state.clone())
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<UserNotice> {
        self.notices.subscribe()
    }

    pub fn subscribe_selection_changes(&self) -> broadcast::Receiver<SelectionChange> {
        self.selection_changes.subscribe()
    }

    pub async fn apply_delta(
        &self,
        channel_id: ChannelId,
        delta: ChannelDelta,
    ) -> Result<(), CoreError> {
        self.send(SessionCommand::ApplyDelta { channel_id, delta })
            .await
    }

    pub async fn set_composer_text(&self, text: impl Into<String>) -> Result<(), CoreError> {
        self.send(SessionCommand::SetText(text.into())).await
    }

    pub async fn select_candidate(&self, index: usize) -> Result<(), CoreError> {
        self.send(SessionCommand::SelectCandidate(index)).await
    }

    pub async fn select_attachment(&self, draft: AttachmentDraft) -> Result<AttachmentId, CoreError> {
        self.request(|reply| SessionCommand::SelectAttachment { draft, reply })
            .await?
    }

    pub async fn toggle_attachment(
        &self,
        draft: AttachmentDraft,
    ) -> Result<Option<AttachmentId>, CoreError> {
        self.request(|reply| SessionCommand::ToggleAttachment { draft, reply })
            .await?
    }

    pub async fn capture_media(&self, draft: AttachmentDraft) -> Result<AttachmentId, CoreError> {
        self.request(|reply| SessionCommand::CaptureMedia { draft, reply })
            .await?
    }

    pub async fn cancel_attachment(&self, id: AttachmentId) -> Result<bool, CoreError> {
        self.request(|reply| SessionCommand::CancelAttachment { id, reply })
            .await
    }

    pub async fn open_mode(&self, mode: ComposerMode) -> Result<bool, CoreError> {
        self.request(|reply| SessionCommand::OpenMode { mode, reply })
            .await
    }

    pub async fn open_upload_picker(&self, kind: AttachmentKind) -> Result<bool, CoreError> {
        self.request(|reply| SessionCommand::OpenUploadPicker { kind, reply })
            .await
    }

    pub async fn close_mode(&self) -> Result<(), CoreError> {
        self.send(SessionCommand::CloseMode).await
    }

    /// Returns `false` when the message is not in the channel.
    pub async fn begin_edit(&self, message_id: MessageId) -> Result<bool, CoreError> {
        self.request(|reply| SessionCommand::BeginEdit { message_id, reply })
            .await
    }

    pub async fn set_permissions(&self, permissions: PermissionState) -> Result<(), CoreError> {
        self.send(SessionCommand::SetPermissions(permissions)).await
    }

    /// Hands the message to the channel transport and resets the composer.
    /// `None` when the send button is disabled.
    pub async fn submit_message(&self) -> Result<Option<OutgoingMessage>, CoreError> {
        self.request(|reply| SessionCommand::Submit { reply }).await
    }

    pub async fn discard_draft(&self) -> Result<(), CoreError> {
        self.send(SessionCommand::DiscardDraft).await
    }

    /// Discards the draft and resolves once every queued typing signal and
    /// message has been handed to the channel transport.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.request(|reply| SessionCommand::Shutdown { reply })
            .await
    }

    async fn send(&self, command: SessionCommand) -> Result<(), CoreError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CoreError::SessionClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, CoreError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| CoreError::SessionClosed)
    }
}

pub struct ChannelSession {
    channel_id: ChannelId,
    typing_expiry: Option<chrono::Duration>,
    /// Per typing user: the expiry the server sent and the capped one stored.
    typing_caps: HashMap<UserId, (DateTime<Utc>, DateTime<Utc>)>,
    store: ChannelStateStore,
    composer: ComposerStateMachine,
    outbound: mpsc::UnboundedSender<Outbound>,
    channel_state: watch::Sender<Arc<ChannelState>>,
    composer_state: watch::Sender<ComposerState>,
    notices: broadcast::Sender<UserNotice>,
    selection_changes: broadcast::Sender<SelectionChange>,
}

impl ChannelSession {
    /// Start the session task for `channel_id`, seeded with the transport's
    /// initial channel payload. Must be called from within a tokio runtime.
    pub fn spawn(
        channel_id: ChannelId,
        settings: CoreSettings,
        upload_transport: Arc<dyn UploadTransport>,
        channel_transport: Arc<dyn ChannelTransport>,
        initial: Option<ChannelPatch>,
    ) -> SessionHandle {
        let mut store = ChannelStateStore::new(channel_id.clone());
        if let Some(patch) = initial {
            store.merge(&ChannelDelta::Upsert(patch));
        }

        let (upload_events_tx, upload_events) = mpsc::unbounded_channel();
        let uploads = AttachmentUploadManager::new(
            upload_transport,
            settings.max_upload_bytes,
            upload_events_tx,
        );
        let composer = ComposerStateMachine::new(&settings, uploads);

        let (commands_tx, commands) = mpsc::channel(settings.command_buffer.max(1));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (channel_state, channel_state_rx) = watch::channel(store.snapshot());
        let (composer_state, composer_state_rx) = watch::channel(composer.snapshot());
        let (notices, _) = broadcast::channel(settings.notice_buffer.max(1));
        let (selection_changes, _) = broadcast::channel(settings.notice_buffer.max(1));

        let outbound_worker = tokio::spawn(deliver_outbound(
            channel_id.clone(),
            channel_transport,
            outbound_rx,
            notices.clone(),
        ));

        let handle = SessionHandle {
            channel_id: channel_id.clone(),
            commands: commands_tx,
            channel_state: channel_state_rx,
            composer_state: composer_state_rx,
            notices: notices.clone(),
            selection_changes: selection_changes.clone(),
        };

        let session = Self {
            channel_id,
            typing_expiry: chrono::Duration::from_std(settings.typing_expiry).ok(),
            typing_caps: HashMap::new(),
            store,
            composer,
            outbound,
            channel_state,
            composer_state,
            notices,
            selection_changes,
        };
        tokio::spawn(session.run(commands, upload_events, outbound_worker));

        handle
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut upload_events: mpsc::UnboundedReceiver<UploadEvent>,
        outbound_worker: JoinHandle<()>,
    ) {
        info!(channel_id = %self.channel_id, "channel session started");
        let mut typing_sweep =
            time::interval_at(Instant::now() + TYPING_SWEEP_INTERVAL, TYPING_SWEEP_INTERVAL);
        typing_sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown_reply = loop {
            let idle_deadline = self.composer.typing_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown { reply }) => break Some(reply),
                    None => break None,
                    Some(command) => self.handle(command),
                },
                Some(event) = upload_events.recv() => {
                    self.composer.on_upload_event(event);
                }
                _ = time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                    self.composer.on_idle_tick(Instant::now());
                }
                _ = typing_sweep.tick() => {
                    if self.store.expire_typing(Utc::now()) {
                        let channel = self.store.snapshot();
                        self.typing_caps
                            .retain(|user_id, _| channel.typing_users.contains_key(user_id));
                        self.publish_channel_state();
                    }
                }
            }
            self.flush_composer();
        };

        self.composer.discard_draft();
        self.flush_composer();

        let Self {
            channel_id,
            outbound,
            ..
        } = self;
        drop(outbound);
        if let Err(err) = outbound_worker.await {
            warn!(%channel_id, error = %err, "outbound worker did not finish cleanly");
        }
        info!(%channel_id, "channel session closed");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ApplyDelta { channel_id, delta } => self.apply_delta(channel_id, delta),
            SessionCommand::SetText(text) => {
                let channel = self.store.snapshot();
                self.composer.set_text(text, Instant::now(), &channel);
            }
            SessionCommand::SelectCandidate(index) => {
                self.composer.select_candidate(index, Instant::now());
            }
            SessionCommand::SelectAttachment { draft, reply } => {
                let _ = reply.send(self.composer.select_attachment(draft));
            }
            SessionCommand::ToggleAttachment { draft, reply } => {
                let _ = reply.send(self.composer.toggle_attachment(draft));
            }
            SessionCommand::CaptureMedia { draft, reply } => {
                let _ = reply.send(self.composer.add_captured_media(draft));
            }
            SessionCommand::CancelAttachment { id, reply } => {
                let _ = reply.send(self.composer.cancel_attachment(id));
            }
            SessionCommand::OpenMode { mode, reply } => {
                let _ = reply.send(self.composer.open(mode));
            }
            SessionCommand::OpenUploadPicker { kind, reply } => {
                let _ = reply.send(self.composer.open_upload_picker(kind));
            }
            SessionCommand::CloseMode => self.composer.close(),
            SessionCommand::BeginEdit { message_id, reply } => {
                let channel = self.store.snapshot();
                let found = match channel.message(&message_id) {
                    Some(message) => {
                        self.composer.begin_edit(message);
                        true
                    }
                    None => {
                        debug!(%message_id, "edit requested for unknown message");
                        false
                    }
                };
                let _ = reply.send(found);
            }
            SessionCommand::SetPermissions(permissions) => {
                self.composer.set_permissions(permissions)
            }
            SessionCommand::Submit { reply } => {
                let message = self.composer.submit(&self.channel_id);
                // The stop-typing signal goes out ahead of the message.
                self.flush_composer();
                if let Some(message) = &message {
                    let _ = self.outbound.send(Outbound::Message(message.clone()));
                }
                let _ = reply.send(message);
            }
            SessionCommand::DiscardDraft => self.composer.discard_draft(),
            SessionCommand::Shutdown { .. } => {}
        }
    }

    fn apply_delta(&mut self, channel_id: ChannelId, delta: ChannelDelta) {
        if channel_id != self.channel_id {
            let warning = DataIntegrityWarning::ChannelMismatch {
                expected: self.channel_id.to_string(),
                received: channel_id.to_string(),
            };
            warn!(%warning, "delta dropped");
            return;
        }

        let delta = match delta {
            ChannelDelta::TypingStarted {
                user_id,
                expires_at,
            } => {
                let expires_at = self.cap_typing_expiry(&user_id, expires_at);
                ChannelDelta::TypingStarted {
                    user_id,
                    expires_at,
                }
            }
            ChannelDelta::TypingStopped { user_id } => {
                self.typing_caps.remove(&user_id);
                ChannelDelta::TypingStopped { user_id }
            }
            other => other,
        };

        if self.store.merge(&delta).changed {
            self.publish_channel_state();
            let channel = self.store.snapshot();
            self.composer.refresh_suggestions(&channel);
        }
    }

    /// Remote clocks may be skewed; never keep a typing entry past our own
    /// limit. The limit counts from when an expiry was first seen, so a
    /// redelivered delta stores the same value again.
    fn cap_typing_expiry(&mut self, user_id: &UserId, expires_at: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(&(sent, capped)) = self.typing_caps.get(user_id) {
            if sent == expires_at {
                return capped;
            }
        }
        let capped = self
            .typing_expiry
            .and_then(|expiry| Utc::now().checked_add_signed(expiry))
            .map_or(expires_at, |limit| expires_at.min(limit));
        self.typing_caps
            .insert(user_id.clone(), (expires_at, capped));
        capped
    }

    fn publish_channel_state(&self) {
        self.channel_state.send_replace(self.store.snapshot());
    }

    fn flush_composer(&mut self) {
        for event in self.composer.drain_events() {
            match event {
                ComposerEvent::Typing(kind) => {
                    let _ = self.outbound.send(Outbound::Typing(kind));
                }
                ComposerEvent::Notice(notice) => {
                    let _ = self.notices.send(notice);
                }
                ComposerEvent::SelectionChanged(change) => {
                    let _ = self.selection_changes.send(change);
                }
            }
        }

        let next = self.composer.snapshot();
        self.composer_state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Forwards typing signals and messages in the order the session produced them.
async fn deliver_outbound(
    channel_id: ChannelId,
    transport: Arc<dyn ChannelTransport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    notices: broadcast::Sender<UserNotice>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Typing(kind) => {
                if let Err(err) = transport.send_typing_event(&channel_id, kind).await {
                    warn!(%channel_id, ?kind, error = %err, "typing event not delivered");
                }
            }
            Outbound::Message(message) => {
                if let Err(err) = transport.send_message(message).await {
                    warn!(%channel_id, error = %err, "message not delivered");
                    let _ = notices.send(UserNotice::new(
                        ErrorCode::SendFailed,
                        format!("message could not be sent: {err:#}"),
                    ));
                }
            }
        }
    }
    debug!(%channel_id, "outbound worker stopped");
}
