//! Message composer: input mode, attachment selection and pickers.
//!
//! Every mode change goes through a single transition check, so two
//! mutually exclusive panels can never be active at once. Side effects meant
//! for the outside (typing signals, notices, selection diffs) are queued and
//! collected with [`ComposerStateMachine::drain_events`].

use serde::{Deserialize, Serialize};
use shared::{
    domain::{AttachmentKind, ChannelId, Message, MessageId},
    error::{PermissionScope, UserNotice},
    protocol::{OutgoingMessage, TypingEventKind},
};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    channel_state::ChannelState,
    config::CoreSettings,
    error::CoreError,
    suggestions::{Candidate, CommandMentionResolver, SuggestionKind, Suggestions},
    typing::TypingCoordinator,
    uploads::{
        Attachment, AttachmentDraft, AttachmentId, AttachmentSource, AttachmentUploadManager,
        UploadEvent, UploadHandle, UploadState, UploadUpdate,
    },
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ComposerMode {
    #[default]
    Idle,
    EditingMessage {
        message_id: MessageId,
    },
    AddFile,
    UploadMedia,
    UploadFile,
    Command,
    Mention,
}

impl ComposerMode {
    pub fn is_picker(&self) -> bool {
        matches!(self, Self::Command | Self::Mention)
    }

    pub fn is_upload(&self) -> bool {
        matches!(self, Self::UploadMedia | Self::UploadFile)
    }

    fn follows_text(&self) -> bool {
        matches!(self, Self::Idle) || self.is_picker()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    Default,
    Composing,
    Editing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionState {
    pub storage: bool,
    pub camera: bool,
}

impl Default for PermissionState {
    fn default() -> Self {
        Self {
            storage: true,
            camera: true,
        }
    }
}

/// How the renderer should refresh its attachment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionChange {
    /// One entry changed in place.
    Item(usize),
    /// Entries were added or removed.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposerEvent {
    Typing(TypingEventKind),
    SelectionChanged(SelectionChange),
    Notice(UserNotice),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposerState {
    pub mode: ComposerMode,
    pub text: String,
    pub cursor: usize,
    pub attachments: Vec<Attachment>,
    pub suggestions: Option<Suggestions>,
    pub uploading: bool,
    pub send_enabled: bool,
    pub input_type: InputType,
    pub attach_button_visible: bool,
    pub permissions: PermissionState,
}

pub struct ComposerStateMachine {
    mode: ComposerMode,
    edit_target: Option<MessageId>,
    text: String,
    cursor: usize,
    selection: Vec<Attachment>,
    suggestions: Option<Suggestions>,
    attach_button_visible: bool,
    permissions: PermissionState,
    typing: TypingCoordinator,
    resolver: CommandMentionResolver,
    uploads: AttachmentUploadManager,
    events: Vec<ComposerEvent>,
}

impl ComposerStateMachine {
    pub fn new(settings: &CoreSettings, uploads: AttachmentUploadManager) -> Self {
        Self {
            mode: ComposerMode::Idle,
            edit_target: None,
            text: String::new(),
            cursor: 0,
            selection: Vec::new(),
            suggestions: None,
            attach_button_visible: true,
            permissions: PermissionState::default(),
            typing: TypingCoordinator::new(settings.typing_debounce, settings.typing_idle_timeout),
            resolver: CommandMentionResolver::new(
                settings.command_prefix,
                settings.mention_trigger,
            ),
            uploads,
            events: Vec::new(),
        }
    }

    pub fn mode(&self) -> &ComposerMode {
        &self.mode
    }

    pub fn send_enabled(&self) -> bool {
        !self.text.trim().is_empty() || (!self.uploads.is_uploading() && !self.selection.is_empty())
    }

    pub fn snapshot(&self) -> ComposerState {
        let send_enabled = self.send_enabled();
        let input_type = if self.edit_target.is_some() {
            InputType::Editing
        } else if send_enabled {
            InputType::Composing
        } else {
            InputType::Default
        };

        ComposerState {
            mode: self.mode.clone(),
            text: self.text.clone(),
            cursor: self.cursor,
            attachments: self.selection.clone(),
            suggestions: self.suggestions.clone(),
            uploading: self.uploads.is_uploading(),
            send_enabled,
            input_type,
            attach_button_visible: self.attach_button_visible,
            permissions: self.permissions,
        }
    }

    pub fn drain_events(&mut self) -> Vec<ComposerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Explicit open request from the renderer.
    ///
    /// Command and Mention follow the text and editing starts with
    /// [`Self::begin_edit`], so both are refused here.
    pub fn open(&mut self, mode: ComposerMode) -> bool {
        match &mode {
            ComposerMode::Idle => {
                self.close();
                return true;
            }
            ComposerMode::Command | ComposerMode::Mention | ComposerMode::EditingMessage { .. } => {
                debug!(requested = ?mode, "mode cannot be opened directly");
                return false;
            }
            ComposerMode::UploadMedia | ComposerMode::UploadFile if !self.permissions.storage => {
                self.push_notice(&CoreError::PermissionDenied(PermissionScope::Storage));
                return false;
            }
            ComposerMode::AddFile | ComposerMode::UploadMedia | ComposerMode::UploadFile => {}
        }
        self.transition(mode).is_ok()
    }

    pub fn open_upload_picker(&mut self, kind: AttachmentKind) -> bool {
        let mode = match kind {
            AttachmentKind::Image | AttachmentKind::Video => ComposerMode::UploadMedia,
            AttachmentKind::File => ComposerMode::UploadFile,
        };
        self.open(mode)
    }

    /// Leave the active mode. Closing an edit discards the edit draft; closing
    /// a picker opened during an edit returns to the edit.
    pub fn close(&mut self) {
        if matches!(self.mode, ComposerMode::EditingMessage { .. }) {
            self.discard_draft();
            return;
        }
        let next = match &self.edit_target {
            Some(message_id) => ComposerMode::EditingMessage {
                message_id: message_id.clone(),
            },
            None => ComposerMode::Idle,
        };
        self.enter(next);
    }

    pub(crate) fn transition(&mut self, next: ComposerMode) -> Result<(), CoreError> {
        let allowed = match &next {
            ComposerMode::AddFile => self.selection.is_empty(),
            ComposerMode::Command | ComposerMode::Mention => self.mode.follows_text(),
            ComposerMode::Idle
            | ComposerMode::EditingMessage { .. }
            | ComposerMode::UploadMedia
            | ComposerMode::UploadFile => true,
        };
        if !allowed {
            debug!(current = ?self.mode, requested = ?next, "composer transition refused");
            return Err(CoreError::InvalidModeTransition {
                current: self.mode.clone(),
                requested: next,
            });
        }
        self.enter(next);
        Ok(())
    }

    fn enter(&mut self, next: ComposerMode) {
        if self.mode == next {
            return;
        }
        self.suggestions = None;
        self.attach_button_visible = match &next {
            ComposerMode::Idle => true,
            ComposerMode::UploadMedia | ComposerMode::UploadFile => false,
            ComposerMode::EditingMessage { .. } => self.selection.is_empty(),
            _ => self.attach_button_visible,
        };
        self.mode = next;
    }

    pub fn set_text(&mut self, text: impl Into<String>, now: Instant, channel: &ChannelState) {
        let text = text.into();
        let cursor = text.chars().count();
        self.replace_text(text, cursor, now);
        self.refresh_suggestions(channel);
    }

    fn replace_text(&mut self, text: String, cursor: usize, now: Instant) {
        self.text = text;
        self.cursor = cursor;
        if let Some(kind) = self.typing.on_text_changed(&self.text, now) {
            self.events.push(ComposerEvent::Typing(kind));
        }
    }

    /// Re-run the pickers, e.g. after the channel's commands or members changed.
    pub fn refresh_suggestions(&mut self, channel: &ChannelState) {
        if !self.mode.follows_text() {
            return;
        }
        let resolved = self.resolver.resolve(
            &self.text,
            &channel.config.commands,
            channel.member_users(),
        );
        match resolved {
            Some(suggestions) => {
                let next = match suggestions.kind {
                    SuggestionKind::Command => ComposerMode::Command,
                    SuggestionKind::Mention => ComposerMode::Mention,
                };
                if self.transition(next).is_ok() {
                    self.suggestions = Some(suggestions);
                }
            }
            None if self.mode.is_picker() => self.enter(ComposerMode::Idle),
            None => {}
        }
    }

    /// Apply the candidate at `index`. The picker closes afterwards.
    pub fn select_candidate(&mut self, index: usize, now: Instant) -> bool {
        let Some(candidate) = self
            .suggestions
            .as_ref()
            .and_then(|suggestions| suggestions.candidates.get(index))
        else {
            return false;
        };

        let edit = match candidate {
            Candidate::Command { name, .. } => self.resolver.apply_command(name),
            Candidate::Mention { display_name, .. } => {
                self.resolver.apply_mention(&self.text, display_name)
            }
        };
        self.replace_text(edit.text, edit.cursor, now);
        self.enter(ComposerMode::Idle);
        true
    }

    pub fn select_attachment(&mut self, draft: AttachmentDraft) -> Result<AttachmentId, CoreError> {
        if self.selection_index_of_path(&draft).is_some() {
            return Err(CoreError::AlreadySelected);
        }
        self.add_to_selection(Attachment::from_draft(draft))
    }

    /// Media straight from the camera; no picker mode is involved.
    pub fn add_captured_media(&mut self, draft: AttachmentDraft) -> Result<AttachmentId, CoreError> {
        if !self.permissions.camera {
            let err = CoreError::PermissionDenied(PermissionScope::Camera);
            self.push_notice(&err);
            return Err(err);
        }
        self.select_attachment(draft)
    }

    /// Gallery click: select when unselected, cancel when already selected.
    pub fn toggle_attachment(
        &mut self,
        draft: AttachmentDraft,
    ) -> Result<Option<AttachmentId>, CoreError> {
        match self.selection_index_of_path(&draft) {
            Some(index) => {
                let id = self.selection[index].id;
                self.cancel_attachment(id);
                Ok(None)
            }
            None => self.add_to_selection(Attachment::from_draft(draft)).map(Some),
        }
    }

    pub fn cancel_attachment(&mut self, id: AttachmentId) -> bool {
        let Some(index) = self.selection_index(id) else {
            return false;
        };
        self.selection.remove(index);
        let handle = UploadHandle::for_attachment(id);
        self.uploads.cancel(handle);
        self.uploads.forget(handle);
        self.selection_shrunk();
        true
    }

    pub fn on_upload_event(&mut self, event: UploadEvent) {
        let Some(update) = self.uploads.apply(event) else {
            return;
        };

        match update {
            UploadUpdate::Progress { handle, bytes, .. } => {
                if let Some(index) = self.selection_index(handle.attachment_id()) {
                    self.selection[index].progress_bytes = bytes;
                    self.events
                        .push(ComposerEvent::SelectionChanged(SelectionChange::Item(index)));
                }
            }
            UploadUpdate::Uploaded { handle, url } => {
                self.uploads.forget(handle);
                if let Some(index) = self.selection_index(handle.attachment_id()) {
                    let attachment = &mut self.selection[index];
                    attachment.source = AttachmentSource::Remote(url);
                    attachment.upload_state = UploadState::Uploaded;
                    attachment.progress_bytes = attachment.total_bytes;
                    self.events
                        .push(ComposerEvent::SelectionChanged(SelectionChange::Item(index)));
                }
            }
            UploadUpdate::Failed { handle, reason } => {
                self.uploads.forget(handle);
                if let Some(index) = self.selection_index(handle.attachment_id()) {
                    self.selection.remove(index);
                    self.selection_shrunk();
                }
                self.push_notice(&CoreError::UploadFailed { reason });
            }
        }
    }

    pub fn on_idle_tick(&mut self, now: Instant) {
        if let Some(kind) = self.typing.on_idle_tick(now) {
            self.events.push(ComposerEvent::Typing(kind));
        }
    }

    pub fn typing_deadline(&self) -> Option<Instant> {
        self.typing.idle_deadline()
    }

    /// Replace the draft with `message` for editing. Its attachments are
    /// already on the server and stay selected without a new upload.
    pub fn begin_edit(&mut self, message: &Message) {
        self.discard_draft();
        self.text = message.text.clone();
        self.cursor = self.text.chars().count();
        self.selection = message
            .attachments
            .iter()
            .map(|payload| {
                let mut attachment = Attachment::from_payload(payload);
                attachment.selected_for_send = true;
                attachment
            })
            .collect();
        if !self.selection.is_empty() {
            self.events
                .push(ComposerEvent::SelectionChanged(SelectionChange::Full));
        }
        self.edit_target = Some(message.message_id.clone());
        self.enter(ComposerMode::EditingMessage {
            message_id: message.message_id.clone(),
        });
    }

    pub fn set_permissions(&mut self, permissions: PermissionState) {
        self.permissions = permissions;
    }

    /// Build the outgoing message and reset the composer.
    ///
    /// Attachments still uploading are left out and their uploads cancelled.
    pub fn submit(&mut self, channel_id: &ChannelId) -> Option<OutgoingMessage> {
        if !self.send_enabled() {
            return None;
        }
        let message = OutgoingMessage {
            channel_id: channel_id.clone(),
            text: self.text.trim().to_owned(),
            attachments: self.selection.iter().filter_map(Attachment::payload).collect(),
            edit_of: self.edit_target.clone(),
        };
        self.discard_draft();
        Some(message)
    }

    pub fn discard_draft(&mut self) {
        if let Some(kind) = self.typing.stop() {
            self.events.push(ComposerEvent::Typing(kind));
        }
        self.uploads.reset_queue();
        if !self.selection.is_empty() {
            self.selection.clear();
            self.events
                .push(ComposerEvent::SelectionChanged(SelectionChange::Full));
        }
        self.text.clear();
        self.cursor = 0;
        self.edit_target = None;
        self.enter(ComposerMode::Idle);
    }

    fn add_to_selection(&mut self, mut attachment: Attachment) -> Result<AttachmentId, CoreError> {
        if !attachment.is_uploaded() {
            if let Err(err) = self.uploads.enqueue(&attachment) {
                self.push_notice(&err);
                return Err(err);
            }
            attachment.upload_state = UploadState::Uploading;
        }
        attachment.selected_for_send = true;
        let id = attachment.id;
        self.selection.push(attachment);
        self.events
            .push(ComposerEvent::SelectionChanged(SelectionChange::Full));
        Ok(id)
    }

    fn selection_shrunk(&mut self) {
        self.events
            .push(ComposerEvent::SelectionChanged(SelectionChange::Full));
        if self.selection.is_empty() && matches!(self.mode, ComposerMode::EditingMessage { .. }) {
            self.attach_button_visible = true;
        }
    }

    fn selection_index(&self, id: AttachmentId) -> Option<usize> {
        self.selection.iter().position(|attachment| attachment.id == id)
    }

    fn selection_index_of_path(&self, draft: &AttachmentDraft) -> Option<usize> {
        self.selection
            .iter()
            .position(|attachment| attachment.picked_from.as_deref() == Some(draft.path.as_path()))
    }

    fn push_notice(&mut self, err: &CoreError) {
        if let Some(notice) = err.notice() {
            self.events.push(ComposerEvent::Notice(notice));
        }
    }
}

#[cfg(test)]
#[path = "tests/composer_tests.rs"]
mod tests;
