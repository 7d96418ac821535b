use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{ChannelConfig, ChannelId, Member, Message, MessageId, User, UserId},
    protocol::{ChannelDelta, ChannelPatch, ChannelRemoval},
};
use tracing::warn;

use crate::error::{blank_user, DataIntegrityWarning};

/// Client-visible state of one channel.
///
/// `messages` is sorted by `(created_at, message_id)` and never holds two
/// entries with the same id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelState {
    pub channel_id: ChannelId,
    pub messages: Vec<Message>,
    pub watchers: BTreeMap<UserId, User>,
    pub members: BTreeMap<UserId, Member>,
    pub online: bool,
    /// Remote users currently typing, with the instant their entry lapses.
    pub typing_users: BTreeMap<UserId, DateTime<Utc>>,
    pub config: ChannelConfig,
}

impl ChannelState {
    fn empty(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            messages: Vec::new(),
            watchers: BTreeMap::new(),
            members: BTreeMap::new(),
            online: false,
            typing_users: BTreeMap::new(),
            config: ChannelConfig::default(),
        }
    }

    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.message_id == message_id)
    }

    pub fn member_users(&self) -> impl Iterator<Item = &User> {
        self.members.values().map(|member| &member.user)
    }

    pub fn is_typing(&self, user_id: &UserId) -> bool {
        self.typing_users.contains_key(user_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub changed: bool,
    pub warnings: Vec<DataIntegrityWarning>,
}

impl MergeReport {
    fn note(&mut self, changed: bool) {
        self.changed |= changed;
    }
}

/// Canonical state of one channel, mutated only through [`merge`].
///
/// Snapshots are shared `Arc`s; a merge copies the state at most once and
/// only when something actually changes, so a snapshot handed out earlier
/// never observes later merges.
///
/// [`merge`]: ChannelStateStore::merge
#[derive(Debug, Clone)]
pub struct ChannelStateStore {
    state: Arc<ChannelState>,
}

impl ChannelStateStore {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            state: Arc::new(ChannelState::empty(channel_id)),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.state.channel_id
    }

    pub fn snapshot(&self) -> Arc<ChannelState> {
        Arc::clone(&self.state)
    }

    pub fn merge(&mut self, delta: &ChannelDelta) -> MergeReport {
        let mut report = MergeReport::default();

        match delta {
            ChannelDelta::Upsert(patch) => self.apply_patch(patch, &mut report),
            ChannelDelta::Remove(removal) => self.apply_removal(removal, &mut report),
            ChannelDelta::TypingStarted {
                user_id,
                expires_at,
            } => {
                if user_id.is_blank() {
                    report.warnings.push(DataIntegrityWarning::BlankTypingUser);
                } else if self.state.typing_users.get(user_id) != Some(expires_at) {
                    self.state_mut()
                        .typing_users
                        .insert(user_id.clone(), *expires_at);
                    report.note(true);
                }
            }
            ChannelDelta::TypingStopped { user_id } => {
                if user_id.is_blank() {
                    report.warnings.push(DataIntegrityWarning::BlankTypingUser);
                } else if self.state.typing_users.contains_key(user_id) {
                    self.state_mut().typing_users.remove(user_id);
                    report.note(true);
                }
            }
        }

        for warning in &report.warnings {
            warn!(channel_id = %self.state.channel_id, %warning, "dropped malformed delta entry");
        }

        report
    }

    /// Drop typing entries whose expiry is at or before `now`.
    pub fn expire_typing(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.typing_users.values().any(|expiry| *expiry <= now) {
            return false;
        }
        self.state_mut()
            .typing_users
            .retain(|_, expiry| *expiry > now);
        true
    }

    fn state_mut(&mut self) -> &mut ChannelState {
        Arc::make_mut(&mut self.state)
    }

    fn apply_patch(&mut self, patch: &ChannelPatch, report: &mut MergeReport) {
        for message in &patch.messages {
            if message.message_id.is_blank() {
                report.warnings.push(DataIntegrityWarning::BlankMessageId);
                continue;
            }
            if message.sender_id.is_blank() {
                report.warnings.push(DataIntegrityWarning::BlankSenderId {
                    message_id: message.message_id.to_string(),
                });
                continue;
            }
            let changed = self.upsert_message(message);
            report.note(changed);
        }

        for watcher in &patch.watchers {
            if let Some(warning) = blank_user("watchers", &watcher.user_id) {
                report.warnings.push(warning);
                continue;
            }
            if self.state.watchers.get(&watcher.user_id) != Some(watcher) {
                self.state_mut()
                    .watchers
                    .insert(watcher.user_id.clone(), watcher.clone());
                report.note(true);
            }
        }

        for member in &patch.members {
            if let Some(warning) = blank_user("members", &member.user.user_id) {
                report.warnings.push(warning);
                continue;
            }
            if self.state.members.get(&member.user.user_id) != Some(member) {
                self.state_mut()
                    .members
                    .insert(member.user.user_id.clone(), member.clone());
                report.note(true);
            }
        }

        if let Some(online) = patch.online {
            if self.state.online != online {
                self.state_mut().online = online;
                report.note(true);
            }
        }

        if let Some(config) = &patch.config {
            if &self.state.config != config {
                self.state_mut().config = config.clone();
                report.note(true);
            }
        }
    }

    fn apply_removal(&mut self, removal: &ChannelRemoval, report: &mut MergeReport) {
        for message_id in &removal.message_ids {
            if message_id.is_blank() {
                report
                    .warnings
                    .push(DataIntegrityWarning::BlankRemovalId { section: "message" });
                continue;
            }
            let position = self
                .state
                .messages
                .iter()
                .position(|m| &m.message_id == message_id);
            if let Some(idx) = position {
                self.state_mut().messages.remove(idx);
                report.note(true);
            }
        }

        for user_id in &removal.watcher_ids {
            if user_id.is_blank() {
                report
                    .warnings
                    .push(DataIntegrityWarning::BlankRemovalId { section: "watcher" });
            } else if self.state.watchers.contains_key(user_id) {
                self.state_mut().watchers.remove(user_id);
                report.note(true);
            }
        }

        for user_id in &removal.member_ids {
            if user_id.is_blank() {
                report
                    .warnings
                    .push(DataIntegrityWarning::BlankRemovalId { section: "member" });
            } else if self.state.members.contains_key(user_id) {
                self.state_mut().members.remove(user_id);
                report.note(true);
            }
        }
    }

    /// Insert at the sorted position, or replace the entry with the same id.
    fn upsert_message(&mut self, message: &Message) -> bool {
        let existing = self
            .state
            .messages
            .iter()
            .position(|m| m.message_id == message.message_id);

        if let Some(idx) = existing {
            if self.state.messages[idx] == *message {
                return false;
            }
        }

        let messages = &mut self.state_mut().messages;
        if let Some(idx) = existing {
            messages.remove(idx);
        }
        let at = messages.partition_point(|m| m.sort_key() < message.sort_key());
        messages.insert(at, message.clone());
        true
    }
}

#[cfg(test)]
#[path = "tests/channel_state_tests.rs"]
mod tests;
