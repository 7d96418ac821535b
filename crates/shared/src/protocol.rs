use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AttachmentPayload, ChannelConfig, ChannelId, Member, Message, MessageId, User, UserId,
};

/// Partial update pushed by the transport for one channel.
///
/// Every variant is keyed, so applying the same delta twice leaves the
/// channel in the same state as applying it once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelDelta {
    Upsert(ChannelPatch),
    Remove(ChannelRemoval),
    TypingStarted {
        user_id: UserId,
        expires_at: DateTime<Utc>,
    },
    TypingStopped {
        user_id: UserId,
    },
}

/// Additive/overwriting subset of channel state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPatch {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub watchers: Vec<User>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ChannelConfig>,
}

impl ChannelPatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.watchers.is_empty()
            && self.members.is_empty()
            && self.online.is_none()
            && self.config.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRemoval {
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
    #[serde(default)]
    pub watcher_ids: Vec<UserId>,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingEventKind {
    Start,
    Stop,
}

/// Message handed to the transport when the composer submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub channel_id: ChannelId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_of: Option<MessageId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tagged_upsert_with_missing_sections() {
        let raw = r#"{"type":"upsert","payload":{"online":true}}"#;
        let delta: ChannelDelta = serde_json::from_str(raw).expect("delta");
        match delta {
            ChannelDelta::Upsert(patch) => {
                assert_eq!(patch.online, Some(true));
                assert!(patch.messages.is_empty());
                assert!(patch.config.is_none());
            }
            other => panic!("unexpected delta: {other:?}"),
        }
    }

    #[test]
    fn typing_started_carries_expiry() {
        let raw = r#"{"type":"typing_started","payload":{"user_id":"u1","expires_at":"2024-05-01T10:00:00Z"}}"#;
        let delta: ChannelDelta = serde_json::from_str(raw).expect("delta");
        assert!(matches!(
            delta,
            ChannelDelta::TypingStarted { ref user_id, .. } if user_id.as_str() == "u1"
        ));
    }

    #[test]
    fn empty_patch_reports_empty() {
        assert!(ChannelPatch::default().is_empty());
        let patch = ChannelPatch {
            online: Some(false),
            ..ChannelPatch::default()
        };
        assert!(!patch.is_empty());
    }
}
