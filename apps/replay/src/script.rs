use std::path::Path;

use anyhow::{Context, Result};
use client_core::{AttachmentDraft, ComposerMode};
use serde::Deserialize;
use shared::{
    domain::{AttachmentKind, ChannelId, MessageId},
    protocol::{ChannelDelta, ChannelPatch},
};

/// A recorded session: the channel's initial payload plus the steps to replay.
#[derive(Debug, Deserialize)]
pub struct Script {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub initial: Option<ChannelPatch>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Transport push; `channel_id` defaults to the script's channel.
    Delta {
        #[serde(default)]
        channel_id: Option<ChannelId>,
        delta: ChannelDelta,
    },
    Text {
        text: String,
    },
    SelectCandidate {
        index: usize,
    },
    Attach {
        draft: AttachmentDraft,
    },
    Toggle {
        draft: AttachmentDraft,
    },
    Capture {
        draft: AttachmentDraft,
    },
    /// Cancel the attachment at `index` of the current selection.
    CancelAttachment {
        index: usize,
    },
    Open {
        mode: OpenMode,
    },
    Close,
    Edit {
        message_id: MessageId,
    },
    Permissions {
        storage: bool,
        camera: bool,
    },
    Submit,
    Discard,
    WaitUploads {
        #[serde(default = "default_wait_ms")]
        timeout_ms: u64,
    },
    Sleep {
        ms: u64,
    },
    Snapshot,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    AddFile,
    UploadMedia,
    UploadFile,
}

impl OpenMode {
    pub fn into_request(self) -> OpenRequest {
        match self {
            Self::AddFile => OpenRequest::Mode(ComposerMode::AddFile),
            Self::UploadMedia => OpenRequest::Picker(AttachmentKind::Image),
            Self::UploadFile => OpenRequest::Picker(AttachmentKind::File),
        }
    }
}

pub enum OpenRequest {
    Mode(ComposerMode),
    Picker(AttachmentKind),
}

fn default_wait_ms() -> u64 {
    10_000
}

pub fn load(path: &Path) -> Result<Script> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse script '{}'", path.display()))
}
