//! Collaborator seams. The core never touches sockets or HTTP itself.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{AttachmentKind, ChannelId},
    protocol::{OutgoingMessage, TypingEventKind},
};
use tokio_util::sync::CancellationToken;

use crate::uploads::{ProgressReporter, UploadHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub handle: UploadHandle,
    pub path: PathBuf,
    pub kind: AttachmentKind,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
}

/// Uploads one local file and resolves to the server-assigned URL.
///
/// Implementations should stop work once `cancel` fires; whatever they
/// return afterwards is discarded.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload_file(
        &self,
        request: UploadRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<String>;
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send_typing_event(&self, channel_id: &ChannelId, kind: TypingEventKind)
        -> Result<()>;
    async fn send_message(&self, message: OutgoingMessage) -> Result<()>;
}

pub struct MissingUploadTransport;

#[async_trait]
impl UploadTransport for MissingUploadTransport {
    async fn upload_file(
        &self,
        request: UploadRequest,
        _progress: ProgressReporter,
        _cancel: CancellationToken,
    ) -> Result<String> {
        Err(anyhow!(
            "upload transport is unavailable for '{}'",
            request.filename
        ))
    }
}

pub struct MissingChannelTransport;

#[async_trait]
impl ChannelTransport for MissingChannelTransport {
    async fn send_typing_event(
        &self,
        channel_id: &ChannelId,
        _kind: TypingEventKind,
    ) -> Result<()> {
        Err(anyhow!(
            "channel transport is unavailable for channel {channel_id}"
        ))
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<()> {
        Err(anyhow!(
            "channel transport is unavailable for channel {}",
            message.channel_id
        ))
    }
}
