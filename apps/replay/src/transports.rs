use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use client_core::{ChannelTransport, ProgressReporter, UploadRequest, UploadTransport};
use serde_json::json;
use shared::{
    domain::ChannelId,
    protocol::{OutgoingMessage, TypingEventKind},
};
use tokio::{fs::File, io::AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

const CHUNK_BYTES: usize = 64 * 1024;

/// "Uploads" by streaming the file from disk, resolving to a `file://` URL.
pub struct LocalFileUploads {
    root: PathBuf,
}

impl LocalFileUploads {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl UploadTransport for LocalFileUploads {
    async fn upload_file(
        &self,
        request: UploadRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<String> {
        let path = self.root.join(&request.path);
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("failed to open '{}'", path.display()))?;

        let mut buf = vec![0u8; CHUNK_BYTES];
        let mut sent: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                bail!("upload of '{}' cancelled", request.filename);
            }
            let read = file
                .read(&mut buf)
                .await
                .with_context(|| format!("failed to read '{}'", path.display()))?;
            if read == 0 {
                break;
            }
            sent += read as u64;
            progress.report(sent);
        }

        let absolute = tokio::fs::canonicalize(&path).await.unwrap_or(path);
        Ok(format!("file://{}", absolute.display()))
    }
}

/// Prints every outbound item as one JSON line.
pub struct StdoutChannel;

#[async_trait]
impl ChannelTransport for StdoutChannel {
    async fn send_typing_event(&self, channel_id: &ChannelId, kind: TypingEventKind) -> Result<()> {
        info!(%channel_id, ?kind, "typing event");
        println!(
            "{}",
            json!({ "outbound": "typing", "channel_id": channel_id, "kind": kind })
        );
        Ok(())
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<()> {
        info!(channel_id = %message.channel_id, "message sent");
        println!("{}", json!({ "outbound": "message", "message": message }));
        Ok(())
    }
}
