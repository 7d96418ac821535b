//! Attachment records and the upload task pool.
//!
//! Upload tasks run concurrently on the runtime and report back through a
//! single event channel. [`AttachmentUploadManager::apply`] is the only place
//! those reports are accepted, which is where late and out-of-order
//! callbacks get filtered.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use shared::domain::{AttachmentKind, AttachmentPayload};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::CoreError,
    transport::{UploadRequest, UploadTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentId(pub Uuid);

impl AttachmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttachmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque reference to the upload task bound to one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct UploadHandle(AttachmentId);

impl UploadHandle {
    pub fn for_attachment(id: AttachmentId) -> Self {
        Self(id)
    }

    pub fn attachment_id(&self) -> AttachmentId {
        self.0
    }
}

impl fmt::Display for UploadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Uploading,
    Uploaded,
    Failed,
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Uploaded | Self::Failed | Self::Cancelled)
    }
}

/// Local file until the upload completes, server URL afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttachmentSource {
    Local(PathBuf),
    Remote(String),
}

/// Media picked from the gallery or file list, or captured by the camera.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttachmentDraft {
    pub path: PathBuf,
    pub kind: AttachmentKind,
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    #[serde(default)]
    pub video_length_secs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub source: AttachmentSource,
    pub kind: AttachmentKind,
    pub filename: String,
    pub mime_type: Option<String>,
    pub progress_bytes: u64,
    pub total_bytes: u64,
    pub upload_state: UploadState,
    pub selected_for_send: bool,
    pub video_length_secs: Option<u32>,
    /// File the user picked; kept after the URL replaces it as the source.
    #[serde(skip)]
    pub picked_from: Option<PathBuf>,
}

impl Attachment {
    pub fn from_draft(draft: AttachmentDraft) -> Self {
        Self {
            id: AttachmentId::new(),
            source: AttachmentSource::Local(draft.path.clone()),
            kind: draft.kind,
            filename: draft.filename,
            mime_type: draft.mime_type,
            progress_bytes: 0,
            total_bytes: draft.size_bytes,
            upload_state: UploadState::Pending,
            selected_for_send: false,
            video_length_secs: draft.video_length_secs,
            picked_from: Some(draft.path),
        }
    }

    /// Attachment of an already sent message, e.g. when editing it.
    pub fn from_payload(payload: &AttachmentPayload) -> Self {
        Self {
            id: AttachmentId::new(),
            source: AttachmentSource::Remote(payload.url.clone()),
            kind: payload.kind,
            filename: payload.filename.clone(),
            mime_type: payload.mime_type.clone(),
            progress_bytes: payload.size_bytes,
            total_bytes: payload.size_bytes,
            upload_state: UploadState::Uploaded,
            selected_for_send: false,
            video_length_secs: None,
            picked_from: None,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match &self.source {
            AttachmentSource::Local(path) => Some(path),
            AttachmentSource::Remote(_) => None,
        }
    }

    pub fn is_uploaded(&self) -> bool {
        self.upload_state == UploadState::Uploaded
            && matches!(self.source, AttachmentSource::Remote(_))
    }

    pub fn payload(&self) -> Option<AttachmentPayload> {
        match (&self.source, self.upload_state) {
            (AttachmentSource::Remote(url), UploadState::Uploaded) => Some(AttachmentPayload {
                url: url.clone(),
                kind: self.kind,
                filename: self.filename.clone(),
                size_bytes: self.total_bytes,
                mime_type: self.mime_type.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEventKind {
    Progress(u64),
    Succeeded(String),
    Failed(String),
}

/// Raw report from an upload task, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEvent {
    pub handle: UploadHandle,
    pub kind: UploadEventKind,
}

/// Report accepted by the manager and ready to be applied to an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadUpdate {
    Progress {
        handle: UploadHandle,
        bytes: u64,
        total: u64,
    },
    Uploaded {
        handle: UploadHandle,
        url: String,
    },
    Failed {
        handle: UploadHandle,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes: u64,
    pub total: u64,
}

/// Progress sink handed to the upload transport.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    handle: UploadHandle,
    events: mpsc::UnboundedSender<UploadEvent>,
}

impl ProgressReporter {
    pub fn report(&self, bytes: u64) {
        let _ = self.events.send(UploadEvent {
            handle: self.handle,
            kind: UploadEventKind::Progress(bytes),
        });
    }
}

/// Sends the task's single terminal event. A task that unwinds or is torn
/// down before reporting one fails its upload, unless it was cancelled.
struct OutcomeGuard {
    handle: UploadHandle,
    events: Option<mpsc::UnboundedSender<UploadEvent>>,
    cancel: CancellationToken,
}

impl OutcomeGuard {
    fn finish(mut self, kind: UploadEventKind) {
        if let Some(events) = self.events.take() {
            let _ = events.send(UploadEvent {
                handle: self.handle,
                kind,
            });
        }
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        let Some(events) = self.events.take() else {
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = events.send(UploadEvent {
            handle: self.handle,
            kind: UploadEventKind::Failed("upload task ended without a result".to_owned()),
        });
    }
}

struct ActiveUpload {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    progress: UploadProgress,
}

pub struct AttachmentUploadManager {
    transport: Arc<dyn UploadTransport>,
    max_upload_bytes: u64,
    events: mpsc::UnboundedSender<UploadEvent>,
    active: HashMap<UploadHandle, ActiveUpload>,
    finished: HashMap<UploadHandle, UploadState>,
}

impl AttachmentUploadManager {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        max_upload_bytes: u64,
        events: mpsc::UnboundedSender<UploadEvent>,
    ) -> Self {
        Self {
            transport,
            max_upload_bytes,
            events,
            active: HashMap::new(),
            finished: HashMap::new(),
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Start uploading `attachment` right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&mut self, attachment: &Attachment) -> Result<UploadHandle, CoreError> {
        let handle = UploadHandle::for_attachment(attachment.id);

        if attachment.total_bytes > self.max_upload_bytes {
            warn!(
                attachment = %attachment.id,
                size_bytes = attachment.total_bytes,
                limit_bytes = self.max_upload_bytes,
                "attachment rejected before upload"
            );
            return Err(CoreError::UploadSizeExceeded {
                size_bytes: attachment.total_bytes,
                limit_bytes: self.max_upload_bytes,
            });
        }

        let Some(path) = attachment.local_path() else {
            return Err(CoreError::UploadFailed {
                reason: format!("attachment '{}' has no local file", attachment.filename),
            });
        };

        if self.active.contains_key(&handle) {
            return Ok(handle);
        }

        let request = UploadRequest {
            handle,
            path: path.to_path_buf(),
            kind: attachment.kind,
            filename: attachment.filename.clone(),
            mime_type: attachment.mime_type.clone(),
            size_bytes: attachment.total_bytes,
        };
        let cancel = CancellationToken::new();
        let task = self.spawn_upload(request, cancel.clone());

        self.finished.remove(&handle);
        self.active.insert(
            handle,
            ActiveUpload {
                cancel,
                task,
                progress: UploadProgress {
                    bytes: 0,
                    total: attachment.total_bytes,
                },
            },
        );
        info!(%handle, filename = %attachment.filename, "upload started");
        Ok(handle)
    }

    fn spawn_upload(&self, request: UploadRequest, cancel: CancellationToken) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        let handle = request.handle;
        let reporter = ProgressReporter {
            handle,
            events: events.clone(),
        };

        tokio::spawn(async move {
            let outcome = OutcomeGuard {
                handle,
                events: Some(events),
                cancel: cancel.clone(),
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = transport.upload_file(request, reporter, cancel.clone()) => result,
            };
            outcome.finish(match result {
                Ok(url) => UploadEventKind::Succeeded(url),
                Err(err) => UploadEventKind::Failed(format!("{err:#}")),
            });
        })
    }

    /// Request cancellation. Returns `false` when the task already finished.
    pub fn cancel(&mut self, handle: UploadHandle) -> bool {
        let Some(active) = self.active.remove(&handle) else {
            return false;
        };
        active.cancel.cancel();
        self.finished.insert(handle, UploadState::Cancelled);
        debug!(%handle, "upload cancelled");
        true
    }

    /// Validate a task report; stale or regressing reports yield `None`.
    pub fn apply(&mut self, event: UploadEvent) -> Option<UploadUpdate> {
        let handle = event.handle;
        let Some(active) = self.active.get_mut(&handle) else {
            debug!(%handle, event = ?event.kind, "ignoring report for inactive upload");
            return None;
        };

        match event.kind {
            UploadEventKind::Progress(bytes) => {
                let bytes = bytes.min(active.progress.total);
                if bytes <= active.progress.bytes {
                    return None;
                }
                active.progress.bytes = bytes;
                Some(UploadUpdate::Progress {
                    handle,
                    bytes,
                    total: active.progress.total,
                })
            }
            UploadEventKind::Succeeded(url) => {
                self.active.remove(&handle);
                self.finished.insert(handle, UploadState::Uploaded);
                info!(%handle, "upload finished");
                Some(UploadUpdate::Uploaded { handle, url })
            }
            UploadEventKind::Failed(reason) => {
                self.active.remove(&handle);
                self.finished.insert(handle, UploadState::Failed);
                warn!(%handle, %reason, "upload failed");
                Some(UploadUpdate::Failed { handle, reason })
            }
        }
    }

    pub fn progress(&self, handle: UploadHandle) -> Option<UploadProgress> {
        self.active.get(&handle).map(|active| active.progress)
    }

    pub fn state(&self, handle: UploadHandle) -> Option<UploadState> {
        if self.active.contains_key(&handle) {
            return Some(UploadState::Uploading);
        }
        self.finished.get(&handle).copied()
    }

    /// Drop the record of a finished or cancelled upload once its outcome
    /// has been consumed. Active uploads are left alone.
    pub fn forget(&mut self, handle: UploadHandle) -> bool {
        self.finished.remove(&handle).is_some()
    }

    pub fn is_uploading(&self) -> bool {
        !self.active.is_empty()
    }

    /// Cancel every active task and forget finished ones.
    pub fn reset_queue(&mut self) -> Vec<UploadHandle> {
        let cancelled: Vec<UploadHandle> = self
            .active
            .drain()
            .map(|(handle, active)| {
                active.cancel.cancel();
                handle
            })
            .collect();
        self.finished.clear();
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "upload queue reset");
        }
        cancelled
    }
}

impl Drop for AttachmentUploadManager {
    fn drop(&mut self) {
        for active in self.active.values() {
            active.cancel.cancel();
            active.task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/uploads_tests.rs"]
mod tests;
