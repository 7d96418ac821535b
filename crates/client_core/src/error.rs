//! Error taxonomy of the core.
//!
//! Merge-time and upload-time failures are recovered locally; only the
//! user-actionable ones are turned into a [`UserNotice`] for the renderer.

use shared::{
    domain::UserId,
    error::{ErrorCode, PermissionScope, UserNotice},
};
use thiserror::Error;

use crate::composer::ComposerMode;

/// Malformed delta entry. The entry is dropped and merging continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataIntegrityWarning {
    #[error("message with blank id dropped")]
    BlankMessageId,
    #[error("message {message_id} has blank sender id")]
    BlankSenderId { message_id: String },
    #[error("{section} entry with blank user id dropped")]
    BlankUserId { section: &'static str },
    #[error("typing update for blank user id dropped")]
    BlankTypingUser,
    #[error("removal of blank {section} id ignored")]
    BlankRemovalId { section: &'static str },
    #[error("delta for channel {received} delivered to channel {expected}")]
    ChannelMismatch { expected: String, received: String },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("attachment is {size_bytes} bytes, limit is {limit_bytes} bytes")]
    UploadSizeExceeded { size_bytes: u64, limit_bytes: u64 },
    #[error("upload failed: {reason}")]
    UploadFailed { reason: String },
    #[error("permission required: {0:?}")]
    PermissionDenied(PermissionScope),
    #[error("cannot enter {requested:?} while composer is in {current:?}")]
    InvalidModeTransition {
        current: ComposerMode,
        requested: ComposerMode,
    },
    #[error("attachment is already selected")]
    AlreadySelected,
    #[error("channel session is closed")]
    SessionClosed,
}

impl CoreError {
    /// Notice for the renderer, or `None` for errors handled silently.
    pub fn notice(&self) -> Option<UserNotice> {
        match self {
            Self::UploadSizeExceeded { .. } => {
                Some(UserNotice::new(ErrorCode::UploadSizeExceeded, self.to_string()))
            }
            Self::UploadFailed { .. } => {
                Some(UserNotice::new(ErrorCode::UploadFailed, self.to_string()))
            }
            Self::PermissionDenied(scope) => Some(UserNotice::permission_required(*scope)),
            Self::InvalidModeTransition { .. } | Self::AlreadySelected | Self::SessionClosed => {
                None
            }
        }
    }
}

pub(crate) fn blank_user(section: &'static str, user_id: &UserId) -> Option<DataIntegrityWarning> {
    user_id
        .is_blank()
        .then_some(DataIntegrityWarning::BlankUserId { section })
}
