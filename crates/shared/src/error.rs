use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codes for errors the user can act on. Internal recoveries never get one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UploadSizeExceeded,
    UploadFailed,
    PermissionDenied,
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    Storage,
    Camera,
}

/// User-facing notice crossing into the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct UserNotice {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionScope>,
}

impl UserNotice {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            permission: None,
        }
    }

    pub fn permission_required(scope: PermissionScope) -> Self {
        let message = match scope {
            PermissionScope::Storage => "storage access is required to pick attachments",
            PermissionScope::Camera => "camera access is required to capture media",
        };
        Self {
            code: ErrorCode::PermissionDenied,
            message: message.to_owned(),
            permission: Some(scope),
        }
    }
}
