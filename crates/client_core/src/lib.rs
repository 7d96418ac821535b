//! Local reconciliation and composition core of the chat client.
//!
//! [`ChannelSession`] owns one channel's [`ChannelStateStore`] and
//! [`ComposerStateMachine`] and is the only place either is mutated. The
//! renderer talks to it through a [`SessionHandle`]; the transport plugs in
//! through the traits in [`transport`].

pub mod channel_state;
pub mod composer;
pub mod config;
pub mod error;
pub mod session;
pub mod suggestions;
pub mod transport;
pub mod typing;
pub mod uploads;

pub use channel_state::{ChannelState, ChannelStateStore, MergeReport};
pub use composer::{
    ComposerEvent, ComposerMode, ComposerState, ComposerStateMachine, InputType, PermissionState,
    SelectionChange,
};
pub use config::{ConfigError, CoreSettings};
pub use error::{CoreError, DataIntegrityWarning};
pub use session::{ChannelSession, SessionHandle};
pub use suggestions::{Candidate, CommandMentionResolver, SuggestionKind, Suggestions, TextEdit};
pub use transport::{
    ChannelTransport, MissingChannelTransport, MissingUploadTransport, UploadRequest,
    UploadTransport,
};
pub use typing::TypingCoordinator;
pub use uploads::{
    Attachment, AttachmentDraft, AttachmentId, AttachmentSource, AttachmentUploadManager,
    ProgressReporter, UploadEvent, UploadEventKind, UploadHandle, UploadProgress, UploadState,
    UploadUpdate,
};
