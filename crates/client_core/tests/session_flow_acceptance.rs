use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use client_core::{
    AttachmentDraft, ChannelSession, ChannelTransport, ComposerMode, ComposerState, CoreError,
    CoreSettings, MissingChannelTransport, ProgressReporter, SessionHandle, UploadRequest,
    UploadState, UploadTransport,
};
use shared::{
    domain::{
        AttachmentKind, ChannelConfig, ChannelId, Command, Member, Message, MessageId, Role, User,
        UserId,
    },
    error::ErrorCode,
    protocol::{ChannelDelta, ChannelPatch, OutgoingMessage, TypingEventKind},
};
use tokio::sync::{mpsc, Notify};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq)]
enum Sent {
    Typing(TypingEventKind),
    Message(OutgoingMessage),
}

struct RecordingTransport {
    sent: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl ChannelTransport for RecordingTransport {
    async fn send_typing_event(&self, _channel_id: &ChannelId, kind: TypingEventKind) -> Result<()> {
        let _ = self.sent.send(Sent::Typing(kind));
        Ok(())
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<()> {
        let _ = self.sent.send(Sent::Message(message));
        Ok(())
    }
}

/// Takes a moment per call before recording, like a real network round trip.
struct SlowTransport {
    delivered: Arc<Mutex<Vec<Sent>>>,
}

impl SlowTransport {
    async fn record(&self, item: Sent) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.delivered.lock().expect("delivered lock").push(item);
    }
}

#[async_trait]
impl ChannelTransport for SlowTransport {
    async fn send_typing_event(&self, _channel_id: &ChannelId, kind: TypingEventKind) -> Result<()> {
        self.record(Sent::Typing(kind)).await;
        Ok(())
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<()> {
        self.record(Sent::Message(message)).await;
        Ok(())
    }
}

struct BrokenUploads;

#[async_trait]
impl UploadTransport for BrokenUploads {
    async fn upload_file(
        &self,
        _request: UploadRequest,
        _progress: ProgressReporter,
        _cancel: CancellationToken,
    ) -> Result<String> {
        panic!("upload client crashed")
    }
}

/// Reports half the file, then waits for the test to release it.
struct GatedUploads {
    release: Arc<Notify>,
}

#[async_trait]
impl UploadTransport for GatedUploads {
    async fn upload_file(
        &self,
        request: UploadRequest,
        progress: ProgressReporter,
        _cancel: CancellationToken,
    ) -> Result<String> {
        progress.report(request.size_bytes / 2);
        self.release.notified().await;
        progress.report(request.size_bytes);
        Ok(format!("https://cdn.example/{}", request.filename))
    }
}

fn general() -> ChannelId {
    ChannelId::from("general")
}

fn initial_payload() -> ChannelPatch {
    ChannelPatch {
        members: vec![Member {
            user: User {
                user_id: UserId::from("u1"),
                display_name: "Alice".to_owned(),
                online: true,
            },
            role: Role::Owner,
        }],
        config: Some(ChannelConfig {
            commands: vec![Command {
                name: "giphy".to_owned(),
                args_hint: "[text]".to_owned(),
                description: None,
            }],
        }),
        online: Some(true),
        ..ChannelPatch::default()
    }
}

fn message(id: &str, secs: i64) -> Message {
    Message {
        message_id: MessageId::from(id),
        sender_id: UserId::from("u1"),
        text: format!("message {id}"),
        created_at: Utc
            .timestamp_opt(1_714_000_000 + secs, 0)
            .single()
            .expect("valid timestamp"),
        attachments: Vec::new(),
        updated_at: None,
    }
}

fn draft(filename: &str, size_bytes: u64) -> AttachmentDraft {
    AttachmentDraft {
        path: PathBuf::from(format!("/media/{filename}")),
        kind: AttachmentKind::Image,
        filename: filename.to_owned(),
        mime_type: None,
        size_bytes,
        video_length_secs: None,
    }
}

fn spawn_session(
    uploads: Arc<dyn UploadTransport>,
) -> (SessionHandle, mpsc::UnboundedReceiver<Sent>) {
    let (sent, sent_rx) = mpsc::unbounded_channel();
    let settings = CoreSettings {
        max_upload_bytes: 1024,
        ..CoreSettings::default()
    };
    let handle = ChannelSession::spawn(
        general(),
        settings,
        uploads,
        Arc::new(RecordingTransport { sent }),
        Some(initial_payload()),
    );
    (handle, sent_rx)
}

async fn next_sent(sent: &mut mpsc::UnboundedReceiver<Sent>) -> Sent {
    tokio::time::timeout(Duration::from_secs(5), sent.recv())
        .await
        .expect("outbound item in time")
        .expect("transport channel open")
}

async fn wait_for_composer(
    handle: &SessionHandle,
    predicate: impl Fn(&ComposerState) -> bool,
) -> ComposerState {
    let mut states = handle.observe_composer_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(state) = states.next().await {
            if predicate(&state) {
                return state;
            }
        }
        panic!("composer stream ended");
    })
    .await
    .expect("composer state in time")
}

#[tokio::test]
async fn deltas_for_the_session_channel_are_merged_and_published() {
    let (handle, _sent) = spawn_session(Arc::new(GatedUploads {
        release: Arc::new(Notify::new()),
    }));
    let mut states = handle.observe_channel_state();
    let first = states.next().await.expect("initial snapshot");
    assert!(first.online);
    assert_eq!(first.members.len(), 1);

    handle
        .apply_delta(
            ChannelId::from("random"),
            ChannelDelta::Upsert(ChannelPatch {
                messages: vec![message("stray", 0)],
                ..ChannelPatch::default()
            }),
        )
        .await
        .expect("send delta");
    handle
        .apply_delta(
            general(),
            ChannelDelta::Upsert(ChannelPatch {
                messages: vec![message("m2", 2), message("m1", 1)],
                ..ChannelPatch::default()
            }),
        )
        .await
        .expect("send delta");

    let merged = tokio::time::timeout(Duration::from_secs(5), states.next())
        .await
        .expect("snapshot in time")
        .expect("stream open");
    let ids: Vec<_> = merged
        .messages
        .iter()
        .map(|m| m.message_id.as_str())
        .collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}

#[tokio::test]
async fn typing_and_submit_reach_the_transport_in_order() {
    let (handle, mut sent) = spawn_session(Arc::new(GatedUploads {
        release: Arc::new(Notify::new()),
    }));

    handle.set_composer_text("hello").await.expect("set text");
    let outgoing = handle
        .submit_message()
        .await
        .expect("session alive")
        .expect("send enabled");

    assert_eq!(outgoing.text, "hello");
    assert_eq!(next_sent(&mut sent).await, Sent::Typing(TypingEventKind::Start));
    assert_eq!(next_sent(&mut sent).await, Sent::Typing(TypingEventKind::Stop));
    assert_eq!(next_sent(&mut sent).await, Sent::Message(outgoing));
    assert!(handle.composer_state().text.is_empty());
}

#[tokio::test]
async fn command_picker_opens_from_session_text() {
    let (handle, _sent) = spawn_session(Arc::new(GatedUploads {
        release: Arc::new(Notify::new()),
    }));

    handle.set_composer_text("/gi").await.expect("set text");
    let state = wait_for_composer(&handle, |state| state.mode == ComposerMode::Command).await;
    assert_eq!(state.suggestions.map(|s| s.candidates.len()), Some(1));

    handle.select_candidate(0).await.expect("select");
    let state = wait_for_composer(&handle, |state| state.mode == ComposerMode::Idle).await;
    assert_eq!(state.text, "/giphy ");
}

#[tokio::test]
async fn upload_completes_before_attachment_is_sent() {
    let release = Arc::new(Notify::new());
    let (handle, mut sent) = spawn_session(Arc::new(GatedUploads {
        release: Arc::clone(&release),
    }));

    let id = handle
        .select_attachment(draft("cat.png", 100))
        .await
        .expect("attachment accepted");
    let state = wait_for_composer(&handle, |state| {
        state.attachments.first().map(|a| a.progress_bytes) == Some(50)
    })
    .await;
    assert!(!state.send_enabled);
    assert_eq!(state.attachments[0].id, id);

    release.notify_one();
    let state = wait_for_composer(&handle, |state| {
        state.attachments.first().map(|a| a.upload_state) == Some(UploadState::Uploaded)
    })
    .await;
    assert!(state.send_enabled);

    let outgoing = handle
        .submit_message()
        .await
        .expect("session alive")
        .expect("send enabled");
    assert_eq!(outgoing.attachments[0].url, "https://cdn.example/cat.png");
    assert_eq!(next_sent(&mut sent).await, Sent::Message(outgoing));
}

#[tokio::test]
async fn oversized_attachment_is_reported_to_the_renderer() {
    let (handle, _sent) = spawn_session(Arc::new(GatedUploads {
        release: Arc::new(Notify::new()),
    }));
    let mut notices = handle.subscribe_notices();

    let err = handle
        .select_attachment(draft("movie.png", 4096))
        .await
        .expect_err("too large");

    assert!(matches!(err, CoreError::UploadSizeExceeded { .. }));
    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .expect("notice in time")
        .expect("notice");
    assert_eq!(notice.code, ErrorCode::UploadSizeExceeded);
    assert!(handle.composer_state().attachments.is_empty());
}

#[tokio::test]
async fn failed_send_becomes_a_notice() {
    let handle = ChannelSession::spawn(
        general(),
        CoreSettings::default(),
        Arc::new(GatedUploads {
            release: Arc::new(Notify::new()),
        }),
        Arc::new(MissingChannelTransport),
        None,
    );
    let mut notices = handle.subscribe_notices();

    handle.set_composer_text("anyone?").await.expect("set text");
    handle
        .submit_message()
        .await
        .expect("session alive")
        .expect("send enabled");

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .expect("notice in time")
        .expect("notice");
    assert_eq!(notice.code, ErrorCode::SendFailed);
}

#[tokio::test]
async fn editing_requires_a_known_message() {
    let (handle, _sent) = spawn_session(Arc::new(GatedUploads {
        release: Arc::new(Notify::new()),
    }));
    handle
        .apply_delta(
            general(),
            ChannelDelta::Upsert(ChannelPatch {
                messages: vec![message("m1", 1)],
                ..ChannelPatch::default()
            }),
        )
        .await
        .expect("send delta");

    assert!(!handle
        .begin_edit(MessageId::from("missing"))
        .await
        .expect("session alive"));
    assert!(handle
        .begin_edit(MessageId::from("m1"))
        .await
        .expect("session alive"));

    let state = handle.composer_state();
    assert_eq!(
        state.mode,
        ComposerMode::EditingMessage {
            message_id: MessageId::from("m1")
        }
    );
    assert_eq!(state.text, "message m1");
}

#[tokio::test]
async fn expired_remote_typing_is_swept() {
    let (handle, _sent) = spawn_session(Arc::new(GatedUploads {
        release: Arc::new(Notify::new()),
    }));
    let mut states = handle.observe_channel_state();
    states.next().await.expect("initial snapshot");

    handle
        .apply_delta(
            general(),
            ChannelDelta::TypingStarted {
                user_id: UserId::from("u1"),
                expires_at: Utc::now() - chrono::Duration::seconds(1),
            },
        )
        .await
        .expect("send delta");

    let typing = tokio::time::timeout(Duration::from_secs(5), states.next())
        .await
        .expect("snapshot in time")
        .expect("stream open");
    assert!(typing.is_typing(&UserId::from("u1")));

    let swept = tokio::time::timeout(Duration::from_secs(5), states.next())
        .await
        .expect("sweep in time")
        .expect("stream open");
    assert!(!swept.is_typing(&UserId::from("u1")));
}

#[tokio::test]
async fn remote_typing_expiry_is_capped_by_settings() {
    let (handle, _sent) = spawn_session(Arc::new(GatedUploads {
        release: Arc::new(Notify::new()),
    }));
    let mut states = handle.observe_channel_state();
    states.next().await.expect("initial snapshot");

    handle
        .apply_delta(
            general(),
            ChannelDelta::TypingStarted {
                user_id: UserId::from("u1"),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            },
        )
        .await
        .expect("send delta");

    let typing = tokio::time::timeout(Duration::from_secs(5), states.next())
        .await
        .expect("snapshot in time")
        .expect("stream open");
    let expires_at = typing.typing_users[&UserId::from("u1")];
    let limit = Utc::now()
        + chrono::Duration::from_std(CoreSettings::default().typing_expiry).expect("expiry fits");
    assert!(expires_at <= limit);
}

#[tokio::test]
async fn handle_reports_closed_session_after_shutdown() {
    let (handle, _sent) = spawn_session(Arc::new(GatedUploads {
        release: Arc::new(Notify::new()),
    }));

    handle.shutdown().await.expect("shutdown accepted");

    assert!(matches!(
        handle.submit_message().await,
        Err(CoreError::SessionClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_queued_outbound_items() {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let handle = ChannelSession::spawn(
        general(),
        CoreSettings::default(),
        Arc::new(GatedUploads {
            release: Arc::new(Notify::new()),
        }),
        Arc::new(SlowTransport {
            delivered: Arc::clone(&delivered),
        }),
        None,
    );

    handle.set_composer_text("hello").await.expect("set text");
    let outgoing = handle
        .submit_message()
        .await
        .expect("session alive")
        .expect("send enabled");
    handle.shutdown().await.expect("shutdown completes");

    assert_eq!(
        *delivered.lock().expect("delivered lock"),
        vec![
            Sent::Typing(TypingEventKind::Start),
            Sent::Typing(TypingEventKind::Stop),
            Sent::Message(outgoing),
        ]
    );
}

#[tokio::test]
async fn crashed_upload_is_dropped_from_the_selection() {
    let (handle, _sent) = spawn_session(Arc::new(BrokenUploads));
    let mut notices = handle.subscribe_notices();

    handle
        .select_attachment(draft("cat.png", 10))
        .await
        .expect("attachment accepted");

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .expect("notice in time")
        .expect("notice");
    assert_eq!(notice.code, ErrorCode::UploadFailed);

    let state = wait_for_composer(&handle, |state| state.attachments.is_empty()).await;
    assert!(!state.uploading);
}

#[tokio::test]
async fn redelivered_typing_delta_keeps_its_expiry() {
    let (handle, _sent) = spawn_session(Arc::new(GatedUploads {
        release: Arc::new(Notify::new()),
    }));
    let mut states = handle.observe_channel_state();
    states.next().await.expect("initial snapshot");
    let typing = ChannelDelta::TypingStarted {
        user_id: UserId::from("u1"),
        expires_at: Utc::now() + chrono::Duration::hours(1),
    };

    handle
        .apply_delta(general(), typing.clone())
        .await
        .expect("send delta");
    let first = tokio::time::timeout(Duration::from_secs(5), states.next())
        .await
        .expect("snapshot in time")
        .expect("stream open");
    let stored = first.typing_users[&UserId::from("u1")];

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle
        .apply_delta(general(), typing)
        .await
        .expect("send delta");
    handle
        .apply_delta(
            general(),
            ChannelDelta::Upsert(ChannelPatch {
                messages: vec![message("m1", 1)],
                ..ChannelPatch::default()
            }),
        )
        .await
        .expect("send delta");

    let latest = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = states.next().await.expect("stream open");
            if !state.messages.is_empty() {
                return state;
            }
        }
    })
    .await
    .expect("snapshot in time");
    assert_eq!(latest.typing_users[&UserId::from("u1")], stored);
}
