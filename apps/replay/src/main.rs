use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use client_core::{ChannelSession, CoreSettings, PermissionState, SessionHandle};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod script;
mod transports;

use script::{OpenRequest, Step};
use transports::{LocalFileUploads, StdoutChannel};

const DEFAULT_FILTER: &str = "info,client_core=debug";

/// Replays a recorded channel session through the client core.
#[derive(Parser, Debug)]
struct Args {
    /// JSON script with the channel's initial payload and the steps to run.
    #[arg(long)]
    script: PathBuf,
    /// Optional TOML settings file; `CHAT_CORE__*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory attachment paths in the script are resolved against.
    #[arg(long, default_value = ".")]
    media_root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let settings = CoreSettings::load(args.config.as_deref())?;
    let script = script::load(&args.script)?;
    info!(channel_id = %script.channel_id, steps = script.steps.len(), "replaying script");

    let handle = ChannelSession::spawn(
        script.channel_id.clone(),
        settings,
        Arc::new(LocalFileUploads::new(args.media_root)),
        Arc::new(StdoutChannel),
        script.initial,
    );
    forward_notices(&handle);

    for step in script.steps {
        run_step(&handle, step).await?;
    }

    print_snapshot(&handle)?;
    handle.shutdown().await?;
    Ok(())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

fn forward_notices(handle: &SessionHandle) {
    let mut notices = handle.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            warn!(code = ?notice.code, message = %notice.message, "user notice");
            println!("{}", json!({ "notice": notice }));
        }
    });
}

async fn run_step(handle: &SessionHandle, step: Step) -> Result<()> {
    match step {
        Step::Delta { channel_id, delta } => {
            let channel_id = channel_id.unwrap_or_else(|| handle.channel_id().clone());
            handle.apply_delta(channel_id, delta).await?;
        }
        Step::Text { text } => handle.set_composer_text(text).await?,
        Step::SelectCandidate { index } => handle.select_candidate(index).await?,
        Step::Attach { draft } => {
            if let Err(err) = handle.select_attachment(draft).await {
                warn!(error = %err, "attachment refused");
            }
        }
        Step::Toggle { draft } => {
            if let Err(err) = handle.toggle_attachment(draft).await {
                warn!(error = %err, "toggle refused");
            }
        }
        Step::Capture { draft } => {
            if let Err(err) = handle.capture_media(draft).await {
                warn!(error = %err, "capture refused");
            }
        }
        Step::CancelAttachment { index } => {
            let state = handle.composer_state();
            let attachment = state
                .attachments
                .get(index)
                .ok_or_else(|| anyhow!("no attachment at index {index}"))?;
            handle.cancel_attachment(attachment.id).await?;
        }
        Step::Open { mode } => {
            let opened = match mode.into_request() {
                OpenRequest::Mode(mode) => handle.open_mode(mode).await?,
                OpenRequest::Picker(kind) => handle.open_upload_picker(kind).await?,
            };
            if !opened {
                warn!(?mode, "mode not opened");
            }
        }
        Step::Close => handle.close_mode().await?,
        Step::Edit { message_id } => {
            if !handle.begin_edit(message_id.clone()).await? {
                warn!(%message_id, "message to edit not found");
            }
        }
        Step::Permissions { storage, camera } => {
            handle
                .set_permissions(PermissionState { storage, camera })
                .await?
        }
        Step::Submit => {
            if handle.submit_message().await?.is_none() {
                warn!("submit ignored, send is disabled");
            }
        }
        Step::Discard => handle.discard_draft().await?,
        Step::WaitUploads { timeout_ms } => wait_for_uploads(handle, timeout_ms).await?,
        Step::Sleep { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        Step::Snapshot => print_snapshot(handle)?,
    }
    Ok(())
}

async fn wait_for_uploads(handle: &SessionHandle, timeout_ms: u64) -> Result<()> {
    let mut states = handle.observe_composer_state();
    tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        while let Some(state) = states.next().await {
            if !state.uploading {
                break;
            }
        }
    })
    .await
    .with_context(|| format!("uploads still running after {timeout_ms} ms"))
}

fn print_snapshot(handle: &SessionHandle) -> Result<()> {
    let snapshot = json!({
        "channel": &*handle.channel_state(),
        "composer": handle.composer_state(),
    });
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
