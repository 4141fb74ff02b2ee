//! Stand-in worker that speaks the framed stdio protocol.
//!
//! Answers `initialize`, `ping` and `synthesize`; the synthesized "audio" is the
//! request text's UTF-8 bytes, base64 encoded. Used for local runs and the
//! integration tests.
//!
//! Extra commands for exercising failure paths:
//! - `{"command":"crash"}` writes half a frame and exits
//! - `{"command":"sleep","ms":N}` waits `N` milliseconds before answering
//!
//! `--fail-init` makes `initialize` answer with an error.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing_subscriber::EnvFilter;

use synthbridge::Message;
use synthbridge::bridge::codec::FrameCodec;
use synthbridge::bridge::protocol::{INITIALIZE, PING, SYNTHESIZE};

const SAMPLE_RATE: u64 = 44100;

fn error(message: impl Into<String>) -> Message {
    Message::new().with("error", message.into())
}

fn synthesize(request: &Message, initialized: bool) -> Message {
    if !initialized {
        return error("TTS not initialized. Send 'initialize' command first.");
    }
    let text = request
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if text.is_empty() {
        return error("Text is empty");
    }

    Message::new()
        .with("status", "success")
        .with("audio", BASE64.encode(text.as_bytes()))
        .with("sample_rate", SAMPLE_RATE)
        .with("echo", text)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // stdout carries frames; logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let fail_init = std::env::args().any(|arg| arg == "--fail-init");
    let mut requests = FramedRead::new(tokio::io::stdin(), FrameCodec::new());
    let mut replies = FramedWrite::new(tokio::io::stdout(), FrameCodec::new());
    let mut initialized = false;

    while let Some(request) = requests.next().await {
        let request = request?;
        let command = request.command_name().unwrap_or_default().to_string();
        tracing::debug!(%command, "Request received");

        let reply = match command.as_str() {
            INITIALIZE if fail_init => error("initialization refused"),
            INITIALIZE => {
                initialized = true;
                Message::new().with("status", "initialized")
            }
            PING => Message::new().with("status", "pong"),
            SYNTHESIZE => synthesize(&request, initialized),
            "sleep" => {
                let ms = request.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                Message::new().with("status", "awake")
            }
            "crash" => {
                tracing::warn!("Crashing on request");
                let mut stdout = replies.into_inner();
                stdout.write_all(&64u32.to_le_bytes()).await?;
                stdout.write_all(br#"{"audio":"#).await?;
                stdout.flush().await?;
                std::process::exit(1);
            }
            _ => error("Unknown command"),
        };

        replies.send(reply).await?;
    }

    tracing::debug!("stdin closed, exiting");
    Ok(())
}
