//! Test doubles.
//!
//! [`StubWorker`] speaks the real frame format over a tokio duplex pipe, so the
//! session and serializer are exercised exactly as they would be against a child
//! process. [`MockBridge`] stands in for the whole bridge behind the transports.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::{FrameCodec, encode};
use crate::bridge::protocol::{INITIALIZE, Message, PING};
use crate::error::BridgeError;
use crate::health::{SessionSnapshot, SessionState};
use crate::serializer::Bridge;
use crate::session::{StartError, WorkerProcess, WorkerSpawner};

/// What the stub does with one request.
pub(crate) enum Reply {
    Message(Message),
    /// Correct length prefix around arbitrary payload bytes.
    Raw(Vec<u8>),
    /// Never answer; keep reading until the bridge closes stdin.
    Hang,
    /// Write a header and part of a payload, then close the pipe.
    CloseMidFrame,
    /// Close the pipe without writing anything.
    Close,
}

impl Reply {
    pub(crate) fn message(value: Value) -> Self {
        Reply::Message(Message::try_from(value).expect("reply must be a JSON object"))
    }

    /// Default behavior: acknowledge initialize, answer ping, echo `text` otherwise.
    pub(crate) fn echo(request: &Message) -> Self {
        match request.command_name() {
            Some(INITIALIZE) => Reply::message(json!({"status": "initialized"})),
            Some(PING) => Reply::message(json!({"status": "pong"})),
            _ => Reply::message(json!({
                "echo": request.get("text").cloned().unwrap_or(Value::Null)
            })),
        }
    }
}

type Handler = dyn Fn(&Message) -> Reply + Send + Sync;

#[derive(Clone)]
pub(crate) struct StubWorker {
    handler: Arc<Handler>,
    delay: Duration,
    spawns: Arc<AtomicUsize>,
    overlapped: Arc<AtomicBool>,
}

impl StubWorker {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&Message) -> Reply + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            delay: Duration::ZERO,
            spawns: Arc::new(AtomicUsize::new(0)),
            overlapped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn echo() -> Self {
        Self::new(Reply::echo)
    }

    /// Sleep this long before answering each request.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn spawner(&self) -> Arc<dyn WorkerSpawner> {
        Arc::new(self.clone())
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// True if a request ever arrived while a previous one was still unanswered.
    pub(crate) fn saw_overlap(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    async fn serve(self, stream: DuplexStream) {
        let (read, write) = tokio::io::split(stream);
        let in_flight = Arc::new(AtomicBool::new(false));
        let (requests_tx, requests) = mpsc::unbounded_channel();

        let reader = tokio::spawn(Self::read_requests(
            read,
            requests_tx,
            in_flight.clone(),
            self.overlapped.clone(),
        ));
        self.answer(requests, write, &in_flight).await;
        // The bridge sees EOF only once both halves are gone.
        reader.abort();
    }

    /// Read every frame as it arrives. A frame that lands while the previous one
    /// is still unanswered marks an overlap but is still queued for an answer.
    async fn read_requests(
        read: ReadHalf<DuplexStream>,
        requests: mpsc::UnboundedSender<Message>,
        in_flight: Arc<AtomicBool>,
        overlapped: Arc<AtomicBool>,
    ) {
        let mut frames = FramedRead::new(read, FrameCodec::new());
        while let Some(Ok(request)) = frames.next().await {
            if in_flight.swap(true, Ordering::SeqCst) {
                overlapped.store(true, Ordering::SeqCst);
            }
            if requests.send(request).is_err() {
                return;
            }
        }
    }

    async fn answer(
        &self,
        mut requests: mpsc::UnboundedReceiver<Message>,
        mut write: WriteHalf<DuplexStream>,
        in_flight: &AtomicBool,
    ) {
        while let Some(request) = requests.recv().await {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let bytes = match (self.handler)(&request) {
                Reply::Message(reply) => encode(&reply).expect("stub reply encodes").to_vec(),
                Reply::Raw(payload) => {
                    let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
                    frame.extend_from_slice(&payload);
                    frame
                }
                Reply::Hang => {
                    while requests.recv().await.is_some() {}
                    return;
                }
                Reply::CloseMidFrame => {
                    let mut frame = 64u32.to_le_bytes().to_vec();
                    frame.extend_from_slice(br#"{"audio":"#);
                    let _ = write.write_all(&frame).await;
                    let _ = write.flush().await;
                    return;
                }
                Reply::Close => return,
            };

            in_flight.store(false, Ordering::SeqCst);
            if write.write_all(&bytes).await.is_err() || write.flush().await.is_err() {
                return;
            }
        }
    }
}

impl WorkerSpawner for StubWorker {
    fn spawn(&self) -> Result<WorkerProcess, StartError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let (bridge_end, worker_end) = tokio::io::duplex(64 * 1024);
        tokio::spawn(self.clone().serve(worker_end));

        let (stdout, stdin) = tokio::io::split(bridge_end);
        Ok(WorkerProcess {
            child: None,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }
}

type Responder = dyn Fn(Message) -> Result<Message, BridgeError> + Send + Sync;

/// A [`Bridge`] that answers from a closure without any worker behind it.
pub(crate) struct MockBridge {
    respond: Box<Responder>,
    state: SessionState,
    pub(crate) submits: AtomicUsize,
    pub(crate) shutdowns: AtomicUsize,
}

impl MockBridge {
    pub(crate) fn new<F>(respond: F) -> Self
    where
        F: Fn(Message) -> Result<Message, BridgeError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            state: SessionState::Ready,
            submits: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Replies with the request it was given.
    pub(crate) fn echo() -> Self {
        Self::new(Ok)
    }

    pub(crate) fn failing(err: BridgeError) -> Self {
        Self::new(move |_| Err(err.clone())).with_state(SessionState::Failed)
    }

    pub(crate) fn with_state(mut self, state: SessionState) -> Self {
        self.state = state;
        self
    }
}

#[async_trait::async_trait]
impl Bridge for MockBridge {
    async fn submit(&self, request: Message) -> Result<Message, BridgeError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        (self.respond)(request)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            ..SessionSnapshot::default()
        }
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio_util::codec::FramedWrite;

    #[tokio::test]
    async fn overlapping_requests_are_flagged_and_still_answered() {
        let stub = StubWorker::echo().with_delay(Duration::from_millis(20));
        let worker = stub.spawn().unwrap();
        let mut requests = FramedWrite::new(worker.stdin, FrameCodec::new());
        let mut replies = FramedRead::new(worker.stdout, FrameCodec::new());

        for text in ["one", "two"] {
            requests
                .send(Message::command("synthesize").with("text", text))
                .await
                .unwrap();
        }

        for text in ["one", "two"] {
            let reply = tokio::time::timeout(Duration::from_secs(5), replies.next())
                .await
                .expect("reply stalled")
                .unwrap()
                .unwrap();
            assert_eq!(reply.get("echo"), Some(&json!(text)));
        }
        assert!(stub.saw_overlap());
    }

    #[tokio::test]
    async fn sequential_requests_are_not_flagged() {
        let stub = StubWorker::echo();
        let worker = stub.spawn().unwrap();
        let mut requests = FramedWrite::new(worker.stdin, FrameCodec::new());
        let mut replies = FramedRead::new(worker.stdout, FrameCodec::new());

        for text in ["one", "two"] {
            requests
                .send(Message::command("synthesize").with("text", text))
                .await
                .unwrap();
            let reply = replies.next().await.unwrap().unwrap();
            assert_eq!(reply.get("echo"), Some(&json!(text)));
        }
        assert!(!stub.saw_overlap());
    }
}
