//! Non-blocking HTTP GET seam for asset transfers.

use std::task::Poll;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError, Receiver};
use tokio::task::JoinHandle;
use tracing::debug;

/// Status line and length of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
}

/// One in-flight GET. Polled from the frame loop; must never block.
pub trait ResponseStream: Send {
    fn poll_head(&mut self) -> Poll<Result<ResponseHead, String>>;

    /// At most `max` body bytes. `Ready(Ok(None))` is end of body.
    fn poll_chunk(&mut self, max: usize) -> Poll<Result<Option<Vec<u8>>, String>>;

    /// Stop the request and release its socket.
    fn abort(&mut self);
}

pub trait AssetHttpClient: Send + Sync {
    fn get(&self, uri: &str) -> Box<dyn ResponseStream>;
}

/// Body chunks buffered between the request task and the frame loop.
const CHANNEL_DEPTH: usize = 8;

#[derive(Debug)]
enum Event {
    Head(ResponseHead),
    Chunk(Vec<u8>),
    Eof,
    Failed(String),
}

/// `reqwest` client whose requests run as tasks on a tokio runtime.
pub struct ReqwestAssetClient {
    client: reqwest::Client,
    runtime: Handle,
}

impl ReqwestAssetClient {
    /// `timeout` bounds connecting and each read, not the whole download.
    pub fn new(runtime: Handle, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = {
            let _guard = runtime.enter();
            reqwest::Client::builder()
                .connect_timeout(timeout)
                .read_timeout(timeout)
                .build()?
        };
        Ok(Self { client, runtime })
    }
}

impl AssetHttpClient for ReqwestAssetClient {
    fn get(&self, uri: &str) -> Box<dyn ResponseStream> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let request = self.client.get(uri);
        let uri = uri.to_string();
        let task = self.runtime.spawn(async move {
            let mut resp = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.send(Event::Failed(e.to_string())).await;
                    return;
                }
            };
            debug!(%uri, status = resp.status().as_u16(), "asset response");
            let head = ResponseHead {
                status: resp.status().as_u16(),
                content_length: resp.content_length(),
            };
            if tx.send(Event::Head(head)).await.is_err() {
                return;
            }
            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => {
                        if tx.send(Event::Chunk(bytes.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Event::Eof).await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Event::Failed(e.to_string())).await;
                        return;
                    }
                }
            }
        });
        Box::new(ChannelResponse::new(rx, Some(task)))
    }
}

/// Receiving side of a spawned request. The task stalls once the channel is full,
/// so at most one chunk plus `CHANNEL_DEPTH` queued ones are held in memory.
struct ChannelResponse {
    rx: Receiver<Event>,
    task: Option<JoinHandle<()>>,
    head: Option<ResponseHead>,
    /// Body bytes received but not yet handed out.
    pending: Vec<u8>,
    offset: usize,
    eof: bool,
    error: Option<String>,
}

impl ChannelResponse {
    fn new(rx: Receiver<Event>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            rx,
            task,
            head: None,
            pending: Vec::new(),
            offset: 0,
            eof: false,
            error: None,
        }
    }

    /// Take one queued event without waiting. False when nothing was taken.
    fn pull(&mut self) -> bool {
        match self.rx.try_recv() {
            Ok(Event::Head(head)) => self.head = Some(head),
            Ok(Event::Chunk(bytes)) => {
                if self.offset == self.pending.len() {
                    self.pending = bytes;
                } else {
                    self.pending.drain(..self.offset);
                    self.pending.extend_from_slice(&bytes);
                }
                self.offset = 0;
            }
            Ok(Event::Eof) => self.eof = true,
            Ok(Event::Failed(e)) => self.error = Some(e),
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => {
                if !self.eof && self.error.is_none() {
                    self.error = Some("request task ended unexpectedly".to_string());
                }
                return false;
            }
        }
        true
    }

    fn finished(&self) -> bool {
        self.eof || self.error.is_some()
    }
}

impl ResponseStream for ChannelResponse {
    fn poll_head(&mut self) -> Poll<Result<ResponseHead, String>> {
        while self.head.is_none() && !self.finished() && self.pull() {}
        match (self.head, &self.error) {
            (Some(head), _) => Poll::Ready(Ok(head)),
            (None, Some(e)) => Poll::Ready(Err(e.clone())),
            (None, None) => Poll::Pending,
        }
    }

    fn poll_chunk(&mut self, max: usize) -> Poll<Result<Option<Vec<u8>>, String>> {
        // Only reach into the channel once the buffered chunk is used up.
        while self.offset == self.pending.len() && !self.finished() && self.pull() {}
        let available = self.pending.len() - self.offset;
        if available > 0 {
            let n = available.min(max.max(1));
            let out = self.pending[self.offset..self.offset + n].to_vec();
            self.offset += n;
            return Poll::Ready(Ok(Some(out)));
        }
        if let Some(e) = &self.error {
            return Poll::Ready(Err(e.clone()));
        }
        if self.eof {
            return Poll::Ready(Ok(None));
        }
        Poll::Pending
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for ChannelResponse {
    fn drop(&mut self) {
        self.abort();
    }
}
