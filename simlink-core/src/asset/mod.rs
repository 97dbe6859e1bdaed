//! HTTP asset download: a metadata GET followed by a data GET, advanced one chunk per `update`.

mod http;
mod metadata;

pub use http::{AssetHttpClient, ReqwestAssetClient, ResponseHead, ResponseStream};
pub use metadata::{AssetMetadata, MetadataError};

use std::fmt;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::AssetTransferConfig;

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub id: String,
    pub metadata_uri: String,
    pub data_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    FetchingMetadata,
    FetchingData,
    Complete,
    Failed,
}

/// Why a transfer stopped. Length mismatches carry the declared and received byte counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub reason: String,
    pub expected: Option<u64>,
    pub actual: Option<u64>,
}

impl TransferFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            expected: None,
            actual: None,
        }
    }

    fn length(reason: &str, expected: u64, actual: u64) -> Self {
        Self {
            reason: reason.to_string(),
            expected: Some(expected),
            actual: Some(actual),
        }
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.expected, self.actual) {
            (Some(e), Some(a)) => write!(f, "{} (expected {} bytes, got {})", self.reason, e, a),
            _ => write!(f, "{}", self.reason),
        }
    }
}

/// One asset download. Transfers share no state; drive each with `update`.
pub struct AssetTransfer {
    request: AssetRequest,
    client: Arc<dyn AssetHttpClient>,
    chunk_size: usize,
    phase: TransferPhase,
    response: Option<Box<dyn ResponseStream>>,
    declared: Option<u64>,
    data_size: u64,
    metadata: Vec<u8>,
    data: Vec<u8>,
    idle: Duration,
    failure: Option<TransferFailure>,
}

impl AssetTransfer {
    /// Issues the metadata GET right away.
    pub fn new(
        request: AssetRequest,
        client: Arc<dyn AssetHttpClient>,
        config: &AssetTransferConfig,
    ) -> Self {
        debug!(asset = %request.id, uri = %request.metadata_uri, "fetching metadata");
        let response = client.get(&request.metadata_uri);
        Self {
            request,
            client,
            chunk_size: config.chunk_size.max(1),
            phase: TransferPhase::FetchingMetadata,
            response: Some(response),
            declared: None,
            data_size: 0,
            metadata: Vec::new(),
            data: Vec::new(),
            idle: Duration::ZERO,
            failure: None,
        }
    }

    /// Advance by at most one chunk. `dt` is added to the idle time unless bytes arrive.
    pub fn update(&mut self, dt: Duration) -> TransferPhase {
        if self.is_finished() {
            return self.phase;
        }
        self.idle += dt;
        let Some(response) = self.response.as_mut() else {
            return self.phase;
        };

        if self.declared.is_none() {
            match response.poll_head() {
                Poll::Pending => return self.phase,
                Poll::Ready(Err(e)) => {
                    self.fail(TransferFailure::new(format!("request failed: {}", e)));
                    return self.phase;
                }
                Poll::Ready(Ok(head)) => {
                    if head.status != 200 {
                        self.fail(TransferFailure::new(format!("HTTP status {}", head.status)));
                        return self.phase;
                    }
                    let Some(len) = head.content_length else {
                        self.fail(TransferFailure::new("response has no Content-Length"));
                        return self.phase;
                    };
                    self.declared = Some(len);
                    if self.phase == TransferPhase::FetchingData {
                        self.data_size = len;
                        self.data.reserve(len.min(1 << 24) as usize);
                    }
                }
            }
        }

        let declared = self.declared.unwrap_or(0);
        let Some(response) = self.response.as_mut() else {
            return self.phase;
        };
        match response.poll_chunk(self.chunk_size) {
            Poll::Pending => {}
            Poll::Ready(Err(e)) => {
                self.fail(TransferFailure::new(format!("body read failed: {}", e)));
            }
            Poll::Ready(Ok(Some(bytes))) => {
                if !bytes.is_empty() {
                    self.idle = Duration::ZERO;
                }
                let buf = self.buffer_mut();
                buf.extend_from_slice(&bytes);
                let received = buf.len() as u64;
                if received > declared {
                    self.fail(TransferFailure::length(
                        "received more than declared",
                        declared,
                        received,
                    ));
                }
            }
            Poll::Ready(Ok(None)) => {
                let received = self.buffer().len() as u64;
                if received != declared {
                    self.fail(TransferFailure::length("short read", declared, received));
                } else {
                    self.advance();
                }
            }
        }
        self.phase
    }

    fn advance(&mut self) {
        self.response = None;
        self.declared = None;
        match self.phase {
            TransferPhase::FetchingMetadata => {
                debug!(
                    asset = %self.request.id,
                    bytes = self.metadata.len(),
                    uri = %self.request.data_uri,
                    "metadata received, fetching data"
                );
                self.phase = TransferPhase::FetchingData;
                self.response = Some(self.client.get(&self.request.data_uri));
            }
            TransferPhase::FetchingData => {
                debug!(asset = %self.request.id, bytes = self.data.len(), "asset complete");
                self.phase = TransferPhase::Complete;
            }
            TransferPhase::Complete | TransferPhase::Failed => {}
        }
    }

    fn fail(&mut self, failure: TransferFailure) {
        warn!(asset = %self.request.id, phase = ?self.phase, %failure, "asset transfer failed");
        if let Some(mut response) = self.response.take() {
            response.abort();
        }
        self.phase = TransferPhase::Failed;
        self.failure = Some(failure);
    }

    /// Abort the in-flight request. Terminal.
    pub fn cancel(&mut self) {
        if !self.is_finished() {
            self.fail(TransferFailure::new("cancelled"));
        }
    }

    fn buffer(&self) -> &Vec<u8> {
        match self.phase {
            TransferPhase::FetchingMetadata => &self.metadata,
            _ => &self.data,
        }
    }

    fn buffer_mut(&mut self) -> &mut Vec<u8> {
        match self.phase {
            TransferPhase::FetchingMetadata => &mut self.metadata,
            _ => &mut self.data,
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.phase, TransferPhase::Complete | TransferPhase::Failed)
    }

    pub fn asset_id(&self) -> &str {
        &self.request.id
    }

    pub fn request(&self) -> &AssetRequest {
        &self.request
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn ready(&self) -> bool {
        self.phase == TransferPhase::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.phase == TransferPhase::Failed
    }

    pub fn failure(&self) -> Option<&TransferFailure> {
        self.failure.as_ref()
    }

    /// Declared payload length; 0 until the data response head arrives.
    pub fn size(&self) -> u64 {
        self.data_size
    }

    /// Payload bytes received so far.
    pub fn received_continuous(&self) -> u64 {
        self.data.len() as u64
    }

    /// Append the payload received so far to `out`.
    pub fn assemble_data(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.data);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Raw metadata document, lossily decoded as UTF-8.
    pub fn asset_metadata(&self) -> String {
        String::from_utf8_lossy(&self.metadata).into_owned()
    }

    pub fn parsed_metadata(&self) -> Result<AssetMetadata, MetadataError> {
        AssetMetadata::from_json(&self.asset_metadata())
    }

    /// Time since bytes last arrived.
    pub fn idle_time(&self) -> Duration {
        self.idle
    }
}

impl Drop for AssetTransfer {
    fn drop(&mut self) {
        if let Some(mut response) = self.response.take() {
            response.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Step {
        Wait,
        Head(u16, Option<u64>),
        Chunk(&'static [u8]),
        Eof,
        Error(&'static str),
    }

    struct Scripted {
        steps: VecDeque<Step>,
        aborted: Arc<Mutex<bool>>,
    }

    impl ResponseStream for Scripted {
        fn poll_head(&mut self) -> Poll<Result<ResponseHead, String>> {
            match self.steps.pop_front() {
                Some(Step::Head(status, content_length)) => Poll::Ready(Ok(ResponseHead {
                    status,
                    content_length,
                })),
                Some(Step::Error(e)) => Poll::Ready(Err(e.to_string())),
                _ => Poll::Pending,
            }
        }

        fn poll_chunk(&mut self, max: usize) -> Poll<Result<Option<Vec<u8>>, String>> {
            match self.steps.pop_front() {
                Some(Step::Chunk(bytes)) => {
                    assert!(bytes.len() <= max);
                    Poll::Ready(Ok(Some(bytes.to_vec())))
                }
                Some(Step::Eof) => Poll::Ready(Ok(None)),
                Some(Step::Error(e)) => Poll::Ready(Err(e.to_string())),
                _ => Poll::Pending,
            }
        }

        fn abort(&mut self) {
            *self.aborted.lock().unwrap() = true;
        }
    }

    #[derive(Default)]
    struct FakeClient {
        scripts: Mutex<HashMap<String, Vec<Step>>>,
        requested: Mutex<Vec<String>>,
        aborted: Arc<Mutex<bool>>,
    }

    impl FakeClient {
        fn script(self, uri: &str, steps: Vec<Step>) -> Self {
            self.scripts.lock().unwrap().insert(uri.to_string(), steps);
            self
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    impl AssetHttpClient for FakeClient {
        fn get(&self, uri: &str) -> Box<dyn ResponseStream> {
            self.requested.lock().unwrap().push(uri.to_string());
            let steps = self
                .scripts
                .lock()
                .unwrap()
                .get(uri)
                .cloned()
                .unwrap_or_default();
            Box::new(Scripted {
                steps: steps.into(),
                aborted: Arc::clone(&self.aborted),
            })
        }
    }

    fn request() -> AssetRequest {
        AssetRequest {
            id: "brick".into(),
            metadata_uri: "http://assets/brick".into(),
            data_uri: "http://assets/brick/data".into(),
        }
    }

    fn run(transfer: &mut AssetTransfer, frames: usize) -> TransferPhase {
        let mut phase = transfer.phase();
        for _ in 0..frames {
            phase = transfer.update(Duration::from_millis(10));
        }
        phase
    }

    const META: &[u8] = br#"{"id":"brick","name":"Brick","type":"image/png"}"#;

    #[test]
    fn metadata_then_data() {
        let client = Arc::new(
            FakeClient::default()
                .script(
                    "http://assets/brick",
                    vec![Step::Head(200, Some(META.len() as u64)), Step::Chunk(META), Step::Eof],
                )
                .script(
                    "http://assets/brick/data",
                    vec![
                        Step::Wait,
                        Step::Head(200, Some(6)),
                        Step::Chunk(b"abc"),
                        Step::Wait,
                        Step::Chunk(b"def"),
                        Step::Eof,
                    ],
                ),
        );
        let mut t = AssetTransfer::new(request(), client.clone(), &AssetTransferConfig::default());
        assert_eq!(client.requested(), vec!["http://assets/brick"]);
        assert_eq!(t.size(), 0);

        assert_eq!(run(&mut t, 2), TransferPhase::FetchingData);
        assert_eq!(t.parsed_metadata().unwrap().content_type, "image/png");
        assert_eq!(client.requested().len(), 2);

        run(&mut t, 2);
        assert_eq!(t.size(), 6);
        assert_eq!(t.received_continuous(), 3);
        assert!(!t.ready());

        assert_eq!(run(&mut t, 3), TransferPhase::Complete);
        assert!(t.ready());
        assert_eq!(t.data(), b"abcdef");
        let mut out = b">".to_vec();
        t.assemble_data(&mut out);
        assert_eq!(out, b">abcdef");
        assert!(t.failure().is_none());
    }

    #[test]
    fn metadata_404_skips_data() {
        let client = Arc::new(
            FakeClient::default().script("http://assets/brick", vec![Step::Head(404, Some(0))]),
        );
        let mut t = AssetTransfer::new(request(), client.clone(), &AssetTransferConfig::default());
        assert_eq!(t.update(Duration::ZERO), TransferPhase::Failed);
        assert!(t.is_failed());
        assert!(t.failure().unwrap().reason.contains("404"));
        assert_eq!(client.requested().len(), 1);
        assert!(*client.aborted.lock().unwrap());
        assert_eq!(run(&mut t, 3), TransferPhase::Failed);
    }

    #[test]
    fn missing_content_length_fails() {
        let client = Arc::new(
            FakeClient::default().script("http://assets/brick", vec![Step::Head(200, None)]),
        );
        let mut t = AssetTransfer::new(request(), client, &AssetTransferConfig::default());
        assert_eq!(t.update(Duration::ZERO), TransferPhase::Failed);
    }

    #[test]
    fn short_read_reports_counts() {
        let client = Arc::new(
            FakeClient::default()
                .script(
                    "http://assets/brick",
                    vec![Step::Head(200, Some(2)), Step::Chunk(b"{}"), Step::Eof],
                )
                .script(
                    "http://assets/brick/data",
                    vec![Step::Head(200, Some(10)), Step::Chunk(b"1234"), Step::Eof],
                ),
        );
        let mut t = AssetTransfer::new(request(), client, &AssetTransferConfig::default());
        assert_eq!(run(&mut t, 6), TransferPhase::Failed);
        let failure = t.failure().unwrap();
        assert_eq!(failure.expected, Some(10));
        assert_eq!(failure.actual, Some(4));
        assert_eq!(failure.to_string(), "short read (expected 10 bytes, got 4)");
    }

    #[test]
    fn overlong_body_fails_immediately() {
        let client = Arc::new(FakeClient::default().script(
            "http://assets/brick",
            vec![Step::Head(200, Some(2)), Step::Chunk(b"{ }")],
        ));
        let mut t = AssetTransfer::new(request(), client, &AssetTransferConfig::default());
        t.update(Duration::ZERO);
        assert!(t.is_failed());
        assert_eq!(t.failure().unwrap().actual, Some(3));
    }

    #[test]
    fn idle_time_resets_on_bytes() {
        let client = Arc::new(FakeClient::default().script(
            "http://assets/brick",
            vec![
                Step::Wait,
                Step::Wait,
                Step::Head(200, Some(2)),
                Step::Chunk(b"{}"),
            ],
        ));
        let mut t = AssetTransfer::new(request(), client, &AssetTransferConfig::default());
        run(&mut t, 2);
        assert_eq!(t.idle_time(), Duration::from_millis(20));
        t.update(Duration::from_millis(10));
        assert_eq!(t.idle_time(), Duration::ZERO);
    }

    #[test]
    fn transport_error_and_cancel() {
        let client = Arc::new(
            FakeClient::default().script("http://assets/brick", vec![Step::Error("refused")]),
        );
        let mut t = AssetTransfer::new(request(), client.clone(), &AssetTransferConfig::default());
        t.update(Duration::ZERO);
        assert!(t.failure().unwrap().reason.contains("refused"));

        let mut t = AssetTransfer::new(request(), client, &AssetTransferConfig::default());
        t.cancel();
        assert_eq!(t.phase(), TransferPhase::Failed);
        assert_eq!(t.failure().unwrap().reason, "cancelled");
    }
}
