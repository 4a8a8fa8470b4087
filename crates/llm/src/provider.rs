use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::chunk::StreamingChunk;
use super::model::ModelDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub max_tokens: Option<u64>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Speaker role on the inference wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Where an attachment's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AttachmentSource {
    #[serde(rename = "base64")]
    Base64 {
        #[serde(rename = "mediaType")]
        media_type: String,
        data: String,
    },
    #[serde(rename = "s3")]
    Remote {
        #[serde(rename = "mediaType")]
        media_type: String,
        #[serde(rename = "data")]
        uri: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub source: AttachmentSource,
}

/// One role-tagged message as sent to the endpoint; carries no persistence ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnrecordedMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_data: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl UnrecordedMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            extra_data: Vec::new(),
            trace: None,
        }
    }

    pub fn with_extra_data(mut self, extra_data: Vec<Attachment>) -> Self {
        self.extra_data = extra_data;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub model: ModelDescriptor,
    pub messages: Vec<UnrecordedMessage>,
    pub id: String,
}

impl InferenceRequest {
    pub fn new(
        model: ModelDescriptor,
        messages: Vec<UnrecordedMessage>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            model,
            messages,
            id: id.into(),
        }
    }
}

/// Events drained from a [`ChunkStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(StreamingChunk),
    /// The endpoint's "invoke complete" sentinel.
    Complete,
    Failed(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;
pub type ChunkSender = mpsc::UnboundedSender<StreamEvent>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("missing endpoint URL for provider '{provider_id}'"))]
    MissingEndpoint {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("inference request '{request_id}' has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        request_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("request to {url} failed on `{stage}`, {source}"))]
    HttpRequest {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("endpoint {url} returned status {status}: {body}"))]
    HttpStatus {
        stage: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode streaming chunk '{line}'"))]
    DecodeChunk {
        stage: &'static str,
        line: String,
        source: serde_json::Error,
    },
    #[snafu(display("scripted endpoint has no {what} left for request '{request_id}'"))]
    ScriptExhausted {
        stage: &'static str,
        what: &'static str,
        request_id: String,
    },
}

/// Receiving half of one streaming invocation.
///
/// Dropping the stream signals cancellation to the worker that feeds it.
pub struct ChunkStream {
    request_id: String,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ChunkStreamHandle {
    pub stream: ChunkStream,
    pub worker: ProviderWorker,
}

impl ChunkStream {
    fn new(
        request_id: String,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            request_id,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait InferenceEndpoint: Send + Sync {
    fn id(&self) -> &str;
    fn invoke_stream(&self, request: InferenceRequest) -> ProviderResult<ChunkStreamHandle>;
    /// Non-streaming variant used for title prediction and previews.
    fn predict<'a>(&'a self, request: InferenceRequest) -> BoxFuture<'a, ProviderResult<String>>;
}

/// Wires the channel pair an endpoint worker uses to feed a [`ChunkStream`].
pub fn make_chunk_stream(
    request_id: impl Into<String>,
) -> (ChunkSender, ChunkStream, oneshot::Receiver<()>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ChunkStream::new(request_id.into(), event_rx, cancel_tx),
        cancel_rx,
    )
}
