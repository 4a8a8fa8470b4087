use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use snafu::OptionExt;
use tokio::sync::oneshot;

use super::chunk::StreamingChunk;
use super::provider::{
    BoxFuture, ChunkSender, ChunkStreamHandle, InferenceEndpoint, InferenceRequest,
    ProviderResult, ProviderWorker, ScriptExhaustedSnafu, StreamEvent, make_chunk_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

/// How a scripted stream ends after its chunks are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEnd {
    Complete,
    Fail(String),
    /// Never terminates on its own; only cancellation ends it.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub chunks: Vec<StreamingChunk>,
    pub end: ScriptEnd,
}

impl Script {
    pub fn new(chunks: Vec<StreamingChunk>) -> Self {
        Self {
            chunks,
            end: ScriptEnd::Complete,
        }
    }

    pub fn texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(StreamingChunk::text).collect())
    }

    pub fn hanging() -> Self {
        Self::new(Vec::new()).ending(ScriptEnd::Hang)
    }

    pub fn ending(mut self, end: ScriptEnd) -> Self {
        self.end = end;
        self
    }
}

/// Replays queued scripts in order and records every request it receives.
#[derive(Default)]
pub struct ScriptedEndpoint {
    scripts: Mutex<VecDeque<Script>>,
    predictions: Mutex<VecDeque<String>>,
    stream_requests: Mutex<Vec<InferenceRequest>>,
    predict_requests: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, script: Script) {
        lock(&self.scripts).push_back(script);
    }

    pub fn push_prediction(&self, prediction: impl Into<String>) {
        lock(&self.predictions).push_back(prediction.into());
    }

    pub fn stream_requests(&self) -> Vec<InferenceRequest> {
        lock(&self.stream_requests).clone()
    }

    pub fn predict_requests(&self) -> Vec<InferenceRequest> {
        lock(&self.predict_requests).clone()
    }

    async fn run_script(
        script: Script,
        event_tx: ChunkSender,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        for chunk in script.chunks {
            if event_tx.send(StreamEvent::Chunk(chunk)).is_err() {
                return;
            }
            tokio::task::yield_now().await;
        }

        match script.end {
            ScriptEnd::Complete => {
                let _ = event_tx.send(StreamEvent::Complete);
            }
            ScriptEnd::Fail(message) => {
                let _ = event_tx.send(StreamEvent::Failed(message));
            }
            ScriptEnd::Hang => {
                let _ = cancel_rx.await;
            }
        }
    }
}

impl InferenceEndpoint for ScriptedEndpoint {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn invoke_stream(&self, request: InferenceRequest) -> ProviderResult<ChunkStreamHandle> {
        let script = lock(&self.scripts)
            .pop_front()
            .context(ScriptExhaustedSnafu {
                stage: "scripted-invoke-stream",
                what: "stream scripts",
                request_id: request.id.clone(),
            })?;

        let (event_tx, stream, cancel_rx) = make_chunk_stream(request.id.clone());
        lock(&self.stream_requests).push(request);
        let worker: ProviderWorker = Box::pin(Self::run_script(script, event_tx, cancel_rx));

        Ok(ChunkStreamHandle { stream, worker })
    }

    fn predict<'a>(&'a self, request: InferenceRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            let prediction = lock(&self.predictions)
                .pop_front()
                .context(ScriptExhaustedSnafu {
                    stage: "scripted-predict",
                    what: "predictions",
                    request_id: request.id.clone(),
                })?;
            lock(&self.predict_requests).push(request);
            Ok(prediction)
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelDescriptor;
    use crate::provider::{Role, UnrecordedMessage};

    fn request(id: &str) -> InferenceRequest {
        InferenceRequest::new(
            ModelDescriptor::new("test-model"),
            vec![UnrecordedMessage::new(Role::User, "hi")],
            id,
        )
    }

    #[tokio::test]
    async fn replays_chunks_then_completion() {
        let endpoint = ScriptedEndpoint::new();
        endpoint.push_script(Script::texts(["a", "b"]));

        let ChunkStreamHandle { mut stream, worker } =
            endpoint.invoke_stream(request("/chat")).expect("script queued");
        tokio::spawn(worker);

        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk(StreamingChunk::text("a")),
                StreamEvent::Chunk(StreamingChunk::text("b")),
                StreamEvent::Complete,
            ]
        );
        assert_eq!(endpoint.stream_requests().len(), 1);
    }

    #[tokio::test]
    async fn hanging_script_ends_when_stream_is_cancelled() {
        let endpoint = ScriptedEndpoint::new();
        endpoint.push_script(Script::hanging());

        let ChunkStreamHandle { mut stream, worker } =
            endpoint.invoke_stream(request("/chat")).expect("script queued");
        let worker = tokio::spawn(worker);

        assert!(stream.cancel());
        worker.await.expect("worker finishes after cancel");
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn exhausted_script_queue_is_an_error() {
        let endpoint = ScriptedEndpoint::new();

        assert!(matches!(
            endpoint.invoke_stream(request("/chat")),
            Err(crate::ProviderError::ScriptExhausted { .. })
        ));
        assert!(endpoint.predict(request("/chat")).await.is_err());
    }
}
