use futures::StreamExt;
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::chunk::NdjsonDecoder;
use super::provider::{
    BoxFuture, ChunkSender, ChunkStreamHandle, EmptyMessageSetSnafu, HttpRequestSnafu,
    HttpStatusSnafu, InferenceEndpoint, InferenceRequest, MissingEndpointSnafu, ProviderConfig,
    ProviderResult, ProviderWorker, StreamEvent, make_chunk_stream,
};

pub const HTTP_NDJSON_PROVIDER_ID: &str = "ndjson";

const STREAM_PATH: &str = "/predict/stream";
const PREDICT_PATH: &str = "/predict";

/// Endpoint speaking newline-delimited JSON chunks over HTTP.
pub struct HttpNdjsonEndpoint {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpNdjsonEndpoint {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.endpoint.is_empty(),
            MissingEndpointSnafu {
                stage: "http-endpoint-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), path)
    }

    async fn send(
        client: &reqwest::Client,
        config: &ProviderConfig,
        url: &str,
        request: &InferenceRequest,
    ) -> ProviderResult<reqwest::Response> {
        let mut builder = client.post(url).json(request);
        if !config.api_key.is_empty() {
            builder = builder.bearer_auth(&config.api_key);
        }

        let response = builder.send().await.context(HttpRequestSnafu {
            stage: "http-send",
            url: url.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return HttpStatusSnafu {
                stage: "http-status",
                url: url.to_string(),
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        config: ProviderConfig,
        request: InferenceRequest,
        event_tx: ChunkSender,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let url = Self::url(&config.endpoint, STREAM_PATH);
        let response = tokio::select! {
            _ = &mut cancel_rx => return,
            response = Self::send(&client, &config, &url, &request) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    request_id = %request.id,
                    url = %url,
                    error = %error,
                    "failed to open ndjson stream"
                );
                let _ = event_tx.send(StreamEvent::Failed(error.to_string()));
                return;
            }
        };

        let mut body = response.bytes_stream();
        let mut decoder = NdjsonDecoder::new();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(request_id = %request.id, "ndjson stream cancelled");
                    return;
                }
                next_bytes = body.next() => {
                    match next_bytes {
                        Some(Ok(bytes)) => {
                            for decoded in decoder.push(&bytes) {
                                if !Self::forward(&event_tx, &request.id, decoded) {
                                    return;
                                }
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                request_id = %request.id,
                                error = %source,
                                "ndjson stream aborted mid-flight"
                            );
                            let _ = event_tx.send(StreamEvent::Failed(source.to_string()));
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        if let Some(decoded) = decoder.finish()
            && !Self::forward(&event_tx, &request.id, decoded)
        {
            return;
        }

        let _ = event_tx.send(StreamEvent::Complete);
    }

    /// Returns false once the stream should stop.
    fn forward(
        event_tx: &ChunkSender,
        request_id: &str,
        decoded: ProviderResult<super::chunk::StreamingChunk>,
    ) -> bool {
        match decoded {
            Ok(chunk) => event_tx.send(StreamEvent::Chunk(chunk)).is_ok(),
            Err(error) => {
                tracing::warn!(request_id = %request_id, error = %error, "dropping stream");
                let _ = event_tx.send(StreamEvent::Failed(error.to_string()));
                false
            }
        }
    }

    async fn run_predict(&self, request: InferenceRequest) -> ProviderResult<String> {
        let url = Self::url(&self.config.endpoint, PREDICT_PATH);
        let response = Self::send(&self.client, &self.config, &url, &request).await?;
        response.json::<String>().await.context(HttpRequestSnafu {
            stage: "predict-read-body",
            url,
        })
    }
}

impl InferenceEndpoint for HttpNdjsonEndpoint {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn invoke_stream(&self, request: InferenceRequest) -> ProviderResult<ChunkStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "invoke-stream",
                request_id: request.id.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_chunk_stream(request.id.clone());
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ChunkStreamHandle { stream, worker })
    }

    fn predict<'a>(&'a self, request: InferenceRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.run_predict(request))
    }
}
