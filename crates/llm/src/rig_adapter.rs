use futures::StreamExt;
use rig::completion::{CompletionModel, CompletionRequestBuilder, Message as RigMessage};
use rig::message::AssistantContent;
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::chunk::{STOP_REASON_END_TURN, StreamingChunk};
use super::provider::{
    BoxFuture, ChunkSender, ChunkStreamHandle, CompletionsFailedSnafu, EmptyMessageSetSnafu,
    HttpClientSnafu, InferenceEndpoint, InferenceRequest, MissingApiKeySnafu, ProviderConfig,
    ProviderError, ProviderResult, ProviderWorker, Role, StreamEvent, UnrecordedMessage,
    make_chunk_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &UnrecordedMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &InferenceRequest) -> Option<String> {
        // Rig exposes a single preamble field, so system-role messages are folded into it.
        let preamble_parts = request
            .messages
            .iter()
            .filter(|message| matches!(message.role, Role::System))
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| message.content.clone())
            .collect::<Vec<_>>();

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    fn prepare_request<M>(
        model: M,
        config: &ProviderConfig,
        request: &InferenceRequest,
        stage: &'static str,
    ) -> ProviderResult<CompletionRequestBuilder<M>>
    where
        M: CompletionModel,
    {
        let attachment_count = request
            .messages
            .iter()
            .map(|message| message.extra_data.len())
            .sum::<usize>();
        if attachment_count > 0 {
            tracing::debug!(
                request_id = %request.id,
                attachment_count,
                "rig adapter sends text only; attachments are not forwarded"
            );
        }

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                request_id = %request.id,
                model_id = %request.model.model_id,
                total_message_count = request.messages.len(),
                "no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage,
                request_id: request.id.clone(),
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(max_tokens) = config.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        Ok(builder)
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &InferenceRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model.model_id.clone());
        Self::prepare_request(model, config, request, "open-stream-build-request")?
            .stream()
            .await
            .context(CompletionsFailedSnafu {
                stage: "open-stream",
            })
    }

    fn emit_error_event(event_tx: &ChunkSender, error: ProviderError) {
        let _ = event_tx.send(StreamEvent::Failed(error.to_string()));
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamingChunk>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => Some(StreamingChunk::text(text.text)),
            StreamedAssistantContent::Reasoning(reasoning) => {
                // Reasoning arrives in fragments; it belongs in the trace, never the answer.
                let text = reasoning.reasoning.join("");
                if text.is_empty() {
                    return None;
                }
                Some(StreamingChunk::trace(text))
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                if reasoning.is_empty() {
                    return None;
                }
                Some(StreamingChunk::trace(reasoning))
            }
            StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: InferenceRequest,
        event_tx: ChunkSender,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    request_id = %request.id,
                    provider_id = %config.provider_id,
                    model_id = %request.model.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, error);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(request_id = %request.id, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(chunk) = Self::map_stream_item(item)
                                && event_tx.send(StreamEvent::Chunk(chunk)).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                request_id = %request.id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        // Rig does not surface a provider-neutral finish reason.
        let _ = event_tx.send(StreamEvent::Chunk(StreamingChunk::stop(STOP_REASON_END_TURN)));
        let _ = event_tx.send(StreamEvent::Complete);
    }

    async fn run_predict(&self, request: InferenceRequest) -> ProviderResult<String> {
        let client = Self::build_client(&self.config)?;
        let model = client.completion_model(request.model.model_id.clone());
        let response = Self::prepare_request(model, &self.config, &request, "predict-build-request")?
            .send()
            .await
            .context(CompletionsFailedSnafu { stage: "predict" })?;

        let text = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(text)
    }
}

impl InferenceEndpoint for RigProviderAdapter {
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
