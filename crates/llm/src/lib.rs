use std::sync::Arc;

mod chunk;
mod http_endpoint;
mod model;
mod provider;
mod rig_adapter;
mod scripted;

pub use chunk::{NdjsonDecoder, STOP_REASON_END_TURN, STOP_REASON_MAX_TOKENS, StreamingChunk};
pub use http_endpoint::{HTTP_NDJSON_PROVIDER_ID, HttpNdjsonEndpoint};
pub use model::{DEFAULT_OPENAI_MODEL, Model, ModelCatalog, ModelDescriptor, default_openai_models};
pub use provider::{
    Attachment, AttachmentSource, BoxFuture, ChunkSender, ChunkStream, ChunkStreamHandle,
    InferenceEndpoint, InferenceRequest, ProviderConfig, ProviderError, ProviderResult,
    ProviderWorker, Role, StreamEvent, UnrecordedMessage, make_chunk_stream,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use scripted::{SCRIPTED_PROVIDER_ID, Script, ScriptEnd, ScriptedEndpoint};

pub fn create_endpoint(mut config: ProviderConfig) -> ProviderResult<Arc<dyn InferenceEndpoint>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        "ndjson" | "http" => {
            config.provider_id = HTTP_NDJSON_PROVIDER_ID.to_string();
            Ok(Arc::new(HttpNdjsonEndpoint::new(config)?))
        }
        SCRIPTED_PROVIDER_ID => Ok(Arc::new(ScriptedEndpoint::new())),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-endpoint",
            provider_id: config.provider_id,
        }),
    }
}
