use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::provider::{DecodeChunkSnafu, ProviderResult};

pub const STOP_REASON_END_TURN: &str = "end_turn";
pub const STOP_REASON_MAX_TOKENS: &str = "max_tokens";

/// One incremental unit of streamed model output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingChunk {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl StreamingChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn stop(stop_reason: impl Into<String>) -> Self {
        Self {
            stop_reason: Some(stop_reason.into()),
            ..Self::default()
        }
    }

    pub fn trace(trace: impl Into<String>) -> Self {
        Self {
            trace: Some(trace.into()),
            ..Self::default()
        }
    }

    pub fn with_stop_reason(mut self, stop_reason: impl Into<String>) -> Self {
        self.stop_reason = Some(stop_reason.into());
        self
    }

    /// Stop reason, ignoring the empty strings some endpoints send mid-stream.
    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason
            .as_deref()
            .filter(|stop_reason| !stop_reason.is_empty())
    }

    pub fn trace_text(&self) -> Option<&str> {
        self.trace.as_deref().filter(|trace| !trace.is_empty())
    }
}

/// Splits a newline-delimited JSON byte stream into [`StreamingChunk`]s.
///
/// Network reads may cut a line (or a UTF-8 sequence) anywhere, so bytes are
/// held until their terminating newline arrives.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    pending: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<ProviderResult<StreamingChunk>> {
        self.pending.extend_from_slice(bytes);

        let mut decoded = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline).collect::<Vec<_>>();
            if let Some(chunk) = decode_line(&line) {
                decoded.push(chunk);
            }
        }

        decoded
    }

    /// Decodes a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<ProviderResult<StreamingChunk>> {
        let line = std::mem::take(&mut self.pending);
        decode_line(&line)
    }
}

fn decode_line(line: &[u8]) -> Option<ProviderResult<StreamingChunk>> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }

    Some(
        serde_json::from_slice::<StreamingChunk>(trimmed).context(DecodeChunkSnafu {
            stage: "ndjson-decode-line",
            line: String::from_utf8_lossy(trimmed).into_owned(),
        }),
    )
}
