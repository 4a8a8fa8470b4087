use gencase_llm::Role;

use crate::message::Message;
use crate::usecase::UseCase;

/// Supplies the text of system prompts. Implementations must be pure.
pub trait PromptTemplates: Send + Sync {
    fn system_context(&self, use_case: &UseCase) -> String;
    /// System prompt for the background title prediction.
    fn title_prompt(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPromptTemplates;

impl PromptTemplates for DefaultPromptTemplates {
    fn system_context(&self, use_case: &UseCase) -> String {
        match use_case {
            UseCase::Chat => "You are a helpful assistant.".to_string(),
            UseCase::Summarize => "Summarize the given text.".to_string(),
            UseCase::Translate => "Translate the given text.".to_string(),
            UseCase::Rag => "Answer using only the quoted documents and cite them.".to_string(),
            UseCase::Diagram => "Describe the requested diagram as code.".to_string(),
            UseCase::Slide => "Draft slides for the requested topic.".to_string(),
            UseCase::Writer => "Help the user write and edit text.".to_string(),
            UseCase::Image => "Write an image generation prompt.".to_string(),
            UseCase::PromptBuilder => "Follow the user's prompt exactly.".to_string(),
            UseCase::Custom(name) => format!("You are the {name} assistant."),
        }
    }

    fn title_prompt(&self) -> String {
        "Reply with a short title for this conversation and nothing else.".to_string()
    }
}

const OUTPUT_OPEN_TAG: &str = "<output>";
const OUTPUT_CLOSE_TAG: &str = "</output>";

pub fn strip_output_tags(content: &str) -> String {
    content.replace(OUTPUT_OPEN_TAG, "").replace(OUTPUT_CLOSE_TAG, "")
}

/// Strips output tags from streamed text as it arrives.
///
/// A trailing fragment that could still grow into a tag is held back until
/// the next push or `finish`.
#[derive(Debug, Default)]
pub struct OutputTagScrubber {
    raw: String,
    emitted: usize,
}

impl OutputTagScrubber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the text that became visible with `delta`.
    pub fn push(&mut self, delta: &str) -> String {
        self.raw.push_str(delta);
        let visible = strip_output_tags(&self.raw);
        let ready = visible.len() - partial_tag_len(&visible);
        self.take(&visible, ready)
    }

    /// Releases any held-back fragment.
    pub fn finish(&mut self) -> String {
        let visible = strip_output_tags(&self.raw);
        let ready = visible.len();
        self.take(&visible, ready)
    }

    fn take(&mut self, visible: &str, ready: usize) -> String {
        let fresh = visible
            .get(self.emitted..ready)
            .unwrap_or_default()
            .to_string();
        self.emitted = self.emitted.max(ready);
        fresh
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of an output tag.
fn partial_tag_len(text: &str) -> usize {
    [OUTPUT_OPEN_TAG, OUTPUT_CLOSE_TAG]
        .iter()
        .flat_map(|tag| (1..tag.len()).filter(move |len| text.ends_with(&tag[..*len])))
        .max()
        .unwrap_or(0)
}

/// Removes `[^n]` markers and `[^n]: ...` definition lines.
pub fn strip_footnotes(content: &str) -> String {
    let kept = content
        .lines()
        .filter(|line| !is_footnote_definition(line))
        .collect::<Vec<_>>()
        .join("\n");

    let mut stripped = String::with_capacity(kept.len());
    let mut rest = kept.as_str();
    while let Some(start) = rest.find("[^") {
        stripped.push_str(&rest[..start]);
        let marker = &rest[start + 2..];
        match marker.find(']') {
            Some(end) if end > 0 && !marker[..end].contains(char::is_whitespace) => {
                rest = &marker[end + 1..];
            }
            _ => {
                stripped.push_str("[^");
                rest = marker;
            }
        }
    }
    stripped.push_str(rest);

    stripped.trim_end().to_string()
}

/// Pre-process step for RAG sessions: earlier answers are sent back without footnotes.
pub fn strip_assistant_footnotes(mut messages: Vec<Message>) -> Vec<Message> {
    for message in messages
        .iter_mut()
        .filter(|message| message.role == Role::Assistant)
    {
        message.content = strip_footnotes(&message.content);
    }
    messages
}

fn is_footnote_definition(line: &str) -> bool {
    let Some(rest) = line.trim_start().strip_prefix("[^") else {
        return false;
    };
    rest.find("]:").is_some_and(|end| end > 0)
}
