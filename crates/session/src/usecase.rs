use std::fmt;

use gencase_storage::ChatId;

/// Opaque conversation key, usually the current route (`/chat`, `/rag`, `/chat/<id>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key used when a persisted chat is opened directly.
    pub fn for_chat(chat_id: ChatId) -> Self {
        Self(format!("/chat/{chat_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn use_case(&self) -> UseCase {
        UseCase::from_route(&self.0)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which generative feature a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UseCase {
    Chat,
    Summarize,
    Translate,
    Rag,
    Diagram,
    Slide,
    Writer,
    Image,
    PromptBuilder,
    Custom(String),
}

impl UseCase {
    /// Resolves the use case from the first path segment of a route.
    pub fn from_route(route: &str) -> Self {
        let segment = route
            .split('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or_default();

        match segment {
            "" | "chat" => Self::Chat,
            "summarize" => Self::Summarize,
            "translate" => Self::Translate,
            "rag" => Self::Rag,
            "diagram" => Self::Diagram,
            "slide" => Self::Slide,
            "writer" => Self::Writer,
            "image" => Self::Image,
            "prompt-builder" => Self::PromptBuilder,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Tag stamped on persisted messages.
    pub fn tag(&self) -> &str {
        match self {
            Self::Chat => "chat",
            Self::Summarize => "summarize",
            Self::Translate => "translate",
            Self::Rag => "rag",
            Self::Diagram => "diagram",
            Self::Slide => "slide",
            Self::Writer => "writer",
            Self::Image => "image",
            Self::PromptBuilder => "prompt-builder",
            Self::Custom(tag) => tag,
        }
    }
}

impl fmt::Display for UseCase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_resolves_by_first_segment() {
        assert_eq!(UseCase::from_route("/rag"), UseCase::Rag);
        assert_eq!(UseCase::from_route("/chat/0190c3b4"), UseCase::Chat);
        assert_eq!(UseCase::from_route("/"), UseCase::Chat);
        assert_eq!(UseCase::from_route("prompt-builder/run"), UseCase::PromptBuilder);
        assert_eq!(
            UseCase::from_route("/video-analyzer"),
            UseCase::Custom("video-analyzer".to_string())
        );
    }

    #[test]
    fn chat_key_maps_back_to_chat_use_case() {
        let key = SessionKey::for_chat(ChatId::new_v7());
        assert!(key.as_str().starts_with("/chat/"));
        assert_eq!(key.use_case().tag(), "chat");
    }
}
