use gencase_llm::Role;

use crate::message::{Message, TurnStatus};

/// A generation continues the last turn when that turn was cut off by a token limit.
pub fn is_continuation(messages: &[Message]) -> bool {
    messages
        .last()
        .is_some_and(|message| message.role == Role::Assistant && message.status == TurnStatus::Truncated)
}

/// Picks the messages sent to the endpoint for the next generation.
///
/// A continuation keeps the trailing assistant turn, right-trimmed. Otherwise the
/// trailing placeholder is left out. With `ignore_history` only the system message
/// and the last two entries before that cut survive; index 0 is never repeated.
pub fn select_history(messages: &[Message], continuing: bool, ignore_history: bool) -> Vec<Message> {
    let end = if continuing {
        messages.len()
    } else {
        messages.len().saturating_sub(1)
    };

    let mut history = if ignore_history {
        let start = messages.len().saturating_sub(2).max(1);
        let mut history = messages.first().cloned().into_iter().collect::<Vec<_>>();
        if start < end {
            history.extend_from_slice(&messages[start..end]);
        }
        history
    } else {
        messages[..end].to_vec()
    };

    if continuing
        && let Some(last) = history.last_mut()
        && last.role == Role::Assistant
    {
        let trimmed = last.content.trim_end().len();
        last.content.truncate(trimmed);
    }

    history
}
