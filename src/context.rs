//! Token-budgeted prompt assembly.
//!
//! Providers differ in how they accept multi-turn history, so the assembler
//! flattens kept history into one framed user prompt. Every adapter then gets
//! the same two-part input: hoisted system messages plus a single user turn.

use crate::errors::{ChatError, ChatResult};
use crate::models::ModelSpec;
use crate::storage::{ConversationMessage, Role};

/// Character-based token heuristic: one token per four characters, rounded
/// up. Intentionally not a real tokenizer; this is the authoritative count
/// everywhere in the pipeline, including the hard context-window ceiling.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Most recent conversational messages kept when trimming history.
const MAX_KEPT_MESSAGES: usize = 20;

const HISTORY_PREAMBLE: &str =
    "The following is the conversation so far. Use it as context when responding to the current message.";

/// Fraction of the context window history may occupy; the rest is headroom
/// for the model's response. Expressed as numerator/denominator to keep the
/// budget in integer math.
const HISTORY_BUDGET_NUM: usize = 4;
const HISTORY_BUDGET_DEN: usize = 5;

fn history_budget(model: &ModelSpec) -> usize {
    model.context_window_tokens * HISTORY_BUDGET_NUM / HISTORY_BUDGET_DEN
}

/// Build the prompt for one request: validate limits, trim oldest history
/// first, and fold what remains into a single context-carrying user turn.
///
/// Returns `[system messages..., user prompt]`. System messages are never
/// dropped; if they no longer fit alongside the new message the whole
/// request is rejected as over-length.
pub fn assemble(
    model: &ModelSpec,
    history: &[ConversationMessage],
    new_message: &str,
) -> ChatResult<Vec<ConversationMessage>> {
    if new_message.chars().count() > model.max_message_length {
        return Err(ChatError::MessageTooLong {
            model: model.id.to_string(),
            limit: model.max_message_length,
        });
    }

    // Hard ceiling on the untrimmed total, independent of trimming below.
    let untrimmed_total: usize = history
        .iter()
        .map(|m| estimate_tokens(&m.content))
        .sum::<usize>()
        + estimate_tokens(new_message);
    if untrimmed_total > model.context_window_tokens {
        return Err(ChatError::ContextTooLong {
            model: model.id.to_string(),
        });
    }

    if history.is_empty() {
        return Ok(vec![ConversationMessage::user(new_message)]);
    }

    let system_messages: Vec<&ConversationMessage> =
        history.iter().filter(|m| m.role == Role::System).collect();
    let conversational: Vec<&ConversationMessage> = history
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();

    // Walk newest to oldest, seeded with the tokens the prompt must carry
    // regardless of history. Stop at the first message that would breach the
    // budget or the message cap; everything older is dropped.
    let budget = history_budget(model);
    let mut running = estimate_tokens(new_message)
        + system_messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum::<usize>();
    let mut kept: Vec<&ConversationMessage> = Vec::new();
    for message in conversational.iter().rev() {
        let cost = estimate_tokens(&message.content);
        if kept.len() >= MAX_KEPT_MESSAGES || running + cost >= budget {
            break;
        }
        running += cost;
        kept.push(message);
    }
    kept.reverse();

    let mut prompt = Vec::with_capacity(system_messages.len() + 1);
    prompt.extend(system_messages.iter().map(|m| (*m).clone()));

    if kept.is_empty() {
        // Nothing from the history fits; send the new message bare rather
        // than a framing block with no content.
        tracing::debug!(model = model.id, "history trimmed to nothing");
        prompt.push(ConversationMessage::user(new_message));
        return Ok(prompt);
    }

    tracing::debug!(
        model = model.id,
        kept = kept.len(),
        dropped = conversational.len() - kept.len(),
        "assembled context"
    );

    let mut text = String::from(HISTORY_PREAMBLE);
    text.push_str("\n\n");
    for message in &kept {
        let speaker = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => unreachable!("system messages are hoisted"),
        };
        text.push_str(speaker);
        text.push_str(": ");
        text.push_str(&message.content);
        text.push('\n');
    }
    text.push_str("\nCurrent message:\n");
    text.push_str(new_message);

    prompt.push(ConversationMessage::user(text));
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provider;

    fn test_model(context_window_tokens: usize, max_message_length: usize) -> ModelSpec {
        ModelSpec {
            id: "test-model",
            display_name: "Test Model",
            provider: Provider::Groq,
            is_free: true,
            context_window_tokens,
            max_message_length,
            max_output_tokens: 4_096,
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn empty_history_passes_message_through() {
        let model = test_model(1_000, 100);
        let prompt = assemble(&model, &[], "Hi").unwrap();
        assert_eq!(prompt, vec![ConversationMessage::user("Hi")]);
    }

    #[test]
    fn over_long_message_is_rejected() {
        let model = test_model(1_000, 10);
        let err = assemble(&model, &[], "this message is too long").unwrap_err();
        assert!(matches!(err, ChatError::MessageTooLong { limit: 10, .. }));
    }

    #[test]
    fn untrimmed_total_over_window_is_rejected() {
        let model = test_model(100, 10_000);
        // 600 chars of history ≈ 150 tokens, over the 100-token window even
        // though trimming could have discarded it.
        let history = vec![ConversationMessage::user("y".repeat(600))];
        let err = assemble(&model, &history, "Hi").unwrap_err();
        assert!(matches!(err, ChatError::ContextTooLong { .. }));
    }

    #[test]
    fn system_messages_are_hoisted_in_original_order() {
        let model = test_model(10_000, 1_000);
        let history = vec![
            ConversationMessage::user("first question"),
            ConversationMessage::system("rule one"),
            ConversationMessage::assistant("first answer"),
            ConversationMessage::system("rule two"),
        ];
        let prompt = assemble(&model, &history, "next").unwrap();
        assert_eq!(prompt.len(), 3);
        assert_eq!(prompt[0], ConversationMessage::system("rule one"));
        assert_eq!(prompt[1], ConversationMessage::system("rule two"));
        assert_eq!(prompt[2].role, Role::User);
    }

    #[test]
    fn history_is_folded_into_one_user_prompt() {
        let model = test_model(10_000, 1_000);
        let history = vec![
            ConversationMessage::user("What is Rust?"),
            ConversationMessage::assistant("A systems language."),
        ];
        let prompt = assemble(&model, &history, "Tell me more").unwrap();
        assert_eq!(prompt.len(), 1);
        assert_eq!(prompt[0].role, Role::User);
        let text = &prompt[0].content;
        assert!(text.starts_with(HISTORY_PREAMBLE));
        assert!(text.contains("User: What is Rust?"));
        assert!(text.contains("Assistant: A systems language."));
        assert!(text.ends_with("Current message:\nTell me more"));
        // History renders oldest to newest.
        assert!(
            text.find("What is Rust?").unwrap() < text.find("A systems language.").unwrap()
        );
    }

    #[test]
    fn oldest_messages_are_dropped_first() {
        // Window 110 → history budget 88. Ten 10-token messages plus a
        // 1-token new message: the untrimmed total (101) fits the window but
        // not the budget, so the two oldest messages are dropped.
        let model = test_model(110, 1_000);
        let history: Vec<ConversationMessage> = (0..10)
            .map(|i| ConversationMessage::user(format!("msg{i:02}-{}", "x".repeat(33))))
            .collect();
        let prompt = assemble(&model, &history, "go").unwrap();
        let text = &prompt[0].content;
        assert!(!text.contains("msg00"));
        assert!(!text.contains("msg01"));
        assert!(text.contains("msg02"));
        assert!(text.contains("msg09"));
    }

    #[test]
    fn kept_messages_are_capped() {
        let model = test_model(1_000_000, 1_000);
        let history: Vec<ConversationMessage> = (0..50)
            .map(|i| ConversationMessage::user(format!("message number {i}")))
            .collect();
        let prompt = assemble(&model, &history, "go").unwrap();
        let text = &prompt[0].content;
        let kept = (0..50)
            .filter(|i| text.contains(&format!("message number {i}\n")))
            .count();
        assert_eq!(kept, MAX_KEPT_MESSAGES);
        // The newest survives, the oldest does not.
        assert!(text.contains("message number 49"));
        assert!(!text.contains("message number 0\n"));
    }

    #[test]
    fn trimming_is_monotonic_under_extension() {
        let model = test_model(100, 1_000);
        let history: Vec<ConversationMessage> = (0..8)
            .map(|i| ConversationMessage::user(format!("turn{i:02}-{}", "y".repeat(32))))
            .collect();
        let kept_of = |h: &[ConversationMessage]| -> Vec<String> {
            let prompt = assemble(&model, h, "go").unwrap();
            (0..8)
                .filter(|i| prompt[0].content.contains(&format!("turn{i:02}")))
                .map(|i| format!("turn{i:02}"))
                .collect()
        };
        let base = kept_of(&history);
        let mut extended = vec![ConversationMessage::user(format!(
            "turn-old-{}",
            "z".repeat(32)
        ))];
        extended.extend(history.iter().cloned());
        let with_older = kept_of(&extended);
        // Prepending an older message never evicts a newer one.
        for name in &with_older {
            assert!(base.contains(name));
        }
    }

    #[test]
    fn unfittable_history_falls_back_to_bare_message() {
        // Window 200 → budget 160. The new message alone seeds 100 tokens,
        // so the single 75-token history message cannot be kept, yet the
        // untrimmed total (175) still fits the window.
        let model = test_model(200, 1_000);
        let history = vec![ConversationMessage::user("z".repeat(300))];
        let prompt = assemble(&model, &history, &"w".repeat(400)).unwrap();
        assert_eq!(prompt.len(), 1);
        assert_eq!(prompt[0].content, "w".repeat(400));
    }
}
