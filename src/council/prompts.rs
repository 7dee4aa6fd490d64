//! Prompt construction for the three pipeline stages.
//!
//! The ranking prompt (stage 2) must only ever contain opaque labels,
//! never model identifiers. The chairman prompt (stage 3) is the final
//! authoritative step and deliberately attributes answers by model.

use super::aggregate::RANKING_MARKER;
use super::anonymize::AnonymizedEntry;
use crate::gateway::ChatMessage;
use crate::types::{AggregateEntry, Conversation, Message, StageOneResult, StageOutcome};

/// Maximum characters kept when a title falls back to the raw question.
const FALLBACK_TITLE_CHARS: usize = 48;

/// Stage 1 messages: prior completed exchanges plus the new question.
///
/// History stops at the first pending assistant turn - that placeholder is
/// the running job's own slot, and anything after it belongs to jobs still
/// queued behind this one. Failed or cancelled turns contribute no
/// assistant text, so a broken earlier job never pollutes later context.
pub fn stage1_messages(conversation: &Conversation) -> Vec<ChatMessage> {
    let mut history = Vec::new();
    for message in &conversation.messages {
        match message {
            Message::User(turn) => history.push(ChatMessage::user(turn.content.clone())),
            Message::Assistant(turn) => {
                if turn.pending {
                    break;
                }
                if let Some(f) = &turn.final_response {
                    history.push(ChatMessage::assistant(f.text.clone()));
                }
            }
        }
    }
    history
}

/// Stage 2 ranking prompt over anonymized responses.
pub fn ranking_prompt(question: &str, entries: &[AnonymizedEntry]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are evaluating anonymized answers to a user's question. \
         You do not know which system produced which answer.\n\n",
    );
    prompt.push_str(&format!("Question:\n{question}\n\n"));
    prompt.push_str("Answers:\n\n");
    for entry in entries {
        prompt.push_str(&format!("### {}\n{}\n\n", entry.label, entry.text));
    }
    prompt.push_str(&format!(
        "Evaluate each answer for accuracy, completeness, and clarity, and \
         briefly justify your assessment. Then end your reply with a line \
         reading exactly \"{RANKING_MARKER}\" followed by a numbered list of \
         the answer labels from best to worst. Every label must appear \
         exactly once.\n",
    ));
    prompt
}

/// Stage 3 chairman prompt: attributed answers plus the aggregate ranking.
pub fn chairman_prompt(
    question: &str,
    stage1: &[StageOneResult],
    aggregate: &[AggregateEntry],
) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are the chairman of a council of AI models. Each council member \
         answered the user's question independently, then the members ranked \
         each other's answers anonymously. Synthesize the single best final \
         answer for the user.\n\n",
    );
    prompt.push_str(&format!("Question:\n{question}\n\n"));
    prompt.push_str("Council answers:\n\n");
    for result in stage1 {
        if let StageOutcome::Answered { text, .. } = &result.outcome {
            prompt.push_str(&format!("### {}\n{}\n\n", result.model, text));
        }
    }

    if aggregate.is_empty() {
        prompt.push_str(
            "No peer ranking is available for this round; weigh the answers \
             on their merits alone.\n\n",
        );
    } else {
        prompt.push_str("Peer ranking (best to worst, by mean rank):\n");
        for (i, entry) in aggregate.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. {} (mean rank {:.2}, {} votes)\n",
                i + 1,
                entry.model,
                entry.mean_rank,
                entry.votes
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "Respond with the final answer only - do not describe the council \
         process or mention the ranking.\n",
    );
    prompt
}

/// Title prompt for the first exchange of a conversation.
pub fn title_prompt(question: &str) -> String {
    format!(
        "Generate a short title (at most 6 words) for a conversation that \
         starts with this question. Reply with the title only, no quotes:\n\n{question}"
    )
}

/// Fallback title when the title model is unavailable: the truncated question.
pub fn fallback_title(question: &str) -> String {
    let trimmed = question.trim();
    match trimmed.char_indices().nth(FALLBACK_TITLE_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx].trim_end()),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistantTurn, FinalResponse, UserTurn};
    use chrono::Utc;

    fn entry(label: &str, model: &str, text: &str) -> AnonymizedEntry {
        AnonymizedEntry {
            label: label.to_string(),
            model: model.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_ranking_prompt_never_leaks_model_ids() {
        let entries = vec![
            entry("Response A", "openai/gpt-5.1", "first answer"),
            entry("Response B", "x-ai/grok-4", "second answer"),
        ];
        let prompt = ranking_prompt("what is 2+2?", &entries);

        assert!(prompt.contains("Response A"));
        assert!(prompt.contains("Response B"));
        assert!(prompt.contains("first answer"));
        assert!(!prompt.contains("openai/gpt-5.1"));
        assert!(!prompt.contains("x-ai/grok-4"));
        assert!(prompt.contains(RANKING_MARKER));
    }

    #[test]
    fn test_chairman_prompt_attributes_models() {
        let stage1 = vec![
            StageOneResult {
                model: "openai/gpt-5.1".to_string(),
                outcome: StageOutcome::Answered {
                    text: "four".to_string(),
                    cost: 0.0,
                    latency_ms: 10,
                    generation_id: None,
                },
            },
            StageOneResult {
                model: "x-ai/grok-4".to_string(),
                outcome: StageOutcome::Failed {
                    error: "timeout".to_string(),
                },
            },
        ];
        let aggregate = vec![AggregateEntry {
            model: "openai/gpt-5.1".to_string(),
            label: "Response A".to_string(),
            mean_rank: 0.0,
            votes: 1,
        }];
        let prompt = chairman_prompt("what is 2+2?", &stage1, &aggregate);

        assert!(prompt.contains("openai/gpt-5.1"));
        assert!(prompt.contains("four"));
        // Failed members contribute no answer section.
        assert!(!prompt.contains("x-ai/grok-4\nfour"));
        assert!(!prompt.contains("timeout"));
        assert!(prompt.contains("mean rank 0.00"));
    }

    #[test]
    fn test_chairman_prompt_degrades_without_ranking() {
        let stage1 = vec![StageOneResult {
            model: "openai/gpt-5.1".to_string(),
            outcome: StageOutcome::Answered {
                text: "four".to_string(),
                cost: 0.0,
                latency_ms: 10,
                generation_id: None,
            },
        }];
        let prompt = chairman_prompt("what is 2+2?", &stage1, &[]);
        assert!(prompt.contains("No peer ranking is available"));
    }

    #[test]
    fn test_stage1_messages_skip_incomplete_turns() {
        let now = Utc::now();
        let conversation = Conversation {
            id: "c1".to_string(),
            created_at: now,
            title: "t".to_string(),
            messages: vec![
                Message::User(UserTurn {
                    content: "first question".to_string(),
                    created_at: now,
                }),
                Message::Assistant(AssistantTurn {
                    final_response: Some(FinalResponse {
                        model: "chairman".to_string(),
                        text: "first answer".to_string(),
                        cost: 0.0,
                        generation_id: None,
                    }),
                    pending: false,
                    ..AssistantTurn::placeholder(now)
                }),
                Message::User(UserTurn {
                    content: "second question".to_string(),
                    created_at: now,
                }),
                // The new job's own placeholder.
                Message::Assistant(AssistantTurn::placeholder(now)),
            ],
            total_cost: 0.0,
        };

        let messages = stage1_messages(&conversation);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "first answer");
        assert_eq!(messages[2].content, "second question");
    }

    #[test]
    fn test_stage1_messages_exclude_queued_siblings() {
        // Two submissions queued before either job ran: the first job's
        // history must stop at its own placeholder and never include the
        // second question.
        let now = Utc::now();
        let conversation = Conversation {
            id: "c1".to_string(),
            created_at: now,
            title: "t".to_string(),
            messages: vec![
                Message::User(UserTurn {
                    content: "first question".to_string(),
                    created_at: now,
                }),
                Message::Assistant(AssistantTurn::placeholder(now)),
                Message::User(UserTurn {
                    content: "second question".to_string(),
                    created_at: now,
                }),
                Message::Assistant(AssistantTurn::placeholder(now)),
            ],
            total_cost: 0.0,
        };

        let messages = stage1_messages(&conversation);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "first question");
    }

    #[test]
    fn test_fallback_title_truncates_long_questions() {
        let short = fallback_title("Why is the sky blue?");
        assert_eq!(short, "Why is the sky blue?");

        let long = fallback_title(&"x".repeat(100));
        assert!(long.ends_with("..."));
        assert!(long.chars().count() <= FALLBACK_TITLE_CHARS + 3);
    }
}
