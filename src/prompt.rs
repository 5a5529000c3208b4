//! System prompt and message list for a chat turn.

use crate::citation::FragmentSet;
use crate::llm::LlmMessage;
use crate::models::{Message, Role};
use crate::profiles::rules_for;

const PREAMBLE: &str = "You are a document analysis assistant. Answer the user's question \
based on the following document fragments.\n\n";

const CONTINUE_INSTRUCTION: &str = "Continue your previous answer exactly where it stopped. \
Do not repeat text you already wrote and keep citing fragments with [n].";

pub struct PromptInput<'a> {
    pub fragments: &'a FragmentSet,
    pub model: &'a str,
    pub is_collection: bool,
    pub custom_instructions: Option<&'a str>,
    pub fragment_chars: usize,
}

/// Numbered fragment list, model-specific rules and optional instructions.
pub fn build_system_prompt(input: &PromptInput<'_>) -> String {
    let numbered: Vec<String> = input
        .fragments
        .iter()
        .map(|(n, f)| {
            let text: String = f.text.chars().take(input.fragment_chars).collect();
            match (&f.document_filename, input.is_collection) {
                (Some(name), true) => format!("[{}] (from: {}) {}", n, name, text),
                _ => format!("[{}] {}", n, text),
            }
        })
        .collect();

    let mut prompt = String::from(PREAMBLE);
    prompt.push_str("## Document Fragments\n");
    if numbered.is_empty() {
        prompt.push_str("(none)");
    } else {
        prompt.push_str(&numbered.join("\n"));
    }
    prompt.push_str("\n\n## Rules\n");
    prompt.push_str(&rules_for(input.model, input.is_collection));

    if let Some(instructions) = input.custom_instructions.map(str::trim) {
        if !instructions.is_empty() {
            prompt.push_str("\n## User Instructions\n");
            prompt.push_str(instructions);
            prompt.push('\n');
        }
    }
    prompt
}

/// History oldest first, then the new question. Empty history entries are
/// skipped since providers reject them.
pub fn build_messages(system: String, history: &[Message], question: &str) -> Vec<LlmMessage> {
    let mut messages = vec![LlmMessage::system(system)];
    messages.extend(
        history
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| LlmMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            }),
    );
    messages.push(LlmMessage {
        role: Role::User.as_str().to_string(),
        content: question.to_string(),
    });
    messages
}

/// Messages for continuing a truncated answer: the history that led to it,
/// the partial answer, then an instruction to carry on.
pub fn build_continuation_messages(
    system: String,
    history: &[Message],
    partial_answer: &str,
) -> Vec<LlmMessage> {
    let mut messages = build_messages(system, history, CONTINUE_INSTRUCTION);
    let instruction = messages.pop();
    messages.push(LlmMessage {
        role: Role::Assistant.as_str().to_string(),
        content: partial_answer.to_string(),
    });
    messages.extend(instruction);
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RetrievedFragment;

    fn fragment(text: &str, filename: Option<&str>) -> RetrievedFragment {
        RetrievedFragment {
            chunk_id: "c".into(),
            text: text.into(),
            page: 1,
            bboxes: vec![],
            similarity_score: 0.5,
            section_title: None,
            document_id: filename.map(|_| "d1".to_string()),
            document_filename: filename.map(str::to_string),
        }
    }

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: "m".into(),
            session_id: "s".into(),
            role,
            content: content.into(),
            citations: vec![],
            prompt_tokens: None,
            output_tokens: None,
            continuation_count: 0,
            created_at: 0,
        }
    }

    #[test]
    fn fragments_are_numbered_and_truncated() {
        let long = "y".repeat(2000);
        let frags = FragmentSet::sequential(vec![fragment("alpha", None), fragment(&long, None)]);
        let prompt = build_system_prompt(&PromptInput {
            fragments: &frags,
            model: "deepseek/deepseek-v3.2",
            is_collection: false,
            custom_instructions: None,
            fragment_chars: 1400,
        });
        assert!(prompt.contains("[1] alpha\n[2] "));
        assert!(prompt.contains(&"y".repeat(1400)));
        assert!(!prompt.contains(&"y".repeat(1401)));
        assert!(prompt.contains("## Rules\n1."));
        assert!(!prompt.contains("User Instructions"));
    }

    #[test]
    fn no_fragments_renders_placeholder() {
        let prompt = build_system_prompt(&PromptInput {
            fragments: &FragmentSet::default(),
            model: "unknown/model",
            is_collection: false,
            custom_instructions: Some("  "),
            fragment_chars: 1400,
        });
        assert!(prompt.contains("## Document Fragments\n(none)"));
        assert!(!prompt.contains("User Instructions"));
    }

    #[test]
    fn collection_prompt_labels_documents() {
        let frags = FragmentSet::numbered(vec![(3, fragment("beta", Some("report.pdf")))]);
        let prompt = build_system_prompt(&PromptInput {
            fragments: &frags,
            model: "unknown/model",
            is_collection: true,
            custom_instructions: Some("Answer in French."),
            fragment_chars: 1400,
        });
        assert!(prompt.contains("[3] (from: report.pdf) beta"));
        assert!(prompt.contains("mention which document"));
        assert!(prompt.contains("## User Instructions\nAnswer in French."));
    }

    #[test]
    fn messages_keep_history_order() {
        let history = vec![
            message(Role::User, "q1"),
            message(Role::Assistant, "a1"),
            message(Role::Assistant, ""),
        ];
        let msgs = build_messages("sys".into(), &history, "q2");
        let roles: Vec<&str> = msgs.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(msgs[3].content, "q2");
    }

    #[test]
    fn continuation_ends_with_instruction_after_partial_answer() {
        let history = vec![message(Role::User, "q1")];
        let msgs = build_continuation_messages("sys".into(), &history, "partial");
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[2].role, "assistant");
        assert_eq!(msgs[2].content, "partial");
        assert_eq!(msgs[3].role, "user");
        assert!(msgs[3].content.starts_with("Continue"));
    }
}
