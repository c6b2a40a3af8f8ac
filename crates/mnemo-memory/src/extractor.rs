use std::sync::Arc;

use mnemo_agents::{GenerationRequest, ModelRouter};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Minimum length before a message is worth sending to the model at all.
const MIN_MESSAGE_LEN: usize = 10;

/// A memory record proposed by the model for a user utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMemory {
    pub content: String,
    pub category: String,
    pub importance: i64,
}

/// Lightweight facts about the user that sharpen extraction.
#[derive(Debug, Clone, Default)]
pub struct ExtractionContext {
    pub username: Option<String>,
    pub language: Option<String>,
}

/// Asks a model to pull structured memory records out of a user message.
///
/// The response is parsed defensively: the outermost JSON array is located,
/// elements missing required fields are dropped, and any failure at all
/// produces an empty list rather than an error.
pub struct MemoryExtractor {
    router: Arc<ModelRouter>,
}

impl MemoryExtractor {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self { router }
    }

    pub async fn extract(
        &self,
        user_message: &str,
        context: Option<&ExtractionContext>,
    ) -> Vec<ExtractedMemory> {
        if user_message.trim().len() < MIN_MESSAGE_LEN {
            return Vec::new();
        }

        let prompt = build_extraction_prompt(user_message, context);
        let mut request = GenerationRequest::from_prompt(prompt);
        // Deterministic parsing beats creative phrasing here.
        request.options.temperature = 0.2;
        request.options.max_tokens = 500;
        request.options.bypass_cache = true;

        match self.router.generate(&request, true).await {
            Ok((response, model)) => {
                let memories = parse_extraction_response(&response);
                debug!(
                    model,
                    count = memories.len(),
                    "extracted memories from message"
                );
                memories
            }
            Err(e) => {
                warn!("memory extraction failed: {e}");
                Vec::new()
            }
        }
    }
}

fn build_extraction_prompt(user_message: &str, context: Option<&ExtractionContext>) -> String {
    let mut context_block = String::new();
    if let Some(context) = context {
        let mut lines = Vec::new();
        if let Some(username) = &context.username {
            lines.push(format!("- username: {username}"));
        }
        if let Some(language) = &context.language {
            lines.push(format!("- language: {language}"));
        }
        if !lines.is_empty() {
            context_block = format!("User context:\n{}\n\n", lines.join("\n"));
        }
    }

    format!(
        "You are an AI assistant that extracts important information from user messages \
         that should be remembered for future conversations.\n\
         \n\
         Extract facts, preferences, personal details, and other important information \
         from the following message. Focus on information that would be useful to \
         remember later.\n\
         \n\
         For each piece of information, provide:\n\
         1. The exact content to remember\n\
         2. The category (personal, preference, fact, event, relationship, etc.)\n\
         3. An importance score (1-5, where 5 is most important)\n\
         \n\
         Format your response as a JSON array of objects:\n\
         [\n\
           {{\"content\": \"The exact information to remember\", \
            \"category\": \"category_name\", \"importance\": importance_score}}\n\
         ]\n\
         \n\
         If there's nothing worth remembering, return an empty array: []\n\
         \n\
         {context_block}User message: {user_message}\n\
         \n\
         Extracted memories (JSON format):"
    )
}

fn parse_extraction_response(response: &str) -> Vec<ExtractedMemory> {
    let response = response.trim();
    if response.is_empty() || response == "[]" {
        return Vec::new();
    }

    let (start, end) = match (response.find('['), response.rfind(']')) {
        (Some(start), Some(end)) if end > start => (start, end),
        _ => {
            warn!("no JSON array found in extraction response");
            return Vec::new();
        }
    };

    let parsed: Vec<serde_json::Value> = match serde_json::from_str(&response[start..=end]) {
        Ok(values) => values,
        Err(e) => {
            warn!("failed to parse extraction response: {e}");
            return Vec::new();
        }
    };

    parsed
        .into_iter()
        .filter_map(|value| {
            let content = value.get("content")?.as_str()?.to_string();
            let category = value.get("category")?.as_str()?.to_string();
            let importance = value.get("importance")?.as_i64()?;
            if content.is_empty() {
                return None;
            }
            Some(ExtractedMemory {
                content,
                category,
                importance: importance.clamp(1, 5),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{ExtractionContext, build_extraction_prompt, parse_extraction_response};

    #[test]
    fn parses_a_clean_json_array() {
        let memories = parse_extraction_response(
            r#"[{"content": "Has a dog named Max", "category": "personal", "importance": 3}]"#,
        );
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "Has a dog named Max");
        assert_eq!(memories[0].category, "personal");
        assert_eq!(memories[0].importance, 3);
    }

    #[test]
    fn tolerates_prose_around_the_array() {
        let memories = parse_extraction_response(
            "Here is what I found:\n\
             [{\"content\": \"Works as a teacher\", \"category\": \"fact\", \"importance\": 4}]\n\
             Let me know if you need more.",
        );
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "Works as a teacher");
    }

    #[test]
    fn clamps_importance_into_range() {
        let memories = parse_extraction_response(
            r#"[{"content": "a", "category": "fact", "importance": 12},
                {"content": "b", "category": "fact", "importance": -3}]"#,
        );
        assert_eq!(memories[0].importance, 5);
        assert_eq!(memories[1].importance, 1);
    }

    #[test]
    fn drops_elements_missing_required_fields() {
        let memories = parse_extraction_response(
            r#"[{"content": "keep me", "category": "fact", "importance": 2},
                {"content": "no category", "importance": 2},
                {"category": "fact", "importance": 2}]"#,
        );
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "keep me");
    }

    #[test]
    fn garbage_yields_an_empty_list() {
        assert!(parse_extraction_response("").is_empty());
        assert!(parse_extraction_response("[]").is_empty());
        assert!(parse_extraction_response("I could not find anything.").is_empty());
        assert!(parse_extraction_response("[{not json").is_empty());
    }

    #[test]
    fn prompt_includes_context_lines_when_present() {
        let context = ExtractionContext {
            username: Some("alice".into()),
            language: Some("en".into()),
        };
        let prompt = build_extraction_prompt("I moved to Lisbon", Some(&context));
        assert!(prompt.contains("- username: alice"));
        assert!(prompt.contains("User message: I moved to Lisbon"));

        let bare = build_extraction_prompt("I moved to Lisbon", None);
        assert!(!bare.contains("User context"));
    }
}
