//! Tool windowing: selecting a bounded candidate set for one turn.
//!
//! A busy domain can advertise far more tools than fit in an LLM prompt.
//! The classifier takes the full tool universe and the natural-language
//! query and returns an ordered subset of at most N names.
//!
//! The shipped strategy is [`LlmClassifier`]: one compact LLM call listing
//! the tool descriptions. There is deliberately no keyword-only strategy,
//! since lexical matching alone produces brittle classifications, but the
//! classifier degrades deterministically: any ranker failure falls back to
//! "match all", and a default-capable agent is always part of the returned
//! set.

use std::sync::Arc;

use async_trait::async_trait;

use crate::genesis::config::ToolChoiceMode;
use crate::genesis::llm_adapter::{ChatMessage, LlmAdapter};

/// Compact view of one tool, enough to rank it.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub classification_tags: Vec<String>,
    /// Default-capable agents are always included in the candidate set.
    pub default_capable: bool,
}

/// Ranking strategy for tool windowing.
///
/// Implementations must be total: on internal failure they return the full
/// universe rather than an error.
#[async_trait]
pub trait ToolClassifier: Send + Sync {
    /// Return an ordered subset of at most `limit` tool names drawn from
    /// `universe` (default-capable entries may exceed the limit).
    async fn classify(
        &self,
        query: &str,
        universe: &[ToolDescriptor],
        limit: usize,
    ) -> Vec<String>;
}

/// The deterministic fallback: every tool, in universe order.
pub struct MatchAllClassifier;

#[async_trait]
impl ToolClassifier for MatchAllClassifier {
    async fn classify(
        &self,
        _query: &str,
        universe: &[ToolDescriptor],
        _limit: usize,
    ) -> Vec<String> {
        universe.iter().map(|tool| tool.name.clone()).collect()
    }
}

/// LLM-scored relevance ranking through one compact prompt.
pub struct LlmClassifier {
    adapter: Arc<dyn LlmAdapter>,
}

impl LlmClassifier {
    pub fn new(adapter: Arc<dyn LlmAdapter>) -> Self {
        Self { adapter }
    }

    fn prompt(query: &str, universe: &[ToolDescriptor], limit: usize) -> Vec<ChatMessage> {
        let mut listing = String::new();
        for tool in universe {
            listing.push_str("- ");
            listing.push_str(&tool.name);
            listing.push_str(": ");
            listing.push_str(&tool.description);
            if !tool.classification_tags.is_empty() {
                listing.push_str(" [");
                listing.push_str(&tool.classification_tags.join(", "));
                listing.push(']');
            }
            listing.push('\n');
        }
        let system = format!(
            "You rank tools by relevance to a request. Reply with a JSON array \
             of at most {} tool names from the list, most relevant first. \
             Reply with the JSON array only.",
            limit
        );
        let user = format!("Request: {}\n\nTools:\n{}", query, listing);
        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    /// Pull the first JSON array of strings out of the response text.
    fn parse_names(text: &str) -> Option<Vec<String>> {
        let start = text.find('[')?;
        let end = text[start..].find(']')? + start;
        let names: Vec<String> = serde_json::from_str(&text[start..=end]).ok()?;
        Some(names)
    }
}

#[async_trait]
impl ToolClassifier for LlmClassifier {
    async fn classify(
        &self,
        query: &str,
        universe: &[ToolDescriptor],
        limit: usize,
    ) -> Vec<String> {
        if universe.len() <= limit {
            return universe.iter().map(|tool| tool.name.clone()).collect();
        }

        let messages = Self::prompt(query, universe, limit);
        let ranked = match self
            .adapter
            .call(&messages, &[], ToolChoiceMode::None)
            .await
        {
            Ok(response) => self
                .adapter
                .extract_text(&response)
                .and_then(|text| Self::parse_names(&text)),
            Err(e) => {
                log::warn!("classifier LLM call failed, matching all tools: {}", e);
                None
            }
        };

        let mut selected = match ranked {
            Some(names) => {
                // Keep only names that exist, preserve ranking order, drop
                // duplicates, cap at the limit.
                let mut seen = Vec::new();
                for name in names {
                    if seen.len() >= limit {
                        break;
                    }
                    if universe.iter().any(|tool| tool.name == name)
                        && !seen.contains(&name)
                    {
                        seen.push(name);
                    }
                }
                if seen.is_empty() {
                    // An unusable ranking is a ranker failure.
                    universe.iter().map(|tool| tool.name.clone()).collect()
                } else {
                    seen
                }
            }
            None => universe.iter().map(|tool| tool.name.clone()).collect(),
        };

        // A default-capable agent is always present, even past the limit.
        for tool in universe {
            if tool.default_capable && !selected.contains(&tool.name) {
                selected.push(tool.name.clone());
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::llm_adapter::{LlmResponse, ToolDefinition};
    use serde_json::json;
    use std::error::Error;

    fn universe() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "add".to_string(),
                description: "adds numbers".to_string(),
                classification_tags: vec!["math".to_string()],
                default_capable: false,
            },
            ToolDescriptor {
                name: "weather".to_string(),
                description: "weather lookups".to_string(),
                classification_tags: vec!["weather".to_string()],
                default_capable: false,
            },
            ToolDescriptor {
                name: "ask_primary".to_string(),
                description: "general-purpose agent".to_string(),
                classification_tags: vec![],
                default_capable: true,
            },
        ]
    }

    struct Scripted {
        reply: String,
    }

    #[async_trait]
    impl LlmAdapter for Scripted {
        async fn call(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _tool_choice: ToolChoiceMode,
        ) -> Result<LlmResponse, Box<dyn Error + Send + Sync>> {
            Ok(LlmResponse {
                message: ChatMessage::assistant(self.reply.clone()),
                finish_reason: Some("stop".to_string()),
                raw: json!({}),
            })
        }
    }

    struct Broken;

    #[async_trait]
    impl LlmAdapter for Broken {
        async fn call(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _tool_choice: ToolChoiceMode,
        ) -> Result<LlmResponse, Box<dyn Error + Send + Sync>> {
            Err("provider down".into())
        }
    }

    #[tokio::test]
    async fn ranked_subset_keeps_order_and_default_capable() {
        let classifier = LlmClassifier::new(Arc::new(Scripted {
            reply: "[\"weather\", \"add\"]".to_string(),
        }));
        let selected = classifier.classify("weather in Tokyo", &universe(), 1).await;
        assert_eq!(selected[0], "weather");
        assert!(selected.contains(&"ask_primary".to_string()));
    }

    #[tokio::test]
    async fn ranker_failure_falls_back_to_all() {
        let classifier = LlmClassifier::new(Arc::new(Broken));
        let selected = classifier.classify("anything", &universe(), 1).await;
        assert_eq!(selected.len(), 3);
    }

    #[tokio::test]
    async fn unparseable_ranking_falls_back_to_all() {
        let classifier = LlmClassifier::new(Arc::new(Scripted {
            reply: "I think the best tool is the weather one.".to_string(),
        }));
        let selected = classifier.classify("anything", &universe(), 1).await;
        assert_eq!(selected.len(), 3);
    }
}
