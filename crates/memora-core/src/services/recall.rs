//! Recall: find the memories worth bringing into a reply to a message.
//!
//! Flow: generate search queries (falling back to the raw message), run
//! them in the user's scope, then optionally let a model pick the relevant
//! results. Ending with nothing is a normal outcome, and the reason says
//! whether nothing matched or everything was filtered out.

use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use memora_llm::{ChatMessage, ChatOptions};
use memora_models::{EmptyReason, MessageBlock, RecallOutcome, ScoredMemory};

use super::generation::{generate_text, TextGenerator};
use super::prompts;
use super::retrieval::{flatten_by_max_score, Retriever, SearchTarget};
use crate::Result;

static ANGLE_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<<(.*?)>>").expect("valid angle bracket regex"));

const NONE_MARKER: &str = "NONE";

/// Contents of every `<< ... >>` in `text`, trimmed, empties skipped.
pub fn angle_items(text: &str) -> Vec<String> {
    ANGLE_ITEM
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Model's choice among retrieved memories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Reply had no `<< >>` at all; keep everything.
    Unparseable,
    /// Only `NONE` was given.
    NoneRelevant,
    /// Selected ids in the model's order.
    Selected(Vec<String>),
}

pub fn parse_filter_reply(reply: &str) -> FilterDecision {
    let items = angle_items(reply);
    if items.is_empty() {
        return FilterDecision::Unparseable;
    }

    let mut ids: Vec<String> = Vec::new();
    for item in items {
        if item.eq_ignore_ascii_case(NONE_MARKER) || ids.contains(&item) {
            continue;
        }
        ids.push(item);
    }

    if ids.is_empty() {
        FilterDecision::NoneRelevant
    } else {
        FilterDecision::Selected(ids)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecallInput<'a> {
    pub org_id: &'a str,
    pub user_id: &'a str,
    pub agent_id: Option<&'a str>,
    pub latest_message: &'a str,
    pub preceding_messages: &'a [MessageBlock],
    pub when: DateTime<Utc>,
    pub filter: bool,
}

pub async fn recall(
    generator: &dyn TextGenerator,
    retriever: &Retriever,
    input: RecallInput<'_>,
    timeout: Duration,
) -> Result<RecallOutcome> {
    let queries = search_queries(generator, &input, timeout).await?;

    let target = SearchTarget::user(input.org_id, input.user_id, input.agent_id);
    let memories = flatten_by_max_score(retriever.search(target, &queries).await?);

    if memories.is_empty() {
        debug!(queries = queries.len(), "Recall found no matches");
        return Ok(RecallOutcome::Empty {
            reason: EmptyReason::NoMatches,
        });
    }

    if !input.filter {
        return Ok(RecallOutcome::Recalled {
            memories,
            filtered: false,
        });
    }

    filter_memories(generator, &input, &queries, memories, timeout).await
}

async fn search_queries(
    generator: &dyn TextGenerator,
    input: &RecallInput<'_>,
    timeout: Duration,
) -> Result<Vec<String>> {
    let messages = [
        ChatMessage::system(prompts::SEARCH_QUERIES_SYSTEM),
        ChatMessage::user(prompts::search_queries_input(
            input.latest_message,
            input.preceding_messages,
            input.when,
        )),
    ];
    let options = ChatOptions {
        max_tokens: 512,
        ..Default::default()
    };

    let reply = generate_text(generator, &messages, &options, timeout).await?;
    let queries = angle_items(&reply);

    if queries.is_empty() {
        debug!("No search queries generated; using the message itself");
        return Ok(vec![input.latest_message.to_string()]);
    }

    debug!(count = queries.len(), "Generated recall queries");
    Ok(queries)
}

async fn filter_memories(
    generator: &dyn TextGenerator,
    input: &RecallInput<'_>,
    queries: &[String],
    memories: Vec<ScoredMemory>,
    timeout: Duration,
) -> Result<RecallOutcome> {
    let shown: Vec<_> = memories.iter().map(|s| s.memory.clone()).collect();
    let messages = [
        ChatMessage::system(prompts::recall_filter_system(
            input.latest_message,
            queries,
            input.when,
        )),
        ChatMessage::user(prompts::recall_filter_input(&shown)),
        ChatMessage::assistant(prompts::RECALL_FILTER_PRIMER),
    ];

    let reply = generate_text(generator, &messages, &ChatOptions::default(), timeout).await?;

    match parse_filter_reply(&reply) {
        FilterDecision::Unparseable => {
            warn!("Recall filter reply had no ids; returning unfiltered results");
            Ok(RecallOutcome::Recalled {
                memories,
                filtered: false,
            })
        }
        FilterDecision::NoneRelevant => Ok(RecallOutcome::Empty {
            reason: EmptyReason::FilteredOut,
        }),
        FilterDecision::Selected(ids) => {
            let selected: Vec<ScoredMemory> = ids
                .iter()
                .filter_map(|id| memories.iter().find(|s| s.memory.id == *id).cloned())
                .collect();

            if selected.is_empty() {
                debug!("Recall filter selected only unknown ids");
                return Ok(RecallOutcome::Empty {
                    reason: EmptyReason::FilteredOut,
                });
            }
            Ok(RecallOutcome::Recalled {
                memories: selected,
                filtered: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_angle_items() {
        let reply = "<< Who is Ava >>\n  << Ava's trip >>\n<<   >>\nnoise";
        assert_eq!(angle_items(reply), vec!["Who is Ava", "Ava's trip"]);
    }

    #[test]
    fn test_multiline_item() {
        assert_eq!(angle_items("<< a\nb >>"), vec!["a\nb"]);
    }

    #[test]
    fn test_filter_reply_states() {
        assert_eq!(parse_filter_reply("nothing here"), FilterDecision::Unparseable);
        assert_eq!(
            parse_filter_reply("- Reason: off topic || << NONE >>"),
            FilterDecision::NoneRelevant
        );
        assert_eq!(
            parse_filter_reply("- Reason: x || << m2 >>\n- Reason: y || << m1 >>\n- Reason: z || << m2 >>"),
            FilterDecision::Selected(vec!["m2".to_string(), "m1".to_string()])
        );
    }

    #[test]
    fn test_none_mixed_with_ids_keeps_ids() {
        assert_eq!(
            parse_filter_reply("<< m1 >> << none >>"),
            FilterDecision::Selected(vec!["m1".to_string()])
        );
    }
}
