//! Candidate memory extraction from an interaction.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use memora_llm::ChatMessage;
use memora_models::{Memory, MessageBlock};

use super::generation::{generate_structured, GenerationError, TextGenerator};
use super::{placeholder, prompts};

/// A fact pulled from the conversation, not yet reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Text in stored placeholder form.
    pub text: String,
    /// Positions of the source messages, ascending.
    pub sources: Vec<usize>,
}

/// Everything the extraction step needs to know about one write.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionInput<'a> {
    pub user_id: &'a str,
    pub user_name: &'a str,
    pub agent_id: &'a str,
    pub agent_label: &'a str,
    pub messages: &'a [MessageBlock],
    /// Memories taken from an earlier version of the same interaction.
    pub previous: &'a [Memory],
    pub include_agent: bool,
    pub when: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ExtractedMemory {
    memory: String,
    #[serde(default)]
    msg_source_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    memories_first_pass: Option<Vec<ExtractedMemory>>,
    #[serde(default)]
    memories_second_pass: Option<Vec<ExtractedMemory>>,
    #[serde(default)]
    memories_third_pass: Option<Vec<ExtractedMemory>>,
}

impl ExtractionReply {
    fn into_passes(self) -> impl Iterator<Item = ExtractedMemory> {
        [
            self.memories_first_pass,
            self.memories_second_pass,
            self.memories_third_pass,
        ]
        .into_iter()
        .flatten()
        .flatten()
    }
}

/// Ask the model for candidate memories.
///
/// A reply that does not match the schema fails the whole step; nothing
/// from it is used.
pub async fn extract(
    generator: &dyn TextGenerator,
    input: ExtractionInput<'_>,
    timeout: Duration,
) -> Result<Vec<Candidate>, GenerationError> {
    if input.messages.is_empty() {
        return Ok(vec![]);
    }

    let messages = [
        ChatMessage::system(prompts::extraction_system(
            input.user_name,
            input.agent_label,
            input.include_agent,
            input.when,
        )),
        ChatMessage::user(prompts::extraction_input(input.messages, input.previous)),
    ];

    let reply: ExtractionReply =
        generate_structured(generator, &messages, prompts::extraction_schema(), timeout).await?;

    let candidates = merge_candidates(reply, input.user_id, input.agent_id, input.messages.len());
    debug!(count = candidates.len(), "Extracted candidate memories");
    Ok(candidates)
}

/// Flatten the passes, normalize placeholders, drop out-of-range sources and
/// merge identical texts.
fn merge_candidates(
    reply: ExtractionReply,
    user_id: &str,
    agent_id: &str,
    message_count: usize,
) -> Vec<Candidate> {
    let mut merged: Vec<(String, BTreeSet<usize>)> = Vec::new();

    for extracted in reply.into_passes() {
        let text = placeholder::to_stored(&extracted.memory, user_id, agent_id);
        if text.is_empty() {
            continue;
        }

        let mut sources = BTreeSet::new();
        for id in extracted.msg_source_ids {
            match usize::try_from(id) {
                Ok(pos) if pos < message_count => {
                    sources.insert(pos);
                }
                _ => warn!(source = id, message_count, "Dropping out-of-range message source"),
            }
        }

        match merged.iter_mut().find(|(existing, _)| *existing == text) {
            Some((_, existing_sources)) => existing_sources.extend(sources),
            None => merged.push((text, sources)),
        }
    }

    merged
        .into_iter()
        .map(|(text, sources)| Candidate {
            text,
            sources: sources.into_iter().collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const USER: &str = "AbCdEfGhJkLmNpQrStUvWx";
    const AGENT: &str = "ZyXwVuTsRqPnMkJhGfEdCb";

    fn reply(value: serde_json::Value) -> ExtractionReply {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_passes_are_merged_and_normalized() {
        let candidates = merge_candidates(
            reply(json!({
                "memories_first_pass": [
                    { "memory": "#user_#id# loves tacos", "msg_source_ids": [0] }
                ],
                "memories_second_pass": [
                    { "memory": "#user_#id# enjoys Mexican food", "msg_source_ids": [0] }
                ],
                "memories_third_pass": null
            })),
            USER,
            AGENT,
            1,
        );

        assert_eq!(
            candidates,
            vec![
                Candidate {
                    text: format!("user_{} loves tacos", USER),
                    sources: vec![0],
                },
                Candidate {
                    text: format!("user_{} enjoys Mexican food", USER),
                    sources: vec![0],
                },
            ]
        );
    }

    #[test]
    fn test_duplicates_union_sources() {
        let candidates = merge_candidates(
            reply(json!({
                "memories_first_pass": [
                    { "memory": "#user_#id# has a dog", "msg_source_ids": [2] }
                ],
                "memories_second_pass": [
                    { "memory": "#user_#id# has a dog", "msg_source_ids": [0, 2] }
                ]
            })),
            USER,
            AGENT,
            3,
        );

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].sources, vec![0, 2]);
    }

    #[test]
    fn test_out_of_range_sources_are_dropped() {
        let candidates = merge_candidates(
            reply(json!({
                "memories_first_pass": [
                    { "memory": "#user_#id# lives in Lagos", "msg_source_ids": [1, 7, -1] }
                ]
            })),
            USER,
            AGENT,
            2,
        );

        assert_eq!(candidates[0].sources, vec![1]);
    }

    #[test]
    fn test_missing_first_pass_is_empty() {
        let candidates = merge_candidates(reply(json!({})), USER, AGENT, 1);
        assert!(candidates.is_empty());
    }
}
