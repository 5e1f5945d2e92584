//! Prompt text and reply schemas for the generation steps.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use memora_models::{Memory, MessageBlock};

use super::placeholder::{MODEL_AGENT_TOKEN, MODEL_USER_TOKEN};

fn timestamp(when: DateTime<Utc>) -> String {
    when.format("%A, %B %-d, %Y %H:%M UTC").to_string()
}

// ============================================================================
// Extraction
// ============================================================================

pub fn extraction_system(
    user_name: &str,
    agent_label: &str,
    include_agent: bool,
    when: DateTime<Utc>,
) -> String {
    let subject = if include_agent {
        format!("{} and {}", user_name, agent_label)
    } else {
        user_name.to_string()
    };

    format!(
        r#"It is {now}. Below is a conversation between the agent "{agent}" and the user "{user}".

Your job is to pull out facts about {subject} that would help personalize later conversations.

Rules:
- Only record what the conversation states or clearly implies. Never invent details.
- Skip small talk and anything that will obviously not matter later.
- Each memory is one self-contained statement of at most 25 words, in the right tense.
- Refer to "{user}" only as {user_token} and to "{agent}" only as {agent_token}.
- For every memory list the POSITION numbers of the messages it came from.
- Use the second and third passes for anything the earlier passes missed. Leave them empty otherwise.

Reply with a JSON object matching the response schema."#,
        now = timestamp(when),
        agent = agent_label,
        user = user_name,
        subject = subject,
        user_token = MODEL_USER_TOKEN,
        agent_token = MODEL_AGENT_TOKEN,
    )
}

pub fn extraction_input(messages: &[MessageBlock], previous: &[Memory]) -> String {
    let mut out = String::from("CONVERSATION\n");
    for (position, message) in messages.iter().enumerate() {
        out.push_str(&format!(
            "\nPOSITION {} | {}:\n{}\n",
            position, message.role, message.content
        ));
    }

    if !previous.is_empty() {
        out.push_str("\nMEMORIES ALREADY TAKEN FROM AN EARLIER VERSION OF THIS CONVERSATION\n");
        for memory in previous {
            out.push_str(&format!("- {}\n", memory.memory));
        }
        out.push_str("Do not repeat these unless the conversation now says something different.\n");
    }

    out
}

pub fn extraction_schema() -> Value {
    let pass = json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "memory": { "type": "string" },
                "msg_source_ids": { "type": "array", "items": { "type": "integer" } }
            },
            "required": ["memory", "msg_source_ids"]
        }
    });

    json!({
        "type": "object",
        "properties": {
            "memories_first_pass": pass,
            "memories_second_pass": pass,
            "memories_third_pass": pass
        },
        "required": ["memories_first_pass"]
    })
}

// ============================================================================
// Reconciliation
// ============================================================================

pub fn reconciliation_system(user_id: &str, agent_id: &str, when: DateTime<Utc>) -> String {
    format!(
        r#"It is {now}. You maintain the memory store for user_{user} and agent_{agent}.

You get the memories already stored and a list of candidate memories, each with a POS_ID.

For each candidate decide:
- new: it adds information not already stored. Put it in new_memories.
- contrary: it directly contradicts one stored memory. Put it in contrary_memories with that memory's id.
- Candidates that only repeat stored information are left out.

Keep every memory self-contained and at most 25 words. Give no explanations.
Reply with a JSON object matching the response schema."#,
        now = timestamp(when),
        user = user_id,
        agent = agent_id,
    )
}

pub fn reconciliation_input(existing: &[Memory], candidates: &[String]) -> String {
    let mut out = String::from("STORED MEMORIES\n");
    for memory in existing {
        out.push_str(&format!(
            "- memory_id: {} | obtained: {} | {}\n",
            memory.id,
            memory.obtained_at.format("%Y-%m-%d"),
            memory.memory
        ));
    }

    out.push_str("\nCANDIDATE MEMORIES\n");
    for (pos_id, text) in candidates.iter().enumerate() {
        out.push_str(&format!("- POS_ID {}: {}\n", pos_id, text));
    }

    out
}

pub fn reconciliation_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "new_memories": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "memory": { "type": "string" },
                        "source_candidate_pos_id": { "type": "integer" }
                    },
                    "required": ["memory", "source_candidate_pos_id"]
                }
            },
            "contrary_memories": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "memory": { "type": "string" },
                        "source_candidate_pos_id": { "type": "integer" },
                        "contradicted_memory_id": { "type": "string" }
                    },
                    "required": ["memory", "source_candidate_pos_id", "contradicted_memory_id"]
                }
            }
        },
        "required": ["new_memories", "contrary_memories"]
    })
}

// ============================================================================
// Recall
// ============================================================================

pub const SEARCH_QUERIES_SYSTEM: &str = r#"You write memory search queries.

Given the latest message in a conversation (and earlier messages for context), write every
search query needed to find stored memories relevant to answering it: people, places,
preferences, plans and how they relate. Think only about the latest message.

Write one query per line, each wrapped in double angle brackets, and nothing else:
<< first query >>
<< second query >>"#;

pub fn search_queries_input(
    latest: &str,
    preceding: &[MessageBlock],
    when: DateTime<Utc>,
) -> String {
    let mut out = String::from("EARLIER MESSAGES\n");
    if preceding.is_empty() {
        out.push_str("(none)\n");
    }
    for message in preceding {
        out.push_str(&format!("{}: {}\n", message.role, message.content));
    }
    out.push_str(&format!("\nLATEST MESSAGE ({})\n{}\n", timestamp(when), latest));
    out
}

pub fn recall_filter_system(latest: &str, queries: &[String], when: DateTime<Utc>) -> String {
    format!(
        r#"It is {now}.

Latest message:
{latest}

Memory search queries that were run for it:
- {queries}

You will see the memories those queries returned. Keep only the ones that help answer the
latest message. For each kept memory write a line with a short reason and its memory_id in
double angle brackets:
- Reason: ... || << memory_id >>

If none are relevant, write:
- Reason: ... || << NONE >>"#,
        now = timestamp(when),
        latest = latest,
        queries = queries.join("\n- "),
    )
}

pub fn recall_filter_input(memories: &[Memory]) -> String {
    let mut out = String::from("RETRIEVED MEMORIES\n");
    for memory in memories {
        out.push_str(&format!(
            "- memory_id: {} | obtained: {} | {}\n",
            memory.id,
            memory.obtained_at.format("%Y-%m-%d"),
            memory.memory
        ));
    }
    out
}

/// Start of the filter reply, sent as an assistant turn to steer the format.
pub const RECALL_FILTER_PRIMER: &str = "Relevant memory ids in << >>:\n- Reason: ";
