//! End-to-end tests of the memory pipeline through the `Memora` facade.
//!
//! Model calls are answered by a scripted generator; the graph is an
//! in-memory SQLite database and the index is the in-process one.

mod common;

use chrono::{TimeZone, Utc};

use common::{extraction_reply, reconciliation_reply, write_for, Harness};
use memora_core::db;
use memora_core::services::GenerationError;
use memora_core::Error;
use memora_models::{
    EmptyReason, MemoryListParams, MessageBlock, Page, PositionedMessage, RecallOutcome,
    RecallRequest, SearchRequest, SearchResponse, SearchScope,
};

fn recall_request(message: &str) -> RecallRequest {
    RecallRequest {
        latest_message: MessageBlock::user(message),
        preceding_messages: vec![],
        agent_id: None,
        current_time: None,
        filter: None,
    }
}

fn search_request(queries: &[&str], scope: SearchScope, user_id: Option<&str>) -> SearchRequest {
    SearchRequest {
        queries: queries.iter().map(|q| q.to_string()).collect(),
        scope,
        user_id: user_id.map(str::to_string),
        agent_id: None,
        flatten: false,
        top_p: None,
    }
}

// ============================================================================
// Save
// ============================================================================

#[tokio::test]
async fn test_save_extracts_memories_with_sources() {
    let h = Harness::new().await;
    h.generator.push(extraction_reply(&[
        ("#user_#id# loves tacos", &[0]),
        ("#user_#id# has a dog named Rex", &[0]),
    ]));

    let saved = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![
                MessageBlock::user("I love tacos and my dog Rex does too"),
                MessageBlock::assistant("Rex has good taste!"),
            ]),
            None,
        )
        .await
        .unwrap();

    // Nothing stored yet, so reconciliation needs no model call
    assert_eq!(h.generator.call_count(), 1);
    assert_eq!(saved.memory_ids.len(), 2);
    assert_eq!(saved.interaction_id.len(), memora_models::SHORT_ID_LEN);
    assert_eq!(h.index.len().await, 2);

    let detail = h
        .memora
        .get_interaction(&h.org.id, &h.user.id, &saved.interaction_id)
        .await
        .unwrap();
    assert_eq!(detail.messages.len(), 2);
    assert_eq!(detail.interaction.agent_id, h.agent.id);

    let mut texts: Vec<&str> = detail.memories.iter().map(|m| m.memory.as_str()).collect();
    texts.sort();
    assert_eq!(texts, vec!["Ava has a dog named Rex", "Ava loves tacos"]);

    for memory in &detail.memories {
        assert_eq!(
            memory.message_sources,
            vec![PositionedMessage {
                position: 0,
                role: "user".to_string(),
                content: "I love tacos and my dog Rex does too".to_string(),
            }]
        );
    }

    // Stored text keeps the placeholder
    let raw = db::get_memory(h.memora.pool(), &h.org.id, &h.user.id, &saved.memory_ids[0])
        .await
        .unwrap();
    assert!(raw.memory.contains(&format!("user_{}", h.user.id)));
}

#[tokio::test]
async fn test_save_rejects_bad_input_before_generation() {
    let h = Harness::new().await;

    let err = h
        .memora
        .save_interaction(&h.org.id, &h.user.id, h.write(vec![]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            write_for("NoSuchAgentNoSuchAgent", vec![MessageBlock::user("hi")]),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    assert_eq!(h.generator.call_count(), 0);
}

#[tokio::test]
async fn test_contradiction_supersedes_existing_memory() {
    let h = Harness::new().await;

    h.generator
        .push(extraction_reply(&[("#user_#id# loves cilantro", &[0])]));
    let first = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("I love cilantro")]),
            None,
        )
        .await
        .unwrap();
    let old_id = first.memory_ids[0].clone();

    h.generator
        .push(extraction_reply(&[("#user_#id# dislikes cilantro", &[0])]));
    h.generator.push(reconciliation_reply(
        &[],
        &[("#user_#id# dislikes cilantro", 0, &old_id)],
    ));
    let second = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("Honestly I can't stand cilantro anymore")]),
            None,
        )
        .await
        .unwrap();
    let new_id = second.memory_ids[0].clone();

    // The reconciliation prompt showed the stored memory by id
    let calls = h.generator.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[2][1].content.contains(&old_id));
    assert!(calls[2][1].content.contains("POS_ID 0"));

    let history = h
        .memora
        .memory_history(&h.org.id, &h.user.id, &old_id)
        .await
        .unwrap();
    let texts: Vec<&str> = history.iter().map(|m| m.memory.as_str()).collect();
    assert_eq!(texts, vec!["Ava dislikes cilantro", "Ava loves cilantro"]);

    // Searches resolve to the newest version only
    let response = h
        .memora
        .search(
            &h.org.id,
            search_request(&["cilantro"], SearchScope::User, Some(&h.user.id)),
        )
        .await
        .unwrap();
    let SearchResponse::PerQuery(lists) = response else {
        panic!("expected per-query results");
    };
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].len(), 1);
    assert_eq!(lists[0][0].memory.id, new_id);
    assert_eq!(lists[0][0].memory.memory, "Ava dislikes cilantro");

    // Deleting the newest version makes the older one current again
    h.memora
        .delete_memory(&h.org.id, &h.user.id, &new_id)
        .await
        .unwrap();
    let response = h
        .memora
        .search(
            &h.org.id,
            search_request(&["cilantro"], SearchScope::User, Some(&h.user.id)),
        )
        .await
        .unwrap();
    let SearchResponse::PerQuery(lists) = response else {
        panic!("expected per-query results");
    };
    assert_eq!(lists[0].len(), 1);
    assert_eq!(lists[0][0].memory.id, old_id);
}

#[tokio::test]
async fn test_unpresented_contradiction_becomes_new_memory() {
    let h = Harness::new().await;

    h.generator
        .push(extraction_reply(&[("#user_#id# lives in Paris", &[0])]));
    let first = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("I live in Paris")]),
            None,
        )
        .await
        .unwrap();

    h.generator
        .push(extraction_reply(&[("#user_#id# lives in Rome", &[0])]));
    h.generator.push(reconciliation_reply(
        &[],
        &[("#user_#id# lives in Rome", 0, "not-a-stored-id")],
    ));
    let second = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("I moved to Rome")]),
            None,
        )
        .await
        .unwrap();

    assert_eq!(second.memory_ids.len(), 1);
    let history = h
        .memora
        .memory_history(&h.org.id, &h.user.id, &first.memory_ids[0])
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_agent_scoped_reconciliation_skips_other_agents() {
    let h = Harness::new().await;
    let coach = h
        .memora
        .create_agent(&h.org.id, "Coach", Some(&h.user.id))
        .await
        .unwrap();

    h.generator
        .push(extraction_reply(&[("#user_#id# loves cilantro", &[0])]));
    h.memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("I love cilantro")]),
            None,
        )
        .await
        .unwrap();

    // Only the extraction reply is queued: a reconciliation call would fail
    h.generator
        .push(extraction_reply(&[("#user_#id# dislikes cilantro", &[0])]));
    let mut write = write_for(&coach.id, vec![MessageBlock::user("I hate cilantro")]);
    write.search_across_agents = Some(false);
    let saved = h
        .memora
        .save_interaction(&h.org.id, &h.user.id, write, Some(0))
        .await
        .unwrap();

    assert_eq!(saved.memory_ids.len(), 1);
    assert_eq!(h.generator.call_count(), 2);

    let coach_memories = h
        .memora
        .list_memories(
            &h.org.id,
            &h.user.id,
            MemoryListParams {
                agent_id: Some(coach.id.clone()),
                skip: None,
                limit: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(coach_memories.len(), 1);
    assert_eq!(coach_memories[0].memory, "Ava dislikes cilantro");
}

// ============================================================================
// Update
// ============================================================================

#[tokio::test]
async fn test_update_rewrites_tail_and_supersedes() {
    let h = Harness::new().await;
    h.generator.push(extraction_reply(&[
        ("#user_#id# is planning a trip to Lisbon in May", &[0]),
        ("#user_#id# will stay near Alfama", &[2]),
    ]));
    let saved = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![
                MessageBlock::user("I'm planning a trip to Lisbon in May"),
                MessageBlock::assistant("Sounds lovely!"),
                MessageBlock::user("I'll stay near Alfama"),
                MessageBlock::assistant("Great area."),
            ]),
            None,
        )
        .await
        .unwrap();
    let alfama_id = saved.memory_ids[1].clone();

    h.generator
        .push(extraction_reply(&[("#user_#id# will stay in Belem", &[2])]));
    h.generator.push(reconciliation_reply(
        &[],
        &[("#user_#id# will stay in Belem", 0, &alfama_id)],
    ));
    let updated = h
        .memora
        .update_interaction(
            &h.org.id,
            &h.user.id,
            &saved.interaction_id,
            h.write(vec![
                MessageBlock::user("I'm planning a trip to Lisbon in May"),
                MessageBlock::assistant("Sounds lovely!"),
                MessageBlock::user("Actually I'll stay in Belem instead"),
                MessageBlock::assistant("Noted."),
            ]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(updated.interaction_id, saved.interaction_id);
    assert_eq!(updated.memory_ids.len(), 1);

    // The update's extraction prompt carried the earlier memories
    let calls = h.generator.calls();
    assert!(calls[1][1].content.contains("Alfama"));

    let detail = h
        .memora
        .get_interaction(&h.org.id, &h.user.id, &saved.interaction_id)
        .await
        .unwrap();
    let contents: Vec<&str> = detail.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "I'm planning a trip to Lisbon in May",
            "Sounds lovely!",
            "Actually I'll stay in Belem instead",
            "Noted.",
        ]
    );
    let positions: Vec<i64> = detail.messages.iter().map(|m| m.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);

    let history = h
        .memora
        .memory_history(&h.org.id, &h.user.id, &alfama_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].memory, "Ava will stay in Belem");
    assert_eq!(
        history[0].message_sources[0].content,
        "Actually I'll stay in Belem instead"
    );
    // Sources are copies and survive the rewrite
    assert_eq!(history[1].message_sources[0].content, "I'll stay near Alfama");
}

#[tokio::test]
async fn test_unchanged_update_only_touches_interaction() {
    let h = Harness::new().await;
    let messages = vec![MessageBlock::user("hello"), MessageBlock::assistant("hi")];

    h.generator.push(extraction_reply(&[]));
    let saved = h
        .memora
        .save_interaction(&h.org.id, &h.user.id, h.write(messages.clone()), None)
        .await
        .unwrap();
    assert!(saved.memory_ids.is_empty());

    let when = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
    let mut write = h.write(messages);
    write.interaction_date = Some(when);
    let updated = h
        .memora
        .update_interaction(&h.org.id, &h.user.id, &saved.interaction_id, write, None)
        .await
        .unwrap();

    assert!(updated.memory_ids.is_empty());
    assert_eq!(h.generator.call_count(), 1);

    let detail = h
        .memora
        .get_interaction(&h.org.id, &h.user.id, &saved.interaction_id)
        .await
        .unwrap();
    assert_eq!(detail.interaction.updated_at, when);
    assert_eq!(detail.messages.len(), 2);
}

#[tokio::test]
async fn test_empty_update_truncates_chain() {
    let h = Harness::new().await;
    h.generator.push(extraction_reply(&[]));
    let saved = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("hello")]),
            None,
        )
        .await
        .unwrap();

    h.memora
        .update_interaction(&h.org.id, &h.user.id, &saved.interaction_id, h.write(vec![]), None)
        .await
        .unwrap();

    let detail = h
        .memora
        .get_interaction(&h.org.id, &h.user.id, &saved.interaction_id)
        .await
        .unwrap();
    assert!(detail.messages.is_empty());
    assert_eq!(h.generator.call_count(), 1);
}

#[tokio::test]
async fn test_repeated_update_is_idempotent() {
    let h = Harness::new().await;
    h.generator.push(extraction_reply(&[]));
    let saved = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![
                MessageBlock::user("I adopted a dog"),
                MessageBlock::assistant("Cute!"),
            ]),
            None,
        )
        .await
        .unwrap();

    let rewritten = vec![
        MessageBlock::user("I adopted a dog"),
        MessageBlock::assistant("What breed is it?"),
        MessageBlock::user("A greyhound"),
    ];
    h.generator
        .push(extraction_reply(&[("#user_#id# adopted a greyhound", &[0, 2])]));
    let first = h
        .memora
        .update_interaction(
            &h.org.id,
            &h.user.id,
            &saved.interaction_id,
            h.write(rewritten.clone()),
            None,
        )
        .await
        .unwrap();
    assert_eq!(first.memory_ids.len(), 1);
    let after_first = h
        .memora
        .get_interaction(&h.org.id, &h.user.id, &saved.interaction_id)
        .await
        .unwrap()
        .messages;

    let second = h
        .memora
        .update_interaction(
            &h.org.id,
            &h.user.id,
            &saved.interaction_id,
            h.write(rewritten),
            None,
        )
        .await
        .unwrap();
    let after_second = h
        .memora
        .get_interaction(&h.org.id, &h.user.id, &saved.interaction_id)
        .await
        .unwrap()
        .messages;

    assert_eq!(after_first, after_second);
    assert_eq!(after_second.len(), 3);
    assert!(second.memory_ids.is_empty());
    assert_eq!(h.generator.call_count(), 2);

    let memories = h
        .memora
        .list_memories(&h.org.id, &h.user.id, MemoryListParams::default())
        .await
        .unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(h.index.len().await, 1);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_parse_failure_is_retried() {
    let h = Harness::new().await;
    h.generator.push("I could not find any memories, sorry.");
    h.generator
        .push(extraction_reply(&[("#user_#id# plays chess", &[0])]));

    let saved = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("I play chess on Sundays")]),
            None,
        )
        .await
        .unwrap();

    assert_eq!(saved.memory_ids.len(), 1);
    assert_eq!(h.generator.call_count(), 2);
}

#[tokio::test]
async fn test_parse_failure_reports_attempts_and_writes_nothing() {
    let h = Harness::new().await;
    h.generator.push(r#"{"memories_first_pass": 7}"#);
    h.generator.push("still not json");

    let err = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("I play chess")]),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::GenerationParse { attempts: 2, .. }));

    h.generator.push("nope");
    let err = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("I play chess")]),
            Some(0),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::GenerationParse { attempts: 1, .. }));

    let interactions = h
        .memora
        .list_interactions(&h.org.id, &h.user.id, Page::default())
        .await
        .unwrap();
    assert!(interactions.is_empty());
    assert_eq!(h.index.len().await, 0);
}

#[tokio::test]
async fn test_retry_override_is_capped() {
    let h = Harness::new().await;
    let cap = h.memora.options().max_retries_cap;

    for requested in [cap + 1, u32::MAX] {
        let err = h
            .memora
            .save_interaction(
                &h.org.id,
                &h.user.id,
                h.write(vec![MessageBlock::user("I play chess")]),
                Some(requested),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
    assert_eq!(h.generator.call_count(), 0);

    // Every attempt up to the cap is made
    for _ in 0..=cap {
        h.generator.push("not json");
    }
    let err = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("I play chess")]),
            Some(cap),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::GenerationParse { attempts, .. } if attempts == cap + 1));
    assert_eq!(h.generator.remaining(), 0);
}

#[tokio::test]
async fn test_transport_failures_exhaust_retries() {
    let h = Harness::new().await;
    h.generator
        .push_error(GenerationError::Transport("connection reset".to_string()));

    let err = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("hello")]),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Llm(_)));
    assert_eq!(h.generator.call_count(), 2);
}

#[tokio::test]
async fn test_partial_commit_can_be_replayed() {
    let h = Harness::new().await;
    h.index.fail_upserts(true);
    h.generator
        .push(extraction_reply(&[("#user_#id# speaks Portuguese", &[0])]));

    let err = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("Eu falo português")]),
            None,
        )
        .await
        .unwrap_err();
    let pending = match err {
        Error::PartialCommit(pending) => pending,
        other => panic!("expected a partial commit, got {:?}", other),
    };

    // The graph side is committed, the index side is not
    let ids = pending.memory_ids();
    assert_eq!(ids.len(), 1);
    let memory = h
        .memora
        .get_memory(&h.org.id, &h.user.id, &ids[0])
        .await
        .unwrap();
    assert_eq!(memory.interaction_id, pending.interaction_id);
    assert_eq!(h.index.len().await, 0);

    h.index.fail_upserts(false);
    h.memora.retry_index_write(&pending).await.unwrap();
    h.memora.retry_index_write(&pending).await.unwrap();
    assert_eq!(h.index.len().await, 1);

    let response = h
        .memora
        .search(
            &h.org.id,
            search_request(&["Portuguese"], SearchScope::User, Some(&h.user.id)),
        )
        .await
        .unwrap();
    let SearchResponse::PerQuery(lists) = response else {
        panic!("expected per-query results");
    };
    assert_eq!(lists[0][0].memory.id, ids[0]);
}

// ============================================================================
// Recall
// ============================================================================

async fn save_tacos(h: &Harness) -> String {
    h.generator
        .push(extraction_reply(&[("#user_#id# loves tacos", &[0])]));
    h.memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("Tacos are my favorite food")]),
            None,
        )
        .await
        .unwrap()
        .memory_ids
        .remove(0)
}

#[tokio::test]
async fn test_recall_with_nothing_stored() {
    let h = Harness::new().await;
    h.generator.push("<< weekend plans >>");

    let outcome = h
        .memora
        .recall_for_message(&h.org.id, &h.user.id, recall_request("Any plans?"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RecallOutcome::Empty {
            reason: EmptyReason::NoMatches
        }
    );
    assert_eq!(h.generator.call_count(), 1);
}

#[tokio::test]
async fn test_recall_filtered_out() {
    let h = Harness::new().await;
    save_tacos(&h).await;
    h.generator.push("<< tacos >>");
    h.generator.push("- Reason: not about food || << NONE >>");

    let outcome = h
        .memora
        .recall_for_message(&h.org.id, &h.user.id, recall_request("What's the weather?"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RecallOutcome::Empty {
            reason: EmptyReason::FilteredOut
        }
    );
}

#[tokio::test]
async fn test_recall_selected_by_filter() {
    let h = Harness::new().await;
    let id = save_tacos(&h).await;
    h.generator.push("<< tacos >>\n<< favorite food >>");
    h.generator
        .push(format!("- Reason: food preference || << {} >>", id));

    let outcome = h
        .memora
        .recall_for_message(&h.org.id, &h.user.id, recall_request("What should I cook?"))
        .await
        .unwrap();

    let RecallOutcome::Recalled { memories, filtered } = outcome else {
        panic!("expected recalled memories");
    };
    assert!(filtered);
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].memory.memory, "Ava loves tacos");

    // The filter prompt listed the candidate by id
    let calls = h.generator.calls();
    assert!(calls[2][1].content.contains(&id));
}

#[tokio::test]
async fn test_recall_fallbacks() {
    let h = Harness::new().await;
    save_tacos(&h).await;

    // No queries in the reply: the message itself is the query.
    // No ids in the filter reply: results come back unfiltered.
    h.generator.push("I am not sure what to search for.");
    h.generator.push("Everything looks relevant.");

    let outcome = h
        .memora
        .recall_for_message(&h.org.id, &h.user.id, recall_request("Do I like tacos?"))
        .await
        .unwrap();

    let RecallOutcome::Recalled { memories, filtered } = outcome else {
        panic!("expected recalled memories");
    };
    assert!(!filtered);
    assert_eq!(memories[0].memory.memory, "Ava loves tacos");
}

#[tokio::test]
async fn test_recall_without_filter_skips_second_call() {
    let h = Harness::new().await;
    save_tacos(&h).await;
    h.generator.push("<< tacos >>");

    let mut request = recall_request("Dinner ideas?");
    request.filter = Some(false);
    let outcome = h
        .memora
        .recall_for_message(&h.org.id, &h.user.id, request)
        .await
        .unwrap();

    assert_eq!(outcome.memories().len(), 1);
    assert_eq!(h.generator.call_count(), 2);
}

// ============================================================================
// Tenancy and rendering
// ============================================================================

#[tokio::test]
async fn test_tenant_isolation() {
    let h = Harness::new().await;
    let ben = h.memora.create_user(&h.org.id, "Ben").await.unwrap();

    let ava_memory = save_tacos(&h).await;
    h.generator
        .push(extraction_reply(&[("#user_#id# enjoys sushi", &[0])]));
    let ben_memory = h
        .memora
        .save_interaction(
            &h.org.id,
            &ben.id,
            h.write(vec![MessageBlock::user("Sushi every Friday for me")]),
            None,
        )
        .await
        .unwrap()
        .memory_ids
        .remove(0);
    // Ben's reconciliation saw none of Ava's memories
    assert_eq!(h.generator.call_count(), 2);

    let response = h
        .memora
        .search(
            &h.org.id,
            search_request(&["tacos", "sushi"], SearchScope::User, Some(&h.user.id)),
        )
        .await
        .unwrap();
    let SearchResponse::PerQuery(lists) = response else {
        panic!("expected per-query results");
    };
    assert_eq!(lists.len(), 2);
    assert!(lists
        .iter()
        .flatten()
        .all(|s| s.memory.user_id == h.user.id));
    assert_eq!(lists[0][0].memory.id, ava_memory);

    let mut request = search_request(&["tacos", "sushi"], SearchScope::Organization, None);
    request.flatten = true;
    let SearchResponse::Flattened(all) = h.memora.search(&h.org.id, request).await.unwrap()
    else {
        panic!("expected flattened results");
    };
    let mut ids: Vec<&str> = all.iter().map(|s| s.memory.id.as_str()).collect();
    ids.sort();
    let mut expected = vec![ava_memory.as_str(), ben_memory.as_str()];
    expected.sort();
    assert_eq!(ids, expected);

    let other = h.memora.create_organization("Other").await.unwrap();
    let SearchResponse::PerQuery(lists) = h
        .memora
        .search(
            &other.id,
            search_request(&["tacos"], SearchScope::Organization, None),
        )
        .await
        .unwrap()
    else {
        panic!("expected per-query results");
    };
    assert!(lists[0].is_empty());

    assert!(matches!(
        h.memora.get_memory(&h.org.id, &ben.id, &ava_memory).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        h.memora
            .search(&h.org.id, search_request(&["tacos"], SearchScope::User, None))
            .await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_names_render_at_read_time() {
    let h = Harness::new().await;
    h.generator.push(extraction_reply(&[(
        "#user_#id# asked #agent_#id# for taco recipes",
        &[0],
    )]));
    let id = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("Can you give me taco recipes?")]),
            None,
        )
        .await
        .unwrap()
        .memory_ids
        .remove(0);

    let memory = h.memora.get_memory(&h.org.id, &h.user.id, &id).await.unwrap();
    assert_eq!(memory.memory, "Ava asked Chef for taco recipes");

    h.memora
        .rename_user(&h.org.id, &h.user.id, "Ava Smith")
        .await
        .unwrap();
    h.memora
        .rename_agent(&h.org.id, &h.agent.id, "Sous Chef")
        .await
        .unwrap();
    let memory = h.memora.get_memory(&h.org.id, &h.user.id, &id).await.unwrap();
    assert_eq!(memory.memory, "Ava Smith asked Sous Chef for taco recipes");

    h.memora.delete_agent(&h.org.id, &h.agent.id).await.unwrap();
    let memory = h.memora.get_memory(&h.org.id, &h.user.id, &id).await.unwrap();
    assert_eq!(
        memory.memory,
        format!("Ava Smith asked agent_{} for taco recipes", h.agent.id)
    );
}

// ============================================================================
// Deletes
// ============================================================================

#[tokio::test]
async fn test_deletes_clear_the_index() {
    let h = Harness::new().await;
    h.generator.push(extraction_reply(&[
        ("#user_#id# runs marathons", &[0]),
        ("#user_#id# lives in Boston", &[0]),
    ]));
    let saved = h
        .memora
        .save_interaction(
            &h.org.id,
            &h.user.id,
            h.write(vec![MessageBlock::user("I run the Boston marathon every year")]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(h.index.len().await, 2);

    h.memora
        .delete_memory(&h.org.id, &h.user.id, &saved.memory_ids[0])
        .await
        .unwrap();
    assert_eq!(h.index.len().await, 1);

    h.memora
        .delete_interaction(&h.org.id, &h.user.id, &saved.interaction_id)
        .await
        .unwrap();
    assert_eq!(h.index.len().await, 0);
    assert!(matches!(
        h.memora
            .get_interaction(&h.org.id, &h.user.id, &saved.interaction_id)
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_user_and_org_clear_the_index() {
    let h = Harness::new().await;
    save_tacos(&h).await;
    assert_eq!(h.index.len().await, 1);

    h.memora.delete_user(&h.org.id, &h.user.id).await.unwrap();
    assert_eq!(h.index.len().await, 0);

    let ben = h.memora.create_user(&h.org.id, "Ben").await.unwrap();
    h.generator
        .push(extraction_reply(&[("#user_#id# enjoys sushi", &[0])]));
    h.memora
        .save_interaction(
            &h.org.id,
            &ben.id,
            h.write(vec![MessageBlock::user("I like sushi")]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(h.index.len().await, 1);

    h.memora.delete_organization(&h.org.id).await.unwrap();
    assert_eq!(h.index.len().await, 0);
    assert!(matches!(
        h.memora.get_organization(&h.org.id).await,
        Err(Error::NotFound(_))
    ));
}
