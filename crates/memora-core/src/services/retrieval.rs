//! Scoped multi-query retrieval.
//!
//! The index answers with memory ids and fused scores. Those ids are then
//! resolved through the graph: each one is replaced by the current version
//! of its chain, duplicates collapse to the best score, and placeholders
//! are rendered with current names.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use memora_models::{ScoredMemory, SearchScope};

use super::index::{IndexFilter, IndexMatch, SemanticIndex};
use super::placeholder;
use crate::db::{self, DbPool};
use crate::{Error, Result};

/// Where a search looks.
#[derive(Debug, Clone, Copy)]
pub struct SearchTarget<'a> {
    pub org_id: &'a str,
    pub scope: SearchScope,
    pub user_id: Option<&'a str>,
    pub agent_id: Option<&'a str>,
}

impl<'a> SearchTarget<'a> {
    pub fn user(org_id: &'a str, user_id: &'a str, agent_id: Option<&'a str>) -> Self {
        Self {
            org_id,
            scope: SearchScope::User,
            user_id: Some(user_id),
            agent_id,
        }
    }

    /// Reject a user scope without a user.
    pub fn validate(&self) -> Result<()> {
        self.filter().map(|_| ())
    }

    fn filter(&self) -> Result<IndexFilter> {
        let filter = match self.scope {
            SearchScope::Organization => IndexFilter::org(self.org_id),
            SearchScope::User => {
                let user_id = self.user_id.ok_or_else(|| {
                    Error::Validation("user scope search requires a user_id".to_string())
                })?;
                IndexFilter::user(self.org_id, user_id)
            }
        };
        Ok(filter.with_agent(self.agent_id))
    }

    /// User restriction applied when resolving through the graph.
    fn graph_user(&self) -> Option<&'a str> {
        match self.scope {
            SearchScope::Organization => None,
            SearchScope::User => self.user_id,
        }
    }
}

/// Retrieval engine over the semantic index and the graph.
#[derive(Clone)]
pub struct Retriever {
    pool: DbPool,
    index: Option<Arc<dyn SemanticIndex>>,
}

impl Retriever {
    pub fn new(pool: DbPool, index: Option<Arc<dyn SemanticIndex>>) -> Self {
        Self { pool, index }
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Raw index matches per query.
    pub async fn search_matches(
        &self,
        target: SearchTarget<'_>,
        queries: &[String],
    ) -> Result<Vec<Vec<IndexMatch>>> {
        let filter = target.filter()?;
        let index = self.index.as_ref().ok_or(Error::IndexNotConfigured)?;
        if queries.is_empty() {
            return Ok(vec![]);
        }

        let matches = index.search_batch(queries, &filter).await?;
        debug!(
            org_id = target.org_id,
            scope = %target.scope,
            queries = queries.len(),
            hits = matches.iter().map(Vec::len).sum::<usize>(),
            "Index search complete"
        );
        Ok(matches)
    }

    /// Map matched ids to the current versions of their chains.
    ///
    /// Per query, each resolved memory appears once with its best score,
    /// best first. Ids missing from the graph are dropped. Text stays in
    /// placeholder form.
    pub async fn resolve(
        &self,
        target: SearchTarget<'_>,
        matches: Vec<Vec<IndexMatch>>,
    ) -> Result<Vec<Vec<ScoredMemory>>> {
        let mut ids: Vec<String> = matches
            .iter()
            .flatten()
            .map(|m| m.memory_id.clone())
            .collect();
        ids.sort();
        ids.dedup();

        let heads: HashMap<String, memora_models::Memory> =
            db::resolve_current(&self.pool, target.org_id, target.graph_user(), &ids)
                .await?
                .into_iter()
                .collect();

        Ok(matches
            .into_iter()
            .map(|hits| {
                let mut best: Vec<ScoredMemory> = Vec::new();
                for hit in hits {
                    let Some(head) = heads.get(&hit.memory_id) else {
                        continue;
                    };
                    match best.iter_mut().find(|s| s.memory.id == head.id) {
                        Some(existing) => existing.score = existing.score.max(hit.score),
                        None => best.push(ScoredMemory {
                            memory: head.clone(),
                            score: hit.score,
                        }),
                    }
                }
                sort_by_score(&mut best);
                best
            })
            .collect())
    }

    /// Search, resolve and render.
    pub async fn search(
        &self,
        target: SearchTarget<'_>,
        queries: &[String],
    ) -> Result<Vec<Vec<ScoredMemory>>> {
        let matches = self.search_matches(target, queries).await?;
        let mut results = self.resolve(target, matches).await?;

        placeholder::render_memories(
            &self.pool,
            target.org_id,
            results.iter_mut().flatten().map(|s| &mut s.memory),
        )
        .await?;

        Ok(results)
    }
}

fn sort_by_score(results: &mut [ScoredMemory]) {
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// Merge per-query lists, keeping each memory once at its best score.
pub fn flatten_by_max_score(lists: Vec<Vec<ScoredMemory>>) -> Vec<ScoredMemory> {
    let mut merged: Vec<ScoredMemory> = Vec::new();
    for result in lists.into_iter().flatten() {
        match merged.iter_mut().find(|m| m.memory.id == result.memory.id) {
            Some(existing) => existing.score = existing.score.max(result.score),
            None => merged.push(result),
        }
    }
    sort_by_score(&mut merged);
    merged
}

pub fn check_top_p(p: f32) -> Result<()> {
    if p > 0.0 && p <= 1.0 {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "top_p must be in (0, 1], got {}",
            p
        )))
    }
}

/// Keep the best results until their cumulative score reaches `p` of the
/// total. Results at or below `min_score` are never included.
pub fn select_top_p(
    mut results: Vec<ScoredMemory>,
    p: f32,
    min_score: f32,
) -> Result<Vec<ScoredMemory>> {
    check_top_p(p)?;

    results.retain(|r| r.score > min_score);
    sort_by_score(&mut results);

    let total: f32 = results.iter().map(|r| r.score).sum();
    let target = total * p;

    let mut cumulative = 0.0;
    let mut keep = 0;
    for result in &results {
        keep += 1;
        cumulative += result.score;
        if cumulative >= target {
            break;
        }
    }
    results.truncate(keep);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memora_models::Memory;

    fn scored(id: &str, score: f32) -> ScoredMemory {
        ScoredMemory {
            memory: Memory {
                org_id: "o".to_string(),
                user_id: "u".to_string(),
                agent_id: "a".to_string(),
                interaction_id: "i".to_string(),
                id: id.to_string(),
                memory: id.to_string(),
                obtained_at: memora_models::now(),
                message_sources: vec![],
            },
            score,
        }
    }

    fn ids(results: &[ScoredMemory]) -> Vec<&str> {
        results.iter().map(|r| r.memory.id.as_str()).collect()
    }

    #[test]
    fn test_flatten_keeps_max_score() {
        let flat = flatten_by_max_score(vec![
            vec![scored("a", 0.5), scored("b", 0.4)],
            vec![scored("b", 0.9), scored("c", 0.6)],
        ]);
        assert_eq!(ids(&flat), vec!["b", "c", "a"]);
        assert!((flat[0].score - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_top_p_stops_at_cumulative_share() {
        let results = vec![scored("a", 1.0), scored("b", 0.5), scored("c", 0.5)];
        let top = select_top_p(results, 0.5, 0.35).unwrap();
        assert_eq!(ids(&top), vec!["a"]);
    }

    #[test]
    fn test_top_p_one_keeps_everything_above_min() {
        let results = vec![scored("a", 1.0), scored("low", 0.2), scored("b", 0.5)];
        let top = select_top_p(results, 1.0, 0.35).unwrap();
        assert_eq!(ids(&top), vec!["a", "b"]);
    }

    #[test]
    fn test_top_p_drops_scores_equal_to_min() {
        let results = vec![scored("a", 0.5), scored("edge", 0.35)];
        let top = select_top_p(results, 1.0, 0.35).unwrap();
        assert_eq!(ids(&top), vec!["a"]);
    }

    #[test]
    fn test_top_p_out_of_range() {
        assert!(matches!(
            select_top_p(vec![], 0.0, 0.35),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            select_top_p(vec![], 1.5, 0.35),
            Err(Error::Validation(_))
        ));
        assert!(select_top_p(vec![], 0.7, 0.35).unwrap().is_empty());
    }

    #[test]
    fn test_user_scope_requires_user() {
        let target = SearchTarget {
            org_id: "o",
            scope: SearchScope::User,
            user_id: None,
            agent_id: None,
        };
        assert!(matches!(target.filter(), Err(Error::Validation(_))));
        assert!(matches!(target.validate(), Err(Error::Validation(_))));
        assert!(SearchTarget::user("o", "u", None).validate().is_ok());
    }
}
