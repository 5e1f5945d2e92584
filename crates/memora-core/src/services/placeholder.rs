//! Placeholder tokens in memory text.
//!
//! Stored memories never contain names. The model writes `#user_#id#` and
//! `#agent_#id#`, which become `user_<id>` / `agent_<id>` before anything
//! is stored; names are substituted only when memories are read, so a
//! rename shows up everywhere without touching stored text.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use memora_models::Memory;

use crate::db::{self, DbPool};
use crate::Result;

/// User placeholder the model is told to write.
pub const MODEL_USER_TOKEN: &str = "#user_#id#";
/// Agent placeholder the model is told to write.
pub const MODEL_AGENT_TOKEN: &str = "#agent_#id#";

static STORED_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(user|agent)_([A-Za-z0-9]{22})\b").expect("valid placeholder regex")
});

pub fn user_placeholder(user_id: &str) -> String {
    format!("user_{}", user_id)
}

pub fn agent_placeholder(agent_id: &str) -> String {
    format!("agent_{}", agent_id)
}

/// Replace model-side tokens with the stored placeholders.
pub fn to_stored(text: &str, user_id: &str, agent_id: &str) -> String {
    text.replace(MODEL_USER_TOKEN, &user_placeholder(user_id))
        .replace(MODEL_AGENT_TOKEN, &agent_placeholder(agent_id))
        .trim()
        .to_string()
}

/// User and agent ids referenced by stored placeholders in `text`.
pub fn referenced_ids(text: &str) -> (Vec<String>, Vec<String>) {
    let mut users = Vec::new();
    let mut agents = Vec::new();
    for caps in STORED_TOKEN.captures_iter(text) {
        let id = caps[2].to_string();
        match &caps[1] {
            "user" => users.push(id),
            _ => agents.push(id),
        }
    }
    (users, agents)
}

/// Substitute known names. Unknown ids keep their placeholder.
pub fn render(text: &str, users: &HashMap<String, String>, agents: &HashMap<String, String>) -> String {
    STORED_TOKEN
        .replace_all(text, |caps: &Captures| {
            let names = if &caps[1] == "user" { users } else { agents };
            names
                .get(&caps[2])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Render placeholders in each memory using the current names in `org_id`.
pub async fn render_memories<'a, I>(pool: &DbPool, org_id: &str, memories: I) -> Result<()>
where
    I: IntoIterator<Item = &'a mut Memory>,
{
    let mut memories: Vec<&mut Memory> = memories.into_iter().collect();

    let mut user_ids = HashSet::new();
    let mut agent_ids = HashSet::new();
    for memory in &memories {
        let (users, agents) = referenced_ids(&memory.memory);
        user_ids.extend(users);
        agent_ids.extend(agents);
    }
    if user_ids.is_empty() && agent_ids.is_empty() {
        return Ok(());
    }

    let users = db::user_names(pool, org_id, &user_ids.into_iter().collect::<Vec<_>>()).await?;
    let agents = db::agent_labels(pool, org_id, &agent_ids.into_iter().collect::<Vec<_>>()).await?;

    for memory in memories.iter_mut() {
        memory.memory = render(&memory.memory, &users, &agents);
    }

    Ok(())
}
