//! Data models for Memora.
//!
//! Defines the tenancy records (organizations, users, agents), the
//! interaction message chain, memories with their version history,
//! and the request/response DTOs shared by the service and HTTP layers.
//!
//! This crate can be used with or without sqlx support:
//! - Default: No database dependencies, pure data structures
//! - With `sqlx` feature: Adds `FromRow` derive for database mapping

mod interaction;
mod memory;
mod search;
mod tenancy;

pub use interaction::*;
pub use memory::*;
pub use search::*;
pub use tenancy::*;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Alphabet for short ids. Excludes look-alike characters (0, 1, I, O, l).
pub const SHORT_ID_ALPHABET: [char; 57] = [
    '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K',
    'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd',
    'e', 'f', 'g', 'h', 'i', 'j', 'k', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w',
    'x', 'y', 'z',
];

/// Length of organization, user, agent and interaction ids.
pub const SHORT_ID_LEN: usize = 22;

/// Generate a new UUID (used for memory ids)
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a 22 character base57 id for tenancy records and interactions.
pub fn short_id() -> String {
    nanoid::nanoid!(SHORT_ID_LEN, &SHORT_ID_ALPHABET)
}

/// Check that a string has the shape produced by [`short_id`].
pub fn is_short_id(id: &str) -> bool {
    id.chars().count() == SHORT_ID_LEN && id.chars().all(|c| SHORT_ID_ALPHABET.contains(&c))
}

/// Current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
