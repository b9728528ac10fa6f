// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity types, routing-key derivation and the placement hash.
//!
//! # Co-location
//!
//! Identity-scoped entities route on their raw key. Content entities carry a
//! composite `ownerId:contentId` key and route on the owner prefix, so a
//! user's threads, posts and comments hash exactly like the user:
//!
//! ```text
//! route(User, "alice")            → hash("alice") % n
//! route(Post, "alice:post-9f2c")  → hash("alice") % n
//! ```
//!
//! Co-location only holds when the owner and content shard types have the
//! same shard count.
//!
//! # Placement hash
//!
//! `h = h * 31 + unit` over the UTF-16 code units of the routing key with
//! 32-bit wrapping arithmetic, folded to non-negative with `abs`, then
//! reduced modulo the shard count. Any change to the shard count remaps
//! most keys; there is no consistent hashing here.

use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between owner id and content id in composite keys.
pub const OWNER_SEPARATOR: char = ':';

/// Kinds of entity the router places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    User,
    Session,
    LinkedAccount,
    BackgroundTask,
    Thread,
    Post,
    Comment,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::User,
        EntityType::Session,
        EntityType::LinkedAccount,
        EntityType::BackgroundTask,
        EntityType::Thread,
        EntityType::Post,
        EntityType::Comment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Session => "session",
            EntityType::LinkedAccount => "linked_account",
            EntityType::BackgroundTask => "background_task",
            EntityType::Thread => "thread",
            EntityType::Post => "post",
            EntityType::Comment => "comment",
        }
    }

    /// Built-in shard type for this entity.
    pub fn default_shard_type(self) -> &'static str {
        match self {
            EntityType::User | EntityType::Session | EntityType::LinkedAccount => "users",
            EntityType::Thread | EntityType::Post | EntityType::Comment => "content",
            EntityType::BackgroundTask => "ai-tasks",
        }
    }

    /// Content entities route on their owner's id.
    pub fn is_content(self) -> bool {
        matches!(self, EntityType::Thread | EntityType::Post | EntityType::Comment)
    }

    /// Derive the routing key from an entity key.
    ///
    /// Fails with `InvalidInput` for an empty or whitespace-only key.
    pub fn routing_key(self, key: &str) -> Result<RoutingKey<'_>> {
        if key.trim().is_empty() {
            return Err(RouterError::invalid_input(self.as_str(), key, "empty routing key"));
        }

        if !self.is_content() {
            return Ok(RoutingKey {
                key,
                co_located: true,
            });
        }

        match key.split_once(OWNER_SEPARATOR) {
            Some((owner, _)) if !owner.trim().is_empty() => Ok(RoutingKey {
                key: owner,
                co_located: true,
            }),
            Some(_) => Err(RouterError::invalid_input(
                self.as_str(),
                key,
                "empty owner id before ':'",
            )),
            None => Ok(RoutingKey {
                key,
                co_located: false,
            }),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = RouterError;

    /// Accepts snake_case, kebab-case, camelCase or UPPER names.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "user" => Ok(EntityType::User),
            "session" => Ok(EntityType::Session),
            "linkedaccount" => Ok(EntityType::LinkedAccount),
            "backgroundtask" => Ok(EntityType::BackgroundTask),
            "thread" => Ok(EntityType::Thread),
            "post" => Ok(EntityType::Post),
            "comment" => Ok(EntityType::Comment),
            _ => Err(RouterError::invalid_input(s, "", "unknown entity type")),
        }
    }
}

/// Key actually hashed for placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingKey<'a> {
    pub key: &'a str,
    /// `false` when a content key had no owner prefix.
    pub co_located: bool,
}

/// Rolling multiplicative hash over UTF-16 code units, folded non-negative.
pub fn placement_hash(key: &str) -> u32 {
    let h = key
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    h.unsigned_abs()
}

/// Shard id for a routing key. `shard_count` must be non-zero.
pub fn shard_for(key: &str, shard_count: u32) -> u32 {
    debug_assert!(shard_count > 0);
    placement_hash(key) % shard_count.max(1)
}
