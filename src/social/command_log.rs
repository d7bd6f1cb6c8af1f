//! Post command log: ordering, dedup, merge and invariant checks.
//!
//! A log is a newest-first sequence of [`PostCommand`]s. Every mutator takes
//! `&self` and returns a new log, so merges stay pure and commutative.
//!
//! Canonical order is descending by `(epoch, timestamp)` with an absent epoch
//! treated as the greatest value: unsynced commands form the head of the log
//! and synced commands a trailing contiguous run in storage order.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::post::Post;
use crate::config::PROTOCOL_VERSION;
use crate::ids::PostId;
use crate::storage::{epoch_compare, Epoch};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("no prior command for post {post_id}")]
    NoPriorCommand { post_id: PostId },
    #[error("log invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostCommandType {
    Update,
    Remove,
}

/// One operation on a post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCommand {
    pub protocol_version: u32,
    /// Per-log logical clock.
    pub timestamp: u64,
    /// Timestamp of the command this one supersedes, 0 for a new post.
    pub parent_timestamp: u64,
    #[serde(rename = "type")]
    pub kind: PostCommandType,
    pub post: Post,
    /// Device that created the command.
    pub source: String,
    /// Set once the command is stored in its feed.
    pub epoch: Option<Epoch>,
    pub previous_epoch: Option<Epoch>,
}

impl PostCommand {
    pub fn is_synced(&self) -> bool {
        self.epoch.is_some()
    }

    fn key(&self) -> (u64, String) {
        (self.timestamp, self.source.clone())
    }
}

/// Canonical log order: newest first by `(epoch, timestamp)`.
fn canonical_order(a: &PostCommand, b: &PostCommand) -> Ordering {
    epoch_compare(b.epoch.as_ref(), a.epoch.as_ref()).then_with(|| b.timestamp.cmp(&a.timestamp))
}

/// Canonical order refined into a total order so sorting a multiset of
/// commands gives the same sequence whatever the input order.
fn total_order(a: &PostCommand, b: &PostCommand) -> Ordering {
    canonical_order(a, b)
        .then_with(|| b.source.cmp(&a.source))
        .then_with(|| {
            (b.kind, &b.post, b.parent_timestamp, b.previous_epoch, b.protocol_version).cmp(&(
                a.kind,
                &a.post,
                a.parent_timestamp,
                a.previous_epoch,
                a.protocol_version,
            ))
        })
}

/// Sort into canonical order and drop duplicate `(timestamp, source)` pairs.
///
/// When a command exists both unsynced and synced (an upload whose
/// acknowledgement was lost), the synced copy is kept.
pub fn sort_and_filter_post_commands(mut commands: Vec<PostCommand>) -> Vec<PostCommand> {
    commands.sort_by(total_order);

    let synced_keys: HashSet<(u64, String)> = commands
        .iter()
        .filter(|c| c.is_synced())
        .map(PostCommand::key)
        .collect();

    let mut seen = HashSet::new();
    commands
        .into_iter()
        .filter(|c| {
            let key = c.key();
            if !c.is_synced() && synced_keys.contains(&key) {
                return false;
            }
            seen.insert(key)
        })
        .collect()
}

/// Renumber unsynced commands above the highest synced timestamp.
///
/// Needed before uploading on top of a remote history whose clock ran ahead
/// of the local one. Parent references inside the unsynced run follow their
/// targets.
fn rebase_unsynced(mut commands: Vec<PostCommand>) -> Vec<PostCommand> {
    let unsynced_len = commands.iter().take_while(|c| !c.is_synced()).count();
    let Some(base) = commands[unsynced_len..].iter().map(|c| c.timestamp).max() else {
        return commands;
    };
    match commands[..unsynced_len].iter().map(|c| c.timestamp).min() {
        Some(lowest) if lowest <= base => {}
        _ => return commands,
    }
    if base.checked_add(unsynced_len as u64).is_none() {
        log::warn!("Cannot rebase {} unsynced commands above timestamp {}", unsynced_len, base);
        return commands;
    }

    let mut renumbered: HashMap<(PostId, u64), u64> = HashMap::new();
    for (rank, index) in (0..unsynced_len).rev().enumerate() {
        let command = &mut commands[index];
        let timestamp = base + 1 + rank as u64;
        if command.parent_timestamp != 0 {
            if let Some(parent) = renumbered.get(&(command.post.id.clone(), command.parent_timestamp)) {
                command.parent_timestamp = *parent;
            }
        }
        renumbered.insert((command.post.id.clone(), command.timestamp), timestamp);
        command.timestamp = timestamp;
    }
    log::debug!("Rebased {} unsynced commands above timestamp {}", unsynced_len, base);
    commands
}

/// Union of two logs in canonical order.
///
/// Commands keep their timestamps, so merging again with either input
/// changes nothing.
pub fn merge_post_command_logs(a: &PostCommandLog, b: &PostCommandLog) -> PostCommandLog {
    let mut commands = Vec::with_capacity(a.len() + b.len());
    commands.extend_from_slice(&a.commands);
    commands.extend_from_slice(&b.commands);
    PostCommandLog {
        commands: sort_and_filter_post_commands(commands),
    }
}

// ---------------------------------------------------------------------------
// PostCommandLog
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostCommandLog {
    commands: Vec<PostCommand>,
}

impl PostCommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from commands in any order.
    pub fn from_commands(commands: Vec<PostCommand>) -> Self {
        PostCommandLog {
            commands: sort_and_filter_post_commands(commands),
        }
    }

    /// Wrap commands already in canonical order.
    pub(crate) fn from_sorted(commands: Vec<PostCommand>) -> Self {
        PostCommandLog { commands }
    }

    pub fn commands(&self) -> &[PostCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn highest_seen_timestamp(&self) -> u64 {
        self.commands.iter().map(|c| c.timestamp).max().unwrap_or(0)
    }

    /// Epoch of the newest synced command.
    pub fn latest_epoch(&self) -> Option<Epoch> {
        self.commands.iter().find_map(|c| c.epoch)
    }

    /// Epoch of the head command, if the head is synced.
    pub fn head_epoch(&self) -> Option<Epoch> {
        self.commands.first().and_then(|c| c.epoch)
    }

    /// Timestamp of the newest command touching `post_id`.
    pub fn parent_timestamp_of(&self, post_id: &PostId) -> Option<u64> {
        self.commands
            .iter()
            .find(|c| &c.post.id == post_id)
            .map(|c| c.timestamp)
    }

    /// Leading run of commands not yet stored, newest first.
    pub fn unsynced_commands(&self) -> &[PostCommand] {
        let n = self.commands.iter().take_while(|c| !c.is_synced()).count();
        &self.commands[..n]
    }

    pub fn synced_commands(&self) -> &[PostCommand] {
        let n = self.unsynced_commands().len();
        &self.commands[n..]
    }

    /// Live posts, most recent first, at most `count` of them.
    ///
    /// A command is superseded when a newer command names its timestamp as
    /// parent. Remove commands are never returned. When concurrent updates of
    /// one post survive, the one first in log order wins.
    pub fn latest_posts(&self, count: Option<usize>) -> Vec<Post> {
        let mut superseded = HashSet::new();
        let mut returned = HashSet::new();
        let mut posts = Vec::new();

        for command in &self.commands {
            if posts.len() >= count.unwrap_or(usize::MAX) {
                break;
            }
            if command.parent_timestamp != 0 {
                superseded.insert(command.parent_timestamp);
            }
            if command.kind == PostCommandType::Remove || superseded.contains(&command.timestamp) {
                continue;
            }
            if returned.insert(command.post.id.clone()) {
                posts.push(command.post.clone());
            }
        }
        posts
    }

    // ── Mutators ───────────────────────────────────────────────────────

    /// Append an Update command for a new post.
    pub fn share_new_post(&self, post: Post, source: &str) -> PostCommandLog {
        self.with_new_head(PostCommandType::Update, post, source, 0)
    }

    /// Append an Update command superseding the newest command for `post.id`.
    pub fn update_post(&self, post: Post, source: &str) -> Result<PostCommandLog> {
        let parent = self
            .parent_timestamp_of(&post.id)
            .ok_or_else(|| LogError::NoPriorCommand {
                post_id: post.id.clone(),
            })?;
        Ok(self.with_new_head(PostCommandType::Update, post, source, parent))
    }

    /// Append a Remove command (tombstone) for `post.id`.
    pub fn remove_post(&self, post: &Post, source: &str) -> Result<PostCommandLog> {
        let parent = self
            .parent_timestamp_of(&post.id)
            .ok_or_else(|| LogError::NoPriorCommand {
                post_id: post.id.clone(),
            })?;
        Ok(self.with_new_head(PostCommandType::Remove, post.tombstone(), source, parent))
    }

    pub fn merge(&self, other: &PostCommandLog) -> PostCommandLog {
        merge_post_command_logs(self, other)
    }

    /// Same log with the unsynced run renumbered above the synced history,
    /// so the head carries the highest timestamp again.
    pub fn rebased(&self) -> PostCommandLog {
        PostCommandLog {
            commands: rebase_unsynced(self.commands.clone()),
        }
    }

    fn with_new_head(
        &self,
        kind: PostCommandType,
        post: Post,
        source: &str,
        parent_timestamp: u64,
    ) -> PostCommandLog {
        let command = PostCommand {
            protocol_version: PROTOCOL_VERSION,
            timestamp: self.highest_seen_timestamp() + 1,
            parent_timestamp,
            kind,
            post,
            source: source.to_string(),
            epoch: None,
            previous_epoch: self.head_epoch(),
        };
        let mut commands = Vec::with_capacity(self.commands.len() + 1);
        commands.push(command);
        commands.extend_from_slice(&self.commands);
        PostCommandLog { commands }
    }

    // ── Invariants ─────────────────────────────────────────────────────

    /// Check the structural invariants every stored or freshly mutated log
    /// must satisfy.
    pub fn check_invariants(&self) -> Result<()> {
        self.check_ordering()?;
        self.check_first_has_highest_timestamp()
    }

    /// Ordering part of the invariants: sorted, unique, unsynced run first.
    /// Holds for every merge result; the head timestamp is only restored by
    /// [`rebased`](Self::rebased) or an upload.
    pub fn check_ordering(&self) -> Result<()> {
        self.check_sorted_and_unique()?;
        self.check_no_unsynced_after_synced()
    }

    fn check_sorted_and_unique(&self) -> Result<()> {
        for (i, pair) in self.commands.windows(2).enumerate() {
            if canonical_order(&pair[0], &pair[1]) == Ordering::Greater {
                return Err(LogError::InvariantViolation(format!(
                    "commands {} and {} are out of order",
                    i,
                    i + 1
                )));
            }
        }
        let mut seen = HashSet::new();
        for command in &self.commands {
            if !seen.insert(command.key()) {
                return Err(LogError::InvariantViolation(format!(
                    "duplicate command (timestamp {}, source {})",
                    command.timestamp, command.source
                )));
            }
        }
        Ok(())
    }

    fn check_first_has_highest_timestamp(&self) -> Result<()> {
        if let Some(first) = self.commands.first() {
            let highest = self.highest_seen_timestamp();
            if first.timestamp != highest {
                return Err(LogError::InvariantViolation(format!(
                    "first command has timestamp {} but highest is {}",
                    first.timestamp, highest
                )));
            }
        }
        Ok(())
    }

    fn check_no_unsynced_after_synced(&self) -> Result<()> {
        let synced = self.unsynced_commands().len();
        if let Some(c) = self.commands[synced..].iter().find(|c| !c.is_synced()) {
            return Err(LogError::InvariantViolation(format!(
                "unsynced command with timestamp {} follows a synced command",
                c.timestamp
            )));
        }
        Ok(())
    }
}
