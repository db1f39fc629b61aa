//! Ordered, de-duplicated message sequence for one room.
//!
//! Three sources feed the store: bulk history loads, optimistic inserts made
//! at send time, and confirmed messages (write responses and broadcasts).
//! Confirmed candidates go through [`ReconciliationStore::merge`] or
//! [`ReconciliationStore::confirm`]:
//!
//! 0. a confirmed entry with the same durable id already exists: discard;
//! 1. a recent pending entry by the same author with the same trimmed content
//!    exists: replace it in place;
//! 2. under [`DedupStrategy::ContentWindow`], a confirmed entry by the same
//!    author with the same trimmed content created within the tolerance
//!    exists: discard;
//! 3. otherwise insert by creation time (normally the tail).

use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::{domain::MessageId, protocol::ChatMessage};
use tracing::debug;

use crate::filter::{self, ChatFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Inserted locally, durable write not yet reconciled.
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message: ChatMessage,
    pub delivery: Delivery,
}

impl StoredMessage {
    fn pending(message: ChatMessage) -> Self {
        Self {
            message,
            delivery: Delivery::Pending,
        }
    }

    fn confirmed(message: ChatMessage) -> Self {
        Self {
            message,
            delivery: Delivery::Confirmed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == Delivery::Pending
    }
}

/// How confirmed candidates are recognised as repeats of existing entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DedupStrategy {
    /// Durable ids are authoritative: different ids are different sends.
    DurableId,
    /// Also treat same author + same content within the tolerance as one
    /// send, even when the durable ids differ.
    #[default]
    ContentWindow,
}

impl DedupStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "durable_id" => Some(Self::DurableId),
            "content_window" => Some(Self::ContentWindow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    pub optimistic_window: Duration,
    pub duplicate_tolerance: Duration,
    pub dedup: DedupStrategy,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            optimistic_window: Duration::from_secs(10),
            duplicate_tolerance: Duration::from_secs(5),
            dedup: DedupStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A pending entry was promoted in place.
    Replaced { index: usize },
    Inserted { index: usize },
    Duplicate,
    /// The candidate was already present, so the pending entry that
    /// produced it was dropped.
    Superseded { removed: usize },
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationStore {
    entries: Vec<StoredMessage>,
    loaded_scopes: Vec<Option<ChatFilter>>,
    policy: MergePolicy,
}

impl ReconciliationStore {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            entries: Vec::new(),
            loaded_scopes: Vec::new(),
            policy,
        }
    }

    pub fn entries(&self) -> &[StoredMessage] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|entry| &entry.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_pending()).count()
    }

    pub fn visible(&self, filter: Option<&ChatFilter>) -> Vec<&ChatMessage> {
        filter::project(self.messages(), filter)
    }

    /// Appends a locally authored message ahead of its durable write.
    pub fn insert_pending(&mut self, message: ChatMessage) -> usize {
        self.entries.push(StoredMessage::pending(message));
        self.entries.len() - 1
    }

    /// Rolls back a pending entry whose durable write failed.
    pub fn remove_pending(&mut self, provisional_id: MessageId) -> bool {
        match self.pending_index(provisional_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Merges a broadcast candidate.
    pub fn merge(&mut self, candidate: ChatMessage, now: DateTime<Utc>) -> MergeOutcome {
        self.merge_candidate(candidate, None, now)
    }

    /// Merges the durable-write response for the send that inserted
    /// `provisional_id`. That pending entry is preferred over any other
    /// optimistic match and is matched even after the window has elapsed.
    pub fn confirm(
        &mut self,
        provisional_id: MessageId,
        candidate: ChatMessage,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        self.merge_candidate(candidate, Some(provisional_id), now)
    }

    /// Merges a bulk load for `scope`; entries already present by durable id
    /// are kept as they are. Returns how many entries were added.
    pub fn apply_history(
        &mut self,
        messages: Vec<ChatMessage>,
        scope: Option<ChatFilter>,
    ) -> usize {
        let mut added = 0;
        for message in messages {
            if self.confirmed_index(message.id).is_some() {
                continue;
            }
            let index = self.insertion_index(message.created_at);
            self.entries.insert(index, StoredMessage::confirmed(message));
            added += 1;
        }
        if !self.loaded_scopes.contains(&scope) {
            self.loaded_scopes.push(scope);
        }
        added
    }

    pub fn has_loaded(&self, scope: Option<&ChatFilter>) -> bool {
        self.loaded_scopes
            .iter()
            .any(|loaded| filter::scope_covers(loaded.as_ref(), scope))
    }

    fn merge_candidate(
        &mut self,
        candidate: ChatMessage,
        provisional_id: Option<MessageId>,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let own_pending = provisional_id.and_then(|id| self.pending_index(id));

        if self.confirmed_index(candidate.id).is_some() {
            if let Some(removed) = own_pending {
                self.entries.remove(removed);
                debug!(
                    message_id = candidate.id.0,
                    "chat: dropped pending entry already confirmed elsewhere"
                );
                return MergeOutcome::Superseded { removed };
            }
            debug!(message_id = candidate.id.0, "chat: discarded repeated message");
            return MergeOutcome::Duplicate;
        }

        if let Some(index) = own_pending.or_else(|| self.optimistic_match(&candidate, now)) {
            debug!(
                message_id = candidate.id.0,
                index, "chat: promoted pending entry in place"
            );
            self.entries[index] = StoredMessage::confirmed(candidate);
            return MergeOutcome::Replaced { index };
        }

        if self.policy.dedup == DedupStrategy::ContentWindow && self.content_duplicate(&candidate) {
            debug!(
                message_id = candidate.id.0,
                "chat: discarded message matching a recent confirmed entry"
            );
            return MergeOutcome::Duplicate;
        }

        let index = self.insertion_index(candidate.created_at);
        self.entries.insert(index, StoredMessage::confirmed(candidate));
        MergeOutcome::Inserted { index }
    }

    fn pending_index(&self, provisional_id: MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.is_pending() && entry.message.id == provisional_id)
    }

    fn confirmed_index(&self, id: MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| !entry.is_pending() && entry.message.id == id)
    }

    fn optimistic_match(&self, candidate: &ChatMessage, now: DateTime<Utc>) -> Option<usize> {
        let window_ms = i64::try_from(self.policy.optimistic_window.as_millis()).unwrap_or(i64::MAX);
        let now_ms = now.timestamp_millis();
        self.entries.iter().position(|entry| {
            entry.is_pending()
                && now_ms.saturating_sub(entry.message.id.0) <= window_ms
                && same_send(&entry.message, candidate)
        })
    }

    fn content_duplicate(&self, candidate: &ChatMessage) -> bool {
        let tolerance_ms =
            i64::try_from(self.policy.duplicate_tolerance.as_millis()).unwrap_or(i64::MAX);
        self.entries.iter().any(|entry| {
            !entry.is_pending()
                && same_send(&entry.message, candidate)
                && (entry.message.created_at - candidate.created_at)
                    .num_milliseconds()
                    .abs()
                    <= tolerance_ms
        })
    }

    /// Position after the last entry created no later than `created_at`.
    fn insertion_index(&self, created_at: DateTime<Utc>) -> usize {
        self.entries
            .iter()
            .rposition(|entry| entry.message.created_at <= created_at)
            .map_or(0, |index| index + 1)
    }
}

fn same_send(a: &ChatMessage, b: &ChatMessage) -> bool {
    a.author_id == b.author_id && a.trimmed_content() == b.trimmed_content()
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
