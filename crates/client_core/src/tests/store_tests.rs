use super::*;
use chrono::TimeZone;
use shared::{
    domain::{FileId, RoomId, UserId},
    protocol::AuthorProjection,
};

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + seconds, 0)
        .single()
        .expect("timestamp")
}

fn message(id: i64, author: i64, content: &str, created_at: DateTime<Utc>) -> ChatMessage {
    ChatMessage {
        id: MessageId(id),
        content: content.to_string(),
        author_id: UserId(author),
        author: AuthorProjection::placeholder(UserId(author)),
        room_id: RoomId(7),
        file_id: None,
        task_id: None,
        created_at,
        updated_at: created_at,
    }
}

/// A pending message the way a send builds it: id is the creation instant in
/// milliseconds.
fn pending(author: i64, content: &str, created_at: DateTime<Utc>) -> ChatMessage {
    message(created_at.timestamp_millis(), author, content, created_at)
}

fn ids(store: &ReconciliationStore) -> Vec<i64> {
    store.messages().map(|m| m.id.0).collect()
}

#[test]
fn write_confirmation_replaces_optimistic_entry_in_place() {
    let mut store = ReconciliationStore::default();
    store.apply_history(vec![message(1, 2, "hi", at(0))], None);

    let provisional = pending(9, "hello", at(10));
    let provisional_id = provisional.id;
    store.insert_pending(provisional);
    assert_eq!(store.len(), 2);
    assert_eq!(store.pending_count(), 1);

    let outcome = store.confirm(provisional_id, message(501, 9, "hello", at(11)), at(11));

    assert_eq!(outcome, MergeOutcome::Replaced { index: 1 });
    assert_eq!(ids(&store), vec![1, 501]);
    assert_eq!(store.pending_count(), 0);
}

#[test]
fn broadcast_then_confirmation_leaves_one_entry() {
    let mut store = ReconciliationStore::default();
    let provisional = pending(9, "hello", at(10));
    let provisional_id = provisional.id;
    store.insert_pending(provisional);

    let broadcast = store.merge(message(501, 9, "hello", at(11)), at(11));
    let confirmation = store.confirm(provisional_id, message(501, 9, "hello", at(11)), at(12));

    assert_eq!(broadcast, MergeOutcome::Replaced { index: 0 });
    assert_eq!(confirmation, MergeOutcome::Duplicate);
    assert_eq!(ids(&store), vec![501]);
}

#[test]
fn confirmation_then_broadcast_leaves_one_entry() {
    let mut store = ReconciliationStore::default();
    let provisional = pending(9, "hello", at(10));
    let provisional_id = provisional.id;
    store.insert_pending(provisional);

    let confirmation = store.confirm(provisional_id, message(501, 9, "hello", at(11)), at(11));
    let broadcast = store.merge(message(501, 9, "hello", at(11)), at(12));

    assert_eq!(confirmation, MergeOutcome::Replaced { index: 0 });
    assert_eq!(broadcast, MergeOutcome::Duplicate);
    assert_eq!(ids(&store), vec![501]);
}

#[test]
fn trimmed_content_is_the_match_key() {
    let mut store = ReconciliationStore::default();
    store.insert_pending(pending(9, "hello", at(10)));

    let outcome = store.merge(message(501, 9, "  hello \n", at(11)), at(11));

    assert_eq!(outcome, MergeOutcome::Replaced { index: 0 });
    assert_eq!(store.len(), 1);
}

#[test]
fn repeated_broadcast_is_idempotent() {
    let mut store = ReconciliationStore::default();
    let frame = message(42, 3, "ship it", at(5));

    assert!(store.merge(frame.clone(), at(5)).changed());
    assert!(!store.merge(frame, at(6)).changed());
    assert_eq!(ids(&store), vec![42]);
}

#[test]
fn other_author_with_same_content_does_not_claim_pending_entry() {
    let mut store = ReconciliationStore::default();
    store.insert_pending(pending(9, "ok", at(10)));

    let outcome = store.merge(message(77, 4, "ok", at(10)), at(10));

    assert!(matches!(outcome, MergeOutcome::Inserted { .. }));
    assert_eq!(store.len(), 2);
    assert_eq!(store.pending_count(), 1);
}

#[test]
fn stale_pending_entry_is_not_matched_by_broadcast() {
    let mut store = ReconciliationStore::default();
    let provisional = pending(9, "late", at(0));
    let provisional_id = provisional.id;
    store.insert_pending(provisional);

    let broadcast = store.merge(message(600, 9, "late", at(1)), at(30));
    assert!(matches!(broadcast, MergeOutcome::Inserted { .. }));
    assert_eq!(store.len(), 2);

    // The write response still knows which pending entry it belongs to.
    let confirmation = store.confirm(provisional_id, message(600, 9, "late", at(1)), at(31));
    assert_eq!(confirmation, MergeOutcome::Superseded { removed: 0 });
    assert_eq!(ids(&store), vec![600]);
}

#[test]
fn failed_write_rolls_back_pending_entry() {
    let mut store = ReconciliationStore::default();
    store.apply_history(vec![message(1, 2, "hi", at(0))], None);
    let provisional = pending(9, "nope", at(10));
    let provisional_id = provisional.id;
    store.insert_pending(provisional);

    assert!(store.remove_pending(provisional_id));
    assert!(!store.remove_pending(provisional_id));
    assert_eq!(ids(&store), vec![1]);
}

#[test]
fn near_identical_confirmed_frames_collapse_by_default() {
    let mut store = ReconciliationStore::new(crate::config::ClientSettings::default().merge_policy());

    assert!(store.merge(message(10, 5, "ok", at(10)), at(10)).changed());
    assert_eq!(
        store.merge(message(11, 5, "ok ", at(11)), at(11)),
        MergeOutcome::Duplicate
    );
    // Outside the tolerance it is a new send.
    assert!(store.merge(message(12, 5, "ok", at(20)), at(20)).changed());
    assert_eq!(ids(&store), vec![10, 12]);
}

#[test]
fn own_confirmation_wins_over_content_window() {
    let mut store = ReconciliationStore::default();
    store.merge(message(10, 5, "ok", at(10)), at(10));
    let provisional = pending(5, "ok", at(11));
    let provisional_id = provisional.id;
    store.insert_pending(provisional);

    let outcome = store.confirm(provisional_id, message(11, 5, "ok", at(11)), at(11));

    assert_eq!(outcome, MergeOutcome::Replaced { index: 1 });
    assert_eq!(ids(&store), vec![10, 11]);
}

#[test]
fn durable_id_strategy_keeps_two_clients_apart() {
    let mut store = ReconciliationStore::new(MergePolicy {
        dedup: DedupStrategy::DurableId,
        ..MergePolicy::default()
    });
    let provisional = pending(5, "ok", at(10));
    let provisional_id = provisional.id;
    store.insert_pending(provisional);

    store.confirm(provisional_id, message(10, 5, "ok", at(10)), at(10));
    let other_client = store.merge(message(11, 5, "ok", at(11)), at(11));

    assert!(matches!(other_client, MergeOutcome::Inserted { .. }));
    assert_eq!(ids(&store), vec![10, 11]);
}

#[test]
fn inserts_keep_creation_order() {
    let mut store = ReconciliationStore::default();
    store.apply_history(
        vec![message(1, 1, "a", at(0)), message(3, 1, "c", at(20))],
        None,
    );

    store.merge(message(2, 2, "b", at(10)), at(21));
    store.merge(message(4, 2, "d", at(30)), at(31));

    assert_eq!(ids(&store), vec![1, 2, 3, 4]);
}

#[test]
fn history_reload_keeps_pending_entries_and_skips_known_ids() {
    let mut store = ReconciliationStore::default();
    store.apply_history(vec![message(1, 2, "hi", at(0))], None);
    store.insert_pending(pending(9, "typing", at(50)));

    let added = store.apply_history(
        vec![message(1, 2, "hi", at(0)), message(2, 3, "yo", at(5))],
        None,
    );

    assert_eq!(added, 1);
    assert_eq!(store.len(), 3);
    assert_eq!(store.pending_count(), 1);
    assert!(store.entries().last().expect("tail").is_pending());
}

#[test]
fn tracks_loaded_scopes() {
    let mut store = ReconciliationStore::default();
    let file = ChatFilter::File(FileId(4));
    assert!(!store.has_loaded(None));

    store.apply_history(Vec::new(), Some(file));
    assert!(store.has_loaded(Some(&file)));
    assert!(!store.has_loaded(None));

    store.apply_history(Vec::new(), None);
    assert!(store.has_loaded(Some(&ChatFilter::File(FileId(99)))));
}

#[test]
fn parses_dedup_strategy_names() {
    assert_eq!(
        DedupStrategy::parse("content_window"),
        Some(DedupStrategy::ContentWindow)
    );
    assert_eq!(
        DedupStrategy::parse(" Durable_Id "),
        Some(DedupStrategy::DurableId)
    );
    assert_eq!(DedupStrategy::parse("fuzzy"), None);
}
