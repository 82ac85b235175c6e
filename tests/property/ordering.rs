//! Property-based tests for task ordering, text validation, and frame decoding.
//!
//! Uses proptest to verify:
//! 1. `sort_newest_first` yields non-increasing `created_at` with pending tasks first.
//! 2. The sort is stable: equal timestamps keep their input order.
//! 3. `normalize_text` accepts exactly the trimmed texts of 1..=100 characters.
//! 4. Random bytes never cause a panic in the frame decoders.

use proptest::prelude::*;
use tasklist_proto::task::{
    Identity, MAX_TASK_TEXT_LENGTH, Task, TaskId, TextError, Timestamp, normalize_text,
    sort_newest_first,
};
use tasklist_proto::wire;
use uuid::Uuid;

// --- Strategies ---

/// Strategy for `created_at`: mostly committed, sometimes pending, drawn from a
/// small range so ties are common.
fn arb_created_at() -> impl Strategy<Value = Option<Timestamp>> {
    prop_oneof![
        1 => Just(None),
        4 => (0u64..20).prop_map(|ms| Some(Timestamp::from_millis(ms))),
    ]
}

/// Strategy for a task list. Each task's id encodes its input position.
fn arb_tasks() -> impl Strategy<Value = Vec<Task>> {
    prop::collection::vec((arb_created_at(), any::<bool>()), 0..40).prop_map(|entries| {
        entries
            .into_iter()
            .enumerate()
            .map(|(index, (created_at, completed))| Task {
                id: TaskId::from_uuid(Uuid::from_u128(index as u128)),
                text: format!("task {index}"),
                completed,
                owner: Identity::new("owner"),
                created_at,
            })
            .collect()
    })
}

fn position(task: &Task) -> u128 {
    task.id.as_uuid().as_u128()
}

// --- Ordering ---

proptest! {
    #[test]
    fn sorted_tasks_are_newest_first(mut tasks in arb_tasks()) {
        sort_newest_first(&mut tasks);

        let first_committed = tasks
            .iter()
            .position(|t| t.created_at.is_some())
            .unwrap_or(tasks.len());
        prop_assert!(tasks[first_committed..].iter().all(|t| t.created_at.is_some()));
        prop_assert!(tasks[..first_committed].iter().all(|t| t.created_at.is_none()));

        for pair in tasks[first_committed..].windows(2) {
            prop_assert!(pair[0].created_at >= pair[1].created_at);
        }
    }

    #[test]
    fn equal_timestamps_keep_input_order(mut tasks in arb_tasks()) {
        sort_newest_first(&mut tasks);

        for pair in tasks.windows(2) {
            if pair[0].created_at == pair[1].created_at {
                prop_assert!(position(&pair[0]) < position(&pair[1]));
            }
        }
    }

    #[test]
    fn sorting_keeps_every_task(tasks in arb_tasks()) {
        let mut sorted = tasks.clone();
        sort_newest_first(&mut sorted);

        let mut before: Vec<u128> = tasks.iter().map(position).collect();
        let mut after: Vec<u128> = sorted.iter().map(position).collect();
        before.sort_unstable();
        after.sort_unstable();
        prop_assert_eq!(before, after);
    }
}

// --- Text validation ---

proptest! {
    #[test]
    fn normalized_text_is_trimmed_and_bounded(
        body in "[a-zA-Z0-9 ]{0,120}",
        pad in "[ \t]{0,4}",
    ) {
        let raw = format!("{pad}{body}{pad}");
        let trimmed = raw.trim();
        let len = trimmed.chars().count();

        match normalize_text(&raw) {
            Ok(text) => {
                prop_assert_eq!(text.as_str(), trimmed);
                prop_assert!((1..=MAX_TASK_TEXT_LENGTH).contains(&len));
            }
            Err(TextError::Empty) => prop_assert_eq!(len, 0),
            Err(TextError::TooLong) => prop_assert!(len > MAX_TASK_TEXT_LENGTH),
        }
    }

    #[test]
    fn text_length_counts_characters(count in 1usize..=MAX_TASK_TEXT_LENGTH) {
        let text = "é".repeat(count);
        prop_assert_eq!(normalize_text(&text), Ok(text.clone()));
    }
}

// --- Frame decoding ---

proptest! {
    /// Random bytes never cause a panic when decoded.
    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = wire::decode_client(&bytes);
        let _ = wire::decode_server(&bytes);
    }
}
