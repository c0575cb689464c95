// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

use otto_model::{ConversationItem, ItemPayload};

/// Ordered conversation history keyed by dense sequence numbers.
///
/// Invariant: `items[i].seq == i` for every item.  Any mutation that
/// removes items renumbers the survivors, which is why clients syncing by
/// sequence number must handle the compaction signal from
/// [`HistoryStore::items_since`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStore {
    items: Vec<ConversationItem>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    /// Stamp and append; returns the assigned sequence number.
    pub fn append(&mut self, mut item: ConversationItem) -> u64 {
        let seq = self.items.len() as u64;
        item.seq = seq;
        self.items.push(item);
        seq
    }

    /// Defensive copy of the whole history for prompt assembly.
    pub fn items_for_prompt(&self) -> Vec<ConversationItem> {
        self.items.clone()
    }

    /// Items from index `start` onward (incremental prompt delta).
    pub fn items_from(&self, start: usize) -> Vec<ConversationItem> {
        self.items.iter().skip(start).cloned().collect()
    }

    /// Items with `seq > since_seq`.
    ///
    /// When `since_seq` lies beyond the current range the sequence space
    /// was reset by compaction; all items are returned with
    /// `compacted = true` so the caller re-syncs from scratch.
    pub fn items_since(&self, since_seq: i64) -> (Vec<ConversationItem>, bool) {
        if since_seq >= self.items.len() as i64 {
            return (self.items.clone(), true);
        }
        let delta = self
            .items
            .iter()
            .filter(|item| item.seq as i64 > since_seq)
            .cloned()
            .collect();
        (delta, false)
    }

    pub fn latest_seq(&self) -> i64 {
        self.items.len() as i64 - 1
    }

    /// Cheap token estimate (text length / 4), summed over all items.
    pub fn estimate_tokens(&self) -> u64 {
        self.items.iter().map(|i| i.approx_tokens() as u64).sum()
    }

    /// Number of turns started so far.
    pub fn turn_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.payload, ItemPayload::TurnStarted))
            .count()
    }

    /// True while a `TurnStarted` lacks its matching `TurnComplete`.
    pub fn has_open_turn(&self) -> bool {
        let complete = self
            .items
            .iter()
            .filter(|i| matches!(i.payload, ItemPayload::TurnComplete { .. }))
            .count();
        self.turn_count() > complete
    }

    /// Turn ids whose `TurnStarted` has no matching `TurnComplete`, in
    /// start order.
    pub fn open_turn_ids(&self) -> Vec<String> {
        let mut open = Vec::new();
        for item in &self.items {
            match &item.payload {
                ItemPayload::TurnStarted => {
                    if let Some(id) = &item.turn_id {
                        open.push(id.clone());
                    }
                }
                ItemPayload::TurnComplete { .. } => {
                    if let Some(id) = &item.turn_id {
                        open.retain(|open_id| open_id != id);
                    }
                }
                _ => {}
            }
        }
        open
    }

    /// Drop everything before the last `keep_n` turns and renumber.
    /// Returns the number of turns dropped; a no-op when fewer than
    /// `keep_n` turns exist.
    pub fn drop_oldest_user_turns(&mut self, keep_n: usize) -> usize {
        let starts: Vec<usize> = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, i)| matches!(i.payload, ItemPayload::TurnStarted))
            .map(|(idx, _)| idx)
            .collect();
        if starts.len() <= keep_n {
            return 0;
        }
        let dropped_turns = starts.len() - keep_n;
        let cut = starts[dropped_turns];
        self.items.drain(..cut);
        self.renumber();
        dropped_turns
    }

    /// Replace the whole history (compaction).  Input is deep-copied and
    /// renumbered from zero.
    pub fn replace_all(&mut self, items: &[ConversationItem]) {
        self.items = items.to_vec();
        self.renumber();
    }

    /// Content of the most recent assistant message, if any.
    pub fn last_assistant_message(&self) -> Option<String> {
        self.items.iter().rev().find_map(|i| match &i.payload {
            ItemPayload::AssistantMessage { content } => Some(content.clone()),
            _ => None,
        })
    }

    /// The most recent model-switch item, if any.
    pub fn last_model_switch(&self) -> Option<ConversationItem> {
        self.items
            .iter()
            .rev()
            .find(|i| matches!(i.payload, ItemPayload::ModelSwitch { .. }))
            .cloned()
    }

    fn renumber(&mut self) {
        for (idx, item) in self.items.iter_mut().enumerate() {
            item.seq = idx as u64;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use otto_model::FunctionCallOutputPayload;

    fn turn(h: &mut HistoryStore, id: &str, user: &str, assistant: &str) {
        h.append(ConversationItem::with_turn(ItemPayload::TurnStarted, id));
        h.append(ConversationItem::user_message(user, id));
        h.append(ConversationItem::assistant_message(assistant));
        h.append(ConversationItem::with_turn(
            ItemPayload::TurnComplete { content: None },
            id,
        ));
    }

    // ── Sequence invariant ────────────────────────────────────────────────────

    #[test]
    fn append_assigns_dense_sequence() {
        let mut h = HistoryStore::new();
        for i in 0..5 {
            let seq = h.append(ConversationItem::assistant_message(format!("m{i}")));
            assert_eq!(seq, i as u64);
        }
        for (idx, item) in h.items().iter().enumerate() {
            assert_eq!(item.seq, idx as u64);
        }
    }

    #[test]
    fn latest_seq_of_empty_history_is_minus_one() {
        assert_eq!(HistoryStore::new().latest_seq(), -1);
    }

    // ── items_since ───────────────────────────────────────────────────────────

    #[test]
    fn items_since_returns_delta() {
        let mut h = HistoryStore::new();
        turn(&mut h, "t1", "hi", "hello");
        let (delta, compacted) = h.items_since(1);
        assert!(!compacted);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[0].seq, 2);
    }

    #[test]
    fn items_since_latest_is_empty() {
        let mut h = HistoryStore::new();
        turn(&mut h, "t1", "hi", "hello");
        let (delta, compacted) = h.items_since(h.latest_seq());
        assert!(delta.is_empty());
        assert!(!compacted);
    }

    #[test]
    fn items_since_beyond_range_signals_compaction() {
        let mut h = HistoryStore::new();
        turn(&mut h, "t1", "hi", "hello");
        let (delta, compacted) = h.items_since(h.latest_seq() + 5);
        assert!(compacted);
        assert_eq!(delta.len(), h.len());
    }

    // ── Token estimation ──────────────────────────────────────────────────────

    #[test]
    fn estimate_tokens_sums_item_text() {
        let mut h = HistoryStore::new();
        h.append(ConversationItem::assistant_message("12345678")); // 2 tokens
        h.append(ConversationItem::new(ItemPayload::FunctionCallOutput {
            call_id: "c".into(),
            output: FunctionCallOutputPayload::ok("abcd"), // 1 token
        }));
        assert_eq!(h.estimate_tokens(), 3);
    }

    // ── drop_oldest_user_turns ────────────────────────────────────────────────

    #[test]
    fn drop_oldest_keeps_last_n_turns() {
        let mut h = HistoryStore::new();
        for i in 0..4 {
            turn(&mut h, &format!("t{i}"), &format!("u{i}"), &format!("a{i}"));
        }
        let dropped = h.drop_oldest_user_turns(2);
        assert_eq!(dropped, 2);
        assert_eq!(h.turn_count(), 2);
        // renumbered from zero
        assert_eq!(h.items()[0].seq, 0);
        assert!(matches!(h.items()[0].payload, ItemPayload::TurnStarted));
        assert_eq!(h.items()[1].as_text(), Some("u2"));
    }

    #[test]
    fn drop_oldest_with_fewer_turns_is_noop() {
        let mut h = HistoryStore::new();
        turn(&mut h, "t1", "u", "a");
        let before = h.len();
        assert_eq!(h.drop_oldest_user_turns(3), 0);
        assert_eq!(h.len(), before);
    }

    // ── replace_all ───────────────────────────────────────────────────────────

    #[test]
    fn replace_all_renumbers_from_zero() {
        let mut h = HistoryStore::new();
        turn(&mut h, "t1", "u", "a");
        let replacement = vec![ConversationItem::new(ItemPayload::Compaction {
            content: "summary".into(),
        })];
        h.replace_all(&replacement);
        assert_eq!(h.len(), 1);
        assert_eq!(h.items()[0].seq, 0);
    }

    // ── Turn bookkeeping ──────────────────────────────────────────────────────

    #[test]
    fn open_turn_is_detected() {
        let mut h = HistoryStore::new();
        h.append(ConversationItem::with_turn(ItemPayload::TurnStarted, "t1"));
        h.append(ConversationItem::user_message("hi", "t1"));
        assert!(h.has_open_turn());
        h.append(ConversationItem::with_turn(
            ItemPayload::TurnComplete { content: None },
            "t1",
        ));
        assert!(!h.has_open_turn());
    }

    #[test]
    fn last_model_switch_finds_most_recent() {
        let mut h = HistoryStore::new();
        h.append(ConversationItem::new(ItemPayload::ModelSwitch {
            previous: "a".into(),
            current: "b".into(),
        }));
        h.append(ConversationItem::new(ItemPayload::ModelSwitch {
            previous: "b".into(),
            current: "c".into(),
        }));
        match h.last_model_switch().map(|i| i.payload) {
            Some(ItemPayload::ModelSwitch { current, .. }) => assert_eq!(current, "c"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
