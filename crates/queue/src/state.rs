//! In-memory queue storage with a logical head offset.
//!
//! Dequeuing only advances `offset`; the backing vector is compacted once the
//! consumed prefix reaches half of its length, so a dequeue is O(1) amortized
//! and already-delivered slots cannot pile up.

use serde::{Deserialize, Serialize};

use herald_common::types::MessagePayload;

/// One pending notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    #[serde(alias = "id")]
    pub recipient_id: String,
    #[serde(alias = "token")]
    pub auth_token: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(rename = "message")]
    pub payload: MessagePayload,
}

impl QueueItem {
    pub fn new(
        recipient_id: impl Into<String>,
        auth_token: impl Into<String>,
        thread_id: Option<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            auth_token: auth_token.into(),
            thread_id,
            payload,
        }
    }
}

/// FIFO queue state, also the on-disk snapshot document.
///
/// Invariant: `offset <= items.len()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawState")]
pub struct QueueState {
    offset: usize,
    #[serde(rename = "queue")]
    items: Vec<QueueItem>,
}

#[derive(Deserialize)]
struct RawState {
    #[serde(default)]
    offset: usize,
    queue: Vec<QueueItem>,
}

impl From<RawState> for QueueState {
    fn from(raw: RawState) -> Self {
        Self::from_parts(raw.offset, raw.queue)
    }
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a state from persisted parts, clamping a corrupt offset.
    pub fn from_parts(offset: usize, items: Vec<QueueItem>) -> Self {
        let offset = offset.min(items.len());
        Self { offset, items }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Backing slots, including the logically removed prefix.
    pub fn capacity_used(&self) -> usize {
        self.items.len()
    }

    /// Number of items still waiting for delivery.
    pub fn len(&self) -> usize {
        self.items.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueue(&mut self, item: QueueItem) {
        self.items.push(item);
    }

    /// Pop the head item, compacting once half of the slots are consumed.
    pub fn dequeue(&mut self) -> Option<QueueItem> {
        if self.is_empty() {
            return None;
        }

        let item = self.items[self.offset].clone();
        self.offset += 1;

        if self.offset * 2 >= self.items.len() {
            self.items.drain(..self.offset);
            self.offset = 0;
        }

        Some(item)
    }

    /// Put an item back in front of every pending item.
    pub fn requeue_front(&mut self, item: QueueItem) {
        if self.offset > 0 {
            self.offset -= 1;
            self.items[self.offset] = item;
        } else {
            self.items.insert(0, item);
        }
    }

    /// Pending items in delivery order.
    pub fn pending(&self) -> impl Iterator<Item = &QueueItem> {
        self.items[self.offset..].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(recipient: &str) -> QueueItem {
        QueueItem::new(
            recipient,
            format!("{recipient}-token"),
            None,
            MessagePayload::text(format!("hello {recipient}")),
        )
    }

    fn drain(state: &mut QueueState) -> Vec<String> {
        std::iter::from_fn(|| state.dequeue())
            .map(|i| i.recipient_id)
            .collect()
    }

    #[test]
    fn test_dequeue_empty_returns_none() {
        let mut state = QueueState::new();
        assert!(state.dequeue().is_none());
        assert_eq!(state.offset(), 0);
    }

    #[test]
    fn test_fifo_order() {
        let mut state = QueueState::new();
        for r in ["a", "b", "c", "d", "e"] {
            state.enqueue(item(r));
        }
        assert_eq!(drain(&mut state), vec!["a", "b", "c", "d", "e"]);
        assert!(state.is_empty());
        assert_eq!(state.capacity_used(), 0);
    }

    #[test]
    fn test_offset_advances_before_half() {
        let mut state = QueueState::new();
        for r in ["a", "b", "c", "d", "e"] {
            state.enqueue(item(r));
        }

        // 1 * 2 < 5: no compaction yet
        assert_eq!(state.dequeue().unwrap().recipient_id, "a");
        assert_eq!(state.offset(), 1);
        assert_eq!(state.capacity_used(), 5);
        assert_eq!(state.len(), 4);

        // 2 * 2 < 5: still none
        state.dequeue();
        assert_eq!(state.offset(), 2);

        // 3 * 2 >= 5: compacted
        state.dequeue();
        assert_eq!(state.offset(), 0);
        assert_eq!(state.capacity_used(), 2);
        let rest: Vec<_> = state.pending().map(|i| i.recipient_id.as_str()).collect();
        assert_eq!(rest, vec!["d", "e"]);
    }

    #[test]
    fn test_offset_never_exceeds_len_under_interleaving() {
        let mut state = QueueState::new();
        let mut next = 0u32;
        for round in 0..50 {
            for _ in 0..(round % 4) {
                state.enqueue(item(&format!("r{next}")));
                next += 1;
            }
            for _ in 0..(round % 3) {
                state.dequeue();
            }
            assert!(state.offset() <= state.capacity_used());
            if state.capacity_used() > 0 {
                assert!(state.offset() * 2 < state.capacity_used());
            }
        }
    }

    #[test]
    fn test_from_parts_clamps_offset() {
        let state = QueueState::from_parts(7, vec![item("a"), item("b")]);
        assert_eq!(state.offset(), 2);
        assert!(state.is_empty());
    }

    #[test]
    fn test_requeue_front_reuses_consumed_slot() {
        let mut state = QueueState::from_parts(1, vec![item("a"), item("b"), item("c"), item("d")]);
        state.requeue_front(item("x"));
        assert_eq!(state.offset(), 0);
        assert_eq!(drain(&mut state), vec!["x", "b", "c", "d"]);
    }

    #[test]
    fn test_requeue_front_without_slack() {
        let mut state = QueueState::new();
        state.enqueue(item("b"));
        state.requeue_front(item("a"));
        assert_eq!(drain(&mut state), vec!["a", "b"]);
    }

    #[test]
    fn test_snapshot_document_shape() {
        let mut state = QueueState::new();
        state.enqueue(QueueItem::new(
            "123",
            "secret",
            Some("456".to_string()),
            MessagePayload::text("hi"),
        ));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "offset": 0,
                "queue": [{
                    "recipientId": "123",
                    "authToken": "secret",
                    "threadId": "456",
                    "message": { "content": "hi", "embeds": [], "components": [] }
                }]
            })
        );
    }

    #[test]
    fn test_legacy_item_keys_accepted() {
        let state: QueueState = serde_json::from_value(serde_json::json!({
            "offset": 0,
            "queue": [{
                "id": "123",
                "token": "secret",
                "threadId": null,
                "message": { "content": "hi" }
            }]
        }))
        .unwrap();
        let head = state.pending().next().unwrap();
        assert_eq!(head.recipient_id, "123");
        assert_eq!(head.auth_token, "secret");
        assert_eq!(head.thread_id, None);
    }
}
