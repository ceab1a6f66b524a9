//! Time-indexed content view.
//!
//! The view is a bounded, ordered sequence of [`ViewItem`]s over content
//! store allocations, shared logically between the producer (appending at
//! `head`) and the uploader (reading at `current`, trimming at `tail`).
//! Indices are absolute and strictly increasing for the life of the view.
//!
//! The view decides *what* falls out of the window; releasing storage and
//! accounting is the caller's job. Every operation that can evict items
//! returns the evicted records instead of calling back into locked state.

use std::collections::VecDeque;

use crate::error::{StreamError, StreamResult};
use crate::store::AllocHandle;
use crate::time::Ticks;

/// No item flags.
pub const ITEM_FLAG_NONE: u32 = 0;
/// First item of a fresh MKV container (carries the stream header).
pub const ITEM_FLAG_STREAM_START: u32 = 1 << 0;
/// First item of a cluster.
pub const ITEM_FLAG_FRAGMENT_START: u32 = 1 << 1;
/// Item closing a fragment run (end-of-fragment tag).
pub const ITEM_FLAG_FRAGMENT_END: u32 = 1 << 2;
/// A buffering ACK was correlated to this item.
pub const ITEM_FLAG_BUFFERING_ACK: u32 = 1 << 3;
/// A received ACK was correlated to this item.
pub const ITEM_FLAG_RECEIVED_ACK: u32 = 1 << 4;
/// A persisted ACK was correlated to this item.
pub const ITEM_FLAG_PERSISTED_ACK: u32 = 1 << 5;
/// Item belongs to a fragment rejected with a non-retriable error ACK;
/// skipped when serving data.
pub const ITEM_FLAG_SKIP: u32 = 1 << 6;

/// One buffered entry: a packaged frame (or tag run) inside an allocation.
#[derive(Debug, Clone, Copy)]
pub struct ViewItem {
    /// Absolute, strictly increasing index.
    pub index: u64,
    /// Decoding-aligned timestamp used for ordering and duration windows.
    pub timestamp: Ticks,
    /// Presentation-aligned timestamp used for ACK correlation.
    pub ack_timestamp: Ticks,
    /// Item duration.
    pub duration: Ticks,
    /// Backing allocation.
    pub handle: AllocHandle,
    /// Offset of the post-header payload inside the allocation. Non-zero
    /// only on stream-start items.
    pub data_offset: u32,
    /// Total byte length served from the allocation.
    pub length: u32,
    /// Bitwise OR of `ITEM_FLAG_*`.
    pub flags: u32,
}

impl ViewItem {
    /// Whether any of `mask`'s bits are set.
    #[must_use]
    pub fn has_flag(&self, mask: u32) -> bool {
        self.flags & mask != 0
    }

    /// Whether this item can start serving a session (fragment boundary).
    #[must_use]
    pub fn is_boundary(&self) -> bool {
        self.has_flag(ITEM_FLAG_FRAGMENT_START | ITEM_FLAG_FRAGMENT_END)
    }
}

/// Record of an item that fell out of the window.
#[derive(Debug, Clone, Copy)]
pub struct EvictedItem {
    /// The evicted item.
    pub item: ViewItem,
    /// True when the eviction overtook the `current` cursor, i.e. the item
    /// was dropped before it was ever served.
    pub current_removed: bool,
}

/// Bounded ring of view items with `tail`/`current`/`head` cursors.
pub struct ContentView {
    items: VecDeque<ViewItem>,
    /// Absolute index of `items[0]`.
    tail_index: u64,
    /// Absolute index the next append receives.
    head_index: u64,
    /// Absolute index of the next item to serve.
    current: u64,
    /// Maximum retained item count.
    capacity: usize,
}

impl ContentView {
    /// Creates a view retaining at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            tail_index: 0,
            head_index: 0,
            current: 0,
            capacity: capacity.max(2),
        }
    }

    /// Number of retained items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the view holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether an append would evict the tail item.
    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Absolute index of the next item to serve.
    #[must_use]
    pub fn current_index(&self) -> u64 {
        self.current
    }

    /// Absolute index the next append will receive.
    #[must_use]
    pub fn head_index(&self) -> u64 {
        self.head_index
    }

    /// Absolute index of the oldest retained item.
    #[must_use]
    pub fn tail_index(&self) -> u64 {
        self.tail_index
    }

    fn position(&self, index: u64) -> StreamResult<usize> {
        if index < self.tail_index || index >= self.head_index {
            return Err(StreamError::InvalidArgument(format!(
                "view index {index} outside [{}, {})",
                self.tail_index, self.head_index
            )));
        }
        Ok((index - self.tail_index) as usize)
    }

    /// Returns the item at an absolute index.
    pub fn item_at(&self, index: u64) -> StreamResult<&ViewItem> {
        let pos = self.position(index)?;
        Ok(&self.items[pos])
    }

    /// Returns the item at an absolute index, mutably.
    pub fn item_at_mut(&mut self, index: u64) -> StreamResult<&mut ViewItem> {
        let pos = self.position(index)?;
        Ok(&mut self.items[pos])
    }

    /// Oldest retained item.
    pub fn tail(&self) -> StreamResult<&ViewItem> {
        self.items
            .front()
            .ok_or_else(|| StreamError::Internal("view is empty".into()))
    }

    /// Newest retained item.
    pub fn head(&self) -> StreamResult<&ViewItem> {
        self.items
            .back()
            .ok_or_else(|| StreamError::Internal("view is empty".into()))
    }

    /// Appends an item, returning its absolute index and the evicted tail
    /// record when the append displaced one.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        timestamp: Ticks,
        ack_timestamp: Ticks,
        duration: Ticks,
        handle: AllocHandle,
        data_offset: u32,
        length: u32,
        flags: u32,
    ) -> StreamResult<(u64, Option<EvictedItem>)> {
        if let Some(last) = self.items.back() {
            if ack_timestamp < last.ack_timestamp + last.duration {
                return Err(StreamError::InvalidArgument(format!(
                    "non-monotonic view timestamp {ack_timestamp} after {}",
                    last.ack_timestamp + last.duration
                )));
            }
        }

        let evicted = if self.at_capacity() {
            self.evict_tail()
        } else {
            None
        };

        let index = self.head_index;
        self.head_index += 1;
        self.items.push_back(ViewItem {
            index,
            timestamp,
            ack_timestamp,
            duration,
            handle,
            data_offset,
            length,
            flags,
        });

        Ok((index, evicted))
    }

    fn evict_tail(&mut self) -> Option<EvictedItem> {
        let item = self.items.pop_front()?;
        self.tail_index = item.index + 1;
        let current_removed = self.current <= item.index;
        if current_removed {
            self.current = self.tail_index;
        }
        Some(EvictedItem {
            item,
            current_removed,
        })
    }

    /// Returns the next unserved item and advances `current` past it.
    /// `Ok(None)` when `current` has reached `head`.
    pub fn get_next(&mut self) -> Option<ViewItem> {
        if self.current >= self.head_index {
            return None;
        }
        let pos = (self.current - self.tail_index) as usize;
        let item = self.items[pos];
        self.current += 1;
        Some(item)
    }

    /// Repositions `current`. The index may equal `head` (nothing to serve).
    pub fn set_current(&mut self, index: u64) -> StreamResult<()> {
        if index < self.tail_index || index > self.head_index {
            return Err(StreamError::InvalidArgument(format!(
                "current index {index} outside [{}, {}]",
                self.tail_index, self.head_index
            )));
        }
        self.current = index;
        Ok(())
    }

    /// Finds the item whose time span contains `ts`.
    ///
    /// Compares against ACK-aligned timestamps when `use_ack_ts` is set.
    /// Queries older than the tail or newer than the head are rejected;
    /// callers clamp to the tail where the protocol allows it.
    pub fn item_with_timestamp(&self, ts: Ticks, use_ack_ts: bool) -> StreamResult<&ViewItem> {
        let key = |item: &ViewItem| {
            if use_ack_ts {
                item.ack_timestamp
            } else {
                item.timestamp
            }
        };
        // Timestamps are strictly monotonic, so binary search applies.
        let pos = self.items.partition_point(|item| key(item) <= ts);
        if pos == 0 {
            return Err(StreamError::AckTimestampNotInView);
        }
        let candidate = &self.items[pos - 1];
        if ts >= key(candidate) + candidate.duration.max(1) {
            return Err(StreamError::AckTimestampNotInView);
        }
        Ok(candidate)
    }

    /// Whether `ts` falls inside the retained tail-to-head window.
    #[must_use]
    pub fn timestamp_in_range(&self, ts: Ticks, use_ack_ts: bool) -> bool {
        let (Some(front), Some(back)) = (self.items.front(), self.items.back()) else {
            return false;
        };
        let (lo, hi) = if use_ack_ts {
            (front.ack_timestamp, back.ack_timestamp + back.duration)
        } else {
            (front.timestamp, back.timestamp + back.duration)
        };
        ts >= lo && ts < hi.max(lo + 1)
    }

    /// Rolls `current` back for a replay after connection loss.
    ///
    /// Walks backwards from `current` while the distance to the head stays
    /// within `replay_duration`, landing on the oldest fragment boundary in
    /// range. When `stop_at_persisted` is set the walk does not cross an
    /// item carrying a persisted ACK.
    pub fn rollback_current(&mut self, replay_duration: Ticks, stop_at_persisted: bool) {
        let Some(head) = self.items.back() else {
            return;
        };
        let head_ts = head.timestamp;
        let mut target = self.current.min(self.head_index);

        let mut index = self.current;
        while index > self.tail_index {
            index -= 1;
            let pos = (index - self.tail_index) as usize;
            let item = &self.items[pos];
            if stop_at_persisted && item.has_flag(ITEM_FLAG_PERSISTED_ACK) {
                break;
            }
            if head_ts.saturating_sub(item.timestamp) > replay_duration {
                break;
            }
            if item.has_flag(ITEM_FLAG_STREAM_START | ITEM_FLAG_FRAGMENT_START) {
                target = index;
            }
        }

        if target != self.current {
            log::debug!(
                "[View] Rolled current back from {} to {}",
                self.current,
                target
            );
            self.current = target;
        }
    }

    /// Drops all items older than `index`, returning the evictions in tail
    /// order.
    pub fn trim_tail(&mut self, index: u64) -> StreamResult<Vec<EvictedItem>> {
        if index < self.tail_index || index > self.head_index {
            return Err(StreamError::InvalidArgument(format!(
                "trim index {index} outside [{}, {}]",
                self.tail_index, self.head_index
            )));
        }
        let mut evicted = Vec::new();
        while self.tail_index < index {
            if let Some(e) = self.evict_tail() {
                evicted.push(e);
            }
        }
        Ok(evicted)
    }

    /// Drops the oldest retained item only.
    pub fn trim_tail_item(&mut self) -> Option<EvictedItem> {
        self.evict_tail()
    }

    /// Drops everything, returning the evictions in tail order.
    pub fn remove_all(&mut self) -> Vec<EvictedItem> {
        let mut evicted = Vec::new();
        while let Some(e) = self.evict_tail() {
            evicted.push(e);
        }
        self.current = self.head_index;
        self.tail_index = self.head_index;
        evicted
    }

    /// Durations of the current-to-head and tail-to-head windows.
    #[must_use]
    pub fn window_duration(&self) -> (Ticks, Ticks) {
        let Some(head) = self.items.back() else {
            return (0, 0);
        };
        let head_end = head.timestamp + head.duration;
        let total = self
            .items
            .front()
            .map_or(0, |tail| head_end.saturating_sub(tail.timestamp));
        let current = if self.current >= self.head_index {
            0
        } else {
            let pos = (self.current - self.tail_index) as usize;
            head_end.saturating_sub(self.items[pos].timestamp)
        };
        (current, total)
    }

    /// Byte sizes of the current-to-head and tail-to-head windows.
    #[must_use]
    pub fn window_byte_size(&self) -> (u64, u64) {
        let total: u64 = self.items.iter().map(|i| u64::from(i.length)).sum();
        let current: u64 = if self.current >= self.head_index {
            0
        } else {
            let pos = (self.current - self.tail_index) as usize;
            self.items
                .iter()
                .skip(pos)
                .map(|i| u64::from(i.length))
                .sum()
        };
        (current, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append_n(view: &mut ContentView, n: u64, dur: Ticks) -> Vec<Option<EvictedItem>> {
        let mut evictions = Vec::new();
        for i in 0..n {
            let flags = if i % 10 == 0 {
                ITEM_FLAG_FRAGMENT_START
            } else {
                ITEM_FLAG_NONE
            };
            let (_, e) = view
                .append(i * dur, i * dur, dur, AllocHandle(i + 1), 0, 100, flags)
                .unwrap();
            evictions.push(e);
        }
        evictions
    }

    #[test]
    fn indices_are_strictly_increasing_without_gaps() {
        let mut view = ContentView::new(100);
        for i in 0..50u64 {
            let (idx, _) = view
                .append(i * 10, i * 10, 10, AllocHandle(i), 0, 1, ITEM_FLAG_NONE)
                .unwrap();
            assert_eq!(idx, i);
        }
    }

    #[test]
    fn non_monotonic_append_is_rejected() {
        let mut view = ContentView::new(10);
        view.append(100, 100, 10, AllocHandle(1), 0, 1, 0).unwrap();
        assert!(view.append(105, 105, 10, AllocHandle(2), 0, 1, 0).is_err());
        assert!(view.append(110, 110, 10, AllocHandle(2), 0, 1, 0).is_ok());
    }

    #[test]
    fn overflow_evicts_tail_and_reports_current_removed() {
        let mut view = ContentView::new(4);
        append_n(&mut view, 4, 10);

        // Current still at tail: the eviction overtakes it.
        let (_, evicted) = view
            .append(40, 40, 10, AllocHandle(5), 0, 100, ITEM_FLAG_NONE)
            .unwrap();
        let e = evicted.unwrap();
        assert!(e.current_removed);
        assert_eq!(e.item.index, 0);
        assert_eq!(view.current_index(), 1);

        // After serving ahead, evictions no longer touch current.
        while view.get_next().is_some() {}
        let (_, evicted) = view
            .append(50, 50, 10, AllocHandle(6), 0, 100, ITEM_FLAG_NONE)
            .unwrap();
        assert!(!evicted.unwrap().current_removed);
    }

    #[test]
    fn get_next_walks_to_head() {
        let mut view = ContentView::new(8);
        append_n(&mut view, 3, 10);
        assert_eq!(view.get_next().unwrap().index, 0);
        assert_eq!(view.get_next().unwrap().index, 1);
        assert_eq!(view.get_next().unwrap().index, 2);
        assert!(view.get_next().is_none());
    }

    #[test]
    fn timestamp_lookup_finds_containing_item() {
        let mut view = ContentView::new(8);
        append_n(&mut view, 5, 10);
        assert_eq!(view.item_with_timestamp(25, true).unwrap().index, 2);
        assert_eq!(view.item_with_timestamp(20, true).unwrap().index, 2);
        assert!(view.item_with_timestamp(999, true).is_err());
    }

    #[test]
    fn trim_tail_returns_evictions_in_order() {
        let mut view = ContentView::new(32);
        append_n(&mut view, 10, 10);
        while view.get_next().is_some() {}
        let evicted = view.trim_tail(4).unwrap();
        assert_eq!(evicted.len(), 4);
        assert_eq!(evicted[0].item.index, 0);
        assert_eq!(view.tail_index(), 4);
        assert!(evicted.iter().all(|e| !e.current_removed));
    }

    #[test]
    fn rollback_lands_on_fragment_boundary_within_replay_window() {
        let mut view = ContentView::new(64);
        append_n(&mut view, 30, 10);
        while view.get_next().is_some() {}

        // Head ts = 290; replay window 100 reaches back to ts 190 → item 19,
        // oldest boundary in range is index 20.
        view.rollback_current(100, false);
        assert_eq!(view.current_index(), 20);
    }

    #[test]
    fn rollback_stops_at_persisted_ack() {
        let mut view = ContentView::new(64);
        append_n(&mut view, 30, 10);
        while view.get_next().is_some() {}
        view.item_at_mut(24).unwrap().flags |= ITEM_FLAG_PERSISTED_ACK;

        view.rollback_current(1000, true);
        assert!(view.current_index() > 24);
    }

    #[test]
    fn window_sizes_account_for_cursors() {
        let mut view = ContentView::new(16);
        append_n(&mut view, 10, 10);
        for _ in 0..4 {
            view.get_next();
        }
        let (cur_bytes, total_bytes) = view.window_byte_size();
        assert_eq!(total_bytes, 1000);
        assert_eq!(cur_bytes, 600);

        let (cur_dur, total_dur) = view.window_duration();
        assert_eq!(total_dur, 100);
        assert_eq!(cur_dur, 60);
    }

    #[test]
    fn remove_all_resets_cursors() {
        let mut view = ContentView::new(8);
        append_n(&mut view, 5, 10);
        let evicted = view.remove_all();
        assert_eq!(evicted.len(), 5);
        assert!(view.is_empty());
        assert_eq!(view.current_index(), view.head_index());
        // Indices keep increasing after a wipe.
        let (idx, _) = view.append(100, 100, 10, AllocHandle(9), 0, 1, 0).unwrap();
        assert_eq!(idx, 5);
    }
}
