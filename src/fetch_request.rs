//! Unit of work for the worker pool and its queue ordering.

use std::cmp::Ordering;
use std::time::SystemTime;

use crate::protocol::{FetchPriority, MediaSource, PlaylistItem};

/// How requests of equal priority are ordered against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreakPolicy {
    /// Most recently enqueued first. Favours rows that just scrolled into view, but
    /// can starve older same-priority requests under sustained load.
    #[default]
    NewestFirst,
    /// Plain FIFO within a priority band.
    OldestFirst,
}

/// One duration lookup. Immutable once enqueued; retired on its terminal event.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Caller's back-reference, echoed on events.
    pub playlist_index: usize,
    pub item: PlaylistItem,
    pub source: MediaSource,
    pub priority: FetchPriority,
    pub enqueued_at: SystemTime,
    /// Incremented by the caller before re-enqueueing a failed item.
    pub retry_count: u32,
}

impl FetchRequest {
    /// Builds a request, or `None` when the item has nothing fetchable.
    pub fn new(
        playlist_index: usize,
        item: PlaylistItem,
        priority: FetchPriority,
        retry_count: u32,
    ) -> Option<Self> {
        let source = item.media_source()?;
        Some(Self {
            playlist_index,
            item,
            source,
            priority,
            enqueued_at: SystemTime::now(),
            retry_count,
        })
    }

    pub fn url(&self) -> &str {
        &self.item.url
    }
}

/// Heap entry: a request plus the ordering key computed at push time.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub(crate) request: FetchRequest,
    sequence: u64,
    policy: TieBreakPolicy,
}

impl QueuedRequest {
    pub(crate) fn new(request: FetchRequest, sequence: u64, policy: TieBreakPolicy) -> Self {
        Self {
            request,
            sequence,
            policy,
        }
    }

    /// Same entry ordered under `policy`; the push sequence is kept.
    pub(crate) fn rekeyed(self, policy: TieBreakPolicy) -> Self {
        Self { policy, ..self }
    }

    fn tie_break_rank(&self) -> u64 {
        match self.policy {
            TieBreakPolicy::NewestFirst => self.sequence,
            TieBreakPolicy::OldestFirst => u64::MAX - self.sequence,
        }
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // Max-heap order: greatest is popped first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| self.tie_break_rank().cmp(&other.tie_break_rank()))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn request(index: usize, priority: FetchPriority) -> FetchRequest {
        FetchRequest::new(
            index,
            PlaylistItem::youtube(format!("https://youtu.be/v{index}")),
            priority,
            0,
        )
        .expect("youtube items are fetchable")
    }

    fn drain_order(policy: TieBreakPolicy, priorities: &[FetchPriority]) -> Vec<usize> {
        let mut heap = BinaryHeap::new();
        for (sequence, priority) in priorities.iter().enumerate() {
            heap.push(QueuedRequest::new(
                request(sequence, *priority),
                sequence as u64,
                policy,
            ));
        }
        std::iter::from_fn(|| heap.pop().map(|queued| queued.request.playlist_index)).collect()
    }

    #[test]
    fn test_newest_first_within_band_priority_across_bands() {
        let order = drain_order(
            TieBreakPolicy::NewestFirst,
            &[
                FetchPriority::Normal,
                FetchPriority::Urgent,
                FetchPriority::Normal,
                FetchPriority::Low,
                FetchPriority::High,
                FetchPriority::Normal,
            ],
        );
        assert_eq!(order, vec![1, 4, 5, 2, 0, 3]);
    }

    #[test]
    fn test_oldest_first_policy_is_fifo_within_band() {
        let order = drain_order(
            TieBreakPolicy::OldestFirst,
            &[
                FetchPriority::Normal,
                FetchPriority::Normal,
                FetchPriority::High,
                FetchPriority::Normal,
            ],
        );
        assert_eq!(order, vec![2, 0, 1, 3]);
    }

    #[test]
    fn test_unfetchable_item_builds_no_request() {
        assert!(FetchRequest::new(0, PlaylistItem::new("x", "stream"), FetchPriority::Low, 0)
            .is_none());
        assert!(FetchRequest::new(0, PlaylistItem::local(""), FetchPriority::Low, 0).is_none());
    }
}
