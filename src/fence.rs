//! Fence / sync primitive (C1).
//!
//! Grounded in `common/core/nativesync.h`. The source backs this with the kernel `sw_sync`
//! misc device (a timeline fd plus per-point fence fds created via `sw_sync_fence_create`);
//! this core keeps fences in-process instead, since exporting a pollable fd is the native
//! buffer handler's concern (spec §1, out of scope) and every consumer of a fence in this
//! crate is itself in-process (the page-flip handler, `Display::present`).
//!
//! A [`Fence`] is an opaque point on a [`Timeline`]. `merge` of two fences on the same
//! timeline just keeps the larger point (signalling at the later point also implies the
//! earlier one signalled); merge across two timelines keeps a pair and only reports
//! signalled once both sides have passed their recorded point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

/// A monotonically increasing counter of completed points on a timeline.
#[derive(Debug)]
struct TimelineInner {
    id: u64,
    signalled: AtomicU64,
    next: AtomicU64,
}

/// A process-local sync timeline. Cheaply cloneable; clones share the same counters.
#[derive(Debug, Clone)]
pub struct Timeline(Arc<TimelineInner>);

static NEXT_TIMELINE_ID: AtomicU64 = AtomicU64::new(1);

impl Timeline {
    /// Creates a fresh timeline at point zero.
    pub fn new() -> Self {
        let id = NEXT_TIMELINE_ID.fetch_add(1, Ordering::Relaxed);
        Timeline(Arc::new(TimelineInner {
            id,
            signalled: AtomicU64::new(0),
            next: AtomicU64::new(0),
        }))
    }

    /// Advances the timeline counter and returns a fence tied to the new point.
    pub fn next_point(&self) -> Fence {
        let point = self.0.next.fetch_add(1, Ordering::Relaxed) + 1;
        Fence::Point {
            timeline_id: self.0.id,
            timeline: self.0.clone(),
            point,
        }
    }

    /// Advances the currently-signalled point to the latest issued point.
    ///
    /// Mirrors `NativeSync::SignalCompositionDone`, which always increases the timeline to
    /// the point most recently handed out, never to an arbitrary caller-chosen value.
    pub fn signal(&self) {
        let target = self.0.next.load(Ordering::Relaxed);
        let prev = self.0.signalled.fetch_max(target, Ordering::AcqRel);
        if prev < target {
            trace!(timeline = self.0.id, point = target, "timeline signalled");
        }
    }

    fn is_signalled(&self, point: u64) -> bool {
        self.0.signalled.load(Ordering::Acquire) >= point
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Timeline::new()
    }
}

impl PartialEq for Timeline {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// An opaque fence handle. Owned by exactly one holder; pass by move.
#[derive(Debug, Clone)]
pub enum Fence {
    /// No fence: already signalled, merges to a no-op.
    Invalid,
    /// A single point on a timeline.
    Point {
        timeline_id: u64,
        timeline: Timeline,
        point: u64,
    },
    /// The conjunction of two non-trivial fences from different timelines.
    Merged(Box<Fence>, Box<Fence>),
}

impl Default for Fence {
    fn default() -> Self {
        Fence::Invalid
    }
}

impl Fence {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Fence::Invalid)
    }

    /// Whether the fence has signalled yet. Conservative for `Merged`: both sides must have.
    pub fn is_signalled(&self) -> bool {
        match self {
            Fence::Invalid => true,
            Fence::Point { timeline, point, .. } => timeline.is_signalled(*point),
            Fence::Merged(a, b) => a.is_signalled() && b.is_signalled(),
        }
    }

    /// Commutative merge producing a fence that signals when both inputs have.
    ///
    /// A merge of an invalid handle with anything returns the other handle unchanged, per
    /// spec §4.1 and §8's round-trip property.
    pub fn merge(a: Fence, b: Fence) -> Fence {
        match (a, b) {
            (Fence::Invalid, other) | (other, Fence::Invalid) => other,
            (
                Fence::Point {
                    timeline_id: id_a,
                    timeline: t_a,
                    point: p_a,
                },
                Fence::Point {
                    timeline_id: id_b,
                    point: p_b,
                    ..
                },
            ) if id_a == id_b => Fence::Point {
                timeline_id: id_a,
                timeline: t_a,
                point: p_a.max(p_b),
            },
            (a, b) => Fence::Merged(Box::new(a), Box::new(b)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merge_with_invalid_is_identity() {
        let t = Timeline::new();
        let f = t.next_point();
        assert!(matches!(
            Fence::merge(f.clone(), Fence::Invalid),
            Fence::Point { point: 1, .. }
        ));
        assert!(matches!(
            Fence::merge(Fence::Invalid, f),
            Fence::Point { point: 1, .. }
        ));
    }

    #[test]
    fn merge_same_timeline_keeps_later_point() {
        let t = Timeline::new();
        let f1 = t.next_point();
        let f2 = t.next_point();
        let merged = Fence::merge(f1, f2);
        match merged {
            Fence::Point { point, .. } => assert_eq!(point, 2),
            _ => panic!("expected a single point"),
        }
    }

    #[test]
    fn signal_advances_to_latest_issued_point() {
        let t = Timeline::new();
        let f1 = t.next_point();
        let f2 = t.next_point();
        assert!(!f1.is_signalled());
        assert!(!f2.is_signalled());
        t.signal();
        assert!(f1.is_signalled());
        assert!(f2.is_signalled());
    }

    #[test]
    fn merged_fence_needs_both_sides() {
        let t1 = Timeline::new();
        let t2 = Timeline::new();
        let f1 = t1.next_point();
        let f2 = t2.next_point();
        let merged = Fence::merge(f1, f2);
        assert!(!merged.is_signalled());
        t1.signal();
        assert!(!merged.is_signalled());
        t2.signal();
        assert!(merged.is_signalled());
    }
}
