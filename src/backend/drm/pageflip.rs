//! Page-flip handler (C6).
//!
//! Grounded in `GpuDevice::page_flip_event`/`PageFlipState` for the cookie lifecycle and
//! spec §4.6 for the resolve-then-signal ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{trace, warn};

use crate::fence::{Fence, Timeline};

/// Display-relative vsync timestamp, seconds plus the microsecond remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsyncTime {
    pub sec: u32,
    pub usec: u32,
}

/// Identifies a pending commit submitted to the kernel, handed to the atomic commit ioctl
/// as its user-data and returned unchanged by the page-flip completion event.
pub type FlipCookie = u64;

struct PendingFlip {
    display_id: u64,
}

/// Per-display page-flip tracking: outstanding commit cookies, the retire timeline, and
/// vsync subscribers (spec §4.6).
#[derive(Debug)]
pub struct PageFlipHandler {
    display_id: u64,
    timeline: Timeline,
    pending: Mutex<HashMap<FlipCookie, PendingFlip>>,
    next_cookie: AtomicU64,
    vsync_enabled: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for PendingFlip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingFlip").field("display_id", &self.display_id).finish()
    }
}

impl PageFlipHandler {
    pub fn new(display_id: u64) -> Self {
        PageFlipHandler {
            display_id,
            timeline: Timeline::new(),
            pending: Mutex::new(HashMap::new()),
            next_cookie: AtomicU64::new(1),
            vsync_enabled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_vsync_enabled(&self, enabled: bool) {
        self.vsync_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn vsync_enabled(&self) -> bool {
        self.vsync_enabled.load(Ordering::Relaxed)
    }

    /// Issues a fence for the frame about to be committed and registers a cookie for it,
    /// to be attached to the atomic commit as user-data (spec §4.6, "Each flip submits a
    /// cookie"). The kernel never accepts a second NONBLOCK commit for the same CRTC before
    /// the first's flip event arrives (it returns EBUSY instead), so there is at most one
    /// outstanding cookie per display at a time in practice.
    pub fn submit(&self) -> (FlipCookie, Fence) {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let fence = self.timeline.next_point();
        self.pending.lock().unwrap().insert(
            cookie,
            PendingFlip {
                display_id: self.display_id,
            },
        );
        trace!(cookie, display = self.display_id, "registered pending flip");
        (cookie, fence)
    }

    /// Handles a kernel page-flip completion event: resolves the cookie, destroys it, then
    /// signals the timeline, which retires every release fence issued for that commit
    /// (spec §4.6 steps 1-2).
    pub fn handle_completion(&self, cookie: FlipCookie, time: VsyncTime) {
        let resolved = self.pending.lock().unwrap().remove(&cookie);
        let Some(flip) = resolved else {
            warn!(cookie, "page-flip completion for unknown cookie, ignoring");
            return;
        };
        debug_assert_eq!(flip.display_id, self.display_id);

        self.timeline.signal();
        trace!(cookie, display = self.display_id, "signalled retire timeline for completed flip");

        if self.vsync_enabled() {
            self.notify_vsync(time);
        }
    }

    /// Resolves whichever single flip is outstanding and completes it, for callers that only
    /// have a CRTC handle and a vsync timestamp from the kernel event, not the opaque cookie
    /// `submit` handed out (the real `drm-rs` page-flip event carries `crtc`/`frame`/
    /// `duration`, never a pass-through user-data value). At most one commit is ever
    /// outstanding per display — the kernel refuses a second NONBLOCK commit for the same
    /// CRTC with EBUSY until the first's flip event arrives — so resolving the lowest
    /// (oldest) pending cookie is unambiguous.
    pub fn complete_next(&self, time: VsyncTime) {
        let cookie = {
            let pending = self.pending.lock().unwrap();
            pending.keys().copied().min()
        };
        match cookie {
            Some(cookie) => self.handle_completion(cookie, time),
            None => warn!(display = self.display_id, "page-flip event with no pending flip"),
        }
    }

    /// Overridable hook for vsync delivery; the display wires this to its registered
    /// callback. Kept as a no-op default so the handler itself carries no callback storage
    /// (the display owns subscriber dispatch, per spec §9's "message-passing of completion
    /// events" design note).
    fn notify_vsync(&self, time: VsyncTime) {
        trace!(sec = time.sec, usec = time.usec, display = self.display_id, "vsync");
    }

    /// Drains every outstanding cookie and force-signals the timeline, stranding no waiter
    /// (spec §4.6, "Cancellation"). Called on display power-off or disconnect.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap();
        let count = pending.len();
        pending.clear();
        drop(pending);
        if count > 0 {
            warn!(display = self.display_id, drained = count, "cancelling outstanding flips");
        }
        self.timeline.signal();
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn completion_signals_fences_issued_before_it() {
        let handler = PageFlipHandler::new(0);
        let (cookie, fence) = handler.submit();
        assert!(!fence.is_signalled());
        handler.handle_completion(cookie, VsyncTime { sec: 1, usec: 0 });
        assert!(fence.is_signalled());
        assert!(!handler.has_pending());
    }

    #[test]
    fn unknown_cookie_completion_is_ignored() {
        let handler = PageFlipHandler::new(0);
        let (_cookie, fence) = handler.submit();
        handler.handle_completion(999, VsyncTime { sec: 0, usec: 0 });
        assert!(!fence.is_signalled());
        assert!(handler.has_pending());
    }

    #[test]
    fn cancel_all_drains_and_force_signals() {
        let handler = PageFlipHandler::new(0);
        let (_c1, f1) = handler.submit();
        let (_c2, f2) = handler.submit();
        handler.cancel_all();
        assert!(f1.is_signalled());
        assert!(f2.is_signalled());
        assert!(!handler.has_pending());
    }

    #[test]
    fn complete_next_resolves_the_oldest_pending_cookie() {
        let handler = PageFlipHandler::new(0);
        let (_cookie, fence) = handler.submit();
        handler.complete_next(VsyncTime { sec: 2, usec: 0 });
        assert!(fence.is_signalled());
        assert!(!handler.has_pending());
    }

    #[test]
    fn sequential_flips_each_retire_on_their_own_completion() {
        // The kernel never has more than one outstanding atomic commit per CRTC (a second
        // NONBLOCK commit before the first's flip event would return EBUSY), so a fence
        // issued by `submit` is only ever pending until the very next completion.
        let handler = PageFlipHandler::new(0);
        let (c1, f1) = handler.submit();
        handler.handle_completion(c1, VsyncTime { sec: 0, usec: 0 });
        assert!(f1.is_signalled());

        let (c2, f2) = handler.submit();
        assert!(!f2.is_signalled());
        handler.handle_completion(c2, VsyncTime { sec: 0, usec: 16_666 });
        assert!(f2.is_signalled());
    }
}
