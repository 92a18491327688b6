//! Frame lifecycle bookkeeping (C5, C9, §4.2, §5).
//!
//! This is the device-call-free half of `begin_frame`/`end_frame`: the
//! counting and flag transitions that the invariants in §3 and properties
//! P1-P3/P10 talk about. The Vulkan backend drives a [`FrameLifecycle`] in
//! lockstep with the real fence waits, image acquire, and queue submit —
//! image acquisition itself is supplied by the caller as `Option<usize>`
//! since it depends on the live swapchain.

use crate::error::ErrorKind;
use crate::render_pass::RenderPassDomain;

/// Signal/reset counter standing in for a `vk::Fence`. A backend wraps a
/// real fence and keeps this bookkeeping in lockstep so the counting
/// properties can be asserted in tests without a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceState {
    signalled: bool,
    reset_count: u64,
    signal_count: u64,
}

impl FenceState {
    fn new_signalled() -> Self {
        FenceState { signalled: true, reset_count: 0, signal_count: 1 }
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled
    }

    pub fn reset(&mut self) {
        self.signalled = false;
        self.reset_count += 1;
    }

    pub fn signal(&mut self) {
        self.signalled = true;
        self.signal_count += 1;
    }

    pub fn signal_count(&self) -> u64 {
        self.signal_count
    }

    pub fn reset_count(&self) -> u64 {
        self.reset_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginFrameOutcome {
    Started { image_index: usize },
    /// Fence wait or acquire timed out; not fatal, caller skips this frame
    /// without advancing `current_frame` (§5 Cancellation/timeouts).
    TimedOutSkipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndFrameOutcome {
    /// True if `end_frame` needed to insert the manual
    /// `COLOR_ATTACHMENT_OPTIMAL -> PRESENT_SRC` barrier because the last
    /// pass wasn't already terminal (§4.2 step 3, P5).
    pub inserted_present_transition: bool,
}

/// Per-renderer frame/image synchronization state (§3 Backend state,
/// subset). Owns `current_frame`, the in-flight fences, and the
/// `images_in_flight` table; the frontend's `frame_active` /
/// `render_pass_active` flags live here too since they gate the same
/// begin/end calls.
pub struct FrameLifecycle {
    max_in_flight_frames: u32,
    current_frame: u32,
    /// Monotonically increasing count of frames submitted via `end_frame`,
    /// unlike `current_frame` which wraps mod `max_in_flight_frames`. Used
    /// to age resources (instance descriptor sets, indirect ring slots)
    /// against `max_in_flight_frames` without the wraparound ambiguity a
    /// raw slot index would have.
    total_frames: u64,
    frame_active: bool,
    render_pass_active: bool,
    current_render_pass_domain: Option<RenderPassDomain>,
    active_named_render_pass: Option<String>,
    swapchain_image_is_present_ready: bool,
    image_index: Option<usize>,
    in_flight_fences: Vec<FenceState>,
    images_in_flight: Vec<Option<usize>>,
}

impl FrameLifecycle {
    pub fn new(max_in_flight_frames: u32, swapchain_image_count: usize) -> Self {
        assert!(max_in_flight_frames > 0, "max_in_flight_frames must be positive");
        FrameLifecycle {
            max_in_flight_frames,
            current_frame: 0,
            total_frames: 0,
            frame_active: false,
            render_pass_active: false,
            current_render_pass_domain: None,
            active_named_render_pass: None,
            swapchain_image_is_present_ready: false,
            image_index: None,
            in_flight_fences: (0..max_in_flight_frames).map(|_| FenceState::new_signalled()).collect(),
            images_in_flight: vec![None; swapchain_image_count],
        }
    }

    pub fn current_frame(&self) -> u32 {
        self.current_frame
    }

    /// Monotonic frame count, unaffected by the `current_frame` wraparound.
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Restores `total_frames()` after a fresh `FrameLifecycle` replaces an
    /// old one (swapchain recreation), so resource-aging counters that key
    /// off it don't reset to 0 mid-session.
    pub fn fast_forward_total_frames(&mut self, total_frames: u64) {
        self.total_frames = total_frames;
    }

    pub fn is_frame_active(&self) -> bool {
        self.frame_active
    }

    pub fn is_render_pass_active(&self) -> bool {
        self.render_pass_active
    }

    pub fn image_index(&self) -> Option<usize> {
        self.image_index
    }

    pub fn fence(&self, frame_slot: u32) -> &FenceState {
        &self.in_flight_fences[frame_slot as usize]
    }

    /// Exposed for backend/tests to force an unsignalled fence, simulating
    /// a still-pending frame (§4.2 step 2 timeout path).
    pub fn mark_fence_unsignalled(&mut self, frame_slot: u32) {
        self.in_flight_fences[frame_slot as usize].signalled = false;
    }

    pub fn images_in_flight(&self) -> &[Option<usize>] {
        &self.images_in_flight
    }

    /// §4.2 `begin_frame` steps 1-2 and 4-7; step 3 (acquire) is supplied by
    /// the caller as `acquired_image_index` (`None` models an acquire
    /// timeout/skip, mirroring the fence-wait timeout path).
    pub fn begin_frame(&mut self, acquired_image_index: Option<usize>) -> Result<BeginFrameOutcome, ErrorKind> {
        if self.frame_active {
            return Err(ErrorKind::FrameInProgress);
        }
        if !self.in_flight_fences[self.current_frame as usize].is_signalled() {
            return Ok(BeginFrameOutcome::TimedOutSkipped);
        }
        let Some(image_index) = acquired_image_index else {
            return Ok(BeginFrameOutcome::TimedOutSkipped);
        };

        self.render_pass_active = false;
        self.current_render_pass_domain = None;
        self.active_named_render_pass = None;
        self.swapchain_image_is_present_ready = false;
        self.image_index = Some(image_index);
        self.frame_active = true;
        Ok(BeginFrameOutcome::Started { image_index })
    }

    /// §4.4 `begin_render_pass` flag transitions.
    pub fn begin_render_pass(&mut self, domain: RenderPassDomain, pass_name: String) {
        debug_assert!(self.frame_active, "begin_render_pass called outside an active frame");
        debug_assert!(!self.render_pass_active, "a pass is already active");
        self.render_pass_active = true;
        self.current_render_pass_domain = Some(domain);
        self.active_named_render_pass = Some(pass_name);
    }

    /// §4.4 `end_render_pass`; no-op if no pass is active. `terminal` is
    /// true when the just-ended pass has an empty `next_name`.
    pub fn end_render_pass(&mut self, terminal: bool) {
        if !self.render_pass_active {
            return;
        }
        if terminal {
            self.swapchain_image_is_present_ready = true;
        }
        self.render_pass_active = false;
        self.current_render_pass_domain = None;
        self.active_named_render_pass = None;
    }

    /// §4.2 `end_frame` steps 1-2, 5-10. Steps 3-4 and 8-9 (the actual
    /// barrier insertion, command buffer end, submit, and present) are the
    /// backend's job; this only returns whether a manual transition is
    /// needed and updates the counting state.
    pub fn end_frame(&mut self) -> Result<EndFrameOutcome, ErrorKind> {
        if !self.frame_active {
            return Err(ErrorKind::InvalidParameter);
        }
        if self.render_pass_active {
            self.end_render_pass(false);
        }
        let inserted_present_transition = !self.swapchain_image_is_present_ready;

        let image_index = self.image_index.expect("frame_active implies image_index is set");
        let slot = self.current_frame;

        // P3: if another still-pending frame last touched this image, the
        // backend must wait on that fence before resubmitting into it.
        let _prior_fence_slot = self.images_in_flight[image_index];
        self.images_in_flight[image_index] = Some(slot as usize);

        self.in_flight_fences[slot as usize].reset();
        // Synchronous bookkeeping model: submission is treated as complete
        // immediately, matching the fact every real wait on this fence
        // blocks until it is (there is no asynchronous completion to model
        // without a device).
        self.in_flight_fences[slot as usize].signal();

        self.current_frame = (self.current_frame + 1) % self.max_in_flight_frames;
        self.total_frames += 1;
        self.frame_active = false;
        self.image_index = None;

        Ok(EndFrameOutcome { inserted_present_transition })
    }
}

/// Tracks the frontend's cached window size so `resize` can detect a
/// same-size call and skip redundant swapchain recreation (§4.1 `resize`,
/// P10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResizeTracker {
    width: u32,
    height: u32,
}

impl ResizeTracker {
    pub fn new(width: u32, height: u32) -> Self {
        ResizeTracker { width, height }
    }

    pub fn current(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Returns `true` if this call represents a real size change. Two
    /// consecutive calls with the same `(width, height)` return `true` then
    /// `false`, modeling the idempotent no-op (P10).
    pub fn apply(&mut self, width: u32, height: u32) -> bool {
        if (self.width, self.height) == (width, height) {
            return false;
        }
        self.width = width;
        self.height = height;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(fl: &mut FrameLifecycle, image_index: usize) {
        let outcome = fl.begin_frame(Some(image_index)).unwrap();
        assert_eq!(outcome, BeginFrameOutcome::Started { image_index });
        fl.end_frame().unwrap();
    }

    /// P1 — frame counter correctness.
    #[test]
    fn p1_current_frame_tracks_k_mod_max_in_flight() {
        let mut fl = FrameLifecycle::new(3, 3);
        for k in 1..=10u32 {
            step(&mut fl, (k as usize - 1) % 3);
            assert_eq!(fl.current_frame(), k % 3);
        }
    }

    /// P2 — in-flight cap: exactly `max_in_flight_frames` fence slots exist.
    #[test]
    fn p2_fence_slot_count_equals_cap() {
        let fl = FrameLifecycle::new(2, 2);
        assert_eq!(fl.in_flight_fences.len(), 2);
    }

    #[test]
    fn begin_frame_rejects_reentry_while_active() {
        let mut fl = FrameLifecycle::new(2, 2);
        fl.begin_frame(Some(0)).unwrap();
        assert_eq!(fl.begin_frame(Some(0)), Err(ErrorKind::FrameInProgress));
    }

    #[test]
    fn end_frame_rejects_when_no_frame_is_active() {
        let mut fl = FrameLifecycle::new(2, 2);
        assert_eq!(fl.end_frame(), Err(ErrorKind::InvalidParameter));
    }

    #[test]
    fn fence_timeout_skips_frame_without_advancing_counter() {
        let mut fl = FrameLifecycle::new(2, 2);
        fl.mark_fence_unsignalled(0);
        let outcome = fl.begin_frame(Some(0)).unwrap();
        assert_eq!(outcome, BeginFrameOutcome::TimedOutSkipped);
        assert_eq!(fl.current_frame(), 0);
        assert!(!fl.is_frame_active());
    }

    #[test]
    fn terminal_render_pass_suppresses_manual_present_transition() {
        let mut fl = FrameLifecycle::new(2, 2);
        fl.begin_frame(Some(0)).unwrap();
        fl.begin_render_pass(RenderPassDomain::Ui, "Renderpass.Builtin.UI".into());
        fl.end_render_pass(true);
        let outcome = fl.end_frame().unwrap();
        assert!(!outcome.inserted_present_transition);
    }

    #[test]
    fn non_terminal_end_of_frame_requests_manual_present_transition() {
        let mut fl = FrameLifecycle::new(2, 2);
        fl.begin_frame(Some(0)).unwrap();
        fl.begin_render_pass(RenderPassDomain::World, "Renderpass.Builtin.World".into());
        fl.end_render_pass(false);
        let outcome = fl.end_frame().unwrap();
        assert!(outcome.inserted_present_transition);
    }

    /// S1 — triple-buffered frame loop.
    #[test]
    fn s1_triple_buffered_frame_loop() {
        let mut fl = FrameLifecycle::new(3, 3);
        for k in 0..10usize {
            step(&mut fl, k % 3);
        }
        assert_eq!(fl.current_frame(), 10 % 3);
        for slot in 0..3 {
            assert!(fl.fence(slot).is_signalled());
            assert!(fl.fence(slot).reset_count() >= 2, "fence {slot} must have been reset-then-resignalled at least twice over 10 frames");
        }
    }

    #[test]
    fn total_frames_is_monotonic_across_current_frame_wraparound() {
        let mut fl = FrameLifecycle::new(2, 2);
        for k in 0..5usize {
            step(&mut fl, k % 2);
        }
        assert_eq!(fl.total_frames(), 5);
        assert_eq!(fl.current_frame(), 5 % 2);
    }

    /// P10 — resize idempotence.
    #[test]
    fn p10_repeated_resize_with_same_size_is_idempotent() {
        let mut tracker = ResizeTracker::new(1280, 720);
        assert!(tracker.apply(1920, 1080));
        assert!(!tracker.apply(1920, 1080));
        assert_eq!(tracker.current(), (1920, 1080));
    }
}
