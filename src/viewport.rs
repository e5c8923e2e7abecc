//! Row-based intersection observation for a scrolling list.
//!
//! A [`ScrollRegion`] plays the part of the platform observer: views register
//! targets with [`ScrollRegion::observe`] and get back an [`Observation`]
//! that unregisters itself exactly once. Scrolling, resizing, or moving a
//! target queues an [`IntersectionEntry`] for every target whose
//! intersecting state changed; the owning loop drains them with
//! [`ScrollRegion::take_entries`] and hands them to the observers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Minimum visible fraction for a target to count as intersecting. Zero
/// means any overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold(f32);

impl Threshold {
    pub const ANY: Threshold = Threshold(0.0);
    pub const HALF: Threshold = Threshold(0.5);

    pub fn new(ratio: f32) -> Self {
        if ratio.is_nan() {
            return Self::ANY;
        }
        Threshold(ratio.clamp(0.0, 1.0))
    }

    pub fn ratio(self) -> f32 {
        self.0
    }

    pub fn is_met(self, visible_ratio: f32) -> bool {
        if self.0 <= 0.0 {
            visible_ratio > 0.0
        } else {
            visible_ratio >= self.0
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::ANY
    }
}

/// Vertical extent of a target in content rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bounds {
    pub top: usize,
    pub height: usize,
}

impl Bounds {
    pub fn new(top: usize, height: usize) -> Self {
        Self { top, height }
    }

    pub fn bottom(&self) -> usize {
        self.top.saturating_add(self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub offset: usize,
    pub height: usize,
}

impl Viewport {
    pub fn bottom(&self) -> usize {
        self.offset.saturating_add(self.height)
    }

    /// Fraction of `target` inside the viewport. A zero-height target is
    /// fully visible when its top row is on screen.
    pub fn intersection_ratio(&self, target: Bounds) -> f32 {
        if self.height == 0 {
            return 0.0;
        }
        if target.height == 0 {
            let inside = target.top >= self.offset && target.top < self.bottom();
            return if inside { 1.0 } else { 0.0 };
        }
        let start = target.top.max(self.offset);
        let end = target.bottom().min(self.bottom());
        if end <= start {
            return 0.0;
        }
        (end - start) as f32 / target.height as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationId(u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntersectionEntry {
    pub id: ObservationId,
    pub ratio: f32,
    pub is_intersecting: bool,
}

struct Target {
    bounds: Bounds,
    threshold: Threshold,
    intersecting: bool,
}

struct RegionInner {
    viewport: Viewport,
    targets: HashMap<ObservationId, Target>,
    next_id: u64,
    queued: Vec<IntersectionEntry>,
}

impl RegionInner {
    fn evaluate(&mut self, id: ObservationId, force: bool) {
        let viewport = self.viewport;
        let Some(target) = self.targets.get_mut(&id) else {
            return;
        };
        let ratio = viewport.intersection_ratio(target.bounds);
        let is_intersecting = target.threshold.is_met(ratio);
        if force || is_intersecting != target.intersecting {
            target.intersecting = is_intersecting;
            self.queued.push(IntersectionEntry {
                id,
                ratio,
                is_intersecting,
            });
        }
    }

    fn evaluate_all(&mut self) {
        let mut ids: Vec<ObservationId> = self.targets.keys().copied().collect();
        ids.sort();
        for id in ids {
            self.evaluate(id, false);
        }
    }
}

/// Scrollable viewport shared by the observers of one view.
#[derive(Clone)]
pub struct ScrollRegion {
    inner: Arc<Mutex<RegionInner>>,
}

impl ScrollRegion {
    pub fn new(height: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegionInner {
                viewport: Viewport { offset: 0, height },
                targets: HashMap::new(),
                next_id: 1,
                queued: Vec::new(),
            })),
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.inner.lock().viewport
    }

    pub fn scroll_to(&self, offset: usize) {
        let mut inner = self.inner.lock();
        if inner.viewport.offset == offset {
            return;
        }
        inner.viewport.offset = offset;
        inner.evaluate_all();
    }

    pub fn scroll_by(&self, delta: isize) {
        let offset = self.viewport().offset.saturating_add_signed(delta);
        self.scroll_to(offset);
    }

    pub fn resize(&self, height: usize) {
        let mut inner = self.inner.lock();
        if inner.viewport.height == height {
            return;
        }
        inner.viewport.height = height;
        inner.evaluate_all();
    }

    /// Starts observing `bounds`. The current state is always reported once,
    /// like a platform observer's first callback.
    pub fn observe(&self, bounds: Bounds, threshold: Threshold) -> Observation {
        let mut inner = self.inner.lock();
        let id = ObservationId(inner.next_id);
        inner.next_id += 1;
        inner.targets.insert(
            id,
            Target {
                bounds,
                threshold,
                intersecting: false,
            },
        );
        inner.evaluate(id, true);
        tracing::trace!(id = id.0, top = bounds.top, height = bounds.height, "observe");
        Observation {
            id,
            region: self.clone(),
            released: false,
        }
    }

    /// Entries queued since the last call, in the order they happened.
    pub fn take_entries(&self) -> Vec<IntersectionEntry> {
        std::mem::take(&mut self.inner.lock().queued)
    }

    pub fn observed_count(&self) -> usize {
        self.inner.lock().targets.len()
    }

    fn set_bounds(&self, id: ObservationId, bounds: Bounds) {
        let mut inner = self.inner.lock();
        match inner.targets.get_mut(&id) {
            Some(target) if target.bounds != bounds => target.bounds = bounds,
            _ => return,
        }
        inner.evaluate(id, false);
    }

    fn unobserve(&self, id: ObservationId) -> bool {
        let mut inner = self.inner.lock();
        inner.queued.retain(|entry| entry.id != id);
        inner.targets.remove(&id).is_some()
    }
}

/// Registration of one target. Released on [`Observation::release`] or drop,
/// whichever comes first.
pub struct Observation {
    id: ObservationId,
    region: ScrollRegion,
    released: bool,
}

impl Observation {
    pub fn id(&self) -> ObservationId {
        self.id
    }

    pub fn set_bounds(&self, bounds: Bounds) {
        self.region.set_bounds(self.id, bounds);
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.region.unobserve(self.id) {
            tracing::trace!(id = self.id.0, "unobserve");
        }
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Calls `callback` whenever the sentinel goes from hidden to visible.
///
/// Extra firings while the callback's work is still running are expected;
/// the callback is responsible for ignoring them.
pub struct ViewportTrigger<F: FnMut()> {
    threshold: Threshold,
    callback: F,
    observation: Option<Observation>,
    intersecting: bool,
}

impl<F: FnMut()> ViewportTrigger<F> {
    pub fn new(threshold: Threshold, callback: F) -> Self {
        Self {
            threshold,
            callback,
            observation: None,
            intersecting: false,
        }
    }

    pub fn start(&mut self, region: &ScrollRegion, sentinel: Bounds) {
        self.stop();
        self.observation = Some(region.observe(sentinel, self.threshold));
    }

    pub fn stop(&mut self) {
        if let Some(observation) = self.observation.take() {
            observation.release();
        }
        self.intersecting = false;
    }

    pub fn is_active(&self) -> bool {
        self.observation.is_some()
    }

    pub fn is_intersecting(&self) -> bool {
        self.intersecting
    }

    pub fn move_sentinel(&self, sentinel: Bounds) {
        if let Some(observation) = &self.observation {
            observation.set_bounds(sentinel);
        }
    }

    /// Feeds region entries to the trigger. Returns how many times the
    /// callback ran.
    pub fn dispatch(&mut self, entries: &[IntersectionEntry]) -> usize {
        let Some(id) = self.observation.as_ref().map(Observation::id) else {
            return 0;
        };
        let mut fired = 0;
        for entry in entries.iter().filter(|entry| entry.id == id) {
            let was_intersecting = self.intersecting;
            self.intersecting = entry.is_intersecting;
            if !was_intersecting && entry.is_intersecting {
                (self.callback)();
                fired += 1;
            }
        }
        fired
    }
}
