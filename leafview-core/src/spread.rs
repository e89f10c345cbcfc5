use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::cache::{CacheKey, ImageCache, Resource, Watcher};
use crate::config::SpreadConfig;
use crate::document::Document;
use crate::geometry::{Rect, ScrollPosition};
use crate::layout::{LayoutContext, ModeLayout, RedrawCause, TickOutcome};
use crate::plan::{FlipProgress, Placement, RenderPlan, Slot};
use crate::reduction::{spread_table, AutofitClass, ReductionTable, ZoomDirection};
use crate::timers::TimerQueue;
use crate::viewport::{ViewMode, ViewportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipDirection {
    None,
    Forward,
    Backward,
}

/// Indices shown on the left and right of the spread. Either may be a blank
/// sentinel outside the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpreadState {
    pub left: isize,
    pub right: isize,
    pub direction: FlipDirection,
}

impl SpreadState {
    pub fn indices(&self) -> [isize; 2] {
        [self.left, self.right]
    }

    pub fn low(&self) -> isize {
        self.left.min(self.right)
    }

    pub fn high(&self) -> isize {
        self.left.max(self.right)
    }

    pub fn contains(&self, index: isize) -> bool {
        self.low() <= index && index <= self.high()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FlipPhase {
    Idle,
    Flipping {
        direction: FlipDirection,
        to: [isize; 2],
        started: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipRequest {
    AlreadyShown,
    Started,
    Queued,
    OutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedFlip {
    pub spread: [isize; 2],
    pub index: usize,
}

/// Two page state machine. Flips are explicit phases advanced by `tick`,
/// so nothing here depends on wall-clock timers.
pub struct SpreadFlipController {
    document: Arc<Document>,
    settings: SpreadConfig,
    state: SpreadState,
    phase: FlipPhase,
    queued: Option<usize>,
    staged: BTreeSet<usize>,
    deferred: TimerQueue<usize>,
}

impl SpreadFlipController {
    pub fn new(document: Arc<Document>, settings: SpreadConfig) -> Self {
        let [left, right] = document.spread_indices(0);
        Self {
            document,
            settings,
            state: SpreadState {
                left,
                right,
                direction: FlipDirection::None,
            },
            phase: FlipPhase::Idle,
            queued: None,
            staged: BTreeSet::new(),
            deferred: TimerQueue::new(),
        }
    }

    pub fn state(&self) -> SpreadState {
        self.state
    }

    pub fn is_flipping(&self) -> bool {
        matches!(self.phase, FlipPhase::Flipping { .. })
    }

    pub fn queued(&self) -> Option<usize> {
        self.queued
    }

    pub fn staged(&self) -> Vec<usize> {
        self.staged.iter().copied().collect()
    }

    /// Lowest in-range index of the shown spread.
    pub fn current_index(&self) -> usize {
        let last = self.document.last_index() as isize;
        let low = self.state.low();
        let index = if (0..=last).contains(&low) {
            low
        } else {
            self.state.high()
        };
        index.clamp(0, last) as usize
    }

    pub fn active_window(&self) -> RangeInclusive<isize> {
        let margin = self.settings.prune_margin as isize;
        (self.state.low() - margin)..=(self.state.high() + margin)
    }

    /// Places the spread without animating.
    pub fn pin(&mut self, target: usize) {
        let [left, right] = self.document.spread_indices(self.clamp(target) as isize);
        self.state = SpreadState {
            left,
            right,
            direction: FlipDirection::None,
        };
        self.phase = FlipPhase::Idle;
        self.queued = None;
    }

    /// Prefetches around the shown spread and prunes everything else.
    pub fn settle(&mut self, reduction: f32, now: Duration, cache: &mut ImageCache) {
        self.prefetch(reduction, now, cache);
        self.prune(reduction, cache);
    }

    pub fn jump_to_index(
        &mut self,
        target: usize,
        reduction: f32,
        now: Duration,
        cache: &mut ImageCache,
    ) -> FlipRequest {
        let target = self.clamp(target);
        if self.is_flipping() {
            self.queued = Some(target);
            return FlipRequest::Queued;
        }
        if self.state.contains(target as isize) {
            return FlipRequest::AlreadyShown;
        }

        let to = self.document.spread_indices(target as isize);
        let direction = if (target as isize) < self.state.low() {
            FlipDirection::Backward
        } else {
            FlipDirection::Forward
        };
        for index in to {
            self.stage(index, reduction, cache);
        }
        debug!(?direction, from = ?self.state.indices(), ?to, "flip started");
        self.state.direction = direction;
        self.phase = FlipPhase::Flipping {
            direction,
            to,
            started: now,
        };
        FlipRequest::Started
    }

    pub fn flip_forward(
        &mut self,
        count: usize,
        reduction: f32,
        now: Duration,
        cache: &mut ImageCache,
    ) -> FlipRequest {
        let base = match self.pending_target() {
            Some(target) => {
                let [a, b] = self.document.spread_indices(target as isize);
                a.max(b)
            }
            None => self.state.high(),
        };
        let first = base + 1;
        if first > self.document.last_index() as isize {
            return FlipRequest::OutOfRange;
        }
        let target = first + 2 * (count.max(1) as isize - 1);
        self.jump_to_index(target as usize, reduction, now, cache)
    }

    pub fn flip_backward(
        &mut self,
        count: usize,
        reduction: f32,
        now: Duration,
        cache: &mut ImageCache,
    ) -> FlipRequest {
        let base = match self.pending_target() {
            Some(target) => {
                let [a, b] = self.document.spread_indices(target as isize);
                a.min(b)
            }
            None => self.state.low(),
        };
        let first = base - 1;
        if first < 0 {
            return FlipRequest::OutOfRange;
        }
        let target = (first - 2 * (count.max(1) as isize - 1)).max(0);
        self.jump_to_index(target as usize, reduction, now, cache)
    }

    /// Runs deferred prefetches and completes a flip whose duration elapsed.
    pub fn tick(
        &mut self,
        reduction: f32,
        now: Duration,
        cache: &mut ImageCache,
    ) -> Vec<CompletedFlip> {
        for index in self.deferred.drain_due(now) {
            if self.active_window().contains(&(index as isize)) {
                self.stage(index as isize, reduction, cache);
            }
        }

        let mut completed = Vec::new();
        while let FlipPhase::Flipping { started, .. } = self.phase {
            if now < started + self.settings.flip_duration {
                break;
            }
            completed.push(self.complete(reduction, now, cache));
            if let Some(next) = self.queued.take() {
                self.jump_to_index(next, reduction, now, cache);
            }
        }
        completed
    }

    /// Completes the current flip and any queued one immediately.
    pub fn finish_now(
        &mut self,
        reduction: f32,
        now: Duration,
        cache: &mut ImageCache,
    ) -> Vec<CompletedFlip> {
        let mut completed = Vec::new();
        while self.is_flipping() {
            completed.push(self.complete(reduction, now, cache));
            if let Some(next) = self.queued.take() {
                self.jump_to_index(next, reduction, now, cache);
            }
        }
        completed
    }

    pub fn progress(&self, now: Duration) -> Option<FlipProgress> {
        match self.phase {
            FlipPhase::Idle => None,
            FlipPhase::Flipping {
                direction,
                to,
                started,
            } => {
                let total = self.settings.flip_duration.as_secs_f32();
                let elapsed = now.saturating_sub(started).as_secs_f32();
                let progress = if total > 0.0 {
                    (elapsed / total).min(1.0)
                } else {
                    1.0
                };
                Some(FlipProgress {
                    direction,
                    from: self.state.indices(),
                    to,
                    progress,
                })
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        let flip = match self.phase {
            FlipPhase::Flipping { started, .. } => Some(started + self.settings.flip_duration),
            FlipPhase::Idle => None,
        };
        match (flip, self.deferred.next_due()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn complete(&mut self, reduction: f32, now: Duration, cache: &mut ImageCache) -> CompletedFlip {
        let FlipPhase::Flipping { to, .. } = self.phase else {
            return CompletedFlip {
                spread: self.state.indices(),
                index: self.current_index(),
            };
        };
        self.state = SpreadState {
            left: to[0],
            right: to[1],
            direction: FlipDirection::None,
        };
        self.phase = FlipPhase::Idle;
        self.settle(reduction, now, cache);
        debug!(spread = ?to, "flip completed");
        CompletedFlip {
            spread: to,
            index: self.current_index(),
        }
    }

    fn prefetch(&mut self, reduction: f32, now: Duration, cache: &mut ImageCache) {
        let (low, high) = (self.state.low(), self.state.high());
        for index in [low, high] {
            self.stage(index, reduction, cache);
        }
        let last = self.document.last_index() as isize;
        for distance in 1..=self.settings.prefetch_distance as isize {
            for index in [low - distance, high + distance] {
                if !(0..=last).contains(&index) {
                    continue;
                }
                if distance == 1 {
                    self.stage(index, reduction, cache);
                } else if !cache.is_resolved(index, reduction) {
                    let position = index as usize;
                    if !self.deferred.contains(|queued| *queued == position) {
                        self.deferred
                            .schedule(now + self.settings.stagger_delay, position);
                    }
                }
            }
        }
    }

    fn prune(&mut self, reduction: f32, cache: &mut ImageCache) -> Vec<CacheKey> {
        let window = self.active_window();
        let evicted = cache.evict_outside(window.clone(), reduction);
        self.staged.retain(|index| window.contains(&(*index as isize)));
        self.deferred
            .retain(|index| window.contains(&(*index as isize)));
        evicted
    }

    fn stage(&mut self, index: isize, reduction: f32, cache: &mut ImageCache) {
        let Ok(position) = usize::try_from(index) else {
            return;
        };
        if position >= self.document.len() {
            return;
        }
        let resource = cache.resource(index, reduction);
        if !resource.is_resolved() {
            cache.watch(
                CacheKey::new(position, reduction),
                Watcher::Staged { index: position },
            );
        }
        self.staged.insert(position);
    }

    fn pending_target(&self) -> Option<usize> {
        self.queued.or(match self.phase {
            FlipPhase::Flipping { to, .. } => {
                let last = self.document.last_index() as isize;
                to.into_iter()
                    .filter(|index| (0..=last).contains(index))
                    .min()
                    .map(|index| index as usize)
            }
            FlipPhase::Idle => None,
        })
    }

    fn clamp(&self, index: usize) -> usize {
        index.min(self.document.last_index())
    }
}

/// Side-by-side spread rendering on top of the flip state machine.
pub struct SpreadLayout {
    flips: SpreadFlipController,
    autofit: Option<AutofitClass>,
}

impl SpreadLayout {
    pub fn new(document: Arc<Document>, settings: SpreadConfig) -> Self {
        Self {
            flips: SpreadFlipController::new(document, settings),
            autofit: Some(AutofitClass::Auto),
        }
    }

    pub fn flips(&self) -> &SpreadFlipController {
        &self.flips
    }

    pub fn flip_forward(
        &mut self,
        state: &ViewportState,
        count: usize,
        ctx: &mut LayoutContext<'_>,
    ) -> FlipRequest {
        self.flips
            .flip_forward(count, state.reduction, ctx.now, ctx.cache)
    }

    pub fn flip_backward(
        &mut self,
        state: &ViewportState,
        count: usize,
        ctx: &mut LayoutContext<'_>,
    ) -> FlipRequest {
        self.flips
            .flip_backward(count, state.reduction, ctx.now, ctx.cache)
    }

    /// Ratio at which both pages of the shown spread fit the viewport.
    fn fit_ratio(&self, ctx: &LayoutContext<'_>) -> f32 {
        let [a, b] = self.flips.state().indices();
        let (left, right) = page_sizes(ctx.document, a, b);
        let padding = ctx.config.padding;
        let usable_height = (ctx.viewport.height - 2.0 * padding).max(1.0);
        let usable_width = (ctx.viewport.width - 2.0 * padding).max(1.0);
        let height = left.1.max(right.1);
        let width = left.0 + right.0;
        (height / usable_height).max(width / usable_width)
    }
}

/// Native sizes of both sides; a blank side mirrors its partner.
fn page_sizes(document: &Document, left: isize, right: isize) -> ((f32, f32), (f32, f32)) {
    let size = |index: isize| {
        document
            .page_at_signed(index)
            .map(|page| (page.width as f32, page.height as f32))
    };
    match (size(left), size(right)) {
        (Some(l), Some(r)) => (l, r),
        (Some(l), None) => (l, l),
        (None, Some(r)) => (r, r),
        (None, None) => {
            let median = document.median_page_size();
            let pair = (median.width, median.height);
            (pair, pair)
        }
    }
}

impl ModeLayout for SpreadLayout {
    fn prepare(&mut self, mut state: ViewportState, ctx: &mut LayoutContext<'_>) -> ViewportState {
        if !self.flips.state().contains(state.current_index as isize) {
            self.flips.pin(state.current_index);
        }
        let factor = self
            .reduction_table(&state, ctx)
            .resolve(state.page_scale, self.autofit);
        state.reduction = factor.ratio;
        state.autofit = self.autofit;
        state.current_index = self.flips.current_index();
        state.scroll = ScrollPosition::default();
        self.flips.settle(state.reduction, ctx.now, ctx.cache);
        state
    }

    fn reduction_table(&self, _state: &ViewportState, ctx: &LayoutContext<'_>) -> ReductionTable {
        spread_table(ctx.base_table, self.fit_ratio(ctx))
    }

    fn jump_to_index(
        &mut self,
        state: ViewportState,
        index: usize,
        ctx: &mut LayoutContext<'_>,
    ) -> ViewportState {
        self.flips
            .jump_to_index(index, state.reduction, ctx.now, ctx.cache);
        state
    }

    fn render(
        &mut self,
        mut state: ViewportState,
        _cause: RedrawCause,
        ctx: &mut LayoutContext<'_>,
    ) -> (ViewportState, RenderPlan) {
        let spread = self.flips.state();
        let reduction = state.reduction;
        let (left_size, right_size) = page_sizes(ctx.document, spread.left, spread.right);
        let scaled = |size: (f32, f32)| ((size.0 / reduction).floor(), (size.1 / reduction).floor());
        let (left_w, left_h) = scaled(left_size);
        let (right_w, right_h) = scaled(right_size);

        let padding = ctx.config.padding;
        let content_width = ctx.viewport.width.max(left_w + right_w + 2.0 * padding);
        let content_height = ctx.viewport.height.max(left_h.max(right_h) + 2.0 * padding);
        let gutter = (content_width / 2.0).floor();

        let centered = |height: f32| ((content_height - height) / 2.0).floor();
        let sides = [
            (
                spread.left,
                Rect::new(gutter - left_w, centered(left_h), left_w, left_h),
            ),
            (
                spread.right,
                Rect::new(gutter, centered(right_h), right_w, right_h),
            ),
        ];

        let mut placements = Vec::with_capacity(2);
        for (index, rect) in sides {
            let placement = match ctx.document.page_at_signed(index) {
                Some(page) => {
                    let resource = ctx.cache.resource(index, reduction);
                    if !resource.is_resolved() {
                        ctx.cache.watch(
                            CacheKey::new(page.index, reduction),
                            Watcher::Page { index: page.index },
                        );
                    }
                    Placement {
                        slot: Slot::Page { index: page.index },
                        rect,
                        resource,
                        highlighted: false,
                        srcset: ctx.cache.srcset(page.index, reduction),
                    }
                }
                None => Placement {
                    slot: Slot::Blank { index },
                    rect,
                    resource: Resource::Blank,
                    highlighted: false,
                    srcset: Vec::new(),
                },
            };
            placements.push(placement);
        }

        state.scroll.top = state
            .scroll
            .top
            .clamp(0.0, (content_height - ctx.viewport.height).max(0.0));
        state.scroll.left = state
            .scroll
            .left
            .clamp(0.0, (content_width - ctx.viewport.width).max(0.0));

        let plan = RenderPlan {
            mode: ViewMode::TwoPageSpread,
            current_index: state.current_index,
            reduction,
            content_width,
            content_height,
            scroll: state.scroll,
            placements,
            flip: self.flips.progress(ctx.now),
            staged: self.flips.staged(),
        };
        (state, plan)
    }

    fn zoom(
        &mut self,
        mut state: ViewportState,
        direction: ZoomDirection,
        ctx: &mut LayoutContext<'_>,
    ) -> ViewportState {
        let factor = self
            .reduction_table(&state, ctx)
            .next(state.reduction, direction);
        self.autofit = factor.autofit;
        state.reduction = factor.ratio;
        state.page_scale = factor.ratio;
        state.autofit = factor.autofit;
        state
    }

    fn resource_ready(&mut self, watcher: Watcher) -> bool {
        match watcher {
            Watcher::Page { index } => self.flips.state().contains(index as isize),
            Watcher::Thumbnail { .. } | Watcher::Staged { .. } => false,
        }
    }

    fn tick(&mut self, state: &mut ViewportState, ctx: &mut LayoutContext<'_>) -> TickOutcome {
        let completed = self.flips.tick(state.reduction, ctx.now, ctx.cache);
        outcome(state, &self.flips, completed)
    }

    fn leave(&mut self, state: &mut ViewportState, ctx: &mut LayoutContext<'_>) -> TickOutcome {
        let completed = self.flips.finish_now(state.reduction, ctx.now, ctx.cache);
        outcome(state, &self.flips, completed)
    }

    fn invalidate(&mut self) {}

    fn next_deadline(&self) -> Option<Duration> {
        self.flips.next_deadline()
    }
}

fn outcome(
    state: &mut ViewportState,
    flips: &SpreadFlipController,
    completed: Vec<CompletedFlip>,
) -> TickOutcome {
    if completed.is_empty() {
        return TickOutcome::default();
    }
    state.current_index = flips.current_index();
    TickOutcome {
        redraw: true,
        page_changes: completed.into_iter().map(|flip| flip.index).collect(),
    }
}
