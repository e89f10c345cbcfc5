use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::cache::{FetchCompletion, Fetcher, ImageCache, ResourceLoader};
use crate::clock::Clock;
use crate::config::ViewerConfig;
use crate::document::{Document, PageProgression, TraversalOptions};
use crate::error::{ConfigError, ViewerError};
use crate::events::{EventBus, Subscriber, ViewerEvent};
use crate::geometry::{ScrollPosition, ViewportSize};
use crate::layout::{LayoutContext, ModeLayout, RedrawCause, TickOutcome};
use crate::params::ViewerParams;
use crate::plan::RenderPlan;
use crate::reduction::{AutofitClass, ReductionTable, ZoomDirection};
use crate::single::SinglePageLayout;
use crate::spread::{FlipRequest, SpreadLayout};
use crate::thumbnail::ThumbnailGridLayout;
use crate::timers::{Throttle, ThrottleDecision};
use crate::Command;

/// Fraction of a page kept on screen when scrolling by a screenful.
const SCROLL_OVERLAP: f32 = 0.03;
const GRID_SCROLL_FRACTION: f32 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewMode {
    #[serde(rename = "1up")]
    SinglePage,
    #[serde(rename = "2up")]
    TwoPageSpread,
    #[serde(rename = "thumb")]
    ThumbnailGrid,
}

impl ViewMode {
    pub fn is_reading(&self) -> bool {
        !matches!(self, ViewMode::ThumbnailGrid)
    }
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ViewMode::SinglePage => "1up",
            ViewMode::TwoPageSpread => "2up",
            ViewMode::ThumbnailGrid => "thumb",
        })
    }
}

impl FromStr for ViewMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1up" => Ok(ViewMode::SinglePage),
            "2up" => Ok(ViewMode::TwoPageSpread),
            "thumb" => Ok(ViewMode::ThumbnailGrid),
            other => Err(format!("unknown view mode `{other}`")),
        }
    }
}

/// What should currently be drawn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ViewportState {
    pub mode: ViewMode,
    pub current_index: usize,
    pub reduction: f32,
    pub page_scale: f32,
    pub scroll: ScrollPosition,
    pub autofit: Option<AutofitClass>,
}

struct ModeLayouts {
    single: SinglePageLayout,
    spread: SpreadLayout,
    grid: ThumbnailGridLayout,
}

impl ModeLayouts {
    fn get(&mut self, mode: ViewMode) -> &mut dyn ModeLayout {
        match mode {
            ViewMode::SinglePage => &mut self.single,
            ViewMode::TwoPageSpread => &mut self.spread,
            ViewMode::ThumbnailGrid => &mut self.grid,
        }
    }

    fn invalidate_all(&mut self) {
        self.single.invalidate();
        self.spread.invalidate();
        self.grid.invalidate();
    }
}

pub struct ViewportController {
    document: Arc<Document>,
    config: ViewerConfig,
    base_table: ReductionTable,
    cache: ImageCache,
    clock: Arc<dyn Clock>,
    layouts: ModeLayouts,
    state: ViewportState,
    viewport: ViewportSize,
    redraw: Throttle,
    deferred_cause: Option<RedrawCause>,
    events: EventBus,
    fullscreen: bool,
    prev_read_mode: Option<ViewMode>,
    search: Option<String>,
    plan: Option<RenderPlan>,
}

impl ViewportController {
    pub fn new(
        document: Arc<Document>,
        config: ViewerConfig,
        loader: Arc<dyn ResourceLoader>,
        fetcher: Box<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let base_table = config.base_table()?;
        let cache = ImageCache::new(Arc::clone(&document), loader, fetcher)
            .with_capacity(config.cache_capacity);
        let layouts = ModeLayouts {
            single: SinglePageLayout::new(),
            spread: SpreadLayout::new(Arc::clone(&document), config.spread.clone()),
            grid: ThumbnailGridLayout::new(config.thumbnails.clone()),
        };
        let state = ViewportState {
            mode: ViewMode::SinglePage,
            current_index: document.initial_index(),
            reduction: 1.0,
            page_scale: 1.0,
            scroll: ScrollPosition::default(),
            autofit: None,
        };
        Ok(Self {
            redraw: Throttle::new(config.redraw_interval),
            document,
            config,
            base_table,
            cache,
            clock,
            layouts,
            state,
            viewport: ViewportSize::default(),
            deferred_cause: None,
            events: EventBus::new(),
            fullscreen: false,
            prev_read_mode: None,
            search: None,
            plan: None,
        })
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn state(&self) -> ViewportState {
        self.state
    }

    pub fn mode(&self) -> ViewMode {
        self.state.mode
    }

    pub fn current_index(&self) -> usize {
        self.state.current_index
    }

    pub fn viewport(&self) -> ViewportSize {
        self.viewport
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn plan(&self) -> Option<&RenderPlan> {
        self.plan.as_ref()
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ViewerEvent>>> {
        self.events.log()
    }

    pub fn subscribe(&mut self, subscriber: Subscriber) {
        self.events.subscribe(subscriber);
    }

    pub fn search(&self) -> Option<&str> {
        self.search.as_deref()
    }

    pub fn set_search(&mut self, term: Option<String>) {
        self.search = term.filter(|term| !term.is_empty());
    }

    /// Lays out the first frame.
    #[instrument(skip(self))]
    pub fn initialize(&mut self, viewport: ViewportSize, mode: ViewMode) {
        self.viewport = viewport;
        let mode = self.supported_mode(mode);
        self.state.mode = mode;
        if mode.is_reading() {
            self.prev_read_mode = Some(mode);
        }
        let index = self.state.current_index;
        self.with_layout(|layout, state, ctx| {
            *state = layout.prepare(*state, ctx);
            *state = layout.jump_to_index(*state, index, ctx);
        });
        self.events.emit(ViewerEvent::ModeChanged { mode });
        self.draw(RedrawCause::Navigation);
    }

    /// Switches modes. Returns the mode actually entered, which is single
    /// page when the document is too short for the request.
    #[instrument(skip(self))]
    pub fn switch_mode(&mut self, mode: ViewMode) -> ViewMode {
        let mode = self.supported_mode(mode);
        if mode == self.state.mode {
            return mode;
        }
        let before = self.state.current_index;
        let outcome = self.with_layout(|layout, state, ctx| layout.leave(state, ctx));
        self.emit_page_changes(outcome);

        if mode.is_reading() {
            self.prev_read_mode = Some(mode);
        }
        if self.state.mode.is_reading() {
            self.state.page_scale = self.state.reduction;
        }
        self.state.mode = mode;
        let index = self.state.current_index;
        self.with_layout(|layout, state, ctx| {
            *state = layout.prepare(*state, ctx);
            *state = layout.jump_to_index(*state, index, ctx);
        });
        debug!(%mode, reduction = self.state.reduction, "mode switched");
        self.events.emit(ViewerEvent::ModeChanged { mode });
        self.commit_page(before);
        self.draw(RedrawCause::Navigation);
        mode
    }

    #[instrument(skip(self))]
    pub fn jump_to_index(&mut self, index: usize) {
        let index = self.retarget(index.min(self.document.last_index()));
        let before = self.state.current_index;
        self.with_layout(|layout, state, ctx| {
            *state = layout.jump_to_index(*state, index, ctx);
        });
        self.commit_page(before);
        self.draw(RedrawCause::Navigation);
    }

    /// Jumps to an external page label. Unknown labels leave the view as is.
    pub fn jump_to_page(&mut self, label: &str) -> bool {
        match self.document.parse_page_label(label) {
            Some(index) => {
                self.jump_to_index(index);
                true
            }
            None => {
                debug!(label, "unknown page label");
                false
            }
        }
    }

    pub fn next(&mut self, count: usize) -> bool {
        match self.state.mode {
            ViewMode::TwoPageSpread => self.flip(count, true),
            ViewMode::SinglePage | ViewMode::ThumbnailGrid => {
                let current = self.state.current_index;
                let mut target = current;
                for _ in 0..count.max(1) {
                    match self
                        .document
                        .next_item_index(target, TraversalOptions::combined())
                    {
                        Some(next) => target = next,
                        None => break,
                    }
                }
                self.move_to(current, target)
            }
        }
    }

    pub fn prev(&mut self, count: usize) -> bool {
        match self.state.mode {
            ViewMode::TwoPageSpread => self.flip(count, false),
            ViewMode::SinglePage | ViewMode::ThumbnailGrid => {
                let current = self.state.current_index;
                let mut target = current;
                for _ in 0..count.max(1) {
                    match self
                        .document
                        .prev_item_index(target, TraversalOptions::combined())
                    {
                        Some(prev) => target = prev,
                        None => break,
                    }
                }
                self.move_to(current, target)
            }
        }
    }

    pub fn first(&mut self) {
        self.jump_to_index(0);
    }

    pub fn last(&mut self) {
        self.jump_to_index(self.document.last_index());
    }

    pub fn left(&mut self) -> bool {
        match self.document.progression() {
            PageProgression::LeftToRight => self.prev(1),
            PageProgression::RightToLeft => self.next(1),
        }
    }

    pub fn right(&mut self) -> bool {
        match self.document.progression() {
            PageProgression::LeftToRight => self.next(1),
            PageProgression::RightToLeft => self.prev(1),
        }
    }

    pub fn leftmost(&mut self) {
        match self.document.progression() {
            PageProgression::LeftToRight => self.first(),
            PageProgression::RightToLeft => self.last(),
        }
    }

    pub fn rightmost(&mut self) {
        match self.document.progression() {
            PageProgression::LeftToRight => self.last(),
            PageProgression::RightToLeft => self.first(),
        }
    }

    #[instrument(skip(self))]
    pub fn zoom(&mut self, direction: ZoomDirection) {
        let before = self.state.current_index;
        self.with_layout(|layout, state, ctx| {
            *state = layout.zoom(*state, direction, ctx);
        });
        self.events.emit(ViewerEvent::ZoomChanged {
            reduction: self.state.reduction,
        });
        self.commit_page(before);
        self.draw(RedrawCause::Navigation);
    }

    #[instrument(skip(self))]
    pub fn resize(&mut self, viewport: ViewportSize) {
        let before = self.state.current_index;
        let reduction = self.state.reduction;
        self.viewport = viewport;
        self.layouts.invalidate_all();
        let index = self.state.current_index;
        self.with_layout(|layout, state, ctx| {
            *state = layout.prepare(*state, ctx);
            *state = layout.jump_to_index(*state, index, ctx);
        });
        self.events.emit(ViewerEvent::Resized {
            width: viewport.width,
            height: viewport.height,
        });
        if self.state.reduction != reduction {
            self.events.emit(ViewerEvent::ZoomChanged {
                reduction: self.state.reduction,
            });
        }
        self.commit_page(before);
        self.draw(RedrawCause::Resize);
    }

    /// Scroll events redraw at most once per interval; the trailing redraw
    /// uses whatever the scroll position is when it fires.
    pub fn scroll_to(&mut self, position: ScrollPosition) {
        self.state.scroll = ScrollPosition {
            top: position.top.max(0.0),
            left: position.left.max(0.0),
        };
        self.request_redraw(RedrawCause::Scroll);
    }

    pub fn scroll_by(&mut self, delta: f32) {
        let mut position = self.state.scroll;
        position.top += delta;
        self.scroll_to(position);
    }

    /// Returns false when the mode has no notion of scrolling.
    pub fn scroll_down(&mut self) -> bool {
        self.scroll_step(1.0)
    }

    pub fn scroll_up(&mut self) -> bool {
        self.scroll_step(-1.0)
    }

    fn scroll_step(&mut self, sign: f32) -> bool {
        match self.state.mode {
            ViewMode::TwoPageSpread => false,
            ViewMode::ThumbnailGrid => {
                self.scroll_by(sign * GRID_SCROLL_FRACTION * self.viewport.height);
                true
            }
            ViewMode::SinglePage => {
                let (layouts, state, ctx) = self.parts();
                let fit = layouts.single.fit_height_ratio(state, &ctx);
                let page_height = layouts.single.item_height(state, &ctx);
                let whole_pages = state.reduction >= fit;
                if whole_pages {
                    if sign > 0.0 {
                        self.next(1);
                    } else {
                        self.prev(1);
                    }
                } else {
                    let delta = self.viewport.height - page_height * SCROLL_OVERLAP;
                    self.scroll_by(sign * delta);
                }
                true
            }
        }
    }

    pub fn toggle_fullscreen(&mut self) {
        self.fullscreen = !self.fullscreen;
        self.events.emit(ViewerEvent::FullscreenToggled {
            active: self.fullscreen,
        });
        if self.fullscreen
            && self.viewport.width <= self.config.one_page_breakpoint
            && self.state.mode != ViewMode::SinglePage
        {
            self.switch_mode(ViewMode::SinglePage);
        }
    }

    /// Opens a thumbnail in the reading mode used before the grid.
    pub fn activate_thumbnail(&mut self, index: usize) {
        if self.state.mode != ViewMode::ThumbnailGrid {
            self.jump_to_index(index);
            return;
        }
        let before = self.state.current_index;
        self.state.current_index = self.retarget(index.min(self.document.last_index()));
        let mode = self.prev_read_mode.unwrap_or(ViewMode::SinglePage);
        self.commit_page(before);
        self.switch_mode(mode);
    }

    /// Advances timers: flips, staggered loads and trailing redraws.
    pub fn tick(&mut self) -> bool {
        let outcome = self.with_layout(|layout, state, ctx| layout.tick(state, ctx));
        let mut drawn = false;
        let redraw = outcome.redraw;
        self.emit_page_changes(outcome);
        if redraw {
            self.draw(RedrawCause::Timer);
            drawn = true;
        }
        if self.redraw.poll(self.clock.now()) {
            let cause = self.deferred_cause.take().unwrap_or(RedrawCause::Timer);
            self.draw(cause);
            drawn = true;
        }
        drawn
    }

    /// Earliest time `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Duration> {
        let layout = match self.state.mode {
            ViewMode::SinglePage => self.layouts.single.next_deadline(),
            ViewMode::TwoPageSpread => self.layouts.spread.next_deadline(),
            ViewMode::ThumbnailGrid => self.layouts.grid.next_deadline(),
        };
        match (layout, self.redraw.next_due()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Stores a fetch result. Only results the current layout still shows
    /// trigger a redraw.
    pub fn handle_fetch_completed(&mut self, completion: FetchCompletion) {
        let watchers = self.cache.complete(completion);
        let layout = self.layouts.get(self.state.mode);
        let mut relevant = false;
        for watcher in watchers {
            relevant |= layout.resource_ready(watcher);
        }
        if relevant {
            self.request_redraw(RedrawCause::ResourceReady);
        }
    }

    pub fn retry_failed(&mut self) -> usize {
        self.cache.retry_failed()
    }

    pub fn apply(&mut self, command: Command) -> Result<(), ViewerError> {
        match command {
            Command::NextPage { count } => {
                self.next(count);
            }
            Command::PrevPage { count } => {
                self.prev(count);
            }
            Command::GotoIndex { index } => self.jump_to_index(index),
            Command::GotoPage { label } => {
                if !self.jump_to_page(&label) {
                    return Err(ViewerError::PageNotFound(label));
                }
            }
            Command::FirstPage => self.first(),
            Command::LastPage => self.last(),
            Command::Left => {
                self.left();
            }
            Command::Right => {
                self.right();
            }
            Command::Leftmost => self.leftmost(),
            Command::Rightmost => self.rightmost(),
            Command::Zoom { direction } => self.zoom(direction),
            Command::SwitchMode { mode } => {
                self.switch_mode(mode);
            }
            Command::ScrollBy { delta } => self.scroll_by(delta),
            Command::ScrollDown => {
                self.scroll_down();
            }
            Command::ScrollUp => {
                self.scroll_up();
            }
            Command::Resize { viewport } => self.resize(viewport),
            Command::ToggleFullscreen => self.toggle_fullscreen(),
            Command::ActivateThumbnail { index } => self.activate_thumbnail(index),
            Command::FinishAnimations => self.finish_animations(),
            Command::RetryFailed => {
                self.retry_failed();
            }
        }
        Ok(())
    }

    /// Settles any running flip immediately.
    pub fn finish_animations(&mut self) {
        if self.state.mode != ViewMode::TwoPageSpread {
            return;
        }
        let outcome = self.with_layout(|layout, state, ctx| layout.leave(state, ctx));
        let redraw = outcome.redraw;
        self.emit_page_changes(outcome);
        if redraw {
            self.draw(RedrawCause::Navigation);
        }
    }

    pub fn params_from_current(&self) -> ViewerParams {
        let index = self.state.current_index;
        ViewerParams {
            index: Some(index),
            page: self.document.page_at(index).map(|page| page.label.clone()),
            mode: Some(self.state.mode),
            search: self.search.clone(),
        }
    }

    pub fn update_from_params(&mut self, params: &ViewerParams) {
        if let Some(mode) = params.mode {
            self.switch_mode(mode);
        }
        let jumped = params
            .page
            .as_deref()
            .is_some_and(|label| self.jump_to_page(label));
        if !jumped {
            if let Some(index) = params.index {
                self.jump_to_index(index);
            }
        }
        if params.search.is_some() {
            self.set_search(params.search.clone());
        }
    }

    fn flip(&mut self, count: usize, forward: bool) -> bool {
        let (layouts, state, mut ctx) = self.parts();
        let request = if forward {
            layouts.spread.flip_forward(state, count, &mut ctx)
        } else {
            layouts.spread.flip_backward(state, count, &mut ctx)
        };
        match request {
            FlipRequest::Started | FlipRequest::Queued => {
                self.draw(RedrawCause::Navigation);
                true
            }
            FlipRequest::AlreadyShown | FlipRequest::OutOfRange => false,
        }
    }

    fn move_to(&mut self, current: usize, target: usize) -> bool {
        if target == current {
            return false;
        }
        self.jump_to_index(target);
        true
    }

    /// Interior pages of an unviewable run resolve to the run start, or to
    /// the page after the run when the run is already shown.
    fn retarget(&self, index: usize) -> usize {
        if self.state.mode == ViewMode::TwoPageSpread {
            return index;
        }
        let Some(page) = self.document.page_at(index) else {
            return index;
        };
        if page.is_viewable || page.unviewable_run_start == index {
            return index;
        }
        let start = page.unviewable_run_start;
        let end = self.document.run_end(start);
        let current = self.state.current_index;
        if (start..=end).contains(&current) && end + 1 < self.document.len() {
            end + 1
        } else {
            start
        }
    }

    fn supported_mode(&self, mode: ViewMode) -> ViewMode {
        if mode != ViewMode::SinglePage && self.document.len() < 2 {
            warn!(%mode, pages = self.document.len(), "mode needs two pages; using 1up");
            ViewMode::SinglePage
        } else {
            mode
        }
    }

    fn request_redraw(&mut self, cause: RedrawCause) {
        match self.redraw.request(self.clock.now()) {
            ThrottleDecision::FireNow => self.draw(cause),
            ThrottleDecision::Deferred { .. } | ThrottleDecision::AlreadyScheduled => {
                let merged = match self.deferred_cause {
                    Some(RedrawCause::Scroll) => RedrawCause::Scroll,
                    _ => cause,
                };
                self.deferred_cause = Some(merged);
            }
        }
    }

    /// Full redraw. Any trailing redraw still pending is folded into this
    /// one; a scroll that has not been drawn yet keeps driving the current
    /// page unless this draw comes from navigation.
    fn draw(&mut self, cause: RedrawCause) {
        self.redraw.cancel();
        let cause = match (cause, self.deferred_cause.take()) {
            (RedrawCause::Navigation, _) => RedrawCause::Navigation,
            (_, Some(RedrawCause::Scroll)) => RedrawCause::Scroll,
            (cause, _) => cause,
        };
        let before = self.state.current_index;
        let plan = self.with_layout(|layout, state, ctx| {
            let (next, plan) = layout.render(*state, cause, ctx);
            *state = next;
            plan
        });
        self.plan = Some(plan);
        self.commit_page(before);
        self.events.emit(ViewerEvent::RedrawNeeded);
    }

    fn commit_page(&mut self, before: usize) {
        if self.state.current_index != before {
            self.events.emit(ViewerEvent::PageChanged {
                index: self.state.current_index,
            });
        }
    }

    fn emit_page_changes(&mut self, outcome: TickOutcome) {
        for index in outcome.page_changes {
            self.events.emit(ViewerEvent::PageChanged { index });
        }
    }

    fn parts(&mut self) -> (&mut ModeLayouts, &mut ViewportState, LayoutContext<'_>) {
        let now = self.clock.now();
        (
            &mut self.layouts,
            &mut self.state,
            LayoutContext {
                document: &self.document,
                cache: &mut self.cache,
                config: &self.config,
                base_table: &self.base_table,
                viewport: self.viewport,
                now,
            },
        )
    }

    fn with_layout<R>(
        &mut self,
        f: impl FnOnce(&mut dyn ModeLayout, &mut ViewportState, &mut LayoutContext<'_>) -> R,
    ) -> R {
        let mode = self.state.mode;
        let (layouts, state, mut ctx) = self.parts();
        f(layouts.get(mode), state, &mut ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{FakeLoader, RecordingFetcher};
    use crate::cache::{FetchOutcome, FetchRequest, Resource};
    use crate::clock::ManualClock;
    use crate::document::tests::{document_with_unviewables, uniform_document};
    use crate::plan::Slot;

    struct Harness {
        controller: ViewportController,
        clock: Arc<ManualClock>,
        requests: Arc<Mutex<Vec<FetchRequest>>>,
    }

    impl Harness {
        fn new(document: Document, mode: ViewMode) -> Self {
            let clock = Arc::new(ManualClock::new());
            let fetcher = RecordingFetcher::default();
            let requests = Arc::clone(&fetcher.requests);
            let mut controller = ViewportController::new(
                Arc::new(document),
                ViewerConfig::default(),
                Arc::new(FakeLoader),
                Box::new(fetcher),
                clock.clone(),
            )
            .unwrap();
            controller.initialize(ViewportSize::new(1000.0, 620.0), mode);
            Self {
                controller,
                clock,
                requests,
            }
        }

        fn advance(&mut self, millis: u64) -> bool {
            self.clock.advance(Duration::from_millis(millis));
            self.controller.tick()
        }

        fn events(&self) -> Vec<ViewerEvent> {
            self.controller.events().lock().clone()
        }

        fn page_changes(&self) -> Vec<usize> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    ViewerEvent::PageChanged { index } => Some(index),
                    _ => None,
                })
                .collect()
        }

        fn slots(&self) -> Vec<Slot> {
            self.controller
                .plan()
                .unwrap()
                .placements
                .iter()
                .map(|p| p.slot)
                .collect()
        }
    }

    #[test]
    fn spread_at_cover_pairs_blank_with_first_page() {
        let harness = Harness::new(uniform_document(100), ViewMode::TwoPageSpread);
        assert_eq!(
            harness.slots(),
            vec![Slot::Blank { index: -1 }, Slot::Page { index: 0 }]
        );
        assert_eq!(harness.controller.current_index(), 0);
        assert_eq!(harness.controller.state().reduction, 2.0);
        assert_eq!(
            harness.controller.plan().unwrap().placements[0].resource,
            Resource::Blank
        );
    }

    #[test]
    fn short_documents_fall_back_to_single_page() {
        let mut harness = Harness::new(uniform_document(1), ViewMode::TwoPageSpread);
        assert_eq!(harness.controller.mode(), ViewMode::SinglePage);
        assert_eq!(
            harness.controller.switch_mode(ViewMode::ThumbnailGrid),
            ViewMode::SinglePage
        );
        assert_eq!(harness.controller.mode(), ViewMode::SinglePage);
    }

    #[test]
    fn spread_flip_reports_page_change_once_on_completion() {
        let mut harness = Harness::new(uniform_document(100), ViewMode::TwoPageSpread);
        assert!(harness.controller.next(1));
        assert!(harness.controller.plan().unwrap().flip.is_some());
        assert!(harness.page_changes().is_empty());

        harness.advance(399);
        assert!(harness.page_changes().is_empty());
        harness.advance(1);
        assert_eq!(harness.page_changes(), vec![1]);
        harness.advance(400);
        assert_eq!(harness.page_changes(), vec![1]);
        assert_eq!(
            harness.slots(),
            vec![Slot::Page { index: 1 }, Slot::Page { index: 2 }]
        );
        assert!(harness.controller.plan().unwrap().flip.is_none());
    }

    #[test]
    fn page_change_follows_the_mutation_and_precedes_redraw() {
        let mut harness = Harness::new(uniform_document(20), ViewMode::SinglePage);
        harness.controller.jump_to_index(7);
        let events = harness.events();
        let position = events
            .iter()
            .position(|e| *e == ViewerEvent::PageChanged { index: 7 })
            .unwrap();
        assert_eq!(events[position + 1], ViewerEvent::RedrawNeeded);
        assert_eq!(harness.controller.current_index(), 7);
    }

    #[test]
    fn navigation_skips_unviewable_run_interiors() {
        let mut harness = Harness::new(
            document_with_unviewables(12, &[3, 4, 5]),
            ViewMode::SinglePage,
        );
        harness.controller.jump_to_index(4);
        assert_eq!(harness.controller.current_index(), 3);
        harness.controller.jump_to_index(4);
        assert_eq!(harness.controller.current_index(), 6);

        harness.controller.jump_to_index(2);
        assert!(harness.controller.next(1));
        assert_eq!(harness.controller.current_index(), 3);
        assert!(harness.controller.next(1));
        assert_eq!(harness.controller.current_index(), 6);
        assert!(harness.controller.prev(1));
        assert_eq!(harness.controller.current_index(), 3);
    }

    #[test]
    fn unknown_labels_leave_state_untouched() {
        let mut harness = Harness::new(uniform_document(10), ViewMode::SinglePage);
        harness.controller.jump_to_index(4);
        let before = harness.controller.state();
        assert!(!harness.controller.jump_to_page("chapter-nine"));
        assert_eq!(
            harness.controller.apply(Command::GotoPage {
                label: "xiv".into()
            }),
            Err(ViewerError::PageNotFound("xiv".into()))
        );
        assert_eq!(harness.controller.state(), before);
        assert!(harness.controller.jump_to_page("n8"));
        assert_eq!(harness.controller.current_index(), 8);
    }

    #[test]
    fn scroll_redraws_are_throttled_to_latest_state() {
        let mut harness = Harness::new(uniform_document(30), ViewMode::SinglePage);
        let redraws = |h: &Harness| {
            h.events()
                .iter()
                .filter(|e| **e == ViewerEvent::RedrawNeeded)
                .count()
        };
        assert_eq!(redraws(&harness), 1);

        harness.controller.scroll_by(100.0);
        assert_eq!(redraws(&harness), 2);
        harness.clock.advance(Duration::from_millis(10));
        harness.controller.scroll_by(100.0);
        harness.controller.scroll_by(1200.0);
        assert_eq!(redraws(&harness), 2);

        assert!(!harness.advance(100));
        assert!(harness.advance(140));
        assert_eq!(redraws(&harness), 3);
        let plan = harness.controller.plan().unwrap();
        assert_eq!(plan.scroll.top, 1405.0);
        assert_eq!(harness.controller.current_index(), 2);
    }

    #[test]
    fn navigation_draw_drops_the_pending_scroll_redraw() {
        let mut harness = Harness::new(uniform_document(30), ViewMode::SinglePage);
        let redraws = |h: &Harness| {
            h.events()
                .iter()
                .filter(|e| **e == ViewerEvent::RedrawNeeded)
                .count()
        };
        harness.controller.scroll_by(100.0);
        harness.clock.advance(Duration::from_millis(10));
        harness.controller.scroll_by(100.0);
        assert!(harness.controller.next_deadline().is_some());
        assert_eq!(redraws(&harness), 2);

        harness.controller.next(1);
        assert_eq!(redraws(&harness), 3);
        assert_eq!(harness.controller.next_deadline(), None);

        assert!(!harness.advance(300));
        assert_eq!(redraws(&harness), 3);
        assert_eq!(harness.controller.current_index(), 1);
    }

    #[test]
    fn zoom_survives_mode_round_trip() {
        let mut harness = Harness::new(uniform_document(30), ViewMode::SinglePage);
        assert_eq!(harness.controller.state().reduction, 2.0);
        harness.controller.zoom(ZoomDirection::Out);
        assert_eq!(harness.controller.state().reduction, 3.0);
        harness.controller.switch_mode(ViewMode::ThumbnailGrid);
        harness.controller.switch_mode(ViewMode::SinglePage);
        assert_eq!(harness.controller.state().reduction, 3.0);
        assert_eq!(harness.controller.state().autofit, None);
    }

    #[test]
    fn grid_visit_keeps_the_reading_page_scale() {
        let mut harness = Harness::new(uniform_document(30), ViewMode::SinglePage);
        harness.controller.zoom(ZoomDirection::Width);
        let fit_width = harness.controller.state().reduction;
        assert_eq!(fit_width, 800.0 / 920.0);

        harness.controller.switch_mode(ViewMode::ThumbnailGrid);
        assert_eq!(harness.controller.state().reduction, 1.0);
        assert_eq!(harness.controller.state().page_scale, fit_width);

        harness.controller.switch_mode(ViewMode::SinglePage);
        assert_eq!(harness.controller.state().reduction, fit_width);
        assert_eq!(harness.controller.state().page_scale, fit_width);
    }

    #[test]
    fn scroll_down_turns_whole_pages_or_scrolls_zoomed_ones() {
        let mut harness = Harness::new(uniform_document(30), ViewMode::SinglePage);
        assert!(harness.controller.scroll_down());
        assert_eq!(harness.controller.current_index(), 1);

        harness.controller.zoom(ZoomDirection::In);
        let top = harness.controller.state().scroll.top;
        assert!(harness.controller.scroll_down());
        let expected = top + (620.0 - 1200.0 * SCROLL_OVERLAP);
        assert_eq!(harness.controller.state().scroll.top, expected);

        harness.controller.switch_mode(ViewMode::TwoPageSpread);
        assert!(!harness.controller.scroll_down());
    }

    #[test]
    fn thumbnail_activation_returns_to_previous_reading_mode() {
        let mut harness = Harness::new(uniform_document(40), ViewMode::TwoPageSpread);
        harness.controller.switch_mode(ViewMode::ThumbnailGrid);
        harness.controller.activate_thumbnail(17);
        assert_eq!(harness.controller.mode(), ViewMode::TwoPageSpread);
        assert_eq!(harness.controller.current_index(), 17);
        assert_eq!(
            harness.slots(),
            vec![Slot::Page { index: 17 }, Slot::Page { index: 18 }]
        );
    }

    #[test]
    fn fullscreen_on_narrow_screens_forces_single_page() {
        let mut harness = Harness::new(uniform_document(40), ViewMode::TwoPageSpread);
        harness.controller.resize(ViewportSize::new(700.0, 600.0));
        harness.controller.toggle_fullscreen();
        assert!(harness.controller.is_fullscreen());
        assert_eq!(harness.controller.mode(), ViewMode::SinglePage);
        assert!(harness
            .events()
            .contains(&ViewerEvent::FullscreenToggled { active: true }));
    }

    #[test]
    fn fetch_completion_redraws_visible_pages_only() {
        let mut harness = Harness::new(uniform_document(30), ViewMode::SinglePage);
        let first = harness.requests.lock()[0].clone();
        assert_eq!(first.key.page_index, 0);
        harness.controller.handle_fetch_completed(FetchCompletion {
            request: first,
            outcome: FetchOutcome::Loaded,
        });
        harness.advance(250);
        let plan = harness.controller.plan().unwrap();
        assert!(plan.placement_for(0).unwrap().resource.is_resolved());

        let redraws_before = harness.events().len();
        harness.controller.handle_fetch_completed(FetchCompletion {
            request: FetchRequest {
                key: crate::cache::CacheKey::new(25, 2.0),
                uri: "mem://25".into(),
            },
            outcome: FetchOutcome::Loaded,
        });
        harness.advance(500);
        assert_eq!(harness.events().len(), redraws_before);
    }

    #[test]
    fn params_round_trip_through_the_controller() {
        let mut harness = Harness::new(uniform_document(30), ViewMode::SinglePage);
        harness.controller.jump_to_index(5);
        harness.controller.set_search(Some("whale".into()));
        let fragment = harness.controller.params_from_current().to_fragment();
        assert_eq!(fragment, "page/n5/mode/1up/search/whale");

        let params = ViewerParams::from_fragment("page/n12/mode/thumb");
        harness.controller.update_from_params(&params);
        assert_eq!(harness.controller.mode(), ViewMode::ThumbnailGrid);
        assert_eq!(harness.controller.current_index(), 12);
        assert_eq!(harness.controller.search(), Some("whale"));
    }

    #[test]
    fn apply_routes_commands() {
        let mut harness = Harness::new(uniform_document(30), ViewMode::SinglePage);
        harness
            .controller
            .apply(Command::NextPage { count: 3 })
            .unwrap();
        assert_eq!(harness.controller.current_index(), 3);
        harness.controller.apply(Command::LastPage).unwrap();
        assert_eq!(harness.controller.current_index(), 29);
        harness.controller.apply(Command::Leftmost).unwrap();
        assert_eq!(harness.controller.current_index(), 0);
        harness
            .controller
            .apply(Command::SwitchMode {
                mode: ViewMode::ThumbnailGrid,
            })
            .unwrap();
        assert_eq!(harness.controller.mode(), ViewMode::ThumbnailGrid);
        assert!(harness
            .events()
            .contains(&ViewerEvent::ModeChanged {
                mode: ViewMode::ThumbnailGrid
            }));
    }

    #[test]
    fn mode_names_parse_and_print() {
        assert_eq!("2up".parse::<ViewMode>().unwrap(), ViewMode::TwoPageSpread);
        assert_eq!(ViewMode::ThumbnailGrid.to_string(), "thumb");
        assert!("3up".parse::<ViewMode>().is_err());
    }
}
