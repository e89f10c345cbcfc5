use std::time::Duration;

use crate::cache::{ImageCache, Watcher};
use crate::config::ViewerConfig;
use crate::document::Document;
use crate::geometry::ViewportSize;
use crate::plan::RenderPlan;
use crate::reduction::{ReductionTable, ZoomDirection};
use crate::viewport::ViewportState;

/// What a layout may touch while handling one event.
pub struct LayoutContext<'a> {
    pub document: &'a Document,
    pub cache: &'a mut ImageCache,
    pub config: &'a ViewerConfig,
    pub base_table: &'a ReductionTable,
    pub viewport: ViewportSize,
    pub now: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedrawCause {
    Navigation,
    Scroll,
    Resize,
    ResourceReady,
    Timer,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub redraw: bool,
    pub page_changes: Vec<usize>,
}

/// Per-mode capabilities. State goes in by value and the updated copy comes
/// back, so layouts never hold the viewport state themselves.
pub trait ModeLayout {
    /// Entering the mode, or re-entering after a resize.
    fn prepare(&mut self, state: ViewportState, ctx: &mut LayoutContext<'_>) -> ViewportState;

    fn reduction_table(&self, state: &ViewportState, ctx: &LayoutContext<'_>) -> ReductionTable;

    fn jump_to_index(
        &mut self,
        state: ViewportState,
        index: usize,
        ctx: &mut LayoutContext<'_>,
    ) -> ViewportState;

    fn render(
        &mut self,
        state: ViewportState,
        cause: RedrawCause,
        ctx: &mut LayoutContext<'_>,
    ) -> (ViewportState, RenderPlan);

    fn zoom(
        &mut self,
        state: ViewportState,
        direction: ZoomDirection,
        ctx: &mut LayoutContext<'_>,
    ) -> ViewportState;

    /// Whether a completed fetch changes what this layout shows.
    fn resource_ready(&mut self, watcher: Watcher) -> bool;

    fn tick(&mut self, state: &mut ViewportState, ctx: &mut LayoutContext<'_>) -> TickOutcome {
        let _ = (state, ctx);
        TickOutcome::default()
    }

    /// Leaving the mode. Pending animations settle here.
    fn leave(&mut self, state: &mut ViewportState, ctx: &mut LayoutContext<'_>) -> TickOutcome {
        let _ = (state, ctx);
        TickOutcome::default()
    }

    fn invalidate(&mut self);

    fn next_deadline(&self) -> Option<Duration> {
        None
    }
}
