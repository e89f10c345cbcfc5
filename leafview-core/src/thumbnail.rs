use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use tracing::debug;

use crate::cache::{CacheKey, Resource, Watcher};
use crate::config::{ThumbnailConfig, MAX_THUMBNAIL_COLUMNS, MIN_THUMBNAIL_COLUMNS};
use crate::document::{Document, PageItem, PageProgression, TraversalOptions};
use crate::geometry::{clamp_scroll, Rect, ViewportSize};
use crate::layout::{LayoutContext, ModeLayout, RedrawCause, TickOutcome};
use crate::plan::{Placement, RenderPlan, Slot};
use crate::reduction::{thumbnail_reduction, ReductionTable, ZoomDirection};
use crate::timers::TimerQueue;
use crate::viewport::{ViewMode, ViewportState};

#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub start: usize,
    pub end: usize,
    pub run: bool,
    pub left: f32,
    pub height: f32,
    pub reduction: f32,
}

impl GridCell {
    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index <= self.end
    }

    fn slot(&self) -> Slot {
        if self.run {
            Slot::UnviewableRun {
                start: self.start,
                end: self.end,
            }
        } else {
            Slot::Page { index: self.start }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    pub top: f32,
    pub height: f32,
    pub cells: Vec<GridCell>,
}

impl GridRow {
    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    fn first_index(&self) -> usize {
        self.cells.first().map_or(0, |cell| cell.start)
    }

    fn last_index(&self) -> usize {
        self.cells.last().map_or(0, |cell| cell.end)
    }
}

/// Row packing of the whole document at one thumbnail width.
#[derive(Debug, Clone, PartialEq)]
pub struct GridGeometry {
    pub thumb_width: f32,
    pub padding: f32,
    pub view_width: f32,
    pub max_right: f32,
    pub content_height: f32,
    pub right_to_left: bool,
    pub rows: Vec<GridRow>,
}

impl GridGeometry {
    pub fn compute(document: &Document, thumb_width: f32, padding: f32, view_width: f32) -> Self {
        let mut rows: Vec<GridRow> = Vec::new();
        let mut cells: Vec<GridCell> = Vec::new();
        let mut row_height = 0.0f32;
        let mut right_pos = 0.0f32;
        let mut max_right = 0.0f32;

        for item in document.pages_iter(TraversalOptions::combined()) {
            if right_pos + thumb_width + padding > view_width && !cells.is_empty() {
                rows.push(GridRow {
                    top: 0.0,
                    height: row_height,
                    cells: std::mem::take(&mut cells),
                });
                right_pos = 0.0;
                row_height = 0.0;
            }
            let page = item.page();
            let height = (thumb_width * page.height as f32 / page.width as f32).floor();
            row_height = row_height.max(height);
            cells.push(GridCell {
                start: item.start(),
                end: item.end(),
                run: matches!(item, PageItem::UnviewableRun { .. }) || !page.is_viewable,
                left: right_pos,
                height,
                reduction: thumbnail_reduction(page.width, thumb_width),
            });
            right_pos += thumb_width + padding;
            max_right = max_right.max(right_pos);
        }
        if !cells.is_empty() {
            rows.push(GridRow {
                top: 0.0,
                height: row_height,
                cells,
            });
        }

        let mut bottom = padding;
        for row in &mut rows {
            row.top = bottom;
            bottom += row.height + padding;
        }

        Self {
            thumb_width,
            padding,
            view_width,
            max_right,
            content_height: bottom,
            right_to_left: document.progression() == PageProgression::RightToLeft,
            rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row_of(&self, index: usize) -> Option<usize> {
        let row = self
            .rows
            .partition_point(|row| row.last_index() < index);
        (row < self.rows.len() && self.rows[row].first_index() <= index).then_some(row)
    }

    /// Rows touching `[top, bottom]`: top edge inside, bottom edge inside,
    /// or the row spanning the whole band.
    pub fn visible_rows(&self, top: f32, bottom: f32) -> Option<RangeInclusive<usize>> {
        let mut visible = self.rows.iter().enumerate().filter(|(_, row)| {
            (row.top >= top && row.top < bottom)
                || (row.bottom() > top && row.bottom() <= bottom)
                || (row.top <= top && row.bottom() >= bottom)
        });
        let (first, _) = visible.next()?;
        let last = visible.last().map_or(first, |(index, _)| index);
        Some(first..=last)
    }

    /// `buffer` rows before and `buffer + 1` after, clamped to the grid.
    pub fn padded_rows(
        &self,
        visible: &RangeInclusive<usize>,
        buffer: usize,
    ) -> RangeInclusive<usize> {
        let first = visible.start().saturating_sub(buffer);
        let last = (visible.end() + buffer + 1).min(self.rows.len().saturating_sub(1));
        first..=last
    }

    pub fn cell_rect(&self, row: usize, cell: usize) -> Option<Rect> {
        let grid_row = self.rows.get(row)?;
        let cell = grid_row.cells.get(cell)?;
        let span = (self.max_right - self.padding).max(0.0);
        let offset = ((self.view_width - span) / 2.0).floor().max(0.0);
        let x = if self.right_to_left {
            self.view_width - offset - cell.left - self.thumb_width
        } else {
            offset + cell.left
        };
        Some(Rect::new(x, grid_row.top, self.thumb_width, cell.height))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RowState {
    loaded: bool,
}

pub struct ThumbnailGridLayout {
    settings: ThumbnailConfig,
    columns: u32,
    geometry: Option<GridGeometry>,
    displayed: BTreeMap<usize, RowState>,
    lazy: TimerQueue<usize>,
}

impl ThumbnailGridLayout {
    pub fn new(settings: ThumbnailConfig) -> Self {
        let columns = settings
            .columns
            .clamp(MIN_THUMBNAIL_COLUMNS, MAX_THUMBNAIL_COLUMNS);
        Self {
            settings,
            columns,
            geometry: None,
            displayed: BTreeMap::new(),
            lazy: TimerQueue::new(),
        }
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn geometry(&self) -> Option<&GridGeometry> {
        self.geometry.as_ref()
    }

    pub fn displayed_rows(&self) -> Vec<usize> {
        self.displayed.keys().copied().collect()
    }

    pub fn thumb_width(&self, viewport: ViewportSize) -> f32 {
        let columns = self.columns as f32;
        let width =
            ((viewport.width - (columns + 1.0) * self.settings.padding) / (columns + 0.5)).floor();
        if width.is_finite() && width > 0.0 {
            width
        } else {
            self.settings.fallback_width
        }
    }

    fn ensure_geometry(&mut self, ctx: &LayoutContext<'_>) {
        if self.geometry.is_none() {
            let thumb_width = self.thumb_width(ctx.viewport);
            let geometry = GridGeometry::compute(
                ctx.document,
                thumb_width,
                self.settings.padding,
                ctx.viewport.width,
            );
            debug!(
                rows = geometry.row_count(),
                thumb_width, "thumbnail grid laid out"
            );
            self.geometry = Some(geometry);
        }
    }

    fn load_row(&mut self, row: usize, ctx: &mut LayoutContext<'_>) {
        let Some(geometry) = self.geometry.as_ref() else {
            return;
        };
        let Some(grid_row) = geometry.rows.get(row) else {
            return;
        };
        for cell in &grid_row.cells {
            let resource = ctx.cache.resource(cell.start as isize, cell.reduction);
            if !resource.is_resolved() {
                ctx.cache.watch(
                    CacheKey::new(cell.start, cell.reduction),
                    Watcher::Thumbnail {
                        row,
                        index: cell.start,
                    },
                );
            }
        }
        if let Some(state) = self.displayed.get_mut(&row) {
            state.loaded = true;
        }
    }

    fn set_columns(&mut self, columns: u32) -> bool {
        let columns = columns.clamp(MIN_THUMBNAIL_COLUMNS, MAX_THUMBNAIL_COLUMNS);
        if columns == self.columns {
            return false;
        }
        self.columns = columns;
        self.invalidate();
        true
    }
}

impl ModeLayout for ThumbnailGridLayout {
    fn prepare(&mut self, mut state: ViewportState, ctx: &mut LayoutContext<'_>) -> ViewportState {
        self.invalidate();
        let factor = self.reduction_table(&state, ctx).quantize(state.page_scale);
        state.reduction = factor.ratio;
        state.autofit = None;
        state
    }

    fn reduction_table(&self, _state: &ViewportState, ctx: &LayoutContext<'_>) -> ReductionTable {
        ctx.base_table.clone()
    }

    fn jump_to_index(
        &mut self,
        mut state: ViewportState,
        index: usize,
        ctx: &mut LayoutContext<'_>,
    ) -> ViewportState {
        self.ensure_geometry(ctx);
        if let Some(geometry) = self.geometry.as_ref() {
            if let Some(row) = geometry.row_of(index) {
                let top = geometry.rows[row].top - geometry.padding;
                state.scroll.top =
                    clamp_scroll(top, geometry.content_height, ctx.viewport.height);
            }
        }
        state.current_index = index;
        state
    }

    fn render(
        &mut self,
        mut state: ViewportState,
        _cause: RedrawCause,
        ctx: &mut LayoutContext<'_>,
    ) -> (ViewportState, RenderPlan) {
        self.ensure_geometry(ctx);
        let mut placements = Vec::new();
        let mut content_height = 0.0;
        let mut to_load = Vec::new();

        if let Some(geometry) = self.geometry.as_ref() {
            content_height = geometry.content_height;
            state.scroll.top = clamp_scroll(state.scroll.top, content_height, ctx.viewport.height);
            let top = state.scroll.top;
            let visible = geometry.visible_rows(top, top + ctx.viewport.height);
            let padded = visible
                .as_ref()
                .map(|rows| geometry.padded_rows(rows, self.settings.row_buffer));

            let keep = |row: &usize| padded.as_ref().is_some_and(|p| p.contains(row));
            self.displayed.retain(|row, _| keep(row));
            self.lazy.retain(|row| keep(row));

            if let Some(padded) = padded.clone() {
                for row in padded {
                    if self.displayed.contains_key(&row) {
                        continue;
                    }
                    let ready = geometry.rows[row]
                        .cells
                        .iter()
                        .all(|cell| ctx.cache.is_resolved(cell.start as isize, cell.reduction));
                    self.displayed.insert(row, RowState { loaded: ready });
                    if !ready {
                        to_load.push(row);
                    }
                }
            }

            if let Some(visible) = visible {
                let least = geometry.rows[*visible.start()].first_index();
                let last_row = &geometry.rows[*visible.end()];
                let most = last_row.cells.last().map_or(least, |cell| cell.start);
                if state.current_index < least {
                    state.current_index = least;
                } else if state.current_index > last_row.last_index() {
                    state.current_index = most;
                }
            }

            for (&row, row_state) in &self.displayed {
                for (position, cell) in geometry.rows[row].cells.iter().enumerate() {
                    let resource = if row_state.loaded {
                        ctx.cache.resource(cell.start as isize, cell.reduction)
                    } else {
                        ctx.cache
                            .resolved(cell.start as isize, cell.reduction)
                            .unwrap_or(Resource::Blank)
                    };
                    placements.push(Placement {
                        slot: cell.slot(),
                        rect: geometry.cell_rect(row, position).unwrap_or_default(),
                        resource,
                        highlighted: cell.contains(state.current_index),
                        srcset: Vec::new(),
                    });
                }
            }
        }

        let delay = self.settings.lazy_load_delay;
        for row in to_load {
            self.lazy.schedule(ctx.now + delay, row);
        }

        let plan = RenderPlan {
            mode: ViewMode::ThumbnailGrid,
            current_index: state.current_index,
            reduction: state.reduction,
            content_width: ctx.viewport.width,
            content_height,
            scroll: state.scroll,
            placements,
            flip: None,
            staged: Vec::new(),
        };
        (state, plan)
    }

    fn zoom(
        &mut self,
        state: ViewportState,
        direction: ZoomDirection,
        ctx: &mut LayoutContext<'_>,
    ) -> ViewportState {
        let columns = match direction {
            ZoomDirection::In => self.columns.saturating_sub(1),
            ZoomDirection::Out => self.columns + 1,
            ZoomDirection::Auto | ZoomDirection::Height | ZoomDirection::Width => {
                self.settings.columns
            }
        };
        if self.set_columns(columns) {
            self.jump_to_index(state, state.current_index, ctx)
        } else {
            state
        }
    }

    fn resource_ready(&mut self, watcher: Watcher) -> bool {
        match watcher {
            Watcher::Thumbnail { row, .. } => self.displayed.contains_key(&row),
            Watcher::Page { .. } | Watcher::Staged { .. } => false,
        }
    }

    fn tick(&mut self, _state: &mut ViewportState, ctx: &mut LayoutContext<'_>) -> TickOutcome {
        let due = self.lazy.drain_due(ctx.now);
        let mut redraw = false;
        for row in due {
            if self.displayed.contains_key(&row) {
                self.load_row(row, ctx);
                redraw = true;
            }
        }
        TickOutcome {
            redraw,
            page_changes: Vec::new(),
        }
    }

    fn invalidate(&mut self) {
        self.geometry = None;
        self.displayed.clear();
        self.lazy.clear();
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.lazy.next_due()
    }
}
