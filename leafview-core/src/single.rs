use crate::cache::{CacheKey, Watcher};
use crate::document::{Document, PageItem, TraversalOptions};
use crate::geometry::{clamp_scroll, overlaps_band, Rect, ViewportSize};
use crate::layout::{LayoutContext, ModeLayout, RedrawCause};
use crate::plan::{Placement, RenderPlan, Slot};
use crate::reduction::{single_page_table, AutofitClass, ReductionTable, ZoomDirection};
use crate::viewport::{ViewMode, ViewportState};

#[derive(Debug, Clone, PartialEq)]
struct ItemGeometry {
    start: usize,
    end: usize,
    run: bool,
    top: f32,
    width: f32,
    height: f32,
}

impl ItemGeometry {
    fn bottom(&self) -> f32 {
        self.top + self.height
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
struct Column {
    reduce_milli: u32,
    viewport_width: u32,
    content_width: f32,
    content_height: f32,
    items: Vec<ItemGeometry>,
}

impl Column {
    fn build(document: &Document, reduction: f32, padding: f32, viewport: ViewportSize) -> Self {
        let mut items = Vec::new();
        let mut top = padding;
        let mut widest = 0.0f32;
        for item in document.pages_iter(TraversalOptions::combined()) {
            let page = item.page();
            let width = (page.width as f32 / reduction).floor();
            let height = (page.height as f32 / reduction).floor();
            items.push(ItemGeometry {
                start: item.start(),
                end: item.end(),
                run: matches!(item, PageItem::UnviewableRun { .. }),
                top,
                width,
                height,
            });
            top += height + padding;
            widest = widest.max(width);
        }
        Self {
            reduce_milli: (reduction * 1000.0).round() as u32,
            viewport_width: viewport.width.round() as u32,
            content_width: viewport.width.max(widest + 2.0 * padding),
            content_height: top,
            items,
        }
    }

    fn matches(&self, reduction: f32, viewport: ViewportSize) -> bool {
        self.reduce_milli == (reduction * 1000.0).round() as u32
            && self.viewport_width == viewport.width.round() as u32
    }

    fn item_position(&self, index: usize) -> Option<usize> {
        let position = self.items.partition_point(|item| item.end < index);
        (position < self.items.len() && self.items[position].start <= index).then_some(position)
    }

    fn rect(&self, item: &ItemGeometry) -> Rect {
        Rect::new(
            ((self.content_width - item.width) / 2.0).floor(),
            item.top,
            item.width,
            item.height,
        )
    }
}

/// Continuous vertical column of pages, one per row.
pub struct SinglePageLayout {
    autofit: Option<AutofitClass>,
    column: Option<Column>,
    displayed: Vec<usize>,
}

impl Default for SinglePageLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl SinglePageLayout {
    pub fn new() -> Self {
        Self {
            autofit: Some(AutofitClass::Height),
            column: None,
            displayed: Vec::new(),
        }
    }

    pub fn autofit(&self) -> Option<AutofitClass> {
        self.autofit
    }

    fn ensure_column(&mut self, reduction: f32, ctx: &LayoutContext<'_>) -> &Column {
        if !matches!(&self.column, Some(column) if column.matches(reduction, ctx.viewport)) {
            self.column = None;
        }
        self.column.get_or_insert_with(|| {
            Column::build(ctx.document, reduction, ctx.config.padding, ctx.viewport)
        })
    }

    /// Ratio at which a whole median page fits the viewport height.
    pub fn fit_height_ratio(&self, state: &ViewportState, ctx: &LayoutContext<'_>) -> f32 {
        self.reduction_table(state, ctx)
            .next(state.reduction, ZoomDirection::Height)
            .ratio
    }

    /// Displayed height of the item holding `index`.
    pub fn item_height(&mut self, state: &ViewportState, ctx: &LayoutContext<'_>) -> f32 {
        let column = self.ensure_column(state.reduction, ctx);
        column
            .item_position(state.current_index)
            .map_or(0.0, |position| column.items[position].height)
    }
}

impl ModeLayout for SinglePageLayout {
    fn prepare(&mut self, mut state: ViewportState, ctx: &mut LayoutContext<'_>) -> ViewportState {
        let factor = self
            .reduction_table(&state, ctx)
            .resolve(state.page_scale, self.autofit);
        state.reduction = factor.ratio;
        state.autofit = self.autofit;
        self.invalidate();
        state
    }

    fn reduction_table(&self, _state: &ViewportState, ctx: &LayoutContext<'_>) -> ReductionTable {
        single_page_table(
            ctx.base_table,
            ctx.document.median_page_size(),
            ctx.viewport,
            ctx.config.padding,
        )
    }

    fn jump_to_index(
        &mut self,
        mut state: ViewportState,
        index: usize,
        ctx: &mut LayoutContext<'_>,
    ) -> ViewportState {
        let padding = ctx.config.padding;
        let viewport_height = ctx.viewport.height;
        let column = self.ensure_column(state.reduction, ctx);
        if let Some(position) = column.item_position(index) {
            let top = column.items[position].top - padding / 2.0;
            state.scroll.top = clamp_scroll(top, column.content_height, viewport_height);
        }
        state.current_index = index;
        state
    }

    fn render(
        &mut self,
        mut state: ViewportState,
        cause: RedrawCause,
        ctx: &mut LayoutContext<'_>,
    ) -> (ViewportState, RenderPlan) {
        let column = self.ensure_column(state.reduction, ctx).clone();
        state.scroll.top = clamp_scroll(state.scroll.top, column.content_height, ctx.viewport.height);
        let band_top = state.scroll.top;
        let band_bottom = band_top + ctx.viewport.height;

        let mut positions: Vec<usize> = column
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| overlaps_band(item.top, item.bottom(), band_top, band_bottom))
            .map(|(position, _)| position)
            .collect();

        if cause == RedrawCause::Scroll {
            if let Some(first) = positions.first() {
                state.current_index = column.items[*first].start;
            }
        }

        if state.reduction > 1.0 {
            if let (Some(&first), Some(&last)) = (positions.first(), positions.last()) {
                if first > 0 {
                    positions.insert(0, first - 1);
                }
                if last + 1 < column.items.len() {
                    positions.push(last + 1);
                }
            }
        }

        let mut placements = Vec::with_capacity(positions.len());
        self.displayed.clear();
        for position in positions {
            let item = &column.items[position];
            let resource = ctx.cache.resource(item.start as isize, state.reduction);
            if !resource.is_resolved() {
                ctx.cache.watch(
                    CacheKey::new(item.start, state.reduction),
                    Watcher::Page { index: item.start },
                );
            }
            let srcset = if item.run {
                Vec::new()
            } else {
                ctx.cache.srcset(item.start, state.reduction)
            };
            self.displayed.push(item.start);
            placements.push(Placement {
                slot: item.slot(),
                rect: column.rect(item),
                resource,
                highlighted: item.start <= state.current_index && state.current_index <= item.end,
                srcset,
            });
        }

        let plan = RenderPlan {
            mode: ViewMode::SinglePage,
            current_index: state.current_index,
            reduction: state.reduction,
            content_width: column.content_width,
            content_height: column.content_height,
            scroll: state.scroll,
            placements,
            flip: None,
            staged: Vec::new(),
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
        let index = state.current_index;
        self.jump_to_index(state, index, ctx)
    }

    fn resource_ready(&mut self, watcher: Watcher) -> bool {
        match watcher {
            Watcher::Page { index } => self.displayed.contains(&index),
            Watcher::Thumbnail { .. } | Watcher::Staged { .. } => false,
        }
    }

    fn invalidate(&mut self) {
        self.column = None;
        self.displayed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{FakeLoader, RecordingFetcher};
    use crate::cache::{ImageCache, Resource};
    use crate::config::ViewerConfig;
    use crate::document::tests::{document_with_unviewables, uniform_document};
    use crate::geometry::ScrollPosition;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        document: Document,
        cache: ImageCache,
        config: ViewerConfig,
        base: ReductionTable,
    }

    impl Fixture {
        fn new(document: Document, shared: Document) -> Self {
            let config = ViewerConfig::default();
            let base = config.base_table().unwrap();
            Self {
                document,
                cache: ImageCache::new(
                    Arc::new(shared),
                    Arc::new(FakeLoader),
                    Box::new(RecordingFetcher::default()),
                ),
                config,
                base,
            }
        }

        fn ctx(&mut self) -> LayoutContext<'_> {
            LayoutContext {
                document: &self.document,
                cache: &mut self.cache,
                config: &self.config,
                base_table: &self.base,
                viewport: ViewportSize::new(880.0, 620.0),
                now: Duration::ZERO,
            }
        }
    }

    fn state() -> ViewportState {
        ViewportState {
            mode: ViewMode::SinglePage,
            current_index: 0,
            reduction: 1.0,
            page_scale: 1.0,
            scroll: ScrollPosition::default(),
            autofit: None,
        }
    }

    #[test]
    fn prepare_applies_fit_to_height() {
        let mut fixture = Fixture::new(uniform_document(10), uniform_document(10));
        let mut layout = SinglePageLayout::new();
        let mut ctx = fixture.ctx();
        let prepared = layout.prepare(state(), &mut ctx);
        assert_eq!(prepared.reduction, 2.0);
        assert_eq!(prepared.autofit, Some(AutofitClass::Height));
    }

    #[test]
    fn jump_places_page_at_top_and_renders_it() {
        let mut fixture = Fixture::new(uniform_document(10), uniform_document(10));
        let mut layout = SinglePageLayout::new();
        let mut ctx = fixture.ctx();
        let prepared = layout.prepare(state(), &mut ctx);
        let jumped = layout.jump_to_index(prepared, 4, &mut ctx);
        // pages are 600 high at 2x with 10px gaps
        assert_eq!(jumped.scroll.top, 10.0 + 4.0 * 610.0 - 5.0);
        let (after, plan) = layout.render(jumped, RedrawCause::Navigation, &mut ctx);
        assert_eq!(after.current_index, 4);
        let visible = plan.visible_indices();
        assert!(visible.contains(&4));
        assert_eq!(visible, vec![3, 4, 5, 6]);
        assert!(plan.placement_for(4).unwrap().highlighted);
        assert!(matches!(
            plan.placement_for(4).unwrap().resource,
            Resource::Pending { .. }
        ));
        assert_eq!(plan.placement_for(4).unwrap().rect.x, 240.0);
    }

    #[test]
    fn scrolling_updates_current_page_to_first_visible() {
        let mut fixture = Fixture::new(uniform_document(10), uniform_document(10));
        let mut layout = SinglePageLayout::new();
        let mut ctx = fixture.ctx();
        let mut current = layout.prepare(state(), &mut ctx);
        current.scroll.top = 1900.0;
        let (after, _) = layout.render(current, RedrawCause::Scroll, &mut ctx);
        assert_eq!(after.current_index, 3);
        assert!(layout.resource_ready(Watcher::Page { index: 3 }));
        assert!(!layout.resource_ready(Watcher::Page { index: 9 }));
    }

    #[test]
    fn unviewable_runs_occupy_one_slot() {
        let doc = document_with_unviewables(10, &[1, 2, 3]);
        let shared = document_with_unviewables(10, &[1, 2, 3]);
        let mut fixture = Fixture::new(doc, shared);
        let mut layout = SinglePageLayout::new();
        let mut ctx = fixture.ctx();
        let prepared = layout.prepare(state(), &mut ctx);
        let (_, plan) = layout.render(prepared, RedrawCause::Navigation, &mut ctx);
        assert_eq!(
            plan.placements[1].slot,
            Slot::UnviewableRun { start: 1, end: 3 }
        );
        assert!(plan.placements[1].srcset.is_empty());
        assert_eq!(plan.placement_for(2).unwrap().slot.first_index(), Some(1));
    }

    #[test]
    fn zoom_walks_the_table_and_tracks_autofit() {
        let mut fixture = Fixture::new(uniform_document(10), uniform_document(10));
        let mut layout = SinglePageLayout::new();
        let mut ctx = fixture.ctx();
        let prepared = layout.prepare(state(), &mut ctx);
        let zoomed_in = layout.zoom(prepared, ZoomDirection::In, &mut ctx);
        assert_eq!(zoomed_in.reduction, 1.0);
        let zoomed_out = layout.zoom(zoomed_in, ZoomDirection::Out, &mut ctx);
        assert_eq!(zoomed_out.reduction, 2.0);
        assert_eq!(zoomed_out.autofit, None);
        assert_eq!(layout.autofit(), None);
        let fitted = layout.zoom(zoomed_out, ZoomDirection::Width, &mut ctx);
        assert_eq!(fitted.autofit, Some(AutofitClass::Width));
        assert_eq!(fitted.reduction, 1.0);
        assert_eq!(fitted.page_scale, 1.0);
    }
}
