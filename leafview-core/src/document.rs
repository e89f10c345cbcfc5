use std::iter::FusedIterator;
use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::DocumentError;
use crate::{document_id_for_path, document_id_for_title, DocumentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageProgression {
    #[default]
    #[serde(rename = "lr")]
    LeftToRight,
    #[serde(rename = "rl")]
    RightToLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageSide {
    Left,
    Right,
    Unknown,
}

impl PageSide {
    fn from_label(label: &str) -> Self {
        match label.trim() {
            "L" | "l" => PageSide::Left,
            "R" | "r" => PageSide::Right,
            _ => PageSide::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
enum LabelValue {
    Text(String),
    Number(i64),
}

impl LabelValue {
    fn into_label(self) -> String {
        match self {
            LabelValue::Text(text) => text,
            LabelValue::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PageSpec {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    page_num: Option<LabelValue>,
    #[serde(default)]
    pub leaf_num: Option<usize>,
    #[serde(default = "default_true")]
    pub viewable: bool,
    #[serde(default)]
    pub side: Option<String>,
}

impl PageSpec {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            uri: None,
            page_num: None,
            leaf_num: None,
            viewable: true,
            side: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.page_num = Some(LabelValue::Text(label.into()));
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn unviewable(mut self) -> Self {
        self.viewable = false;
        self
    }
}

fn default_true() -> bool {
    true
}

/// Externally supplied description of a document, usually read from JSON.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub page_progression: PageProgression,
    #[serde(default = "default_true")]
    pub cover_first: bool,
    #[serde(default)]
    pub title_leaf: Option<usize>,
    pub pages: Vec<PageSpec>,
}

impl Manifest {
    pub fn new(pages: Vec<PageSpec>) -> Self {
        Self {
            title: None,
            page_progression: PageProgression::LeftToRight,
            cover_first: true,
            title_leaf: None,
            pages,
        }
    }

    pub fn from_json(input: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(input)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub side: PageSide,
    pub is_viewable: bool,
    pub unviewable_run_start: usize,
    pub label: String,
    pub leaf_num: Option<usize>,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalOptions {
    pub combine_consecutive_unviewables: bool,
}

impl TraversalOptions {
    pub fn combined() -> Self {
        Self {
            combine_consecutive_unviewables: true,
        }
    }
}

/// One entry of a document traversal: a single page, or a collapsed run of
/// consecutive unviewable pages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PageItem<'a> {
    Page(&'a Page),
    UnviewableRun { start: &'a Page, end: usize },
}

impl<'a> PageItem<'a> {
    pub fn page(&self) -> &'a Page {
        match self {
            PageItem::Page(page) => page,
            PageItem::UnviewableRun { start, .. } => start,
        }
    }

    pub fn start(&self) -> usize {
        self.page().index
    }

    pub fn end(&self) -> usize {
        match self {
            PageItem::Page(page) => page.index,
            PageItem::UnviewableRun { end, .. } => *end,
        }
    }

    pub fn len(&self) -> usize {
        self.end() - self.start() + 1
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start() <= index && index <= self.end()
    }
}

pub struct PageItems<'a> {
    document: &'a Document,
    next: usize,
    combine: bool,
}

impl<'a> Iterator for PageItems<'a> {
    type Item = PageItem<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = self.document.pages.get(self.next)?;
        if self.combine && !page.is_viewable {
            let end = self.document.run_end(page.index);
            self.next = end + 1;
            return Some(PageItem::UnviewableRun { start: page, end });
        }
        self.next += 1;
        Some(PageItem::Page(page))
    }
}

impl FusedIterator for PageItems<'_> {}

pub struct Document {
    id: DocumentId,
    title: Option<String>,
    progression: PageProgression,
    cover_first: bool,
    title_leaf: Option<usize>,
    pages: Vec<Page>,
    median: OnceCell<PageSize>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("progression", &self.progression)
            .field("pages", &self.pages.len())
            .finish()
    }
}

impl Document {
    pub fn from_manifest(manifest: Manifest) -> Result<Self, DocumentError> {
        if manifest.pages.is_empty() {
            return Err(DocumentError::Empty);
        }

        let progression = manifest.page_progression;
        let cover_first = manifest.cover_first;
        let mut pages: Vec<Page> = Vec::with_capacity(manifest.pages.len());
        let mut run_start = 0;

        for (index, spec) in manifest.pages.into_iter().enumerate() {
            if spec.width == 0 || spec.height == 0 {
                return Err(DocumentError::ZeroSizedPage {
                    index,
                    width: spec.width,
                    height: spec.height,
                });
            }

            if spec.viewable {
                run_start = index;
            } else if index == 0 || pages[index - 1].is_viewable {
                run_start = index;
            }

            let side = match spec.side.as_deref() {
                Some(label) => PageSide::from_label(label),
                None => derived_side(index as isize, progression, cover_first),
            };

            pages.push(Page {
                index,
                width: spec.width,
                height: spec.height,
                side,
                is_viewable: spec.viewable,
                unviewable_run_start: run_start,
                label: spec
                    .page_num
                    .map(LabelValue::into_label)
                    .unwrap_or_else(|| format!("n{index}")),
                leaf_num: spec.leaf_num,
                uri: spec.uri,
            });
        }

        let id = document_id_for_title(manifest.title.as_deref().unwrap_or("untitled"));
        Ok(Self {
            id,
            title: manifest.title,
            progression,
            cover_first,
            title_leaf: manifest.title_leaf,
            pages,
            median: OnceCell::new(),
        })
    }

    pub fn with_source(mut self, path: &Path) -> Self {
        self.id = document_id_for_path(path);
        self
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn progression(&self) -> PageProgression {
        self.progression
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page_at(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    pub fn page_at_signed(&self, index: isize) -> Option<&Page> {
        usize::try_from(index).ok().and_then(|i| self.pages.get(i))
    }

    pub fn last_index(&self) -> usize {
        self.pages.len().saturating_sub(1)
    }

    /// Side of the page at `index`; positions outside the document (the
    /// blank facing pages of a spread) follow the parity rule.
    pub fn side_of(&self, index: isize) -> PageSide {
        match self.page_at_signed(index) {
            Some(page) if page.side != PageSide::Unknown => page.side,
            _ => derived_side(index, self.progression, self.cover_first),
        }
    }

    /// Resolves an external label. Exact label matches win; `n<digits>` is
    /// accepted as a raw index.
    pub fn parse_page_label(&self, label: &str) -> Option<usize> {
        if let Some(page) = self.pages.iter().find(|page| page.label == label) {
            return Some(page.index);
        }
        let digits = label.strip_prefix('n')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let index: usize = digits.parse().ok()?;
        (index < self.pages.len()).then_some(index)
    }

    pub fn leaf_num_to_index(&self, leaf_num: usize) -> usize {
        self.pages
            .iter()
            .position(|page| page.leaf_num == Some(leaf_num))
            .unwrap_or(leaf_num)
    }

    pub fn initial_index(&self) -> usize {
        match self.title_leaf {
            Some(leaf) if self.pages.len() > 2 => {
                self.leaf_num_to_index(leaf).min(self.last_index())
            }
            _ => 0,
        }
    }

    pub fn pages_iter(&self, options: TraversalOptions) -> PageItems<'_> {
        self.pages_iter_from(0, options)
    }

    /// Traversal starting at `index`. When combining and `index` falls inside
    /// an unviewable run, the traversal restarts at the run's first page so
    /// the run is still emitted whole.
    pub fn pages_iter_from(&self, index: usize, options: TraversalOptions) -> PageItems<'_> {
        let combine = options.combine_consecutive_unviewables;
        let next = match self.pages.get(index) {
            Some(page) if combine && !page.is_viewable => page.unviewable_run_start,
            _ => index,
        };
        PageItems {
            document: self,
            next,
            combine,
        }
    }

    /// The traversal item that contains `index`.
    pub fn item_at(&self, index: usize, options: TraversalOptions) -> Option<PageItem<'_>> {
        self.pages_iter_from(index, options).next()
    }

    pub fn run_end(&self, index: usize) -> usize {
        let mut end = index;
        while end + 1 < self.pages.len() && !self.pages[end + 1].is_viewable {
            end += 1;
        }
        end
    }

    /// First index of the item following the one containing `index`.
    pub fn next_item_index(&self, index: usize, options: TraversalOptions) -> Option<usize> {
        let item = self.item_at(index, options)?;
        let next = item.end() + 1;
        (next < self.pages.len()).then_some(next)
    }

    /// First index of the item preceding the one containing `index`.
    pub fn prev_item_index(&self, index: usize, options: TraversalOptions) -> Option<usize> {
        let item = self.item_at(index, options)?;
        let prev = item.start().checked_sub(1)?;
        let page = &self.pages[prev];
        if options.combine_consecutive_unviewables && !page.is_viewable {
            Some(page.unviewable_run_start)
        } else {
            Some(prev)
        }
    }

    /// Nearest viewable page at or beyond `index` in the given direction.
    pub fn find_viewable(&self, index: usize, direction: Direction) -> Option<usize> {
        match direction {
            Direction::Forward => self
                .pages
                .iter()
                .skip(index)
                .find(|page| page.is_viewable)
                .map(|page| page.index),
            Direction::Backward => self
                .pages
                .iter()
                .take(index.saturating_add(1))
                .rev()
                .find(|page| page.is_viewable)
                .map(|page| page.index),
        }
    }

    /// Indices `[left, right]` of the spread containing `pivot`. A missing
    /// facing page is reported as an index outside `0..len`.
    pub fn spread_indices(&self, pivot: isize) -> [isize; 2] {
        let side = self.side_of(pivot);
        match self.progression {
            PageProgression::LeftToRight => {
                if side == PageSide::Left {
                    [pivot, pivot + 1]
                } else {
                    [pivot - 1, pivot]
                }
            }
            PageProgression::RightToLeft => {
                if side == PageSide::Right {
                    [pivot + 1, pivot]
                } else {
                    [pivot, pivot - 1]
                }
            }
        }
    }

    /// Lowest and highest index a spread may be anchored on, including the
    /// blank facing pages before the first and after the last page.
    pub fn spread_bounds(&self) -> (isize, isize) {
        let last = self.last_index() as isize;
        let (lead, tail) = match self.progression {
            PageProgression::LeftToRight => (PageSide::Left, PageSide::Right),
            PageProgression::RightToLeft => (PageSide::Right, PageSide::Left),
        };
        let first = if self.side_of(0) == lead { 0 } else { -1 };
        let last = if self.side_of(last) == tail {
            last
        } else {
            last + 1
        };
        (first, last)
    }

    pub fn median_page_size(&self) -> PageSize {
        *self.median.get_or_init(|| {
            let mut widths: Vec<u32> = self.pages.iter().map(|page| page.width).collect();
            let mut heights: Vec<u32> = self.pages.iter().map(|page| page.height).collect();
            widths.sort_unstable();
            heights.sort_unstable();
            let mid = self.pages.len() / 2;
            PageSize {
                width: widths.get(mid).copied().unwrap_or(1) as f32,
                height: heights.get(mid).copied().unwrap_or(1) as f32,
            }
        })
    }
}

fn derived_side(position: isize, progression: PageProgression, cover_first: bool) -> PageSide {
    let recto = (position.rem_euclid(2) == 0) == cover_first;
    match (progression, recto) {
        (PageProgression::LeftToRight, true) => PageSide::Right,
        (PageProgression::LeftToRight, false) => PageSide::Left,
        (PageProgression::RightToLeft, true) => PageSide::Left,
        (PageProgression::RightToLeft, false) => PageSide::Right,
    }
}
