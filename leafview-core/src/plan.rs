use serde::Serialize;

use crate::cache::{Resource, SrcsetEntry};
use crate::geometry::{Rect, ScrollPosition};
use crate::spread::FlipDirection;
use crate::viewport::ViewMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Slot {
    Page { index: usize },
    UnviewableRun { start: usize, end: usize },
    Blank { index: isize },
}

impl Slot {
    pub fn first_index(&self) -> Option<usize> {
        match self {
            Slot::Page { index } => Some(*index),
            Slot::UnviewableRun { start, .. } => Some(*start),
            Slot::Blank { .. } => None,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        match self {
            Slot::Page { index: own } => *own == index,
            Slot::UnviewableRun { start, end } => (*start..=*end).contains(&index),
            Slot::Blank { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub slot: Slot,
    pub rect: Rect,
    pub resource: Resource,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub highlighted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub srcset: Vec<SrcsetEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlipProgress {
    pub direction: FlipDirection,
    pub from: [isize; 2],
    pub to: [isize; 2],
    pub progress: f32,
}

/// Everything the UI layer needs to paint one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderPlan {
    pub mode: ViewMode,
    pub current_index: usize,
    pub reduction: f32,
    pub content_width: f32,
    pub content_height: f32,
    pub scroll: ScrollPosition,
    pub placements: Vec<Placement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flip: Option<FlipProgress>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub staged: Vec<usize>,
}

impl RenderPlan {
    pub fn visible_indices(&self) -> Vec<usize> {
        self.placements
            .iter()
            .filter_map(|placement| placement.slot.first_index())
            .collect()
    }

    pub fn placement_for(&self, index: usize) -> Option<&Placement> {
        self.placements
            .iter()
            .find(|placement| placement.slot.contains(index))
    }
}
