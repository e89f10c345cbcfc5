use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod cache;
pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod geometry;
pub mod layout;
pub mod params;
pub mod plan;
pub mod reduction;
pub mod single;
pub mod spread;
pub mod thumbnail;
pub mod timers;
pub mod viewport;

pub use cache::{
    CacheKey, FetchCompletion, FetchOutcome, FetchRequest, Fetcher, ImageCache, Resource,
    ResourceLoader, SrcsetEntry, Watcher, BLANK_URI,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SpreadConfig, ThumbnailConfig, ViewerConfig};
pub use document::{
    Direction, Document, Manifest, Page, PageItem, PageProgression, PageSide, PageSize, PageSpec,
    TraversalOptions,
};
pub use error::{ConfigError, DocumentError, ViewerError};
pub use events::{EventBus, Subscriber, ViewerEvent};
pub use geometry::{Rect, ScrollPosition, ViewportSize};
pub use params::ViewerParams;
pub use plan::{FlipProgress, Placement, RenderPlan, Slot};
pub use reduction::{AutofitClass, ReductionFactor, ReductionTable, ZoomDirection};
pub use spread::FlipDirection;
pub use viewport::{ViewMode, ViewportController, ViewportState};

pub type DocumentId = Uuid;

const DOCUMENT_NAMESPACE: Uuid = Uuid::from_u128(0x3f0c_9a1e_55d2_5b7e_a41c_6e2f_d80b_7c14);

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes())
}

/// Identity for documents built in memory, without a backing file.
pub fn document_id_for_title(title: &str) -> DocumentId {
    Uuid::new_v5(&DOCUMENT_NAMESPACE, format!("title:{title}").as_bytes())
}

/// A document together with the loader that knows where its images live.
#[derive(Clone)]
pub struct OpenedDocument {
    pub document: Arc<Document>,
    pub loader: Arc<dyn ResourceLoader>,
    pub source: PathBuf,
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<OpenedDocument>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoIndex { index: usize },
    GotoPage { label: String },
    FirstPage,
    LastPage,
    Left,
    Right,
    Leftmost,
    Rightmost,
    Zoom { direction: ZoomDirection },
    SwitchMode { mode: ViewMode },
    ScrollBy { delta: f32 },
    ScrollDown,
    ScrollUp,
    Resize { viewport: ViewportSize },
    ToggleFullscreen,
    ActivateThumbnail { index: usize },
    FinishAnimations,
    RetryFailed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{FakeLoader, RecordingFetcher};
    use crate::document::tests::uniform_document;

    use tempfile::tempdir;

    struct FakeProvider;

    #[async_trait::async_trait]
    impl DocumentProvider for FakeProvider {
        async fn open(&self, path: &Path) -> Result<OpenedDocument> {
            let document = uniform_document(100).with_source(path);
            Ok(OpenedDocument {
                document: Arc::new(document),
                loader: Arc::new(FakeLoader),
                source: path.to_path_buf(),
            })
        }
    }

    #[tokio::test]
    async fn opened_document_drives_a_controller() {
        let opened = FakeProvider
            .open(Path::new("/tmp/example.json"))
            .await
            .unwrap();
        assert_eq!(
            opened.document.id(),
            document_id_for_path(Path::new("/tmp/example.json"))
        );

        let mut controller = ViewportController::new(
            Arc::clone(&opened.document),
            ViewerConfig::default(),
            opened.loader.clone(),
            Box::new(RecordingFetcher::default()),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        controller.initialize(ViewportSize::default(), ViewMode::SinglePage);

        controller.apply(Command::NextPage { count: 10 }).unwrap();
        assert_eq!(controller.current_index(), 10);
        controller.apply(Command::PrevPage { count: 5 }).unwrap();
        assert_eq!(controller.current_index(), 5);
        controller.apply(Command::GotoIndex { index: 99 }).unwrap();
        assert_eq!(controller.current_index(), 99);
        controller.apply(Command::GotoIndex { index: 150 }).unwrap();
        assert_eq!(controller.current_index(), 99);
    }

    #[test]
    fn document_id_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("book.json");
        std::fs::write(&file_path, b"{}").unwrap();

        let first = document_id_for_path(&file_path);
        let second = document_id_for_path(&file_path);

        assert_eq!(first, second);
        assert_ne!(first, document_id_for_title("book"));
    }

    #[test]
    fn commands_deserialize_from_tagged_json() {
        let command: Command =
            serde_json::from_str(r#"{"command":"switch_mode","mode":"2up"}"#).unwrap();
        assert_eq!(
            command,
            Command::SwitchMode {
                mode: ViewMode::TwoPageSpread
            }
        );
        let command: Command =
            serde_json::from_str(r#"{"command":"zoom","direction":"in"}"#).unwrap();
        assert_eq!(
            command,
            Command::Zoom {
                direction: ZoomDirection::In
            }
        );
    }
}
