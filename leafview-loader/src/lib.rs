use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use leafview_core::{
    Document, DocumentProvider, FetchCompletion, FetchOutcome, FetchRequest, Fetcher, Manifest,
    OpenedDocument, Page, PageSpec, ResourceLoader, BLANK_URI,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

const PLACEHOLDERS: [&str; 5] = ["{index}", "{reduce}", "{rotate}", "{uri}", "{label}"];
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("uri template `{0}` has no placeholder")]
    Template(String),
    #[error("{0:?} contains no readable images")]
    EmptyDirectory(PathBuf),
    #[error("unsupported uri scheme in `{0}`")]
    UnsupportedScheme(String),
}

/// Builds page image URIs from a template such as
/// `scans/{index}.png?reduce={reduce}&rotate={rotate}`.
#[derive(Debug, Clone)]
pub struct TemplateLoader {
    template: String,
    base: Option<PathBuf>,
}

impl TemplateLoader {
    pub fn new(template: impl Into<String>) -> Result<Self, LoaderError> {
        let template = template.into();
        if !PLACEHOLDERS.iter().any(|p| template.contains(p)) {
            return Err(LoaderError::Template(template));
        }
        Ok(Self {
            template,
            base: None,
        })
    }

    /// Uses each page's own URI unchanged.
    pub fn page_uris() -> Self {
        Self {
            template: "{uri}".to_owned(),
            base: None,
        }
    }

    /// Relative page URIs resolve against `base`.
    pub fn with_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    fn resolve_page_uri(&self, page: &Page) -> String {
        let Some(uri) = page.uri.as_deref() else {
            return String::new();
        };
        match &self.base {
            Some(base) if !uri.contains("://") && Path::new(uri).is_relative() => {
                base.join(uri).to_string_lossy().into_owned()
            }
            _ => uri.to_owned(),
        }
    }
}

impl ResourceLoader for TemplateLoader {
    fn page_uri(&self, page: &Page, reduction: f32, rotation: u16) -> String {
        self.template
            .replace("{index}", &page.index.to_string())
            .replace("{reduce}", &reduction.to_string())
            .replace("{rotate}", &rotation.to_string())
            .replace("{label}", &page.label)
            .replace("{uri}", &self.resolve_page_uri(page))
    }
}

/// Opens JSON manifests.
#[derive(Debug, Clone, Default)]
pub struct ManifestProvider {
    template: Option<String>,
}

impl ManifestProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(template: impl Into<String>) -> Self {
        Self {
            template: Some(template.into()),
        }
    }
}

#[async_trait]
impl DocumentProvider for ManifestProvider {
    #[instrument(skip(self))]
    async fn open(&self, path: &Path) -> Result<OpenedDocument> {
        let owned = path.to_path_buf();
        let (manifest, source) = tokio::task::spawn_blocking(move || read_manifest(&owned))
            .await
            .context("manifest reader task failed")??;
        let document = Document::from_manifest(manifest)
            .with_context(|| format!("invalid manifest {:?}", source))?
            .with_source(&source);

        let loader = match &self.template {
            Some(template) => TemplateLoader::new(template.clone())?,
            None => TemplateLoader::page_uris(),
        };
        let loader = match source.parent() {
            Some(dir) => loader.with_base(dir),
            None => loader,
        };
        debug!(pages = document.len(), path = %source.display(), "manifest opened");
        Ok(OpenedDocument {
            document: Arc::new(document),
            loader: Arc::new(loader),
            source,
        })
    }
}

fn read_manifest(path: &Path) -> Result<(Manifest, PathBuf)> {
    let absolute = path
        .canonicalize()
        .with_context(|| format!("failed to resolve path for {:?}", path))?;
    let raw = fs::read_to_string(&absolute)
        .with_context(|| format!("failed to read manifest {:?}", absolute))?;
    let manifest = Manifest::from_json(&raw)
        .with_context(|| format!("failed to decode manifest {:?}", absolute))?;
    Ok((manifest, absolute))
}

/// Treats every image in a directory as one page, in file name order.
#[derive(Debug, Clone, Default)]
pub struct DirectoryProvider;

#[async_trait]
impl DocumentProvider for DirectoryProvider {
    #[instrument(skip(self))]
    async fn open(&self, path: &Path) -> Result<OpenedDocument> {
        let owned = path.to_path_buf();
        let (document, source) = tokio::task::spawn_blocking(move || scan_directory(&owned))
            .await
            .context("directory scan task failed")??;
        Ok(OpenedDocument {
            document: Arc::new(document),
            loader: Arc::new(TemplateLoader::page_uris()),
            source,
        })
    }
}

fn scan_directory(path: &Path) -> Result<(Document, PathBuf)> {
    let absolute = path
        .canonicalize()
        .with_context(|| format!("failed to resolve path for {:?}", path))?;
    let mut files = Vec::new();
    for entry in fs::read_dir(&absolute)
        .with_context(|| format!("failed to list directory {:?}", absolute))?
    {
        let entry = entry?;
        let file = entry.path();
        if file.is_file() && is_image(&file) {
            files.push(file);
        }
    }
    files.sort();

    let pages: Vec<PageSpec> = files
        .par_iter()
        .filter_map(|file| match image::image_dimensions(file) {
            Ok((width, height)) => {
                Some(PageSpec::new(width, height).with_uri(file.to_string_lossy()))
            }
            Err(err) => {
                warn!(?err, path = %file.display(), "skipping unreadable image");
                None
            }
        })
        .collect();
    if pages.is_empty() {
        return Err(LoaderError::EmptyDirectory(absolute).into());
    }

    let mut manifest = Manifest::new(pages);
    manifest.title = absolute
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    let document = Document::from_manifest(manifest)?.with_source(&absolute);
    Ok((document, absolute))
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Picks the provider for a path: directories are scanned, files are manifests.
pub async fn open_path(path: &Path) -> Result<OpenedDocument> {
    if path.is_dir() {
        DirectoryProvider.open(path).await
    } else {
        ManifestProvider::new().open(path).await
    }
}

/// Hands fetch requests to a background worker.
#[derive(Debug, Clone)]
pub struct ChannelFetcher {
    sender: mpsc::UnboundedSender<FetchRequest>,
    dropped: Arc<Mutex<usize>>,
}

impl ChannelFetcher {
    /// Requests that could not be delivered because the worker stopped.
    pub fn dropped(&self) -> usize {
        *self.dropped.lock()
    }
}

impl Fetcher for ChannelFetcher {
    fn fetch(&mut self, request: FetchRequest) {
        if let Err(err) = self.sender.send(request) {
            *self.dropped.lock() += 1;
            warn!(uri = %err.0.uri, "fetch worker stopped; request dropped");
        }
    }
}

/// Starts the fetch worker on the current tokio runtime. Each request is
/// probed on the blocking pool and its completion posted to the returned
/// receiver, in whatever order they finish.
pub fn spawn_fetch_worker() -> (ChannelFetcher, mpsc::UnboundedReceiver<FetchCompletion>) {
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<FetchRequest>();
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(request) = request_rx.recv().await {
            let completions = completion_tx.clone();
            tokio::spawn(async move {
                let uri = request.uri.clone();
                let outcome = match tokio::task::spawn_blocking(move || probe_uri(&uri)).await {
                    Ok(Ok(())) => FetchOutcome::Loaded,
                    Ok(Err(err)) => FetchOutcome::Failed(format!("{err:#}")),
                    Err(err) => FetchOutcome::Failed(err.to_string()),
                };
                if let FetchOutcome::Failed(reason) = &outcome {
                    debug!(uri = %request.uri, reason = %reason, "fetch failed");
                }
                let _ = completions.send(FetchCompletion { request, outcome });
            });
        }
    });

    let fetcher = ChannelFetcher {
        sender: request_tx,
        dropped: Arc::new(Mutex::new(0)),
    };
    (fetcher, completion_rx)
}

/// Checks that the image behind `uri` exists and decodes its header.
fn probe_uri(uri: &str) -> Result<()> {
    if uri == BLANK_URI || uri.starts_with("data:") {
        return Ok(());
    }
    let path = match uri.split_once("://") {
        Some(("file", rest)) => rest,
        Some(_) => return Err(LoaderError::UnsupportedScheme(uri.to_owned()).into()),
        None => uri,
    };
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(anyhow!("page has no image uri"));
    }
    image::image_dimensions(path).with_context(|| format!("failed to read image {:?}", path))?;
    Ok(())
}
