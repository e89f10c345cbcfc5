use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::document::{Document, Page};
use crate::reduction::{responsive_scales, ResponsiveCandidate};

/// 1x1 transparent GIF shown for spread sides outside the document.
pub const BLANK_URI: &str =
    "data:image/gif;base64,R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7";

/// Maps a page at a reduction to a loadable URI.
pub trait ResourceLoader: Send + Sync {
    fn page_uri(&self, page: &Page, reduction: f32, rotation: u16) -> String;

    fn responsive_candidates(&self, page: &Page, reduction: f32) -> Vec<SrcsetEntry> {
        responsive_scales(reduction)
            .into_iter()
            .map(|ResponsiveCandidate { reduction, density }| SrcsetEntry {
                uri: self.page_uri(page, reduction, 0),
                density,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SrcsetEntry {
    pub uri: String,
    pub density: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub key: CacheKey,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Loaded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchCompletion {
    pub request: FetchRequest,
    pub outcome: FetchOutcome,
}

/// Starts an asynchronous load. Completion is reported back to the cache as
/// a separate event.
pub trait Fetcher: Send {
    fn fetch(&mut self, request: FetchRequest);
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey {
    pub page_index: usize,
    reduce_milli: u32,
}

impl CacheKey {
    pub fn new(page_index: usize, reduction: f32) -> Self {
        Self {
            page_index,
            reduce_milli: quantize_scale(reduction),
        }
    }

    pub fn reduction(&self) -> f32 {
        self.reduce_milli as f32 / 1000.0
    }

    fn page_start(page_index: usize) -> Self {
        Self {
            page_index,
            reduce_milli: 0,
        }
    }

    fn page_end(page_index: usize) -> Self {
        Self {
            page_index,
            reduce_milli: u32::MAX,
        }
    }

    fn distance(&self, reference_page: usize) -> usize {
        self.page_index.abs_diff(reference_page)
    }
}

fn quantize_scale(scale: f32) -> u32 {
    let scaled = (scale * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resource {
    Resolved { uri: String, reduction: f32 },
    Pending { uri: String },
    Failed { uri: String, reason: String },
    Blank,
}

impl Resource {
    pub fn uri(&self) -> &str {
        match self {
            Resource::Resolved { uri, .. }
            | Resource::Pending { uri }
            | Resource::Failed { uri, .. } => uri,
            Resource::Blank => BLANK_URI,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Resource::Resolved { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub resource: Resource,
    pub last_touched: u64,
}

/// Interested party for a pending key, handed back on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Watcher {
    Page { index: usize },
    Thumbnail { row: usize, index: usize },
    Staged { index: usize },
}

pub struct ImageCache {
    document: Arc<Document>,
    loader: Arc<dyn ResourceLoader>,
    fetcher: Box<dyn Fetcher>,
    entries: BTreeMap<CacheKey, CacheEntry>,
    watchers: HashMap<CacheKey, Vec<Watcher>>,
    active_window: Option<RangeInclusive<isize>>,
    capacity: Option<usize>,
    ordinal: u64,
    fetches_issued: usize,
}

impl ImageCache {
    pub fn new(
        document: Arc<Document>,
        loader: Arc<dyn ResourceLoader>,
        fetcher: Box<dyn Fetcher>,
    ) -> Self {
        Self {
            document,
            loader,
            fetcher,
            entries: BTreeMap::new(),
            watchers: HashMap::new(),
            active_window: None,
            capacity: None,
            ordinal: 0,
            fetches_issued: 0,
        }
    }

    pub fn with_capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Handle for `index` at `reduction`. Misses start exactly one fetch;
    /// later calls for the same key return the existing entry.
    pub fn resource(&mut self, index: isize, reduction: f32) -> Resource {
        let document = Arc::clone(&self.document);
        let Some(page) = document.page_at_signed(index) else {
            return Resource::Blank;
        };
        let key = CacheKey::new(page.index, reduction);
        let ordinal = self.touch();

        let hit = self
            .finer_resolved_key(&key)
            .or_else(|| self.entries.contains_key(&key).then_some(key));
        if let Some(entry) = hit.and_then(|hit| self.entries.get_mut(&hit)) {
            entry.last_touched = ordinal;
            return entry.resource.clone();
        }

        let uri = self.loader.page_uri(page, key.reduction(), 0);
        debug!(page = key.page_index, reduction = key.reduction(), "cache miss");
        let resource = Resource::Pending { uri: uri.clone() };
        self.entries.insert(
            key,
            CacheEntry {
                key,
                resource: resource.clone(),
                last_touched: ordinal,
            },
        );
        self.fetches_issued += 1;
        self.fetcher.fetch(FetchRequest { key, uri });
        self.trim_to_capacity(page.index);
        resource
    }

    /// Resolved handle usable for the request, without fetching.
    pub fn resolved(&self, index: isize, reduction: f32) -> Option<Resource> {
        let page = self.document.page_at_signed(index)?;
        let key = CacheKey::new(page.index, reduction);
        self.finer_resolved_key(&key)
            .and_then(|finer| self.entries.get(&finer))
            .map(|entry| entry.resource.clone())
    }

    pub fn is_resolved(&self, index: isize, reduction: f32) -> bool {
        self.resolved(index, reduction).is_some()
    }

    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn watch(&mut self, key: CacheKey, watcher: Watcher) {
        let list = self.watchers.entry(key).or_default();
        if !list.contains(&watcher) {
            list.push(watcher);
        }
    }

    /// Applies a finished fetch and returns the watchers that asked for it.
    /// Results for keys evicted in the meantime are still cached.
    pub fn complete(&mut self, completion: FetchCompletion) -> Vec<Watcher> {
        let FetchCompletion { request, outcome } = completion;
        let key = request.key;
        let resource = match outcome {
            FetchOutcome::Loaded => Resource::Resolved {
                uri: request.uri,
                reduction: key.reduction(),
            },
            FetchOutcome::Failed(reason) => {
                warn!(page = key.page_index, reduction = key.reduction(), %reason, "fetch failed");
                Resource::Failed {
                    uri: request.uri,
                    reason,
                }
            }
        };
        let ordinal = self.touch();
        let entry = self.entries.entry(key).or_insert_with(|| CacheEntry {
            key,
            resource: Resource::Blank,
            last_touched: ordinal,
        });
        entry.resource = resource;
        self.watchers.remove(&key).unwrap_or_default()
    }

    /// Drops settled entries for pages outside `window` whose resolution is
    /// no better than `needed`. In-flight entries are kept until they settle.
    pub fn evict_outside(&mut self, window: RangeInclusive<isize>, needed: f32) -> Vec<CacheKey> {
        let needed_milli = quantize_scale(needed);
        let evicted: Vec<CacheKey> = self
            .entries
            .values()
            .filter(|entry| !window.contains(&(entry.key.page_index as isize)))
            .filter(|entry| entry.key.reduce_milli >= needed_milli)
            .filter(|entry| !matches!(entry.resource, Resource::Pending { .. }))
            .map(|entry| entry.key)
            .collect();
        for key in &evicted {
            self.entries.remove(key);
            self.watchers.remove(key);
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), ?window, needed, "evicted cache entries");
        }
        self.active_window = Some(window);
        evicted
    }

    /// Least recently touched settled entries go first, preferring those
    /// outside the active window and far from `reference_page`.
    pub fn trim_to_capacity(&mut self, reference_page: usize) {
        let Some(capacity) = self.capacity else {
            return;
        };
        if self.entries.len() <= capacity {
            return;
        }
        let window = self.active_window.clone();
        let mut candidates: Vec<&CacheEntry> = self
            .entries
            .values()
            .filter(|entry| !matches!(entry.resource, Resource::Pending { .. }))
            .collect();
        candidates.sort_by_key(|entry| {
            let inside = window
                .as_ref()
                .is_some_and(|w| w.contains(&(entry.key.page_index as isize)));
            (
                inside,
                entry.last_touched,
                std::cmp::Reverse(entry.key.distance(reference_page)),
            )
        });
        let excess = self.entries.len() - capacity;
        let stale: Vec<CacheKey> = candidates
            .into_iter()
            .take(excess)
            .map(|entry| entry.key)
            .collect();
        for key in stale {
            self.entries.remove(&key);
            self.watchers.remove(&key);
        }
    }

    /// Re-issues every failed fetch. Returns how many were retried.
    pub fn retry_failed(&mut self) -> usize {
        let failed: Vec<(CacheKey, String)> = self
            .entries
            .values()
            .filter_map(|entry| match &entry.resource {
                Resource::Failed { uri, .. } => Some((entry.key, uri.clone())),
                _ => None,
            })
            .collect();
        for (key, uri) in &failed {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.resource = Resource::Pending { uri: uri.clone() };
            }
            self.fetches_issued += 1;
            self.fetcher.fetch(FetchRequest {
                key: *key,
                uri: uri.clone(),
            });
        }
        failed.len()
    }

    pub fn srcset(&self, index: usize, reduction: f32) -> Vec<SrcsetEntry> {
        match self.document.page_at(index) {
            Some(page) => self.loader.responsive_candidates(page, reduction),
            None => Vec::new(),
        }
    }

    pub fn fetches_issued(&self) -> usize {
        self.fetches_issued
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_page(&self, index: usize) -> bool {
        self.entries
            .range(CacheKey::page_start(index)..=CacheKey::page_end(index))
            .next()
            .is_some()
    }

    /// Coarsest resolved entry for the same page that is at least as fine
    /// as `key`, including `key` itself.
    fn finer_resolved_key(&self, key: &CacheKey) -> Option<CacheKey> {
        self.entries
            .range(CacheKey::page_start(key.page_index)..=*key)
            .rev()
            .find(|(_, entry)| entry.resource.is_resolved())
            .map(|(candidate, _)| *candidate)
    }

    fn touch(&mut self) -> u64 {
        self.ordinal += 1;
        self.ordinal
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::document::tests::uniform_document;
    use parking_lot::Mutex;

    pub(crate) struct FakeLoader;

    impl ResourceLoader for FakeLoader {
        fn page_uri(&self, page: &Page, reduction: f32, rotation: u16) -> String {
            format!("mem://{}?reduce={}&rotate={}", page.index, reduction, rotation)
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct RecordingFetcher {
        pub requests: Arc<Mutex<Vec<FetchRequest>>>,
    }

    impl Fetcher for RecordingFetcher {
        fn fetch(&mut self, request: FetchRequest) {
            self.requests.lock().push(request);
        }
    }

    fn cache(pages: usize) -> (ImageCache, Arc<Mutex<Vec<FetchRequest>>>) {
        let fetcher = RecordingFetcher::default();
        let requests = Arc::clone(&fetcher.requests);
        let cache = ImageCache::new(
            Arc::new(uniform_document(pages)),
            Arc::new(FakeLoader),
            Box::new(fetcher),
        );
        (cache, requests)
    }

    fn settle(cache: &mut ImageCache, index: usize, reduction: f32) {
        let uri = format!("mem://{index}");
        cache.complete(FetchCompletion {
            request: FetchRequest {
                key: CacheKey::new(index, reduction),
                uri,
            },
            outcome: FetchOutcome::Loaded,
        });
    }

    #[test]
    fn repeated_requests_issue_one_fetch() {
        let (mut cache, requests) = cache(30);
        let first = cache.resource(5, 2.0);
        let second = cache.resource(5, 2.0);
        assert_eq!(first, second);
        assert!(matches!(first, Resource::Pending { .. }));
        assert_eq!(requests.lock().len(), 1);
        assert_eq!(cache.fetches_issued(), 1);
        assert_eq!(requests.lock()[0].uri, "mem://5?reduce=2&rotate=0");
    }

    #[test]
    fn completion_resolves_and_notifies_watchers() {
        let (mut cache, requests) = cache(10);
        cache.resource(3, 1.0);
        let key = CacheKey::new(3, 1.0);
        cache.watch(key, Watcher::Page { index: 3 });
        cache.watch(key, Watcher::Page { index: 3 });
        let request = requests.lock()[0].clone();
        let watchers = cache.complete(FetchCompletion {
            request,
            outcome: FetchOutcome::Loaded,
        });
        assert_eq!(watchers, vec![Watcher::Page { index: 3 }]);
        assert!(cache.is_resolved(3, 1.0));
        assert!(cache.resource(3, 1.0).is_resolved());
        assert_eq!(requests.lock().len(), 1);
    }

    #[test]
    fn out_of_range_pages_are_blank_without_fetching() {
        let (mut cache, requests) = cache(4);
        assert_eq!(cache.resource(-1, 1.0), Resource::Blank);
        assert_eq!(cache.resource(4, 1.0), Resource::Blank);
        assert!(requests.lock().is_empty());
        assert_eq!(Resource::Blank.uri(), BLANK_URI);
    }

    #[test]
    fn finer_resolution_satisfies_coarser_request() {
        let (mut cache, requests) = cache(10);
        cache.resource(2, 1.0);
        settle(&mut cache, 2, 1.0);
        let coarse = cache.resource(2, 4.0);
        assert!(coarse.is_resolved());
        assert_eq!(requests.lock().len(), 1);
        assert!(!cache.is_resolved(2, 0.5));
    }

    #[test]
    fn resolved_finer_entry_wins_over_pending_exact_key() {
        let (mut cache, requests) = cache(10);
        assert!(matches!(cache.resource(2, 4.0), Resource::Pending { .. }));
        cache.resource(2, 1.0);
        settle(&mut cache, 2, 1.0);

        let resource = cache.resource(2, 4.0);
        assert_eq!(
            resource,
            Resource::Resolved {
                uri: "mem://2".into(),
                reduction: 1.0
            }
        );
        assert_eq!(requests.lock().len(), 2);

        cache.resource(3, 2.0);
        cache.complete(FetchCompletion {
            request: requests.lock()[2].clone(),
            outcome: FetchOutcome::Failed("gone".into()),
        });
        cache.resource(3, 0.5);
        settle(&mut cache, 3, 0.5);
        assert!(cache.resource(3, 2.0).is_resolved());
        assert!(!cache.is_resolved(4, 2.0));
        assert!(cache.contains_page(3));
        assert!(!cache.contains_page(4));
    }

    #[test]
    fn eviction_keeps_window_and_finer_entries() {
        let (mut cache, _) = cache(40);
        for index in [10, 11, 14, 20] {
            cache.resource(index as isize, 2.0);
            settle(&mut cache, index, 2.0);
        }
        cache.resource(20, 4.0);
        settle(&mut cache, 20, 4.0);
        cache.resource(30, 1.0);
        settle(&mut cache, 30, 1.0);

        let evicted = cache.evict_outside(6..=15, 2.0);
        assert_eq!(evicted, vec![CacheKey::new(20, 2.0), CacheKey::new(20, 4.0)]);
        assert!(cache.peek(&CacheKey::new(30, 1.0)).is_some());
        assert!(cache.peek(&CacheKey::new(14, 2.0)).is_some());
    }

    #[test]
    fn eviction_after_spread_settles_drops_only_coarser_distant_pages() {
        let (mut cache, _) = cache(40);
        cache.resource(20, 8.0);
        settle(&mut cache, 20, 8.0);
        cache.evict_outside(10 - 4..=11 + 4, 4.0);
        assert!(!cache.contains_page(20));

        cache.resource(20, 1.0);
        settle(&mut cache, 20, 1.0);
        cache.evict_outside(10 - 4..=11 + 4, 4.0);
        assert!(cache.contains_page(20));
    }

    #[test]
    fn pending_entries_survive_eviction_and_late_results_are_kept() {
        let (mut cache, requests) = cache(40);
        cache.resource(30, 2.0);
        assert!(cache.evict_outside(0..=5, 2.0).is_empty());
        let request = requests.lock()[0].clone();
        cache.complete(FetchCompletion {
            request,
            outcome: FetchOutcome::Loaded,
        });
        assert!(cache.is_resolved(30, 2.0));
    }

    #[test]
    fn failed_fetches_stay_visible_until_retried() {
        let (mut cache, requests) = cache(5);
        cache.resource(1, 1.0);
        let request = requests.lock()[0].clone();
        cache.complete(FetchCompletion {
            request,
            outcome: FetchOutcome::Failed("timeout".into()),
        });
        assert!(matches!(cache.resource(1, 1.0), Resource::Failed { .. }));
        assert_eq!(requests.lock().len(), 1);
        assert_eq!(cache.retry_failed(), 1);
        assert_eq!(requests.lock().len(), 2);
        assert!(matches!(cache.resource(1, 1.0), Resource::Pending { .. }));
    }

    #[test]
    fn capacity_trim_prefers_old_entries_outside_window() {
        let (cache, _) = cache(50);
        let mut cache = cache.with_capacity(Some(3));
        cache.evict_outside(0..=3, 1.0);
        for index in 0..3 {
            cache.resource(index as isize, 1.0);
            settle(&mut cache, index, 1.0);
        }
        cache.resource(40, 1.0);
        settle(&mut cache, 40, 1.0);
        cache.resource(41, 1.0);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains_page(0));
        assert!(!cache.contains_page(40));
        assert!(cache.contains_page(41));
        assert!(cache.contains_page(2));
    }

    #[test]
    fn srcset_lists_finer_power_of_two_scales() {
        let (cache, _) = cache(3);
        let srcset = cache.srcset(1, 4.0);
        assert_eq!(srcset.len(), 2);
        assert_eq!(srcset[0].uri, "mem://1?reduce=2&rotate=0");
        assert_eq!(srcset[1].density, 4);
        assert!(cache.srcset(9, 4.0).is_empty());
    }
}
