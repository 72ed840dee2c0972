use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use itertools::Itertools;
use log::{debug, info};

use crate::{
    error::SmallError,
    ids::{PageId, Pointer, SourceId},
    storage::{
        file_source::FileSource,
        memory_source::MemorySource,
        page::PageBuffer,
        source::{CandidatePage, PageSource, Persistence},
    },
    types::{Pod, ResultPod, SmallResult},
    utils::HandyRwLock,
};

/// The buffer manager: a bounded page cache over any number of backing
/// sources, plus the pointer codec tying page ids and in-page offsets
/// into single words.
///
/// Pages move through a fixed lifecycle: allocate, lock (pinning the
/// page and exposing its bytes), unlock with a persistence directive,
/// free. Whenever the resident-page counter exceeds the configured
/// budget an eviction pass unmaps the oldest unlocked pages, flushing
/// dirty ones back to their source.
pub struct BufferPool {
    page_size: usize,
    offset_bits: u32,
    cache_page_count: usize,
    total_cached_pages: Arc<AtomicUsize>,
    next_source_id: AtomicU32,
    sources: RwLock<HashMap<u32, Arc<dyn PageSource>>>,
}

impl BufferPool {
    pub fn new(page_size: usize, cache_page_count: usize) -> Result<Self, SmallError> {
        // the pointer codec steals the low log2(page_size) bits for the
        // in-page offset, so the page size has to be a power of two
        if !page_size.is_power_of_two() {
            return Err(SmallError::new("page size must be a power of two"));
        }
        if page_size < 64 || page_size > 1 << 30 {
            return Err(SmallError::new("page size is out of range"));
        }

        Ok(Self {
            page_size,
            offset_bits: page_size.trailing_zeros(),
            cache_page_count,
            total_cached_pages: Arc::new(AtomicUsize::new(0)),
            next_source_id: AtomicU32::new(1),
            sources: RwLock::new(HashMap::new()),
        })
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size
    }

    pub fn get_cache_page_count(&self) -> usize {
        self.cache_page_count
    }

    pub fn get_cache_size(&self) -> usize {
        self.page_size * self.cache_page_count
    }

    pub fn get_currently_cached_page_count(&self) -> usize {
        self.total_cached_pages.load(Ordering::SeqCst)
    }

    pub fn load_memory_source(&self) -> SourceId {
        let id = SourceId(self.next_source_id.fetch_add(1, Ordering::SeqCst));
        let source = Arc::new(MemorySource::new(
            id,
            self.page_size,
            self.total_cached_pages.clone(),
        ));
        self.sources.wl().insert(id.0, source);
        info!("loaded memory source {}", id);

        self.evict_if_needed();
        id
    }

    pub fn load_file_source(
        &self,
        file_name: &str,
        create_new: bool,
    ) -> Result<SourceId, SmallError> {
        let id = SourceId(self.next_source_id.fetch_add(1, Ordering::SeqCst));
        let source = Arc::new(FileSource::create(
            id,
            self.total_cached_pages.clone(),
            self.page_size,
            file_name,
            create_new,
        )?);
        self.sources.wl().insert(id.0, source);
        info!("loaded file source {} from {}", id, file_name);

        self.evict_if_needed();
        Ok(id)
    }

    pub fn unload_source(&self, source: SourceId) -> SmallResult {
        let removed = match self.sources.wl().remove(&source.0) {
            Some(removed) => removed,
            None => return Err(SmallError::new("source is not loaded")),
        };
        removed.unload()?;
        info!("unloaded source {}", source);
        Ok(())
    }

    pub fn get_source_file_name(&self, source: SourceId) -> Option<String> {
        let sources = self.sources.rl();
        sources.get(&source.0).and_then(|s| s.get_file_name())
    }

    fn get_source(&self, source: SourceId) -> Result<Arc<dyn PageSource>, SmallError> {
        self.sources
            .rl()
            .get(&source.0)
            .cloned()
            .ok_or_else(|| SmallError::new("source is not loaded"))
    }

    pub fn get_index_page(&self, source: SourceId) -> Result<PageId, SmallError> {
        Ok(self.get_source(source)?.get_index_page())
    }

    pub fn allocate_page(&self, source: SourceId) -> Result<PageId, SmallError> {
        let page = self.get_source(source)?.allocate_page()?;
        self.evict_if_needed();
        Ok(page)
    }

    pub fn free_page(&self, source: SourceId, page: PageId) -> SmallResult {
        self.get_source(source)?.free_page(page)
    }

    /// Pin a page and hand out its bytes. Fails when the page is not in
    /// use or someone else holds it.
    pub fn lock_page(&self, source: SourceId, page: PageId) -> ResultPod<PageBuffer> {
        let buf = self.get_source(source)?.lock_page(page)?;
        self.evict_if_needed();
        Ok(buf)
    }

    /// Unpin a page. The caller has to hand back the very buffer it got
    /// from `lock_page`.
    pub fn unlock_page(
        &self,
        source: SourceId,
        page: PageId,
        buf: &Pod<PageBuffer>,
        persistence: Persistence,
    ) -> SmallResult {
        self.get_source(source)?.unlock_page(page, buf, persistence)
    }

    pub fn encode_pointer(&self, page: PageId, offset: u64) -> Result<Pointer, SmallError> {
        if !page.is_valid() {
            return Err(SmallError::new("cannot encode an invalid page"));
        }
        if offset >= self.page_size as u64 {
            return Err(SmallError::new("offset is out of the page"));
        }
        if page.0 >= u64::MAX >> self.offset_bits {
            return Err(SmallError::new("page index does not fit the pointer encoding"));
        }
        Ok(Pointer((page.0 << self.offset_bits) | offset))
    }

    pub fn decode_pointer(&self, pointer: Pointer) -> Result<(PageId, u64), SmallError> {
        if !pointer.is_valid() {
            return Err(SmallError::new("cannot decode an invalid pointer"));
        }
        let offset = pointer.0 & ((1 << self.offset_bits) - 1);
        Ok((PageId(pointer.0 >> self.offset_bits), offset))
    }

    /// Bring the resident-page count back under the configured budget
    /// by unmapping the globally oldest unlocked pages.
    fn evict_if_needed(&self) {
        let cached = self.total_cached_pages.load(Ordering::SeqCst);
        if cached <= self.cache_page_count {
            return;
        }
        let expect_count = cached - self.cache_page_count;

        let sources: Vec<Arc<dyn PageSource>> = self.sources.rl().values().cloned().collect();
        let by_id: HashMap<u32, Arc<dyn PageSource>> = sources
            .iter()
            .map(|s| (s.get_source_id().0, s.clone()))
            .collect();

        // every source reports its oldest unlocked pages already sorted
        // by access time, so a k-way merge yields a global LRU order
        let candidate_lists: Vec<Vec<CandidatePage>> = sources
            .iter()
            .map(|s| s.fill_unmap_candidates(expect_count))
            .collect();
        let merged = candidate_lists
            .into_iter()
            .kmerge_by(|a, b| a.last_access_time < b.last_access_time);

        for candidate in merged {
            if self.total_cached_pages.load(Ordering::SeqCst) <= self.cache_page_count {
                break;
            }
            let source = match by_id.get(&candidate.source.0) {
                Some(source) => source,
                None => continue,
            };
            match source.unmap_page(candidate.page) {
                Ok(_) => debug!("evicted {} of {}", candidate.page, candidate.source),
                // the page got locked in the meantime, move on
                Err(e) => debug!(
                    "skipped eviction of {} of {}: {}",
                    candidate.page, candidate.source, e
                ),
            }
        }
        debug!(
            "eviction pass: {} -> {} cached pages",
            cached,
            self.total_cached_pages.load(Ordering::SeqCst)
        );
    }
}
