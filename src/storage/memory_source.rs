use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use bit_vec::BitVec;
use log::debug;

use crate::{
    error::SmallError,
    ids::{PageId, SourceId, RESERVED_PAGE_COUNT, RESERVED_PAGE_INDEX},
    storage::{
        page::{PageBuffer, PageDesc},
        source::{CandidatePage, PageSource, Persistence},
    },
    types::{Pod, ResultPod, SmallResult},
};

/// An anonymous source: an appendable vector of page buffers plus a
/// stack of freed page ids. There is no backing store, so its pages are
/// resident for the whole life of the source and are never offered to
/// the eviction pass.
pub struct MemorySource {
    source: SourceId,
    page_size: usize,
    total_cached_pages: Arc<AtomicUsize>,
    inner: Mutex<MemorySourceInner>,
}

struct MemorySourceInner {
    pages: Vec<PageDesc>,
    use_mask: BitVec,
    free_pages: Vec<u64>,
}

impl MemorySource {
    pub fn new(
        source: SourceId,
        page_size: usize,
        total_cached_pages: Arc<AtomicUsize>,
    ) -> Self {
        let mut pages = Vec::new();
        let mut use_mask = BitVec::new();
        for _ in 0..RESERVED_PAGE_COUNT {
            pages.push(PageDesc::new(PageBuffer::new(page_size)));
            use_mask.push(true);
        }
        total_cached_pages.fetch_add(pages.len(), Ordering::SeqCst);

        Self {
            source,
            page_size,
            total_cached_pages,
            inner: Mutex::new(MemorySourceInner {
                pages,
                use_mask,
                free_pages: Vec::new(),
            }),
        }
    }
}

impl PageSource for MemorySource {
    fn get_source_id(&self) -> SourceId {
        self.source
    }

    fn get_file_name(&self) -> Option<String> {
        None
    }

    fn get_index_page(&self) -> PageId {
        RESERVED_PAGE_INDEX
    }

    fn allocate_page(&self) -> Result<PageId, SmallError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(index) = inner.free_pages.pop() {
            inner.use_mask.set(index as usize, true);
            debug!("{}: reused freed {}", self.source, PageId(index));
            return Ok(PageId(index));
        }

        let index = inner.pages.len() as u64;
        inner.pages.push(PageDesc::new(PageBuffer::new(self.page_size)));
        inner.use_mask.push(true);
        self.total_cached_pages.fetch_add(1, Ordering::SeqCst);
        debug!("{}: appended {}", self.source, PageId(index));
        Ok(PageId(index))
    }

    fn free_page(&self, page: PageId) -> SmallResult {
        if page.0 < RESERVED_PAGE_COUNT {
            return Err(SmallError::new("a reserved page cannot be freed"));
        }

        let mut inner = self.inner.lock().unwrap();
        if page.0 as usize >= inner.pages.len() {
            return Err(SmallError::new("page does not exist"));
        }
        if !inner.use_mask.get(page.0 as usize).unwrap_or(false) {
            return Err(SmallError::new("page is not in use"));
        }
        if inner.pages[page.0 as usize].locked {
            return Err(SmallError::new("page is locked"));
        }

        inner.use_mask.set(page.0 as usize, false);
        inner.free_pages.push(page.0);
        Ok(())
    }

    fn lock_page(&self, page: PageId) -> ResultPod<PageBuffer> {
        let mut inner = self.inner.lock().unwrap();
        if page.0 as usize >= inner.pages.len() {
            return Err(SmallError::new("page does not exist"));
        }
        if !inner.use_mask.get(page.0 as usize).unwrap_or(false) {
            return Err(SmallError::new("page is not in use"));
        }

        let desc = &mut inner.pages[page.0 as usize];
        if desc.locked {
            return Err(SmallError::new("page is already locked"));
        }
        desc.locked = true;
        desc.touch();
        Ok(desc.buf.clone())
    }

    fn unlock_page(
        &self,
        page: PageId,
        buf: &Pod<PageBuffer>,
        persistence: Persistence,
    ) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();
        let desc = match inner.pages.get_mut(page.0 as usize) {
            Some(desc) => desc,
            None => return Err(SmallError::new("page does not exist")),
        };
        if !Arc::ptr_eq(&desc.buf, buf) {
            return Err(SmallError::new("buffer does not match the mapped page"));
        }
        if !desc.locked {
            return Err(SmallError::new("page is not locked"));
        }

        match persistence {
            Persistence::NoChange => {}
            Persistence::Changed => desc.dirty = true,
            // there is no backing store to flush to
            Persistence::ChangedAndPersist => desc.dirty = false,
        }
        desc.locked = false;
        Ok(())
    }

    fn unmap_page(&self, _page: PageId) -> SmallResult {
        Err(SmallError::new(
            "an anonymous page has no backing store to spill to",
        ))
    }

    fn fill_unmap_candidates(&self, _expect_count: usize) -> Vec<CandidatePage> {
        Vec::new()
    }

    fn unload(&self) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();
        self.total_cached_pages
            .fetch_sub(inner.pages.len(), Ordering::SeqCst);
        inner.pages.clear();
        inner.use_mask.truncate(0);
        inner.free_pages.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::HandyRwLock;

    fn new_source() -> MemorySource {
        MemorySource::new(SourceId(1), 4096, Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn test_allocate_reuses_freed_pages_lifo() {
        let source = new_source();

        let a = source.allocate_page().unwrap();
        let b = source.allocate_page().unwrap();
        assert_ne!(a, b);

        source.free_page(a).unwrap();
        source.free_page(b).unwrap();

        // the most recently freed page comes back first
        assert_eq!(source.allocate_page().unwrap(), b);
        assert_eq!(source.allocate_page().unwrap(), a);
    }

    #[test]
    fn test_reserved_pages_are_protected() {
        let source = new_source();
        for index in 0..RESERVED_PAGE_COUNT {
            assert!(source.free_page(PageId(index)).is_err());
        }
    }

    #[test]
    fn test_double_free_fails() {
        let source = new_source();
        let page = source.allocate_page().unwrap();
        source.free_page(page).unwrap();
        assert!(source.free_page(page).is_err());
    }

    #[test]
    fn test_page_content_survives_unlock() {
        let source = new_source();
        let page = source.allocate_page().unwrap();

        let buf = source.lock_page(page).unwrap();
        buf.wl().write_bytes(0, b"hello");
        source
            .unlock_page(page, &buf, Persistence::Changed)
            .unwrap();

        let buf = source.lock_page(page).unwrap();
        assert_eq!(buf.rl().read_bytes(0, 5), b"hello");
        source
            .unlock_page(page, &buf, Persistence::NoChange)
            .unwrap();
    }
}
