use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use log::debug;

use crate::{
    error::SmallError,
    ids::{
        PageId, SourceId, RESERVED_PAGE_COUNT, RESERVED_PAGE_FREE_ITEM, RESERVED_PAGE_INDEX,
        RESERVED_PAGE_USE_MASK,
    },
    storage::{
        free_list::FreePageStack,
        page::{PageBuffer, PageDesc},
        source::{CandidatePage, PageSource, Persistence},
        use_mask::UseMaskChain,
    },
    types::{Pod, ResultPod, SmallResult},
    utils::HandyRwLock,
};

/// The resident-page table of a file source.
///
/// A "mapped" page is a page-sized buffer read from the file; unmapping
/// writes the buffer back when it is dirty. The file grows one page at a
/// time and only at its very end, so a page offset beyond end-of-file is
/// rejected unless it starts exactly there.
pub(crate) struct FileMapping {
    page_size: usize,
    file: File,
    total_cached_pages: Arc<AtomicUsize>,
    mapped_pages: HashMap<u64, PageDesc>,
    total_page_count: u64,
}

impl FileMapping {
    pub(crate) fn new(
        page_size: usize,
        file: File,
        total_cached_pages: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            page_size,
            file,
            total_cached_pages,
            mapped_pages: HashMap::new(),
            total_page_count: 0,
        }
    }

    pub(crate) fn initialize_empty_source(&mut self) {
        self.total_page_count = RESERVED_PAGE_COUNT;
    }

    pub(crate) fn initialize_existing_source(&mut self) -> SmallResult {
        let len = self
            .file
            .metadata()
            .or_else(|e| Err(SmallError::new(&e.to_string())))?
            .len();
        self.total_page_count = len / self.page_size as u64;
        Ok(())
    }

    pub(crate) fn get_total_page_count(&self) -> u64 {
        self.total_page_count
    }

    pub(crate) fn get_mapped_page_count(&self) -> usize {
        self.mapped_pages.len()
    }

    pub(crate) fn map_page(&mut self, page: PageId) -> ResultPod<PageBuffer> {
        if let Some(desc) = self.mapped_pages.get_mut(&page.0) {
            desc.touch();
            return Ok(desc.buf.clone());
        }

        let offset = page.0 * self.page_size as u64;
        let len = self
            .file
            .metadata()
            .or_else(|e| Err(SmallError::new(&e.to_string())))?
            .len();

        let buffer = if offset + self.page_size as u64 <= len {
            let mut data = vec![0u8; self.page_size];
            self.file
                .seek(SeekFrom::Start(offset))
                .or_else(|e| Err(SmallError::new(&e.to_string())))?;
            self.file
                .read_exact(&mut data)
                .or_else(|e| Err(SmallError::new(&e.to_string())))?;
            PageBuffer::from_bytes(data)
        } else if offset == len {
            // growing the file is only legal at its very end
            self.file
                .set_len(offset + self.page_size as u64)
                .or_else(|e| Err(SmallError::new(&e.to_string())))?;
            self.total_page_count = page.0 + 1;
            PageBuffer::new(self.page_size)
        } else {
            return Err(SmallError::new(
                "cannot map a page beyond the end of the backing file",
            ));
        };

        let desc = PageDesc::new(buffer);
        let buf = desc.buf.clone();
        self.mapped_pages.insert(page.0, desc);
        self.total_cached_pages.fetch_add(1, Ordering::SeqCst);
        Ok(buf)
    }

    pub(crate) fn append_page(&mut self) -> Result<PageId, SmallError> {
        let page = PageId(self.total_page_count);
        self.map_page(page)?;
        Ok(page)
    }

    pub(crate) fn unmap_page(&mut self, page: PageId) -> SmallResult {
        let (locked, dirty) = match self.mapped_pages.get(&page.0) {
            Some(desc) => (desc.locked, desc.dirty),
            None => return Err(SmallError::new("page is not mapped")),
        };
        if locked {
            return Err(SmallError::new("page is locked"));
        }
        if dirty {
            self.flush_page(page)?;
        }

        self.mapped_pages.remove(&page.0);
        self.total_cached_pages.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn unmap_all_pages(&mut self) -> SmallResult {
        let pages: Vec<u64> = self.mapped_pages.keys().cloned().collect();
        for index in pages {
            if self.mapped_pages[&index].dirty {
                self.flush_page(PageId(index))?;
            }
            self.mapped_pages.remove(&index);
            self.total_cached_pages.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Write a mapped page back to the file and clear its dirty flag.
    pub(crate) fn flush_page(&mut self, page: PageId) -> SmallResult {
        let buf = match self.mapped_pages.get(&page.0) {
            Some(desc) => desc.buf.clone(),
            None => return Err(SmallError::new("page is not mapped")),
        };

        let offset = page.0 * self.page_size as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .or_else(|e| Err(SmallError::new(&e.to_string())))?;
        self.file
            .write_all(buf.rl().as_slice())
            .or_else(|e| Err(SmallError::new(&e.to_string())))?;

        self.mapped_pages.get_mut(&page.0).unwrap().dirty = false;
        Ok(())
    }

    /// Push everything written so far down to the device.
    pub(crate) fn sync_file(&mut self) -> SmallResult {
        self.file
            .sync_data()
            .or_else(|e| Err(SmallError::new(&e.to_string())))
    }

    pub(crate) fn desc(&self, page: PageId) -> Option<&PageDesc> {
        self.mapped_pages.get(&page.0)
    }

    pub(crate) fn desc_mut(&mut self, page: PageId) -> Option<&mut PageDesc> {
        self.mapped_pages.get_mut(&page.0)
    }

    pub(crate) fn iter_mapped(&self) -> impl Iterator<Item = (PageId, &PageDesc)> + '_ {
        self.mapped_pages
            .iter()
            .map(|(&index, desc)| (PageId(index), desc))
    }
}

pub struct FileSource {
    source: SourceId,
    file_name: String,
    inner: Mutex<FileSourceInner>,
}

struct FileSourceInner {
    mapping: FileMapping,
    use_masks: UseMaskChain,
    free_pages: FreePageStack,
}

impl FileSource {
    pub fn create(
        source: SourceId,
        total_cached_pages: Arc<AtomicUsize>,
        page_size: usize,
        file_name: &str,
        create_new: bool,
    ) -> Result<Self, SmallError> {
        let file = if create_new {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(file_name)
        } else {
            OpenOptions::new().read(true).write(true).open(file_name)
        }
        .or_else(|e| {
            Err(SmallError::new(&format!(
                "cannot open file {}: {}",
                file_name, e
            )))
        })?;

        let mut mapping = FileMapping::new(page_size, file, total_cached_pages);
        let mut use_masks = UseMaskChain::new(page_size);
        let mut free_pages = FreePageStack::new(page_size);

        if create_new {
            mapping.initialize_empty_source();
            use_masks.initialize_empty(&mut mapping)?;
            free_pages.initialize_empty(&mut mapping)?;
            mapping.map_page(RESERVED_PAGE_INDEX)?;

            use_masks.set(&mut mapping, RESERVED_PAGE_FREE_ITEM, true)?;
            use_masks.set(&mut mapping, RESERVED_PAGE_USE_MASK, true)?;
            use_masks.set(&mut mapping, RESERVED_PAGE_INDEX, true)?;
        } else {
            mapping.initialize_existing_source()?;
            use_masks.initialize_existing(&mut mapping)?;
            free_pages.initialize_existing(&mut mapping)?;
        }

        Ok(Self {
            source,
            file_name: file_name.to_string(),
            inner: Mutex::new(FileSourceInner {
                mapping,
                use_masks,
                free_pages,
            }),
        })
    }
}

impl PageSource for FileSource {
    fn get_source_id(&self) -> SourceId {
        self.source
    }

    fn get_file_name(&self) -> Option<String> {
        Some(self.file_name.clone())
    }

    fn get_index_page(&self) -> PageId {
        RESERVED_PAGE_INDEX
    }

    fn allocate_page(&self) -> Result<PageId, SmallError> {
        let inner = &mut *self.inner.lock().unwrap();

        let page = match inner.free_pages.pop(&mut inner.mapping)? {
            Some(page) => page,
            None => inner.mapping.append_page()?,
        };
        inner.use_masks.set(&mut inner.mapping, page, true)?;
        debug!("{}: allocated {}", self.source, page);
        Ok(page)
    }

    fn free_page(&self, page: PageId) -> SmallResult {
        if page.0 < RESERVED_PAGE_COUNT {
            return Err(SmallError::new("a reserved page cannot be freed"));
        }

        let inner = &mut *self.inner.lock().unwrap();
        if !inner.use_masks.get(&mut inner.mapping, page)? {
            return Err(SmallError::new("page is not in use"));
        }
        // a resident page has to be unmappable, i.e. not locked
        if inner.mapping.desc(page).is_some() {
            inner.mapping.unmap_page(page)?;
        }

        inner
            .free_pages
            .push(&mut inner.mapping, &mut inner.use_masks, page)?;
        inner.use_masks.set(&mut inner.mapping, page, false)?;
        debug!("{}: freed {}", self.source, page);
        Ok(())
    }

    fn lock_page(&self, page: PageId) -> ResultPod<PageBuffer> {
        let inner = &mut *self.inner.lock().unwrap();
        if page.0 >= inner.mapping.get_total_page_count() {
            return Err(SmallError::new("page does not exist"));
        }
        if !inner.use_masks.get(&mut inner.mapping, page)? {
            return Err(SmallError::new("page is not in use"));
        }

        let buf = inner.mapping.map_page(page)?;
        let desc = inner.mapping.desc_mut(page).unwrap();
        if desc.locked {
            return Err(SmallError::new("page is already locked"));
        }
        desc.locked = true;
        Ok(buf)
    }

    fn unlock_page(
        &self,
        page: PageId,
        buf: &Pod<PageBuffer>,
        persistence: Persistence,
    ) -> SmallResult {
        let inner = &mut *self.inner.lock().unwrap();
        {
            let desc = match inner.mapping.desc_mut(page) {
                Some(desc) => desc,
                None => return Err(SmallError::new("page is not mapped")),
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
                Persistence::ChangedAndPersist => {}
            }
            desc.locked = false;
        }

        if persistence == Persistence::ChangedAndPersist {
            inner.mapping.flush_page(page)?;
            inner.mapping.sync_file()?;
        }
        Ok(())
    }

    fn unmap_page(&self, page: PageId) -> SmallResult {
        let inner = &mut *self.inner.lock().unwrap();
        inner.mapping.unmap_page(page)
    }

    fn fill_unmap_candidates(&self, expect_count: usize) -> Vec<CandidatePage> {
        let inner = self.inner.lock().unwrap();
        if inner.mapping.get_mapped_page_count() == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<CandidatePage> = inner
            .mapping
            .iter_mapped()
            .filter(|(_, desc)| !desc.locked)
            .map(|(page, desc)| CandidatePage {
                source: self.source,
                page,
                last_access_time: desc.last_access_time,
            })
            .collect();
        candidates.sort_by_key(|candidate| candidate.last_access_time);
        candidates.truncate(expect_count);
        candidates
    }

    fn unload(&self) -> SmallResult {
        let inner = &mut *self.inner.lock().unwrap();
        inner.mapping.unmap_all_pages()?;
        inner.mapping.sync_file()
    }
}
