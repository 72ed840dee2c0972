use crate::{
    error::SmallError,
    ids::{PageId, INVALID_WORD, RESERVED_PAGE_USE_MASK},
    storage::file_source::FileMapping,
    types::SmallResult,
    utils::HandyRwLock,
};

// use-mask page: [next use-mask page][bitmap word]...
// bit = 1 means the page is in use
const WORD_NEXT_USE_MASK_PAGE: usize = 0;
const WORD_USE_MASK_BEGIN: usize = 1;

/// The chained bitmap recording which pages of a file source are live.
/// Page 0 is the head of the chain; a new mask page is appended when a
/// page id beyond the covered range gets marked.
pub(crate) struct UseMaskChain {
    mask_pages: Vec<PageId>,
    items_per_page: usize,
}

impl UseMaskChain {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            mask_pages: Vec::new(),
            items_per_page: page_size / 8 - WORD_USE_MASK_BEGIN,
        }
    }

    fn bits_per_page(&self) -> u64 {
        (self.items_per_page * 64) as u64
    }

    /// Map a page id to (mask page index, word index, bit shift).
    fn locate(&self, page: PageId) -> (usize, usize, usize) {
        let bit = page.0 % self.bits_per_page();
        (
            (page.0 / self.bits_per_page()) as usize,
            WORD_USE_MASK_BEGIN + (bit / 64) as usize,
            (bit % 64) as usize,
        )
    }

    pub(crate) fn initialize_empty(&mut self, mapping: &mut FileMapping) -> SmallResult {
        self.mask_pages.clear();

        let buf = mapping.map_page(RESERVED_PAGE_USE_MASK)?;
        {
            let mut buf = buf.wl();
            buf.fill_zero();
            buf.set_u64(WORD_NEXT_USE_MASK_PAGE, INVALID_WORD);
        }
        mapping.flush_page(RESERVED_PAGE_USE_MASK)?;

        self.mask_pages.push(RESERVED_PAGE_USE_MASK);
        Ok(())
    }

    pub(crate) fn initialize_existing(&mut self, mapping: &mut FileMapping) -> SmallResult {
        self.mask_pages.clear();

        let mut page = RESERVED_PAGE_USE_MASK;
        while page.is_valid() {
            self.mask_pages.push(page);
            let buf = mapping.map_page(page)?;
            let next = buf.rl().get_u64(WORD_NEXT_USE_MASK_PAGE);
            page = PageId(next);
        }
        Ok(())
    }

    pub(crate) fn get(
        &self,
        mapping: &mut FileMapping,
        page: PageId,
    ) -> Result<bool, SmallError> {
        let (mask_page_index, word, shift) = self.locate(page);
        if mask_page_index >= self.mask_pages.len() {
            // the chain never covered this page id, so it was never used
            return Ok(false);
        }

        let buf = mapping.map_page(self.mask_pages[mask_page_index])?;
        let item = buf.rl().get_u64(word);
        Ok((item >> shift) & 1 == 1)
    }

    pub(crate) fn set(
        &mut self,
        mapping: &mut FileMapping,
        page: PageId,
        in_use: bool,
    ) -> SmallResult {
        let (mask_page_index, word, shift) = self.locate(page);
        while mask_page_index >= self.mask_pages.len() {
            self.extend(mapping)?;
        }

        let mask_page = self.mask_pages[mask_page_index];
        let buf = mapping.map_page(mask_page)?;
        {
            let mut buf = buf.wl();
            let mut item = buf.get_u64(word);
            if in_use {
                item |= 1 << shift;
            } else {
                item &= !(1 << shift);
            }
            buf.set_u64(word, item);
        }
        mapping.flush_page(mask_page)
    }

    /// Append one mask page to the chain. The new page marks itself in
    /// use before the tail's next pointer is linked to it.
    fn extend(&mut self, mapping: &mut FileMapping) -> SmallResult {
        let tail = *self
            .mask_pages
            .last()
            .expect("use-mask chain is corrupted: the chain is empty");

        let new_page = mapping.append_page()?;
        let buf = mapping.map_page(new_page)?;
        {
            let mut buf = buf.wl();
            buf.fill_zero();
            buf.set_u64(WORD_NEXT_USE_MASK_PAGE, INVALID_WORD);
        }
        mapping.flush_page(new_page)?;

        self.mask_pages.push(new_page);
        self.set(mapping, new_page, true)?;

        let tail_buf = mapping.map_page(tail)?;
        tail_buf.wl().set_u64(WORD_NEXT_USE_MASK_PAGE, new_page.0);
        mapping.flush_page(tail)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, Arc};

    use super::*;

    fn new_mapping(page_size: usize) -> FileMapping {
        let dir = std::env::temp_dir().join("small-store-unit");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("use_mask_{}.db", std::process::id()));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        let mut mapping = FileMapping::new(page_size, file, Arc::new(AtomicUsize::new(0)));
        mapping.initialize_empty_source();
        mapping
    }

    #[test]
    fn test_set_and_get() {
        let page_size = 4096;
        let mut mapping = new_mapping(page_size);
        let mut chain = UseMaskChain::new(page_size);
        chain.initialize_empty(&mut mapping).unwrap();

        let page = PageId(100);
        assert_eq!(chain.get(&mut mapping, page).unwrap(), false);
        chain.set(&mut mapping, page, true).unwrap();
        assert_eq!(chain.get(&mut mapping, page).unwrap(), true);
        chain.set(&mut mapping, page, false).unwrap();
        assert_eq!(chain.get(&mut mapping, page).unwrap(), false);
    }

    #[test]
    fn test_chain_extension() {
        let page_size = 4096;
        let mut mapping = new_mapping(page_size);
        let mut chain = UseMaskChain::new(page_size);
        chain.initialize_empty(&mut mapping).unwrap();

        // far beyond the range of the first mask page
        let bits_per_page = (page_size / 8 - 1) as u64 * 64;
        let page = PageId(bits_per_page + 7);
        chain.set(&mut mapping, page, true).unwrap();
        assert_eq!(chain.get(&mut mapping, page).unwrap(), true);
        assert!(chain.mask_pages.len() >= 2);

        // the appended mask pages marked themselves in use
        for mask_page in chain.mask_pages[1..].to_vec() {
            assert_eq!(chain.get(&mut mapping, mask_page).unwrap(), true);
        }
    }
}
