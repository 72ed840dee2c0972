use crate::{
    error::SmallError,
    ids::{PageId, INVALID_WORD, RESERVED_PAGE_FREE_ITEM},
    storage::{file_source::FileMapping, use_mask::UseMaskChain},
    types::SmallResult,
    utils::HandyRwLock,
};

// free-item page: [next free-item page][free page count][freed page id]...
const WORD_NEXT_FREE_ITEM_PAGE: usize = 0;
const WORD_FREE_PAGE_COUNT: usize = 1;
const WORD_FREE_PAGE_BEGIN: usize = 2;

/// The stack of recently freed page ids, spilled across a chain of
/// free-item pages. Page 1 is the bottom of the chain; `active_index`
/// tracks the newest non-empty page so pop stays O(1).
pub(crate) struct FreePageStack {
    free_item_pages: Vec<PageId>,
    active_index: usize,
    items_per_page: u64,
}

impl FreePageStack {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            free_item_pages: Vec::new(),
            active_index: 0,
            items_per_page: (page_size / 8 - WORD_FREE_PAGE_BEGIN) as u64,
        }
    }

    pub(crate) fn initialize_empty(&mut self, mapping: &mut FileMapping) -> SmallResult {
        self.free_item_pages.clear();

        let buf = mapping.map_page(RESERVED_PAGE_FREE_ITEM)?;
        {
            let mut buf = buf.wl();
            buf.fill_zero();
            buf.set_u64(WORD_NEXT_FREE_ITEM_PAGE, INVALID_WORD);
            buf.set_u64(WORD_FREE_PAGE_COUNT, 0);
        }
        mapping.flush_page(RESERVED_PAGE_FREE_ITEM)?;

        self.free_item_pages.push(RESERVED_PAGE_FREE_ITEM);
        self.active_index = 0;
        Ok(())
    }

    pub(crate) fn initialize_existing(&mut self, mapping: &mut FileMapping) -> SmallResult {
        self.free_item_pages.clear();
        self.active_index = 0;

        let mut page = RESERVED_PAGE_FREE_ITEM;
        while page.is_valid() {
            self.free_item_pages.push(page);
            let buf = mapping.map_page(page)?;
            let (next, count) = {
                let buf = buf.rl();
                (
                    buf.get_u64(WORD_NEXT_FREE_ITEM_PAGE),
                    buf.get_u64(WORD_FREE_PAGE_COUNT),
                )
            };
            if count != 0 {
                self.active_index = self.free_item_pages.len() - 1;
            }
            page = PageId(next);
        }
        Ok(())
    }

    pub(crate) fn push(
        &mut self,
        mapping: &mut FileMapping,
        use_masks: &mut UseMaskChain,
        page: PageId,
    ) -> SmallResult {
        let active_page = self.free_item_pages[self.active_index];
        let buf = mapping.map_page(active_page)?;
        let count = buf.rl().get_u64(WORD_FREE_PAGE_COUNT);

        if count < self.items_per_page {
            {
                let mut buf = buf.wl();
                buf.set_u64(WORD_FREE_PAGE_BEGIN + count as usize, page.0);
                buf.set_u64(WORD_FREE_PAGE_COUNT, count + 1);
            }
            return mapping.flush_page(active_page);
        }

        // the active page is full, move to the next one
        if self.active_index == self.free_item_pages.len() - 1 {
            let new_page = mapping.append_page()?;
            buf.wl().set_u64(WORD_NEXT_FREE_ITEM_PAGE, new_page.0);
            mapping.flush_page(active_page)?;

            let new_buf = mapping.map_page(new_page)?;
            {
                let mut new_buf = new_buf.wl();
                new_buf.fill_zero();
                new_buf.set_u64(WORD_NEXT_FREE_ITEM_PAGE, INVALID_WORD);
                new_buf.set_u64(WORD_FREE_PAGE_COUNT, 1);
                new_buf.set_u64(WORD_FREE_PAGE_BEGIN, page.0);
            }
            mapping.flush_page(new_page)?;

            self.free_item_pages.push(new_page);
            use_masks.set(mapping, new_page, true)?;
        } else {
            // a drained page further up the chain gets refilled
            let new_page = self.free_item_pages[self.active_index + 1];
            let new_buf = mapping.map_page(new_page)?;
            {
                let mut new_buf = new_buf.wl();
                new_buf.set_u64(WORD_FREE_PAGE_COUNT, 1);
                new_buf.set_u64(WORD_FREE_PAGE_BEGIN, page.0);
            }
            mapping.flush_page(new_page)?;
        }
        self.active_index += 1;
        Ok(())
    }

    pub(crate) fn pop(
        &mut self,
        mapping: &mut FileMapping,
    ) -> Result<Option<PageId>, SmallError> {
        let active_page = self.free_item_pages[self.active_index];
        let buf = mapping.map_page(active_page)?;
        let count = buf.rl().get_u64(WORD_FREE_PAGE_COUNT);

        if count == 0 {
            if active_page != RESERVED_PAGE_FREE_ITEM {
                panic!(
                    "free-item chain is corrupted: {} is empty above the bottom of the chain",
                    active_page
                );
            }
            return Ok(None);
        }

        let page = {
            let mut buf = buf.wl();
            let page = buf.get_u64(WORD_FREE_PAGE_BEGIN + (count - 1) as usize);
            buf.set_u64(WORD_FREE_PAGE_COUNT, count - 1);
            page
        };
        mapping.flush_page(active_page)?;

        if count == 1 && self.active_index > 0 {
            self.active_index -= 1;
        }
        Ok(Some(PageId(page)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, Arc};

    use super::*;

    fn new_mapping(page_size: usize) -> FileMapping {
        let dir = std::env::temp_dir().join("small-store-unit");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("free_list_{}.db", std::process::id()));
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
    fn test_push_pop_lifo_across_chain_growth() {
        let page_size = 4096;
        let mut mapping = new_mapping(page_size);
        let mut use_masks = UseMaskChain::new(page_size);
        use_masks.initialize_empty(&mut mapping).unwrap();
        let mut stack = FreePageStack::new(page_size);
        stack.initialize_empty(&mut mapping).unwrap();

        // 1024 entries do not fit one 4 KiB free-item page, so the
        // chain has to grow and shrink; run two rounds to exercise the
        // refill of drained pages
        for _ in 0..2 {
            for i in 0..1024u64 {
                stack.push(&mut mapping, &mut use_masks, PageId(1024 + i)).unwrap();
            }
            for i in (0..1024u64).rev() {
                let page = stack.pop(&mut mapping).unwrap();
                assert_eq!(page, Some(PageId(1024 + i)));
            }
            assert_eq!(stack.pop(&mut mapping).unwrap(), None);
        }
    }
}
