use crate::{
    error::SmallError,
    ids::{PageId, Pointer, SourceId, TransactionId, INVALID_WORD},
    storage::{BufferPool, Persistence},
    types::SmallResult,
    utils::HandyRwLock,
};

// index page: [used address items][next index page][address item]...
// address item i holds the pointer to the first log block of
// transaction i
const WORD_ADDRESS_ITEMS: usize = 0;
const WORD_NEXT_INDEX_PAGE: usize = 1;
const WORD_ADDRESS_ITEM_BEGIN: usize = 2;

/// The chain of index pages mapping a transaction to the address of its
/// first log item. The chain starts on the source's reserved index page
/// and grows through the allocator.
pub(crate) struct AddressIndex {
    source: SourceId,
    items_per_page: u64,
    index_pages: Vec<PageId>,
    used_transaction_count: u64,
}

impl AddressIndex {
    pub(crate) fn new(bm: &BufferPool, source: SourceId) -> Self {
        Self {
            source,
            items_per_page: (bm.get_page_size() / 8 - WORD_ADDRESS_ITEM_BEGIN) as u64,
            index_pages: Vec::new(),
            used_transaction_count: 0,
        }
    }

    pub(crate) fn initialize_empty(&mut self, bm: &BufferPool) -> SmallResult {
        let page = bm.get_index_page(self.source)?;

        let buf = bm.lock_page(self.source, page)?;
        {
            let mut buf = buf.wl();
            buf.fill_zero();
            buf.set_u64(WORD_ADDRESS_ITEMS, 0);
            buf.set_u64(WORD_NEXT_INDEX_PAGE, INVALID_WORD);
        }
        bm.unlock_page(self.source, page, &buf, Persistence::ChangedAndPersist)?;

        self.index_pages = vec![page];
        self.used_transaction_count = 0;
        Ok(())
    }

    pub(crate) fn initialize_existing(&mut self, bm: &BufferPool) -> SmallResult {
        self.index_pages.clear();
        self.used_transaction_count = 0;

        let mut page = bm.get_index_page(self.source)?;
        while page.is_valid() {
            let buf = bm.lock_page(self.source, page)?;
            let (count, next) = {
                let buf = buf.rl();
                (
                    buf.get_u64(WORD_ADDRESS_ITEMS),
                    buf.get_u64(WORD_NEXT_INDEX_PAGE),
                )
            };
            bm.unlock_page(self.source, page, &buf, Persistence::NoChange)?;

            self.index_pages.push(page);
            self.used_transaction_count += count;
            page = PageId(next);
        }
        Ok(())
    }

    pub(crate) fn get_used_transaction_count(&self) -> u64 {
        self.used_transaction_count
    }

    fn locate(&self, trans: TransactionId) -> (usize, usize) {
        (
            (trans.0 / self.items_per_page) as usize,
            WORD_ADDRESS_ITEM_BEGIN + (trans.0 % self.items_per_page) as usize,
        )
    }

    /// Claim the next transaction slot, writing an invalid placeholder
    /// address. Extends the index-page chain when the last page is full.
    pub(crate) fn append_transaction(
        &mut self,
        bm: &BufferPool,
    ) -> Result<TransactionId, SmallError> {
        let trans = TransactionId(self.used_transaction_count);
        let (page_index, word) = self.locate(trans);

        if page_index == self.index_pages.len() {
            let last = *self
                .index_pages
                .last()
                .expect("address index is corrupted: the index-page chain is empty");
            let new_page = bm.allocate_page(self.source)?;

            let buf = bm.lock_page(self.source, last)?;
            buf.wl().set_u64(WORD_NEXT_INDEX_PAGE, new_page.0);
            bm.unlock_page(self.source, last, &buf, Persistence::ChangedAndPersist)?;

            let buf = bm.lock_page(self.source, new_page)?;
            {
                let mut buf = buf.wl();
                buf.fill_zero();
                buf.set_u64(WORD_ADDRESS_ITEMS, 0);
                buf.set_u64(WORD_NEXT_INDEX_PAGE, INVALID_WORD);
            }
            bm.unlock_page(self.source, new_page, &buf, Persistence::ChangedAndPersist)?;

            self.index_pages.push(new_page);
        }

        let page = self.index_pages[page_index];
        let buf = bm.lock_page(self.source, page)?;
        {
            let mut buf = buf.wl();
            buf.set_u64(word, INVALID_WORD);
            let count = buf.get_u64(WORD_ADDRESS_ITEMS);
            buf.set_u64(WORD_ADDRESS_ITEMS, count + 1);
        }
        bm.unlock_page(self.source, page, &buf, Persistence::ChangedAndPersist)?;

        self.used_transaction_count += 1;
        Ok(trans)
    }

    pub(crate) fn write_address(
        &self,
        bm: &BufferPool,
        trans: TransactionId,
        address: Pointer,
    ) -> SmallResult {
        if trans.0 >= self.used_transaction_count {
            return Err(SmallError::new("transaction is not in the address index"));
        }

        let (page_index, word) = self.locate(trans);
        let page = self.index_pages[page_index];
        let buf = bm.lock_page(self.source, page)?;
        buf.wl().set_u64(word, address.0);
        bm.unlock_page(self.source, page, &buf, Persistence::ChangedAndPersist)
    }

    pub(crate) fn read_address(
        &self,
        bm: &BufferPool,
        trans: TransactionId,
    ) -> Result<Pointer, SmallError> {
        if trans.0 >= self.used_transaction_count {
            return Err(SmallError::new("transaction is not in the address index"));
        }

        let (page_index, word) = self.locate(trans);
        let page = self.index_pages[page_index];
        let buf = bm.lock_page(self.source, page)?;
        let address = buf.rl().get_u64(word);
        bm.unlock_page(self.source, page, &buf, Persistence::NoChange)?;
        Ok(Pointer(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> String {
        let dir = std::env::temp_dir().join("small-store-unit");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{}_{}.db", name, std::process::id()))
            .to_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_address_round_trip_across_chain_growth() {
        let path = temp_file("address_index");

        {
            let bm = BufferPool::new(4096, 16).unwrap();
            let source = bm.load_file_source(&path, true).unwrap();
            let mut index = AddressIndex::new(&bm, source);
            index.initialize_empty(&bm).unwrap();

            // 1024 transactions overflow a single 4 KiB index page
            for i in 0..1024u64 {
                let trans = index.append_transaction(&bm).unwrap();
                assert_eq!(trans, TransactionId(i));
                index.write_address(&bm, trans, Pointer(i)).unwrap();
            }
            for i in 0..1024u64 {
                let address = index.read_address(&bm, TransactionId(i)).unwrap();
                assert_eq!(address, Pointer(i));
            }
            bm.unload_source(source).unwrap();
        }

        // the chain and the addresses survive a reopen
        {
            let bm = BufferPool::new(4096, 16).unwrap();
            let source = bm.load_file_source(&path, false).unwrap();
            let mut index = AddressIndex::new(&bm, source);
            index.initialize_existing(&bm).unwrap();

            assert_eq!(index.get_used_transaction_count(), 1024);
            for i in 0..1024u64 {
                let address = index.read_address(&bm, TransactionId(i)).unwrap();
                assert_eq!(address, Pointer(i));
            }
        }
    }

    #[test]
    fn test_out_of_range_transaction_is_rejected() {
        let path = temp_file("address_index_range");

        let bm = BufferPool::new(4096, 16).unwrap();
        let source = bm.load_file_source(&path, true).unwrap();
        let mut index = AddressIndex::new(&bm, source);
        index.initialize_empty(&bm).unwrap();

        assert!(index.read_address(&bm, TransactionId(0)).is_err());
        assert!(index.write_address(&bm, TransactionId(0), Pointer(1)).is_err());

        index.append_transaction(&bm).unwrap();
        assert_eq!(
            index.read_address(&bm, TransactionId(0)).unwrap(),
            Pointer::INVALID
        );
    }
}
