use std::{collections::HashMap, sync::Arc, sync::Mutex};

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::{
    error::SmallError,
    ids::{Pointer, SourceId, TransactionId, INVALID_WORD},
    storage::{BufferPool, Persistence},
    types::SmallResult,
    utils::{align_to_word, HandyRwLock},
};

use super::address_index::AddressIndex;

// Log block layout, all words little-endian u64:
//
//   first block of a transaction's first item:
//       [transaction][item length][block length][next address][payload]
//   first block of a subsequent item:
//       [item length][block length][next address][payload]
//   continuation block:
//       [block length][next address][payload]
//
// `block length` counts the payload bytes of the block; the block is
// padded up to a word boundary. `next address` points to the next block
// of the same item while the item is being written, and to the first
// block of the transaction's next item once that one exists.

const TRANS_HEADER_WORDS: usize = 4;
const ITEM_HEADER_WORDS: usize = 3;
const BLOCK_HEADER_WORDS: usize = 2;

struct LogTransDesc {
    first_item: Pointer,
    // word address of the last written block's next-address field, the
    // place to patch when the following item lands
    last_item: Pointer,
    writer_open: bool,
}

impl LogTransDesc {
    fn new() -> Self {
        Self {
            first_item: Pointer::INVALID,
            last_item: Pointer::INVALID,
            writer_open: false,
        }
    }
}

struct LogInner {
    address_index: AddressIndex,
    active_transactions: HashMap<u64, LogTransDesc>,
    // the write cursor: where the next block goes, invalid when a fresh
    // page is needed
    next_block_address: Pointer,
}

/// Per-transaction item streams layered over one buffer source.
///
/// A transaction is a slot in the address index; while it is active its
/// descriptor lives in memory and new items can be appended through a
/// `LogWriter`. Items are chains of variable-sized blocks threaded
/// through the log pages, so a single item may cross any number of page
/// boundaries.
pub struct LogManager {
    bm: Arc<BufferPool>,
    source: SourceId,
    page_size: usize,
    inner: Mutex<LogInner>,
}

impl LogManager {
    pub fn new(
        bm: Arc<BufferPool>,
        source: SourceId,
        create_new: bool,
    ) -> Result<Self, SmallError> {
        let mut address_index = AddressIndex::new(&bm, source);
        if create_new {
            address_index.initialize_empty(&bm)?;
        } else {
            address_index.initialize_existing(&bm)?;
        }

        let page_size = bm.get_page_size();
        Ok(Self {
            bm,
            source,
            page_size,
            inner: Mutex::new(LogInner {
                address_index,
                active_transactions: HashMap::new(),
                next_block_address: Pointer::INVALID,
            }),
        })
    }

    pub fn get_used_transaction_count(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.address_index.get_used_transaction_count()
    }

    pub fn get_transaction(&self, index: u64) -> Option<TransactionId> {
        let inner = self.inner.lock().unwrap();
        if index < inner.address_index.get_used_transaction_count() {
            Some(TransactionId(index))
        } else {
            None
        }
    }

    /// Claim a new transaction slot and mark it active.
    pub fn open_transaction(&self) -> Result<TransactionId, SmallError> {
        let mut inner = self.inner.lock().unwrap();
        let trans = inner.address_index.append_transaction(&self.bm)?;
        inner
            .active_transactions
            .insert(trans.0, LogTransDesc::new());
        debug!("opened log transaction {}", trans);
        Ok(trans)
    }

    /// Deactivate a transaction. Fails while a writer is still open.
    pub fn close_transaction(&self, trans: TransactionId) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();
        let writer_open = match inner.active_transactions.get(&trans.0) {
            Some(desc) => desc.writer_open,
            None => return Err(SmallError::new("transaction is not active")),
        };
        if writer_open {
            return Err(SmallError::new("a log writer is still open"));
        }

        inner.active_transactions.remove(&trans.0);
        debug!("closed log transaction {}", trans);
        Ok(())
    }

    pub fn is_active(&self, trans: TransactionId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.active_transactions.contains_key(&trans.0)
    }

    /// Start a new item for an active transaction. Only one writer per
    /// transaction may be open at a time.
    pub fn open_log_item(&self, trans: TransactionId) -> Option<LogWriter<'_>> {
        let mut inner = self.inner.lock().unwrap();
        let desc = inner.active_transactions.get_mut(&trans.0)?;
        if desc.writer_open {
            return None;
        }
        desc.writer_open = true;

        Some(LogWriter {
            log: self,
            trans,
            buf: BytesMut::new(),
            opening: true,
        })
    }

    /// Enumerate the items of an active transaction, oldest first.
    pub fn enum_log_item(&self, trans: TransactionId) -> Option<LogReader<'_>> {
        let inner = self.inner.lock().unwrap();
        let desc = inner.active_transactions.get(&trans.0)?;
        Some(LogReader {
            log: self,
            trans,
            next_item: desc.first_item,
            first_header: true,
            stream: Bytes::new(),
        })
    }

    /// Enumerate the items of a closed transaction through the address
    /// index.
    pub fn enum_inactive_log_item(&self, trans: TransactionId) -> Option<LogReader<'_>> {
        let inner = self.inner.lock().unwrap();
        if inner.active_transactions.contains_key(&trans.0) {
            return None;
        }
        let first_item = inner.address_index.read_address(&self.bm, trans).ok()?;
        Some(LogReader {
            log: self,
            trans,
            next_item: first_item,
            first_header: true,
            stream: Bytes::new(),
        })
    }

    /// Overwrite one word at an encoded address.
    fn patch_word(&self, address: Pointer, value: u64) -> SmallResult {
        let (page, offset) = self.bm.decode_pointer(address)?;
        let buf = self.bm.lock_page(self.source, page)?;
        buf.wl().set_u64(offset as usize / 8, value);
        self.bm
            .unlock_page(self.source, page, &buf, Persistence::ChangedAndPersist)
    }

    /// Append a finished item to the transaction's block chain. Runs
    /// under the log lock held by the closing writer.
    fn write_item(
        &self,
        inner: &mut LogInner,
        trans: TransactionId,
        payload: &[u8],
    ) -> SmallResult {
        let trans_first_item = {
            let desc = inner
                .active_transactions
                .get(&trans.0)
                .ok_or_else(|| SmallError::new("transaction is not active"))?;
            !desc.first_item.is_valid()
        };

        let total_len = payload.len();
        let mut remaining = total_len;
        let mut written = 0;
        let mut first_block = true;
        let mut item_start = Pointer::INVALID;
        let mut prev_next_word = Pointer::INVALID;

        loop {
            let header_words = if !first_block {
                BLOCK_HEADER_WORDS
            } else if trans_first_item {
                TRANS_HEADER_WORDS
            } else {
                ITEM_HEADER_WORDS
            };
            let header_bytes = header_words * 8;

            // a block has to fit its header plus, while payload remains,
            // at least one payload word
            let needed = header_bytes + if remaining > 0 { 8 } else { 0 };
            let (page, offset) = loop {
                if inner.next_block_address.is_valid() {
                    let (page, offset) = self.bm.decode_pointer(inner.next_block_address)?;
                    if self.page_size - offset as usize >= needed {
                        break (page, offset as usize);
                    }
                    inner.next_block_address = Pointer::INVALID;
                } else {
                    let page = self.bm.allocate_page(self.source)?;
                    inner.next_block_address = self.bm.encode_pointer(page, 0)?;
                }
            };

            let capacity = self.page_size - offset - header_bytes;
            let block_payload = remaining.min(capacity);
            let block_bytes = header_bytes + align_to_word(block_payload);

            let buf = self.bm.lock_page(self.source, page)?;
            {
                let mut buf = buf.wl();
                let word = offset / 8;
                match header_words {
                    TRANS_HEADER_WORDS => {
                        buf.set_u64(word, trans.0);
                        buf.set_u64(word + 1, total_len as u64);
                        buf.set_u64(word + 2, block_payload as u64);
                        buf.set_u64(word + 3, INVALID_WORD);
                    }
                    ITEM_HEADER_WORDS => {
                        buf.set_u64(word, total_len as u64);
                        buf.set_u64(word + 1, block_payload as u64);
                        buf.set_u64(word + 2, INVALID_WORD);
                    }
                    _ => {
                        buf.set_u64(word, block_payload as u64);
                        buf.set_u64(word + 1, INVALID_WORD);
                    }
                }
                buf.write_bytes(
                    offset + header_bytes,
                    &payload[written..written + block_payload],
                );
            }
            self.bm
                .unlock_page(self.source, page, &buf, Persistence::ChangedAndPersist)?;

            let block_address = self.bm.encode_pointer(page, offset as u64)?;
            let next_word_address = self
                .bm
                .encode_pointer(page, (offset + header_bytes - 8) as u64)?;
            if first_block {
                item_start = block_address;
            }
            if prev_next_word.is_valid() {
                self.patch_word(prev_next_word, block_address.0)?;
            }
            prev_next_word = next_word_address;

            let end = offset + block_bytes;
            inner.next_block_address = if end >= self.page_size {
                Pointer::INVALID
            } else {
                self.bm.encode_pointer(page, end as u64)?
            };

            written += block_payload;
            remaining -= block_payload;
            first_block = false;
            if remaining == 0 {
                break;
            }
        }
        debug!(
            "{}: wrote a {} byte item at {}",
            trans, total_len, item_start
        );

        // thread the finished item into the transaction's chain
        if trans_first_item {
            inner.address_index.write_address(&self.bm, trans, item_start)?;
            let desc = inner.active_transactions.get_mut(&trans.0).unwrap();
            desc.first_item = item_start;
        } else {
            let link_from = inner.active_transactions.get(&trans.0).unwrap().last_item;
            self.patch_word(link_from, item_start.0)?;
        }
        inner.active_transactions.get_mut(&trans.0).unwrap().last_item = prev_next_word;
        Ok(())
    }
}

/// Accumulates one item in memory; `close` lays the blocks out on the
/// log pages. Dropping an unclosed writer releases the transaction's
/// writer slot without writing anything.
pub struct LogWriter<'a> {
    log: &'a LogManager,
    trans: TransactionId,
    buf: BytesMut,
    opening: bool,
}

impl<'a> LogWriter<'a> {
    pub fn get_transaction(&self) -> TransactionId {
        self.trans
    }

    pub fn is_opening(&self) -> bool {
        self.opening
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn get_size(&self) -> usize {
        self.buf.len()
    }

    pub fn close(&mut self) -> SmallResult {
        if !self.opening {
            return Err(SmallError::new("the log writer is already closed"));
        }

        let mut inner = self.log.inner.lock().unwrap();
        self.log.write_item(&mut inner, self.trans, &self.buf)?;
        if let Some(desc) = inner.active_transactions.get_mut(&self.trans.0) {
            desc.writer_open = false;
        }
        self.opening = false;
        Ok(())
    }
}

impl<'a> Drop for LogWriter<'a> {
    fn drop(&mut self) {
        if !self.opening {
            return;
        }
        // release the writer slot so the transaction is not wedged
        if let Ok(mut inner) = self.log.inner.lock() {
            if let Some(desc) = inner.active_transactions.get_mut(&self.trans.0) {
                desc.writer_open = false;
            }
        }
    }
}

/// Walks a transaction's items in write order, assembling each item's
/// payload into an in-memory stream.
pub struct LogReader<'a> {
    log: &'a LogManager,
    trans: TransactionId,
    next_item: Pointer,
    first_header: bool,
    stream: Bytes,
}

impl<'a> LogReader<'a> {
    pub fn get_transaction(&self) -> TransactionId {
        self.trans
    }

    /// Advance to the next item. Returns false past the last one.
    pub fn next_item(&mut self) -> Result<bool, SmallError> {
        if !self.next_item.is_valid() {
            return Ok(false);
        }

        let item_address = self.next_item;
        let (page, offset) = self.log.bm.decode_pointer(item_address)?;
        let header_words = if self.first_header {
            TRANS_HEADER_WORDS
        } else {
            ITEM_HEADER_WORDS
        };

        let buf = self.log.bm.lock_page(self.log.source, page)?;
        let (item_len, block_len, mut next) = {
            let buf = buf.rl();
            let word = offset as usize / 8;
            if self.first_header {
                let owner = buf.get_u64(word);
                if owner != self.trans.0 {
                    panic!(
                        "log block chain is corrupted: item at {} belongs to tx_{}, expected {}",
                        item_address, owner, self.trans
                    );
                }
                (buf.get_u64(word + 1), buf.get_u64(word + 2), buf.get_u64(word + 3))
            } else {
                (buf.get_u64(word), buf.get_u64(word + 1), buf.get_u64(word + 2))
            }
        };

        let mut data = BytesMut::with_capacity(item_len as usize);
        data.extend_from_slice(
            buf.rl()
                .read_bytes(offset as usize + header_words * 8, block_len as usize),
        );
        self.log
            .bm
            .unlock_page(self.log.source, page, &buf, Persistence::NoChange)?;

        // follow the continuation blocks until the item is complete
        let mut consumed = block_len;
        while consumed < item_len {
            let block_address = Pointer(next);
            if !block_address.is_valid() {
                panic!(
                    "log block chain is corrupted: item at {} ends after {} of {} bytes",
                    item_address, consumed, item_len
                );
            }

            let (page, offset) = self.log.bm.decode_pointer(block_address)?;
            let buf = self.log.bm.lock_page(self.log.source, page)?;
            let block_len = {
                let buf = buf.rl();
                let word = offset as usize / 8;
                let block_len = buf.get_u64(word);
                next = buf.get_u64(word + 1);
                data.extend_from_slice(buf.read_bytes(
                    offset as usize + BLOCK_HEADER_WORDS * 8,
                    block_len as usize,
                ));
                block_len
            };
            self.log
                .bm
                .unlock_page(self.log.source, page, &buf, Persistence::NoChange)?;

            if block_len == 0 {
                panic!(
                    "log block chain is corrupted: empty continuation block in item at {}",
                    item_address
                );
            }
            consumed += block_len;
        }
        if consumed != item_len {
            panic!(
                "log block chain is corrupted: item at {} carries {} bytes, header says {}",
                item_address, consumed, item_len
            );
        }

        // past the last block of an item, the link leads to the next
        // item (or nowhere yet)
        self.next_item = Pointer(next);
        self.first_header = false;
        self.stream = data.freeze();
        Ok(true)
    }

    pub fn get_stream(&self) -> &Bytes {
        &self.stream
    }

    pub fn get_size(&self) -> usize {
        self.stream.len()
    }
}
