use core::fmt;
use std::{
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::types::Pod;

/// A page-sized byte buffer, the unit of I/O and allocation.
///
/// The bookkeeping structures (use-mask chain, free-item chain, log
/// blocks) store little-endian u64 words, so the buffer exposes word
/// accessors next to the raw byte access.
pub struct PageBuffer {
    data: Vec<u8>,
}

impl PageBuffer {
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0; page_size],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read the `word`-th little-endian u64 of the page.
    pub fn get_u64(&self, word: usize) -> u64 {
        let start = word * 8;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[start..start + 8]);
        u64::from_le_bytes(bytes)
    }

    /// Overwrite the `word`-th little-endian u64 of the page.
    pub fn set_u64(&mut self, word: usize, value: u64) {
        let start = word * 8;
        self.data[start..start + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn fill_zero(&mut self) {
        for b in self.data.iter_mut() {
            *b = 0;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let prefix = &self.data[..self.data.len().min(16)];
        write!(f, "PageBuffer<{} bytes, {}...>", self.data.len(), hex::encode(prefix))
    }
}

/// Metadata of a resident page.
///
/// The buffer is shared out to the caller while the page is locked, so
/// it sits behind a `Pod`; the flags are only touched under the owning
/// source's lock.
pub struct PageDesc {
    pub buf: Pod<PageBuffer>,
    pub last_access_time: u64,
    pub locked: bool,
    pub dirty: bool,
}

impl PageDesc {
    pub fn new(buf: PageBuffer) -> Self {
        Self {
            buf: Arc::new(RwLock::new(buf)),
            last_access_time: unix_time_secs(),
            locked: false,
            dirty: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_access_time = unix_time_secs();
    }
}

/// Wall-clock seconds, the (coarse) currency of the LRU policy.
pub fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}
