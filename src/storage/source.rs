use crate::{
    error::SmallError,
    ids::{PageId, SourceId},
    storage::page::PageBuffer,
    types::{Pod, ResultPod, SmallResult},
};

/// What to do with a page's bytes when the caller hands it back.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Persistence {
    /// The caller did not modify the page.
    NoChange,
    /// The page was modified; flush it lazily (on eviction or unload).
    Changed,
    /// The page was modified; flush it to the backing store right away.
    ChangedAndPersist,
}

/// An unlocked resident page, tagged with its last access time so the
/// pool can order eviction candidates across sources.
#[derive(Clone, Copy, Debug)]
pub struct CandidatePage {
    pub source: SourceId,
    pub page: PageId,
    pub last_access_time: u64,
}

/// A backing store hosting fixed-size pages.
///
/// Two implementations exist: `MemorySource` (anonymous, appendable
/// buffers) and `FileSource` (the on-disk layout with use-mask and
/// free-item chains). The pool only talks to this capability set and
/// never to the implementations directly.
pub trait PageSource: Send + Sync {
    fn get_source_id(&self) -> SourceId;

    /// The backing file path, `None` for an anonymous source.
    fn get_file_name(&self) -> Option<String>;

    fn get_index_page(&self) -> PageId;

    fn allocate_page(&self) -> Result<PageId, SmallError>;

    fn free_page(&self, page: PageId) -> SmallResult;

    fn lock_page(&self, page: PageId) -> ResultPod<PageBuffer>;

    fn unlock_page(
        &self,
        page: PageId,
        buf: &Pod<PageBuffer>,
        persistence: Persistence,
    ) -> SmallResult;

    /// Drop a page's mapping, flushing first when dirty. Fails for a
    /// locked page and for sources that cannot spill (memory).
    fn unmap_page(&self, page: PageId) -> SmallResult;

    /// Up to `expect_count` unlocked resident pages, oldest first.
    fn fill_unmap_candidates(&self, expect_count: usize) -> Vec<CandidatePage>;

    /// Flush everything and release all mappings.
    fn unload(&self) -> SmallResult;
}
