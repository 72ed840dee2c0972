use core::fmt;

/// The sentinel used by every handle and by on-page link words: all bits
/// set means "no such object".
pub(crate) const INVALID_WORD: u64 = u64::MAX;

macro_rules! impl_id {
    ($name:ident, $repr:ty, $prefix:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub $repr);

        impl $name {
            pub const INVALID: $name = $name(<$repr>::MAX);

            pub fn is_valid(&self) -> bool {
                self.0 != <$repr>::MAX
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if self.is_valid() {
                    write!(f, concat!($prefix, "{}"), self.0)
                } else {
                    write!(f, concat!($prefix, "invalid"))
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self)
            }
        }
    };
}

impl_id!(SourceId, u32, "source_");
impl_id!(PageId, u64, "page_");
impl_id!(TableId, u32, "table_");
impl_id!(TransactionId, u64, "tx_");

/// A page index and an in-page offset packed into one word. The low
/// `log2(page_size)` bits hold the offset, the high bits hold the page
/// index. Encoding and decoding live on `BufferPool` since the split
/// depends on the configured page size.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pointer(pub u64);

impl Pointer {
    pub const INVALID: Pointer = Pointer(u64::MAX);

    pub fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_valid() {
            write!(f, "ptr_{:#x}", self.0)
        } else {
            write!(f, "ptr_invalid")
        }
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// The three pages every source starts with. They are never handed out
/// by the allocator and never accepted by the free primitive.
pub const RESERVED_PAGE_USE_MASK: PageId = PageId(0);
pub const RESERVED_PAGE_FREE_ITEM: PageId = PageId(1);
pub const RESERVED_PAGE_INDEX: PageId = PageId(2);

pub(crate) const RESERVED_PAGE_COUNT: u64 = 3;
