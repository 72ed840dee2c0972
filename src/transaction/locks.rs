use std::collections::HashMap;

use crate::ids::{PageId, Pointer, TableId};

pub const LOCK_MODE_COUNT: usize = 6;

/// The six multi-granularity lock modes. Intent modes announce finer
/// locks further down the hierarchy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LockMode {
    IntentShared,
    Shared,
    Update,
    IntentExclusive,
    SharedIntentExclusive,
    Exclusive,
}

impl LockMode {
    pub const ALL: [LockMode; LOCK_MODE_COUNT] = [
        LockMode::IntentShared,
        LockMode::Shared,
        LockMode::Update,
        LockMode::IntentExclusive,
        LockMode::SharedIntentExclusive,
        LockMode::Exclusive,
    ];

    pub fn index(self) -> usize {
        match self {
            LockMode::IntentShared => 0,
            LockMode::Shared => 1,
            LockMode::Update => 2,
            LockMode::IntentExclusive => 3,
            LockMode::SharedIntentExclusive => 4,
            LockMode::Exclusive => 5,
        }
    }

    /// Whether a request in this mode may coexist with a lock already
    /// held in `existing` mode.
    pub fn is_compatible_with(self, existing: LockMode) -> bool {
        COMPATIBILITY[self.index()][existing.index()]
    }
}

// rows: requested mode, columns: existing mode
// order: IS, S, U, IX, SIX, X
const COMPATIBILITY: [[bool; LOCK_MODE_COUNT]; LOCK_MODE_COUNT] = [
    [true, true, true, true, true, false],
    [true, true, true, false, false, false],
    [true, true, false, false, false, false],
    [true, false, false, true, false, false],
    [true, false, false, false, false, false],
    [false, false, false, false, false, false],
];

/// What a lock attaches to: a whole table, one page of it, or a single
/// row addressed by an encoded pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockObject {
    Table,
    Page(PageId),
    Row(Pointer),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LockTarget {
    pub table: TableId,
    pub object: LockObject,
    pub access: LockMode,
}

impl LockTarget {
    pub fn table(table: TableId, access: LockMode) -> Self {
        Self {
            table,
            object: LockObject::Table,
            access,
        }
    }

    pub fn page(table: TableId, page: PageId, access: LockMode) -> Self {
        Self {
            table,
            object: LockObject::Page(page),
            access,
        }
    }

    pub fn row(table: TableId, address: Pointer, access: LockMode) -> Self {
        Self {
            table,
            object: LockObject::Row(address),
            access,
        }
    }

    /// Same locked object, ignoring the access mode.
    pub fn same_object(&self, other: &LockTarget) -> bool {
        self.table == other.table && self.object == other.object
    }
}

pub(crate) type AcquiredCounts = [u64; LOCK_MODE_COUNT];

/// Whether a request conflicts with the locks already acquired on an
/// object.
pub(crate) fn conflicts(acquired: &AcquiredCounts, request: LockMode) -> bool {
    for existing in LockMode::ALL.iter() {
        if acquired[existing.index()] > 0 && !request.is_compatible_with(*existing) {
            return true;
        }
    }
    false
}

pub(crate) struct RowLockInfo {
    pub acquired: AcquiredCounts,
}

impl RowLockInfo {
    pub fn new() -> Self {
        Self {
            acquired: [0; LOCK_MODE_COUNT],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.acquired.iter().all(|&count| count == 0)
    }
}

pub(crate) struct PageLockInfo {
    pub row_locks: HashMap<u64, RowLockInfo>,
    pub acquired: AcquiredCounts,
}

impl PageLockInfo {
    pub fn new() -> Self {
        Self {
            row_locks: HashMap::new(),
            acquired: [0; LOCK_MODE_COUNT],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.row_locks.is_empty() && self.acquired.iter().all(|&count| count == 0)
    }
}

pub(crate) struct TableLockInfo {
    pub page_locks: HashMap<u64, PageLockInfo>,
    pub acquired: AcquiredCounts,
}

impl TableLockInfo {
    pub fn new() -> Self {
        Self {
            page_locks: HashMap::new(),
            acquired: [0; LOCK_MODE_COUNT],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.page_locks.is_empty() && self.acquired.iter().all(|&count| count == 0)
    }
}
