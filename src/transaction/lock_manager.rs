use core::fmt;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use log::{debug, info};

use crate::{
    error::SmallError,
    ids::{SourceId, TableId, TransactionId},
    storage::BufferPool,
    transaction::locks::{
        conflicts, AcquiredCounts, LockMode, LockObject, LockTarget, PageLockInfo, RowLockInfo,
        TableLockInfo,
    },
    transaction::wait_for_graph::WaitForGraph,
    types::SmallResult,
};

/// The outcome of a (syntactically valid) lock request. A blocked
/// request is still a successful call: the conflict was recorded and
/// the transaction waits in the pending queue.
#[derive(Clone, Copy, Debug)]
pub struct LockResult {
    pub blocked: bool,
}

#[derive(Debug)]
pub struct DeadlockInfo {
    pub involved_transactions: Vec<TransactionId>,
    pub rollback_transaction: TransactionId,
}

struct TableInfo {
    #[allow(dead_code)]
    source: SourceId,
}

struct TransInfo {
    importance: u64,
    acquired_locks: Vec<LockTarget>,
    pending_lock: Option<LockTarget>,
}

/// One queue of waiting transactions per importance level, with a
/// round-robin cursor for fairness inside the level.
struct PendingInfo {
    transactions: Vec<u64>,
    last_try_index: usize,
}

impl PendingInfo {
    fn new() -> Self {
        Self {
            transactions: Vec::new(),
            last_try_index: 0,
        }
    }
}

struct LockInner {
    tables: HashMap<u32, TableInfo>,
    transactions: HashMap<u64, TransInfo>,
    table_locks: HashMap<u32, TableLockInfo>,
    pending: BTreeMap<u64, PendingInfo>,
}

/// The hierarchical lock table.
///
/// Locks target tables, pages or rows; the per-object state is a count
/// of acquired locks per mode, and lock-info nodes are created lazily
/// and reaped as soon as they hold nothing. Conflicting requests never
/// block the calling thread: they come back with `blocked = true` and
/// are retried through `pick_transaction`.
pub struct LockManager {
    bm: Arc<BufferPool>,
    inner: Mutex<LockInner>,
}

impl LockManager {
    pub fn new(bm: Arc<BufferPool>) -> Self {
        Self {
            bm,
            inner: Mutex::new(LockInner {
                tables: HashMap::new(),
                transactions: HashMap::new(),
                table_locks: HashMap::new(),
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Register a table living in `source`. The source has to be loaded
    /// in the buffer manager.
    pub fn register_table(&self, table: TableId, source: SourceId) -> SmallResult {
        if !table.is_valid() {
            return Err(SmallError::new("invalid table"));
        }
        // an unknown source has no index page
        self.bm.get_index_page(source)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.tables.contains_key(&table.0) {
            return Err(SmallError::new("table is already registered"));
        }
        inner.tables.insert(table.0, TableInfo { source });
        Ok(())
    }

    pub fn unregister_table(&self, table: TableId) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();
        if !inner.tables.contains_key(&table.0) {
            return Err(SmallError::new("table is not registered"));
        }
        let has_locks = inner
            .table_locks
            .get(&table.0)
            .map(|info| !info.is_empty())
            .unwrap_or(false);
        if has_locks {
            return Err(SmallError::new("table still has locks"));
        }

        inner.tables.remove(&table.0);
        inner.table_locks.remove(&table.0);
        Ok(())
    }

    pub fn register_transaction(&self, trans: TransactionId, importance: u64) -> SmallResult {
        if !trans.is_valid() {
            return Err(SmallError::new("invalid transaction"));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.transactions.contains_key(&trans.0) {
            return Err(SmallError::new("transaction is already registered"));
        }
        inner.transactions.insert(
            trans.0,
            TransInfo {
                importance,
                acquired_locks: Vec::new(),
                pending_lock: None,
            },
        );
        Ok(())
    }

    /// Unregistration requires the transaction to hold nothing and wait
    /// for nothing.
    pub fn unregister_transaction(&self, trans: TransactionId) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();
        let info = match inner.transactions.get(&trans.0) {
            Some(info) => info,
            None => return Err(SmallError::new("transaction is not registered")),
        };
        if !info.acquired_locks.is_empty() {
            return Err(SmallError::new("transaction still holds locks"));
        }
        if info.pending_lock.is_some() {
            return Err(SmallError::new("transaction still has a pending lock"));
        }

        inner.transactions.remove(&trans.0);
        Ok(())
    }

    /// Request a lock. A conflicting request succeeds with
    /// `blocked = true` and is parked in the pending queue under the
    /// transaction's importance, as long as the transaction has no
    /// other pending lock.
    pub fn acquire_lock(
        &self,
        trans: TransactionId,
        target: &LockTarget,
    ) -> Result<LockResult, SmallError> {
        let mut inner = self.inner.lock().unwrap();
        check_input(&inner, trans, target)?;

        let result = self.acquire_internal(&mut inner, trans, target, true)?;
        if result.blocked {
            debug!("{} blocked on {:?}", trans, target);
        }
        Ok(result)
    }

    /// Give back an acquired lock, or cancel a pending request for the
    /// same target.
    pub fn release_lock(&self, trans: TransactionId, target: &LockTarget) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();
        check_input(&inner, trans, target)?;

        let position = inner.transactions[&trans.0]
            .acquired_locks
            .iter()
            .position(|held| held == target);
        if let Some(position) = position {
            inner
                .transactions
                .get_mut(&trans.0)
                .unwrap()
                .acquired_locks
                .remove(position);
            self.release_target(&mut inner, target);
            return Ok(());
        }

        if inner.transactions[&trans.0].pending_lock.as_ref() == Some(target) {
            let importance = inner.transactions[&trans.0].importance;
            inner.transactions.get_mut(&trans.0).unwrap().pending_lock = None;
            remove_pending(&mut inner, importance, trans.0);
            return Ok(());
        }

        Err(SmallError::new("the transaction does not hold the lock"))
    }

    /// Switch an acquired lock to another mode in one step. Equivalent
    /// to release-then-acquire, but no other transaction can slip in
    /// between.
    pub fn upgrade_lock(
        &self,
        trans: TransactionId,
        old_target: &LockTarget,
        new_access: LockMode,
    ) -> Result<LockResult, SmallError> {
        let mut inner = self.inner.lock().unwrap();
        check_input(&inner, trans, old_target)?;

        let position = inner.transactions[&trans.0]
            .acquired_locks
            .iter()
            .position(|held| held == old_target);
        let position = match position {
            Some(position) => position,
            None => return Err(SmallError::new("the transaction does not hold the lock")),
        };

        inner
            .transactions
            .get_mut(&trans.0)
            .unwrap()
            .acquired_locks
            .remove(position);
        self.release_target(&mut inner, old_target);

        let new_target = LockTarget {
            access: new_access,
            ..*old_target
        };
        self.acquire_internal(&mut inner, trans, &new_target, true)
    }

    /// Scan the pending queues, most important first and round-robin
    /// within a level, and grant the first request that no longer
    /// conflicts. Returns the transaction that got its lock.
    pub fn pick_transaction(&self) -> Option<TransactionId> {
        let mut inner = self.inner.lock().unwrap();

        let importances: Vec<u64> = inner.pending.keys().rev().cloned().collect();
        for importance in importances {
            let (count, start) = {
                let group = &inner.pending[&importance];
                let count = group.transactions.len();
                (count, (group.last_try_index + 1) % count)
            };

            for step in 0..count {
                let index = (start + step) % count;
                let trans = inner.pending[&importance].transactions[index];
                let target = inner.transactions[&trans]
                    .pending_lock
                    .expect("scheduler structure mismatch: a pending transaction waits for nothing");

                let granted = match self.try_acquire(&mut inner, &target) {
                    Ok(granted) => granted,
                    Err(_) => false,
                };
                if !granted {
                    self.prune_path(&mut inner, &target);
                    inner.pending.get_mut(&importance).unwrap().last_try_index = index;
                    continue;
                }

                {
                    let info = inner.transactions.get_mut(&trans).unwrap();
                    info.acquired_locks.push(target);
                    info.pending_lock = None;
                }
                let emptied = {
                    let group = inner.pending.get_mut(&importance).unwrap();
                    group.transactions.remove(index);
                    if group.transactions.is_empty() {
                        true
                    } else {
                        // the next scan resumes after the removed slot
                        group.last_try_index = if index == 0 {
                            group.transactions.len() - 1
                        } else {
                            index - 1
                        };
                        false
                    }
                };
                if emptied {
                    inner.pending.remove(&importance);
                }

                info!("scheduler granted {:?} to {}", target, TransactionId(trans));
                return Some(TransactionId(trans));
            }
        }
        None
    }

    /// Build the wait-for graph over the pending transactions and
    /// report every deadlock with its rollback victim. The graph is
    /// discarded before returning.
    pub fn detect_deadlock(&self) -> Vec<DeadlockInfo> {
        let inner = self.inner.lock().unwrap();

        let mut graph = WaitForGraph::new();
        for (&pending, pending_info) in inner.transactions.iter() {
            let target = match pending_info.pending_lock {
                Some(target) => target,
                None => continue,
            };
            graph.add_node(pending);

            for (&holder, holder_info) in inner.transactions.iter() {
                if holder == pending {
                    continue;
                }
                let waits = holder_info.acquired_locks.iter().any(|held| {
                    held.same_object(&target) && !target.access.is_compatible_with(held.access)
                });
                if waits {
                    graph.add_edge(pending, holder);
                }
            }
        }

        let mut infos = Vec::new();
        for (cycle, victim) in graph.extract_cycles() {
            info!(
                "deadlock among {:?}, rolling back {}",
                cycle.iter().map(|&t| TransactionId(t)).collect::<Vec<_>>(),
                TransactionId(victim)
            );
            infos.push(DeadlockInfo {
                involved_transactions: cycle.into_iter().map(TransactionId).collect(),
                rollback_transaction: TransactionId(victim),
            });
        }
        infos
    }

    /// Release everything a transaction holds, newest lock first, and
    /// drop its pending request. The transaction stays registered.
    pub fn rollback(&self, trans: TransactionId) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();
        if !inner.transactions.contains_key(&trans.0) {
            return Err(SmallError::new("transaction is not registered"));
        }

        let targets = {
            let info = inner.transactions.get_mut(&trans.0).unwrap();
            std::mem::replace(&mut info.acquired_locks, Vec::new())
        };
        for target in targets.iter().rev() {
            self.release_target(&mut inner, target);
        }

        let (pending, importance) = {
            let info = inner.transactions.get_mut(&trans.0).unwrap();
            (info.pending_lock.take(), info.importance)
        };
        if pending.is_some() {
            remove_pending(&mut inner, importance, trans.0);
        }

        info!("rolled back {}", trans);
        Ok(())
    }

    pub fn table_has_locks(&self, table: TableId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .table_locks
            .get(&table.0)
            .map(|info| !info.is_empty())
            .unwrap_or(false)
    }

    /// Descend to the target's lock-info node, creating missing nodes,
    /// and try to take the lock there. Returns whether it was granted;
    /// a granted lock has its per-mode count bumped.
    fn try_acquire(
        &self,
        inner: &mut LockInner,
        target: &LockTarget,
    ) -> Result<bool, SmallError> {
        let table_lock = inner
            .table_locks
            .entry(target.table.0)
            .or_insert_with(TableLockInfo::new);

        let acquired: &mut AcquiredCounts = match target.object {
            LockObject::Table => &mut table_lock.acquired,
            LockObject::Page(page) => {
                &mut table_lock
                    .page_locks
                    .entry(page.0)
                    .or_insert_with(PageLockInfo::new)
                    .acquired
            }
            LockObject::Row(address) => {
                let (page, offset) = self.bm.decode_pointer(address)?;
                &mut table_lock
                    .page_locks
                    .entry(page.0)
                    .or_insert_with(PageLockInfo::new)
                    .row_locks
                    .entry(offset)
                    .or_insert_with(RowLockInfo::new)
                    .acquired
            }
        };

        if conflicts(acquired, target.access) {
            return Ok(false);
        }
        acquired[target.access.index()] += 1;
        Ok(true)
    }

    fn acquire_internal(
        &self,
        inner: &mut LockInner,
        trans: TransactionId,
        target: &LockTarget,
        register_pending: bool,
    ) -> Result<LockResult, SmallError> {
        if self.try_acquire(inner, target)? {
            inner
                .transactions
                .get_mut(&trans.0)
                .expect("scheduler structure mismatch: the transaction vanished")
                .acquired_locks
                .push(*target);
            return Ok(LockResult { blocked: false });
        }

        // the descent may have created empty nodes on the losing path
        self.prune_path(inner, target);

        if register_pending {
            let importance = {
                let info = inner.transactions.get_mut(&trans.0).unwrap();
                if info.pending_lock.is_some() {
                    return Err(SmallError::new(
                        "transaction already has a pending lock",
                    ));
                }
                info.pending_lock = Some(*target);
                info.importance
            };
            inner
                .pending
                .entry(importance)
                .or_insert_with(PendingInfo::new)
                .transactions
                .push(trans.0);
        }
        Ok(LockResult { blocked: true })
    }

    /// Undo one acquired lock: decrement the mode count on the target's
    /// node and unlink every node left empty, bottom up.
    fn release_target(&self, inner: &mut LockInner, target: &LockTarget) {
        let table_lock = inner
            .table_locks
            .get_mut(&target.table.0)
            .expect("lock table is corrupted: no node for an acquired lock");
        let mode = target.access.index();

        match target.object {
            LockObject::Table => {
                assert!(
                    table_lock.acquired[mode] > 0,
                    "lock table is corrupted: released more table locks than acquired"
                );
                table_lock.acquired[mode] -= 1;
            }
            LockObject::Page(page) => {
                let page_lock = table_lock
                    .page_locks
                    .get_mut(&page.0)
                    .expect("lock table is corrupted: no node for an acquired page lock");
                assert!(
                    page_lock.acquired[mode] > 0,
                    "lock table is corrupted: released more page locks than acquired"
                );
                page_lock.acquired[mode] -= 1;
                if page_lock.is_empty() {
                    table_lock.page_locks.remove(&page.0);
                }
            }
            LockObject::Row(address) => {
                let (page, offset) = self
                    .bm
                    .decode_pointer(address)
                    .expect("lock table is corrupted: an acquired row lock does not decode");
                let page_lock = table_lock
                    .page_locks
                    .get_mut(&page.0)
                    .expect("lock table is corrupted: no node for an acquired row lock");
                let row_lock = page_lock
                    .row_locks
                    .get_mut(&offset)
                    .expect("lock table is corrupted: no node for an acquired row lock");
                assert!(
                    row_lock.acquired[mode] > 0,
                    "lock table is corrupted: released more row locks than acquired"
                );
                row_lock.acquired[mode] -= 1;
                if row_lock.is_empty() {
                    page_lock.row_locks.remove(&offset);
                }
                if page_lock.is_empty() {
                    table_lock.page_locks.remove(&page.0);
                }
            }
        }

        if table_lock.is_empty() {
            inner.table_locks.remove(&target.table.0);
        }
    }

    /// Drop empty lock-info nodes along the target's path.
    fn prune_path(&self, inner: &mut LockInner, target: &LockTarget) {
        let table_lock = match inner.table_locks.get_mut(&target.table.0) {
            Some(table_lock) => table_lock,
            None => return,
        };

        match target.object {
            LockObject::Table => {}
            LockObject::Page(page) => {
                let empty = table_lock
                    .page_locks
                    .get(&page.0)
                    .map(|info| info.is_empty())
                    .unwrap_or(false);
                if empty {
                    table_lock.page_locks.remove(&page.0);
                }
            }
            LockObject::Row(address) => {
                if let Ok((page, offset)) = self.bm.decode_pointer(address) {
                    if let Some(page_lock) = table_lock.page_locks.get_mut(&page.0) {
                        let empty = page_lock
                            .row_locks
                            .get(&offset)
                            .map(|info| info.is_empty())
                            .unwrap_or(false);
                        if empty {
                            page_lock.row_locks.remove(&offset);
                        }
                        if page_lock.is_empty() {
                            table_lock.page_locks.remove(&page.0);
                        }
                    }
                }
            }
        }

        if table_lock.is_empty() {
            inner.table_locks.remove(&target.table.0);
        }
    }
}

impl fmt::Display for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        let mut depiction = "\n".to_string();

        depiction.push_str("table_locks: {");
        for (table, info) in inner.table_locks.iter() {
            depiction.push_str(&format!(
                "\n\t{} -> [acquired: {:?}, pages: {}]",
                TableId(*table),
                info.acquired,
                info.page_locks.len()
            ));
        }
        depiction.push_str("\n}\n");

        depiction.push_str("transactions: {");
        for (trans, info) in inner.transactions.iter() {
            depiction.push_str(&format!(
                "\n\t{} -> [importance: {}, acquired: {}, pending: {:?}]",
                TransactionId(*trans),
                info.importance,
                info.acquired_locks.len(),
                info.pending_lock
            ));
        }
        depiction.push_str("\n}\n");

        depiction.push_str("pending: {");
        for (importance, group) in inner.pending.iter().rev() {
            depiction.push_str(&format!(
                "\n\t{} -> {:?}",
                importance,
                group
                    .transactions
                    .iter()
                    .map(|&t| TransactionId(t))
                    .collect::<Vec<_>>()
            ));
        }
        depiction.push_str("\n}\n");

        write!(f, "{}", depiction)
    }
}

fn check_input(inner: &LockInner, trans: TransactionId, target: &LockTarget) -> SmallResult {
    if !trans.is_valid() {
        return Err(SmallError::new("invalid transaction"));
    }
    if !target.table.is_valid() {
        return Err(SmallError::new("invalid table"));
    }
    match target.object {
        LockObject::Page(page) if !page.is_valid() => {
            return Err(SmallError::new("invalid page"));
        }
        LockObject::Row(address) if !address.is_valid() => {
            return Err(SmallError::new("invalid row pointer"));
        }
        _ => {}
    }

    if !inner.transactions.contains_key(&trans.0) {
        return Err(SmallError::new("transaction is not registered"));
    }
    if !inner.tables.contains_key(&target.table.0) {
        return Err(SmallError::new("table is not registered"));
    }
    Ok(())
}

fn remove_pending(inner: &mut LockInner, importance: u64, trans: u64) {
    let emptied = if let Some(group) = inner.pending.get_mut(&importance) {
        if let Some(position) = group.transactions.iter().position(|&t| t == trans) {
            group.transactions.remove(position);
            if !group.transactions.is_empty() && group.last_try_index >= group.transactions.len()
            {
                group.last_try_index = 0;
            }
        }
        group.transactions.is_empty()
    } else {
        false
    };
    if emptied {
        inner.pending.remove(&importance);
    }
}
