//! In-memory transactions for testing.
//!
//! Stores stage their writes on the [`MemoryTransaction`]; the writes are
//! applied in order on commit and dropped on rollback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use outbox_core::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionResult, Transactor, TxContext,
};
use parking_lot::Mutex;

type StagedWrite = Box<dyn FnOnce() + Send>;

/// In-memory transaction collecting staged writes.
pub struct MemoryTransaction {
    isolation: IsolationLevel,
    staged: Vec<StagedWrite>,
    completed: bool,
    stats: Arc<Stats>,
}

impl MemoryTransaction {
    pub fn isolation(&self) -> &IsolationLevel {
        &self.isolation
    }

    /// Queues `write` to run on commit.
    ///
    /// # Errors
    ///
    /// [`TransactionError::AlreadyCompleted`] after commit or rollback.
    pub fn stage(&mut self, write: impl FnOnce() + Send + 'static) -> TransactionResult<()> {
        if self.completed {
            return Err(TransactionError::AlreadyCompleted);
        }
        self.staged.push(Box::new(write));
        Ok(())
    }

    pub fn staged_writes(&self) -> usize {
        self.staged.len()
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(&mut self) -> TransactionResult<()> {
        if self.completed {
            return Err(TransactionError::AlreadyCompleted);
        }
        self.completed = true;
        if self.stats.fail_commit.load(Ordering::SeqCst) {
            self.staged.clear();
            return Err(TransactionError::Commit("injected commit failure".to_string()));
        }
        for write in self.staged.drain(..) {
            write();
        }
        self.stats.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> TransactionResult<()> {
        if self.completed {
            return Err(TransactionError::AlreadyCompleted);
        }
        self.completed = true;
        self.staged.clear();
        self.stats.rolled_back.fetch_add(1, Ordering::SeqCst);
        if self.stats.fail_rollback.load(Ordering::SeqCst) {
            return Err(TransactionError::Database(
                "injected rollback failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Stats {
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    isolation_levels: Mutex<Vec<IsolationLevel>>,
}

/// In-memory transactor with counters and failure injection.
#[derive(Clone, Default)]
pub struct MemoryTransactor {
    stats: Arc<Stats>,
}

impl MemoryTransactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begun(&self) -> usize {
        self.stats.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> usize {
        self.stats.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> usize {
        self.stats.rolled_back.load(Ordering::SeqCst)
    }

    /// Isolation levels requested, in begin order.
    pub fn isolation_levels(&self) -> Vec<IsolationLevel> {
        self.stats.isolation_levels.lock().clone()
    }

    pub fn fail_begin(&self, fail: bool) {
        self.stats.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.stats.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.stats.fail_rollback.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transactor for MemoryTransactor {
    type Tx = MemoryTransaction;

    async fn begin(&self, isolation: &IsolationLevel) -> TransactionResult<MemoryTransaction> {
        if self.stats.fail_begin.load(Ordering::SeqCst) {
            return Err(TransactionError::Begin("injected begin failure".to_string()));
        }
        if let IsolationLevel::Other(level) = isolation {
            return Err(TransactionError::Begin(format!(
                "unsupported isolation level: {level}"
            )));
        }
        self.stats.begun.fetch_add(1, Ordering::SeqCst);
        self.stats.isolation_levels.lock().push(isolation.clone());
        Ok(MemoryTransaction {
            isolation: isolation.clone(),
            staged: Vec::new(),
            completed: false,
            stats: Arc::clone(&self.stats),
        })
    }
}

/// Runs `write` on commit of the context transaction, or immediately when
/// the context carries none.
pub(crate) async fn apply_or_stage(
    ctx: &TxContext<MemoryTransaction>,
    write: impl FnOnce() + Send + 'static,
) -> TransactionResult<()> {
    match ctx.transaction() {
        Some(shared) => shared.lock().await.stage(write),
        None => {
            write();
            Ok(())
        }
    }
}
