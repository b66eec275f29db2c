use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct Counters {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.begins.load(Ordering::SeqCst),
            self.commits.load(Ordering::SeqCst),
            self.rollbacks.load(Ordering::SeqCst),
        )
    }
}

struct MockTx {
    counters: Arc<Counters>,
    fail_commit: bool,
    fail_rollback: bool,
}

#[async_trait]
impl Transaction for MockTx {
    async fn commit(&mut self) -> TransactionResult<()> {
        if self.fail_commit {
            return Err(TransactionError::Database("connection reset".to_string()));
        }
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> TransactionResult<()> {
        if self.fail_rollback {
            return Err(TransactionError::Database("connection reset".to_string()));
        }
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockTransactor {
    counters: Arc<Counters>,
    fail_commit: bool,
    fail_rollback: bool,
}

#[async_trait]
impl Transactor for MockTransactor {
    type Tx = MockTx;

    async fn begin(&self, isolation: &IsolationLevel) -> TransactionResult<MockTx> {
        if let IsolationLevel::Other(level) = isolation {
            return Err(TransactionError::Database(format!(
                "unrecognized isolation level \"{level}\""
            )));
        }
        self.counters.begins.fetch_add(1, Ordering::SeqCst);
        Ok(MockTx {
            counters: Arc::clone(&self.counters),
            fail_commit: self.fail_commit,
            fail_rollback: self.fail_rollback,
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("order rejected: {0}")]
struct OrderRejected(String);

fn setup(transactor: MockTransactor) -> (TransactionManager<MockTransactor>, Arc<Counters>) {
    let counters = Arc::clone(&transactor.counters);
    (TransactionManager::new(transactor), counters)
}

#[tokio::test]
async fn test_commits_when_work_succeeds() {
    let (manager, counters) = setup(MockTransactor::default());

    let result = manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |ctx| async move {
            assert!(ctx.has_transaction());
            Ok::<_, OrderRejected>(42)
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(counters.snapshot(), (1, 1, 0));
}

#[tokio::test]
async fn test_rolls_back_and_keeps_original_error() {
    let (manager, counters) = setup(MockTransactor::default());

    let err = manager
        .execute_tx(&TxContext::none(), IsolationLevel::Serializable, |_ctx| async move {
            Err::<(), _>(OrderRejected("out of stock".to_string()))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::Work(_)));
    let original = err.work_error::<OrderRejected>().expect("original error kept");
    assert_eq!(original.0, "out of stock");
    assert_eq!(counters.snapshot(), (1, 0, 1));
}

#[tokio::test]
async fn test_nested_calls_share_one_transaction() {
    let (manager, counters) = setup(MockTransactor::default());
    let inner_manager = manager.clone();

    manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |ctx| async move {
            let outer_tx = Arc::clone(ctx.transaction().unwrap());
            inner_manager
                .execute_tx(&ctx, IsolationLevel::Serializable, |inner_ctx| async move {
                    assert!(Arc::ptr_eq(&outer_tx, inner_ctx.transaction().unwrap()));
                    Ok::<_, OrderRejected>(())
                })
                .await
        })
        .await
        .unwrap();

    assert_eq!(counters.snapshot(), (1, 1, 0));
}

#[tokio::test]
async fn test_nested_failure_rolls_back_once_at_outer_level() {
    let (manager, counters) = setup(MockTransactor::default());
    let inner_manager = manager.clone();

    let err = manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |ctx| async move {
            inner_manager
                .execute_tx(&ctx, IsolationLevel::ReadCommitted, |_| async move {
                    Err::<(), _>(OrderRejected("inner".to_string()))
                })
                .await?;
            Ok::<_, TransactionError>(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.work_error::<OrderRejected>().unwrap().0, "inner");
    assert_eq!(counters.snapshot(), (1, 0, 1));
}

#[tokio::test]
async fn test_panic_is_recovered_and_rolled_back() {
    let (manager, counters) = setup(MockTransactor::default());

    let err = manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |_ctx| async move {
            if std::hint::black_box(true) {
                panic!("inventory invariant broken");
            }
            Ok::<_, OrderRejected>(())
        })
        .await
        .unwrap_err();

    assert!(err.is_panic());
    assert!(err.to_string().contains("inventory invariant broken"));
    assert_eq!(err.category(), ErrorCategory::Panic);
    assert_eq!(counters.snapshot(), (1, 0, 1));
}

#[tokio::test]
async fn test_panic_while_building_future_is_recovered() {
    let (manager, counters) = setup(MockTransactor::default());

    let err = manager
        .execute_tx(
            &TxContext::none(),
            IsolationLevel::ReadCommitted,
            |_ctx| -> std::future::Ready<Result<(), OrderRejected>> {
                panic!("{}", String::from("eager panic"))
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::Panic { ref message } if message == "eager panic"));
    assert_eq!(counters.snapshot(), (1, 0, 1));
}

#[tokio::test]
async fn test_panic_in_nested_call_rolls_back_outer_transaction() {
    let (manager, counters) = setup(MockTransactor::default());
    let inner_manager = manager.clone();

    let err = manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |ctx| async move {
            inner_manager
                .execute_tx(&ctx, IsolationLevel::ReadCommitted, |_| async move {
                    if std::hint::black_box(true) {
                        panic!("nested");
                    }
                    Ok::<_, OrderRejected>(())
                })
                .await
        })
        .await
        .unwrap_err();

    assert!(err.is_panic());
    assert_eq!(counters.snapshot(), (1, 0, 1));
}

#[tokio::test]
async fn test_commit_failure_is_reported() {
    let (manager, counters) = setup(MockTransactor {
        fail_commit: true,
        ..Default::default()
    });

    let err = manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |_| async move {
            Ok::<_, OrderRejected>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::Commit(ref reason) if reason.contains("connection reset")));
    assert_eq!(counters.snapshot(), (1, 0, 0));
}

#[tokio::test]
async fn test_rollback_failure_is_merged_into_error() {
    let (manager, _counters) = setup(MockTransactor {
        fail_rollback: true,
        ..Default::default()
    });

    let err = manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |_| async move {
            Err::<(), _>(OrderRejected("bad input".to_string()))
        })
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("bad input"));
    assert!(message.contains("rollback failed"));
    assert_eq!(err.work_error::<OrderRejected>().unwrap().0, "bad input");
}

#[tokio::test]
async fn test_invalid_isolation_level_fails_at_begin() {
    let (manager, counters) = setup(MockTransactor::default());
    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_in_work = Arc::clone(&invoked);

    let err = manager
        .execute_tx(
            &TxContext::none(),
            "snapshot".parse().unwrap(),
            |_| async move {
                invoked_in_work.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OrderRejected>(())
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::Begin(ref reason) if reason.contains("snapshot")));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(counters.snapshot(), (0, 0, 0));
}

#[test]
fn test_isolation_level_parsing() {
    assert_eq!(
        "read committed".parse::<IsolationLevel>().unwrap(),
        IsolationLevel::ReadCommitted
    );
    assert_eq!(
        "REPEATABLE_READ".parse::<IsolationLevel>().unwrap(),
        IsolationLevel::RepeatableRead
    );
    assert_eq!(
        "serializable".parse::<IsolationLevel>().unwrap(),
        IsolationLevel::Serializable
    );
    assert_eq!(
        "chaos".parse::<IsolationLevel>().unwrap(),
        IsolationLevel::Other("chaos".to_string())
    );
    assert_eq!(IsolationLevel::RepeatableRead.to_string(), "REPEATABLE READ");
}

#[test]
fn test_transaction_error_display() {
    let error = TransactionError::Database("connection refused".to_string());
    assert!(error.to_string().contains("connection refused"));
    assert_eq!(
        TransactionError::AlreadyCompleted.to_string(),
        "Transaction already completed"
    );
}
