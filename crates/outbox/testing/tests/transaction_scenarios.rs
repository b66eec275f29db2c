//! Outbox writes sharing the business transaction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use outbox_core::outbox::{OutboxError, OutboxMessage, OutboxRepository};
use outbox_core::publisher::Publisher;
use outbox_core::transaction::{
    IsolationLevel, TransactionError, TransactionManager, TransactionResult, TxContext,
};
use outbox_testing::{
    InMemoryOutboxRepository, MemoryTransaction, MemoryTransactor, RecordingPublisher,
};
use parking_lot::Mutex;
use uuid::Uuid;

/// Business table written through the same transaction as the outbox.
#[derive(Clone, Default)]
struct OrderTable {
    rows: Arc<Mutex<HashMap<Uuid, String>>>,
}

impl OrderTable {
    async fn insert(
        &self,
        ctx: &TxContext<MemoryTransaction>,
        id: Uuid,
        customer: &str,
    ) -> TransactionResult<()> {
        let rows = Arc::clone(&self.rows);
        let customer = customer.to_string();
        let shared = ctx
            .transaction()
            .ok_or_else(|| TransactionError::Database("orders require a transaction".into()))?;
        shared
            .lock()
            .await
            .stage(move || {
                rows.lock().insert(id, customer);
            })
    }

    fn contains(&self, id: Uuid) -> bool {
        self.rows.lock().contains_key(&id)
    }
}

struct Fixture {
    transactor: MemoryTransactor,
    manager: TransactionManager<MemoryTransactor>,
    outbox: InMemoryOutboxRepository,
    orders: OrderTable,
}

fn fixture() -> Fixture {
    let transactor = MemoryTransactor::new();
    Fixture {
        manager: TransactionManager::new(transactor.clone()),
        transactor,
        outbox: InMemoryOutboxRepository::new(),
        orders: OrderTable::default(),
    }
}

#[tokio::test]
async fn test_failure_after_business_write_leaves_no_rows() {
    let f = fixture();
    let order_id = Uuid::new_v4();
    let message = OutboxMessage::new("orders.created", b"{}".to_vec());
    let message_id = message.id;

    let result = f
        .manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |ctx| {
            let (outbox, orders) = (f.outbox.clone(), f.orders.clone());
            async move {
                orders.insert(&ctx, order_id, "alice").await?;
                outbox.create_message(&ctx, &message).await?;
                Err::<(), _>(OutboxError::storage("reserve_stock", "out of stock"))
            }
        })
        .await;

    assert!(matches!(result, Err(TransactionError::Work(_))));
    assert!(!f.orders.contains(order_id));
    assert!(f.outbox.get(message_id).is_none());
    assert_eq!(f.transactor.rolled_back(), 1);
    assert_eq!(f.transactor.committed(), 0);
}

#[tokio::test]
async fn test_committed_order_message_is_published_once() {
    let f = fixture();
    let publisher = RecordingPublisher::new();
    let order_id = Uuid::new_v4();
    let message = OutboxMessage::new("orders.created", b"{}".to_vec());

    f.manager
        .execute_tx(&TxContext::none(), IsolationLevel::Serializable, |ctx| {
            let (outbox, orders, message) = (f.outbox.clone(), f.orders.clone(), message.clone());
            async move {
                orders.insert(&ctx, order_id, "alice").await?;
                outbox.create_message(&ctx, &message).await?;
                Ok::<_, OutboxError>(())
            }
        })
        .await
        .unwrap();

    assert!(f.orders.contains(order_id));
    let ctx = TxContext::none();
    let mut ready = f.outbox.get_ready_messages_for_publish(&ctx, 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, message.id);

    let mut fetched = ready.remove(0);
    publisher
        .publish(&fetched.subject, &fetched.payload)
        .await
        .unwrap();
    fetched.mark_sent(Utc::now());
    f.outbox.update_message(&ctx, &fetched).await.unwrap();

    assert!(
        f.outbox
            .get_ready_messages_for_publish(&ctx, 10)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(publisher.published_subjects(), vec!["orders.created"]);
}

#[tokio::test]
async fn test_nested_execute_tx_opens_one_transaction() {
    let f = fixture();
    let first = OutboxMessage::new("orders.created", b"{}".to_vec());
    let second = OutboxMessage::new("orders.paid", b"{}".to_vec());

    f.manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |outer| {
            let (manager, outbox) = (f.manager.clone(), f.outbox.clone());
            let (first, second) = (first.clone(), second.clone());
            async move {
                outbox.create_message(&outer, &first).await?;
                manager
                    .execute_tx(&outer, IsolationLevel::Serializable, |inner| {
                        let outbox = outbox.clone();
                        async move {
                            assert!(inner.has_transaction());
                            outbox.create_message(&inner, &second).await
                        }
                    })
                    .await?;
                // Inner call did not commit: nothing visible yet.
                assert_eq!(outbox.message_count(), 0);
                Ok::<_, TransactionError>(())
            }
        })
        .await
        .unwrap();

    assert_eq!(f.transactor.begun(), 1);
    assert_eq!(f.transactor.committed(), 1);
    assert_eq!(f.transactor.isolation_levels(), vec![IsolationLevel::ReadCommitted]);
    assert_eq!(f.outbox.message_count(), 2);
}

#[tokio::test]
async fn test_inner_failure_rolls_back_outer_writes() {
    let f = fixture();
    let first = OutboxMessage::new("orders.created", b"{}".to_vec());

    let result = f
        .manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |outer| {
            let (manager, outbox) = (f.manager.clone(), f.outbox.clone());
            async move {
                outbox.create_message(&outer, &first).await?;
                manager
                    .execute_tx(&outer, IsolationLevel::ReadCommitted, |_inner| async {
                        Err::<(), _>(OutboxError::storage("charge_card", "declined"))
                    })
                    .await?;
                Ok::<_, TransactionError>(())
            }
        })
        .await;

    let err = result.unwrap_err();
    let cause = err.work_error::<OutboxError>().expect("inner work error");
    assert!(cause.to_string().contains("charge_card"));
    assert_eq!(f.transactor.rolled_back(), 1);
    assert_eq!(f.outbox.message_count(), 0);
}

#[tokio::test]
async fn test_panicking_work_rolls_back_and_returns_error() {
    let f = fixture();
    let order_id = Uuid::new_v4();

    let result = f
        .manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |ctx| {
            let orders = f.orders.clone();
            async move {
                orders.insert(&ctx, order_id, "mallory").await?;
                let customers: Vec<&str> = Vec::new();
                if customers.is_empty() {
                    panic!("no customers loaded");
                }
                Ok::<_, TransactionError>(())
            }
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.is_panic());
    assert!(err.to_string().contains("no customers loaded"));
    assert!(!f.orders.contains(order_id));
    assert_eq!(f.transactor.rolled_back(), 1);
}

#[tokio::test]
async fn test_commit_failure_is_reported() {
    let f = fixture();
    f.transactor.fail_commit(true);
    let message = OutboxMessage::new("orders.created", b"{}".to_vec());

    let result = f
        .manager
        .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |ctx| {
            let outbox = f.outbox.clone();
            async move { outbox.create_message(&ctx, &message).await }
        })
        .await;

    assert!(matches!(result, Err(TransactionError::Commit(_))));
    assert_eq!(f.outbox.message_count(), 0);
}

#[tokio::test]
async fn test_unsupported_isolation_level_never_runs_work() {
    let f = fixture();
    let ran = Arc::new(Mutex::new(false));

    let result = f
        .manager
        .execute_tx(
            &TxContext::none(),
            IsolationLevel::Other("snapshot".to_string()),
            |_ctx| {
                let ran = Arc::clone(&ran);
                async move {
                    *ran.lock() = true;
                    Ok::<_, TransactionError>(())
                }
            },
        )
        .await;

    assert!(matches!(result, Err(TransactionError::Begin(_))));
    assert!(!*ran.lock());
}
