//! In-memory implementation of OutboxRepository for testing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use outbox_core::outbox::{OutboxError, OutboxMessage, OutboxRepository, OutboxResult};
use outbox_core::transaction::TxContext;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::memory_transactor::{MemoryTransaction, apply_or_stage};

/// In-memory outbox table.
#[derive(Default, Clone)]
pub struct InMemoryOutboxRepository {
    inner: Arc<InnerStore>,
}

#[derive(Default)]
struct InnerStore {
    messages: RwLock<HashMap<Uuid, Stored>>,
    /// Ids created inside transactions that have not completed yet.
    reserved: Mutex<HashSet<Uuid>>,
    sequence: AtomicUsize,
    fetch_calls: AtomicUsize,
    update_calls: AtomicUsize,
    fail_fetch: AtomicBool,
    failing_updates: AtomicUsize,
}

#[derive(Clone)]
struct Stored {
    sequence: usize,
    message: OutboxMessage,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message with `id`, as committed.
    pub fn get(&self, id: Uuid) -> Option<OutboxMessage> {
        self.inner
            .messages
            .read()
            .get(&id)
            .map(|stored| stored.message.clone())
    }

    /// All committed messages in insertion order.
    pub fn messages(&self) -> Vec<OutboxMessage> {
        let mut stored: Vec<Stored> = self.inner.messages.read().values().cloned().collect();
        stored.sort_by_key(|s| s.sequence);
        stored.into_iter().map(|s| s.message).collect()
    }

    pub fn message_count(&self) -> usize {
        self.inner.messages.read().len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .messages
            .read()
            .values()
            .filter(|s| s.message.is_ready_for_publish())
            .count()
    }

    pub fn fetch_calls(&self) -> usize {
        self.inner.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.inner.update_calls.load(Ordering::SeqCst)
    }

    /// Makes every ready-message query fail while set.
    pub fn fail_fetch(&self, fail: bool) {
        self.inner.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` updates fail.
    pub fn fail_next_updates(&self, count: usize) {
        self.inner.failing_updates.store(count, Ordering::SeqCst);
    }

    fn take_update_failure(&self) -> bool {
        self.inner
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Holds an id in `reserved` until its staged insert is applied or dropped.
struct Reservation {
    inner: Arc<InnerStore>,
    id: Uuid,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.inner.reserved.lock().remove(&self.id);
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    type Tx = MemoryTransaction;

    async fn create_message(
        &self,
        ctx: &TxContext<MemoryTransaction>,
        message: &OutboxMessage,
    ) -> OutboxResult<()> {
        {
            let mut reserved = self.inner.reserved.lock();
            if reserved.contains(&message.id)
                || self.inner.messages.read().contains_key(&message.id)
            {
                return Err(OutboxError::AlreadyExists(message.id));
            }
            reserved.insert(message.id);
        }

        let reservation = Reservation {
            inner: Arc::clone(&self.inner),
            id: message.id,
        };
        let inner = Arc::clone(&self.inner);
        let message = message.clone();
        apply_or_stage(ctx, move || {
            let _reservation = reservation;
            let sequence = inner.sequence.fetch_add(1, Ordering::SeqCst);
            inner
                .messages
                .write()
                .entry(message.id)
                .or_insert(Stored { sequence, message });
        })
        .await?;
        Ok(())
    }

    async fn get_ready_messages_for_publish(
        &self,
        _ctx: &TxContext<MemoryTransaction>,
        batch_size: usize,
    ) -> OutboxResult<Vec<OutboxMessage>> {
        self.inner.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_fetch.load(Ordering::SeqCst) {
            return Err(OutboxError::storage(
                "get_ready_messages_for_publish",
                "injected fetch failure",
            ));
        }

        let mut ready: Vec<Stored> = self
            .inner
            .messages
            .read()
            .values()
            .filter(|s| s.message.is_ready_for_publish())
            .cloned()
            .collect();
        ready.sort_by_key(|s| (s.message.created_at, s.sequence));

        Ok(ready
            .into_iter()
            .take(batch_size)
            .map(|s| s.message)
            .collect())
    }

    async fn update_message(
        &self,
        ctx: &TxContext<MemoryTransaction>,
        message: &OutboxMessage,
    ) -> OutboxResult<()> {
        self.inner.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_update_failure() {
            return Err(OutboxError::storage("update_message", "injected update failure"));
        }

        let inner = Arc::clone(&self.inner);
        let message = message.clone();
        apply_or_stage(ctx, move || {
            if let Some(stored) = inner.messages.write().get_mut(&message.id) {
                stored.message.updated_at = message.updated_at;
                stored.message.last_error_message = message.last_error_message;
                stored.message.send_at = message.send_at;
            }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTransactor;
    use chrono::Utc;
    use outbox_core::transaction::{IsolationLevel, TransactionManager};

    #[tokio::test]
    async fn test_ready_messages_oldest_first_within_batch() {
        let repo = InMemoryOutboxRepository::new();
        let ctx = TxContext::none();
        let base = Utc::now();

        for (offset, subject) in [(2, "orders.late"), (0, "orders.early"), (1, "orders.mid")] {
            let mut message = OutboxMessage::new(subject, b"{}".to_vec());
            message.created_at = base + chrono::Duration::seconds(offset);
            repo.create_message(&ctx, &message).await.unwrap();
        }

        let ready = repo.get_ready_messages_for_publish(&ctx, 2).await.unwrap();
        let subjects: Vec<_> = ready.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, vec!["orders.early", "orders.mid"]);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let repo = InMemoryOutboxRepository::new();
        let ctx = TxContext::none();
        let message = OutboxMessage::new("orders.created", b"{}".to_vec());

        repo.create_message(&ctx, &message).await.unwrap();
        let err = repo.create_message(&ctx, &message).await.unwrap_err();

        assert!(err.is_already_exists());
        assert_eq!(repo.message_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_in_same_transaction_is_rejected() {
        let repo = InMemoryOutboxRepository::new();
        let manager = TransactionManager::new(MemoryTransactor::new());
        let message = OutboxMessage::new("orders.created", b"{}".to_vec());

        let err = manager
            .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |ctx| {
                let repo = &repo;
                let message = &message;
                async move {
                    repo.create_message(&ctx, message).await?;
                    repo.create_message(&ctx, message).await
                }
            })
            .await
            .unwrap_err();

        assert!(err.work_error::<OutboxError>().unwrap().is_already_exists());
        assert_eq!(repo.message_count(), 0);
    }

    #[tokio::test]
    async fn test_rolled_back_id_can_be_created_again() {
        let repo = InMemoryOutboxRepository::new();
        let manager = TransactionManager::new(MemoryTransactor::new());
        let message = OutboxMessage::new("orders.created", b"{}".to_vec());

        let result = manager
            .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |ctx| {
                let repo = &repo;
                let message = &message;
                async move {
                    repo.create_message(&ctx, message).await?;
                    Err::<(), _>(OutboxError::storage("reserve_stock", "out of stock"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(repo.message_count(), 0);

        manager
            .execute_tx(&TxContext::none(), IsolationLevel::ReadCommitted, |ctx| {
                let repo = &repo;
                let message = &message;
                async move { repo.create_message(&ctx, message).await }
            })
            .await
            .unwrap();
        assert_eq!(repo.message_count(), 1);

        let err = repo
            .create_message(&TxContext::none(), &message)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_update_persists_only_delivery_fields() {
        let repo = InMemoryOutboxRepository::new();
        let ctx = TxContext::none();
        let mut message = OutboxMessage::new("orders.created", b"{}".to_vec());
        repo.create_message(&ctx, &message).await.unwrap();

        message.payload = b"changed".to_vec();
        message.mark_failed(Utc::now(), "no responders");
        repo.update_message(&ctx, &message).await.unwrap();

        let stored = repo.get(message.id).unwrap();
        assert_eq!(stored.payload, b"{}".to_vec());
        assert_eq!(stored.last_error_message.as_deref(), Some("no responders"));
        assert!(stored.is_ready_for_publish());
    }
}
