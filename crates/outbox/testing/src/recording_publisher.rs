//! [`Publisher`] double recording every publish.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use outbox_core::publisher::Publisher;
use outbox_core::pubsub::{BrokerError, PubSubError};
use parking_lot::Mutex;

/// Records published messages; subjects can be made to fail.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    failing_subjects: Mutex<HashSet<String>>,
    rejected_subjects: Mutex<HashSet<String>>,
    attempts: AtomicUsize,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publish on `subject` fails with a broker error until
    /// [`RecordingPublisher::recover`] is called.
    pub fn fail_subject(&self, subject: &str) {
        self.inner.failing_subjects.lock().insert(subject.to_string());
    }

    pub fn recover(&self, subject: &str) {
        self.inner.failing_subjects.lock().remove(subject);
    }

    /// Every publish on `subject` fails as a malformed subject.
    pub fn reject_subject(&self, subject: &str) {
        self.inner.rejected_subjects.lock().insert(subject.to_string());
    }

    /// Successful publishes in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.published.lock().clone()
    }

    pub fn published_subjects(&self) -> Vec<String> {
        self.published().into_iter().map(|(subject, _)| subject).collect()
    }

    /// Publish calls including failed ones.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), PubSubError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.rejected_subjects.lock().contains(subject) {
            return Err(PubSubError::InvalidSubject {
                subject: subject.to_string(),
            });
        }
        if self.inner.failing_subjects.lock().contains(subject) {
            return Err(PubSubError::Publish {
                subject: subject.to_string(),
                source: BrokerError::Publish("nats: no responders available".to_string()),
            });
        }
        self.inner
            .published
            .lock()
            .push((subject.to_string(), payload.to_vec()));
        Ok(())
    }
}
