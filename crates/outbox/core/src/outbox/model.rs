//! Outbox message model and payload conventions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::repository::OutboxResult;

/// A message waiting in (or already drained from) the outbox.
///
/// `send_at` being empty is the only eligibility criterion for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub subject: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub send_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// New unsent message with a fresh id, created now.
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(Uuid::new_v4(), subject, payload)
    }

    pub fn with_id(id: Uuid, subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            subject: subject.into(),
            payload: payload.into(),
            created_at: Utc::now(),
            updated_at: None,
            last_error_message: None,
            send_at: None,
        }
    }

    /// Serializes `body` as JSON with the common `msgUid`/`traceId` fields
    /// flattened in. The message id equals `msgUid`.
    ///
    /// # Errors
    ///
    /// Returns [`super::OutboxError::Serialization`] when `body` does not
    /// serialize to a JSON object.
    pub fn from_payload<T>(
        subject: impl Into<String>,
        body: &T,
        trace_id: Option<&str>,
    ) -> OutboxResult<Self>
    where
        T: Serialize,
    {
        #[derive(Serialize)]
        struct Envelope<'a, T> {
            #[serde(flatten)]
            base: BasePayload,
            #[serde(flatten)]
            body: &'a T,
        }

        let base = BasePayload {
            msg_uid: Uuid::new_v4(),
            trace_id: trace_id.map(str::to_string),
        };
        let id = base.msg_uid;
        let payload = serde_json::to_vec(&Envelope { base, body })?;
        Ok(Self::with_id(id, subject, payload))
    }

    #[inline]
    pub fn is_ready_for_publish(&self) -> bool {
        self.send_at.is_none()
    }

    /// Terminal success.
    pub fn mark_sent(&mut self, at: DateTime<Utc>) {
        self.send_at = Some(at);
        self.last_error_message = None;
    }

    /// Failed attempt; the message stays eligible for the next fetch.
    pub fn mark_failed(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.updated_at = Some(at);
        self.last_error_message = Some(error.into());
    }

    /// Trace correlation id carried in the payload, if any.
    pub fn trace_id(&self) -> Option<String> {
        trace_id_from_payload(&self.payload).ok().flatten()
    }
}

/// Fields every JSON payload written through [`OutboxMessage::from_payload`] carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasePayload {
    pub msg_uid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Extracts the `traceId` field from a JSON payload.
///
/// `Ok(None)` when the payload is JSON without a (non-empty) trace id.
///
/// # Errors
///
/// Fails when the payload is not a JSON object.
pub fn trace_id_from_payload(payload: &[u8]) -> Result<Option<String>, serde_json::Error> {
    #[derive(Deserialize)]
    struct TraceInfo {
        #[serde(rename = "traceId", default)]
        trace_id: Option<String>,
    }

    let info: TraceInfo = serde_json::from_slice(payload)?;
    Ok(info.trace_id.filter(|id| !id.is_empty()))
}
