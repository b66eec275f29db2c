//! Subscription handlers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoxError;

/// Error returned by a handler; any failure leads to a nak.
pub type HandlerError = BoxError;

/// Per-delivery context handed to a [`MessageHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub stream: String,
    pub subject: String,
    pub consumer: String,
    pub component: String,
    pub operation: String,
    /// Trace correlation id read from the payload's `traceId` field, when
    /// the client is configured to extract it.
    pub trace_id: Option<String>,
}

/// Processes messages delivered on one subject.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &MessageContext, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

/// Wraps `f` as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(MessageContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &MessageContext, payload: &[u8]) -> Result<(), HandlerError> {
        (self.0)(ctx.clone(), payload.to_vec()).await
    }
}

/// A handler registered for one subject, labelled with the component and
/// operation names used in logs and spans.
#[derive(Clone)]
pub struct SubjectHandler {
    component: String,
    operation: String,
    handler: Arc<dyn MessageHandler>,
}

impl SubjectHandler {
    pub fn new(
        component: impl Into<String>,
        operation: impl Into<String>,
        handler: impl MessageHandler,
    ) -> Self {
        Self::from_arc(component, operation, Arc::new(handler))
    }

    pub fn from_arc(
        component: impl Into<String>,
        operation: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            handler,
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }
}

impl fmt::Debug for SubjectHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectHandler")
            .field("component", &self.component)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

/// subject -> handler
pub type SubjectHandlers = HashMap<String, SubjectHandler>;

/// stream -> subject -> handler
pub type StreamHandlers = HashMap<String, SubjectHandlers>;

/// Number of subjects registered across all streams.
pub fn subject_count(handlers: &StreamHandlers) -> usize {
    handlers.values().map(HashMap::len).sum()
}
