//! Pluggable processors for decoded callback events.
//!
//! Each of the four event kinds has exactly one processor slot. Slots that the
//! caller leaves empty are filled with a [`LoggingProcessor`] when the registry
//! is resolved, so every kind is always handled. The registry is immutable
//! once built: processors are never swapped while the server runs.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ProcessorError;
use crate::event::{
    CallbackEnvelope, CallbackEvent, DeliveryReport, EventKind, ReplyEvent,
    SignatureAuditResult, TemplateAuditResult,
};

/// Consumer for one kind of decoded callback.
///
/// Returning an error makes the dispatcher answer the callback with a 500,
/// which the platform treats as a failed delivery and retries later.
///
/// Plain closures taking `&E` implement this trait, which is handy for tests
/// and small integrations:
///
/// ```
/// use callback_server::{DeliveryReport, Processor, ProcessorError};
///
/// fn assert_processor<P: Processor<DeliveryReport>>(_: &P) {}
///
/// let processor = |report: &DeliveryReport| -> Result<(), ProcessorError> {
///     println!("{} delivered: {}", report.msg_id, report.is_delivered());
///     Ok(())
/// };
/// assert_processor(&processor);
/// ```
#[async_trait]
pub trait Processor<E: CallbackEvent>: Send + Sync {
    /// Handle a single decoded event.
    async fn process(&self, event: &E) -> Result<(), ProcessorError>;
}

#[async_trait]
impl<E, F> Processor<E> for F
where
    E: CallbackEvent,
    F: Fn(&E) -> Result<(), ProcessorError> + Send + Sync,
{
    async fn process(&self, event: &E) -> Result<(), ProcessorError> {
        self(event)
    }
}

/// Default processor: records the event through `tracing` and acknowledges it.
#[derive(Debug, Clone)]
pub struct LoggingProcessor {
    span: tracing::Span,
}

impl LoggingProcessor {
    /// Create a logging processor that emits inside `span`.
    pub fn new(span: tracing::Span) -> Self {
        Self { span }
    }
}

#[async_trait]
impl<E: CallbackEvent> Processor<E> for LoggingProcessor {
    async fn process(&self, event: &E) -> Result<(), ProcessorError> {
        self.span.in_scope(|| {
            tracing::info!(kind = %E::KIND, event = ?event, "Callback received");
        });
        Ok(())
    }
}

/// Caller-supplied processor bindings, one optional slot per kind.
///
/// This is what the builder collects; [`ProcessorRegistry::resolve`] turns it
/// into a fully populated registry.
#[derive(Clone, Default)]
pub struct ProcessorBindings {
    pub(crate) reply: Option<Arc<dyn Processor<ReplyEvent>>>,
    pub(crate) report: Option<Arc<dyn Processor<DeliveryReport>>>,
    pub(crate) template: Option<Arc<dyn Processor<TemplateAuditResult>>>,
    pub(crate) sign: Option<Arc<dyn Processor<SignatureAuditResult>>>,
}

impl ProcessorBindings {
    /// Whether a custom processor is bound for `kind`.
    pub fn is_bound(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Reply => self.reply.is_some(),
            EventKind::DeliveryReport => self.report.is_some(),
            EventKind::TemplateAudit => self.template.is_some(),
            EventKind::SignatureAudit => self.sign.is_some(),
        }
    }

    /// Kinds that have a custom processor bound.
    pub fn bound_kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| self.is_bound(*kind))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bound_kinds().is_empty()
    }
}

impl std::fmt::Debug for ProcessorBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorBindings")
            .field("bound", &self.bound_kinds())
            .finish()
    }
}

/// Registry holding the active processor for every event kind.
pub struct ProcessorRegistry {
    reply: Arc<dyn Processor<ReplyEvent>>,
    report: Arc<dyn Processor<DeliveryReport>>,
    template: Arc<dyn Processor<TemplateAuditResult>>,
    sign: Arc<dyn Processor<SignatureAuditResult>>,
    /// Kinds served by a caller-supplied processor
    custom: Vec<EventKind>,
}

impl ProcessorRegistry {
    /// Fill every unbound slot with a logging processor emitting in `span`.
    pub fn resolve(bindings: ProcessorBindings, span: &tracing::Span) -> Self {
        let custom = bindings.bound_kinds();
        let fallback = LoggingProcessor::new(span.clone());

        Self {
            reply: bindings
                .reply
                .unwrap_or_else(|| Arc::new(fallback.clone())),
            report: bindings
                .report
                .unwrap_or_else(|| Arc::new(fallback.clone())),
            template: bindings
                .template
                .unwrap_or_else(|| Arc::new(fallback.clone())),
            sign: bindings.sign.unwrap_or_else(|| Arc::new(fallback)),
            custom,
        }
    }

    /// Hand the envelope to the processor bound for its kind.
    ///
    /// Exactly one processor runs per call.
    pub async fn process(&self, envelope: &CallbackEnvelope) -> Result<(), ProcessorError> {
        match envelope {
            CallbackEnvelope::Reply(event) => self.reply.process(event).await,
            CallbackEnvelope::DeliveryReport(event) => self.report.process(event).await,
            CallbackEnvelope::TemplateAudit(event) => self.template.process(event).await,
            CallbackEnvelope::SignatureAudit(event) => self.sign.process(event).await,
        }
    }

    /// Whether `kind` is served by a caller-supplied processor rather than
    /// the logging default.
    pub fn is_custom(&self, kind: EventKind) -> bool {
        self.custom.contains(&kind)
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("custom", &self.custom)
            .finish()
    }
}
