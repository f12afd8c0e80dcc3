//! Classification and dispatch of inbound callbacks.
//!
//! The platform posts callbacks either form-encoded (its native format, with
//! `data` carrying a JSON string) or as a JSON object. In both cases the `type`
//! field selects the event kind and `data` holds the kind-specific payload.
//! The [`Dispatcher`] turns a request into a [`CallbackEnvelope`], invokes the
//! one processor bound for that kind, and maps the result to a status code:
//!
//! | Outcome                                   | Status |
//! |-------------------------------------------|--------|
//! | processed                                 | 200    |
//! | unknown/missing `type`, undecodable body  | 400    |
//! | unsupported method                        | 405    |
//! | processor failure                         | 500    |

use serde::Deserialize;
use serde_json::Value;
use tracing::Instrument;
use warp::http::{header, HeaderValue, Method, StatusCode};

use crate::error::ClassificationError;
use crate::event::{
    CallbackEnvelope, CallbackEvent, DeliveryReport, EventKind, ReplyEvent,
    SignatureAuditResult, TemplateAuditResult,
};
use crate::http::{CallbackRequest, CallbackResponse};
use crate::processor::ProcessorRegistry;

/// Query parameter the platform sends when verifying the callback URL.
pub const ECHO_PARAM: &str = "echostr";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Methods served on the callback path, as sent in `Allow` with a 405.
const ALLOWED_METHODS: &str = "GET, POST";

/// Kind-tagged body before the payload is decoded.
#[derive(Debug, Default, Deserialize)]
struct RawCallback {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl RawCallback {
    fn from_form(body: &[u8]) -> Self {
        let mut raw = RawCallback::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            match key.as_ref() {
                "type" => raw.kind = Some(value.into_owned()),
                "data" => raw.data = Some(Value::String(value.into_owned())),
                _ => {}
            }
        }
        raw
    }

    fn from_json(body: &[u8]) -> Result<Self, ClassificationError> {
        serde_json::from_slice(body)
            .map_err(|e| ClassificationError::MalformedBody(e.to_string()))
    }
}

/// Routes decoded callbacks to the processor registry.
#[derive(Debug)]
pub struct Dispatcher {
    registry: ProcessorRegistry,
    span: tracing::Span,
}

impl Dispatcher {
    /// Create a dispatcher whose log events are emitted inside `span`.
    pub fn new(registry: ProcessorRegistry, span: tracing::Span) -> Self {
        Self { registry, span }
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Determine the kind of a `POST` callback and decode its payload.
    pub fn classify(request: &CallbackRequest) -> Result<CallbackEnvelope, ClassificationError> {
        if request.body.is_empty() {
            return Err(ClassificationError::MalformedBody("empty body".to_string()));
        }

        let is_form = request
            .content_type()
            .is_some_and(|media_type| media_type.eq_ignore_ascii_case(FORM_CONTENT_TYPE));

        let raw = if is_form {
            RawCallback::from_form(&request.body)
        } else {
            RawCallback::from_json(&request.body)?
        };

        // Surrounding whitespace is dropped; the value itself must match exactly.
        let discriminator = raw
            .kind
            .map(|kind| kind.trim().to_string())
            .filter(|kind| !kind.is_empty())
            .ok_or(ClassificationError::MissingDiscriminator)?;

        let kind = EventKind::from_discriminator(&discriminator)
            .ok_or(ClassificationError::UnknownDiscriminator(discriminator))?;

        match kind {
            EventKind::Reply => decode::<ReplyEvent>(raw.data),
            EventKind::DeliveryReport => decode::<DeliveryReport>(raw.data),
            EventKind::TemplateAudit => decode::<TemplateAuditResult>(raw.data),
            EventKind::SignatureAudit => decode::<SignatureAuditResult>(raw.data),
        }
    }

    /// Handle one request end to end and produce the acknowledgment.
    ///
    /// Nothing that happens here is allowed to escape the request: failures
    /// are logged and reported through the status code.
    pub async fn dispatch(&self, request: CallbackRequest) -> CallbackResponse {
        async move {
            match request.method {
                Method::POST => self.dispatch_event(&request).await,
                Method::GET => Self::verify(&request),
                ref method => {
                    tracing::warn!(%method, "Unsupported method on callback endpoint");
                    CallbackResponse::new(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
                        .with_header(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS))
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn dispatch_event(&self, request: &CallbackRequest) -> CallbackResponse {
        let envelope = match Self::classify(request) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected unclassifiable callback");
                return CallbackResponse::bad_request(e.to_string());
            }
        };

        let kind = envelope.kind();
        tracing::debug!(%kind, "Callback classified");

        match self.registry.process(&envelope).await {
            Ok(()) => {
                tracing::info!(%kind, custom = self.registry.is_custom(kind), "Callback processed");
                CallbackResponse::ok()
            }
            Err(e) => {
                tracing::error!(%kind, error = %e, "Callback processor failed");
                CallbackResponse::internal_error(e.to_string())
            }
        }
    }

    /// URL verification: echo `echostr` back to the platform.
    fn verify(request: &CallbackRequest) -> CallbackResponse {
        match request.query.get(ECHO_PARAM) {
            Some(echo) => {
                tracing::info!("Callback URL verification request answered");
                CallbackResponse::new(StatusCode::OK, echo.clone())
            }
            None => {
                tracing::warn!("GET on callback endpoint without `{}`", ECHO_PARAM);
                CallbackResponse::bad_request(format!("missing `{ECHO_PARAM}` parameter"))
            }
        }
    }
}

/// Decode `data` as `E`. The field may be an embedded object or a JSON string.
fn decode<E: CallbackEvent>(data: Option<Value>) -> Result<CallbackEnvelope, ClassificationError> {
    let data = data.ok_or_else(|| ClassificationError::Decode {
        kind: E::KIND,
        message: "missing `data` field".to_string(),
    })?;

    let event: E = match data {
        Value::String(raw) => serde_json::from_str(&raw),
        other => serde_json::from_value(other),
    }
    .map_err(|e| ClassificationError::Decode {
        kind: E::KIND,
        message: e.to_string(),
    })?;

    Ok(event.into_envelope())
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::processor::ProcessorBindings;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_dispatcher(calls: Arc<AtomicUsize>) -> Dispatcher {
        let count = move |calls: &Arc<AtomicUsize>| calls.fetch_add(1, Ordering::SeqCst);
        let (c1, c2, c3, c4) = (calls.clone(), calls.clone(), calls.clone(), calls);
        let bindings = ProcessorBindings {
            reply: Some(Arc::new(move |_: &ReplyEvent| -> Result<(), crate::ProcessorError> {
                count(&c1);
                Ok(())
            })),
            report: Some(Arc::new(move |_: &DeliveryReport| -> Result<(), crate::ProcessorError> {
                count(&c2);
                Ok(())
            })),
            template: Some(Arc::new(
                move |_: &TemplateAuditResult| -> Result<(), crate::ProcessorError> {
                    count(&c3);
                    Ok(())
                },
            )),
            sign: Some(Arc::new(
                move |_: &SignatureAuditResult| -> Result<(), crate::ProcessorError> {
                    count(&c4);
                    Ok(())
                },
            )),
        };
        Dispatcher::new(
            ProcessorRegistry::resolve(bindings, &tracing::Span::none()),
            tracing::Span::none(),
        )
    }

    proptest! {
        /// Any discriminator outside the four known kinds is answered with a
        /// 400 and never reaches a processor.
        #[test]
        fn test_unknown_discriminators_never_reach_processors(kind in "\\PC{0,24}") {
            prop_assume!(EventKind::from_discriminator(kind.trim()).is_none());

            tokio_test::block_on(async {
                let calls = Arc::new(AtomicUsize::new(0));
                let dispatcher = counting_dispatcher(calls.clone());
                let body = serde_json::json!({ "type": kind, "data": {} }).to_string();

                let response = dispatcher
                    .dispatch(CallbackRequest::json("/callback", body))
                    .await;

                prop_assert_eq!(response.status, StatusCode::BAD_REQUEST);
                prop_assert_eq!(calls.load(Ordering::SeqCst), 0);
                Ok(())
            })?;
        }
    }
}
