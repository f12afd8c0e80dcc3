//! Inbound HTTP callback server for the JSMS SMS platform.
//!
//! The platform reports four kinds of events to a single configured URL:
//! replies to sent messages, delivery reports, template audit results and
//! signature audit results. This crate receives them, works out which kind
//! each request carries, decodes it and hands it to the processor bound for
//! that kind.
//!
//! # Overview
//!
//! - [`CallbackServer`]: owns the listener and its lifecycle (`Idle`,
//!   `Running`, `Stopped`), and shuts down gracefully on termination signals.
//! - [`Dispatcher`]: classifies a request by its `type` field and routes the
//!   decoded [`CallbackEnvelope`] through the [`ProcessorRegistry`].
//! - [`Processor`]: per-kind consumer. Unbound kinds fall back to a
//!   [`LoggingProcessor`].
//! - [`CallbackHandler`]: optional replacement for the whole dispatcher.
//!
//! Every acknowledgment follows the same contract: 200 `OK` once the processor
//! succeeded, 400 for a payload that cannot be classified, 500 when the
//! processor failed. The platform retries anything that is not a 200.
//!
//! # Example
//!
//! ```no_run
//! use callback_server::{
//!     CallbackServer, DeliveryReport, OsSignals, ProcessorError, ReplyEvent,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = CallbackServer::builder()
//!         .with_addr(":8088")
//!         .with_path("/jsms/callback")
//!         .with_report_processor(|report: &DeliveryReport| -> Result<(), ProcessorError> {
//!             println!("{} delivered: {}", report.msg_id, report.is_delivered());
//!             Ok(())
//!         })
//!         .with_reply_processor(|reply: &ReplyEvent| -> Result<(), ProcessorError> {
//!             println!("{} replied: {}", reply.phone, reply.content);
//!             Ok(())
//!         })
//!         .build()?;
//!
//!     let outcome = server.run(OsSignals::new()?).await?;
//!     println!("stopped: {outcome:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Embedding
//!
//! A host that already runs a warp server can mount [`CallbackServer::filter`]
//! instead of calling `start`; requests are then served without the
//! built-in listener.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod http;
pub mod logging;
pub mod processor;
pub mod shutdown;

mod listener;
mod server;

pub use config::{CallbackServerBuilder, ServerConfig};
pub use dispatcher::Dispatcher;
pub use error::{ClassificationError, ProcessorError, Result, ServerError, ShutdownError};
pub use event::{
    CallbackEnvelope, CallbackEvent, DeliveryReport, EventKind, ReplyEvent, SignatureAuditResult,
    TemplateAuditResult,
};
pub use http::{CallbackHandler, CallbackRequest, CallbackResponse, FrontDoor};
pub use processor::{LoggingProcessor, Processor, ProcessorBindings, ProcessorRegistry};
pub use server::{CallbackServer, RunState};
pub use shutdown::{
    shutdown_gracefully, GracefulClose, OsSignals, ShutdownOutcome, SignalSource,
    TerminationSignal,
};
