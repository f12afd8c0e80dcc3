//! Server configuration and the builder that assembles it.
//!
//! Options are applied in call order and later calls override earlier ones.
//! Everything is validated once, in [`CallbackServerBuilder::config`] /
//! [`CallbackServerBuilder::build`], so a server that was built successfully
//! never fails at start time because of its configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, ServerError};
use crate::event::{DeliveryReport, ReplyEvent, SignatureAuditResult, TemplateAuditResult};
use crate::http::CallbackHandler;
use crate::processor::{Processor, ProcessorBindings};
use crate::server::CallbackServer;

/// Listen address used when none is configured.
pub const DEFAULT_ADDR: &str = "0.0.0.0:8088";

/// Callback path used when none is configured.
pub const DEFAULT_PATH: &str = "/callback";

/// Time in-flight requests get to finish once shutdown begins.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Time `start` waits for the listener to confirm it is bound.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variables read by [`CallbackServerBuilder::from_env`].
pub mod env {
    pub const ADDR: &str = "JSMS_CALLBACK_ADDR";
    pub const PATH: &str = "JSMS_CALLBACK_PATH";
    pub const GRACE_SECS: &str = "JSMS_CALLBACK_GRACE_SECS";
    pub const STARTUP_TIMEOUT_SECS: &str = "JSMS_CALLBACK_STARTUP_TIMEOUT_SECS";
}

/// Validated, immutable server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub(crate) addr: SocketAddr,
    pub(crate) path: Arc<str>,
    pub(crate) span: tracing::Span,
    pub(crate) grace_period: Duration,
    pub(crate) startup_timeout: Duration,
    pub(crate) handler: Option<Arc<dyn CallbackHandler>>,
    pub(crate) processors: ProcessorBindings,
}

impl ServerConfig {
    /// Defaults overridden by `JSMS_CALLBACK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        CallbackServerBuilder::from_env()?.config()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Span every server log event is emitted in.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Whether a custom handler replaces the built-in dispatcher.
    pub fn has_custom_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn processors(&self) -> &ProcessorBindings {
        &self.processors
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("addr", &self.addr)
            .field("path", &self.path)
            .field("grace_period", &self.grace_period)
            .field("startup_timeout", &self.startup_timeout)
            .field("custom_handler", &self.handler.is_some())
            .field("processors", &self.processors)
            .finish()
    }
}

/// Builder for [`ServerConfig`] and [`CallbackServer`].
///
/// # Defaults
///
/// - Address: `0.0.0.0:8088`
/// - Path: `/callback`
/// - Grace period: 5 seconds
/// - Startup timeout: 5 seconds
/// - Logging span: `jsms_callback`
/// - Processors: a logging processor for every kind
///
/// # Validation
///
/// `build()` fails with [`ServerError::Configuration`] when:
/// - the address is not a valid socket address
/// - the path is empty or does not start with `/`
/// - the grace period or startup timeout is zero
/// - a custom handler is combined with per-kind processors
///
/// # Example
///
/// ```
/// use callback_server::{CallbackServer, DeliveryReport, ProcessorError};
/// use std::time::Duration;
///
/// let server = CallbackServer::builder()
///     .with_addr("127.0.0.1:0")
///     .with_path("/jsms/callback")
///     .with_grace_period(Duration::from_secs(10))
///     .with_report_processor(|report: &DeliveryReport| -> Result<(), ProcessorError> {
///         println!("{} -> {}", report.msg_id, report.status);
///         Ok(())
///     })
///     .build()
///     .expect("valid configuration");
///
/// assert_eq!(server.config().path(), "/jsms/callback");
/// ```
pub struct CallbackServerBuilder {
    addr: String,
    path: String,
    span: Option<tracing::Span>,
    grace_period: Duration,
    startup_timeout: Duration,
    handler: Option<Arc<dyn CallbackHandler>>,
    processors: ProcessorBindings,
}

impl CallbackServerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            path: DEFAULT_PATH.to_string(),
            span: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            handler: None,
            processors: ProcessorBindings::default(),
        }
    }

    /// Create a builder seeded from `JSMS_CALLBACK_*` environment variables.
    ///
    /// Unset variables keep their defaults. Durations are whole seconds.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::new();

        if let Some(addr) = lookup(env::ADDR) {
            builder = builder.with_addr(addr);
        }
        if let Some(path) = lookup(env::PATH) {
            builder = builder.with_path(path);
        }
        if let Some(secs) = lookup(env::GRACE_SECS) {
            builder = builder.with_grace_period(parse_secs(env::GRACE_SECS, &secs)?);
        }
        if let Some(secs) = lookup(env::STARTUP_TIMEOUT_SECS) {
            builder = builder.with_startup_timeout(parse_secs(env::STARTUP_TIMEOUT_SECS, &secs)?);
        }

        Ok(builder)
    }

    /// Set the listen address. `":8088"` is shorthand for `"0.0.0.0:8088"`.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Set the path the callback endpoint is served on.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Emit all server log events inside `span`.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Set how long shutdown waits for in-flight requests before forcing.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Set how long `start` waits for the listener to come up.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Replace the built-in dispatcher with `handler`.
    ///
    /// Cannot be combined with per-kind processors.
    pub fn with_handler(mut self, handler: impl CallbackHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Bind the processor for `SMS_REPLY` callbacks.
    pub fn with_reply_processor(mut self, processor: impl Processor<ReplyEvent> + 'static) -> Self {
        self.processors.reply = Some(Arc::new(processor));
        self
    }

    /// Bind the processor for `SMS_REPORT` callbacks.
    pub fn with_report_processor(
        mut self,
        processor: impl Processor<DeliveryReport> + 'static,
    ) -> Self {
        self.processors.report = Some(Arc::new(processor));
        self
    }

    /// Bind the processor for `SMS_TEMPLATE` callbacks.
    pub fn with_template_processor(
        mut self,
        processor: impl Processor<TemplateAuditResult> + 'static,
    ) -> Self {
        self.processors.template = Some(Arc::new(processor));
        self
    }

    /// Bind the processor for `SMS_SIGN` callbacks.
    pub fn with_sign_processor(
        mut self,
        processor: impl Processor<SignatureAuditResult> + 'static,
    ) -> Self {
        self.processors.sign = Some(Arc::new(processor));
        self
    }

    /// Validate the options and produce the configuration.
    pub fn config(self) -> Result<ServerConfig> {
        let addr = parse_addr(&self.addr)?;

        if self.path.is_empty() {
            return Err(ServerError::Configuration(
                "Callback path must not be empty".to_string(),
            ));
        }
        if !self.path.starts_with('/') {
            return Err(ServerError::Configuration(format!(
                "Callback path must start with '/': {}",
                self.path
            )));
        }

        if self.grace_period.is_zero() {
            return Err(ServerError::Configuration(
                "Grace period must be positive".to_string(),
            ));
        }
        if self.startup_timeout.is_zero() {
            return Err(ServerError::Configuration(
                "Startup timeout must be positive".to_string(),
            ));
        }

        if self.handler.is_some() && !self.processors.is_empty() {
            return Err(ServerError::Configuration(format!(
                "A custom handler cannot be combined with processors (bound: {:?})",
                self.processors.bound_kinds()
            )));
        }

        Ok(ServerConfig {
            addr,
            path: Arc::from(self.path),
            span: self
                .span
                .unwrap_or_else(|| tracing::info_span!("jsms_callback")),
            grace_period: self.grace_period,
            startup_timeout: self.startup_timeout,
            handler: self.handler,
            processors: self.processors,
        })
    }

    /// Validate the options and create the server.
    pub fn build(self) -> Result<CallbackServer> {
        Ok(CallbackServer::new(self.config()?))
    }
}

impl Default for CallbackServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    let candidate = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    candidate
        .parse()
        .map_err(|e| ServerError::Configuration(format!("Invalid listen address {addr:?}: {e}")))
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ServerError::Configuration(format!("Invalid {key} value {value:?}: {e}")))
}
