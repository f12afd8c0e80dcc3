//! Lifecycle controller for the callback endpoint.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::Instrument;
use warp::Filter;

use crate::config::{CallbackServerBuilder, ServerConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{Result, ServerError};
use crate::http::{routes, CallbackRequest, CallbackResponse, FrontDoor};
use crate::listener::{self, Listener, Ready};
use crate::processor::ProcessorRegistry;
use crate::shutdown::{shutdown_gracefully, ShutdownOutcome, SignalSource, TerminationSignal};

/// Where the server is in its lifecycle.
///
/// `Idle → Running` on a successful start, `Running → Stopped` on shutdown and
/// `Idle → Stopped` when stopped before ever starting. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopped,
}

/// State guarded by the lifecycle mutex.
#[derive(Default)]
struct Lifecycle {
    listener: Option<Listener>,
    outcome: Option<ShutdownOutcome>,
}

/// HTTP server receiving JSMS callbacks.
///
/// The server owns its listener exclusively. `start` and `stop` are
/// serialized, so racing calls from several tasks see consistent states.
/// Requests can also be fed in directly through [`handle`](Self::handle) or
/// [`filter`](Self::filter) when a host framework owns the socket.
///
/// # Example
///
/// ```no_run
/// use callback_server::{CallbackServer, OsSignals};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = CallbackServer::builder().with_addr(":8088").build()?;
///
///     let outcome = server.run(OsSignals::new()?).await?;
///     std::process::exit(outcome.exit_code().into());
/// }
/// ```
pub struct CallbackServer {
    config: ServerConfig,
    front_door: Arc<FrontDoor>,
    state: watch::Sender<RunState>,
    lifecycle: Mutex<Lifecycle>,
    local_addr: OnceLock<SocketAddr>,
}

impl CallbackServer {
    pub fn builder() -> CallbackServerBuilder {
        CallbackServerBuilder::new()
    }

    /// Create an idle server from a validated configuration.
    ///
    /// Without a custom handler the processor registry is resolved here, so
    /// every unbound kind falls back to logging.
    pub fn new(config: ServerConfig) -> Self {
        let front_door = match &config.handler {
            Some(handler) => FrontDoor::Custom(handler.clone()),
            None => {
                let registry = ProcessorRegistry::resolve(config.processors.clone(), &config.span);
                FrontDoor::Dispatch(Dispatcher::new(registry, config.span.clone()))
            }
        };

        let (state, _) = watch::channel(RunState::Idle);

        Self {
            config,
            front_door: Arc::new(front_door),
            state,
            lifecycle: Mutex::new(Lifecycle::default()),
            local_addr: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn path(&self) -> &str {
        self.config.path()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// The address the listener was bound to, once started.
    ///
    /// Differs from the configured address when port 0 was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Handle a single request without going through the listener.
    pub async fn handle(&self, request: CallbackRequest) -> CallbackResponse {
        self.front_door.handle(request).await
    }

    /// The callback endpoint as a warp filter, for mounting in a host server.
    pub fn filter(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone + Send + Sync + 'static
    {
        routes(self.front_door.clone(), self.config.path.clone())
    }

    /// Bind the listener and start serving.
    ///
    /// Returns once the listener has confirmed it is bound, with the bound
    /// address. On failure the server stays `Idle`.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = self.config.addr;
        let front_door = self.front_door.clone();
        let path = self.config.path.clone();

        self.start_with(move |drain_rx, ready_tx| {
            listener::serve(addr, front_door, path, drain_rx, ready_tx)
        })
        .await
    }

    /// Run the lifecycle side of `start` around the serving future `serve`
    /// builds.
    async fn start_with<F, Fut>(&self, serve: F) -> Result<SocketAddr>
    where
        F: FnOnce(watch::Receiver<bool>, oneshot::Sender<Ready>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut lifecycle = self.lifecycle.lock().await;

        match self.state() {
            RunState::Idle => {}
            RunState::Running => return Err(ServerError::AlreadyRunning),
            RunState::Stopped => return Err(ServerError::AlreadyStopped),
        }

        let span = &self.config.span;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (drain_tx, drain_rx) = watch::channel(false);

        let task = tokio::spawn(serve(drain_rx, ready_tx).instrument(span.clone()));

        let local_addr = match await_startup(ready_rx, self.config.startup_timeout).await {
            Ok(local_addr) => local_addr,
            Err(e) => {
                task.abort();
                tracing::error!(parent: span, error = %e, "Callback server failed to start");
                return Err(e);
            }
        };

        // Only the first successful start records an address; a later one
        // would hit AlreadyStopped above.
        let _ = self.local_addr.set(local_addr);
        lifecycle.listener = Some(Listener::new(local_addr, drain_tx, task));
        self.state.send_replace(RunState::Running);

        tracing::info!(
            parent: span,
            %local_addr,
            path = %self.config.path,
            "Callback server started"
        );
        Ok(local_addr)
    }

    /// Shut the server down, draining in-flight requests within the grace
    /// period and forcing the close past it.
    ///
    /// Idempotent: once stopped, every call returns the recorded outcome.
    pub async fn stop(&self) -> ShutdownOutcome {
        let mut lifecycle = self.lifecycle.lock().await;

        if let Some(outcome) = &lifecycle.outcome {
            tracing::debug!(parent: &self.config.span, ?outcome, "Callback server already stopped");
            return outcome.clone();
        }

        let outcome = match lifecycle.listener.take() {
            Some(mut listener) => {
                tracing::info!(
                    parent: &self.config.span,
                    grace_period = ?self.config.grace_period,
                    "Stopping callback server"
                );
                shutdown_gracefully(&mut listener, self.config.grace_period)
                    .instrument(self.config.span.clone())
                    .await
            }
            None => ShutdownOutcome::Graceful,
        };

        lifecycle.outcome = Some(outcome.clone());
        self.state.send_replace(RunState::Stopped);

        tracing::info!(parent: &self.config.span, ?outcome, "Callback server stopped");
        outcome
    }

    /// React to a termination signal.
    ///
    /// A signal while not running changes nothing and reports
    /// [`ShutdownOutcome::SignalWhileIdle`].
    pub async fn handle_signal(&self, signal: TerminationSignal) -> ShutdownOutcome {
        if !self.is_running() {
            tracing::warn!(parent: &self.config.span, %signal, "Received signal but server is already stopped");
            return ShutdownOutcome::SignalWhileIdle;
        }

        tracing::info!(parent: &self.config.span, %signal, "Received termination signal");
        self.stop().await
    }

    /// Start the server and serve until a signal arrives or `stop` is called
    /// from elsewhere.
    ///
    /// Startup errors are returned as-is. Once the signal source is exhausted
    /// only an external `stop` ends the run.
    pub async fn run<S>(&self, mut signals: S) -> Result<ShutdownOutcome>
    where
        S: SignalSource,
    {
        self.start().await?;

        let mut signals_open = true;
        loop {
            tokio::select! {
                received = signals.recv(), if signals_open => match received {
                    Some(signal) => return Ok(self.handle_signal(signal).await),
                    None => {
                        tracing::debug!(parent: &self.config.span, "Signal source closed");
                        signals_open = false;
                    }
                },
                _ = self.wait_until_stopped() => {
                    return Ok(self.recorded_outcome().await);
                }
            }
        }
    }

    async fn wait_until_stopped(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state == RunState::Stopped).await;
    }

    async fn recorded_outcome(&self) -> ShutdownOutcome {
        self.lifecycle
            .lock()
            .await
            .outcome
            .clone()
            .unwrap_or(ShutdownOutcome::Graceful)
    }
}

impl std::fmt::Debug for CallbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackServer")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Wait for the serving task to report its bind outcome.
async fn await_startup(ready_rx: oneshot::Receiver<Ready>, timeout: Duration) -> Result<SocketAddr> {
    match tokio::time::timeout(timeout, ready_rx).await {
        Ok(Ok(ready)) => ready,
        Ok(Err(_)) => Err(ServerError::Startup(
            "serving task exited before confirming startup".to_string(),
        )),
        Err(_) => Err(ServerError::StartupTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessorError;
    use crate::event::{DeliveryReport, EventKind};
    use crate::processor::Processor;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;
    use warp::http::StatusCode;

    fn local_server() -> CallbackServer {
        CallbackServer::builder()
            .with_addr("127.0.0.1:0")
            .build()
            .unwrap()
    }

    fn report_body() -> String {
        json!({
            "type": EventKind::DeliveryReport.discriminator(),
            "data": {
                "msgId": "1582794001",
                "status": 4001,
                "receiveTime": 1582794001,
                "phone": "13800138000"
            }
        })
        .to_string()
    }

    /// Report processor that never finishes within a test's grace period.
    struct StuckProcessor;

    #[async_trait]
    impl Processor<DeliveryReport> for StuckProcessor {
        async fn process(&self, _event: &DeliveryReport) -> std::result::Result<(), ProcessorError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_reports_bound_address() {
        let server = local_server();
        assert_eq!(server.state(), RunState::Idle);
        assert_eq!(server.local_addr(), None);

        let addr = server.start().await.unwrap();

        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.state(), RunState::Running);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let server = local_server();
        let addr = server.start().await.unwrap();

        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));
        assert_eq!(server.state(), RunState::Running);
        assert_eq!(server.local_addr(), Some(addr));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_terminal_and_idempotent() {
        let server = local_server();
        server.start().await.unwrap();

        let first = server.stop().await;
        assert_eq!(first, ShutdownOutcome::Graceful);
        assert_eq!(server.state(), RunState::Stopped);

        assert_eq!(server.stop().await, first);
        assert_eq!(server.state(), RunState::Stopped);
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let server = local_server();

        assert_eq!(server.stop().await, ShutdownOutcome::Graceful);
        assert_eq!(server.state(), RunState::Stopped);
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_server_idle() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupied.local_addr().unwrap();

        let server = CallbackServer::builder()
            .with_addr(addr.to_string())
            .build()
            .unwrap();

        match server.start().await {
            Err(ServerError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("expected bind error, got {other:?}"),
        }
        assert_eq!(server.state(), RunState::Idle);
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn test_signal_while_idle() {
        let server = local_server();

        let outcome = server.handle_signal(TerminationSignal::Interrupt).await;

        assert_eq!(outcome, ShutdownOutcome::SignalWhileIdle);
        assert_eq!(outcome.exit_code(), 255);
        assert_eq!(server.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_signal_after_stop() {
        let server = local_server();
        server.start().await.unwrap();
        server.stop().await;

        let outcome = server.handle_signal(TerminationSignal::Terminate).await;
        assert_eq!(outcome, ShutdownOutcome::SignalWhileIdle);
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let server = Arc::new(local_server());
        let (tx, rx) = mpsc::channel(1);
        let mut state = server.subscribe();

        let run = tokio::spawn({
            let server = server.clone();
            async move { server.run(rx).await }
        });

        state
            .wait_for(|state| *state == RunState::Running)
            .await
            .unwrap();
        tx.send(TerminationSignal::Terminate).await.unwrap();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, ShutdownOutcome::Graceful);
        assert_eq!(server.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_run_ends_on_external_stop() {
        let server = Arc::new(local_server());
        let (_tx, rx) = mpsc::channel::<TerminationSignal>(1);
        let mut state = server.subscribe();

        let run = tokio::spawn({
            let server = server.clone();
            async move { server.run(rx).await }
        });

        state
            .wait_for(|state| *state == RunState::Running)
            .await
            .unwrap();
        let stopped = server.stop().await;

        assert_eq!(run.await.unwrap().unwrap(), stopped);
    }

    #[tokio::test]
    async fn test_run_propagates_startup_errors() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let server = CallbackServer::builder()
            .with_addr(occupied.local_addr().unwrap().to_string())
            .build()
            .unwrap();
        let (_tx, rx) = mpsc::channel::<TerminationSignal>(1);

        assert!(matches!(server.run(rx).await, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_processor_failure_keeps_server_running() {
        let server = CallbackServer::builder()
            .with_addr("127.0.0.1:0")
            .with_report_processor(|_: &DeliveryReport| -> std::result::Result<(), ProcessorError> {
                Err(ProcessorError::Failed("database down".to_string()))
            })
            .build()
            .unwrap();
        server.start().await.unwrap();

        let response = server
            .handle(CallbackRequest::json("/callback", report_body()))
            .await;

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(server.state(), RunState::Running);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_handle_works_without_start() {
        let server = local_server();

        let response = server
            .handle(CallbackRequest::json("/callback", report_body()))
            .await;

        assert_eq!(response, CallbackResponse::ok());
        assert_eq!(server.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_stuck_request_is_forced_after_grace_period() {
        let server = CallbackServer::builder()
            .with_addr("127.0.0.1:0")
            .with_grace_period(Duration::from_millis(200))
            .with_report_processor(StuckProcessor)
            .build()
            .unwrap();
        let addr = server.start().await.unwrap();

        let request = tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("http://{addr}/callback"))
                .header("content-type", "application/json")
                .body(report_body())
                .send()
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let outcome = server.stop().await;

        assert_eq!(outcome, ShutdownOutcome::Forced);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(server.state(), RunState::Stopped);
        assert!(request.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_times_out_without_confirmation() {
        let (_ready_tx, ready_rx) = oneshot::channel::<Ready>();

        let result = await_startup(ready_rx, Duration::from_secs(5)).await;

        assert!(matches!(result, Err(ServerError::StartupTimeout(t)) if t == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_start_timeout_cancels_attempt_and_stays_idle() {
        let server = CallbackServer::builder()
            .with_addr("127.0.0.1:0")
            .with_startup_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let (cancelled_tx, cancelled_rx) = oneshot::channel::<()>();

        // A serving task that never confirms the bind.
        let result = server
            .start_with(move |_drain_rx, ready_tx| async move {
                let _held = (ready_tx, cancelled_tx);
                std::future::pending::<()>().await;
            })
            .await;

        assert!(matches!(
            result,
            Err(ServerError::StartupTimeout(t)) if t == Duration::from_millis(50)
        ));
        assert_eq!(server.state(), RunState::Idle);
        assert_eq!(server.local_addr(), None);

        // The aborted task drops everything it held.
        tokio::time::timeout(Duration::from_secs(5), cancelled_rx)
            .await
            .expect("serving task was not cancelled")
            .unwrap_err();

        // Idle means a later attempt may still succeed.
        let addr = server.start().await.unwrap();
        assert_eq!(server.state(), RunState::Running);
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.stop().await, ShutdownOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_start_fails_when_serving_task_exits_early() {
        let server = local_server();

        let result = server.start_with(|_drain_rx, ready_tx| async move { drop(ready_tx) }).await;

        assert!(matches!(result, Err(ServerError::Startup(_))));
        assert_eq!(server.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_startup_fails_when_serving_task_vanishes() {
        let (ready_tx, ready_rx) = oneshot::channel::<Ready>();
        drop(ready_tx);

        let result = await_startup(ready_rx, Duration::from_secs(5)).await;

        assert!(matches!(result, Err(ServerError::Startup(_))));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]

            #[test]
            fn repeated_stops_keep_first_outcome(stops in 1usize..6, started in any::<bool>()) {
                let outcomes = tokio_test::block_on(async {
                    let server = local_server();
                    if started {
                        server.start().await.unwrap();
                    }

                    let mut outcomes = Vec::new();
                    for _ in 0..stops {
                        outcomes.push(server.stop().await);
                        assert_eq!(server.state(), RunState::Stopped);
                    }
                    outcomes
                });

                prop_assert!(outcomes.iter().all(|outcome| *outcome == outcomes[0]));
                prop_assert_eq!(&outcomes[0], &ShutdownOutcome::Graceful);
            }
        }
    }
}
