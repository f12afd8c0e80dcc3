//! `jsms-callback`: serve JSMS callbacks until SIGINT or SIGTERM.
//!
//! Configuration comes from `JSMS_CALLBACK_*` and `JSMS_LOG_*` environment
//! variables. The exit status reflects how the server shut down.

use std::process::ExitCode;

use callback_server::logging::init_logging_from_env;
use callback_server::shutdown::EXIT_STARTUP_FAILED;
use callback_server::{CallbackServerBuilder, OsSignals};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_logging_from_env() {
        eprintln!("jsms-callback: {e}");
        return ExitCode::from(EXIT_STARTUP_FAILED);
    }

    let server = match CallbackServerBuilder::from_env().and_then(|builder| builder.build()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Invalid callback server configuration");
            return ExitCode::from(EXIT_STARTUP_FAILED);
        }
    };

    let signals = match OsSignals::new() {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!(error = %e, "Failed to register signal handlers");
            return ExitCode::from(EXIT_STARTUP_FAILED);
        }
    };

    match server.run(signals).await {
        Ok(outcome) => {
            tracing::info!(?outcome, code = outcome.exit_code(), "Exiting");
            ExitCode::from(outcome.exit_code())
        }
        Err(e) => {
            tracing::error!(error = %e, "Callback server failed to start");
            ExitCode::from(EXIT_STARTUP_FAILED)
        }
    }
}
