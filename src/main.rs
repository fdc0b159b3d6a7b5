use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde_json::Value;
use tracing::{error, info};

mod config;
mod engine;
mod error;
mod handler;
mod logging;

use config::Config;
use handler::{invocation_deadline, QueryHandler};

#[tokio::main]
async fn main() -> Result<(), Error> {
    logging::init_tracing();

    // Bootstrap once per container lifecycle. Any failure exits non-zero
    // before the serve loop, so no invocation sees a half-configured engine.
    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "load configuration failed");
        e
    })?;
    let engine = engine::bootstrap(&config).map_err(|e| {
        error!(error = %e, "engine bootstrap failed");
        e
    })?;
    let state = engine.state();
    info!(
        pool = ?config.pool,
        connections = state.connections,
        idle = state.idle_connections,
        "engine ready, entering serve loop"
    );

    let handler = QueryHandler::new(engine);
    let handler = &handler;
    run(service_fn(move |event: LambdaEvent<Value>| async move {
        let deadline = invocation_deadline(&event.context);
        handler
            .handle(deadline, &event.payload)
            .await
            .map_err(Error::from)
    }))
    .await
}
