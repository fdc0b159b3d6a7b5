use tracing_subscriber::EnvFilter;

// Lambda's advanced logging controls set these; RUST_LOG still wins when present.
const LOG_FORMAT_VAR: &str = "AWS_LAMBDA_LOG_FORMAT";
const LOG_LEVEL_VAR: &str = "AWS_LAMBDA_LOG_LEVEL";

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var(LOG_LEVEL_VAR)
                .map_err(|_| ())
                .and_then(|level| EnvFilter::try_new(level.to_lowercase()).map_err(|_| ()))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var(LOG_FORMAT_VAR).is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    // CloudWatch stamps every line itself.
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .init();
    }
}
