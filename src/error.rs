use thiserror::Error;

/// Missing or malformed environment configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Cold-start engine failures. Any of these keeps the process out of the serve loop.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("open duckdb failed: {0}")]
    EngineOpen(#[source] duckdb::Error),
    #[error("build connection pool failed: {0}")]
    PoolBuild(#[source] r2d2::Error),
    #[error("load extensions failed: {0}")]
    ExtensionLoad(#[source] duckdb::Error),
    #[error("create secret failed: {0}")]
    SecretRegistration(#[source] duckdb::Error),
}

/// Per-invocation failures, returned to the runtime as the invocation error.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("acquire connection failed: {0}")]
    Acquire(#[source] r2d2::Error),
    #[error("query failed: {0}")]
    QueryExecution(#[source] duckdb::Error),
    #[error("scan result failed: {0}")]
    ResultDecode(#[source] duckdb::Error),
    #[error("query canceled: invocation deadline exceeded")]
    Canceled,
    #[error("query task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
