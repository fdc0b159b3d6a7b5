use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lambda_runtime::Context;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, instrument};

use crate::config::{self, Lookup};
use crate::engine::{quote_literal, Engine};
use crate::error::HandlerError;

// Holds the process-wide engine; the target object comes from configuration
// and the request payload is ignored.
#[derive(Clone)]
pub struct QueryHandler {
    engine: Engine,
    lookup: Lookup,
}

impl QueryHandler {
    pub fn new(engine: Engine) -> Self {
        Self::with_lookup(engine, config::env_lookup())
    }

    pub fn with_lookup(engine: Engine, lookup: Lookup) -> Self {
        Self { engine, lookup }
    }

    // Count the rows of the configured parquet object. No row yields "".
    #[instrument(skip(self, _request))]
    pub async fn handle(
        &self,
        deadline: Option<Instant>,
        _request: &Value,
    ) -> Result<String, HandlerError> {
        // Looked up per invocation so a missing value fails the request, not the process.
        let object_uri = config::object_uri(&self.lookup)?;
        let sql = count_sql(&object_uri);

        match self.engine.query_count(sql, deadline).await? {
            Some(count) => {
                info!(object = %object_uri, count, "counted rows");
                Ok(format!("count: {count}\n"))
            }
            None => Ok(String::new()),
        }
    }
}

fn count_sql(object_uri: &str) -> String {
    format!(
        "select count(*) from read_parquet({});",
        quote_literal(object_uri)
    )
}

// Runtime deadline (epoch millis) as a tokio instant; 0 means none.
pub fn invocation_deadline(ctx: &Context) -> Option<Instant> {
    if ctx.deadline == 0 {
        return None;
    }
    let deadline = UNIX_EPOCH + Duration::from_millis(ctx.deadline);
    let remaining = deadline
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Some(Instant::now() + remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{map_lookup, PoolSettings, OBJECT_URI_VAR};
    use std::path::Path;
    use tempfile::TempDir;

    fn engine() -> Engine {
        let settings = PoolSettings {
            max_open: 4,
            max_idle: 1,
            ..PoolSettings::default()
        };
        Engine::open(&settings).unwrap()
    }

    fn write_parquet(dir: &Path, name: &str, rows: usize) -> String {
        let path = dir.join(name);
        let path = path.to_str().unwrap().to_string();
        let conn = duckdb::Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!(
            "COPY (SELECT range AS id FROM range({rows})) TO {} (FORMAT parquet);",
            quote_literal(&path)
        ))
        .unwrap();
        path
    }

    fn handler_for(engine: Engine, uri: &str) -> QueryHandler {
        QueryHandler::with_lookup(engine, map_lookup(&[(OBJECT_URI_VAR, uri)]))
    }

    #[test]
    fn count_sql_quotes_the_uri() {
        assert_eq!(
            count_sql("s3://bucket/o'brien.parquet"),
            "select count(*) from read_parquet('s3://bucket/o''brien.parquet');"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn counts_rows_of_object() {
        let dir = TempDir::new().unwrap();
        let uri = write_parquet(dir.path(), "rows.parquet", 42);

        let out = handler_for(engine(), &uri)
            .handle(None, &Value::Null)
            .await
            .unwrap();
        assert_eq!(out, "count: 42\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn empty_object_counts_zero() {
        let dir = TempDir::new().unwrap();
        let uri = write_parquet(dir.path(), "empty.parquet", 0);

        let out = handler_for(engine(), &uri)
            .handle(None, &serde_json::json!({"ignored": true}))
            .await
            .unwrap();
        assert_eq!(out, "count: 0\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn missing_object_is_a_query_error() {
        let dir = TempDir::new().unwrap();
        let uri = dir.path().join("absent.parquet");

        let err = handler_for(engine(), uri.to_str().unwrap())
            .handle(None, &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::QueryExecution(_)), "{err}");
        assert!(err.to_string().starts_with("query failed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unset_object_uri_fails_without_querying() {
        let engine = engine();
        let before = engine.state();

        for lookup in [map_lookup(&[]), map_lookup(&[(OBJECT_URI_VAR, "")])] {
            let handler = QueryHandler::with_lookup(engine.clone(), lookup);
            let err = handler.handle(None, &Value::Null).await.unwrap_err();
            assert!(matches!(err, HandlerError::Configuration(_)), "{err}");
            assert!(err.to_string().contains("not set"));
        }
        assert_eq!(engine.state(), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_invocations_share_one_engine() {
        let dir = TempDir::new().unwrap();
        let uri = write_parquet(dir.path(), "shared.parquet", 42);
        let handler = handler_for(engine(), &uri);

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle(None, &Value::Null).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "count: 42\n");
        }
    }

    #[test]
    fn zero_deadline_means_unbounded() {
        let mut ctx = Context::default();
        ctx.deadline = 0;
        assert!(invocation_deadline(&ctx).is_none());
    }

    #[tokio::test]
    async fn past_deadline_maps_to_now() {
        let mut ctx = Context::default();
        ctx.deadline = 1;
        let deadline = invocation_deadline(&ctx).unwrap();
        assert!(deadline <= Instant::now());
    }
}
