pub mod bigquery;

use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::base::{
    queries::{INDEX_REFRESH_COMPLETE, QueryTargets, build_answer_query, build_index_refresh_query},
    types::{QueryRow, Res},
};

// Traits.

/// Generic query engine trait that clients must implement.
///
/// An engine runs a single SQL script to completion and hands back every row it
/// produced, in order. Scripts that produce no rows (DDL, for instance) yield an
/// empty vector.
#[async_trait]
pub trait GenericQueryEngine: Send + Sync + 'static {
    /// Run a query and wait for all of its rows.
    async fn run_query(&self, query: &str) -> Res<Vec<QueryRow>>;
}

// Structs.

/// Query client for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<dyn GenericQueryEngine>,
    targets: Arc<QueryTargets>,
}

impl Deref for QueryClient {
    type Target = dyn GenericQueryEngine;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl QueryClient {
    pub fn new(inner: Arc<dyn GenericQueryEngine>, targets: QueryTargets) -> Self {
        Self { inner, targets: Arc::new(targets) }
    }

    /// Run a query and join the `answer` column of every row.
    ///
    /// Returns `None` when the query produced no rows. Engine failures are not
    /// propagated: their description is returned as the answer.
    #[instrument(skip_all)]
    pub async fn execute(&self, query: &str) -> Option<String> {
        let rows = match self.run_query(query).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("Query failed: {}", err);
                return Some(err.to_string());
            }
        };

        info!("Query returned {} rows.", rows.len());

        if rows.is_empty() {
            return None;
        }

        Some(rows.into_iter().filter_map(|row| row.answer).collect())
    }

    /// Rebuild the embedding table from the source content table.
    #[instrument(skip_all)]
    pub async fn refresh_index(&self) -> String {
        let query = build_index_refresh_query(&self.targets);

        self.execute(&query).await.unwrap_or_else(|| INDEX_REFRESH_COMPLETE.to_string())
    }

    /// Answer a question from the closest stored content.
    ///
    /// `prompt_text` must already be escaped for a string literal.
    #[instrument(skip_all)]
    pub async fn answer(&self, prompt_text: &str) -> Option<String> {
        let query = build_answer_query(&self.targets, prompt_text);

        self.execute(&query).await
    }
}

// Tests.

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub Engine {}

        #[async_trait]
        impl GenericQueryEngine for Engine {
            async fn run_query(&self, query: &str) -> Res<Vec<QueryRow>>;
        }
    }

    fn client(engine: MockEngine) -> QueryClient {
        QueryClient::new(Arc::new(engine), QueryTargets::default())
    }

    #[tokio::test]
    async fn test_execute_concatenates_rows_in_order() {
        let mut engine = MockEngine::new();
        engine
            .expect_run_query()
            .returning(|_| Ok(vec![QueryRow::new("営業時間は"), QueryRow::new("9時から"), QueryRow::new("です。")]));

        assert_eq!(client(engine).execute("SELECT 1").await.as_deref(), Some("営業時間は9時からです。"));
    }

    #[tokio::test]
    async fn test_execute_returns_error_text() {
        let mut engine = MockEngine::new();
        engine.expect_run_query().returning(|_| Err(anyhow::anyhow!("Access Denied: Project project-id")));

        assert_eq!(client(engine).execute("SELECT 1").await.as_deref(), Some("Access Denied: Project project-id"));
    }

    #[tokio::test]
    async fn test_execute_skips_null_answers() {
        let mut engine = MockEngine::new();
        engine.expect_run_query().returning(|_| Ok(vec![QueryRow { answer: None }, QueryRow::new("ok")]));

        assert_eq!(client(engine).execute("SELECT 1").await.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_refresh_index_falls_back_when_empty() {
        let mut engine = MockEngine::new();
        engine
            .expect_run_query()
            .withf(|query| query.contains("CREATE OR REPLACE TABLE"))
            .times(1)
            .returning(|_| Ok(vec![]));

        assert_eq!(client(engine).refresh_index().await, INDEX_REFRESH_COMPLETE);
    }

    #[tokio::test]
    async fn test_refresh_index_reports_error() {
        let mut engine = MockEngine::new();
        engine.expect_run_query().returning(|_| Err(anyhow::anyhow!("Quota exceeded")));

        assert_eq!(client(engine).refresh_index().await, "Quota exceeded");
    }

    #[tokio::test]
    async fn test_answer_has_no_fallback() {
        let mut engine = MockEngine::new();
        engine
            .expect_run_query()
            .withf(|query| query.contains(r#"DEFAULT "hi";"#) && query.contains("ML.GENERATE_TEXT("))
            .times(1)
            .returning(|_| Ok(vec![]));

        assert_eq!(client(engine).answer("hi").await, None);
    }
}
