//! BigQuery REST implementation of the query engine.
//!
//! Queries are submitted through `jobs.query` and then followed with
//! `jobs.getQueryResults` until the job completes and every result page has
//! been read. There is no overall deadline; the call blocks until BigQuery
//! answers or fails.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::base::{
    config::Config,
    queries::QueryTargets,
    types::{QueryRow, Res, Void},
};

use super::{GenericQueryEngine, QueryClient};

/// BigQuery REST API root.
const API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Metadata server endpoint for the default service account token.
const METADATA_TOKEN_URL: &str = "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Scopes requested from the metadata server. Drive is needed for sheet-backed source tables.
const TOKEN_SCOPES: &str = "https://www.googleapis.com/auth/bigquery,https://www.googleapis.com/auth/drive";

/// Server-side wait per request while a job is still running.
const POLL_TIMEOUT_MS: u64 = 10_000;

/// Name of the column every answer query must return.
const ANSWER_COLUMN: &str = "answer";

// Extra methods on `QueryClient` applied by the bigquery implementation.

impl QueryClient {
    pub fn bigquery(config: &Config) -> Self {
        let engine = BigQueryEngine::new(config);
        Self::new(Arc::new(engine), QueryTargets::from_config(config))
    }
}

// Wire types.

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    location: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableField>,
}

#[derive(Debug, Deserialize)]
struct TableField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

/// The follow-up `getQueryResults` call a response asks for.
#[derive(Debug, Clone, PartialEq)]
struct PageRequest {
    job: JobReference,
    page_token: Option<String>,
}

// Structs.

/// Where OAuth access tokens come from.
#[derive(Debug, Clone)]
enum TokenSource {
    /// A token supplied through configuration.
    Static(String),
    /// The GCE / Cloud Run metadata server, asked on every query.
    Metadata,
}

/// BigQuery engine backed by the REST API.
#[derive(Clone)]
pub struct BigQueryEngine {
    http: reqwest::Client,
    project: String,
    location: String,
    token: TokenSource,
}

impl BigQueryEngine {
    /// Create a new BigQuery engine.
    #[instrument(name = "BigQueryEngine::new", skip_all)]
    pub fn new(config: &Config) -> Self {
        let token = match config.google_access_token.as_deref() {
            Some(token) if !token.is_empty() => TokenSource::Static(token.to_string()),
            _ => TokenSource::Metadata,
        };

        Self {
            http: reqwest::Client::new(),
            project: config.bigquery_project.clone(),
            location: config.bigquery_location.clone(),
            token,
        }
    }

    /// Resolve an access token for this call.
    async fn access_token(&self) -> Res<String> {
        match &self.token {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Metadata => {
                let token: MetadataToken = send(self.http.get(METADATA_TOKEN_URL).header("Metadata-Flavor", "Google").query(&[("scopes", TOKEN_SCOPES)])).await?;
                Ok(token.access_token)
            }
        }
    }

    /// Fetch job status or the next result page.
    async fn get_query_results(&self, token: &str, page: PageRequest) -> Res<QueryResponse> {
        let url = format!("{API_BASE}/projects/{}/queries/{}", page.job.project_id, page.job.job_id);
        let location = page.job.location.as_deref().unwrap_or(&self.location);
        let timeout = POLL_TIMEOUT_MS.to_string();

        let mut params = vec![("location", location), ("timeoutMs", timeout.as_str())];
        if let Some(page_token) = page.page_token.as_deref() {
            params.push(("pageToken", page_token));
        }

        send(self.http.get(url).bearer_auth(token).query(&params)).await
    }
}

#[async_trait]
impl GenericQueryEngine for BigQueryEngine {
    #[instrument(skip_all)]
    async fn run_query(&self, query: &str) -> Res<Vec<QueryRow>> {
        let token = self.access_token().await?;

        let request = QueryRequest {
            query,
            use_legacy_sql: false,
            location: &self.location,
            timeout_ms: POLL_TIMEOUT_MS,
        };

        let url = format!("{API_BASE}/projects/{}/queries", self.project);
        let response: QueryResponse = send(self.http.post(url).bearer_auth(&token).json(&request)).await?;

        collect_all(response, |page| self.get_query_results(&token, page)).await
    }
}

// Helpers.

/// Send a request and decode the JSON body, surfacing BigQuery's error message on failure.
async fn send<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Res<T> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<ErrorEnvelope>(&body).map(|e| e.error.message).unwrap_or(body);
        return Err(anyhow!("{} {}", status.as_u16(), message));
    }

    Ok(serde_json::from_str(&body)?)
}

/// Follow a `jobs.query` response until the job is complete and every page is read.
async fn collect_all<F, Fut>(mut response: QueryResponse, mut fetch: F) -> Res<Vec<QueryRow>>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Res<QueryResponse>>,
{
    let mut rows = Vec::new();

    while let Some(page) = next_page(&mut response, &mut rows)? {
        response = fetch(page).await?;
    }

    Ok(rows)
}

/// Take the rows of a completed response and decide what to fetch next.
///
/// Returns `None` once the last page has been read.
fn next_page(response: &mut QueryResponse, rows: &mut Vec<QueryRow>) -> Res<Option<PageRequest>> {
    let page_token = if response.job_complete {
        collect_rows(response, rows)?;

        match response.page_token.take() {
            Some(page_token) => Some(page_token),
            None => return Ok(None),
        }
    } else {
        debug!("Job still running, polling ...");
        None
    };

    let job = response.job_reference.clone().ok_or(anyhow!("BigQuery response is missing the job reference."))?;

    Ok(Some(PageRequest { job, page_token }))
}

/// Append the `answer` cell of every row in a completed page.
fn collect_rows(response: &QueryResponse, rows: &mut Vec<QueryRow>) -> Void {
    if response.rows.is_empty() {
        return Ok(());
    }

    let index = response
        .schema
        .as_ref()
        .and_then(|schema| schema.fields.iter().position(|field| field.name == ANSWER_COLUMN))
        .ok_or(anyhow!("Query result has no `{}` column.", ANSWER_COLUMN))?;

    for row in &response.rows {
        let answer = match row.f.get(index).map(|cell| &cell.v) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        rows.push(QueryRow { answer });
    }

    Ok(())
}

// Tests.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::config::ConfigInner;

    fn response(json: Value) -> QueryResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_collect_rows_reads_answer_column() {
        let response = response(serde_json::json!({
            "jobComplete": true,
            "jobReference": { "projectId": "project-id", "jobId": "job_1", "location": "asia-northeast1" },
            "schema": { "fields": [{ "name": "vector_distance", "type": "FLOAT" }, { "name": "answer", "type": "STRING" }] },
            "rows": [
                { "f": [{ "v": "0.1" }, { "v": "こんにちは" }] },
                { "f": [{ "v": "0.2" }, { "v": null }] }
            ]
        }));

        let mut rows = Vec::new();
        collect_rows(&response, &mut rows).unwrap();

        assert_eq!(rows, vec![QueryRow::new("こんにちは"), QueryRow { answer: None }]);
    }

    #[test]
    fn test_collect_rows_without_rows() {
        let response = response(serde_json::json!({
            "jobComplete": true,
            "jobReference": { "projectId": "project-id", "jobId": "job_2" }
        }));

        let mut rows = Vec::new();
        collect_rows(&response, &mut rows).unwrap();

        assert!(rows.is_empty());
        assert!(response.page_token.is_none());
    }

    #[test]
    fn test_collect_rows_missing_answer_column() {
        let response = response(serde_json::json!({
            "jobComplete": true,
            "schema": { "fields": [{ "name": "content", "type": "STRING" }] },
            "rows": [{ "f": [{ "v": "x" }] }]
        }));

        let mut rows = Vec::new();
        let err = collect_rows(&response, &mut rows).unwrap_err();

        assert!(err.to_string().contains("`answer`"));
    }

    #[test]
    fn test_incomplete_job_deserializes() {
        let response = response(serde_json::json!({
            "kind": "bigquery#queryResponse",
            "jobComplete": false,
            "jobReference": { "projectId": "project-id", "jobId": "job_3", "location": "asia-northeast1" }
        }));

        assert!(!response.job_complete);
        assert_eq!(response.job_reference.unwrap().job_id, "job_3");
    }

    fn job() -> JobReference {
        JobReference {
            project_id: "project-id".to_string(),
            job_id: "job_1".to_string(),
            location: Some("asia-northeast1".to_string()),
        }
    }

    fn answer_page(answers: &[&str], page_token: Option<&str>) -> Value {
        let rows: Vec<Value> = answers.iter().map(|a| serde_json::json!({ "f": [{ "v": a }] })).collect();

        serde_json::json!({
            "jobComplete": true,
            "jobReference": { "projectId": "project-id", "jobId": "job_1", "location": "asia-northeast1" },
            "schema": { "fields": [{ "name": "answer", "type": "STRING" }] },
            "rows": rows,
            "pageToken": page_token,
        })
    }

    /// Drive `collect_all` over canned follow-up responses, recording every page request.
    async fn run_pages(first: Value, rest: Vec<Value>) -> (Res<Vec<QueryRow>>, Vec<PageRequest>) {
        let mut rest = rest.into_iter();
        let mut requests = Vec::new();

        let result = collect_all(response(first), |page| {
            requests.push(page);
            let next = rest.next().map(response).ok_or(anyhow!("Unexpected page request."));
            async move { next }
        })
        .await;

        (result, requests)
    }

    #[tokio::test]
    async fn test_polls_until_job_complete() {
        let running = serde_json::json!({
            "jobComplete": false,
            "jobReference": { "projectId": "project-id", "jobId": "job_1", "location": "asia-northeast1" }
        });

        let (result, requests) = run_pages(running.clone(), vec![running, answer_page(&["done"], None)]).await;

        assert_eq!(result.unwrap(), vec![QueryRow::new("done")]);
        assert_eq!(requests, vec![PageRequest { job: job(), page_token: None }; 2]);
    }

    #[tokio::test]
    async fn test_follows_page_tokens() {
        let (result, requests) = run_pages(answer_page(&["a", "b"], Some("page-2")), vec![answer_page(&["c"], None)]).await;

        assert_eq!(result.unwrap(), vec![QueryRow::new("a"), QueryRow::new("b"), QueryRow::new("c")]);
        assert_eq!(
            requests,
            vec![PageRequest {
                job: job(),
                page_token: Some("page-2".to_string())
            }]
        );
    }

    #[tokio::test]
    async fn test_single_complete_page_needs_no_follow_up() {
        let (result, requests) = run_pages(answer_page(&["only"], None), vec![]).await;

        assert_eq!(result.unwrap(), vec![QueryRow::new("only")]);
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_running_job_without_reference_fails() {
        let (result, requests) = run_pages(serde_json::json!({ "jobComplete": false }), vec![]).await;

        assert!(result.unwrap_err().to_string().contains("job reference"));
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_page_fetch_error_propagates() {
        let mut calls = 0;
        let result = collect_all(response(answer_page(&["a"], Some("page-2"))), |_| {
            calls += 1;
            async { Err(anyhow!("503 Backend error")) }
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "503 Backend error");
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_request_serialization() {
        let request = QueryRequest {
            query: "SELECT 1",
            use_legacy_sql: false,
            location: "asia-northeast1",
            timeout_ms: POLL_TIMEOUT_MS,
        };

        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["useLegacySql"], false);
        assert_eq!(json["location"], "asia-northeast1");
        assert_eq!(json["timeoutMs"], 10_000);
    }

    #[test]
    fn test_token_source_selection() {
        let config = Config {
            inner: Arc::new(ConfigInner {
                google_access_token: Some("ya29.token".to_string()),
                ..Default::default()
            }),
        };
        assert!(matches!(BigQueryEngine::new(&config).token, TokenSource::Static(ref t) if t == "ya29.token"));

        let config = Config {
            inner: Arc::new(ConfigInner {
                google_access_token: Some(String::new()),
                ..Default::default()
            }),
        };
        assert!(matches!(BigQueryEngine::new(&config).token, TokenSource::Metadata));
    }
}
