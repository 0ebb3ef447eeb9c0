//! BigQuery ML query templates.
//!
//! Two scripts drive the bot:
//! - the index refresh, which re-embeds every row of the source content table;
//! - the answer query, which embeds a question, picks the closest stored content
//!   by cosine distance and asks the generation model for a grounded answer.

use crate::base::config::Config;

/// Instruction prepended to every grounded prompt.
pub const ANSWER_INSTRUCTION: &str = "以下の参考情報を踏まえて、質問文に対して回答してください。参照元をつけてください。わからない場合は無理に回答せず「わかりません」と回答してください。";

/// Reply used when the index refresh finishes without returning rows.
pub const INDEX_REFRESH_COMPLETE: &str = "データ更新完了";

/// Interim reply posted before the query runs.
pub const PROCESSING_NOTICE: &str = "問い合わせ対応中";

/// Fully qualified identifiers the templates refer to.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTargets {
    pub project: String,
    pub dataset: String,
    pub embedded_table: String,
    pub embedding_model: String,
    pub generation_model: String,
    pub source_table: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl QueryTargets {
    pub fn from_config(config: &Config) -> Self {
        Self {
            project: config.bigquery_project.clone(),
            dataset: config.bigquery_dataset.clone(),
            embedded_table: config.bigquery_embedded_table.clone(),
            embedding_model: config.bigquery_embedding_model.clone(),
            generation_model: config.bigquery_generation_model.clone(),
            source_table: config.bigquery_source_table.clone(),
            temperature: config.bigquery_temperature,
            max_output_tokens: config.bigquery_max_output_tokens,
        }
    }

    fn qualified(&self, name: &str) -> String {
        format!("`{}.{}.{}`", self.project, self.dataset, name)
    }

    fn embedded_table(&self) -> String {
        self.qualified(&self.embedded_table)
    }

    fn embedding_model(&self) -> String {
        self.qualified(&self.embedding_model)
    }

    fn generation_model(&self) -> String {
        self.qualified(&self.generation_model)
    }

    fn source_table(&self) -> String {
        format!("`{}.{}`", self.project, self.source_table)
    }
}

impl Default for QueryTargets {
    fn default() -> Self {
        Self {
            project: "project-id".to_string(),
            dataset: "llm_dataset".to_string(),
            embedded_table: "embedded_data".to_string(),
            embedding_model: "embedding".to_string(),
            generation_model: "remote_llm".to_string(),
            source_table: "AppSheetDatabases.app-sheet".to_string(),
            temperature: 0.2,
            max_output_tokens: 1000,
        }
    }
}

/// Build the script that replaces the embedded table with fresh embeddings of the source table.
pub fn build_index_refresh_query(targets: &QueryTargets) -> String {
    format!(
        r#"
CREATE OR REPLACE TABLE {embedded} AS (
SELECT * FROM
  ML.GENERATE_TEXT_EMBEDDING( MODEL {model},
  (
  SELECT
    content
  FROM
    {source}
  ),
  STRUCT(TRUE AS flatten_json_output)
  )
);
"#,
        embedded = targets.embedded_table(),
        model = targets.embedding_model(),
        source = targets.source_table(),
    )
}

/// Build the retrieval + generation script for a question.
///
/// `prompt_text` lands inside a double-quoted string literal, so it must already be
/// escaped (see [`crate::interaction::app_mention::escape_query_literal`]).
pub fn build_answer_query(targets: &QueryTargets, prompt_text: &str) -> String {
    format!(
        r#"
DECLARE question_text STRING
DEFAULT "{prompt_text}";

WITH embedded_question AS (
  SELECT
    *
  FROM
    ML.GENERATE_TEXT_EMBEDDING( MODEL {embedding_model},
      (SELECT question_text AS content),
      STRUCT(TRUE AS flatten_json_output))
),
embedded_faq AS (
  SELECT
    *
  FROM
  {embedded} WHERE content is not null
),

search_result AS (
  SELECT
    q.content as question,
    f.content as reference,
    ML.DISTANCE(q.text_embedding, f.text_embedding, 'COSINE') AS vector_distance
  FROM
    `embedded_question` AS q,
    `embedded_faq` AS f
  ORDER BY
    vector_distance
  LIMIT 1
)

, prompt_text AS (
SELECT
  CONCAT(
    '{instruction}',
    ' 質問文：', question,
    ' 参考情報:', reference
  ) AS prompt
FROM
  search_result
)
SELECT
  STRING(ml_generate_text_result.predictions[0].content) AS answer
FROM
  ML.GENERATE_TEXT( MODEL {generation_model},
    (SELECT * FROM `prompt_text`),
    STRUCT(
      {temperature} AS temperature,
      {max_output_tokens} AS max_output_tokens)
  );
"#,
        embedding_model = targets.embedding_model(),
        embedded = targets.embedded_table(),
        instruction = ANSWER_INSTRUCTION,
        generation_model = targets.generation_model(),
        temperature = targets.temperature,
        max_output_tokens = targets.max_output_tokens,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_refresh_query_targets() {
        let query = build_index_refresh_query(&QueryTargets::default());

        assert!(query.contains("CREATE OR REPLACE TABLE `project-id.llm_dataset.embedded_data`"));
        assert!(query.contains("MODEL `project-id.llm_dataset.embedding`"));
        assert!(query.contains("`project-id.AppSheetDatabases.app-sheet`"));
        assert!(query.contains("STRUCT(TRUE AS flatten_json_output)"));
    }

    #[test]
    fn test_answer_query_embeds_prompt() {
        let query = build_answer_query(&QueryTargets::default(), "営業時間は？\\n土日は？");

        assert!(query.contains(r#"DEFAULT "営業時間は？\n土日は？";"#));
        assert!(query.contains("ML.DISTANCE(q.text_embedding, f.text_embedding, 'COSINE')"));
        assert!(query.contains("LIMIT 1"));
        assert!(query.contains(ANSWER_INSTRUCTION));
        assert!(query.contains("MODEL `project-id.llm_dataset.remote_llm`"));
        assert!(query.contains("0.2 AS temperature"));
        assert!(query.contains("1000 AS max_output_tokens"));
        assert!(query.contains("AS answer"));
    }

    #[test]
    fn test_answer_query_uses_configured_targets() {
        let targets = QueryTargets {
            project: "acme".to_string(),
            dataset: "faq".to_string(),
            temperature: 0.5,
            max_output_tokens: 256,
            ..Default::default()
        };

        let query = build_answer_query(&targets, "hello");

        assert!(query.contains("`acme.faq.embedded_data`"));
        assert!(query.contains("0.5 AS temperature"));
        assert!(query.contains("256 AS max_output_tokens"));
        assert!(!query.contains("project-id"));
    }
}
