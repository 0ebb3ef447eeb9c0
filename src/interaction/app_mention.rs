//! Answers `app_mention` events with BigQuery.
//!
//! Each mention gets two replies in its thread: an interim notice, then the
//! answer (or the refresh result, or the error text).

use std::sync::LazyLock;

use regex::Regex;
use tracing::{Instrument, error, info, instrument};

use crate::{
    base::{
        queries::PROCESSING_NOTICE,
        types::{MentionEvent, Void},
    },
    service::{chat::ChatClient, query::QueryClient},
};

/// Cleaned texts shorter than this (in characters) trigger an index refresh instead of a question.
const MIN_QUESTION_CHARS: usize = 2;

static MENTION_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<@[^>]*>").expect("mention marker pattern is valid"));

/// Handles the app mention event.
///
/// Spawns a new task for the handling and returns immediately.
#[instrument(skip_all)]
pub fn handle_app_mention(event: MentionEvent, chat: ChatClient, query: QueryClient) {
    tokio::spawn(async move {
        // Process the event.
        let result = handle_app_mention_internal(event, &chat, &query).in_current_span().await;

        // Log any errors.
        if let Err(err) = &result {
            error!("Error while handling: {}", err);
        }
    });
}

#[instrument(skip_all, fields(channel = %event.channel, thread_ts = %event.thread_key()))]
async fn handle_app_mention_internal(event: MentionEvent, chat: &ChatClient, query: &QueryClient) -> Void {
    let question = strip_mention(&event.text);
    let thread_ts = event.thread_key();

    chat.send_message(&event.channel, thread_ts, PROCESSING_NOTICE).await?;

    // The path is chosen on the cleaned text, before literal escaping adds characters.
    let answer = if clean_mention_text(&event.text).chars().count() < MIN_QUESTION_CHARS {
        info!("Refreshing the embedding index ...");
        query.refresh_index().await
    } else {
        info!("Answering question ...");
        query.answer(&escape_query_literal(&question)).await.unwrap_or_default()
    };

    chat.send_message(&event.channel, thread_ts, &answer).await?;

    Ok(())
}

/// Drop mention markers and leading whitespace.
fn strip_mention(raw: &str) -> String {
    MENTION_MARKER.replace_all(raw, "").trim_start().to_string()
}

/// Turn a raw mention into the question text.
///
/// Mention markers are dropped, leading whitespace is trimmed, and newlines
/// become the two characters `\n`.
pub fn clean_mention_text(raw: &str) -> String {
    strip_mention(raw).replace('\n', "\\n")
}

/// Escape text so it can sit inside a double-quoted query literal.
///
/// Quotes and backslashes are escaped and newlines become `\n`.
pub fn escape_query_literal(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());

    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }

    escaped
}

// Tests.
