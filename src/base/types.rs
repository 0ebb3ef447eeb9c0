
pub type Err = anyhow::Error;
pub type Res<T> = Result<T, Err>;
pub type Void = Res<()>;

/// An `app_mention` event, reduced to the fields the bot needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionEvent {
    /// The channel the mention was posted in.
    pub channel: String,
    /// The raw message text, usually starting with a `<@U…>` marker.
    pub text: String,
    /// The message timestamp.
    pub ts: String,
    /// The parent thread timestamp, if the mention was posted inside a thread.
    pub thread_ts: Option<String>,
}

impl MentionEvent {
    /// The thread all replies to this event are posted into.
    pub fn thread_key(&self) -> &str {
        self.thread_ts.as_deref().unwrap_or(&self.ts)
    }
}

/// A single row returned by the query engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRow {
    pub answer: Option<String>,
}

impl QueryRow {
    pub fn new(answer: impl Into<String>) -> Self {
        Self { answer: Some(answer.into()) }
    }
}

/// How the bot receives events from Slack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Events API over HTTP (`APP_ENVIRONMENT=prod`).
    Http,
    /// Socket mode, used everywhere else.
    Socket,
}

impl RunMode {
    pub fn from_environment(app_environment: &str) -> Self {
        if app_environment == "prod" { Self::Http } else { Self::Socket }
    }
}
