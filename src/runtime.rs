//! Runtime services and shared state for the bot.

use tracing::instrument;

use crate::{
    base::{
        config::Config,
        types::{Res, Void},
    },
    service::{chat::ChatClient, query::QueryClient},
};

/// Runtime service context that can be shared across the application.
///
/// This struct holds the query client, chat client, and configuration.
/// It is designed to be trivially cloneable, allowing it to be passed around
/// without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct Runtime {
    /// The configuration for the application.
    pub config: Config,
    /// The query engine client instance.
    pub query: QueryClient,
    /// The chat client instance.
    pub chat: ChatClient,
}

impl Runtime {
    /// Create a new runtime instance.
    #[instrument(skip_all)]
    pub async fn new(config: Config) -> Res<Self> {
        // Initialize the query client.
        let query = QueryClient::bigquery(&config);

        // Initialize the chat client.
        let chat = ChatClient::slack(&config, query.clone()).await?;

        Ok(Self { config, query, chat })
    }

    pub async fn start(&self) -> Void {
        self.chat.start().await
    }
}
