//! Library root for `bq-answer-bot`.
//!
//! The bot answers Slack mentions from a BigQuery ML knowledge base:
//! - A mention with a question embeds it, finds the closest stored content, and
//!   posts the generation model's grounded answer in the thread.
//! - An empty mention rebuilds the embedding table from the source content table.
//!
//! Slack and BigQuery sit behind traits (`GenericChatClient`, `GenericQueryEngine`)
//! so the handler can be exercised without either.

pub mod base;
pub mod interaction;
pub mod runtime;
pub mod service;

use anyhow::anyhow;
use base::{config::Config, types::Void};
use rustls::crypto;
use tracing::info;

/// Public async entry for the binary crate.
///
/// Sets up necessary services and starts the bot runtime:
/// - Initializes the crypto provider
/// - Creates the runtime context with the query and chat clients
/// - Starts the listener selected by `app_environment`
pub async fn start(config: Config) -> Void {
    info!("Starting bq-answer-bot ...");

    // Start the crypto provider.
    crypto::aws_lc_rs::default_provider().install_default().map_err(|_| anyhow!("Failed to install the rustls crypto provider."))?;

    // Initialize the runtime.
    let runtime = runtime::Runtime::new(config).await?;

    // Start the runtime.
    runtime.start().await?;

    Ok(())
}
