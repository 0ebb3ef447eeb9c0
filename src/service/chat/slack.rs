//! Slack integration for the bot.
//!
//! Events reach the bot in one of two ways:
//! - Socket mode (development), through the app token.
//! - The Events API over HTTP (`APP_ENVIRONMENT=prod`), verified with the signing secret.
//!
//! Either way, an `app_mention` is acknowledged as soon as it arrives and the
//! handling runs on its own task, since a BigQuery round-trip easily outlasts
//! Slack's acknowledgement deadline.

use crate::{
    base::{
        config::Config,
        types::{MentionEvent, Res, RunMode, Void},
    },
    interaction,
    service::query::QueryClient,
};
use async_trait::async_trait;
use axum::{
    Extension, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use slack_morphism::prelude::*;
use tracing::{info, instrument, warn};

use std::{net::SocketAddr, sync::Arc};

use super::{ChatClient, GenericChatClient};

// Type aliases.

type Connector = SlackClientHyperConnector<HttpsConnector<HttpConnector>>;
type FullClient = slack_morphism::SlackClient<Connector>;

/// Path the Events API posts to.
const EVENTS_PATH: &str = "/slack/events";

// Extra methods on `ChatClient` applied by the slack implementation.

impl ChatClient {
    /// Creates a new Slack chat client.
    pub async fn slack(config: &Config, query: QueryClient) -> Res<Self> {
        let client = SlackChatClient::new(config, query).await?;
        Ok(Self { inner: Arc::new(client) })
    }
}

impl From<SlackChatClient> for ChatClient {
    fn from(client: SlackChatClient) -> Self {
        Self { inner: Arc::new(client) }
    }
}

// Structs.

/// User state for the slack socket client.
struct SlackUserState {
    chat: ChatClient,
    query: QueryClient,
}

/// Slack client implementation.
#[derive(Clone)]
struct SlackChatClient {
    app_token: SlackApiToken,
    bot_token: SlackApiToken,
    signing_secret: String,
    mode: RunMode,
    port: u16,
    client: Arc<FullClient>,
    query: QueryClient,
}

impl SlackChatClient {
    /// Create a new Slack chat client.
    #[instrument(name = "SlackChatClient::new", skip_all)]
    pub async fn new(config: &Config, query: QueryClient) -> Res<Self> {
        // Initialize tokens.

        let app_token = SlackApiToken::new(SlackApiTokenValue(config.slack_app_token.clone()));
        let bot_token = SlackApiToken::new(SlackApiTokenValue(config.slack_bot_token.clone()));

        // Initialize the Slack client.

        let https_connector = HttpsConnector::<HttpConnector>::builder().with_native_roots()?.https_only().enable_all_versions().build();
        let connector = SlackClientHyperConnector::with_connector(https_connector);
        let client = Arc::new(slack_morphism::SlackClient::new(connector));

        // Check the bot token and log who we are.

        let session = client.open_session(&bot_token);
        let bot_user = session.auth_test().await?;

        info!("Slack bot user ID: {}", bot_user.user_id.0);

        Ok(Self {
            app_token,
            bot_token,
            signing_secret: config.slack_signing_secret.clone(),
            mode: config.run_mode(),
            port: config.port,
            client,
            query,
        })
    }

    /// Receive events over a socket mode connection.
    async fn start_socket_mode(&self) -> Void {
        info!("Starting socket mode listener ...");

        let socket_mode_callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

        let listener_environment = Arc::new(SlackClientEventsListenerEnvironment::new(self.client.clone()).with_user_state(SlackUserState {
            chat: ChatClient::from(self.clone()),
            query: self.query.clone(),
        }));

        let socket_mode_listener = Arc::new(SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment.clone(),
            socket_mode_callbacks,
        ));

        // Register an app token to listen for events,
        socket_mode_listener.listen_for(&self.app_token).await?;

        // Start WS connections calling Slack API to get WS url for the token,
        // and wait for Ctrl-C to shutdown.
        socket_mode_listener.serve().await;

        Ok(())
    }

    /// Receive events through the Events API on `EVENTS_PATH`.
    async fn start_http(&self) -> Void {
        let app = events_router(self.client.clone(), &self.signing_secret, ChatClient::from(self.clone()), self.query.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let tcp_listener = tokio::net::TcpListener::bind(addr).await?;

        info!("Listening for Slack events on http://{}{} ...", addr, EVENTS_PATH);

        axum::serve(tcp_listener, app).await?;

        Ok(())
    }
}

/// Build the Events API router; requests are signature-checked before they reach the handler.
fn events_router(client: Arc<FullClient>, signing_secret: &str, chat: ChatClient, query: QueryClient) -> Router {
    let listener_environment = Arc::new(SlackClientEventsListenerEnvironment::new(client));
    let listener = SlackEventsAxumListener::<HttpsConnector<HttpConnector>>::new(listener_environment);
    let signing_secret: SlackSigningSecret = signing_secret.to_string().into();

    Router::new().route(
        EVENTS_PATH,
        post(move |Extension(event): Extension<SlackPushEvent>| handle_http_push_event(event, chat.clone(), query.clone()))
            .layer(listener.events_layer(&signing_secret).with_event_extractor(SlackEventsExtractors::push_event())),
    )
}

#[async_trait]
impl GenericChatClient for SlackChatClient {
    async fn start(&self) -> Void {
        match self.mode {
            RunMode::Http => self.start_http().await,
            RunMode::Socket => self.start_socket_mode().await,
        }
    }

    #[instrument(skip(self))]
    async fn send_message(&self, channel_id: &str, thread_ts: &str, text: &str) -> Void {
        let message = SlackMessageContent::new().with_text(text.to_string());

        let request = SlackApiChatPostMessageRequest::new(SlackChannelId(channel_id.to_string()), message)
            .with_thread_ts(SlackTs(thread_ts.to_string()))
            .with_link_names(true);

        let session = self.client.open_session(&self.bot_token);

        let _ = session.chat_post_message(&request).await.map_err(|e| anyhow::anyhow!("Failed to send message: {}", e))?;

        Ok(())
    }
}

// Event dispatch.

/// Reduce a Slack `app_mention` event to what the handler needs.
fn mention_event(event: SlackAppMentionEvent) -> MentionEvent {
    MentionEvent {
        channel: event.channel.0,
        text: event.content.text.unwrap_or_default(),
        ts: event.origin.ts.0,
        thread_ts: event.origin.thread_ts.map(|ts| ts.0),
    }
}

/// Hand a callback body to its interaction handler without waiting for it.
fn dispatch_event(event: SlackEventCallbackBody, chat: &ChatClient, query: &QueryClient) {
    match event {
        SlackEventCallbackBody::AppMention(slack_app_mention_event) => {
            info!("Received app mention event ...");
            interaction::app_mention::handle_app_mention(mention_event(slack_app_mention_event), chat.clone(), query.clone());
        }
        _ => {
            warn!("Received unhandled push event.")
        }
    }
}

/// Handles push events from the socket mode listener.
///
/// Returning is what acknowledges the envelope, so this never waits on the handler.
#[instrument(skip_all)]
async fn handle_push_event(event_callback: SlackPushEventCallback, _client: Arc<SlackHyperClient>, states: SlackClientEventsUserState) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let states = states.read().await;
    let user_state = states.get_user_state::<SlackUserState>().ok_or(anyhow::anyhow!("Failed to get user state"))?;

    dispatch_event(event_callback.event, &user_state.chat, &user_state.query);

    Ok(())
}

/// Handles push events from the Events API.
///
/// The signature has already been verified by the events layer; the response is the acknowledgement.
#[instrument(skip_all)]
async fn handle_http_push_event(event: SlackPushEvent, chat: ChatClient, query: QueryClient) -> Response {
    match event {
        SlackPushEvent::UrlVerification(url_verification) => url_verification.challenge.into_response(),
        SlackPushEvent::EventCallback(event_callback) => {
            dispatch_event(event_callback.event, &chat, &query);
            StatusCode::OK.into_response()
        }
        _ => {
            warn!("Received unhandled Events API request.");
            StatusCode::OK.into_response()
        }
    }
}

// Tests.
