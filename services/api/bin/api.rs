//! Main Entrypoint for the AI Superconnector API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Opening the configured session store (Convex, Postgres or local).
//! 3. Initializing the Twilio client and the chat assistant.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Running the session sweeper and the web server until shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use superconnector_api::{
    config::{Config, SessionBackend},
    convex::ConvexSessionStore,
    db::PgSessionStore,
    router::create_router,
    state::AppState,
    sweeper::spawn_sweeper,
    twilio::{TelephonyClient, TwilioClient},
};
use superconnector_core::{
    Assistant, InMemorySessionStore, SessionService, SessionStore,
    llm_client::{LLMClient, OpenAICompatibleClient},
};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; shutting down");
    }
    info!("Received shutdown signal. Shutting down gracefully...");
    shutdown.cancel();
}

async fn open_store(backend: &SessionBackend) -> anyhow::Result<Arc<dyn SessionStore>> {
    Ok(match backend {
        SessionBackend::Convex { url, deploy_key } => {
            info!(url = %url, "Using Convex session store.");
            Arc::new(ConvexSessionStore::new(
                url.clone(),
                SecretString::from(deploy_key.expose_secret().to_string()),
            ))
        }
        SessionBackend::Postgres { database_url } => {
            let pool = PgPool::connect(database_url)
                .await
                .context("Failed to connect to database")?;
            let store = PgSessionStore::new(pool);
            store.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            Arc::new(store)
        }
        SessionBackend::Local {
            snapshot_path: Some(path),
        } => Arc::new(InMemorySessionStore::open(path).await?),
        SessionBackend::Local {
            snapshot_path: None,
        } => {
            warn!("Using an in-memory session store; sessions are lost on restart.");
            Arc::new(InMemorySessionStore::new())
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Session Store ---
    let store = open_store(&config.backend).await?;
    let sessions = Arc::new(SessionService::new(
        store,
        chrono::Duration::hours(config.session_retention_hours),
    ));

    // --- 4. Initialize Shared Services ---
    let telephony: Option<Arc<dyn TelephonyClient>> = match &config.twilio {
        Some(twilio) => Some(Arc::new(TwilioClient::new(twilio))),
        None => {
            warn!("TWILIO_ACCOUNT_SID/TWILIO_AUTH_TOKEN not set; outbound messages and calls are disabled.");
            None
        }
    };

    let llm: Option<Arc<dyn LLMClient>> = config.openai_api_key.as_ref().map(|key| {
        let openai_config = OpenAIConfig::new()
            .with_api_key(key.expose_secret())
            .with_api_base("https://api.openai.com/v1/");
        Arc::new(OpenAICompatibleClient::new(
            openai_config,
            config.chat_model.clone(),
        )) as Arc<dyn LLMClient>
    });
    if llm.is_none() {
        warn!("OPENAI_API_KEY not set; replies use canned text and calls skip the realtime bridge.");
    }

    let bind_address = config.bind_address;
    let sweep_interval = Duration::from_secs(config.sweep_interval_secs);
    info!(
        backend = config.backend.name(),
        chat_model = %config.chat_model,
        media_stream = config.media_stream_enabled(),
        public_base_url = config.public_base_url.as_deref().unwrap_or("<from Host header>"),
        "Service configured."
    );

    let app_state = Arc::new(AppState {
        sessions: sessions.clone(),
        telephony,
        assistant: Arc::new(Assistant::new(llm)),
        config: Arc::new(config),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // --- 6. Start Sweeper and Server ---
    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(sessions, sweep_interval, shutdown.clone());

    info!(bind_address = %bind_address, "Starting server...");
    let listener = tokio::net::TcpListener::bind(bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    sweeper.await.ok();
    info!("Server has shut down.");
    Ok(())
}
