use std::{
    error::Error,
    sync::{atomic::AtomicUsize, Arc},
};

use axum::{
    extract::DefaultBodyLimit,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::ai::AiClient;
use crate::config::Settings;
use crate::realtime::{ws_handler, RealtimeState};
use crate::secrets::{PgSecretStore, SecretStore};
use crate::storage::Storage;
use crate::{
    auth, contact_sessions, conversations, files, messages, organizations, plugins, secrets, storage,
    subscriptions, users, vapi, widget, widget_settings,
};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct AppState {
    pub db: PgPool,
    pub settings: Settings,
    pub http: reqwest::Client,
    pub ai: AiClient,
    pub storage: Storage,
    pub secrets: Arc<dyn SecretStore>,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
}

impl AppState {
    pub fn new(db: PgPool, settings: Settings) -> Self {
        let http = reqwest::Client::new();
        Self {
            ai: AiClient::new(http.clone(), &settings),
            storage: Storage::new(&settings),
            secrets: Arc::new(PgSecretStore::new(db.clone())),
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
            db,
            settings,
            http,
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/me", get(auth::me))
        .route("/api/organizations/validate", post(organizations::validate))
        .route("/api/contact-sessions", post(contact_sessions::create))
        .route("/api/contact-sessions/validate", post(contact_sessions::validate))
        .route(
            "/api/contact-sessions/{contact_session_id}",
            get(contact_sessions::get_for_operator),
        )
        .route("/api/widget/bootstrap", get(widget::bootstrap))
        .route("/api/widget/settings", get(widget_settings::get_by_organization_id))
        .route("/api/widget/vapi-secrets", get(vapi::get_vapi_secrets))
        .route(
            "/api/widget/conversations",
            get(conversations::get_many_public).post(conversations::create),
        )
        .route(
            "/api/widget/conversations/{conversation_id}",
            get(conversations::get_one_public),
        )
        .route(
            "/api/widget/messages",
            get(messages::get_many_public).post(messages::create_public),
        )
        .route("/api/conversations", get(conversations::get_many))
        .route("/api/conversations/{conversation_id}", get(conversations::get_one))
        .route(
            "/api/conversations/{conversation_id}/status",
            patch(conversations::update_status),
        )
        .route("/api/messages", get(messages::get_many).post(messages::create_message))
        .route("/api/messages/enhance", post(messages::enhance_response))
        .route(
            "/api/files",
            get(files::list)
                .post(files::add_file)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/files/{entry_id}", axum::routing::delete(files::delete_file))
        .route("/api/storage/{storage_id}", get(storage::serve_object))
        .route("/api/secrets", post(secrets::upsert))
        .route(
            "/api/plugins/{service}",
            get(plugins::get_one).delete(plugins::remove),
        )
        .route("/api/subscription", get(subscriptions::get_by_organization_id))
        .route("/api/webhooks/billing", post(subscriptions::billing_webhook))
        .route("/api/vapi/assistants", get(vapi::get_assistants))
        .route("/api/vapi/phone-numbers", get(vapi::get_phone_numbers))
        .route(
            "/api/widget-settings",
            get(widget_settings::get_one).put(widget_settings::upsert),
        )
        .route(
            "/api/integrations/{integration}/snippet",
            get(widget::embed_snippet),
        )
        .route("/api/users", get(users::get_many).post(users::add))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

pub async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::from_env();

    let db = PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .connect(&settings.database_url)
        .await
        .map_err(|err| format!("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars): {err}"))?;

    sqlx::migrate!("./migrations").run(&db).await?;

    let port = settings.port;
    let state = Arc::new(AppState::new(db, settings));
    state.storage.ensure_dir().await?;
    if !state.ai.is_configured() {
        tracing::warn!("OPENAI_API_KEY is not set; the support agent will use canned replies");
    }

    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "support desk server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
