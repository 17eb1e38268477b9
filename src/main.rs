mod agent;
mod ai;
mod app;
mod auth;
mod config;
mod contact_sessions;
mod conversations;
mod error;
mod extract;
mod files;
mod messages;
mod organizations;
mod plugins;
mod prompting;
mod rag;
mod realtime;
mod secrets;
mod storage;
mod subscriptions;
mod types;
mod users;
mod vapi;
mod widget;
mod widget_settings;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info,sqlx=warn")),
        )
        .init();

    if let Err(err) = app::run().await {
        tracing::error!(error = %err, "server exited with error");
        std::process::exit(1);
    }
}
