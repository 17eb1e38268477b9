use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::app::{now_iso, AppState};
use crate::auth::require_operator;
use crate::error::ApiResult;
use crate::types::{DefaultSuggestions, VapiSettings, WidgetSettings};

pub const DEFAULT_GREETING: &str = "Hello, how can I help you today?";

/// Value the dashboard's select inputs send for "no choice".
const NONE_SELECTION: &str = "none";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationQuery {
    pub organization_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionsInput {
    pub suggestion1: Option<String>,
    pub suggestion2: Option<String>,
    pub suggestion3: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VapiSettingsInput {
    pub assistant_id: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertWidgetSettingsBody {
    pub greet_message: String,
    #[serde(default)]
    pub default_suggestions: SuggestionsInput,
    #[serde(default)]
    pub vapi_settings: VapiSettingsInput,
}

fn selection(value: Option<String>) -> String {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if v != NONE_SELECTION => v,
        _ => String::new(),
    }
}

impl UpsertWidgetSettingsBody {
    pub fn normalized(self, organization_id: &str) -> WidgetSettings {
        let suggestions = self.default_suggestions;
        WidgetSettings {
            organization_id: organization_id.to_string(),
            greet_message: self.greet_message.trim().to_string(),
            default_suggestions: DefaultSuggestions {
                suggestion1: suggestions.suggestion1.unwrap_or_default(),
                suggestion2: suggestions.suggestion2.unwrap_or_default(),
                suggestion3: suggestions.suggestion3.unwrap_or_default(),
            },
            vapi_settings: VapiSettings {
                assistant_id: selection(self.vapi_settings.assistant_id),
                phone_number: selection(self.vapi_settings.phone_number),
            },
            updated_at: now_iso(),
        }
    }
}

pub async fn load_widget_settings(
    db: &PgPool,
    organization_id: &str,
) -> ApiResult<Option<WidgetSettings>> {
    let row = sqlx::query(
        "SELECT organization_id, greet_message, default_suggestions, vapi_settings, updated_at \
         FROM widget_settings WHERE organization_id = $1",
    )
    .bind(organization_id)
    .fetch_optional(db)
    .await?;
    Ok(row.map(|row| WidgetSettings {
        organization_id: row.get("organization_id"),
        greet_message: row.get("greet_message"),
        default_suggestions: serde_json::from_str(&row.get::<String, _>("default_suggestions"))
            .unwrap_or_default(),
        vapi_settings: serde_json::from_str(&row.get::<String, _>("vapi_settings"))
            .unwrap_or_default(),
        updated_at: row.get("updated_at"),
    }))
}

/// Greeting saved as the first message of every new conversation.
pub async fn greeting_for(db: &PgPool, organization_id: &str) -> ApiResult<String> {
    Ok(load_widget_settings(db, organization_id)
        .await?
        .map(|s| s.greet_message)
        .filter(|g| !g.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_GREETING.to_string()))
}

/// Public reads answer with the bare object, or `null` when nothing is configured.
pub fn public_view(settings: Option<WidgetSettings>) -> Value {
    settings
        .and_then(|settings| serde_json::to_value(settings).ok())
        .unwrap_or(Value::Null)
}

/// Public: the widget reads its settings while loading.
pub async fn get_by_organization_id(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrganizationQuery>,
) -> ApiResult<impl IntoResponse> {
    let settings = load_widget_settings(&state.db, &query.organization_id).await?;
    Ok(Json(public_view(settings)))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let settings = load_widget_settings(&state.db, &org_id).await?;
    Ok(Json(json!({ "widgetSettings": settings })))
}

pub async fn upsert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpsertWidgetSettingsBody>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let settings = body.normalized(&org_id);
    sqlx::query(
        "INSERT INTO widget_settings (organization_id, greet_message, default_suggestions, vapi_settings, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$5) \
         ON CONFLICT (organization_id) DO UPDATE SET greet_message = EXCLUDED.greet_message, \
         default_suggestions = EXCLUDED.default_suggestions, vapi_settings = EXCLUDED.vapi_settings, \
         updated_at = EXCLUDED.updated_at",
    )
    .bind(&settings.organization_id)
    .bind(&settings.greet_message)
    .bind(serde_json::to_string(&settings.default_suggestions)?)
    .bind(serde_json::to_string(&settings.vapi_settings)?)
    .bind(&settings.updated_at)
    .execute(&state.db)
    .await?;
    info!(organization_id = %org_id, "widget settings saved");
    Ok(Json(json!({ "widgetSettings": settings })))
}
