//! Billing state per organization, fed by the billing provider's webhook.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::app::{now_iso, AppState};
use crate::auth::require_operator;
use crate::error::{ApiError, ApiResult};
use crate::types::Subscription;

pub const SIGNATURE_HEADER: &str = "x-billing-signature";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingEvent {
    pub organization_id: String,
    pub status: String,
}

/// HMAC-SHA256 of the raw body, hex encoded, optionally prefixed `sha256=`.
/// Without a configured secret every request is accepted.
pub fn verify_billing_signature(secret: Option<&str>, signature_header: Option<&str>, body: &[u8]) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return true;
    };
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

pub async fn load_subscription(db: &PgPool, organization_id: &str) -> ApiResult<Option<Subscription>> {
    let row = sqlx::query(
        "SELECT organization_id, status, updated_at FROM subscriptions WHERE organization_id = $1",
    )
    .bind(organization_id)
    .fetch_optional(db)
    .await?;
    Ok(row.map(|row| Subscription {
        organization_id: row.get("organization_id"),
        status: row.get("status"),
        updated_at: row.get("updated_at"),
    }))
}

pub async fn upsert_subscription(db: &PgPool, organization_id: &str, status: &str) -> ApiResult<()> {
    sqlx::query(
        "INSERT INTO subscriptions (organization_id, status, updated_at) VALUES ($1,$2,$3) \
         ON CONFLICT (organization_id) DO UPDATE SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at",
    )
    .bind(organization_id)
    .bind(status)
    .bind(now_iso())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get_by_organization_id(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let subscription = load_subscription(&state.db, &org_id).await?;
    Ok(Json(json!({ "subscription": subscription })))
}

pub async fn billing_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if !verify_billing_signature(state.settings.billing_webhook_secret.as_deref(), signature, &body) {
        warn!("billing webhook signature mismatch");
        return Err(ApiError::unauthorized("Invalid signature"));
    }
    let event: BillingEvent = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid billing event: {err}")))?;
    let organization_id = event.organization_id.trim();
    let status = event.status.trim().to_ascii_lowercase();
    if organization_id.is_empty() || status.is_empty() {
        return Err(ApiError::bad_request("organizationId and status are required"));
    }
    upsert_subscription(&state.db, organization_id, &status).await?;
    info!(organization_id = %organization_id, status = %status, "subscription updated");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signatures_are_checked_when_secret_is_set() {
        let body = br#"{"organizationId":"org_1","status":"active"}"#;
        let sig = sign("whsec", body);
        assert!(verify_billing_signature(Some("whsec"), Some(&sig), body));
        assert!(verify_billing_signature(
            Some("whsec"),
            Some(&format!("sha256={sig}")),
            body
        ));
        assert!(!verify_billing_signature(Some("whsec"), Some(&sig), b"tampered"));
        assert!(!verify_billing_signature(Some("whsec"), None, body));
        assert!(!verify_billing_signature(Some("whsec"), Some("nothex"), body));
    }

    #[test]
    fn unsigned_mode_accepts_everything() {
        assert!(verify_billing_signature(None, None, b"{}"));
        assert!(verify_billing_signature(Some(""), None, b"{}"));
    }

    #[test]
    fn only_active_counts() {
        let sub = |status: &str| Subscription {
            organization_id: "org".into(),
            status: status.into(),
            updated_at: String::new(),
        };
        assert!(sub("active").is_active());
        assert!(!sub("past_due").is_active());
        assert!(!sub("canceled").is_active());
    }
}
