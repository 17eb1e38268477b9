use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::app::AppState;
use crate::error::ApiResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateOrganizationBody {
    #[serde(default)]
    pub organization_id: String,
}

pub async fn organization_exists(db: &PgPool, organization_id: &str) -> ApiResult<bool> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM organizations WHERE id = $1")
        .bind(organization_id)
        .fetch_one(db)
        .await?;
    Ok(count > 0)
}

pub async fn organization_name(db: &PgPool, organization_id: &str) -> ApiResult<Option<String>> {
    Ok(
        sqlx::query_scalar::<_, String>("SELECT name FROM organizations WHERE id = $1")
            .bind(organization_id)
            .fetch_optional(db)
            .await?,
    )
}

pub async fn validate_organization(db: &PgPool, organization_id: &str) -> ApiResult<ValidationResult> {
    let organization_id = organization_id.trim();
    if organization_id.is_empty() {
        return Ok(ValidationResult::invalid("Organization ID is required"));
    }
    if organization_exists(db, organization_id).await? {
        Ok(ValidationResult::valid())
    } else {
        Ok(ValidationResult::invalid("Organization not found"))
    }
}

/// Public: the widget checks its embed organization before anything else.
pub async fn validate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ValidateOrganizationBody>,
) -> ApiResult<impl IntoResponse> {
    let result = validate_organization(&state.db, &body.organization_id).await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_result_omits_reason() {
        let value = serde_json::to_value(ValidationResult::valid()).unwrap();
        assert_eq!(value, serde_json::json!({ "valid": true }));
    }

    #[test]
    fn invalid_result_carries_reason() {
        let value = serde_json::to_value(ValidationResult::invalid("Organization not found")).unwrap();
        assert_eq!(value["valid"], false);
        assert_eq!(value["reason"], "Organization not found");
    }
}
