//! Voice integration backed by Vapi.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::app::AppState;
use crate::auth::require_operator;
use crate::error::{ApiError, ApiResult};
use crate::plugins::load_plugin;
use crate::secrets::parse_secret_string;
use crate::widget_settings::OrganizationQuery;

pub const VAPI_SERVICE: &str = "vapi";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredVapiSecret {
    #[serde(default)]
    pub private_api_key: String,
    #[serde(default)]
    pub public_api_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VapiCredentials {
    pub private_api_key: String,
    pub public_api_key: String,
}

/// Validates a stored secret string into a usable key pair.
pub fn vapi_credentials(secret: Option<&str>) -> ApiResult<VapiCredentials> {
    let stored = parse_secret_string::<StoredVapiSecret>(secret)
        .ok_or_else(|| ApiError::internal("Credentials not found"))?;
    if stored.private_api_key.trim().is_empty() || stored.public_api_key.trim().is_empty() {
        return Err(ApiError::internal(
            "Credentials are incomplete. Please reconnect Vapi.",
        ));
    }
    Ok(VapiCredentials {
        private_api_key: stored.private_api_key,
        public_api_key: stored.public_api_key,
    })
}

#[derive(Clone)]
pub struct VapiClient {
    http: reqwest::Client,
    base_url: String,
}

impl VapiClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn list(&self, private_api_key: &str, path: &str) -> ApiResult<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(private_api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            debug!(status, body = %body, path, "vapi request failed");
            return Err(ApiError::internal(format!("Vapi request failed with status {status}")));
        }
        Ok(response.json::<Value>().await?)
    }

    pub async fn assistants(&self, private_api_key: &str) -> ApiResult<Value> {
        self.list(private_api_key, "/assistant").await
    }

    pub async fn phone_numbers(&self, private_api_key: &str) -> ApiResult<Value> {
        self.list(private_api_key, "/phone-number").await
    }
}

async fn operator_credentials(state: &AppState, headers: &HeaderMap) -> ApiResult<VapiCredentials> {
    let (_, org_id) = require_operator(state, headers).await?;
    let plugin = load_plugin(&state.db, &org_id, VAPI_SERVICE)
        .await?
        .ok_or_else(|| ApiError::not_found("Vapi plugin not found for organization"))?;
    let secret = state.secrets.get(&plugin.secret_name).await?;
    vapi_credentials(secret.as_deref())
}

pub async fn get_assistants(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let credentials = operator_credentials(&state, &headers).await?;
    let client = VapiClient::new(state.http.clone(), &state.settings.vapi_base_url);
    Ok(Json(client.assistants(&credentials.private_api_key).await?))
}

pub async fn get_phone_numbers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let credentials = operator_credentials(&state, &headers).await?;
    let client = VapiClient::new(state.http.clone(), &state.settings.vapi_base_url);
    Ok(Json(client.phone_numbers(&credentials.private_api_key).await?))
}

/// Public key for the widget's voice client, if the organization connected Vapi.
pub async fn public_api_key(state: &AppState, organization_id: &str) -> ApiResult<Option<String>> {
    let Some(plugin) = load_plugin(&state.db, organization_id, VAPI_SERVICE).await? else {
        return Ok(None);
    };
    let secret = state.secrets.get(&plugin.secret_name).await?;
    Ok(parse_secret_string::<StoredVapiSecret>(secret.as_deref())
        .map(|s| s.public_api_key)
        .filter(|k| !k.trim().is_empty()))
}

pub async fn get_vapi_secrets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrganizationQuery>,
) -> ApiResult<impl IntoResponse> {
    let key = public_api_key(&state, &query.organization_id).await?;
    Ok(Json(key.map(|k| json!({ "publicApiKey": k })).unwrap_or(Value::Null)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn credential_errors_match_dashboard_messages() {
        let err = vapi_credentials(None).unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
        assert!(err.to_string().contains("Credentials not found"));

        let err = vapi_credentials(Some("garbage")).unwrap_err();
        assert!(err.to_string().contains("Credentials not found"));

        let err = vapi_credentials(Some(r#"{"publicApiKey":"pk"}"#)).unwrap_err();
        assert!(err
            .to_string()
            .contains("Credentials are incomplete. Please reconnect Vapi."));

        let creds =
            vapi_credentials(Some(r#"{"publicApiKey":"pk","privateApiKey":"sk"}"#)).unwrap();
        assert_eq!(creds.private_api_key, "sk");
        assert_eq!(creds.public_api_key, "pk");
    }

    #[tokio::test]
    async fn assistants_are_listed_with_private_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/assistant"))
            .and(header("authorization", "Bearer sk"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{ "id": "asst_1", "name": "Support" }])),
            )
            .mount(&server)
            .await;
        let client = VapiClient::new(reqwest::Client::new(), &server.uri());
        let assistants = client.assistants("sk").await.unwrap();
        assert_eq!(assistants[0]["id"], "asst_1");
    }

    #[tokio::test]
    async fn upstream_failures_become_internal_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/phone-number"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;
        let client = VapiClient::new(reqwest::Client::new(), &server.uri());
        let err = client.phone_numbers("sk").await.unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
        assert!(err.to_string().contains("401"));
    }
}
