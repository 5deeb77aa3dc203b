//! Request identity extraction.
//!
//! Every core endpoint is scoped by `(userId, projectId)`. In debug mode
//! the identity comes from `X-User-Id` / `X-Project-Id` headers or the
//! matching query parameters. In production it comes from a verified JWT
//! (HS256) with configurable claim names. Workspace and session hints ride
//! along from headers or query either way.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use ulid::Ulid;

use relay_core::Scope;

use crate::error::ApiError;
use crate::server::AppState;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request identity derived from authentication and headers.
#[derive(Debug, Clone)]
pub struct RequestScope {
    /// The authenticated `(userId, projectId)` scope.
    pub scope: Scope,
    /// Workspace hint from headers or query.
    pub workspace_id: Option<String>,
    /// Session hint from headers or query.
    pub session_id: Option<String>,
    /// Request ID for tracing/correlation.
    pub request_id: String,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for RequestScope {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let request_id =
            header_string(&parts.headers, REQUEST_ID_HEADER).unwrap_or_else(|| Ulid::new().to_string());

        let query: HashMap<String, String> =
            Query::<HashMap<String, String>>::from_request_parts(parts, state)
                .await
                .map(|Query(map)| map)
                .unwrap_or_default();

        let (user_id, project_id) = if state.config.debug {
            let user_id = header_string(&parts.headers, "x-user-id")
                .or_else(|| query.get("userId").cloned())
                .ok_or_else(|| ApiError::missing_auth().with_request_id(request_id.clone()))?;
            let project_id = header_string(&parts.headers, "x-project-id")
                .or_else(|| query.get("projectId").cloned())
                .ok_or_else(|| ApiError::missing_auth().with_request_id(request_id.clone()))?;
            (user_id, project_id)
        } else {
            extract_from_jwt(&parts.headers, state, &request_id)?
        };

        let scope = Scope::new(user_id, project_id)
            .map_err(|e| ApiError::bad_request(e.to_string()).with_request_id(request_id.clone()))?;

        let ctx = Self {
            scope,
            workspace_id: header_string(&parts.headers, "x-workspace-id")
                .or_else(|| query.get("workspaceId").cloned()),
            session_id: header_string(&parts.headers, "x-session-id")
                .or_else(|| query.get("sessionId").cloned()),
            request_id,
        };

        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

fn extract_from_jwt(
    headers: &HeaderMap,
    state: &AppState,
    request_id: &str,
) -> Result<(String, String), ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::missing_auth().with_request_id(request_id.to_string()))?;

    let Some(secret) = state.config.jwt.hs256_secret.as_deref() else {
        return Err(
            ApiError::internal("jwt.hs256_secret is required when debug=false")
                .with_request_id(request_id.to_string()),
        );
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_nbf = true;

    let data = jsonwebtoken::decode::<Value>(
        &token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| ApiError::invalid_token().with_request_id(request_id.to_string()))?;

    let Some(claims) = data.claims.as_object() else {
        return Err(ApiError::invalid_token().with_request_id(request_id.to_string()));
    };

    let user_id = required_claim(claims, &state.config.jwt.user_claim, request_id)?;
    let project_id = required_claim(claims, &state.config.jwt.project_claim, request_id)?;
    Ok((user_id, project_id))
}

fn required_claim(
    claims: &serde_json::Map<String, Value>,
    claim: &str,
    request_id: &str,
) -> Result<String, ApiError> {
    claims
        .get(claim)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::invalid_token().with_request_id(request_id.to_string()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_string(headers, "authorization")?;
    let token = raw.strip_prefix("Bearer ")?;
    Some(token.to_string())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123".to_string()));

        let mut basic = HeaderMap::new();
        basic.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&basic), None);
    }

    #[test]
    fn header_string_skips_empty() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "".parse().unwrap());
        assert_eq!(header_string(&headers, "x-user-id"), None);
    }
}
