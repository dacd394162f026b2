// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Client authentication for the `/v1` routes

use crate::error::ServerError;
use axum::{
    extract::Request,
    http::header,
    middleware::Next,
    response::Response,
};

/// Authentication configuration
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub api_key: Option<String>,
}

impl AuthConfig {
    /// Create auth config from API key
    pub fn with_api_key(api_key: String) -> Self {
        Self {
            api_key: Some(api_key),
        }
    }

    /// Check if authentication is required
    pub fn requires_auth(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    /// Validate the `Authorization` header value
    pub fn validate(&self, authorization: Option<&str>) -> Result<(), ServerError> {
        let Some(expected) = self.api_key.as_deref().filter(|key| !key.is_empty()) else {
            return Ok(());
        };
        let provided = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| ServerError::Unauthorized("Missing bearer token".to_string()))?;
        if provided == expected {
            Ok(())
        } else {
            Err(ServerError::Unauthorized("Invalid API key".to_string()))
        }
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    auth_config: AuthConfig,
    req: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    if let Err(err) = auth_config.validate(authorization) {
        tracing::debug!(path = %req.uri().path(), "Rejected unauthenticated request");
        return Err(err);
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_when_no_key_configured() {
        let auth = AuthConfig::default();
        assert!(!auth.requires_auth());
        assert!(auth.validate(None).is_ok());

        let empty = AuthConfig::with_api_key(String::new());
        assert!(!empty.requires_auth());
        assert!(empty.validate(None).is_ok());
    }

    #[test]
    fn bearer_key_must_match() {
        let auth = AuthConfig::with_api_key("sk-relay".to_string());
        assert!(auth.requires_auth());
        assert!(auth.validate(Some("Bearer sk-relay")).is_ok());
        assert!(matches!(
            auth.validate(Some("Bearer wrong")),
            Err(ServerError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.validate(Some("sk-relay")),
            Err(ServerError::Unauthorized(_))
        ));
        assert!(matches!(auth.validate(None), Err(ServerError::Unauthorized(_))));
    }
}
