//! HTTP implementation of the upstream exchange adapter.
//!
//! Posts the authorization code to the provider token endpoint with a
//! bounded timeout, then reads the identity out of the returned
//! `id_token`. The signature is deliberately not verified: the token
//! arrived over the gateway's own TLS connection to the provider's token
//! endpoint, the same trust basis the original deployment relied on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ExchangeError, UpstreamExchange, VerifiedSubject};
use crate::config::{ServerConfig, UpstreamConfig};

/// Production adapter talking to a real provider token endpoint.
pub struct HttpUpstreamExchange {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

/// Provider token response. Only the fields the gateway consumes.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

impl HttpUpstreamExchange {
    /// Build the adapter from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(upstream: &UpstreamConfig, server: &ServerConfig) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(upstream.timeout)
            .build()
            .map_err(|e| crate::Error::Internal(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            token_endpoint: upstream.token_endpoint.clone(),
            client_id: upstream.resolve_client_id(),
            client_secret: upstream.resolve_client_secret(),
            redirect_uri: server.upstream_redirect_uri(),
        })
    }
}

#[async_trait]
impl UpstreamExchange for HttpUpstreamExchange {
    async fn exchange(
        &self,
        code: &str,
        verifier: &str,
    ) -> std::result::Result<VerifiedSubject, ExchangeError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("code_verifier", verifier),
        ];

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            warn!(status = status, "Provider rejected code exchange");
            return Err(ExchangeError::Rejected { status });
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;

        let id_token = token_response.id_token.ok_or_else(|| {
            ExchangeError::MalformedResponse("token response carried no id_token".to_string())
        })?;

        let subject = extract_id_token_claims(&id_token)?;
        debug!(subject = %subject.subject, "Upstream exchange succeeded");
        Ok(subject)
    }
}

/// Extract claims from an id_token JWT payload without signature
/// verification: split the compact form, base64url-decode the payload,
/// parse it as a JSON object.
fn extract_id_token_claims(token: &str) -> std::result::Result<VerifiedSubject, ExchangeError> {
    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() < 2 {
        return Err(ExchangeError::MalformedResponse(
            "id_token is not a compact JWT".to_string(),
        ));
    }

    let payload = base64::Engine::decode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        parts[1],
    )
    .map_err(|_| ExchangeError::MalformedResponse("id_token payload is not base64url".to_string()))?;

    let mut claims: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&payload)
        .map_err(|_| ExchangeError::MalformedResponse("id_token payload is not JSON".to_string()))?;

    let subject = claims
        .remove("sub")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| {
            ExchangeError::MalformedResponse("id_token carries no sub claim".to_string())
        })?;

    Ok(VerifiedSubject { subject, claims })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an unsigned JWT with the given JSON payload.
    fn fake_jwt(payload: serde_json::Value) -> String {
        let b64 = |bytes: &[u8]| {
            base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
        };
        let header = b64(br#"{"alg":"none"}"#);
        let body = b64(payload.to_string().as_bytes());
        format!("{header}.{body}.")
    }

    #[test]
    fn extracts_subject_and_claims_from_id_token() {
        // GIVEN: an id_token with sub + email claims
        let token = fake_jwt(serde_json::json!({
            "sub": "u1",
            "email": "a@b.com",
            "name": "Alice"
        }));

        // WHEN: claims are extracted
        let identity = extract_id_token_claims(&token).unwrap();

        // THEN: sub is lifted out, the rest stays in the claims map
        assert_eq!(identity.subject, "u1");
        assert_eq!(identity.claims["email"], "a@b.com");
        assert_eq!(identity.claims["name"], "Alice");
        assert!(!identity.claims.contains_key("sub"));
    }

    #[test]
    fn rejects_token_without_sub() {
        let token = fake_jwt(serde_json::json!({"email": "a@b.com"}));
        assert!(matches!(
            extract_id_token_claims(&token),
            Err(ExchangeError::MalformedResponse(_))
        ));
    }

    #[test]
    fn rejects_malformed_token() {
        assert!(extract_id_token_claims("not-a-jwt").is_err());
        assert!(extract_id_token_claims("a.!!!not-base64!!!.c").is_err());
    }

    #[test]
    fn adapter_builds_from_config() {
        // GIVEN: literal-credential config
        let upstream = UpstreamConfig {
            client_id: "cid".to_string(),
            client_secret: "csecret".to_string(),
            ..UpstreamConfig::default()
        };
        let server = ServerConfig::default();

        // THEN: construction succeeds and the redirect URI is derived
        let adapter = HttpUpstreamExchange::new(&upstream, &server).unwrap();
        assert_eq!(adapter.redirect_uri, "http://localhost:8000/oauth/callback");
    }
}
