//! HTTP router and handlers
//!
//! The externally visible surface of the gateway. Handlers translate
//! between the wire and the flow engine / capability gate; no flow logic
//! lives here. Error bodies follow the OAuth convention
//! (`error` + `error_description`), and protocol failures never carry
//! upstream provider detail.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{Path, Query, RawForm, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::Error;
use crate::flow::{AuthorizeRequest, CallbackOutcome, FlowEngine};
use crate::gate::{CapabilityGate, Decision, DenyReason};
use crate::issue::Issuer;

/// Shared application state
pub struct AppState {
    /// The interception state machine
    pub engine: Arc<FlowEngine>,
    /// Per-call capability gate
    pub gate: Arc<CapabilityGate>,
    /// Downstream code / session issuer (token endpoint)
    pub issuer: Arc<Issuer>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, callback_path: &str) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/oauth/authorize", get(authorize_handler))
        .route(callback_path, get(callback_handler))
        .route("/consent", get(consent_page_handler).post(consent_submit_handler))
        .route("/oauth/token", post(token_handler))
        .route("/tools/{name}", post(tool_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Query parameters of the client's authorization request.
#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    response_type: Option<String>,
    redirect_uri: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
}

/// GET /oauth/authorize - start a flow and bounce the browser upstream.
async fn authorize_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    if let Some(rt) = &params.response_type {
        if rt != "code" {
            return error_response(
                StatusCode::BAD_REQUEST,
                "unsupported_response_type",
                "only response_type=code is supported",
            );
        }
    }
    let Some(redirect_uri) = params.redirect_uri else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "redirect_uri is required",
        );
    };

    match state.engine.begin_authorization(AuthorizeRequest {
        redirect_uri,
        state: params.state,
        code_challenge: params.code_challenge,
        code_challenge_method: params.code_challenge_method,
    }) {
        Ok(url) => Redirect::temporary(url.as_str()).into_response(),
        Err(e) => error_to_response(&e),
    }
}

/// Query parameters of the provider's redirect back.
#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /oauth/callback - the interception point.
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    // Provider-side refusal (user hit "cancel", bad scopes, ...). The
    // detail goes to the log; the client gets a generic denial.
    if let Some(provider_error) = &params.error {
        warn!(
            error = %provider_error,
            description = params.error_description.as_deref().unwrap_or(""),
            "Provider returned an error callback"
        );
        return match params.state.as_deref() {
            Some(st) => match state.engine.handle_provider_error(st) {
                Ok(redirect) => Redirect::temporary(redirect.as_str()).into_response(),
                Err(e) => error_to_response(&e),
            },
            None => error_response(
                StatusCode::BAD_REQUEST,
                "access_denied",
                "authorization was not granted",
            ),
        };
    }

    let (Some(code), Some(st)) = (params.code, params.state) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "code and state are required",
        );
    };

    match state.engine.handle_callback(&code, &st).await {
        Ok(CallbackOutcome::ConsentRequired { transaction_id }) => {
            Redirect::temporary(&format!("/consent?txn_id={transaction_id}")).into_response()
        }
        Ok(CallbackOutcome::Completed { redirect } | CallbackOutcome::Denied { redirect }) => {
            Redirect::temporary(redirect.as_str()).into_response()
        }
        Err(e) => error_to_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct ConsentPageParams {
    txn_id: String,
}

/// GET /consent - render the capability selection form.
async fn consent_page_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConsentPageParams>,
) -> Response {
    match state.engine.consent_view(&params.txn_id) {
        Ok(view) => Html(render_consent_page(
            &view.transaction_id,
            &view.identity,
            &view
                .capabilities
                .iter()
                .map(|c| (c.name.as_str(), c.description.as_str()))
                .collect::<Vec<_>>(),
        ))
        .into_response(),
        Err(e) => error_to_response(&e),
    }
}

/// POST /consent - record the selection and resume the flow.
///
/// Parsed from the raw form body because checkboxes submit repeated
/// `capabilities` keys, which `serde`-based form extraction cannot
/// represent as a set.
async fn consent_submit_handler(
    State(state): State<Arc<AppState>>,
    RawForm(body): RawForm,
) -> Response {
    let mut txn_id = None;
    let mut selection = BTreeSet::new();
    for (key, value) in url::form_urlencoded::parse(&body) {
        match key.as_ref() {
            "transaction_id" => txn_id = Some(value.into_owned()),
            "capabilities" => {
                selection.insert(value.into_owned());
            }
            _ => {}
        }
    }

    let Some(txn_id) = txn_id else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "transaction_id is required",
        );
    };

    match state.engine.record_consent(&txn_id, &selection).await {
        Ok(redirect) => Redirect::to(redirect.as_str()).into_response(),
        Err(e) => error_to_response(&e),
    }
}

/// Form body of the token request.
#[derive(Debug, Deserialize)]
struct TokenRequestForm {
    grant_type: String,
    code: Option<String>,
    redirect_uri: Option<String>,
    code_verifier: Option<String>,
}

/// POST /oauth/token - exchange a downstream code for a session token.
async fn token_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TokenRequestForm>,
) -> Response {
    if form.grant_type != "authorization_code" {
        return error_response(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            "only authorization_code is supported",
        );
    }
    let (Some(code), Some(redirect_uri)) = (form.code, form.redirect_uri) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "code and redirect_uri are required",
        );
    };

    match state
        .issuer
        .exchange(&code, &redirect_uri, form.code_verifier.as_deref())
    {
        Ok(grant) => Json(grant).into_response(),
        Err(e) => error_to_response(&e),
    }
}

/// POST /tools/{name} - a protected operation behind the capability gate.
async fn tool_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let bearer = extract_bearer(&headers);

    match state.gate.authorize(bearer.as_deref(), &name).await {
        Decision::Allow(caller) => {
            debug!(subject = %caller.subject, tool = %name, "Tool call allowed");
            match name.as_str() {
                "get_email" => Json(json!({ "email": caller.claims.get("email") })).into_response(),
                "get_name" => Json(json!({ "name": caller.claims.get("name") })).into_response(),
                _ => error_response(
                    StatusCode::NOT_FOUND,
                    "unknown_tool",
                    "no such tool is registered",
                ),
            }
        }
        Decision::Deny(DenyReason::Unauthenticated) => error_response(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "a valid bearer token is required",
        ),
        Decision::Deny(DenyReason::CapabilityDisabled) => error_response(
            StatusCode::FORBIDDEN,
            "capability_disabled",
            "the user has not enabled this capability",
        ),
    }
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Pull the bearer token out of the `Authorization` header.
fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// OAuth-style JSON error body with the given status.
fn error_response(status: StatusCode, code: &str, description: &str) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "error_description": description,
        })),
    )
        .into_response()
}

/// Map a domain error onto the wire.
fn error_to_response(err: &Error) -> Response {
    let status = match err {
        Error::InvalidRequest(_) | Error::InvalidState | Error::InvalidGrant(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::Unauthenticated => StatusCode::UNAUTHORIZED,
        Error::TransactionNotFound => StatusCode::NOT_FOUND,
        Error::TransactionExpired => StatusCode::GONE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    // Internal detail stays in the log.
    let description = if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %err, "Internal error surfaced to handler");
        "internal error".to_string()
    } else {
        err.to_string()
    };

    error_response(status, err.oauth_code(), &description)
}

/// Render the consent form. Values are HTML-escaped; the transaction id
/// round-trips through a hidden field.
fn render_consent_page(txn_id: &str, identity: &str, capabilities: &[(&str, &str)]) -> String {
    let mut checkboxes = String::new();
    for (name, description) in capabilities {
        checkboxes.push_str(&format!(
            r#"    <label><input type="checkbox" name="capabilities" value="{}"> {} <small>{}</small></label><br>
"#,
            escape_html(name),
            escape_html(name),
            escape_html(description),
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Choose capabilities</title></head>
<body>
  <h1>Signed in as {}</h1>
  <p>Select which capabilities this application may use on your behalf.</p>
  <form method="post" action="/consent">
    <input type="hidden" name="transaction_id" value="{}">
{}    <button type="submit">Continue</button>
  </form>
</body>
</html>
"#,
        escape_html(identity),
        escape_html(txn_id),
        checkboxes,
    )
}

/// Minimal HTML escaping for interpolated values.
fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
