use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, warn};

use crate::config::{LimitConfig, RateLimitConfig};
use crate::error::AppError;
use crate::oidc::parse_bearer;
use crate::proxy::read_body;
use crate::router::RequestProbe;
use crate::state::AppState;

/// Caller identity attached to the request by authentication. Downstream
/// middlewares read it; nothing else writes it.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: String,
    pub groups: Vec<String>,
}

/// Logs method and path on receipt; does not wait for the outcome.
pub async fn request_logging(request: Request, next: Next) -> Response {
    info!(method = %request.method(), path = %request.uri().path(), "received request");
    next.run(request).await
}

/// Validates the bearer token against the OIDC issuer and attaches an
/// [`AuthContext`] for the rest of the chain.
pub async fn authentication(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::unauthenticated("Authorization header is required"))?;
    let token = parse_bearer(header).ok_or_else(|| {
        AppError::unauthenticated("Authorization header must be in the format 'Bearer {token}'")
    })?;

    let authenticator = state
        .authenticator
        .as_ref()
        .ok_or_else(|| AppError::internal("authenticator not configured"))?;
    let verified = authenticator.verify(token).await?;

    info!(user = %verified.subject, "successfully authenticated user");
    request.extensions_mut().insert(AuthContext {
        user_id: verified.subject,
        groups: verified.groups,
    });
    Ok(next.run(request).await)
}

/// Permits a request iff the caller's groups may use the requested model.
/// Models with no `allowed_groups` are open to every authenticated caller.
pub async fn authorization(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let bytes = read_body(body, &parts.headers).await?;

    let probe: RequestProbe = serde_json::from_slice(&bytes)
        .map_err(|_| AppError::invalid_request("Invalid request format"))?;
    let model_name = probe.model.unwrap_or_default();

    let context = parts
        .extensions
        .get::<AuthContext>()
        .cloned()
        .ok_or_else(|| AppError::internal("user identity missing from request context"))?;

    let model = state.registry.find_model(&model_name).ok_or_else(|| {
        warn!(model = %model_name, "model not found in configuration");
        AppError::model_not_found("Model not found")
    })?;

    if !model.allowed_groups.is_empty()
        && !context
            .groups
            .iter()
            .any(|group| model.allowed_groups.contains(group))
    {
        warn!(
            model = %model_name,
            groups = ?context.groups,
            "user is not authorized for model"
        );
        return Err(AppError::forbidden(
            "You are not authorized to use this model",
        ));
    }

    // Hand the handler an untouched copy of the bytes we drained.
    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

/// Enforces the sliding-window limit for the caller's bucket. A backend
/// error fails open: the limiter must not take the gateway down.
pub async fn rate_limiting(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let config = &state.config.ratelimit;
    let context = request.extensions().get::<AuthContext>();

    let (bucket, limit) = select_bucket(config, context);
    let key = match context {
        Some(context) => format!("ratelimit:{}:{}", bucket, context.user_id),
        None => format!("ratelimit:{}", bucket),
    };

    match state
        .kv_store
        .allow(&key, limit.requests, limit.window())
        .await
    {
        Ok(true) => Ok(next.run(request).await),
        Ok(false) => {
            warn!(key = %key, "rate limit exceeded");
            Err(AppError::rate_limited("Too Many Requests"))
        }
        Err(err) => {
            warn!(key = %key, error = %err, "rate limiter backend error; allowing request");
            Ok(next.run(request).await)
        }
    }
}

/// Picks the most restrictive configured group limit for the caller:
/// smallest `requests` wins, ties broken by lexicographic group name.
/// Callers without an identity share the `unauthenticated` bucket.
fn select_bucket<'a>(
    config: &'a RateLimitConfig,
    context: Option<&AuthContext>,
) -> (String, &'a LimitConfig) {
    let Some(context) = context else {
        return ("unauthenticated".to_string(), &config.default);
    };

    let mut groups = context.groups.clone();
    groups.sort();

    let mut bucket = "default".to_string();
    let mut limit = &config.default;
    for group in &groups {
        if let Some(group_limit) = config.groups.get(group) {
            if group_limit.requests < limit.requests {
                bucket = group.clone();
                limit = group_limit;
            }
        }
    }
    (bucket, limit)
}
