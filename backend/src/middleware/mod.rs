//! Request authentication middleware.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::{request::Parts, Request};
use axum::middleware::Next;
use axum::response::Response;

use midas_shared::prov::Agent;

use crate::auth::authenticate_via_authkey;
use crate::error::AppError;
use crate::state::AppState;

/// Extractor for the agent placed in request extensions by the
/// authentication middleware.
pub struct AuthenticatedAgent(pub Agent);

impl<S> FromRequestParts<S> for AuthenticatedAgent
where
    S: Send + Sync + 'static,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let agent = parts
            .extensions
            .get::<Agent>()
            .cloned()
            .ok_or(AppError::Unauthorized)?;
        Ok(AuthenticatedAgent(agent))
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("Authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(String::from)
}

/// Decode the bearer token (when present) into an [`Agent`] and attach
/// it to the request.  Requests without credentials proceed as the
/// anonymous agent; a token that fails validation is rejected.
pub async fn jwt_auth_middleware(
    State(app_state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let (mut parts, body) = req.into_parts();

    let agent = match bearer_token(&parts) {
        None => app_state.auth.anonymous(),
        Some(token) => match app_state.auth.decode_token(&token) {
            Ok(claims) => app_state.auth.agent_for(&claims),
            Err(e) => {
                log::warn!("JWT validation failed: {e}");
                return Err(AppError::Unauthorized);
            }
        },
    };
    parts.extensions.insert(agent);

    let req = Request::from_parts(parts, body);
    Ok(next.run(req).await)
}

/// Authentication for the legacy external-review endpoint: an auth key
/// mapped to a fixed identity, falling back to JWT when no key is
/// configured.
pub async fn extrev_auth_middleware(
    State(app_state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let (mut parts, body) = req.into_parts();

    let agent = match bearer_token(&parts) {
        Some(token) => {
            if let Some(agent) = authenticate_via_authkey(&token, &app_state.config.extrev) {
                agent
            } else if app_state.config.extrev.authkey.is_some() {
                log::warn!("external review request with unrecognized auth key");
                return Err(AppError::Unauthorized);
            } else {
                app_state
                    .auth
                    .decode_token(&token)
                    .map(|claims| app_state.auth.agent_for(&claims))
                    .map_err(|_| AppError::Unauthorized)?
            }
        }
        None => return Err(AppError::Unauthorized),
    };
    parts.extensions.insert(agent);

    let req = Request::from_parts(parts, body);
    Ok(next.run(req).await)
}
