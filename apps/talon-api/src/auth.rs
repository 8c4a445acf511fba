//! Bearer-token auth for `/v1/*`. One shared admin credential, compared in
//! constant time; `/healthz` stays outside this layer.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::AppState;
use crate::error::ApiError;

pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    match check_bearer(&state.admin_token, header) {
        Ok(()) => next.run(request).await,
        Err(error) => error.into_response(),
    }
}

fn check_bearer(admin_token: &str, header: Option<&str>) -> Result<(), ApiError> {
    if admin_token.is_empty() {
        return Err(ApiError::auth_misconfigured());
    }
    let Some(presented) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
        return Err(ApiError::unauthorized(
            "Missing or invalid Authorization header",
        ));
    };
    let presented = presented.trim();
    if !bool::from(presented.as_bytes().ct_eq(admin_token.as_bytes())) {
        return Err(ApiError::unauthorized("Invalid token"));
    }
    Ok(())
}
