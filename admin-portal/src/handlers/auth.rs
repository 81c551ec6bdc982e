use crate::services::auth_client::ProviderError;
use crate::services::session_source::SessionEvent;
use crate::services::token_store::VisitorTokens;
use crate::utils::htmx;
use crate::utils::jwt::decode_jwt_claims;
use crate::utils::visitor::{ensure_visitor_id, visitor_id};
use crate::AppState;
use askama::Template;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Form,
};
use serde::Deserialize;
use service_core::error::AppError;
use tower_sessions::Session;
use validator::Validate;

const DEFAULT_NEXT: &str = "/admin";

#[derive(Template)]
#[template(path = "login.html")]
pub struct LoginTemplate {
    pub next: String,
    pub error: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginQuery {
    pub next: Option<String>,
}

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
    pub next: Option<String>,
}

/// Accept only same-site absolute paths as post-login targets.
pub fn sanitize_next(next: Option<&str>) -> String {
    match next {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.starts_with("/\\")
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => DEFAULT_NEXT.to_string(),
    }
}

fn login_failed(htmx: bool, next: String, status: StatusCode, message: &str) -> Response {
    if htmx {
        let fragment = format!("<p class='text-red-500 text-sm'>{}</p>", message);
        return (status, Html(fragment)).into_response();
    }
    (
        status,
        LoginTemplate {
            next,
            error: Some(message.to_string()),
        },
    )
        .into_response()
}

pub async fn login_page(Query(query): Query<LoginQuery>) -> impl IntoResponse {
    LoginTemplate {
        next: sanitize_next(query.next.as_deref()),
        error: None,
    }
}

pub async fn login_handler(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
    Form(payload): Form<LoginRequest>,
) -> Result<Response, AppError> {
    let is_htmx = htmx::is_htmx(&headers);
    let next = sanitize_next(payload.next.as_deref());

    if payload.validate().is_err() {
        return Ok(login_failed(
            is_htmx,
            next,
            StatusCode::UNPROCESSABLE_ENTITY,
            "Enter a valid email and password",
        ));
    }

    let pair = match state.auth_client.login(&payload.email, &payload.password).await {
        Ok(pair) => pair,
        Err(ProviderError::Rejected(status)) => {
            tracing::info!(email = %payload.email, status = %status, "Identity provider rejected sign-in");
            return Ok(login_failed(
                is_htmx,
                next,
                StatusCode::UNPROCESSABLE_ENTITY,
                "Invalid email or password",
            ));
        }
        Err(e) => {
            tracing::warn!(email = %payload.email, error = %e, "Sign-in failed");
            return Ok(login_failed(
                is_htmx,
                next,
                StatusCode::BAD_GATEWAY,
                "Sign-in is temporarily unavailable",
            ));
        }
    };

    // New privilege level, new session id
    session
        .cycle_id()
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to cycle session: {}", e)))?;
    let visitor_id = ensure_visitor_id(&session).await?;

    state
        .tokens
        .save(&visitor_id, &VisitorTokens::from(&pair))
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to store tokens: {}", e)))?;

    match decode_jwt_claims(&pair.access_token).map(|claims| claims.into_session()) {
        Ok(Some(mut remote)) => {
            if remote.display_name.is_none() {
                remote.display_name = pair.name.clone();
            }
            let delivered = state
                .hub
                .publish(&visitor_id, SessionEvent::signed_in(remote));
            tracing::info!(
                visitor_id = %visitor_id,
                email = %payload.email,
                subscribers = delivered,
                "Signed in with identity provider"
            );
        }
        Ok(None) => {
            tracing::warn!(visitor_id = %visitor_id, "Access token carries no email");
        }
        Err(e) => {
            tracing::warn!(visitor_id = %visitor_id, error = %e, "Failed to decode access token claims");
        }
    }

    Ok(htmx::redirect(&next, is_htmx))
}

pub async fn logout_handler(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if let Some(visitor_id) = visitor_id(&session).await? {
        // The verdict and cache are cleared even when revocation fails
        match state.guards.sign_out(&visitor_id).await {
            Ok(()) => tracing::info!(visitor_id = %visitor_id, "Signed out"),
            Err(e) => {
                tracing::error!(visitor_id = %visitor_id, error = %e, "Failed to revoke provider session during logout")
            }
        }
    }

    session.clear().await;

    Ok(htmx::redirect("/", htmx::is_htmx(&headers)))
}

/// Exchange the stored refresh token for a new pair and announce it.
pub async fn refresh_handler(
    State(state): State<AppState>,
    session: Session,
) -> Result<StatusCode, AppError> {
    let visitor_id = visitor_id(&session)
        .await?
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("No session")))?;

    let tokens = state
        .tokens
        .load(&visitor_id)
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to load tokens: {}", e)))?
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("No provider session")))?;

    let pair = match state.auth_client.refresh(&tokens.refresh_token).await {
        Ok(pair) => pair,
        Err(ProviderError::Rejected(status)) => {
            tracing::info!(visitor_id = %visitor_id, status = %status, "Refresh token rejected");
            return Err(AppError::Unauthorized(anyhow::anyhow!("Refresh rejected")));
        }
        Err(e) => return Err(AppError::BadGateway(e.to_string())),
    };

    state
        .tokens
        .save(&visitor_id, &VisitorTokens::from(&pair))
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to store tokens: {}", e)))?;

    let remote = decode_jwt_claims(&pair.access_token)
        .ok()
        .and_then(|claims| claims.into_session());
    state
        .hub
        .publish(&visitor_id, SessionEvent::token_refreshed(remote));

    Ok(StatusCode::NO_CONTENT)
}
