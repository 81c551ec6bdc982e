use crate::models::Verdict;
use crate::utils::{htmx, visitor::ensure_visitor_id};
use crate::AppState;
use askama::Template;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_sessions::Session;

/// Shown while a verdict is still pending; polls the same target.
#[derive(Template)]
#[template(path = "loading.html")]
pub struct LoadingTemplate {
    pub target: String,
}

/// Admits a request only once the visitor's reconciler has authorized it.
///
/// The verified [`Identity`](crate::models::Identity) is handed to the
/// handler as a request extension.
pub async fn admin_guard(
    State(state): State<AppState>,
    session: Session,
    mut request: Request,
    next: Next,
) -> Response {
    let visitor_id = match ensure_visitor_id(&session).await {
        Ok(visitor_id) => visitor_id,
        Err(e) => return e.into_response(),
    };

    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let is_htmx = htmx::is_htmx(request.headers());
    let view = if is_htmx {
        htmx::current_view(request.headers()).unwrap_or_else(|| request.uri().path().to_string())
    } else {
        request.uri().path().to_string()
    };

    let reconciler = state.guards.enter(&visitor_id, &view, !is_htmx).await;
    let wait = state.guards.settings().render_wait();

    match reconciler.settled(wait).await {
        Verdict::Authorized(identity) => {
            tracing::debug!(visitor_id = %visitor_id, email = %identity.email, path = %target, "Admin request admitted");
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Verdict::Unauthorized => {
            state.guards.unmount(&visitor_id).await;
            tracing::info!(visitor_id = %visitor_id, path = %target, "Admin request denied, redirecting to login");
            htmx::redirect(&login_location(&target), is_htmx)
        }
        Verdict::Pending => LoadingTemplate { target }.into_response(),
    }
}

/// `/login?next=<target>`.
pub fn login_location(target: &str) -> String {
    match serde_urlencoded::to_string([("next", target)]) {
        Ok(query) => format!("/login?{}", query),
        Err(_) => "/login".to_string(),
    }
}
