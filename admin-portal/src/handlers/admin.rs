use crate::models::Identity;
use askama::Template;
use axum::{response::IntoResponse, Extension};

#[derive(Template)]
#[template(path = "admin.html")]
pub struct AdminTemplate {
    pub identity: Identity,
    pub verified_at: String,
}

#[derive(Template)]
#[template(path = "admin_session.html")]
pub struct SessionFragmentTemplate {
    pub identity: Identity,
    pub verified_at: String,
}

fn format_verified_at(identity: &Identity) -> String {
    identity
        .verified_at
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string()
}

pub async fn admin_dashboard_handler(Extension(identity): Extension<Identity>) -> impl IntoResponse {
    let verified_at = format_verified_at(&identity);
    AdminTemplate {
        identity,
        verified_at,
    }
}

/// HTMX fragment with the identity verified for this very request.
pub async fn session_fragment(Extension(identity): Extension<Identity>) -> impl IntoResponse {
    let verified_at = format_verified_at(&identity);
    SessionFragmentTemplate {
        identity,
        verified_at,
    }
}
