mod common;

use admin_portal::config::GuardSettings;
use admin_portal::models::AllowListEntry;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
};
use common::{session, test_app, Harness};
use http_body_util::BodyExt;
use std::time::Duration;
use tower::util::ServiceExt;

async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn htmx_get(uri: &str, current_url: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("HX-Request", "true")
        .header("HX-Current-URL", current_url)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_check_works() {
    let (app, _state) = test_app(&Harness::new(), GuardSettings::default());

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(body_text(response).await, "OK");
}

#[tokio::test]
async fn public_pages_render_without_verification() {
    let harness = Harness::new();
    let (app, state) = test_app(&harness, GuardSettings::default());

    let response = app.oneshot(get("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .contains_key(header::CONTENT_SECURITY_POLICY));
    assert_eq!(state.guards.mounted_count(), 0);
    assert_eq!(harness.source.lookup_count(), 0);
}

#[tokio::test]
async fn unauthorized_visitor_is_sent_to_login_with_target() {
    let harness = Harness::new();
    let (app, state) = test_app(&harness, GuardSettings::default());

    let response = app.oneshot(get("/admin?tab=users")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[header::LOCATION],
        "/login?next=%2Fadmin%3Ftab%3Dusers"
    );
    assert_eq!(state.guards.mounted_count(), 0);
}

#[tokio::test]
async fn unauthorized_htmx_request_gets_hx_redirect() {
    let harness = Harness::new();
    let (app, _state) = test_app(&harness, GuardSettings::default());

    let response = app
        .oneshot(htmx_get("/admin/session", "http://localhost/admin"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["HX-Redirect"],
        "/login?next=%2Fadmin%2Fsession"
    );
}

#[tokio::test]
async fn authorized_visitor_sees_dashboard() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));
    let (app, state) = test_app(&harness, GuardSettings::default());

    let response = app.oneshot(get("/admin")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.guards.mounted_count(), 1);
    let body = body_text(response).await;
    assert!(body.contains("a@x.com"));
    assert!(body.contains("remote_session"));
}

#[tokio::test]
async fn access_removed_between_navigations_redirects_to_login() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));
    let (app, state) = test_app(&harness, GuardSettings::default());

    let response = app.clone().oneshot(get("/admin")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    assert_eq!(state.guards.mounted_count(), 1);

    harness.allow_list.remove("a@x.com");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/session")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[header::LOCATION],
        "/login?next=%2Fadmin%2Fsession"
    );
    assert_eq!(state.guards.mounted_count(), 0);
    assert!(harness.cache.current().is_none());
}

#[tokio::test]
async fn cached_identity_alone_is_enough_when_still_listed() {
    let harness = Harness::new();
    harness
        .cache
        .seed(Some(common::cached("a@x.com", Duration::from_secs(600))));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));
    let (app, _state) = test_app(&harness, GuardSettings::default());

    let response = app.oneshot(get("/admin/session")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("local_cache"));
}

#[tokio::test(start_paused = true)]
async fn slow_verification_renders_loading_page() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));
    harness
        .allow_list
        .delay_for("a@x.com", Duration::from_secs(3));
    let guard = GuardSettings {
        render_wait_ms: 50,
        ..GuardSettings::default()
    };
    let (app, state) = test_app(&harness, guard);

    let response = app.oneshot(get("/admin")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::LOCATION).is_none());
    assert!(body_text(response).await.contains("Checking access"));
    assert_eq!(state.guards.mounted_count(), 1);
}

#[tokio::test]
async fn login_page_drops_offsite_next() {
    let (app, _state) = test_app(&Harness::new(), GuardSettings::default());

    let response = app
        .oneshot(get("/login?next=%2F%2Fevil.example.com"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!body_text(response).await.contains("evil.example.com"));
}

#[tokio::test]
async fn logout_without_session_redirects_home() {
    let (app, _state) = test_app(&Harness::new(), GuardSettings::default());

    let response = app.oneshot(get("/logout")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], "/");
}

#[tokio::test]
async fn refresh_without_session_is_unauthorized() {
    let (app, _state) = test_app(&Harness::new(), GuardSettings::default());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/refresh")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn metrics_endpoint_is_public() {
    let (app, _state) = test_app(&Harness::new(), GuardSettings::default());

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
