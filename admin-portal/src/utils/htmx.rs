use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};

pub const HX_REQUEST: &str = "HX-Request";
pub const HX_CURRENT_URL: &str = "HX-Current-URL";
pub const HX_REDIRECT: &str = "HX-Redirect";

pub fn is_htmx(headers: &HeaderMap) -> bool {
    headers
        .get(HX_REQUEST)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == "true")
}

/// Path of the page an HTMX request was issued from.
pub fn current_view(headers: &HeaderMap) -> Option<String> {
    let url = headers.get(HX_CURRENT_URL)?.to_str().ok()?;
    let uri: axum::http::Uri = url.parse().ok()?;
    Some(uri.path().to_string())
}

/// Navigate the browser to `location`: `HX-Redirect` for HTMX requests, a
/// plain redirect otherwise.
pub fn redirect(location: &str, htmx: bool) -> Response {
    if !htmx {
        return Redirect::to(location).into_response();
    }

    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(HX_REDIRECT, value);
        }
        Err(_) => {
            headers.insert(HX_REDIRECT, HeaderValue::from_static("/"));
        }
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    (StatusCode::OK, headers, "").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_view_strips_origin_and_query() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HX_CURRENT_URL,
            HeaderValue::from_static("https://portal.example.com/admin?tab=1"),
        );
        assert_eq!(current_view(&headers).as_deref(), Some("/admin"));
    }

    #[test]
    fn htmx_redirect_uses_header() {
        let response = redirect("/login", true);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[HX_REDIRECT], "/login");

        let response = redirect("/login", false);
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }
}
