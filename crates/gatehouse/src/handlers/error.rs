use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderMap, StatusCode};
use std::fmt::Display;
use tracing::{error, warn};

use super::Handler;
use crate::redirect;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Invalid login parameters and malformed queries.
pub fn bad_request(state: &Handler, headers: &HeaderMap, cause: impl Display) -> Response {
	respond(state, headers, StatusCode::BAD_REQUEST, cause)
}

/// Missing or invalid login state: the user has to authenticate (again).
pub fn unauthorized(state: &Handler, headers: &HeaderMap, cause: impl Display) -> Response {
	respond(state, headers, StatusCode::UNAUTHORIZED, cause)
}

/// Provider, store, crypto or template failures.
pub fn internal_error(state: &Handler, headers: &HeaderMap, cause: impl Display) -> Response {
	respond(state, headers, StatusCode::INTERNAL_SERVER_ERROR, cause)
}

pub fn correlation_id(headers: &HeaderMap) -> String {
	headers
		.get(REQUEST_ID_HEADER)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default()
		.to_string()
}

fn respond(state: &Handler, headers: &HeaderMap, status: StatusCode, cause: impl Display) -> Response {
	let correlation_id = correlation_id(headers);
	if status == StatusCode::UNAUTHORIZED {
		warn!(correlation_id = %correlation_id, "error in route: {cause}");
	} else {
		error!(correlation_id = %correlation_id, "error in route: {cause}");
	}

	if state.config.error_redirect_uri.is_some()
		&& let Some(response) = error_redirect(state, &correlation_id, status)
	{
		return response;
	}

	error_page(state, &correlation_id, status, headers)
}

/// Redirects to the configured error landing with `correlation_id` and
/// `status_code` query parameters. Scheme and host are stripped so the
/// override cannot leave the origin.
fn error_redirect(state: &Handler, correlation_id: &str, status: StatusCode) -> Option<Response> {
	let configured = state.config.error_redirect_uri.as_deref()?;
	let target = redirect::same_origin(configured, "/");
	let separator = if target.contains('?') { '&' } else { '?' };
	let location = format!(
		"{target}{separator}correlation_id={}&status_code={}",
		url_escape(correlation_id),
		status.as_u16()
	);

	Response::builder()
		.status(StatusCode::FOUND)
		.header(LOCATION, location)
		.body(Body::empty())
		.ok()
}

fn error_page(
	state: &Handler,
	correlation_id: &str,
	status: StatusCode,
	headers: &HeaderMap,
) -> Response {
	let retry_uri = retry_uri(state, headers);
	let html = render_error_page(correlation_id, &retry_uri);
	Response::builder()
		.status(status)
		.header(CONTENT_TYPE, "text/html; charset=utf-8")
		.body(Body::from(html))
		.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// A link that restarts login, returning to where the user was headed: the
/// login cookie's referer when one survives, the ingress context otherwise.
fn retry_uri(state: &Handler, headers: &HeaderMap) -> String {
	let target = state
		.login_cookie(headers)
		.map(|cookie| cookie.referer)
		.unwrap_or_else(|_| state.config.ingress_context_redirect());
	redirect::login_url(&state.config.ingress_path(), &target)
}

fn render_error_page(correlation_id: &str, retry_uri: &str) -> String {
	format!(
		r#"<!DOCTYPE html>
<html lang="en">
<head>
	<meta charset="utf-8">
	<title>Something went wrong</title>
</head>
<body>
	<h1>Something went wrong</h1>
	<p>Try again, and report the error ID below if the problem persists.</p>
	<p><a href="{retry_uri}">Retry</a></p>
	<p><small>Error ID: <code>{correlation_id}</code></small></p>
</body>
</html>
"#,
		retry_uri = html_escape(retry_uri),
		correlation_id = html_escape(correlation_id),
	)
}

fn html_escape(value: &str) -> String {
	value
		.replace('&', "&amp;")
		.replace('<', "&lt;")
		.replace('>', "&gt;")
		.replace('"', "&quot;")
}

fn url_escape(value: &str) -> String {
	url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::HeaderValue;

	#[test]
	fn error_page_renders_correlation_id_and_retry_link() {
		let html = render_error_page("abc-123", "/oauth2/login?redirect-encoded=Lw");
		assert!(html.contains("abc-123"));
		assert!(html.contains("href=\"/oauth2/login?redirect-encoded=Lw\""));
	}

	#[test]
	fn error_page_escapes_markup() {
		let html = render_error_page("<script>", "/retry");
		assert!(!html.contains("<script>"));
		assert!(html.contains("&lt;script&gt;"));
	}

	#[test]
	fn correlation_id_comes_from_request_id_header() {
		let mut headers = HeaderMap::new();
		headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-1"));
		assert_eq!(correlation_id(&headers), "req-1");
		assert_eq!(correlation_id(&HeaderMap::new()), "");
	}
}
