use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use http::header::LOCATION;
use http::{HeaderMap, StatusCode, Uri};
use tracing::info;

use super::error::{bad_request, internal_error};
use super::AppState;
use crate::metrics;
use crate::oidc::OidcError;
use crate::oidc::client::LoginRequest;
use crate::redirect;

/// Starts the Authorization Code Flow: computes the post-login target,
/// builds the provider's authorization URL, stashes the single-use state in
/// the encrypted login cookies and sends the browser on its way.
pub async fn login(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
	let canonical_redirect =
		redirect::canonical_redirect(&uri, &headers, &state.config.ingress_path());

	let request = LoginRequest {
		canonical_redirect: canonical_redirect.clone(),
		level: redirect::query_param(&uri, "level"),
		locale: redirect::query_param(&uri, "locale"),
	};
	let login = match state.relying_party.authorization_code_url(&request) {
		Ok(login) => login,
		Err(e @ OidcError::InvalidLoginParameter { .. }) => {
			return bad_request(&state, &headers, format!("login: {e}"));
		},
		Err(e) => return internal_error(&state, &headers, format!("login: {e}")),
	};

	let mut response_headers = HeaderMap::new();
	if let Err(e) = state.set_login_cookies(&mut response_headers, &login.cookie) {
		return internal_error(&state, &headers, format!("login: setting cookie: {e}"));
	}

	info!(redirect_after_login = %canonical_redirect, "login: redirecting to identity provider");
	metrics::record_login();

	let mut builder = Response::builder()
		.status(StatusCode::TEMPORARY_REDIRECT)
		.header(LOCATION, login.auth_code_url);
	if let Some(builder_headers) = builder.headers_mut() {
		builder_headers.extend(response_headers);
	}
	builder
		.body(Body::empty())
		.unwrap_or_else(|e| internal_error(&state, &headers, format!("login: building redirect: {e}")))
}
