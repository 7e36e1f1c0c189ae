use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use http::header::LOCATION;
use http::{HeaderMap, StatusCode, Uri};
use tracing::{info, warn};

use super::error::internal_error;
use super::AppState;
use crate::cookies;
use crate::metrics;
use crate::redirect::query_param;

/// Self-initiated logout: destroys the local session, clears every session
/// cookie and sends the browser to the provider's end-session endpoint so
/// the upstream single sign-on session dies too.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
	let mut id_token_hint = None;

	if let Some(cookie_value) = cookies::get(&headers, cookies::SESSION) {
		match state.sessions.get(&cookie_value).await {
			Ok(session) => {
				if !session.data.id_token.is_empty() {
					id_token_hint = Some(session.data.id_token.clone());
				}
				if let Err(e) = state.sessions.destroy(&session.id).await {
					return internal_error(&state, &headers, format!("logout: destroying session: {e}"));
				}
				info!("logout: session destroyed");
			},
			Err(e) => {
				// Nothing to destroy; clearing cookies is all that is left.
				info!(error = %e, "logout: could not load session");
			},
		}
	}

	let mut response_headers = HeaderMap::new();
	state.clear_session_cookie(&mut response_headers);
	state.clear_session_fallback_cookies(&mut response_headers, &headers);

	metrics::record_logout("self_initiated");

	let location = state
		.relying_party
		.end_session_url(id_token_hint.as_deref())
		.unwrap_or_else(|| post_logout_target(&state));
	redirect(&state, &headers, &location, response_headers, "logout")
}

/// Post-logout landing after the provider redirects back: clears whatever
/// cookies remain and hands the user to the configured landing page.
pub async fn logout_callback(State(state): State<AppState>, headers: HeaderMap) -> Response {
	let mut response_headers = HeaderMap::new();
	state.clear_session_cookie(&mut response_headers);
	state.clear_session_fallback_cookies(&mut response_headers, &headers);

	let location = post_logout_target(&state);
	info!(location = %location, "logout callback: redirecting");
	redirect(&state, &headers, &location, response_headers, "logout callback")
}

/// Logout initiated by the provider on behalf of a third party. Always 200:
/// the provider's iframe only cares that we acknowledged, and errors here
/// must never leak into the provider's logout page.
pub async fn front_channel_logout(
	State(state): State<AppState>,
	uri: Uri,
	headers: HeaderMap,
) -> Response {
	let mut response_headers = HeaderMap::new();
	state.clear_session_cookie(&mut response_headers);
	state.clear_session_fallback_cookies(&mut response_headers, &headers);

	match query_param(&uri, "sid").filter(|sid| !sid.is_empty()) {
		Some(sid) => {
			// The provider hands us its session id; the store key derives
			// from it exactly as at callback time.
			let session_id = state.sessions.session_key(&sid);
			if let Err(e) = state.sessions.destroy(&session_id).await {
				warn!(error = %e, "front-channel logout: failed to destroy session");
			} else {
				info!("front-channel logout: session destroyed");
			}
		},
		None => {
			info!("front-channel logout: no sid parameter; cookies cleared only");
		},
	}

	metrics::record_logout("front_channel");

	let mut builder = Response::builder().status(StatusCode::OK);
	if let Some(headers) = builder.headers_mut() {
		headers.extend(response_headers);
	}
	builder
		.body(Body::empty())
		.unwrap_or_else(|_| Response::new(Body::empty()))
}

fn post_logout_target(state: &super::Handler) -> String {
	state
		.config
		.openid
		.post_logout_redirect_uri
		.clone()
		.filter(|uri| !uri.is_empty())
		.unwrap_or_else(|| state.config.ingress_context_redirect())
}

fn redirect(
	state: &super::Handler,
	request_headers: &HeaderMap,
	location: &str,
	response_headers: HeaderMap,
	operation: &str,
) -> Response {
	let mut builder = Response::builder()
		.status(StatusCode::TEMPORARY_REDIRECT)
		.header(LOCATION, location);
	if let Some(headers) = builder.headers_mut() {
		headers.extend(response_headers);
	}
	builder.body(Body::empty()).unwrap_or_else(|e| {
		internal_error(state, request_headers, format!("{operation}: building redirect: {e}"))
	})
}
