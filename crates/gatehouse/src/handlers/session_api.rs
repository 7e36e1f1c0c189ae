use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{HeaderMap, StatusCode, Uri};

use super::error::unauthorized;
use super::AppState;
use crate::cookies;
use crate::redirect::query_param;
use crate::session::manager::{Session, SessionError};

/// Session metadata for the current user: the compact document by default,
/// the verbose variant with `?verbose=true`.
pub async fn session_info(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
	let session = match load_session(&state, &headers).await {
		Ok(session) => session,
		Err(response) => return *response,
	};

	let verbose = query_param(&uri, "verbose").is_some_and(|v| v == "true" || v == "1");
	if verbose {
		Json(session.data.metadata.verbose()).into_response()
	} else {
		Json(session.data.metadata.compact()).into_response()
	}
}

/// Forces a token refresh, subject to the cooldown, and returns the
/// refresh-aware metadata document.
pub async fn session_refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
	let session = match load_session(&state, &headers).await {
		Ok(session) => session,
		Err(response) => return *response,
	};

	match state.sessions.refresh_if_due(session, true).await {
		Ok(session) => Json(session.data.metadata.verbose_with_refresh()).into_response(),
		Err(SessionError::Refresh(e)) => {
			// The provider rejected the refresh token for good; the session
			// is already destroyed.
			let mut response = unauthorized(&state, &headers, format!("session refresh: {e}"));
			state.clear_session_cookie(response.headers_mut());
			response
		},
		Err(e) => unauthorized(&state, &headers, format!("session refresh: {e}")),
	}
}

async fn load_session(state: &super::Handler, headers: &HeaderMap) -> Result<Session, Box<Response>> {
	let Some(cookie_value) = cookies::get(headers, cookies::SESSION) else {
		return Err(Box::new(StatusCode::UNAUTHORIZED.into_response()));
	};
	match state.sessions.get(&cookie_value).await {
		Ok(session) => Ok(session),
		Err(
			e @ (SessionError::NotFound
			| SessionError::Expired
			| SessionError::Inactive
			| SessionError::InvalidCookie(_)),
		) => Err(Box::new(unauthorized(state, headers, format!("session: {e}")))),
		Err(e) => Err(Box::new(super::error::internal_error(
			state,
			headers,
			format!("session: {e}"),
		))),
	}
}
