use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use http::header::LOCATION;
use http::{HeaderMap, Request, StatusCode};
use tracing::{debug, warn};

use super::error::internal_error;
use super::AppState;
use crate::cookies;
use crate::redirect;
use crate::session::manager::{Session, SessionError};

/// Everything that is not an `/oauth2/*` route: resolve the session, keep it
/// warm (timeout extension, opportunistic refresh), and forward upstream
/// with a bearer token. Unauthenticated traffic either bounces to login or
/// passes through, per the auto-login rules.
pub async fn default(State(state): State<AppState>, request: Request<Body>) -> Response {
	let headers = request.headers().clone();

	match resolve_session(&state, &headers).await {
		Resolved::Session(mut session) => {
			if let Err(e) = state.sessions.extend_timeout(&mut session).await {
				warn!(error = %e, "failed to extend session timeout");
			}

			let session = match state.sessions.refresh_if_due(session, false).await {
				Ok(session) => session,
				Err(e) => {
					// The session died mid-request (rejected refresh or a
					// concurrent logout): start over unauthenticated.
					debug!(error = %e, "session became unavailable during refresh");
					return unauthenticated(&state, request, true).await;
				},
			};

			let bearer = session
				.data
				.has_access_token()
				.then_some(session.data.access_token.as_str());
			match state.upstream.forward(request, bearer).await {
				Ok(response) => response,
				Err(e) => internal_error(&state, &headers, format!("proxy: {e}")),
			}
		},
		Resolved::Unauthenticated { clear_cookie } => {
			unauthenticated(&state, request, clear_cookie).await
		},
	}
}

enum Resolved {
	Session(Session),
	Unauthenticated { clear_cookie: bool },
}

async fn resolve_session(state: &super::Handler, headers: &HeaderMap) -> Resolved {
	let Some(cookie_value) = cookies::get(headers, cookies::SESSION) else {
		return Resolved::Unauthenticated { clear_cookie: false };
	};

	match state.sessions.get(&cookie_value).await {
		Ok(session) => Resolved::Session(session),
		Err(SessionError::Store(e)) if !e.is_not_found() => {
			// The store is unreachable; a session persisted as fallback
			// cookies can still authenticate this request.
			warn!(error = %e, "session store unavailable; trying fallback cookies");
			match state.session_from_fallback_cookies(headers).await {
				Some(session) => Resolved::Session(session),
				None => Resolved::Unauthenticated { clear_cookie: false },
			}
		},
		Err(e) => {
			debug!(error = %e, "request has no usable session");
			match state.session_from_fallback_cookies(headers).await {
				Some(session) => Resolved::Session(session),
				None => Resolved::Unauthenticated { clear_cookie: true },
			}
		},
	}
}

async fn unauthenticated(state: &super::Handler, request: Request<Body>, clear_cookie: bool) -> Response {
	let method = request.method().clone();
	let path = request.uri().path().to_string();
	let headers = request.headers().clone();

	if state.auto_login.needs_login(&method, &path, false) {
		let target = original_target(request.uri());
		let location = redirect::login_url(&state.config.ingress_path(), &target);
		debug!(location = %location, "unauthenticated; redirecting to login");

		let mut builder = Response::builder()
			.status(StatusCode::TEMPORARY_REDIRECT)
			.header(LOCATION, location);
		if clear_cookie && let Some(response_headers) = builder.headers_mut() {
			state.clear_session_cookie(response_headers);
		}
		return builder
			.body(Body::empty())
			.unwrap_or_else(|e| internal_error(state, &headers, format!("auto-login: {e}")));
	}

	match state.upstream.forward(request, None).await {
		Ok(mut response) => {
			if clear_cookie {
				state.clear_session_cookie(response.headers_mut());
			}
			response
		},
		Err(e) => internal_error(state, &headers, format!("proxy: {e}")),
	}
}

fn original_target(uri: &http::Uri) -> String {
	match uri.query() {
		Some(query) => format!("{}?{query}", uri.path()),
		None => uri.path().to_string(),
	}
}
