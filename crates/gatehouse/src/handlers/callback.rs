use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use http::header::LOCATION;
use http::{HeaderMap, StatusCode, Uri};
use tracing::{info, warn};

use super::error::{bad_request, internal_error, unauthorized};
use super::AppState;
use crate::oidc::LoginCookie;
use crate::redirect::query_param;
use crate::token::{self, IdTokenExpectations, InvalidTokenKind, ParsedToken};

/// Completes the Authorization Code Flow: verifies the returning state,
/// redeems the code with PKCE, validates the ID token, materialises the
/// session and swaps the login cookies for the session cookie.
pub async fn callback(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
	let login_cookie = match state.login_cookie(&headers) {
		Ok(cookie) => cookie,
		Err(e) => return unauthorized(&state, &headers, format!("callback: fetching login cookie: {e}")),
	};

	// The (state, nonce, code_verifier) triple is single-use: once the
	// login cookie has been read, every exit clears it.
	let consume = |mut response: Response| -> Response {
		state.clear_login_cookies(response.headers_mut());
		response
	};

	if let Some(error) = query_param(&uri, "error") {
		let description = query_param(&uri, "error_description").unwrap_or_default();
		return consume(internal_error(
			&state,
			&headers,
			format!("callback: error from identity provider: {error}: {description}"),
		));
	}

	match query_param(&uri, "state") {
		Some(state_param) if state_param == login_cookie.state => {},
		_ => return consume(unauthorized(&state, &headers, "callback: state parameter mismatch")),
	}

	let Some(code) = query_param(&uri, "code").filter(|c| !c.is_empty()) else {
		return consume(bad_request(&state, &headers, "callback: missing code parameter"));
	};

	let tokens = match state
		.relying_party
		.exchange_code(&code, &login_cookie.code_verifier)
		.await
	{
		Ok(tokens) => tokens,
		Err(e) => {
			return consume(internal_error(&state, &headers, format!("callback: exchanging code: {e}")));
		},
	};

	let Some(raw_id_token) = tokens.id_token.as_deref() else {
		return consume(internal_error(&state, &headers, "callback: token response has no id_token"));
	};

	let id_token = match parse_with_jwks_retry(&state, raw_id_token).await {
		Ok(token) => token,
		Err(e) => {
			return consume(internal_error(&state, &headers, format!("callback: parsing id_token: {e}")));
		},
	};

	let expectations = IdTokenExpectations {
		client_id: state.relying_party.client_id().to_string(),
		issuer: state.relying_party.provider().metadata().issuer.clone(),
		nonce: login_cookie.nonce.clone(),
		require_sid: state.relying_party.provider().sid_claim_required(),
		require_acr: state.relying_party.acr_values_configured(),
	};
	if let Err(e) = token::validate_id_token(&id_token, &expectations) {
		return consume(internal_error(&state, &headers, format!("callback: validating id_token: {e}")));
	}

	let external_session_id = match external_session_id(&state, &id_token) {
		Ok(id) => id,
		Err(e) => return consume(internal_error(&state, &headers, format!("callback: {e}"))),
	};

	let session = state.sessions.create(
		external_session_id,
		&tokens,
		id_token.jwt_id().unwrap_or_default().to_string(),
	);

	let mut response_headers = HeaderMap::new();
	if let Err(e) = state.sessions.persist(&session).await {
		// Keep the login alive through the fallback cookies; the store may
		// come back for the next request.
		warn!(error = %e, "callback: session store unavailable; using cookie fallback");
		if let Err(e) = state.set_session_fallback_cookies(
			&mut response_headers,
			&session.data,
			state.config.session.max_lifetime(),
		) {
			return internal_error(&state, &headers, format!("callback: session fallback: {e}"));
		}
	}

	if let Err(e) = state.set_session_cookie(&mut response_headers, &session) {
		return internal_error(&state, &headers, format!("callback: setting session cookie: {e}"));
	}
	state.clear_login_cookies(&mut response_headers);

	info!("callback: successful login; redirecting to application");
	redirect_with_headers(&state, &headers, &login_cookie, response_headers)
}

async fn parse_with_jwks_retry(
	state: &super::Handler,
	raw: &str,
) -> Result<ParsedToken, token::InvalidToken> {
	let provider = state.relying_party.provider();
	match token::parse(raw, &provider.jwks()) {
		Ok(token) => Ok(token),
		Err(e) if e.kind == InvalidTokenKind::Signature => {
			// An unknown kid usually means the provider rotated keys since
			// our last fetch.
			match provider.refresh_jwks().await {
				Ok(jwks) => token::parse(raw, &jwks),
				Err(refresh_err) => {
					warn!(error = %refresh_err, "jwks refresh after verification miss failed");
					Err(e)
				},
			}
		},
		Err(e) => Err(e),
	}
}

/// The identifier the provider knows this session by: `sid` when the
/// provider does per-session front-channel logout, `session_state` when it
/// publishes a check-session iframe, else a generated one.
fn external_session_id(state: &super::Handler, id_token: &ParsedToken) -> Result<String, String> {
	let provider = state.relying_party.provider();
	if provider.sid_claim_required() {
		return id_token
			.claim_str("sid")
			.map(str::to_string)
			.ok_or_else(|| "id_token is missing the sid claim".to_string());
	}
	if provider.metadata().check_session_iframe.is_some() {
		return id_token
			.claim_str("session_state")
			.map(str::to_string)
			.ok_or_else(|| "id_token is missing the session_state claim".to_string());
	}
	Ok(state.sessions.generate_external_session_id())
}

fn redirect_with_headers(
	state: &super::Handler,
	request_headers: &HeaderMap,
	login_cookie: &LoginCookie,
	response_headers: HeaderMap,
) -> Response {
	let mut builder = Response::builder()
		.status(StatusCode::TEMPORARY_REDIRECT)
		.header(LOCATION, login_cookie.referer.as_str());
	if let Some(headers) = builder.headers_mut() {
		headers.extend(response_headers);
	}
	builder.body(Body::empty()).unwrap_or_else(|e| {
		internal_error(state, request_headers, format!("callback: building redirect: {e}"))
	})
}
