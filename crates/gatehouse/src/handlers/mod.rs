pub mod callback;
pub mod default;
pub mod error;
pub mod login;
pub mod logout;
pub mod session_api;

use cookie::SameSite;
use http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::autologin::AutoLogin;
use crate::config::Config;
use crate::cookies::{self, CookieError, CookieOptions};
use crate::crypto::Crypter;
use crate::oidc::LoginCookie;
use crate::oidc::client::RelyingParty;
use crate::proxy::Upstream;
use crate::session::manager::{Session, SessionManager};
use crate::session::{Data, Metadata};
use crate::token;

pub const LOGIN_COOKIE_LIFETIME: Duration = Duration::from_secs(3600);

/// Shared per-process state behind every route.
pub struct Handler {
	pub config: Config,
	pub crypter: Arc<Crypter>,
	pub relying_party: Arc<RelyingParty>,
	pub sessions: Arc<SessionManager>,
	pub auto_login: AutoLogin,
	pub upstream: Upstream,
	pub cookie_options: CookieOptions,
}

pub type AppState = Arc<Handler>;

impl Handler {
	/// Reads and decrypts the login cookie, trying the modern name first and
	/// the legacy copy second.
	pub fn login_cookie(&self, headers: &HeaderMap) -> Result<LoginCookie, CookieError> {
		let raw = match cookies::get_encrypted(headers, cookies::LOGIN, &self.crypter) {
			Ok(raw) => raw,
			Err(e) => {
				debug!(error = %e, "no usable login cookie; trying legacy");
				cookies::get_encrypted(headers, cookies::LOGIN_LEGACY, &self.crypter)?
			},
		};
		serde_json::from_str(&raw).map_err(|e| CookieError::Encoding(e.to_string()))
	}

	/// Writes the login state twice: once with `SameSite=None` so the
	/// cross-site redirect from the provider carries it, and a legacy copy
	/// with the user agent's default for browsers that mishandle `None`.
	pub fn set_login_cookies(
		&self,
		headers: &mut HeaderMap,
		login_cookie: &LoginCookie,
	) -> Result<(), CookieError> {
		let value = serde_json::to_string(login_cookie).map_err(|e| CookieError::Encoding(e.to_string()))?;
		let modern = self
			.cookie_options
			.clone()
			.with_max_age(LOGIN_COOKIE_LIFETIME)
			.with_same_site(Some(SameSite::None));
		cookies::set_encrypted(headers, cookies::LOGIN, &value, &modern, &self.crypter)?;

		let legacy = modern.with_same_site(None);
		cookies::set_encrypted(headers, cookies::LOGIN_LEGACY, &value, &legacy, &self.crypter)
	}

	pub fn clear_login_cookies(&self, headers: &mut HeaderMap) {
		let modern = self.cookie_options.clone().with_same_site(Some(SameSite::None));
		cookies::clear(headers, cookies::LOGIN, &modern);
		cookies::clear(headers, cookies::LOGIN_LEGACY, &modern.with_same_site(None));
	}

	pub fn set_session_cookie(
		&self,
		headers: &mut HeaderMap,
		session: &Session,
	) -> Result<(), crate::session::manager::SessionError> {
		let value = self.sessions.cookie_value(session)?;
		cookies::set(headers, cookies::SESSION, value, &self.cookie_options);
		Ok(())
	}

	pub fn clear_session_cookie(&self, headers: &mut HeaderMap) {
		cookies::clear(headers, cookies::SESSION, &self.cookie_options);
	}

	/// Materialises the session as encrypted cookies when the store cannot
	/// be written: the external id, the ID token and the access token, each
	/// in its own cookie.
	pub fn set_session_fallback_cookies(
		&self,
		headers: &mut HeaderMap,
		data: &Data,
		expires_in: Duration,
	) -> Result<(), CookieError> {
		let opts = self.cookie_options.clone().with_max_age(expires_in);
		cookies::set_encrypted(
			headers,
			&cookies::session_fallback_external_id(),
			&data.external_session_id,
			&opts,
			&self.crypter,
		)?;
		cookies::set_encrypted(
			headers,
			&cookies::session_fallback_id_token(),
			&data.id_token,
			&opts,
			&self.crypter,
		)?;
		cookies::set_encrypted(
			headers,
			&cookies::session_fallback_access_token(),
			&data.access_token,
			&opts,
			&self.crypter,
		)
	}

	/// Rebuilds session data from the fallback cookies. The ID token is
	/// re-verified against the current key set so a forged or expired token
	/// cannot ride in through cookies.
	pub async fn session_from_fallback_cookies(&self, headers: &HeaderMap) -> Option<Session> {
		let external_id =
			cookies::get_encrypted(headers, &cookies::session_fallback_external_id(), &self.crypter)
				.ok()?;
		let id_token =
			cookies::get_encrypted(headers, &cookies::session_fallback_id_token(), &self.crypter).ok()?;
		let access_token =
			cookies::get_encrypted(headers, &cookies::session_fallback_access_token(), &self.crypter)
				.ok()?;

		let provider = self.relying_party.provider();
		let parsed = match token::parse(&id_token, &provider.jwks()) {
			Ok(parsed) => parsed,
			Err(e) if e.kind == token::InvalidTokenKind::Signature => {
				// The key set may be stale; refresh once and retry.
				let jwks = provider.refresh_jwks().await.ok()?;
				token::parse(&id_token, &jwks).ok()?
			},
			Err(_) => return None,
		};

		let expires_in = parsed
			.expiration()
			.and_then(|exp| (exp - chrono::Utc::now()).to_std().ok())
			.unwrap_or(Duration::ZERO);
		let metadata = Metadata::new(expires_in, self.config.session.max_lifetime());

		let id = self.sessions.session_key(&external_id);
		Some(Session {
			id,
			data: Data {
				external_session_id: external_id,
				access_token,
				id_token,
				refresh_token: String::new(),
				id_token_jwt_id: parsed.jwt_id().unwrap_or_default().to_string(),
				metadata,
			},
		})
	}

	pub fn clear_session_fallback_cookies(&self, headers: &mut HeaderMap, request: &HeaderMap) {
		for name in [
			cookies::session_fallback_external_id(),
			cookies::session_fallback_id_token(),
			cookies::session_fallback_access_token(),
		] {
			if cookies::get(request, &name).is_some() {
				cookies::clear(headers, &name, &self.cookie_options);
			}
		}
	}
}
