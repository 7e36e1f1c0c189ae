use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, RedirectUrl, Scope};
use rand::RngCore;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use super::provider::Provider;
use super::{ErrorResponse, LoginCookie, OidcError, TokenResponse};
use crate::config::{ClientAuth, Config};
use crate::metrics;

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const CLIENT_ASSERTION_LIFETIME_SECONDS: i64 = 30;

const STATE_ENTROPY_BYTES: usize = 32;
const NONCE_ENTROPY_BYTES: usize = 32;
const CODE_VERIFIER_ENTROPY_BYTES: usize = 64;

/// Per-request login inputs: the sanitised post-login target plus the
/// optional `level`/`locale` overrides from the login URL.
#[derive(Debug, Default)]
pub struct LoginRequest {
	pub canonical_redirect: String,
	pub level: Option<String>,
	pub locale: Option<String>,
}

/// A prepared login: where to send the browser, and the single-use state to
/// stash in the login cookie until the callback.
#[derive(Debug)]
pub struct Login {
	pub auth_code_url: String,
	pub cookie: LoginCookie,
}

/// The relying-party side of the Authorization Code Flow with PKCE and
/// `private_key_jwt` client authentication.
pub struct RelyingParty {
	provider: Arc<Provider>,
	http: reqwest::Client,
	client_id: String,
	client_auth: ClientAuth,
	scopes: Vec<String>,
	acr_values: Option<String>,
	ui_locales: Option<String>,
	redirect_uri: String,
	logout_callback_url: String,
}

impl RelyingParty {
	pub fn new(config: &Config, provider: Arc<Provider>, http: reqwest::Client) -> Self {
		Self {
			provider,
			http,
			client_id: config.openid.client_id.clone(),
			client_auth: config.openid.client_auth.clone(),
			scopes: config.openid.scopes.clone(),
			acr_values: config.openid.acr_values.clone(),
			ui_locales: config.openid.ui_locales.clone(),
			redirect_uri: config.login_callback_url(),
			logout_callback_url: config.logout_callback_url(),
		}
	}

	pub fn provider(&self) -> &Arc<Provider> {
		&self.provider
	}

	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	pub fn redirect_uri(&self) -> &str {
		&self.redirect_uri
	}

	pub fn acr_values_configured(&self) -> bool {
		self.acr_values.as_deref().is_some_and(|v| !v.is_empty())
	}

	/// Builds the authorization URL and the matching login-cookie payload.
	pub fn authorization_code_url(&self, request: &LoginRequest) -> Result<Login, OidcError> {
		let state = random_url_safe(STATE_ENTROPY_BYTES);
		let nonce = random_url_safe(NONCE_ENTROPY_BYTES);
		let code_verifier = random_url_safe(CODE_VERIFIER_ENTROPY_BYTES);
		let code_challenge = code_challenge(&code_verifier);

		let metadata = self.provider.metadata();
		let client = BasicClient::new(ClientId::new(self.client_id.clone()))
			.set_auth_uri(
				AuthUrl::new(metadata.authorization_endpoint.clone())
					.map_err(|e| OidcError::Url(format!("invalid authorization endpoint: {e}")))?,
			)
			.set_redirect_uri(
				RedirectUrl::new(self.redirect_uri.clone())
					.map_err(|e| OidcError::Url(format!("invalid redirect uri: {e}")))?,
			);

		let mut auth_request = client
			.authorize_url(|| CsrfToken::new(state.clone()))
			.add_extra_param("nonce", nonce.clone())
			.add_extra_param("response_mode", "query")
			.add_extra_param("code_challenge", code_challenge)
			.add_extra_param("code_challenge_method", "S256");
		for scope in &self.scopes {
			auth_request = auth_request.add_scope(Scope::new(scope.clone()));
		}

		if let Some(acr) = login_url_parameter(
			"level",
			request.level.as_deref(),
			self.acr_values.as_deref(),
			&metadata.acr_values_supported,
		)? {
			auth_request = auth_request.add_extra_param("acr_values", acr);
		}
		if let Some(locale) = login_url_parameter(
			"locale",
			request.locale.as_deref(),
			self.ui_locales.as_deref(),
			&metadata.ui_locales_supported,
		)? {
			auth_request = auth_request.add_extra_param("ui_locales", locale);
		}

		let (auth_code_url, _csrf) = auth_request.url();

		Ok(Login {
			auth_code_url: auth_code_url.to_string(),
			cookie: LoginCookie {
				state,
				nonce,
				code_verifier,
				referer: request.canonical_redirect.clone(),
				redirect_uri: self.redirect_uri.clone(),
			},
		})
	}

	/// Redeems an authorization code with PKCE.
	pub async fn exchange_code(
		&self,
		code: &str,
		code_verifier: &str,
	) -> Result<TokenResponse, OidcError> {
		let assertion = self.client_assertion()?;
		let params = [
			("grant_type", "authorization_code"),
			("code", code),
			("redirect_uri", &self.redirect_uri),
			("client_id", &self.client_id),
			("code_verifier", code_verifier),
			("client_assertion_type", CLIENT_ASSERTION_TYPE),
			("client_assertion", &assertion),
		];
		self.token_request("exchange", &params).await
	}

	/// Trades a refresh token for a fresh token set. Callers must hold the
	/// session's refresh lease; see the session manager.
	pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OidcError> {
		let assertion = self.client_assertion()?;
		let params = [
			("grant_type", "refresh_token"),
			("refresh_token", refresh_token),
			("client_id", &self.client_id),
			("client_assertion_type", CLIENT_ASSERTION_TYPE),
			("client_assertion", &assertion),
		];
		self.token_request("refresh", &params).await
	}

	async fn token_request(
		&self,
		operation: &'static str,
		params: &[(&str, &str)],
	) -> Result<TokenResponse, OidcError> {
		let result = self.token_request_inner(params).await;
		match &result {
			Ok(_) => metrics::record_idp_request(operation, "success"),
			Err(_) => metrics::record_idp_request(operation, "error"),
		}
		result
	}

	async fn token_request_inner(
		&self,
		params: &[(&str, &str)],
	) -> Result<TokenResponse, OidcError> {
		let response = self
			.http
			.post(&self.provider.metadata().token_endpoint)
			.form(params)
			.send()
			.await?;

		let status = response.status();
		if status.is_success() {
			return Ok(response.json::<TokenResponse>().await?);
		}

		let body = response.text().await.unwrap_or_default();
		let parsed: ErrorResponse = serde_json::from_str(&body).unwrap_or(ErrorResponse {
			error: String::new(),
			error_description: body,
		});
		Err(OidcError::Provider {
			status: status.as_u16(),
			error: parsed.error,
			error_description: parsed.error_description,
		})
	}

	/// The provider's end-session URL with our post-logout landing and, when
	/// available, the session's ID token as a hint. `None` when the provider
	/// does not advertise an end-session endpoint.
	pub fn end_session_url(&self, id_token_hint: Option<&str>) -> Option<String> {
		let endpoint = self.provider.metadata().end_session_endpoint.as_deref()?;
		let mut url = Url::parse(endpoint).ok()?;
		url
			.query_pairs_mut()
			.append_pair("post_logout_redirect_uri", &self.logout_callback_url);
		if let Some(hint) = id_token_hint {
			url.query_pairs_mut().append_pair("id_token_hint", hint);
		}
		Some(url.to_string())
	}

	/// A short-lived JWT proving possession of the client's key, addressed
	/// to the token endpoint.
	fn client_assertion(&self) -> Result<String, OidcError> {
		let now = Utc::now();
		let claims = serde_json::json!({
			"iss": self.client_id,
			"sub": self.client_id,
			"aud": self.provider.metadata().token_endpoint,
			"jti": Uuid::new_v4().to_string(),
			"iat": now.timestamp(),
			"exp": now.timestamp() + CLIENT_ASSERTION_LIFETIME_SECONDS,
		});

		let (header, key) = match &self.client_auth {
			ClientAuth::PrivateKeyJwt {
				private_key_pem,
				key_id,
			} => {
				let key = EncodingKey::from_rsa_pem(private_key_pem.expose_secret().as_bytes())
					.map_err(|e| OidcError::Assertion(format!("invalid private key: {e}")))?;
				let mut header = Header::new(Algorithm::RS256);
				header.kid = key_id.clone();
				(header, key)
			},
			ClientAuth::ClientSecretJwt { client_secret } => (
				Header::new(Algorithm::HS256),
				EncodingKey::from_secret(client_secret.expose_secret().as_bytes()),
			),
		};

		encode(&header, &claims, &key).map_err(|e| OidcError::Assertion(e.to_string()))
	}
}

/// Resolves an optional login-URL override against the configured fallback
/// and the provider's advertised support. A parameter with no configured
/// fallback is ignored entirely.
fn login_url_parameter(
	parameter: &'static str,
	requested: Option<&str>,
	fallback: Option<&str>,
	supported: &[String],
) -> Result<Option<String>, OidcError> {
	let Some(fallback) = fallback.filter(|f| !f.is_empty()) else {
		return Ok(None);
	};
	let value = requested.filter(|v| !v.is_empty()).unwrap_or(fallback);
	if supported.iter().any(|s| s == value) {
		Ok(Some(value.to_string()))
	} else {
		Err(OidcError::InvalidLoginParameter {
			parameter,
			value: value.to_string(),
		})
	}
}

fn random_url_safe(bytes: usize) -> String {
	let mut buf = vec![0u8; bytes];
	rand::rng().fill_bytes(&mut buf);
	URL_SAFE_NO_PAD.encode(buf)
}

fn code_challenge(code_verifier: &str) -> String {
	let digest = Sha256::digest(code_verifier.as_bytes());
	URL_SAFE_NO_PAD.encode(digest)
}
