pub mod client;
pub mod provider;

use serde::{Deserialize, Serialize};

/// Transient login state held by the browser while the user is at the
/// identity provider. Encrypted into the login cookies; single-use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginCookie {
	pub state: String,
	pub nonce: String,
	pub code_verifier: String,
	pub referer: String,
	pub redirect_uri: String,
}

/// Token-endpoint response for both the code exchange and refresh grants.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
	pub access_token: String,
	#[serde(default)]
	pub id_token: Option<String>,
	#[serde(default)]
	pub refresh_token: Option<String>,
	pub expires_in: u64,
}

/// Error document returned by OAuth token endpoints.
#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
	#[serde(default)]
	error: String,
	#[serde(default)]
	error_description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OidcError {
	#[error("discovery document invalid: {0}")]
	Discovery(String),
	#[error("fetching jwks: {0}")]
	Jwks(String),
	#[error("building client assertion: {0}")]
	Assertion(String),
	#[error("invalid login parameter {parameter}={value:?}")]
	InvalidLoginParameter { parameter: &'static str, value: String },
	#[error("identity provider returned {status}: {error}: {error_description}")]
	Provider {
		status: u16,
		error: String,
		error_description: String,
	},
	#[error("identity provider unreachable: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("building request url: {0}")]
	Url(String),
}

impl OidcError {
	/// Whether a refresh failure is final: the token family is dead and the
	/// session should be destroyed. Transport errors and provider 5xx are
	/// transient and leave the session intact.
	pub fn is_final(&self) -> bool {
		matches!(self, OidcError::Provider { error, .. } if error == "invalid_grant")
	}
}
