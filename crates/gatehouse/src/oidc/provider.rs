use jsonwebtoken::jwk::JwkSet;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::OidcError;

const JWKS_BACKGROUND_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// The subset of the provider's well-known document we act on.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
	pub issuer: String,
	pub authorization_endpoint: String,
	pub token_endpoint: String,
	pub jwks_uri: String,
	#[serde(default)]
	pub end_session_endpoint: Option<String>,
	#[serde(default)]
	pub frontchannel_logout_supported: bool,
	#[serde(default)]
	pub frontchannel_logout_session_supported: bool,
	#[serde(default)]
	pub check_session_iframe: Option<String>,
	#[serde(default)]
	pub acr_values_supported: Vec<String>,
	#[serde(default)]
	pub ui_locales_supported: Vec<String>,
}

impl ProviderMetadata {
	fn validate(&self) -> Result<(), OidcError> {
		for (name, value) in [
			("issuer", &self.issuer),
			("authorization_endpoint", &self.authorization_endpoint),
			("token_endpoint", &self.token_endpoint),
			("jwks_uri", &self.jwks_uri),
		] {
			if value.trim().is_empty() {
				return Err(OidcError::Discovery(format!("missing {name}")));
			}
		}
		Ok(())
	}
}

/// A discovered identity provider. The JWKS cache is confined here and
/// swapped atomically on refresh; readers clone the current `Arc`.
#[derive(Debug)]
pub struct Provider {
	metadata: ProviderMetadata,
	http: reqwest::Client,
	jwks: RwLock<Arc<JwkSet>>,
}

impl Provider {
	/// Fetches the well-known document and the initial key set.
	pub async fn discover(http: reqwest::Client, well_known_url: &Url) -> Result<Arc<Self>, OidcError> {
		let metadata: ProviderMetadata = http
			.get(well_known_url.clone())
			.send()
			.await?
			.error_for_status()?
			.json()
			.await
			.map_err(|e| OidcError::Discovery(e.to_string()))?;
		metadata.validate()?;

		let jwks = fetch_jwks(&http, &metadata.jwks_uri).await?;
		Ok(Arc::new(Self {
			metadata,
			http,
			jwks: RwLock::new(Arc::new(jwks)),
		}))
	}

	#[cfg(test)]
	pub(crate) fn from_parts(metadata: ProviderMetadata, jwks: JwkSet) -> Arc<Self> {
		Arc::new(Self {
			metadata,
			http: reqwest::Client::new(),
			jwks: RwLock::new(Arc::new(jwks)),
		})
	}

	pub fn metadata(&self) -> &ProviderMetadata {
		&self.metadata
	}

	/// `sid` is present in ID tokens iff the provider supports per-session
	/// front-channel logout.
	pub fn sid_claim_required(&self) -> bool {
		self.metadata.frontchannel_logout_supported
			&& self.metadata.frontchannel_logout_session_supported
	}

	pub fn jwks(&self) -> Arc<JwkSet> {
		self.jwks.read().expect("jwks lock poisoned").clone()
	}

	/// Re-fetches the key set and replaces the cache. Used on verification
	/// misses (key rotation) and by the background refresh loop.
	pub async fn refresh_jwks(&self) -> Result<Arc<JwkSet>, OidcError> {
		let fresh = Arc::new(fetch_jwks(&self.http, &self.metadata.jwks_uri).await?);
		*self.jwks.write().expect("jwks lock poisoned") = fresh.clone();
		debug!(keys = fresh.keys.len(), "replaced cached jwks");
		Ok(fresh)
	}

	/// Spawns the periodic JWKS refresh. Failures are logged and retried at
	/// the next tick; the previous key set stays in place.
	pub fn spawn_jwks_refresh(self: &Arc<Self>) {
		let provider = Arc::downgrade(self);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(JWKS_BACKGROUND_REFRESH_INTERVAL);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				let Some(provider) = provider.upgrade() else {
					return;
				};
				if let Err(e) = provider.refresh_jwks().await {
					warn!(error = %e, "background jwks refresh failed");
				}
			}
		});
	}
}

async fn fetch_jwks(http: &reqwest::Client, jwks_uri: &str) -> Result<JwkSet, OidcError> {
	let jwks: JwkSet = http
		.get(jwks_uri)
		.send()
		.await?
		.error_for_status()?
		.json()
		.await
		.map_err(|e| OidcError::Jwks(e.to_string()))?;
	if jwks.keys.is_empty() {
		return Err(OidcError::Jwks("key set is empty".to_string()));
	}
	Ok(jwks)
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn jwks_body() -> serde_json::Value {
		serde_json::json!({
			"keys": [{
				"kty": "oct",
				"kid": "k1",
				"alg": "HS256",
				"k": "c2VjcmV0LXNpZ25pbmcta2V5"
			}]
		})
	}

	async fn mock_idp(server: &MockServer, frontchannel: bool) {
		let metadata = serde_json::json!({
			"issuer": server.uri(),
			"authorization_endpoint": format!("{}/authorize", server.uri()),
			"token_endpoint": format!("{}/token", server.uri()),
			"end_session_endpoint": format!("{}/endsession", server.uri()),
			"jwks_uri": format!("{}/jwks", server.uri()),
			"frontchannel_logout_supported": frontchannel,
			"frontchannel_logout_session_supported": frontchannel,
		});
		Mock::given(method("GET"))
			.and(path("/.well-known/openid-configuration"))
			.respond_with(ResponseTemplate::new(200).set_body_json(metadata))
			.mount(server)
			.await;
		Mock::given(method("GET"))
			.and(path("/jwks"))
			.respond_with(ResponseTemplate::new(200).set_body_json(jwks_body()))
			.mount(server)
			.await;
	}

	#[tokio::test]
	async fn discover_fetches_metadata_and_jwks() {
		let server = MockServer::start().await;
		mock_idp(&server, true).await;

		let url: Url = format!("{}/.well-known/openid-configuration", server.uri())
			.parse()
			.unwrap();
		let provider = Provider::discover(reqwest::Client::new(), &url).await.unwrap();

		assert_eq!(provider.metadata().issuer, server.uri());
		assert!(provider.sid_claim_required());
		assert_eq!(provider.jwks().keys.len(), 1);
	}

	#[tokio::test]
	async fn sid_not_required_without_frontchannel_session_support() {
		let server = MockServer::start().await;
		mock_idp(&server, false).await;

		let url: Url = format!("{}/.well-known/openid-configuration", server.uri())
			.parse()
			.unwrap();
		let provider = Provider::discover(reqwest::Client::new(), &url).await.unwrap();
		assert!(!provider.sid_claim_required());
	}

	#[tokio::test]
	async fn refresh_jwks_swaps_the_cache() {
		let server = MockServer::start().await;
		mock_idp(&server, false).await;

		let url: Url = format!("{}/.well-known/openid-configuration", server.uri())
			.parse()
			.unwrap();
		let provider = Provider::discover(reqwest::Client::new(), &url).await.unwrap();

		server.reset().await;
		let mut rotated = jwks_body();
		rotated["keys"][0]["kid"] = serde_json::json!("k2");
		Mock::given(method("GET"))
			.and(path("/jwks"))
			.respond_with(ResponseTemplate::new(200).set_body_json(rotated))
			.mount(&server)
			.await;

		provider.refresh_jwks().await.unwrap();
		assert!(provider.jwks().find("k2").is_some());
	}

	#[tokio::test]
	async fn discovery_rejects_incomplete_documents() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/.well-known/openid-configuration"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"issuer": server.uri(),
				"authorization_endpoint": "",
				"token_endpoint": format!("{}/token", server.uri()),
				"jwks_uri": format!("{}/jwks", server.uri()),
			})))
			.mount(&server)
			.await;

		let url: Url = format!("{}/.well-known/openid-configuration", server.uri())
			.parse()
			.unwrap();
		let err = Provider::discover(reqwest::Client::new(), &url).await.unwrap_err();
		assert!(matches!(err, OidcError::Discovery(_)));
	}
}
