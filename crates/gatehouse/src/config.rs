use secrecy::SecretString;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

/// Runtime configuration, deserialized from YAML with env-style defaults.
/// Secrets are wrapped in [`SecretString`] and never logged.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default = "default_bind_address")]
	pub bind_address: SocketAddr,
	#[serde(default = "default_metrics_bind_address")]
	pub metrics_bind_address: SocketAddr,
	/// Upstream to forward authenticated traffic to, e.g. `http://127.0.0.1:8080`.
	pub upstream: Url,
	/// External URL this sidecar is reachable at, including any context path.
	pub ingress: Url,
	/// Standard-base64 32-byte AEAD key. Generated at startup when absent.
	#[serde(default)]
	pub encryption_key: Option<SecretString>,
	#[serde(default)]
	pub error_redirect_uri: Option<String>,
	#[serde(default = "default_log_level")]
	pub log_level: String,
	#[serde(default)]
	pub log_format: LogFormat,
	#[serde(default)]
	pub auto_login: bool,
	#[serde(default)]
	pub auto_login_ignore_paths: Vec<String>,
	#[serde(default)]
	pub session: SessionConfig,
	pub openid: OpenIdConfig,
	#[serde(default)]
	pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
	#[default]
	Plain,
	Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
	/// Absolute session lifetime; the store TTL derives from this.
	#[serde(default = "default_session_lifetime_seconds")]
	pub max_lifetime_seconds: u64,
	/// Idle timeout. Zero or absent disables inactivity tracking.
	#[serde(default)]
	pub inactivity_timeout_seconds: u64,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			max_lifetime_seconds: default_session_lifetime_seconds(),
			inactivity_timeout_seconds: 0,
		}
	}
}

impl SessionConfig {
	pub fn max_lifetime(&self) -> Duration {
		Duration::from_secs(self.max_lifetime_seconds)
	}

	pub fn inactivity_timeout(&self) -> Option<Duration> {
		match self.inactivity_timeout_seconds {
			0 => None,
			secs => Some(Duration::from_secs(secs)),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenIdConfig {
	/// Short provider name used in session keys and log fields.
	#[serde(default = "default_provider_name")]
	pub provider: String,
	/// The provider's well-known discovery document URL.
	pub well_known_url: Url,
	pub client_id: String,
	pub client_auth: ClientAuth,
	#[serde(default = "default_scopes")]
	pub scopes: Vec<String>,
	#[serde(default)]
	pub acr_values: Option<String>,
	#[serde(default)]
	pub ui_locales: Option<String>,
	#[serde(default)]
	pub post_logout_redirect_uri: Option<String>,
}

/// Token-endpoint client authentication. `private_key_jwt` is the primary
/// method; `client_secret_jwt` is accepted for providers without registered
/// client keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case", deny_unknown_fields)]
pub enum ClientAuth {
	PrivateKeyJwt {
		/// PEM-encoded RSA private key for signing client assertions.
		private_key_pem: SecretString,
		#[serde(default)]
		key_id: Option<String>,
	},
	ClientSecretJwt {
		client_secret: SecretString,
	},
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
	/// Connection URI, e.g. `redis://:password@sessions:6379/0`.
	pub uri: SecretString,
}

impl Config {
	pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
		let config: Config = serde_yaml::from_str(contents)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		if self.ingress.host_str().is_none() {
			anyhow::bail!("ingress must be an absolute URL with a host");
		}
		if self.upstream.host_str().is_none() {
			anyhow::bail!("upstream must be an absolute URL with a host");
		}
		if !self.openid.scopes.iter().any(|s| s == "openid") {
			anyhow::bail!("openid.scopes must include the \"openid\" scope");
		}
		if self.openid.client_id.is_empty() {
			anyhow::bail!("openid.client_id must not be empty");
		}
		Ok(())
	}

	/// The context path the app is served under, without a trailing slash.
	/// Empty when the ingress is at the domain root.
	pub fn ingress_path(&self) -> String {
		let path = self.ingress.path().trim_end_matches('/');
		path.to_string()
	}

	/// The context path as a redirect target: the ingress path, or `/`.
	pub fn ingress_context_redirect(&self) -> String {
		let path = self.ingress_path();
		if path.is_empty() { "/".to_string() } else { path }
	}

	fn ingress_join(&self, suffix: &str) -> String {
		format!(
			"{}://{}{}{suffix}",
			self.ingress.scheme(),
			self.ingress.authority(),
			self.ingress_path(),
		)
	}

	/// Absolute redirect URI registered with the provider.
	pub fn login_callback_url(&self) -> String {
		self.ingress_join("/oauth2/callback")
	}

	pub fn logout_callback_url(&self) -> String {
		self.ingress_join("/oauth2/logout/callback")
	}
}

fn default_bind_address() -> SocketAddr {
	"0.0.0.0:3000".parse().expect("valid default bind address")
}

fn default_metrics_bind_address() -> SocketAddr {
	"0.0.0.0:3002".parse().expect("valid default bind address")
}

fn default_log_level() -> String {
	"info".to_string()
}

fn default_session_lifetime_seconds() -> u64 {
	// 10 hours
	36_000
}

fn default_provider_name() -> String {
	"openid".to_string()
}

fn default_scopes() -> Vec<String> {
	vec!["openid".to_string()]
}

#[cfg(test)]
mod tests {
	use super::*;

	const MINIMAL: &str = r#"
upstream: "http://127.0.0.1:8080"
ingress: "https://app.example.com"
openid:
  well_known_url: "https://idp.example.com/.well-known/openid-configuration"
  client_id: "my-client"
  client_auth:
    method: client_secret_jwt
    client_secret: "hush"
"#;

	#[test]
	fn minimal_config_parses_with_defaults() {
		let config = Config::from_yaml(MINIMAL).unwrap();
		assert_eq!(config.bind_address.port(), 3000);
		assert_eq!(config.session.max_lifetime(), Duration::from_secs(36_000));
		assert_eq!(config.session.inactivity_timeout(), None);
		assert_eq!(config.openid.scopes, vec!["openid"]);
		assert_eq!(config.ingress_path(), "");
		assert_eq!(config.ingress_context_redirect(), "/");
		assert_eq!(
			config.login_callback_url(),
			"https://app.example.com/oauth2/callback"
		);
	}

	#[test]
	fn ingress_context_path_is_honoured() {
		let yaml = MINIMAL.replace(
			"https://app.example.com",
			"https://app.example.com/team/app",
		);
		let config = Config::from_yaml(&yaml).unwrap();
		assert_eq!(config.ingress_path(), "/team/app");
		assert_eq!(config.ingress_context_redirect(), "/team/app");
		assert_eq!(
			config.login_callback_url(),
			"https://app.example.com/team/app/oauth2/callback"
		);
		assert_eq!(
			config.logout_callback_url(),
			"https://app.example.com/team/app/oauth2/logout/callback"
		);
	}

	#[test]
	fn scopes_must_include_openid() {
		let yaml = format!("{MINIMAL}  scopes: [\"profile\"]\n");
		assert!(Config::from_yaml(&yaml).is_err());
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let yaml = format!("{MINIMAL}\nnot_a_field: true\n");
		assert!(Config::from_yaml(&yaml).is_err());
	}
}
