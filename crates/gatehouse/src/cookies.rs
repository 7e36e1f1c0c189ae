use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cookie::{Cookie, SameSite};
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};
use std::time::Duration;

use crate::crypto::{Crypter, CryptoError};

/// Holds the encrypted local session ID. Session-scoped: the server-side
/// store carries the authoritative TTL.
pub const SESSION: &str = "gatehouse.session";
/// Transient login state, set before redirecting to the identity provider.
pub const LOGIN: &str = "gatehouse.login";
/// Copy of [`LOGIN`] without `SameSite=None`, for user agents that mishandle it.
pub const LOGIN_LEGACY: &str = "gatehouse.login.legacy";

pub fn session_fallback_external_id() -> String {
	format!("{SESSION}.1")
}

pub fn session_fallback_id_token() -> String {
	format!("{SESSION}.2")
}

pub fn session_fallback_access_token() -> String {
	format!("{SESSION}.3")
}

#[derive(Debug, thiserror::Error)]
pub enum CookieError {
	#[error("no cookie named {0:?}")]
	NotFound(String),
	#[error("invalid cookie encoding: {0}")]
	Encoding(String),
	#[error(transparent)]
	Crypto(#[from] CryptoError),
}

/// Attributes applied to every cookie we set. `Secure`, `HttpOnly` and
/// `Path=/` are unconditional. A `same_site` of `None` omits the attribute,
/// leaving the user agent's default in effect.
#[derive(Debug, Clone)]
pub struct CookieOptions {
	pub path: String,
	pub same_site: Option<SameSite>,
	pub max_age: Option<Duration>,
}

impl Default for CookieOptions {
	fn default() -> Self {
		Self {
			path: "/".to_string(),
			same_site: Some(SameSite::Lax),
			max_age: None,
		}
	}
}

impl CookieOptions {
	pub fn with_same_site(mut self, same_site: Option<SameSite>) -> Self {
		self.same_site = same_site;
		self
	}

	pub fn with_max_age(mut self, max_age: Duration) -> Self {
		self.max_age = Some(max_age);
		self
	}
}

fn build(name: &str, value: String, opts: &CookieOptions) -> Cookie<'static> {
	let mut builder = Cookie::build((name.to_string(), value))
		.path(opts.path.clone())
		.secure(true)
		.http_only(true);
	if let Some(same_site) = opts.same_site {
		builder = builder.same_site(same_site);
	}
	if let Some(max_age) = opts.max_age {
		builder = builder.max_age(cookie::time::Duration::seconds(max_age.as_secs() as i64));
	}
	builder.build()
}

fn append(headers: &mut HeaderMap, cookie: Cookie<'static>) {
	if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
		headers.append(SET_COOKIE, value);
	}
}

pub fn set(headers: &mut HeaderMap, name: &str, value: String, opts: &CookieOptions) {
	append(headers, build(name, value, opts));
}

/// Expires the named cookie in the user agent.
pub fn clear(headers: &mut HeaderMap, name: &str, opts: &CookieOptions) {
	let mut builder = Cookie::build((name.to_string(), ""))
		.path(opts.path.clone())
		.secure(true)
		.http_only(true)
		.max_age(cookie::time::Duration::ZERO);
	if let Some(same_site) = opts.same_site {
		builder = builder.same_site(same_site);
	}
	append(headers, builder.build());
}

/// Reads a cookie value from the request headers.
pub fn get(headers: &HeaderMap, name: &str) -> Option<String> {
	for header in headers.get_all(COOKIE) {
		let Ok(raw) = header.to_str() else {
			continue;
		};
		for cookie in Cookie::split_parse(raw).flatten() {
			if cookie.name() == name {
				return Some(cookie.value().to_string());
			}
		}
	}
	None
}

pub fn set_encrypted(
	headers: &mut HeaderMap,
	name: &str,
	value: &str,
	opts: &CookieOptions,
	crypter: &Crypter,
) -> Result<(), CookieError> {
	let sealed = crypter.encrypt(value.as_bytes())?;
	set(headers, name, STANDARD.encode(sealed), opts);
	Ok(())
}

pub fn get_encrypted(
	headers: &HeaderMap,
	name: &str,
	crypter: &Crypter,
) -> Result<String, CookieError> {
	let value = get(headers, name).ok_or_else(|| CookieError::NotFound(name.to_string()))?;
	let ciphertext = STANDARD
		.decode(value)
		.map_err(|e| CookieError::Encoding(e.to_string()))?;
	let plaintext = crypter.decrypt(&ciphertext)?;
	String::from_utf8(plaintext).map_err(|e| CookieError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::KEY_LEN;

	fn request_headers_from(set_cookie_headers: &HeaderMap) -> HeaderMap {
		let mut headers = HeaderMap::new();
		let pairs = set_cookie_headers
			.get_all(SET_COOKIE)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.filter_map(|v| v.split(';').next())
			.collect::<Vec<_>>()
			.join("; ");
		headers.insert(COOKIE, HeaderValue::from_str(&pairs).unwrap());
		headers
	}

	#[test]
	fn set_applies_default_attributes() {
		let mut headers = HeaderMap::new();
		set(&mut headers, SESSION, "value".into(), &CookieOptions::default());

		let header = headers.get(SET_COOKIE).unwrap().to_str().unwrap();
		assert!(header.starts_with("gatehouse.session=value"));
		assert!(header.contains("Secure"));
		assert!(header.contains("HttpOnly"));
		assert!(header.contains("SameSite=Lax"));
		assert!(header.contains("Path=/"));
		assert!(!header.contains("Max-Age"));
	}

	#[test]
	fn max_age_is_emitted_when_set() {
		let mut headers = HeaderMap::new();
		let opts = CookieOptions::default().with_max_age(Duration::from_secs(3600));
		set(&mut headers, LOGIN, "value".into(), &opts);

		let header = headers.get(SET_COOKIE).unwrap().to_str().unwrap();
		assert!(header.contains("Max-Age=3600"));
	}

	#[test]
	fn clear_expires_the_cookie() {
		let mut headers = HeaderMap::new();
		clear(&mut headers, SESSION, &CookieOptions::default());

		let header = headers.get(SET_COOKIE).unwrap().to_str().unwrap();
		assert!(header.starts_with("gatehouse.session=;"));
		assert!(header.contains("Max-Age=0"));
	}

	#[test]
	fn get_finds_cookie_among_many() {
		let mut headers = HeaderMap::new();
		headers.insert(
			COOKIE,
			HeaderValue::from_static("a=1; gatehouse.session=abc; b=2"),
		);
		assert_eq!(get(&headers, SESSION).as_deref(), Some("abc"));
		assert_eq!(get(&headers, LOGIN), None);
	}

	#[test]
	fn encrypted_roundtrip() {
		let crypter = Crypter::new(&[7u8; KEY_LEN]).unwrap();
		let mut response = HeaderMap::new();
		set_encrypted(
			&mut response,
			LOGIN,
			r#"{"state":"abc"}"#,
			&CookieOptions::default(),
			&crypter,
		)
		.unwrap();

		let request = request_headers_from(&response);
		let value = get_encrypted(&request, LOGIN, &crypter).unwrap();
		assert_eq!(value, r#"{"state":"abc"}"#);
	}

	#[test]
	fn encrypted_read_with_wrong_key_fails() {
		let crypter = Crypter::new(&[7u8; KEY_LEN]).unwrap();
		let mut response = HeaderMap::new();
		set_encrypted(&mut response, LOGIN, "value", &CookieOptions::default(), &crypter).unwrap();

		let request = request_headers_from(&response);
		let other = Crypter::new(&[8u8; KEY_LEN]).unwrap();
		assert!(matches!(
			get_encrypted(&request, LOGIN, &other),
			Err(CookieError::Crypto(_))
		));
	}
}
