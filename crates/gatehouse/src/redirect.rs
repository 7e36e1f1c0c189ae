use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::header::REFERER;
use http::{HeaderMap, Uri};
use percent_encoding::percent_decode_str;
use url::Url;

pub const REDIRECT_PARAMETER: &str = "redirect";
pub const REDIRECT_ENCODED_PARAMETER: &str = "redirect-encoded";

/// Chooses the post-auth redirect target for a request, by priority:
/// `redirect-encoded` (base64url) over `redirect` over the `Referer` header
/// over the ingress context path. The result is always same-origin: scheme
/// and host are stripped, and anything unparsable falls back to the ingress
/// path.
pub fn canonical_redirect(uri: &Uri, headers: &HeaderMap, ingress_path: &str) -> String {
	let fallback = if ingress_path.is_empty() { "/" } else { ingress_path };

	let mut redirect = fallback.to_string();

	if let Some(referer) = headers.get(REFERER).and_then(|v| v.to_str().ok())
		&& !referer.is_empty()
	{
		redirect = referer.to_string();
	}

	if let Some(param) = query_param(uri, REDIRECT_PARAMETER)
		&& !param.is_empty()
	{
		redirect = param;
	}

	if let Some(encoded) = query_param(uri, REDIRECT_ENCODED_PARAMETER)
		&& let Ok(decoded) = URL_SAFE_NO_PAD.decode(encoded.as_bytes())
		&& let Ok(decoded) = String::from_utf8(decoded)
	{
		redirect = decoded;
	}

	same_origin(&redirect, fallback)
}

/// Builds the login URL that returns to `target` after authentication.
pub fn login_url(ingress_path: &str, target: &str) -> String {
	format!(
		"{ingress_path}/oauth2/login?{REDIRECT_ENCODED_PARAMETER}={}",
		URL_SAFE_NO_PAD.encode(target.as_bytes())
	)
}

/// Strips scheme and host to prevent open redirects, defaulting back to the
/// fallback when the target is empty or malformed.
pub fn same_origin(redirect: &str, fallback: &str) -> String {
	let Ok(unescaped) = percent_decode_str(redirect).decode_utf8() else {
		return fallback.to_string();
	};
	let unescaped = unescaped.into_owned();

	let same_origin = match Url::parse(&unescaped) {
		Ok(url) => path_and_query(&url),
		Err(url::ParseError::RelativeUrlWithoutBase) => {
			if let Some(rest) = unescaped.strip_prefix("//") {
				// Protocol-relative: still points at a foreign origin.
				match Url::parse(&format!("http://{rest}")) {
					Ok(url) => path_and_query(&url),
					Err(_) => return fallback.to_string(),
				}
			} else {
				unescaped
			}
		},
		Err(_) => return fallback.to_string(),
	};

	if same_origin.is_empty() {
		fallback.to_string()
	} else {
		same_origin
	}
}

fn path_and_query(url: &Url) -> String {
	let mut out = url.path().to_string();
	if let Some(query) = url.query() {
		out.push('?');
		out.push_str(query);
	}
	out
}

pub fn query_param(uri: &Uri, name: &str) -> Option<String> {
	let query = uri.query()?;
	url::form_urlencoded::parse(query.as_bytes())
		.find_map(|(k, v)| (k == name).then(|| v.into_owned()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::HeaderValue;

	fn uri(s: &str) -> Uri {
		s.parse().unwrap()
	}

	#[test]
	fn defaults_to_root_without_any_hint() {
		let target = canonical_redirect(&uri("/oauth2/login"), &HeaderMap::new(), "");
		assert_eq!(target, "/");
	}

	#[test]
	fn defaults_to_ingress_context_path() {
		let target = canonical_redirect(&uri("/oauth2/login"), &HeaderMap::new(), "/team/app");
		assert_eq!(target, "/team/app");
	}

	#[test]
	fn referer_header_is_used() {
		let mut headers = HeaderMap::new();
		headers.insert(REFERER, HeaderValue::from_static("/came/from?q=1"));
		let target = canonical_redirect(&uri("/oauth2/login"), &headers, "");
		assert_eq!(target, "/came/from?q=1");
	}

	#[test]
	fn referer_host_is_stripped() {
		let mut headers = HeaderMap::new();
		headers.insert(
			REFERER,
			HeaderValue::from_static("https://app.example.com/came/from"),
		);
		let target = canonical_redirect(&uri("/oauth2/login"), &headers, "");
		assert_eq!(target, "/came/from");
	}

	#[test]
	fn redirect_parameter_beats_referer() {
		let mut headers = HeaderMap::new();
		headers.insert(REFERER, HeaderValue::from_static("/referred"));
		let target = canonical_redirect(&uri("/oauth2/login?redirect=/wanted"), &headers, "");
		assert_eq!(target, "/wanted");
	}

	#[test]
	fn redirect_encoded_beats_plain_redirect() {
		let encoded = URL_SAFE_NO_PAD.encode("/encoded-target");
		let target = canonical_redirect(
			&uri(&format!("/oauth2/login?redirect=/plain&redirect-encoded={encoded}")),
			&HeaderMap::new(),
			"",
		);
		assert_eq!(target, "/encoded-target");
	}

	#[test]
	fn absolute_redirect_is_reduced_to_path() {
		let target = canonical_redirect(
			&uri("/oauth2/login?redirect=https://evil.example/x"),
			&HeaderMap::new(),
			"",
		);
		assert_eq!(target, "/x");
	}

	#[test]
	fn protocol_relative_redirect_is_reduced_to_path() {
		let target = canonical_redirect(
			&uri("/oauth2/login?redirect=//evil.example/x"),
			&HeaderMap::new(),
			"",
		);
		assert_eq!(target, "/x");
	}

	#[test]
	fn output_never_contains_an_origin() {
		for raw in [
			"https://evil.example",
			"https://evil.example/",
			"http://evil.example/deep/path?q=1",
			"//evil.example/x",
			"/fine/path",
			"%2Ffine%2Fencoded",
		] {
			let target = canonical_redirect(
				&uri(&format!("/oauth2/login?redirect={raw}")),
				&HeaderMap::new(),
				"",
			);
			assert!(target.starts_with('/'), "{raw} produced {target}");
			assert!(!target.contains("://"), "{raw} produced {target}");
			assert!(!target.contains("evil.example"), "{raw} produced {target}");
		}
	}

	#[test]
	fn empty_path_becomes_root() {
		let target = canonical_redirect(
			&uri("/oauth2/login?redirect=https://app.example.com"),
			&HeaderMap::new(),
			"",
		);
		assert_eq!(target, "/");
	}

	#[test]
	fn login_url_roundtrips_the_target() {
		let login = login_url("", "/deep/link?q=1");
		let parsed = uri(&login);
		assert_eq!(parsed.path(), "/oauth2/login");
		let target = canonical_redirect(&parsed, &HeaderMap::new(), "");
		assert_eq!(target, "/deep/link?q=1");
	}

	#[test]
	fn login_url_respects_ingress_prefix() {
		let login = login_url("/team/app", "/team/app/page");
		assert!(login.starts_with("/team/app/oauth2/login?redirect-encoded="));
	}
}
