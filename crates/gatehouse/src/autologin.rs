use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use http::Method;

/// Paths that never trigger auto-login, regardless of configuration.
const DEFAULT_IGNORE_PATTERNS: &[&str] = &["/favicon.ico", "/robots.txt"];

/// Decides whether an unauthenticated request should be redirected to login.
/// Ignore patterns are globs where `*` stays within a path segment and `**`
/// crosses segments.
pub struct AutoLogin {
	enabled: bool,
	ignored: GlobSet,
}

impl AutoLogin {
	pub fn new(enabled: bool, ignore_patterns: &[String]) -> anyhow::Result<Self> {
		let mut seen = Vec::new();
		let mut builder = GlobSetBuilder::new();
		for pattern in DEFAULT_IGNORE_PATTERNS
			.iter()
			.map(|p| p.to_string())
			.chain(ignore_patterns.iter().cloned())
		{
			if pattern.is_empty() {
				continue;
			}
			let pattern = if pattern != "/" {
				pattern.trim_end_matches('/').to_string()
			} else {
				pattern
			};
			if seen.contains(&pattern) {
				continue;
			}
			let glob = GlobBuilder::new(&pattern)
				.literal_separator(true)
				.build()
				.map_err(|e| anyhow::anyhow!("invalid auto-login ignore pattern {pattern:?}: {e}"))?;
			builder.add(glob);
			seen.push(pattern);
		}
		Ok(Self {
			enabled,
			ignored: builder.build()?,
		})
	}

	pub fn needs_login(&self, method: &Method, path: &str, is_authenticated: bool) -> bool {
		if is_authenticated || !self.enabled || method != Method::GET {
			return false;
		}
		!self.is_ignored(path)
	}

	fn is_ignored(&self, path: &str) -> bool {
		let path = if path.starts_with('/') {
			path.to_string()
		} else {
			format!("/{path}")
		};
		if self.ignored.is_match(&path) {
			return true;
		}
		// A trailing slash also matches its slash-less form.
		if path != "/" && path.ends_with('/') {
			return self.ignored.is_match(path.trim_end_matches('/'));
		}
		false
	}
}
