use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::{Map, Value};
use std::fmt;

pub const ACCEPTABLE_CLOCK_SKEW_SECONDS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidTokenKind {
	Signature,
	Audience,
	Issuer,
	Nonce,
	MissingClaim,
	Expired,
	Malformed,
}

impl fmt::Display for InvalidTokenKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			InvalidTokenKind::Signature => "signature",
			InvalidTokenKind::Audience => "audience",
			InvalidTokenKind::Issuer => "issuer",
			InvalidTokenKind::Nonce => "nonce",
			InvalidTokenKind::MissingClaim => "missing_claim",
			InvalidTokenKind::Expired => "expired",
			InvalidTokenKind::Malformed => "malformed",
		};
		f.write_str(s)
	}
}

#[derive(Debug, thiserror::Error)]
#[error("invalid token ({kind}): {detail}")]
pub struct InvalidToken {
	pub kind: InvalidTokenKind,
	detail: String,
}

impl InvalidToken {
	fn new(kind: InvalidTokenKind, detail: impl Into<String>) -> Self {
		Self {
			kind,
			detail: detail.into(),
		}
	}
}

/// A verified JWS: the raw compact serialisation plus its claim set.
#[derive(Debug, Clone)]
pub struct ParsedToken {
	serialized: String,
	claims: Map<String, Value>,
}

impl ParsedToken {
	pub fn serialized(&self) -> &str {
		&self.serialized
	}

	pub fn claim_str(&self, name: &str) -> Option<&str> {
		self.claims.get(name).and_then(Value::as_str)
	}

	pub fn has_claim(&self, name: &str) -> bool {
		self.claims.contains_key(name)
	}

	/// The token's JWT ID: the standard `jti` claim, falling back to `uti`
	/// (Azure AD's variant).
	pub fn jwt_id(&self) -> Option<&str> {
		self.claim_str("jti").or_else(|| self.claim_str("uti"))
	}

	pub fn expiration(&self) -> Option<DateTime<Utc>> {
		let exp = self.claims.get("exp")?.as_i64()?;
		Utc.timestamp_opt(exp, 0).single()
	}
}

/// Everything the callback needs to check about a freshly minted ID token,
/// beyond its signature.
#[derive(Debug, Clone)]
pub struct IdTokenExpectations {
	pub client_id: String,
	pub issuer: String,
	pub nonce: String,
	/// `sid` must be present iff the provider advertises
	/// `frontchannel_logout_session_supported`.
	pub require_sid: bool,
	/// `acr` must be present iff the client configures non-empty `acr_values`.
	pub require_acr: bool,
}

/// Verifies a compact JWS against the given key set. The algorithm is
/// inferred from the matched key; clock-sensitive claims tolerate ±5 s skew.
pub fn parse(raw: &str, jwks: &JwkSet) -> Result<ParsedToken, InvalidToken> {
	let header = decode_header(raw)
		.map_err(|e| InvalidToken::new(InvalidTokenKind::Malformed, e.to_string()))?;

	let jwk = match header.kid.as_deref() {
		Some(kid) => jwks.find(kid).ok_or_else(|| {
			InvalidToken::new(InvalidTokenKind::Signature, format!("no key with kid {kid:?}"))
		})?,
		// Without a kid we can only verify against an unambiguous key set.
		None if jwks.keys.len() == 1 => &jwks.keys[0],
		None => {
			return Err(InvalidToken::new(
				InvalidTokenKind::Signature,
				"token has no kid and key set is ambiguous",
			));
		},
	};

	let algorithm = algorithm_for(jwk, header.alg)?;
	let key = DecodingKey::from_jwk(jwk)
		.map_err(|e| InvalidToken::new(InvalidTokenKind::Signature, e.to_string()))?;

	let mut validation = Validation::new(algorithm);
	validation.leeway = ACCEPTABLE_CLOCK_SKEW_SECONDS;
	validation.validate_exp = true;
	// Audience and issuer carry their own error kinds and are checked in
	// validate_id_token, where the expected values are known.
	validation.validate_aud = false;
	validation.required_spec_claims.clear();

	let data = decode::<Map<String, Value>>(raw, &key, &validation).map_err(map_jwt_error)?;

	Ok(ParsedToken {
		serialized: raw.to_string(),
		claims: data.claims,
	})
}

/// Validates the claims of an ID token freshly obtained from the code
/// exchange, per the rules in the OIDC core spec plus the provider-dependent
/// `sid`/`acr` requirements.
pub fn validate_id_token(
	token: &ParsedToken,
	expect: &IdTokenExpectations,
) -> Result<(), InvalidToken> {
	if !audience_contains(token, &expect.client_id) {
		return Err(InvalidToken::new(
			InvalidTokenKind::Audience,
			format!("aud does not contain {:?}", expect.client_id),
		));
	}

	match token.claim_str("iss") {
		Some(iss) if iss == expect.issuer => {},
		Some(iss) => {
			return Err(InvalidToken::new(
				InvalidTokenKind::Issuer,
				format!("issuer {iss:?} does not match {:?}", expect.issuer),
			));
		},
		None => {
			return Err(InvalidToken::new(InvalidTokenKind::MissingClaim, "no iss claim"));
		},
	}

	match token.claim_str("nonce") {
		Some(nonce) if nonce == expect.nonce => {},
		Some(_) => {
			return Err(InvalidToken::new(InvalidTokenKind::Nonce, "nonce mismatch"));
		},
		None => {
			return Err(InvalidToken::new(InvalidTokenKind::MissingClaim, "no nonce claim"));
		},
	}

	if expect.require_sid && !token.has_claim("sid") {
		return Err(InvalidToken::new(InvalidTokenKind::MissingClaim, "no sid claim"));
	}

	if expect.require_acr && !token.has_claim("acr") {
		return Err(InvalidToken::new(InvalidTokenKind::MissingClaim, "no acr claim"));
	}

	Ok(())
}

fn audience_contains(token: &ParsedToken, client_id: &str) -> bool {
	match token.claims.get("aud") {
		Some(Value::String(aud)) => aud == client_id,
		Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(client_id)),
		_ => false,
	}
}

fn algorithm_for(jwk: &Jwk, header_alg: Algorithm) -> Result<Algorithm, InvalidToken> {
	if let Some(key_alg) = jwk.common.key_algorithm {
		let inferred = match key_alg {
			KeyAlgorithm::HS256 => Algorithm::HS256,
			KeyAlgorithm::HS384 => Algorithm::HS384,
			KeyAlgorithm::HS512 => Algorithm::HS512,
			KeyAlgorithm::RS256 => Algorithm::RS256,
			KeyAlgorithm::RS384 => Algorithm::RS384,
			KeyAlgorithm::RS512 => Algorithm::RS512,
			KeyAlgorithm::PS256 => Algorithm::PS256,
			KeyAlgorithm::PS384 => Algorithm::PS384,
			KeyAlgorithm::PS512 => Algorithm::PS512,
			KeyAlgorithm::ES256 => Algorithm::ES256,
			KeyAlgorithm::ES384 => Algorithm::ES384,
			KeyAlgorithm::EdDSA => Algorithm::EdDSA,
			other => {
				return Err(InvalidToken::new(
					InvalidTokenKind::Signature,
					format!("unsupported key algorithm {other:?}"),
				));
			},
		};
		return Ok(inferred);
	}

	// No alg on the key: fall back to the key type's conventional default,
	// cross-checked against the header.
	let fallback = match &jwk.algorithm {
		AlgorithmParameters::RSA(_) => Algorithm::RS256,
		AlgorithmParameters::EllipticCurve(_) => Algorithm::ES256,
		AlgorithmParameters::OctetKey(_) => Algorithm::HS256,
		_ => {
			return Err(InvalidToken::new(
				InvalidTokenKind::Signature,
				"unsupported key type",
			));
		},
	};
	if matches!(
		(fallback, header_alg),
		(Algorithm::RS256, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512)
			| (Algorithm::ES256, Algorithm::ES256 | Algorithm::ES384)
			| (Algorithm::HS256, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
	) {
		Ok(header_alg)
	} else {
		Ok(fallback)
	}
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> InvalidToken {
	use jsonwebtoken::errors::ErrorKind;
	let detail = err.to_string();
	let kind = match err.kind() {
		ErrorKind::InvalidSignature => InvalidTokenKind::Signature,
		ErrorKind::ExpiredSignature => InvalidTokenKind::Expired,
		ErrorKind::ImmatureSignature => InvalidTokenKind::Expired,
		ErrorKind::InvalidAudience => InvalidTokenKind::Audience,
		ErrorKind::InvalidIssuer => InvalidTokenKind::Issuer,
		ErrorKind::MissingRequiredClaim(_) => InvalidTokenKind::MissingClaim,
		_ => InvalidTokenKind::Malformed,
	};
	InvalidToken::new(kind, detail)
}
