pub mod manager;
pub mod store;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::crypto::{Crypter, CryptoError};

/// Minimum interval between two successive refreshes of the same session.
const REFRESH_MIN_INTERVAL_SECONDS: i64 = 60;
/// How long before token expiry a refresh becomes due.
const REFRESH_LEEWAY_SECONDS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
	#[error(transparent)]
	Crypto(#[from] CryptoError),
	#[error("encoding session blob: {0}")]
	Encoding(String),
}

/// The decrypted contents of a stored session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Data {
	pub external_session_id: String,
	pub access_token: String,
	pub id_token: String,
	pub refresh_token: String,
	pub id_token_jwt_id: String,
	pub metadata: Metadata,
}

impl Data {
	pub fn has_access_token(&self) -> bool {
		!self.access_token.is_empty()
	}

	pub fn has_refresh_token(&self) -> bool {
		!self.refresh_token.is_empty()
	}

	pub fn encrypt(&self, crypter: &Crypter) -> Result<EncryptedData, SealError> {
		let plaintext = serde_json::to_vec(self).map_err(|e| SealError::Encoding(e.to_string()))?;
		let ciphertext = crypter.encrypt(&plaintext)?;
		Ok(EncryptedData {
			data: STANDARD.encode(ciphertext),
		})
	}
}

/// An AEAD-sealed session blob as written to the store: standard-base64
/// ciphertext wrapped in a one-field JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedData {
	pub data: String,
}

impl EncryptedData {
	pub fn decrypt(&self, crypter: &Crypter) -> Result<Data, SealError> {
		let ciphertext = STANDARD
			.decode(&self.data)
			.map_err(|e| SealError::Encoding(e.to_string()))?;
		let plaintext = crypter.decrypt(&ciphertext)?;
		serde_json::from_slice(&plaintext).map_err(|e| SealError::Encoding(e.to_string()))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
	pub session: MetadataSession,
	pub tokens: MetadataTokens,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataSession {
	pub created_at: DateTime<Utc>,
	/// Absolute deadline; the session is invalid after this regardless of
	/// activity.
	pub ends_at: DateTime<Utc>,
	/// Idle deadline, extended on every authenticated request. `None`
	/// disables inactivity tracking.
	pub timeout_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataTokens {
	pub expire_at: DateTime<Utc>,
	pub refreshed_at: DateTime<Utc>,
}

impl Metadata {
	pub fn new(expires_in: Duration, ends_in: Duration) -> Self {
		let now = Utc::now();
		Self {
			session: MetadataSession {
				created_at: now,
				ends_at: now + to_delta(ends_in),
				timeout_at: None,
			},
			tokens: MetadataTokens {
				expire_at: now + to_delta(expires_in),
				refreshed_at: now,
			},
		}
	}

	pub fn is_expired(&self) -> bool {
		Utc::now() > self.tokens.expire_at
	}

	/// Whether the absolute session lifetime has passed.
	pub fn is_ended(&self) -> bool {
		Utc::now() >= self.session.ends_at
	}

	pub fn is_timed_out(&self) -> bool {
		match self.session.timeout_at {
			Some(timeout_at) => Utc::now() > timeout_at,
			None => false,
		}
	}

	pub fn token_lifetime(&self) -> TimeDelta {
		self.tokens.expire_at - self.tokens.refreshed_at
	}

	/// The earliest moment a new refresh is allowed. Tokens whose lifetime is
	/// at most twice the minimum interval may refresh at their half-life.
	pub fn refresh_cooldown(&self) -> DateTime<Utc> {
		let lifetime = self.token_lifetime();
		let min_interval = TimeDelta::seconds(REFRESH_MIN_INTERVAL_SECONDS);
		if lifetime <= min_interval * 2 {
			self.tokens.refreshed_at + lifetime / 2
		} else {
			self.tokens.refreshed_at + min_interval
		}
	}

	pub fn is_refresh_on_cooldown(&self) -> bool {
		Utc::now() < self.refresh_cooldown()
	}

	/// When the next automatic refresh happens: leeway before expiry, or as
	/// soon as the cooldown allows when that point is already behind us.
	pub fn next_refresh(&self) -> DateTime<Utc> {
		let next = self.tokens.expire_at - TimeDelta::seconds(REFRESH_LEEWAY_SECONDS);
		if next < Utc::now() {
			return self.refresh_cooldown();
		}
		next
	}

	pub fn should_refresh(&self) -> bool {
		if self.is_refresh_on_cooldown() {
			return false;
		}
		Utc::now() >= self.next_refresh()
	}

	/// Records a successful refresh: `refreshed_at` advances to now and the
	/// token expiry restarts from the response's `expires_in`.
	pub fn refresh(&mut self, next_expiry_seconds: u64) {
		let now = Utc::now();
		self.tokens.refreshed_at = now;
		self.tokens.expire_at = now + TimeDelta::seconds(next_expiry_seconds as i64);
	}

	pub fn extend_timeout(&mut self, timeout: Duration) {
		self.session.timeout_at = Some(Utc::now() + to_delta(timeout));
	}

	/// Remaining absolute lifetime; the store TTL at write time.
	pub fn store_ttl(&self) -> Duration {
		(self.session.ends_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
	}

	pub fn compact(&self) -> MetadataCompact {
		MetadataCompact {
			ends_at: self.session.ends_at,
			timeout_at: self.session.timeout_at,
			expire_at: self.tokens.expire_at,
		}
	}

	pub fn verbose(&self) -> MetadataVerbose {
		let now = Utc::now();
		MetadataVerbose {
			session: MetadataSessionVerbose {
				inner: self.session.clone(),
				ends_in_seconds: to_seconds(self.session.ends_at - now),
				active: !self.is_timed_out(),
				timeout_in_seconds: match self.session.timeout_at {
					Some(timeout_at) => to_seconds(timeout_at - now),
					None => -1,
				},
			},
			tokens: MetadataTokensVerbose {
				inner: self.tokens.clone(),
				expire_in_seconds: to_seconds(self.tokens.expire_at - now),
			},
		}
	}

	pub fn verbose_with_refresh(&self) -> MetadataVerboseWithRefresh {
		let now = Utc::now();
		let verbose = self.verbose();
		MetadataVerboseWithRefresh {
			session: verbose.session,
			tokens: MetadataTokensVerboseWithRefresh {
				inner: verbose.tokens,
				next_auto_refresh_in_seconds: to_seconds(self.next_refresh() - now),
				refresh_cooldown: self.is_refresh_on_cooldown(),
				refresh_cooldown_seconds: to_seconds(self.refresh_cooldown() - now),
			},
		}
	}
}

/// The compact session document: just the three deadlines.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataCompact {
	pub ends_at: DateTime<Utc>,
	pub timeout_at: Option<DateTime<Utc>>,
	pub expire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataVerbose {
	pub session: MetadataSessionVerbose,
	pub tokens: MetadataTokensVerbose,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataVerboseWithRefresh {
	pub session: MetadataSessionVerbose,
	pub tokens: MetadataTokensVerboseWithRefresh,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataSessionVerbose {
	#[serde(flatten)]
	pub inner: MetadataSession,
	pub ends_in_seconds: i64,
	pub active: bool,
	/// -1 when inactivity tracking is disabled.
	pub timeout_in_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataTokensVerbose {
	#[serde(flatten)]
	pub inner: MetadataTokens,
	pub expire_in_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataTokensVerboseWithRefresh {
	#[serde(flatten)]
	pub inner: MetadataTokensVerbose,
	pub next_auto_refresh_in_seconds: i64,
	pub refresh_cooldown: bool,
	pub refresh_cooldown_seconds: i64,
}

fn to_delta(duration: Duration) -> TimeDelta {
	TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn to_seconds(delta: TimeDelta) -> i64 {
	delta.num_seconds().max(0)
}
