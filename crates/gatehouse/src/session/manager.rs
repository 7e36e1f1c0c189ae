use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::{SessionStore, StoreError};
use super::{Data, Metadata, SealError};
use crate::config::Config;
use crate::crypto::Crypter;
use crate::metrics;
use crate::oidc::client::RelyingParty;
use crate::oidc::{OidcError, TokenResponse};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
	#[error("session not found")]
	NotFound,
	#[error("session has reached its absolute lifetime")]
	Expired,
	#[error("session is inactive")]
	Inactive,
	#[error("invalid session cookie: {0}")]
	InvalidCookie(String),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Seal(#[from] SealError),
	#[error("refreshing tokens: {0}")]
	Refresh(#[source] OidcError),
}

/// An in-memory handle to a stored session: the store key plus the decrypted
/// blob.
#[derive(Debug, Clone)]
pub struct Session {
	pub id: String,
	pub data: Data,
}

/// Owns session CRUD and the refresh discipline: at most one in-flight
/// refresh per session within this process, via a per-session lease.
pub struct SessionManager {
	store: Arc<dyn SessionStore>,
	crypter: Arc<Crypter>,
	relying_party: Arc<RelyingParty>,
	provider_name: String,
	client_id: String,
	session_lifetime: Duration,
	inactivity_timeout: Option<Duration>,
	refresh_leases: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
	pub fn new(
		config: &Config,
		store: Arc<dyn SessionStore>,
		crypter: Arc<Crypter>,
		relying_party: Arc<RelyingParty>,
	) -> Self {
		Self {
			store,
			crypter,
			relying_party,
			provider_name: config.openid.provider.clone(),
			client_id: config.openid.client_id.clone(),
			session_lifetime: config.session.max_lifetime(),
			inactivity_timeout: config.session.inactivity_timeout(),
			refresh_leases: DashMap::new(),
		}
	}

	pub fn inactivity_timeout(&self) -> Option<Duration> {
		self.inactivity_timeout
	}

	/// The store key for an external session identifier. Front-channel
	/// logout re-derives keys with the same formula from the `sid` parameter.
	pub fn session_key(&self, external_session_id: &str) -> String {
		format!("{}:{}:{external_session_id}", self.provider_name, self.client_id)
	}

	/// Fallback external identifier when the provider supplies neither `sid`
	/// nor `session_state`. Random, so front-channel logout cannot address
	/// such sessions; a known limitation.
	pub fn generate_external_session_id(&self) -> String {
		Uuid::new_v4().to_string()
	}

	/// Builds a new session from a token response. The caller persists it
	/// with [`persist`](Self::persist) and decides on cookie fallback when
	/// the store is unavailable.
	pub fn create(
		&self,
		external_session_id: String,
		tokens: &TokenResponse,
		id_token_jwt_id: String,
	) -> Session {
		let mut metadata = Metadata::new(
			Duration::from_secs(tokens.expires_in),
			self.session_lifetime,
		);
		if let Some(timeout) = self.inactivity_timeout {
			metadata.extend_timeout(timeout);
		}
		let id = self.session_key(&external_session_id);
		Session {
			id,
			data: Data {
				external_session_id,
				access_token: tokens.access_token.clone(),
				id_token: tokens.id_token.clone().unwrap_or_default(),
				refresh_token: tokens.refresh_token.clone().unwrap_or_default(),
				id_token_jwt_id,
				metadata,
			},
		}
	}

	/// Writes the encrypted blob with TTL equal to the remaining absolute
	/// lifetime.
	pub async fn persist(&self, session: &Session) -> Result<(), SessionError> {
		let blob = session.data.encrypt(&self.crypter)?;
		self
			.store
			.write(&session.id, &blob, session.data.metadata.store_ttl())
			.await?;
		Ok(())
	}

	/// The session cookie value: the AEAD-sealed store key, standard-base64.
	pub fn cookie_value(&self, session: &Session) -> Result<String, SessionError> {
		let sealed = self
			.crypter
			.encrypt(session.id.as_bytes())
			.map_err(SealError::Crypto)?;
		Ok(STANDARD.encode(sealed))
	}

	fn session_id_from_cookie(&self, cookie_value: &str) -> Result<String, SessionError> {
		let ciphertext = STANDARD
			.decode(cookie_value)
			.map_err(|e| SessionError::InvalidCookie(e.to_string()))?;
		let plaintext = self
			.crypter
			.decrypt(&ciphertext)
			.map_err(|e| SessionError::InvalidCookie(e.to_string()))?;
		String::from_utf8(plaintext).map_err(|e| SessionError::InvalidCookie(e.to_string()))
	}

	/// Resolves a session cookie to a live session. Sessions past their
	/// absolute lifetime are deleted out-of-band and reported as expired;
	/// idle sessions are reported inactive but left in the store.
	pub async fn get(&self, cookie_value: &str) -> Result<Session, SessionError> {
		let id = self.session_id_from_cookie(cookie_value)?;
		let blob = match self.store.read(&id).await {
			Ok(blob) => blob,
			Err(StoreError::KeyNotFound) => return Err(SessionError::NotFound),
			Err(e) => return Err(e.into()),
		};
		let data = blob.decrypt(&self.crypter)?;

		if data.metadata.is_ended() {
			self.delete_detached(vec![id]);
			return Err(SessionError::Expired);
		}
		if data.metadata.is_timed_out() {
			return Err(SessionError::Inactive);
		}

		Ok(Session { id, data })
	}

	/// Refreshes the session's tokens if due (or, with `force`, whenever the
	/// cooldown allows). Holds the per-session lease across the re-read,
	/// re-check and token call so concurrent requests cannot race a second
	/// refresh. Transient failures leave the session untouched; a final
	/// rejection destroys it.
	pub async fn refresh_if_due(&self, session: Session, force: bool) -> Result<Session, SessionError> {
		if !session.data.has_refresh_token() || !self.refresh_due(&session.data.metadata, force) {
			return Ok(session);
		}

		let external_id = session.data.external_session_id.clone();
		let lease = self
			.refresh_leases
			.entry(external_id.clone())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone();
		let guard = lease.lock().await;

		let result = self.refresh_locked(session, force).await;

		drop(guard);
		// The map entry can go once nobody else holds the lease; the shard
		// lock makes the count check and removal atomic against new clones.
		self
			.refresh_leases
			.remove_if(&external_id, |_, lease| Arc::strong_count(lease) == 2);

		result
	}

	async fn refresh_locked(&self, session: Session, force: bool) -> Result<Session, SessionError> {
		// Another worker may have refreshed while we waited for the lease:
		// re-read and re-check before touching the token endpoint.
		let mut session = match self.store.read(&session.id).await {
			Ok(blob) => Session {
				data: blob.decrypt(&self.crypter)?,
				id: session.id,
			},
			Err(StoreError::KeyNotFound) => return Err(SessionError::NotFound),
			// Transport trouble: proceed on the copy we already hold.
			Err(e) => {
				debug!(error = %e, "store re-read failed before refresh; using in-memory copy");
				session
			},
		};

		if !self.refresh_due(&session.data.metadata, force) {
			return Ok(session);
		}

		match self.relying_party.refresh(&session.data.refresh_token).await {
			Ok(tokens) => {
				session.data.access_token = tokens.access_token;
				if let Some(id_token) = tokens.id_token {
					session.data.id_token = id_token;
				}
				if let Some(refresh_token) = tokens.refresh_token {
					session.data.refresh_token = refresh_token;
				}
				session.data.metadata.refresh(tokens.expires_in);
				if let Some(timeout) = self.inactivity_timeout {
					session.data.metadata.extend_timeout(timeout);
				}

				if let Err(e) = self.persist(&session).await {
					// The refresh itself succeeded; the next request retries
					// the write with its own refresh response if needed.
					warn!(error = %e, "failed to persist refreshed session");
				}
				metrics::record_refresh("success");
				debug!("refreshed session tokens");
				Ok(session)
			},
			Err(e) if e.is_final() => {
				info!(error = %e, "refresh rejected; destroying session");
				metrics::record_refresh("rejected");
				if let Err(delete_err) = self.destroy(&session.id).await {
					warn!(error = %delete_err, "failed to delete rejected session");
				}
				Err(SessionError::Refresh(e))
			},
			Err(e) => {
				warn!(error = %e, "transient refresh failure; keeping session");
				metrics::record_refresh("transient_error");
				Ok(session)
			},
		}
	}

	fn refresh_due(&self, metadata: &Metadata, force: bool) -> bool {
		if force {
			!metadata.is_refresh_on_cooldown()
		} else {
			metadata.should_refresh()
		}
	}

	/// Extends the idle deadline and persists the new metadata. No-op when
	/// inactivity tracking is disabled.
	pub async fn extend_timeout(&self, session: &mut Session) -> Result<(), SessionError> {
		let Some(timeout) = self.inactivity_timeout else {
			return Ok(());
		};
		session.data.metadata.extend_timeout(timeout);
		self.persist(session).await
	}

	pub async fn destroy(&self, session_id: &str) -> Result<(), SessionError> {
		match self.store.delete(&[session_id.to_string()]).await {
			Ok(()) | Err(StoreError::KeyNotFound) => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	fn delete_detached(&self, keys: Vec<String>) {
		let store = self.store.clone();
		tokio::spawn(async move {
			if let Err(e) = store.delete(&keys).await
				&& !e.is_not_found()
			{
				warn!(error = %e, "failed to delete expired session");
			}
		});
	}
}
