use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::EncryptedData;
use crate::config::RedisConfig;
use crate::metrics;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	/// The key does not exist (or its TTL has passed). Distinct from
	/// transport failures: absence means "unauthenticated", not "retry".
	#[error("key not found")]
	KeyNotFound,
	#[error("session store backend: {0}")]
	Backend(String),
	#[error("corrupt store value: {0}")]
	Corrupt(String),
}

impl StoreError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, StoreError::KeyNotFound)
	}
}

/// Key→blob storage with per-entry TTL. Write must apply the TTL atomically
/// with the value. Backends are eventually consistent across replicas.
#[async_trait]
pub trait SessionStore: Send + Sync {
	async fn read(&self, key: &str) -> Result<EncryptedData, StoreError>;
	async fn write(&self, key: &str, value: &EncryptedData, ttl: Duration) -> Result<(), StoreError>;
	async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// The networked backend shared by all replicas.
pub struct RedisSessionStore {
	pool: Pool,
}

impl RedisSessionStore {
	pub fn new(config: &RedisConfig) -> anyhow::Result<Self> {
		let pool = deadpool_redis::Config::from_url(config.uri.expose_secret())
			.create_pool(Some(Runtime::Tokio1))?;
		Ok(Self { pool })
	}

	async fn connection(&self) -> Result<deadpool_redis::Connection, StoreError> {
		self
			.pool
			.get()
			.await
			.map_err(|e| StoreError::Backend(e.to_string()))
	}
}

#[async_trait]
impl SessionStore for RedisSessionStore {
	async fn read(&self, key: &str) -> Result<EncryptedData, StoreError> {
		metrics::observe_store("read", async {
			let mut conn = self.connection().await?;
			let raw: Option<String> = conn
				.get(key)
				.await
				.map_err(|e| StoreError::Backend(e.to_string()))?;
			let raw = raw.ok_or(StoreError::KeyNotFound)?;
			serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))
		})
		.await
	}

	async fn write(&self, key: &str, value: &EncryptedData, ttl: Duration) -> Result<(), StoreError> {
		metrics::observe_store("write", async {
			let raw = serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
			let mut conn = self.connection().await?;
			// SET with EX applies value and expiry atomically.
			conn
				.set_ex::<_, _, ()>(key, raw, ttl.as_secs().max(1))
				.await
				.map_err(|e| StoreError::Backend(e.to_string()))
		})
		.await
	}

	async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
		metrics::observe_store("delete", async {
			let mut conn = self.connection().await?;
			let removed: usize = conn
				.del(keys)
				.await
				.map_err(|e| StoreError::Backend(e.to_string()))?;
			if removed == 0 {
				return Err(StoreError::KeyNotFound);
			}
			Ok(())
		})
		.await
	}
}

/// Single-replica fallback with monotonic-clock expiry, for deployments
/// without a shared store.
#[derive(Default)]
pub struct MemorySessionStore {
	entries: Mutex<HashMap<String, (EncryptedData, Instant)>>,
}

impl MemorySessionStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl SessionStore for MemorySessionStore {
	async fn read(&self, key: &str) -> Result<EncryptedData, StoreError> {
		metrics::observe_store("read", async {
			let mut entries = self.entries.lock().expect("session store lock poisoned");
			match entries.get(key) {
				Some((_, expires_at)) if *expires_at <= Instant::now() => {
					entries.remove(key);
					Err(StoreError::KeyNotFound)
				},
				Some((value, _)) => Ok(value.clone()),
				None => Err(StoreError::KeyNotFound),
			}
		})
		.await
	}

	async fn write(&self, key: &str, value: &EncryptedData, ttl: Duration) -> Result<(), StoreError> {
		metrics::observe_store("write", async {
			let mut entries = self.entries.lock().expect("session store lock poisoned");
			entries.insert(key.to_string(), (value.clone(), Instant::now() + ttl));
			Ok(())
		})
		.await
	}

	async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
		metrics::observe_store("delete", async {
			let mut entries = self.entries.lock().expect("session store lock poisoned");
			let mut removed = 0;
			for key in keys {
				if entries.remove(key).is_some() {
					removed += 1;
				}
			}
			if removed == 0 {
				return Err(StoreError::KeyNotFound);
			}
			Ok(())
		})
		.await
	}
}
