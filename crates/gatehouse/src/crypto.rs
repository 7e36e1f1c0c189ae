use aws_lc_rs::aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use tracing::warn;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const BLOB_AAD: &[u8] = b"gatehouse_blob";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
	#[error("invalid encryption key: {0}")]
	InvalidKey(String),
	#[error("encryption failed")]
	Encrypt,
	#[error("decryption failed")]
	Decrypt,
	#[error("ciphertext too short")]
	TooShort,
}

/// Crypter seals and opens opaque blobs with AES-256-GCM. The nonce is
/// generated per call and prepended to the ciphertext.
pub struct Crypter {
	key: LessSafeKey,
}

impl Crypter {
	pub fn new(key_bytes: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
		let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
			.map_err(|_| CryptoError::InvalidKey("rejected by AEAD construction".into()))?;
		Ok(Self {
			key: LessSafeKey::new(unbound),
		})
	}

	pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		let mut nonce_bytes = [0u8; NONCE_LEN];
		rand::rng().fill_bytes(&mut nonce_bytes);
		let nonce = Nonce::assume_unique_for_key(nonce_bytes);

		let mut in_out = Vec::with_capacity(plaintext.len() + AES_256_GCM.tag_len());
		in_out.extend_from_slice(plaintext);
		self
			.key
			.seal_in_place_append_tag(nonce, Aad::from(BLOB_AAD), &mut in_out)
			.map_err(|_| CryptoError::Encrypt)?;

		let mut result = Vec::with_capacity(NONCE_LEN + in_out.len());
		result.extend_from_slice(&nonce_bytes);
		result.extend_from_slice(&in_out);
		Ok(result)
	}

	pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		if ciphertext.len() < NONCE_LEN + AES_256_GCM.tag_len() {
			return Err(CryptoError::TooShort);
		}

		let nonce =
			Nonce::try_assume_unique_for_key(&ciphertext[..NONCE_LEN]).map_err(|_| CryptoError::Decrypt)?;
		let mut in_out = ciphertext[NONCE_LEN..].to_vec();
		let plaintext_len = self
			.key
			.open_in_place(nonce, Aad::from(BLOB_AAD), &mut in_out)
			.map_err(|_| CryptoError::Decrypt)?
			.len();
		in_out.truncate(plaintext_len);
		Ok(in_out)
	}
}

/// Decodes a configured key (standard base64, 32 bytes), or generates a fresh
/// one when none is configured. Generated keys do not survive restarts, so any
/// outstanding sessions become undecryptable.
pub fn key_from_config(configured: Option<&str>) -> Result<[u8; KEY_LEN], CryptoError> {
	match configured {
		Some(encoded) => {
			let bytes = STANDARD
				.decode(encoded)
				.map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))?;
			bytes
				.try_into()
				.map_err(|_| CryptoError::InvalidKey(format!("key must be {KEY_LEN} bytes")))
		},
		None => {
			warn!("no encryption key configured; generating an ephemeral key");
			let mut key = [0u8; KEY_LEN];
			rand::rng().fill_bytes(&mut key);
			Ok(key)
		},
	}
}
