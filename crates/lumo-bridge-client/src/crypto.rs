//! Per-request turn encryption.
//!
//! Every generation gets a fresh AES-256-GCM key and request id. Turn
//! contents are sealed with associated data binding them to the request and
//! their turn index; response chunks are sealed under a direction-distinct
//! AD. The symmetric key travels wrapped under the backend's published RSA
//! public key (OAEP over SHA-256), so only the backend can open it.
//!
//! Ciphertexts are transported as `base64(nonce || ciphertext)`.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::Oaep;
use rsa::RsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::ClientError;

const NONCE_LEN: usize = 12;

/// Associated data for the `i`-th turn of a request.
#[must_use]
pub fn turn_associated_data(request_id: &str, index: usize) -> String {
    format!("lumo.request.{request_id}.turn.{index}")
}

/// Associated data for response chunks of a request.
#[must_use]
pub fn chunk_associated_data(request_id: &str) -> String {
    format!("lumo.response.{request_id}.chunk")
}

/// The narrow encryption interface the generation client depends on.
///
/// Holds the backend's public key; [`TurnCrypto::begin_request`] mints the
/// per-request material.
#[derive(Clone)]
pub struct TurnCrypto {
    backend_key: RsaPublicKey,
}

impl std::fmt::Debug for TurnCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCrypto").finish_non_exhaustive()
    }
}

impl TurnCrypto {
    /// Parses the backend's public key from PEM.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] when the PEM is malformed.
    pub fn from_pem(pem: &str) -> Result<Self, ClientError> {
        let backend_key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| ClientError::Configuration(format!("invalid backend public key: {e}")))?;
        Ok(Self { backend_key })
    }

    /// Mints a fresh request id, symmetric key and wrapped key.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Crypto`] if key wrapping fails.
    pub fn begin_request(&self) -> Result<RequestCipher, ClientError> {
        let key = Aes256Gcm::generate_key(aes_gcm::aead::OsRng);
        let wrapped = self
            .backend_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_slice())
            .map_err(|e| ClientError::Crypto(format!("failed to wrap request key: {e}")))?;

        Ok(RequestCipher {
            request_id: Uuid::new_v4().simple().to_string(),
            wrapped_key: BASE64.encode(wrapped),
            cipher: Aes256Gcm::new(&key),
        })
    }
}

/// Per-request cipher state: the request id, the wrapped key to ship to the
/// backend, and the symmetric cipher for both directions.
#[derive(Clone)]
pub struct RequestCipher {
    request_id: String,
    wrapped_key: String,
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for RequestCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCipher")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl RequestCipher {
    /// The opaque request id bound into every AD string.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The wrapped symmetric key, base64-encoded for the request body.
    #[must_use]
    pub fn wrapped_key(&self) -> &str {
        &self.wrapped_key
    }

    /// Seals `plaintext` under this request's key with the given AD.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Crypto`] if encryption fails.
    pub fn encrypt(&self, associated_data: &str, plaintext: &str) -> Result<String, ClientError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: associated_data.as_bytes(),
                },
            )
            .map_err(|e| ClientError::Crypto(format!("turn encryption failed: {e}")))?;

        let mut framed = Vec::with_capacity(NONCE_LEN + sealed.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&sealed);
        Ok(BASE64.encode(framed))
    }

    /// Opens a `base64(nonce || ciphertext)` chunk sealed with the given AD.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Crypto`] on bad base64, a truncated frame, a
    /// wrong key/AD, or non-UTF-8 plaintext.
    pub fn decrypt(
        &self,
        associated_data: &str,
        ciphertext: &str,
    ) -> Result<String, ClientError> {
        let framed = BASE64
            .decode(ciphertext)
            .map_err(|e| ClientError::Crypto(format!("chunk is not valid base64: {e}")))?;
        if framed.len() <= NONCE_LEN {
            return Err(ClientError::Crypto("chunk too short".to_string()));
        }
        let (nonce_bytes, sealed) = framed.split_at(NONCE_LEN);

        let opened = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: sealed,
                    aad: associated_data.as_bytes(),
                },
            )
            .map_err(|e| ClientError::Crypto(format!("chunk decryption failed: {e}")))?;

        String::from_utf8(opened)
            .map_err(|e| ClientError::Crypto(format!("decrypted chunk is not UTF-8: {e}")))
    }
}

/// A cipher for tests and loopback use, keyed locally instead of wrapping
/// for a backend. Encrypt/decrypt behave identically to the production
/// path.
#[cfg(any(test, feature = "test-util"))]
#[must_use]
pub fn local_request_cipher() -> RequestCipher {
    let key = Aes256Gcm::generate_key(aes_gcm::aead::OsRng);
    RequestCipher {
        request_id: Uuid::new_v4().simple().to_string(),
        wrapped_key: BASE64.encode(key.as_slice()),
        cipher: Aes256Gcm::new(&key),
    }
}
