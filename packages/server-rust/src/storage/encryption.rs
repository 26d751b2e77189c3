//! Encryption of sensitive operation fields at rest.
//!
//! Every stored row carries the tag of the mode its sensitive fields were
//! sealed with. Reads dispatch on that tag, so rows written under an older
//! mode stay readable after the write mode changes. Rows with no tag (or an
//! unknown one) are opened with the legacy mode.
//!
//! The cipher itself is pluggable through [`Cipher`]; the store only sees
//! mode tags and base64 strings.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use kyma_broker_core::ProvisioningParameters;

/// Tag of the stream cipher mode used by rows written before GCM.
pub const MODE_CFB: &str = "AES-CFB";
/// Tag of the authenticated mode used for new writes.
pub const MODE_GCM: &str = "AES-GCM";

/// Errors from sealing or opening a sensitive value.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("no cipher registered for mode {mode}")]
    UnknownMode { mode: String },
    #[error("sealed value is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("opened value is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("cipher failure in mode {mode}: {reason}")]
    Cipher { mode: String, reason: String },
}

/// One symmetric encryption mode.
pub trait Cipher: Send + Sync {
    /// Tag persisted next to values sealed by this cipher.
    fn mode(&self) -> &str;

    /// # Errors
    ///
    /// Returns [`CodecError::Cipher`] if the plaintext cannot be sealed.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// # Errors
    ///
    /// Returns [`CodecError::Cipher`] if the ciphertext is corrupt or was
    /// sealed with another key.
    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Seals and opens the sensitive fields of [`ProvisioningParameters`]:
/// Service Manager client ID and secret, and the user kubeconfig.
pub struct Encrypter {
    ciphers: HashMap<String, Arc<dyn Cipher>>,
    write_mode: ArcSwap<String>,
    legacy_mode: String,
}

impl Encrypter {
    /// Creates an encrypter that writes with `write_mode` and opens untagged
    /// rows with `legacy_mode`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownMode`] if either mode has no cipher.
    pub fn new(
        ciphers: impl IntoIterator<Item = Arc<dyn Cipher>>,
        write_mode: &str,
        legacy_mode: &str,
    ) -> Result<Self, CodecError> {
        let ciphers: HashMap<String, Arc<dyn Cipher>> = ciphers
            .into_iter()
            .map(|c| (c.mode().to_ascii_uppercase(), c))
            .collect();
        for mode in [write_mode, legacy_mode] {
            if !ciphers.contains_key(&mode.to_ascii_uppercase()) {
                return Err(CodecError::UnknownMode {
                    mode: mode.to_string(),
                });
            }
        }
        Ok(Self {
            ciphers,
            write_mode: ArcSwap::from_pointee(write_mode.to_ascii_uppercase()),
            legacy_mode: legacy_mode.to_ascii_uppercase(),
        })
    }

    /// Mode used for subsequent writes.
    #[must_use]
    pub fn write_mode(&self) -> String {
        self.write_mode.load().as_ref().clone()
    }

    /// Switches the mode used for subsequent writes. Existing rows keep
    /// their own tag.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownMode`] if `mode` has no cipher.
    pub fn set_write_mode(&self, mode: &str) -> Result<(), CodecError> {
        let mode = mode.to_ascii_uppercase();
        if !self.ciphers.contains_key(&mode) {
            return Err(CodecError::UnknownMode { mode });
        }
        self.write_mode.store(Arc::new(mode));
        Ok(())
    }

    fn cipher_for(&self, mode: Option<&str>) -> Result<&Arc<dyn Cipher>, CodecError> {
        let mode = mode
            .map(str::to_ascii_uppercase)
            .filter(|m| self.ciphers.contains_key(m))
            .unwrap_or_else(|| self.legacy_mode.clone());
        self.ciphers
            .get(&mode)
            .ok_or(CodecError::UnknownMode { mode })
    }

    /// Seals `plaintext` with the current write mode. Returns the mode tag
    /// and the base64 encoded ciphertext.
    ///
    /// # Errors
    ///
    /// Propagates cipher failures.
    pub fn encrypt(&self, plaintext: &str) -> Result<(String, String), CodecError> {
        let mode = self.write_mode();
        let cipher = self.cipher_for(Some(&mode))?;
        let sealed = cipher.seal(plaintext.as_bytes())?;
        Ok((mode, STANDARD.encode(sealed)))
    }

    /// Opens a base64 value sealed under `mode`. `None` or an unknown tag
    /// falls back to the legacy mode.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid base64, cipher failure or non-UTF-8
    /// plaintext.
    pub fn decrypt(&self, mode: Option<&str>, sealed: &str) -> Result<String, CodecError> {
        let cipher = self.cipher_for(mode)?;
        let raw = STANDARD.decode(sealed)?;
        let opened = cipher.open(&raw)?;
        Ok(String::from_utf8(opened)?)
    }

    /// Seals every non-empty sensitive field in place and returns the mode
    /// tag to persist with the row.
    ///
    /// # Errors
    ///
    /// Propagates cipher failures.
    pub fn encrypt_sensitive(
        &self,
        parameters: &mut ProvisioningParameters,
    ) -> Result<String, CodecError> {
        let mode = self.write_mode();
        let cipher = self.cipher_for(Some(&mode))?;
        for field in sensitive_fields(parameters) {
            if field.is_empty() {
                continue;
            }
            let sealed = cipher.seal(field.as_bytes())?;
            *field = STANDARD.encode(sealed);
        }
        Ok(mode)
    }

    /// Opens every non-empty sensitive field in place.
    ///
    /// # Errors
    ///
    /// Returns the first field failure.
    pub fn decrypt_sensitive(
        &self,
        parameters: &mut ProvisioningParameters,
        mode: Option<&str>,
    ) -> Result<(), CodecError> {
        for field in sensitive_fields(parameters) {
            if field.is_empty() {
                continue;
            }
            *field = self.decrypt(mode, field.as_str())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Encrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut modes: Vec<&String> = self.ciphers.keys().collect();
        modes.sort();
        f.debug_struct("Encrypter")
            .field("modes", &modes)
            .field("write_mode", &self.write_mode())
            .field("legacy_mode", &self.legacy_mode)
            .finish()
    }
}

fn sensitive_fields(parameters: &mut ProvisioningParameters) -> Vec<&mut String> {
    let mut fields = Vec::with_capacity(3);
    if let Some(credentials) = parameters.ers_context.sm_operator_credentials.as_mut() {
        fields.push(&mut credentials.client_id);
        fields.push(&mut credentials.client_secret);
    }
    fields.push(&mut parameters.parameters.kubeconfig);
    fields
}
