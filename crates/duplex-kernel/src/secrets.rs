//! Secrets provider boundary.
//!
//! Credential material is fetched once at startup through a
//! [`SecretsProvider`]. Where the bytes live (vault, encrypted file,
//! environment) is the provider's business; the gateway only holds the
//! resolved values in memory and never writes them anywhere.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Opaque secret bytes.
///
/// `Debug` prints `[REDACTED]`; the buffer is zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Read-only access. Callers must not log or persist the slice.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SecretsError {
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("secret '{0}' is empty")]
    Empty(String),
    #[error("secrets backend unavailable: {0}")]
    Unavailable(String),
}

/// Source of named secrets.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<SecretBytes, SecretsError>;
}

/// Reads `<prefix><NAME>` environment variables. The name is uppercased and
/// `-`/`.` become `_`, so `orders-api` with prefix `DUPLEX_SECRET_` reads
/// `DUPLEX_SECRET_ORDERS_API`.
#[derive(Debug, Clone)]
pub struct EnvSecretsProvider {
    prefix: String,
}

impl Default for EnvSecretsProvider {
    fn default() -> Self {
        Self::new("DUPLEX_SECRET_")
    }
}

impl EnvSecretsProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn var_name(&self, name: &str) -> String {
        let key: String = name
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl SecretsProvider for EnvSecretsProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretBytes, SecretsError> {
        let var = self.var_name(name);
        let value = std::env::var(&var).map_err(|_| SecretsError::NotFound(name.to_string()))?;
        if value.is_empty() {
            return Err(SecretsError::Empty(name.to_string()));
        }
        Ok(SecretBytes::new(value.into_bytes()))
    }
}

/// In-memory secrets, for tests and local development.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretsProvider {
    secrets: HashMap<String, SecretBytes>,
}

impl StaticSecretsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.secrets.insert(name.into(), SecretBytes::new(value));
        self
    }
}

#[async_trait]
impl SecretsProvider for StaticSecretsProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretBytes, SecretsError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SecretsError::NotFound(name.to_string()))
    }
}
