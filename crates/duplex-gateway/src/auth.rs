//! API-key authentication.
//!
//! Keys are resolved once at startup through the configured
//! [`SecretsProvider`] and kept in memory only. A caller presents its key in
//! either:
//! - `X-Api-Key: <key>` header (REST and pub/sub)
//! - `Authorization: Bearer <key>` header (REST)
//!
//! A matching key yields the caller's [`CallerIdentity`]; anything else is
//! unauthenticated.

use duplex_kernel::config::{ConfigError, CredentialConfig};
use duplex_kernel::error::{KernelError, KernelResult};
use duplex_kernel::scope::{CallerIdentity, ScopeGrant};
use duplex_kernel::secrets::{SecretBytes, SecretsProvider};
use error_stack::{Report, ResultExt};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

struct Credential {
    key: SecretBytes,
    identity: Arc<CallerIdentity>,
}

/// Maps presented API keys to caller identities.
#[derive(Default)]
pub struct CredentialStore {
    credentials: Vec<Credential>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let principals: Vec<&str> = self
            .credentials
            .iter()
            .map(|c| c.identity.principal())
            .collect();
        f.debug_struct("CredentialStore")
            .field("principals", &principals)
            .finish()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder helper: add a caller with an already-resolved key.
    pub fn with_credential(
        mut self,
        key: impl Into<Vec<u8>>,
        principal: impl Into<String>,
        grants: impl IntoIterator<Item = ScopeGrant>,
    ) -> Self {
        self.insert(SecretBytes::new(key), CallerIdentity::new(principal, grants));
        self
    }

    fn insert(&mut self, key: SecretBytes, identity: CallerIdentity) {
        self.credentials.push(Credential {
            key,
            identity: Arc::new(identity),
        });
    }

    /// Resolve every configured credential's key through `secrets`.
    pub async fn from_config(
        configs: &[CredentialConfig],
        secrets: &dyn SecretsProvider,
    ) -> KernelResult<Self> {
        let mut store = Self::new();
        for cfg in configs {
            let grants = cfg
                .grants()
                .map_err(KernelError::from)
                .map_err(Report::new)
                .attach(format!("parsing scopes of principal '{}'", cfg.principal))?;
            let key = secrets
                .get_secret(&cfg.secret)
                .await
                .map_err(KernelError::from)
                .map_err(Report::new)
                .attach(format!(
                    "resolving secret '{}' for principal '{}'",
                    cfg.secret, cfg.principal
                ))?;
            if key.is_empty() {
                return Err(Report::new(KernelError::Config(ConfigError::Invalid(
                    format!("principal '{}' has an empty key", cfg.principal),
                ))));
            }
            debug!(principal = %cfg.principal, scopes = cfg.scopes.len(), "credential loaded");
            store.insert(key, CallerIdentity::new(cfg.principal.clone(), grants));
        }
        info!(count = store.len(), "credentials loaded");
        Ok(store)
    }

    /// Identity owning `presented`, compared in constant time.
    pub fn authenticate(&self, presented: Option<&str>) -> Option<Arc<CallerIdentity>> {
        let presented = presented?.as_bytes();
        // Scan every entry so timing does not reveal which one matched.
        let mut found = None;
        for credential in &self.credentials {
            let key = credential.key.expose();
            let equal = key.len() == presented.len() && bool::from(key.ct_eq(presented));
            if equal && found.is_none() {
                found = Some(credential.identity.clone());
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}
