//! Secret provider collaborator.
//!
//! The orchestrator never knows where secrets live; it hands an opaque
//! `source` key to the provider and gets a value back. The value is injected
//! into the runtime environment (or written into the build root) and is
//! never logged.

use crate::error::{KilnError, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Lookup of a secret value by opaque source key.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, source: &str) -> Result<String>;
}

/// In-memory provider backed by a fixed map. The default for tests and
/// single-operator deployments; production deployments inject their own
/// provider.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretProvider {
    values: HashMap<String, String>,
}

impl StaticSecretProvider {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, source: impl Into<String>, value: impl Into<String>) {
        self.values.insert(source.into(), value.into());
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_secret(&self, source: &str) -> Result<String> {
        self.values.get(source).cloned().ok_or_else(|| KilnError::SecretFailed {
            secret_source: source.to_string(),
            reason: format!("secret '{}' not found", source),
        })
    }
}

/// Provider that resolves sources against process environment variables,
/// mapping `a/b/c` to `A_B_C`.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretProvider;

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, source: &str) -> Result<String> {
        let var = source.replace(['/', '-', '.'], "_").to_uppercase();
        std::env::var(&var).map_err(|_| KilnError::SecretFailed {
            secret_source: source.to_string(),
            reason: format!("secret '{}' not found", source),
        })
    }
}
