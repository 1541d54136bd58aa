//! Credential to namespace resolution.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::IdentityResolver;

/// Derives a stable namespace from a credential without interpreting it
#[derive(Debug, Clone, Default)]
pub struct HashedIdentity {
    salt: String,
}

impl HashedIdentity {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }
}

#[async_trait]
impl IdentityResolver for HashedIdentity {
    async fn resolve(&self, credential: &str) -> Result<String> {
        if credential.trim().is_empty() {
            anyhow::bail!("Empty credential");
        }

        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(credential.as_bytes());
        let digest = hasher.finalize();

        // First 16 hex chars (8 bytes)
        Ok(format!("u_{}", hex::encode(&digest[..8])))
    }
}
