use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderName};
use anyhow::Context;
use sha2::{Digest, Sha256};
use crate::error::{Error, Result};

/// Resolves the authenticated owner of a request
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self, headers: &HeaderMap) -> Result<String>;
}

/// Trusts a header set by the authenticating front proxy. Requests without
/// it, or with a blank value, are unauthenticated.
pub struct HeaderIdentity {
    header: HeaderName,
}

impl HeaderIdentity {
    pub fn new(header: &str) -> anyhow::Result<Self> {
        let header = HeaderName::try_from(header)
            .with_context(|| format!("Invalid identity header name: {}", header))?;
        Ok(Self { header })
    }
}

impl IdentityProvider for HeaderIdentity {
    fn current_user(&self, headers: &HeaderMap) -> Result<String> {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(str::to_string)
            .ok_or(Error::Unauthenticated)
    }
}

/// Shared secret the delivery worker presents as `Authorization: Bearer <token>`.
/// Without a configured token every worker request is rejected.
pub struct WorkerAuth {
    token_digest: Option<Vec<u8>>,
}

impl WorkerAuth {
    pub fn new(token: Option<&str>) -> Self {
        let token_digest = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| Sha256::digest(token.as_bytes()).to_vec());
        Self { token_digest }
    }

    pub fn is_configured(&self) -> bool {
        self.token_digest.is_some()
    }

    /// Digests are compared so the check does not leak a matching prefix
    pub fn verify(&self, headers: &HeaderMap) -> Result<()> {
        let expected = self.token_digest.as_deref().ok_or(Error::Unauthenticated)?;
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(Error::Unauthenticated)?;

        if Sha256::digest(presented.as_bytes()).as_slice() == expected {
            Ok(())
        } else {
            Err(Error::Unauthenticated)
        }
    }
}
