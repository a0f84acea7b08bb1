//! API credential suppliers.
//!
//! The client asks for the key exactly once, at construction. Where the key
//! actually lives (environment, keychain, a vault) is the supplier's business.

use super::errors::InferenceError;

/// Something that can hand over the API key.
pub trait SecretSource {
    fn api_key(&self) -> Result<String, InferenceError>;
}

/// Reads the key from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvSecret {
    var: String,
}

impl EnvSecret {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl SecretSource for EnvSecret {
    fn api_key(&self) -> Result<String, InferenceError> {
        match std::env::var(&self.var) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(InferenceError::MissingCredential {
                source_name: format!("environment variable {}", self.var),
            }),
        }
    }
}

/// A key known up front (tests, embedding applications).
#[derive(Clone)]
pub struct StaticSecret(String);

impl StaticSecret {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticSecret(<redacted>)")
    }
}

impl SecretSource for StaticSecret {
    fn api_key(&self) -> Result<String, InferenceError> {
        if self.0.is_empty() {
            return Err(InferenceError::MissingCredential {
                source_name: "static secret".into(),
            });
        }
        Ok(self.0.clone())
    }
}
