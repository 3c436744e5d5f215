use crate::types::{Result, SyncError, UpstreamSession};
use fernet::Fernet;

/// Source of the key used to encrypt upstream session tokens at rest.
pub trait SecretProvider: Send + Sync {
    fn session_key(&self) -> Result<String>;
}

/// Reads a url-safe base64 Fernet key from an environment variable.
pub struct EnvSecretProvider {
    var: String,
}

impl EnvSecretProvider {
    pub const DEFAULT_VAR: &'static str = "FERNET_KEY";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl SecretProvider for EnvSecretProvider {
    fn session_key(&self) -> Result<String> {
        std::env::var(&self.var).map_err(|_| SyncError::Secret(format!("{} is not set", self.var)))
    }
}

pub struct StaticSecretProvider {
    key: String,
}

impl StaticSecretProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn generate() -> Self {
        Self::new(Fernet::generate_key())
    }
}

impl SecretProvider for StaticSecretProvider {
    fn session_key(&self) -> Result<String> {
        Ok(self.key.clone())
    }
}

pub struct SessionCipher {
    fernet: Fernet,
}

impl SessionCipher {
    pub fn from_provider(provider: &dyn SecretProvider) -> Result<Self> {
        let key = provider.session_key()?;
        let fernet = Fernet::new(key.trim()).ok_or_else(|| SyncError::Secret("key is not a valid Fernet key".to_string()))?;
        Ok(Self { fernet })
    }

    pub fn encrypt(&self, session: &UpstreamSession) -> Result<String> {
        let plaintext = serde_json::to_vec(session)?;
        Ok(self.fernet.encrypt(&plaintext))
    }

    pub fn decrypt(&self, token: &str) -> Result<UpstreamSession> {
        let plaintext = self
            .fernet
            .decrypt(token)
            .map_err(|_| SyncError::Crypto("token rejected by cipher".to_string()))?;
        let session = serde_json::from_slice(&plaintext).map_err(|e| SyncError::Crypto(e.to_string()))?;
        Ok(session)
    }
}
