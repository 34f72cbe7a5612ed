use std::{
    collections::HashMap,
    sync::RwLock,
};

/// Keys of the secrets the server reads from its vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKey {
    Username,
    Password,
    CertificatePassword,
}

impl SecretKey {
    /// Environment variable consulted by [`EnvSecretStore`].
    pub fn env_var(self) -> &'static str {
        match self {
            SecretKey::Username => "MJPEG_USERNAME",
            SecretKey::Password => "MJPEG_PASSWORD",
            SecretKey::CertificatePassword => "MJPEG_CERT_PASSWORD",
        }
    }
}

/// Source of the credentials and key-store passphrase.
///
/// Values are fetched on every use so that changes made through the settings
/// surface take effect on the next connection without restarting the server.
/// An empty value is reported as absent.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: SecretKey) -> Option<String>;
}

/// In-memory store whose values may be replaced while the server runs.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: RwLock<HashMap<SecretKey, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding a username and password.
    pub fn with_credentials(username: &str, password: &str) -> Self {
        let store = Self::new();
        store.set(SecretKey::Username, username);
        store.set(SecretKey::Password, password);
        store
    }

    pub fn set(&self, key: SecretKey, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key, value.to_string());
        }
    }

    pub fn remove(&self, key: SecretKey) {
        if let Ok(mut values) = self.values.write() {
            values.remove(&key);
        }
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: SecretKey) -> Option<String> {
        self.values
            .read()
            .ok()?
            .get(&key)
            .filter(|value| !value.is_empty())
            .cloned()
    }
}

/// Reads secrets from `MJPEG_*` environment variables at lookup time.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, key: SecretKey) -> Option<String> {
        std::env::var(key.env_var()).ok().filter(|value| !value.is_empty())
    }
}
