use std::path::Path;

use crate::server::vault::{SecretKey, SecretStore};

const USERNAME_MAX_CHARS: usize = 50;
const PASSWORD_MIN_CHARS: usize = 8;
const PASSWORD_MAX_CHARS: usize = 128;
const PASSPHRASE_MAX_CHARS: usize = 256;
const STREAM_DELAY_MAX_MS: u64 = 10_000;
const KEY_STORE_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// A validated username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Reads and validates the configured credentials.
    ///
    /// Returns `None` when either value is absent or fails validation; callers
    /// treat that as "not configured" and refuse the connection.
    pub fn load(store: &dyn SecretStore) -> Option<Self> {
        let username = validate_username(&store.get(SecretKey::Username)?)?;
        let password = validate_password(&store.get(SecretKey::Password)?)?;
        Some(Self { username, password })
    }

    /// Exact comparison against a decoded `user:pass` Basic token.
    pub fn matches(&self, decoded: &str) -> bool {
        match decoded.split_once(':') {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }
}

/// Validates a username: 1-50 ASCII letters, digits, hyphens or underscores.
///
/// Surrounding whitespace is trimmed before the check.
pub fn validate_username(raw: &str) -> Option<String> {
    let username = raw.trim();
    let len = username.chars().count();
    if len == 0 || len > USERNAME_MAX_CHARS {
        return None;
    }
    username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        .then(|| username.to_string())
}

/// Validates a password: 8-128 characters with at least one uppercase letter,
/// one lowercase letter and one digit, and no control characters. The value
/// is taken verbatim.
pub fn validate_password(raw: &str) -> Option<String> {
    let len = raw.chars().count();
    if !(PASSWORD_MIN_CHARS..=PASSWORD_MAX_CHARS).contains(&len) {
        return None;
    }
    if raw.chars().any(char::is_control) {
        return None;
    }
    let has_upper = raw.chars().any(|c| c.is_uppercase());
    let has_lower = raw.chars().any(|c| c.is_lowercase());
    let has_digit = raw.chars().any(|c| c.is_ascii_digit());
    (has_upper && has_lower && has_digit).then(|| raw.to_string())
}

/// Validates a key-store passphrase: non-empty after trimming, at most 256 characters.
pub fn validate_cert_passphrase(raw: &str) -> Option<String> {
    let passphrase = raw.trim();
    let len = passphrase.chars().count();
    (len > 0 && len <= PASSPHRASE_MAX_CHARS).then(|| passphrase.to_string())
}

/// Validates the minimum spacing between broadcast frames.
pub fn validate_stream_delay(delay_ms: u64) -> bool {
    delay_ms <= STREAM_DELAY_MAX_MS
}

/// Validates a user-supplied key-store path: a `.p12`/`.pfx` file no larger than 10 MiB.
pub fn validate_cert_path(path: &Path) -> Result<(), String> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if !matches!(extension.as_deref(), Some("p12") | Some("pfx")) {
        return Err(format!("Key store must be a .p12 or .pfx file: {:?}", path));
    }
    let metadata = std::fs::metadata(path)
        .map_err(|e| format!("Key store not readable: {} (path: {:?})", e, path))?;
    if !metadata.is_file() {
        return Err(format!("Key store is not a file: {:?}", path));
    }
    if metadata.len() > KEY_STORE_MAX_BYTES {
        return Err(format!("Key store larger than 10MB: {:?}", path));
    }
    Ok(())
}
