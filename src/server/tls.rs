//! PKCS#12 key-store loading and the pinned rustls server context.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use p12::{AlgorithmIdentifier, SafeBagKind, PFX};
use thiserror::Error;
use tokio_rustls::{
    rustls::{
        cipher_suite::{
            TLS13_AES_128_GCM_SHA256, TLS13_AES_256_GCM_SHA384,
            TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256, TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        },
        version::{TLS12, TLS13},
        Certificate, PrivateKey, ServerConfig as RustlsServerConfig, SupportedCipherSuite,
    },
    TlsAcceptor,
};
use tracing::{info, warn};

use crate::server::middleware::validation::validate_cert_passphrase;
use crate::server::vault::{SecretKey, SecretStore};

/// File name of the app-private key store used when no custom path is configured.
pub const PERSONAL_KEY_STORE: &str = "personal_certificate.p12";

/// AEAD suites accepted by the server, strongest first.
fn cipher_suites() -> [SupportedCipherSuite; 6] {
    [
        TLS13_AES_256_GCM_SHA384,
        TLS13_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ]
}

/// Failures while provisioning the TLS context.
///
/// Each variant maps to a different fix the operator has to make, so they are
/// never collapsed into a generic error.
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Certificate file not found: {0:?}")]
    MissingKeyStore(PathBuf),

    #[error("Certificate file is corrupted or invalid: {0}")]
    CorruptKeyStore(String),

    #[error("Certificate password is incorrect")]
    BadPassphrase,

    /// Intact key store protected with algorithms this build cannot decode,
    /// e.g. the SHA-256 MAC and PBES2/AES defaults of OpenSSL 3.
    #[error("Certificate file uses an unsupported PKCS#12 algorithm: {0}")]
    UnsupportedKeyStore(String),

    #[error("Certificate password not configured")]
    PassphraseNotConfigured,

    #[error("TLS config error: {0}")]
    Config(String),
}

/// Where the key store comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStoreSource {
    pub path: PathBuf,
    /// `false` when falling back to the app-private key store.
    pub custom: bool,
}

impl KeyStoreSource {
    /// Picks the configured key store, or the app-private one under `data_dir`.
    pub fn resolve(cert_path: Option<&Path>, data_dir: &Path) -> Self {
        match cert_path {
            Some(path) => Self {
                path: path.to_path_buf(),
                custom: true,
            },
            None => Self {
                path: data_dir.join(PERSONAL_KEY_STORE),
                custom: false,
            },
        }
    }
}

/// Certificate chain and private key extracted from a PKCS#12 container.
pub struct KeyMaterial {
    pub certs: Vec<Certificate>,
    pub key: PrivateKey,
}

/// Decrypts a PKCS#12 container.
///
/// The MAC is checked first so a wrong passphrase is reported as such instead
/// of as a decoding failure further down. Only the legacy SHA-1 MAC and the
/// PKCS#12 PBE ciphers can be decoded; anything else is reported as
/// [`TlsError::UnsupportedKeyStore`] without guessing about the passphrase.
pub fn decode_pkcs12(der: &[u8], passphrase: &str) -> Result<KeyMaterial, TlsError> {
    let pfx = PFX::parse(der)
        .map_err(|e| TlsError::CorruptKeyStore(format!("{:?}", e)))?;

    if let Some(mac_data) = &pfx.mac_data {
        match &mac_data.mac.digest_algorithm {
            AlgorithmIdentifier::Sha1 => {}
            other => {
                return Err(TlsError::UnsupportedKeyStore(format!(
                    "MAC digest {}",
                    algorithm_name(other)
                )))
            }
        }
    }

    if !pfx.verify_mac(passphrase) {
        return Err(TlsError::BadPassphrase);
    }

    // The MAC covers the contents, so past this point a decode failure means
    // an encryption scheme we cannot handle rather than damage.
    let bags = pfx.bags(passphrase).map_err(|e| {
        TlsError::UnsupportedKeyStore(format!("content encryption ({:?})", e))
    })?;
    for bag in &bags {
        if let SafeBagKind::Pkcs8ShroudedKeyBag(key) = &bag.bag {
            if let AlgorithmIdentifier::OtherAlg(_) = key.encryption_algorithm {
                return Err(TlsError::UnsupportedKeyStore(format!(
                    "key encryption {}",
                    algorithm_name(&key.encryption_algorithm)
                )));
            }
        }
    }

    let mut keys = pfx
        .key_bags(passphrase)
        .map_err(|e| TlsError::CorruptKeyStore(format!("key bag: {:?}", e)))?;
    let certs = pfx
        .cert_x509_bags(passphrase)
        .map_err(|e| TlsError::CorruptKeyStore(format!("certificate bag: {:?}", e)))?;

    if keys.is_empty() {
        return Err(TlsError::CorruptKeyStore("no private key in key store".into()));
    }
    if certs.is_empty() {
        return Err(TlsError::CorruptKeyStore("no certificate in key store".into()));
    }

    Ok(KeyMaterial {
        certs: certs.into_iter().map(Certificate).collect(),
        key: PrivateKey(keys.remove(0)),
    })
}

fn algorithm_name(algorithm: &AlgorithmIdentifier) -> String {
    match algorithm {
        AlgorithmIdentifier::Sha1 => "SHA-1".into(),
        AlgorithmIdentifier::PbewithSHAAnd40BitRC2CBC(_) => "pbeWithSHAAnd40BitRC2-CBC".into(),
        AlgorithmIdentifier::PbeWithSHAAnd3KeyTripleDESCBC(_) => "pbeWithSHAAnd3-KeyTripleDES-CBC".into(),
        AlgorithmIdentifier::OtherAlg(other) => format!("{:?}", other.algorithm_type),
    }
}

/// Builds the rustls server context restricted to TLS 1.2/1.3 and AES-GCM suites.
pub fn server_config(material: KeyMaterial) -> Result<RustlsServerConfig, TlsError> {
    RustlsServerConfig::builder()
        .with_cipher_suites(&cipher_suites())
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&TLS13, &TLS12])
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(material.certs, material.key)
        .map_err(|e| TlsError::Config(e.to_string()))
}

/// Reads a key store from disk and turns it into a TLS acceptor.
pub fn load_pkcs12(path: &Path, passphrase: &str) -> Result<TlsAcceptor, TlsError> {
    let der = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => TlsError::MissingKeyStore(path.to_path_buf()),
        _ => TlsError::Config(format!("Certificate error: {} (path: {:?})", e, path)),
    })?;
    let config = server_config(decode_pkcs12(&der, passphrase)?)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Resolves the key store and passphrase and builds the acceptor.
///
/// There is no plaintext fallback: without a usable passphrase the server refuses to start.
pub fn provision(
    cert_path: Option<&Path>,
    data_dir: &Path,
    secrets: &dyn SecretStore,
) -> Result<TlsAcceptor, TlsError> {
    let source = KeyStoreSource::resolve(cert_path, data_dir);
    let passphrase = secrets
        .get(SecretKey::CertificatePassword)
        .and_then(|raw| validate_cert_passphrase(&raw))
        .ok_or(TlsError::PassphraseNotConfigured)?;

    match load_pkcs12(&source.path, &passphrase) {
        Ok(acceptor) => {
            info!(
                "Loaded {} key store {:?}",
                if source.custom { "custom" } else { "personal" },
                source.path
            );
            Ok(acceptor)
        }
        Err(e) => {
            warn!("Certificate loading failed: {}", e);
            Err(e)
        }
    }
}
