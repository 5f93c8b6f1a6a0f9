//! Persisted self-signed TLS identity.
//!
//! The export listener presents a self-signed certificate that the operator
//! trusts once on each client device. The identity is created the first time
//! export mode starts and is reused on every later start for as long as the
//! file exists and parses. It is never rotated behind the operator's back:
//!
//! - an unreadable file is reported as [`IdentityError::Corrupt`] and left on disk
//! - an expired identity is reported as [`IdentityError::Expired`]; regenerating
//!   it means deleting the file
//!
//! The file is a PKCS#12 container so it can be imported into other tools.

mod container;

use std::path::{Path, PathBuf};

use axum_server::tls_rustls::RustlsConfig;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Identity errors
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Stored TLS identity at '{path}' is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Stored TLS identity expired on {not_after}; delete '{path}' to generate a new one")]
    Expired {
        path: PathBuf,
        not_after: DateTime<Utc>,
    },

    #[error("Stored TLS identity is not valid until {not_before}")]
    NotYetValid { not_before: DateTime<Utc> },

    #[error("Failed to generate TLS identity: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A certificate and its private key, ready to hand to the TLS acceptor.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsIdentity {
    /// X.509 certificate, DER encoded
    pub certificate_der: Vec<u8>,
    /// Private key, PKCS#8 DER encoded
    pub private_key_der: Vec<u8>,
    /// Certificate common name
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// RSA modulus size
    pub key_bits: u32,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("subject", &self.subject)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("key_bits", &self.key_bits)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// SHA-256 fingerprint of the certificate as colon separated hex.
    ///
    /// This is what the operator compares when accepting the certificate on
    /// another device.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(&self.certificate_der)
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Check that `now` falls inside the validity window.
    pub fn check_validity(&self, path: &Path, now: DateTime<Utc>) -> Result<(), IdentityError> {
        if now > self.not_after {
            return Err(IdentityError::Expired {
                path: path.to_path_buf(),
                not_after: self.not_after,
            });
        }
        if now < self.not_before {
            return Err(IdentityError::NotYetValid {
                not_before: self.not_before,
            });
        }
        Ok(())
    }

    /// Build the rustls server configuration presenting this identity.
    pub async fn rustls_config(&self) -> std::io::Result<RustlsConfig> {
        crate::tls::install_crypto_provider();
        RustlsConfig::from_der(
            vec![self.certificate_der.clone()],
            self.private_key_der.clone(),
        )
        .await
    }
}

/// Outcome of [`CertificateStore::acquire`].
#[derive(Debug, Clone)]
pub enum Acquired {
    /// Read from the persisted file
    Loaded(TlsIdentity),
    /// Generated and persisted during this call; the operator has not seen it yet
    Generated(TlsIdentity),
}

impl Acquired {
    pub fn identity(&self) -> &TlsIdentity {
        match self {
            Acquired::Loaded(identity) | Acquired::Generated(identity) => identity,
        }
    }

    pub fn into_identity(self) -> TlsIdentity {
        match self {
            Acquired::Loaded(identity) | Acquired::Generated(identity) => identity,
        }
    }

    pub fn was_generated(&self) -> bool {
        matches!(self, Acquired::Generated(_))
    }
}

/// Get-or-create store for the export listener's identity.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    path: PathBuf,
    subject: String,
}

impl CertificateStore {
    pub fn new(path: impl Into<PathBuf>, subject: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            subject: subject.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted identity, or generate and persist a new one.
    ///
    /// Blocking: key generation takes seconds. Async callers use
    /// [`CertificateStore::acquire_off_thread`].
    pub fn acquire(&self) -> Result<Acquired, IdentityError> {
        self.acquire_at(Utc::now())
    }

    /// [`CertificateStore::acquire`] with `now` as the generation time.
    pub fn acquire_at(&self, now: DateTime<Utc>) -> Result<Acquired, IdentityError> {
        if self.path.exists() {
            let bytes = std::fs::read(&self.path)?;
            let identity = container::decode(&bytes).map_err(|reason| IdentityError::Corrupt {
                path: self.path.clone(),
                reason,
            })?;
            tracing::debug!(
                path = %self.path.display(),
                fingerprint = %identity.fingerprint(),
                not_after = %identity.not_after,
                "Loaded TLS identity"
            );
            return Ok(Acquired::Loaded(identity));
        }

        tracing::info!(
            path = %self.path.display(),
            subject = %self.subject,
            "No TLS identity found, generating a new self-signed certificate"
        );

        let generated = container::generate(&self.subject, now)
            .map_err(|e| IdentityError::Generation(e.to_string()))?;
        self.persist(&generated.pkcs12_der)?;

        tracing::info!(
            path = %self.path.display(),
            fingerprint = %generated.identity.fingerprint(),
            not_before = %generated.identity.not_before,
            not_after = %generated.identity.not_after,
            "Generated TLS identity"
        );

        Ok(Acquired::Generated(generated.identity))
    }

    /// Run [`CertificateStore::acquire`] on the blocking pool.
    pub async fn acquire_off_thread(&self) -> Result<Acquired, IdentityError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.acquire())
            .await
            .map_err(|e| IdentityError::Generation(format!("identity task failed: {}", e)))?
    }

    fn persist(&self, bytes: &[u8]) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write to a sibling file first so a crash never leaves a truncated container
        let tmp = self.path.with_extension("pfx.tmp");
        write_private(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    // The per-user data directory already carries the account's ACL
    std::fs::write(path, bytes)
}
