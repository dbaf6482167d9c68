//! Service credential kept encrypted on disk.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"ABC1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + NONCE_LEN;
const KDF_CONTEXT: &str = "alias-bridge 2024 service credential v1";

pub const DATABASE_URL_VAR: &str = "ALIAS_BRIDGE_DATABASE_URL";
pub const AUTH_TOKEN_VAR: &str = "ALIAS_BRIDGE_AUTH_TOKEN";

/// What the daemon needs to reach the hosted store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCredential {
    pub database_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredential")
            .field("database_url", &self.database_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save_credential(&self, credential: &ServiceCredential) -> Result<()>;

    /// `None` when nothing has been stored yet.
    async fn load_credential(&self) -> Result<Option<ServiceCredential>>;
}

/// Credential file sealed with ChaCha20-Poly1305.
///
/// Layout: `ABC1 | salt[16] | nonce[12] | ciphertext`. The key is derived with
/// BLAKE3 from the salt and the installation id, and every write draws a new
/// salt and nonce.
pub struct SealedCredentialFile {
    path: PathBuf,
    installation_id: Vec<u8>,
}

impl SealedCredentialFile {
    pub fn new(path: impl Into<PathBuf>, installation_id: impl AsRef<[u8]>) -> Self {
        Self {
            path: path.into(),
            installation_id: installation_id.as_ref().to_vec(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cipher(&self, salt: &[u8]) -> ChaCha20Poly1305 {
        let material = [salt, self.installation_id.as_slice()].concat();
        let key = blake3::derive_key(KDF_CONTEXT, &material);
        ChaCha20Poly1305::new(Key::from_slice(&key))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher(&salt)
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Credential("encryption failed".into()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < HEADER_LEN || &sealed[..MAGIC.len()] != MAGIC {
            return Err(Error::Credential(format!(
                "{} is not a sealed credential file",
                self.path.display()
            )));
        }
        let (salt, rest) = sealed[MAGIC.len()..].split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        self.cipher(salt)
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                Error::Credential(format!(
                    "{} was tampered with or sealed for another installation",
                    self.path.display()
                ))
            })
    }

    fn persist_error(&self, source: std::io::Error) -> Error {
        Error::LocalPersist {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CredentialStore for SealedCredentialFile {
    async fn save_credential(&self, credential: &ServiceCredential) -> Result<()> {
        let plaintext = serde_json::to_vec(credential)?;
        let sealed = self.seal(&plaintext)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.persist_error(e))?;
        }
        let tmp = self.path.with_extension("enc.tmp");
        tokio::fs::write(&tmp, &sealed)
            .await
            .map_err(|e| self.persist_error(e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| self.persist_error(e))?;
        }
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.persist_error(e))?;
        debug!(path = %self.path.display(), "credential sealed");
        Ok(())
    }

    async fn load_credential(&self) -> Result<Option<ServiceCredential>> {
        let sealed = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.persist_error(e)),
        };
        let plaintext = self.open(&sealed)?;
        let credential = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Credential(format!("sealed credential is not valid: {e}")))?;
        Ok(Some(credential))
    }
}

/// Returns the stored credential, seeding the store from `lookup` (normally
/// the process environment) the first time.
pub async fn ensure_credential<F>(store: &dyn CredentialStore, lookup: F) -> Result<Option<ServiceCredential>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(existing) = store.load_credential().await? {
        return Ok(Some(existing));
    }
    let Some(database_url) = lookup(DATABASE_URL_VAR).filter(|u| !u.trim().is_empty()) else {
        return Ok(None);
    };
    let credential = ServiceCredential {
        database_url,
        auth_token: lookup(AUTH_TOKEN_VAR).filter(|t| !t.is_empty()),
    };
    store.save_credential(&credential).await?;
    info!(database_url = %credential.database_url, "stored service credential from environment");
    Ok(Some(credential))
}
