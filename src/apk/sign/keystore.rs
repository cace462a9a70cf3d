use super::cert::{self, CertificateInfo, Subject};
use super::Signer;
use crate::core::config::SigningConfig;
use anyhow::{Context, Result};
use pem::Pem;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// File holding the generated signing identity inside the key store directory.
pub const KEY_FILE: &str = "signing.pem";
/// File holding an imported identity. It wins over the generated one.
pub const CUSTOM_KEY_FILE: &str = "custom.pem";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdentityKind {
    Generated,
    Custom,
}

/// Directory-backed signing identity, created on first use and reused after.
pub struct KeyStore {
    config: SigningConfig,
    signer: Mutex<Option<Arc<Signer>>>,
}

impl KeyStore {
    pub fn new(config: SigningConfig) -> Self {
        Self {
            config,
            signer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.config.keystore_dir.join(KEY_FILE)
    }

    pub fn custom_path(&self) -> PathBuf {
        self.config.keystore_dir.join(CUSTOM_KEY_FILE)
    }

    pub fn kind(&self) -> IdentityKind {
        if self.custom_path().exists() {
            IdentityKind::Custom
        } else {
            IdentityKind::Generated
        }
    }

    fn active_path(&self) -> PathBuf {
        match self.kind() {
            IdentityKind::Custom => self.custom_path(),
            IdentityKind::Generated => self.path(),
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Arc<Signer>>>> {
        self.signer
            .lock()
            .map_err(|_| anyhow::anyhow!("key store lock poisoned"))
    }

    /// Loads the identity, provisioning it first if the store is empty. An
    /// imported identity takes precedence over the generated one.
    pub fn get_or_create(&self) -> Result<Arc<Signer>> {
        let mut slot = self.slot()?;
        if let Some(signer) = slot.as_ref() {
            return Ok(signer.clone());
        }
        let path = self.active_path();
        let signer = if path.exists() {
            Signer::from_path(&path)
                .with_context(|| format!("While loading signing key `{}`", path.display()))?
        } else {
            self.provision()
                .with_context(|| format!("While provisioning signing key `{}`", path.display()))?
        };
        let signer = Arc::new(signer);
        *slot = Some(signer.clone());
        Ok(signer)
    }

    fn provision(&self) -> Result<Signer> {
        log::info!("Generating a {} bit signing key", self.config.key_bits);
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), self.config.key_bits)?;
        let cert = cert::self_signed(
            &key,
            &Subject::from_config(&self.config),
            self.config.serial,
            self.config.validity_years,
            chrono::Utc::now(),
        )?;
        let pem = pem::encode_many(&[
            Pem {
                tag: "PRIVATE KEY".to_string(),
                contents: key.to_pkcs8_der()?.as_bytes().to_vec(),
            },
            Pem {
                tag: "CERTIFICATE".to_string(),
                contents: cert,
            },
        ]);
        write_private(&self.path(), &pem)?;
        Signer::new(&pem)
    }

    /// Makes the PEM identity at `source` (a PKCS#8 `PRIVATE KEY` and its
    /// `CERTIFICATE`) the one used for signing.
    pub fn import(&self, source: &Path) -> Result<Arc<Signer>> {
        let pem = std::fs::read_to_string(source)
            .with_context(|| format!("While reading `{}`", source.display()))?;
        let signer = Signer::new(&pem)
            .with_context(|| format!("`{}` is not a usable signing identity", source.display()))?;
        let mut slot = self.slot()?;
        write_private(&self.custom_path(), &pem)?;
        let signer = Arc::new(signer);
        *slot = Some(signer.clone());
        log::info!("Imported signing identity from `{}`", source.display());
        Ok(signer)
    }

    /// Copies the identity in use to `target`, readable by the owner only.
    pub fn export(&self, target: &Path) -> Result<()> {
        self.get_or_create()?;
        let pem = std::fs::read_to_string(self.active_path())?;
        write_private(target, &pem)
            .with_context(|| format!("While exporting to `{}`", target.display()))?;
        log::info!("Exported {:?} signing identity to `{}`", self.kind(), target.display());
        Ok(())
    }

    /// Drops the imported identity, falling back to the generated one.
    /// Returns false when there was nothing to remove.
    pub fn remove_custom(&self) -> Result<bool> {
        let mut slot = self.slot()?;
        let path = self.custom_path();
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("While removing `{}`", path.display()))?;
        *slot = None;
        log::info!("Removed imported signing identity");
        Ok(true)
    }

    pub fn certificate_info(&self) -> Result<CertificateInfo> {
        Ok(self.get_or_create()?.certificate_info())
    }
}

/// Atomically replaces `path` with `contents`, mode 0600 on unix.
fn write_private(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut file = NamedTempFile::new_in(dir)?;
    restrict_to_owner(file.as_file())?;
    file.write_all(contents.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(file: &std::fs::File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_file: &std::fs::File) -> Result<()> {
    Ok(())
}
