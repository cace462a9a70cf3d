//! Package signing: a JAR signature (v1) inside the archive and an APK
//! Signing Block (v2) in front of the central directory.

pub mod cert;
pub mod cms;
#[cfg(test)]
mod der;
pub mod keystore;
#[cfg(test)]
mod pkcs7;
pub mod v1;
pub mod v2;

use anyhow::Result;
use rasn_pkix::Certificate;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{PaddingScheme, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;

pub use cert::CertificateInfo;
pub use keystore::{IdentityKind, KeyStore};

/// A private key and the certificate that vouches for it.
#[derive(Clone)]
pub struct Signer {
    key: RsaPrivateKey,
    pubkey: RsaPublicKey,
    cert: Certificate,
    cert_der: Vec<u8>,
}

impl Signer {
    /// Reads a PKCS#8 `PRIVATE KEY` and a `CERTIFICATE` from PEM text.
    pub fn new(pem: &str) -> Result<Self> {
        let pem = pem::parse_many(pem)?;
        let key = if let Some(key) = pem.iter().find(|pem| pem.tag == "PRIVATE KEY") {
            RsaPrivateKey::from_pkcs8_der(&key.contents)?
        } else {
            anyhow::bail!("no private key found");
        };
        let cert_der = if let Some(cert) = pem.iter().find(|pem| pem.tag == "CERTIFICATE") {
            cert.contents.clone()
        } else {
            anyhow::bail!("no certificate found");
        };
        Self::from_parts(key, cert_der)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::new(&std::fs::read_to_string(path)?)
    }

    fn from_parts(key: RsaPrivateKey, cert_der: Vec<u8>) -> Result<Self> {
        let cert = cert::decode::<Certificate>(&cert_der)?;
        let pubkey = RsaPublicKey::from(&key);
        anyhow::ensure!(
            cert::public_key(&cert)? == pubkey,
            "certificate does not belong to the private key"
        );
        Ok(Self {
            key,
            pubkey,
            cert,
            cert_der,
        })
    }

    /// RSA PKCS#1 v1.5 signature over the SHA-256 digest of `bytes`.
    pub fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(bytes);
        let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
        Ok(self.key.sign(padding, &digest)?)
    }

    pub fn pubkey(&self) -> &RsaPublicKey {
        &self.pubkey
    }

    pub fn cert(&self) -> &Certificate {
        &self.cert
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn certificate_info(&self) -> CertificateInfo {
        CertificateInfo::new(&self.cert, &self.cert_der)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("pubkey", &self.pubkey)
            .field("cert", &self.cert)
            .finish_non_exhaustive()
    }
}

/// Signs the unsigned archive at `path` in place with both schemes. The v1
/// entries go in first since the v2 digest covers them.
pub fn sign_package(path: &Path, signer: &Signer) -> Result<()> {
    v1::sign(path, signer)?;
    v2::sign(path, signer)?;
    log::info!("Signed `{}`", path.display());
    Ok(())
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VerifyReport {
    pub verified: bool,
    pub v1_verified: bool,
    pub v2_verified: bool,
    pub errors: Vec<String>,
}

/// Checks both signatures of the package at `path` and that they come from
/// the same certificate.
pub fn verify(path: &Path) -> VerifyReport {
    let mut report = VerifyReport::default();
    let v1_cert = match v1::verify(path) {
        Ok(cert) => {
            report.v1_verified = true;
            Some(cert)
        }
        Err(err) => {
            report.errors.push(format!("v1: {:#}", err));
            None
        }
    };
    let v2_certs = match v2::verify(path) {
        Ok(certs) => {
            report.v2_verified = true;
            certs
        }
        Err(err) => {
            report.errors.push(format!("v2: {:#}", err));
            vec![]
        }
    };
    if let Some(cert) = &v1_cert {
        if report.v2_verified && !v2_certs.contains(cert) {
            report
                .errors
                .push("v1 and v2 signatures use different certificates".to_string());
        }
    }
    report.verified = report.v1_verified && report.v2_verified && report.errors.is_empty();
    for err in &report.errors {
        log::warn!("Verification of `{}`: {}", path.display(), err);
    }
    report
}
