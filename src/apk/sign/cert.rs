//! Self-issued X.509 certificates for the signing identity.

use crate::core::config::SigningConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Months, Utc};
use rasn::types::{Any, Implicit, Integer, ObjectIdentifier, OctetString, PrintableString, SetOf, Tag};
use rasn::{AsnType, Decode, Encode};
use rasn_pkix::{
    AlgorithmIdentifier, AttributeTypeAndValue, Certificate, Name, SubjectPublicKeyInfo,
    TbsCertificate, Time, Validity, Version,
};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::{PaddingScheme, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::borrow::Cow;

pub const SHA256_WITH_RSA: &[u32] = &[1, 2, 840, 113549, 1, 1, 11];
pub const RSA_ENCRYPTION: &[u32] = &[1, 2, 840, 113549, 1, 1, 1];
pub const SHA256: &[u32] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];
const COUNTRY: &[u32] = &[2, 5, 4, 6];
const ORGANIZATION: &[u32] = &[2, 5, 4, 10];
const COMMON_NAME: &[u32] = &[2, 5, 4, 3];

pub fn oid(arcs: &'static [u32]) -> ObjectIdentifier {
    ObjectIdentifier::new_unchecked(Cow::Borrowed(arcs))
}

/// `AlgorithmIdentifier` with NULL parameters.
pub fn algorithm(arcs: &'static [u32]) -> AlgorithmIdentifier {
    AlgorithmIdentifier {
        algorithm: oid(arcs),
        parameters: Some(Any::new(vec![0x05, 0x00])),
    }
}

pub fn encode<T: Encode>(value: &T) -> Result<Vec<u8>> {
    rasn::der::encode(value).map_err(|err| anyhow::anyhow!("DER encoding failed: {}", err))
}

pub fn decode<T: Decode>(der: &[u8]) -> Result<T> {
    rasn::der::decode(der).map_err(|err| anyhow::anyhow!("DER decoding failed: {}", err))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subject {
    pub common_name: String,
    pub organization: String,
    pub country: String,
}

impl Subject {
    pub fn from_config(config: &SigningConfig) -> Self {
        Self {
            common_name: config.subject_common_name.clone(),
            organization: config.subject_organization.clone(),
            country: config.subject_country.clone(),
        }
    }

    fn name(&self) -> Result<Name> {
        anyhow::ensure!(
            self.country.chars().all(is_printable),
            "`{}` is not a PrintableString",
            self.country
        );
        let rdn = |arcs, value: Vec<u8>| {
            SetOf::from([AttributeTypeAndValue {
                r#type: oid(arcs),
                value: Any::new(value),
            }])
        };
        Ok(Name::RdnSequence(vec![
            rdn(COUNTRY, encode(&PrintableString::new(self.country.clone()))?),
            rdn(ORGANIZATION, encode(&self.organization)?),
            rdn(COMMON_NAME, encode(&self.common_name)?),
        ]))
    }
}

fn is_printable(c: char) -> bool {
    c.is_ascii_alphanumeric() || " '()+,-./:=?".contains(c)
}

/// UTCTime through 2049, GeneralizedTime after.
fn time(t: DateTime<Utc>) -> Time {
    if t.year() < 2050 {
        Time::Utc(t)
    } else {
        Time::General(t.into())
    }
}

/// Tags pre-packed BIT STRING content, unused-bit count first. rasn drops
/// trailing zero bytes of a `BitString`, which would truncate signatures.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct BitStringTag;

impl AsnType for BitStringTag {
    const TAG: Tag = Tag::BIT_STRING;
}

type PackedBits = Implicit<BitStringTag, OctetString>;

fn packed_bits(bytes: &[u8]) -> PackedBits {
    let mut content = Vec::with_capacity(bytes.len() + 1);
    content.push(0);
    content.extend_from_slice(bytes);
    Implicit::new(OctetString::from(content))
}

/// `Certificate` with the TBS part kept as its exact signed bytes.
#[derive(AsnType, Encode)]
struct SignedCertificate {
    tbs_certificate: Any,
    signature_algorithm: AlgorithmIdentifier,
    signature_value: PackedBits,
}

/// Builds a v3 certificate for `key` whose issuer is its own subject,
/// signed with SHA-256 RSA. Returns the DER encoding.
pub fn self_signed(
    key: &RsaPrivateKey,
    subject: &Subject,
    serial: u64,
    validity_years: u32,
    not_before: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let not_after = not_before
        .checked_add_months(Months::new(validity_years.saturating_mul(12)))
        .context("Certificate validity overflows the calendar")?;
    let spki = RsaPublicKey::from(key).to_public_key_der()?;
    let name = subject.name()?;
    let tbs = TbsCertificate {
        version: Version::V3,
        serial_number: Integer::from(serial),
        signature: algorithm(SHA256_WITH_RSA),
        issuer: name.clone(),
        validity: Validity {
            not_before: time(not_before),
            not_after: time(not_after),
        },
        subject: name,
        subject_public_key_info: decode::<SubjectPublicKeyInfo>(spki.as_ref())?,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: None,
    };
    let tbs = encode(&tbs)?;
    let digest = Sha256::digest(&tbs);
    let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
    let signature = key.sign(padding, &digest)?;
    encode(&SignedCertificate {
        tbs_certificate: Any::new(tbs),
        signature_algorithm: algorithm(SHA256_WITH_RSA),
        signature_value: packed_bits(&signature),
    })
}

/// The RSA key a certificate vouches for.
pub fn public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let info = &cert.tbs_certificate.subject_public_key_info;
    anyhow::ensure!(
        info.algorithm.algorithm == oid(RSA_ENCRYPTION),
        "certificate key is not an RSA key"
    );
    Ok(RsaPublicKey::from_pkcs1_der(
        info.subject_public_key.as_raw_slice(),
    )?)
}

/// Human-readable summary of a signing certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    /// Lowercase hex.
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Colon separated uppercase hex of the SHA-256 over the DER encoding.
    pub sha256_fingerprint: String,
}

impl CertificateInfo {
    pub fn new(cert: &Certificate, der: &[u8]) -> Self {
        let tbs = &cert.tbs_certificate;
        let fingerprint = Sha256::digest(der)
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self {
            subject: display_name(&tbs.subject),
            issuer: display_name(&tbs.issuer),
            serial: format!("{:x}", tbs.serial_number),
            not_before: utc(&tbs.validity.not_before),
            not_after: utc(&tbs.validity.not_after),
            sha256_fingerprint: fingerprint,
        }
    }
}

impl std::fmt::Display for CertificateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Subject: {}", self.subject)?;
        writeln!(f, "Issuer: {}", self.issuer)?;
        writeln!(f, "Serial: {}", self.serial)?;
        writeln!(f, "Valid: {} - {}", self.not_before, self.not_after)?;
        write!(f, "SHA-256: {}", self.sha256_fingerprint)
    }
}

fn utc(time: &Time) -> DateTime<Utc> {
    match time {
        Time::Utc(t) => *t,
        Time::General(t) => t.with_timezone(&Utc),
    }
}

/// Most specific attribute first, as `keytool` prints it.
fn display_name(name: &Name) -> String {
    let Name::RdnSequence(rdns) = name;
    rdns.iter()
        .rev()
        .flat_map(|rdn| rdn.iter())
        .map(|attr| {
            let arcs: &[u32] = attr.r#type.as_ref();
            let key = match arcs {
                [2, 5, 4, 3] => "CN".to_string(),
                [2, 5, 4, 6] => "C".to_string(),
                [2, 5, 4, 7] => "L".to_string(),
                [2, 5, 4, 8] => "ST".to_string(),
                [2, 5, 4, 10] => "O".to_string(),
                [2, 5, 4, 11] => "OU".to_string(),
                _ => arcs.iter().map(u32::to_string).collect::<Vec<_>>().join("."),
            };
            format!("{}={}", key, attribute_text(attr.value.as_bytes()))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn attribute_text(value: &[u8]) -> String {
    let text = match value.first() {
        Some(0x0c) => decode::<String>(value).ok(),
        Some(0x13) => decode::<PrintableString>(value).ok().map(|s| s.value),
        Some(0x16) => decode::<rasn::types::Ia5String>(value).ok().map(|s| s.value),
        _ => None,
    };
    text.unwrap_or_else(|| {
        let hex: String = value.iter().map(|b| format!("{:02x}", b)).collect();
        format!("#{}", hex)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::PublicKey;

    fn debug_key() -> RsaPrivateKey {
        let pems = pem::parse_many(include_str!("debug.pem")).unwrap();
        let key = pems.iter().find(|p| p.tag == "PRIVATE KEY").unwrap();
        RsaPrivateKey::from_pkcs8_der(&key.contents).unwrap()
    }

    fn subject() -> Subject {
        Subject::from_config(&SigningConfig::default())
    }

    #[test]
    fn builds_a_decodable_certificate() {
        let key = debug_key();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let der = self_signed(&key, &subject(), 1, 30, start).unwrap();
        let cert = decode::<Certificate>(&der).unwrap();
        let tbs = &cert.tbs_certificate;
        assert_eq!(tbs.version, Version::V3);
        assert_eq!(tbs.serial_number, Integer::from(1u64));
        assert_eq!(tbs.issuer, tbs.subject);
        assert_eq!(public_key(&cert).unwrap(), RsaPublicKey::from(&key));
        assert_eq!(tbs.validity.not_before, Time::Utc(start));
    }

    #[test]
    fn long_validity_switches_to_generalized_time() {
        let start = Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap();
        assert_eq!(time(start), Time::Utc(start));
        let end = start.checked_add_months(Months::new(30 * 12)).unwrap();
        assert!(matches!(time(end), Time::General(_)));

        let der = self_signed(&debug_key(), &subject(), 1, 30, start).unwrap();
        // 20560228120000Z
        assert!(der.windows(17).any(|w| w == b"\x18\x0f20560228120000Z"));
        let cert = decode::<Certificate>(&der).unwrap();
        assert_eq!(utc(&cert.tbs_certificate.validity.not_after), end);
    }

    #[test]
    fn certificate_signature_verifies() {
        let key = debug_key();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for serial in 1..4 {
            let der = self_signed(&key, &subject(), serial, 1, start).unwrap();
            let cert = decode::<Certificate>(&der).unwrap();
            let tbs = encode(&cert.tbs_certificate).unwrap();
            let signature = cert.signature_value.as_raw_slice();
            assert_eq!(signature.len(), 256);
            RsaPublicKey::from(&key)
                .verify(
                    PaddingScheme::new_pkcs1v15_sign::<Sha256>(),
                    &Sha256::digest(&tbs),
                    signature,
                )
                .unwrap();
        }
    }

    #[test]
    fn packed_bits_keep_trailing_zeros() {
        let der = encode(&packed_bits(&[0xab, 0x00, 0x00])).unwrap();
        assert_eq!(der, [0x03, 0x04, 0x00, 0xab, 0x00, 0x00]);
    }

    #[test]
    fn rejects_non_printable_country() {
        let subject = Subject {
            country: "Ü".into(),
            ..subject()
        };
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(self_signed(&debug_key(), &subject, 1, 1, start).is_err());
    }

    #[test]
    fn summarizes_the_certificate() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let der = self_signed(&debug_key(), &subject(), 0x1f, 2, start).unwrap();
        let info = CertificateInfo::new(&decode(&der).unwrap(), &der);
        let config = SigningConfig::default();
        assert_eq!(
            info.subject,
            format!(
                "CN={}, O={}, C={}",
                config.subject_common_name, config.subject_organization, config.subject_country
            )
        );
        assert_eq!(info.issuer, info.subject);
        assert_eq!(info.serial, "1f");
        assert_eq!(info.not_before, start);
        assert_eq!(info.not_after, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(info.sha256_fingerprint.len(), 32 * 3 - 1);
        assert!(info.to_string().contains("Serial: 1f"));
    }
}
