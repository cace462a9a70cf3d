//! Byte-level assembly of the signing certificate and `SignedData`, written
//! against the DER rules directly. The typed encoders in `cert` and `cms`
//! must produce exactly these bytes.

use super::cert::Subject;
use super::der::{tag, Node, Tlv};
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Months, Utc};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{PaddingScheme, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

const OID_SHA256_WITH_RSA: &str = "1.2.840.113549.1.1.11";
const OID_COUNTRY: &str = "2.5.4.6";
const OID_ORGANIZATION: &str = "2.5.4.10";
const OID_COMMON_NAME: &str = "2.5.4.3";
const OID_SIGNED_DATA: &str = "1.2.840.113549.1.7.2";
const OID_DATA: &str = "1.2.840.113549.1.7.1";
const OID_SHA256: &str = "2.16.840.1.101.3.4.2.1";
const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";

fn name(subject: &Subject) -> Node {
    let rdn = |oid, value| Node::Set(vec![Node::Sequence(vec![Node::Oid(oid), value])]);
    Node::Sequence(vec![
        rdn(OID_COUNTRY, Node::PrintableString(subject.country.clone())),
        rdn(OID_ORGANIZATION, Node::Utf8String(subject.organization.clone())),
        rdn(OID_COMMON_NAME, Node::Utf8String(subject.common_name.clone())),
    ])
}

fn time(t: DateTime<Utc>) -> Node {
    if t.year() < 2050 {
        Node::UtcTime(t.format("%y%m%d%H%M%SZ").to_string())
    } else {
        Node::GeneralizedTime(t.format("%Y%m%d%H%M%SZ").to_string())
    }
}

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
    let tbs = Node::Sequence(vec![
        Node::Context(0, vec![Node::small_integer(2)]),
        Node::small_integer(serial),
        Node::algorithm(OID_SHA256_WITH_RSA),
        name(subject),
        Node::Sequence(vec![time(not_before), time(not_after)]),
        name(subject),
        Node::Raw(spki.as_ref().to_vec()),
    ])
    .encode()?;
    let digest = Sha256::digest(&tbs);
    let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
    let signature = key.sign(padding, &digest)?;
    Node::Sequence(vec![
        Node::Raw(tbs),
        Node::algorithm(OID_SHA256_WITH_RSA),
        Node::BitString(signature),
    ])
    .encode()
}

/// The fields of a certificate the signature formats refer to, as raw DER.
#[derive(Debug)]
pub struct CertFields<'a> {
    pub serial: Tlv<'a>,
    pub issuer: Tlv<'a>,
    pub subject_public_key_info: Tlv<'a>,
}

impl<'a> CertFields<'a> {
    pub fn parse(cert: &'a [u8]) -> Result<Self> {
        let cert = Tlv::parse_single(cert)?.expect(tag::SEQUENCE)?;
        let parts = cert.children()?;
        let tbs = parts
            .first()
            .context("empty certificate")?
            .expect(tag::SEQUENCE)?;
        let mut fields = tbs.children()?.into_iter();
        let mut next = || fields.next().context("truncated certificate");
        let mut serial = next()?;
        if serial.tag == tag::CONTEXT_0 {
            serial = next()?;
        }
        let serial = serial.expect(tag::INTEGER)?;
        let _signature = next()?;
        let issuer = next()?.expect(tag::SEQUENCE)?;
        let _validity = next()?;
        let _subject = next()?;
        let subject_public_key_info = next()?.expect(tag::SEQUENCE)?;
        Ok(Self {
            serial,
            issuer,
            subject_public_key_info,
        })
    }

    pub fn public_key(&self) -> Result<RsaPublicKey> {
        Ok(RsaPublicKey::from_public_key_der(self.subject_public_key_info.raw)?)
    }
}

pub fn encode_signed_data(cert: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
    let fields = CertFields::parse(cert).context("While reading the signing certificate")?;
    let signer_info = Node::Sequence(vec![
        Node::small_integer(1),
        Node::Sequence(vec![
            Node::Raw(fields.issuer.raw.to_vec()),
            Node::Raw(fields.serial.raw.to_vec()),
        ]),
        Node::algorithm(OID_SHA256),
        Node::algorithm(OID_RSA_ENCRYPTION),
        Node::OctetString(signature.to_vec()),
    ]);
    let signed_data = Node::Sequence(vec![
        Node::small_integer(1),
        Node::Set(vec![Node::algorithm(OID_SHA256)]),
        Node::Sequence(vec![Node::Oid(OID_DATA)]),
        Node::Context(0, vec![Node::Raw(cert.to_vec())]),
        Node::Set(vec![signer_info]),
    ]);
    Node::Sequence(vec![
        Node::Oid(OID_SIGNED_DATA),
        Node::Context(0, vec![signed_data]),
    ])
    .encode()
}

/// Certificate and signature pulled out of a `SignedData` blob.
#[derive(Debug)]
pub struct SignedDataParts<'a> {
    pub certificate: &'a [u8],
    pub signature: &'a [u8],
}

pub fn decode_signed_data(data: &[u8]) -> Result<SignedDataParts<'_>> {
    let content_info = Tlv::parse_single(data)?.expect(tag::SEQUENCE)?.children()?;
    anyhow::ensure!(content_info.len() == 2, "malformed ContentInfo");
    let oid = Node::Oid(OID_SIGNED_DATA).encode()?;
    anyhow::ensure!(content_info[0].raw == oid.as_slice(), "not a SignedData blob");
    let signed_data = Tlv::parse_single(content_info[1].expect(tag::CONTEXT_0)?.content)?
        .expect(tag::SEQUENCE)?
        .children()?;
    let certificates = signed_data
        .iter()
        .find(|tlv| tlv.tag == tag::CONTEXT_0)
        .context("SignedData carries no certificate")?;
    let (certificate, _) = Tlv::parse(certificates.content)?;
    let signer_infos = signed_data
        .last()
        .context("SignedData carries no signer")?
        .expect(tag::SET)?
        .children()?;
    anyhow::ensure!(signer_infos.len() == 1, "expected exactly one signer");
    let signer_info = signer_infos[0].expect(tag::SEQUENCE)?.children()?;
    let signature = signer_info
        .last()
        .context("empty SignerInfo")?
        .expect(tag::OCTET_STRING)?;
    Ok(SignedDataParts {
        certificate: certificate.raw,
        signature: signature.content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::sign::fixture::debug_signer;
    use crate::apk::sign::{cert, cms};
    use crate::core::config::SigningConfig;
    use chrono::TimeZone;
    use rsa::pkcs8::DecodePrivateKey;

    fn debug_key() -> RsaPrivateKey {
        let pems = pem::parse_many(include_str!("debug.pem")).unwrap();
        let key = pems.iter().find(|p| p.tag == "PRIVATE KEY").unwrap();
        RsaPrivateKey::from_pkcs8_der(&key.contents).unwrap()
    }

    #[test]
    fn certificates_match_the_typed_encoder() {
        let key = debug_key();
        let subject = cert::Subject::from_config(&SigningConfig::default());
        for (serial, years, start) in [
            (1, 30, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            (0x80, 1, Utc.with_ymd_and_hms(2049, 12, 31, 23, 59, 59).unwrap()),
            (u64::MAX, 50, Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap()),
        ] {
            assert_eq!(
                cert::self_signed(&key, &subject, serial, years, start).unwrap(),
                self_signed(&key, &subject, serial, years, start).unwrap(),
                "serial {serial:#x} from {start}"
            );
        }
    }

    #[test]
    fn signed_data_matches_the_typed_encoder() {
        let signer = debug_signer();
        for signature in [vec![0x5a; 256], vec![0; 256], b"short".to_vec()] {
            let typed =
                cms::encode_signed_data(signer.cert(), signer.cert_der(), &signature).unwrap();
            let manual = encode_signed_data(signer.cert_der(), &signature).unwrap();
            assert_eq!(typed, manual);

            let parts = decode_signed_data(&typed).unwrap();
            assert_eq!(parts.certificate, signer.cert_der());
            assert_eq!(parts.signature, signature.as_slice());
        }
    }

    #[test]
    fn typed_decoder_reads_hand_assembled_blobs() {
        let key = debug_key();
        let subject = cert::Subject::from_config(&SigningConfig::default());
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let der = self_signed(&key, &subject, 9, 2, start).unwrap();
        let blob = encode_signed_data(&der, b"sig").unwrap();

        let parts = cms::decode_signed_data(&blob).unwrap();
        assert_eq!(parts.certificate_der, der);
        assert_eq!(parts.signature, b"sig");
        let fields = CertFields::parse(&der).unwrap();
        assert_eq!(fields.serial.content, [9]);
        assert_eq!(
            cert::public_key(&parts.certificate).unwrap(),
            fields.public_key().unwrap()
        );
    }

    #[test]
    fn rejects_other_content() {
        let blob = Node::Sequence(vec![Node::Oid(OID_DATA), Node::Context(0, vec![Node::Null])])
            .encode()
            .unwrap();
        assert!(decode_signed_data(&blob).is_err());
        assert!(decode_signed_data(&[0x30, 0x05, 0x00]).is_err());
    }
}
