//! Detached PKCS#7 `SignedData` with a single signer and no signed
//! attributes, as stored in `META-INF/CERT.RSA`.

use super::cert::{self, RSA_ENCRYPTION, SHA256};
use anyhow::{Context, Result};
use rasn::types::{Any, Integer, ObjectIdentifier, OctetString, SetOf};
use rasn::{AsnType, Decode, Encode};
use rasn_pkix::{AlgorithmIdentifier, Certificate, Name};

const SIGNED_DATA: &[u32] = &[1, 2, 840, 113549, 1, 7, 2];
const DATA: &[u32] = &[1, 2, 840, 113549, 1, 7, 1];

#[derive(AsnType, Clone, Debug, Decode, Encode, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContentInfo {
    pub content_type: ObjectIdentifier,
    #[rasn(tag(explicit(0)))]
    pub content: Any,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, PartialEq, Eq, PartialOrd, Ord)]
pub struct SignedData {
    pub version: u64,
    pub digest_algorithms: SetOf<AlgorithmIdentifier>,
    pub encap_content_info: EncapsulatedContentInfo,
    #[rasn(tag(0))]
    pub certificates: Option<SetOf<Any>>,
    #[rasn(tag(1))]
    pub crls: Option<SetOf<Any>>,
    pub signer_infos: SetOf<SignerInfo>,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, PartialEq, Eq, PartialOrd, Ord)]
pub struct EncapsulatedContentInfo {
    pub content_type: ObjectIdentifier,
    /// Absent for a detached signature.
    #[rasn(tag(explicit(0)))]
    pub content: Option<OctetString>,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, PartialEq, Eq, PartialOrd, Ord)]
pub struct SignerInfo {
    pub version: u64,
    pub sid: IssuerAndSerialNumber,
    pub digest_algorithm: AlgorithmIdentifier,
    #[rasn(tag(0))]
    pub signed_attrs: Option<SetOf<Any>>,
    pub signature_algorithm: AlgorithmIdentifier,
    pub signature: OctetString,
    #[rasn(tag(1))]
    pub unsigned_attrs: Option<SetOf<Any>>,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, PartialEq, Eq, PartialOrd, Ord)]
pub struct IssuerAndSerialNumber {
    pub issuer: Name,
    pub serial_number: Integer,
}

impl IssuerAndSerialNumber {
    fn of(cert: &Certificate) -> Self {
        Self {
            issuer: cert.tbs_certificate.issuer.clone(),
            serial_number: cert.tbs_certificate.serial_number.clone(),
        }
    }
}

/// Wraps `signature` (RSA PKCS#1 v1.5 over SHA-256 of the signed file) and
/// the signer's certificate, given both decoded and as DER.
pub fn encode_signed_data(
    cert: &Certificate,
    cert_der: &[u8],
    signature: &[u8],
) -> Result<Vec<u8>> {
    let signer_info = SignerInfo {
        version: 1,
        sid: IssuerAndSerialNumber::of(cert),
        digest_algorithm: cert::algorithm(SHA256),
        signed_attrs: None,
        signature_algorithm: cert::algorithm(RSA_ENCRYPTION),
        signature: OctetString::copy_from_slice(signature),
        unsigned_attrs: None,
    };
    let signed_data = SignedData {
        version: 1,
        digest_algorithms: SetOf::from([cert::algorithm(SHA256)]),
        encap_content_info: EncapsulatedContentInfo {
            content_type: cert::oid(DATA),
            content: None,
        },
        certificates: Some(SetOf::from([Any::new(cert_der.to_vec())])),
        crls: None,
        signer_infos: SetOf::from([signer_info]),
    };
    cert::encode(&ContentInfo {
        content_type: cert::oid(SIGNED_DATA),
        content: Any::new(cert::encode(&signed_data)?),
    })
}

/// The signer's certificate and signature out of a `SignedData` blob.
#[derive(Debug)]
pub struct SignedParts {
    pub certificate: Certificate,
    pub certificate_der: Vec<u8>,
    pub signature: Vec<u8>,
}

pub fn decode_signed_data(data: &[u8]) -> Result<SignedParts> {
    let content_info = cert::decode::<ContentInfo>(data).context("malformed ContentInfo")?;
    anyhow::ensure!(
        content_info.content_type == cert::oid(SIGNED_DATA),
        "not a SignedData blob"
    );
    let signed_data = cert::decode::<SignedData>(content_info.content.as_bytes())
        .context("malformed SignedData")?;
    anyhow::ensure!(
        signed_data.signer_infos.len() == 1,
        "expected exactly one signer"
    );
    let signer_info = signed_data
        .signer_infos
        .into_iter()
        .next()
        .context("SignedData carries no signer")?;
    anyhow::ensure!(
        signer_info.signed_attrs.is_none(),
        "signed attributes are not supported"
    );
    for der in signed_data.certificates.unwrap_or_default() {
        let certificate = cert::decode::<Certificate>(der.as_bytes())?;
        if IssuerAndSerialNumber::of(&certificate) == signer_info.sid {
            return Ok(SignedParts {
                certificate,
                certificate_der: der.into_bytes(),
                signature: signer_info.signature.to_vec(),
            });
        }
    }
    anyhow::bail!("SignedData carries no certificate for its signer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::sign::fixture::debug_signer;

    #[test]
    fn decodes_what_it_encodes() {
        let signer = debug_signer();
        let blob = encode_signed_data(signer.cert(), signer.cert_der(), b"signature bytes").unwrap();
        let parts = decode_signed_data(&blob).unwrap();
        assert_eq!(parts.certificate_der, signer.cert_der());
        assert_eq!(&parts.certificate, signer.cert());
        assert_eq!(parts.signature, b"signature bytes");
    }

    #[test]
    fn is_detached_and_names_the_signer() {
        let signer = debug_signer();
        let blob = encode_signed_data(signer.cert(), signer.cert_der(), &[0; 4]).unwrap();
        let content_info = cert::decode::<ContentInfo>(&blob).unwrap();
        let signed_data = cert::decode::<SignedData>(content_info.content.as_bytes()).unwrap();
        assert_eq!(signed_data.version, 1);
        assert_eq!(signed_data.encap_content_info.content, None);
        assert_eq!(signed_data.encap_content_info.content_type, cert::oid(DATA));
        let signer_info = signed_data.signer_infos.iter().next().unwrap();
        assert_eq!(signer_info.sid.issuer, signer.cert().tbs_certificate.issuer);
        assert_eq!(
            signer_info.sid.serial_number,
            signer.cert().tbs_certificate.serial_number
        );
        assert_eq!(signer_info.digest_algorithm, cert::algorithm(SHA256));
    }

    #[test]
    fn rejects_other_content() {
        let blob = cert::encode(&ContentInfo {
            content_type: cert::oid(DATA),
            content: Any::new(vec![0x05, 0x00]),
        })
        .unwrap();
        assert!(decode_signed_data(&blob).is_err());
        assert!(decode_signed_data(&[0x30, 0x05, 0x00]).is_err());
    }

    #[test]
    fn rejects_a_signer_without_its_certificate() {
        let signer = debug_signer();
        let blob = encode_signed_data(signer.cert(), signer.cert_der(), &[1; 4]).unwrap();
        let content_info = cert::decode::<ContentInfo>(&blob).unwrap();
        let mut signed_data = cert::decode::<SignedData>(content_info.content.as_bytes()).unwrap();
        signed_data.certificates = None;
        let blob = cert::encode(&ContentInfo {
            content_type: cert::oid(SIGNED_DATA),
            content: Any::new(cert::encode(&signed_data).unwrap()),
        })
        .unwrap();
        assert!(decode_signed_data(&blob).is_err());
    }
}
