//! JAR signing: `META-INF/MANIFEST.MF`, `CERT.SF` and `CERT.RSA`.

use super::{cert, cms, Signer};
use crate::apk::archive::is_signature_entry;
use anyhow::{Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use rsa::{PaddingScheme, PublicKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_MF: &str = "META-INF/MANIFEST.MF";
pub const CERT_SF: &str = "META-INF/CERT.SF";
pub const CERT_RSA: &str = "META-INF/CERT.RSA";

const CREATED_BY: &str = "1.0 (Android)";
const DIGEST_ATTR: &str = "SHA-256-Digest";
const MANIFEST_DIGEST_ATTR: &str = "SHA-256-Digest-Manifest";
/// Tells the installer a v2 signature must be present, so stripping it is
/// detected.
const APK_SIGNED_ATTR: &str = "X-Android-APK-Signed";
const MAX_LINE: usize = 72;

fn digest_b64(data: &[u8]) -> String {
    BASE64_STANDARD.encode(Sha256::digest(data))
}

/// Writes `key: value`, wrapping at 72 bytes with continuation lines that
/// start with a space.
fn write_attribute(out: &mut Vec<u8>, key: &str, value: &str) {
    let line = format!("{}: {}", key, value);
    let bytes = line.as_bytes();
    let first = bytes.len().min(MAX_LINE);
    out.extend_from_slice(&bytes[..first]);
    for chunk in bytes[first..].chunks(MAX_LINE - 1) {
        out.extend_from_slice(b"\r\n ");
        out.extend_from_slice(chunk);
    }
    out.extend_from_slice(b"\r\n");
}

fn section(attributes: &[(&str, &str)]) -> Vec<u8> {
    let mut out = vec![];
    for (key, value) in attributes {
        write_attribute(&mut out, key, value);
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// One blank-line terminated section of a manifest file.
#[derive(Debug)]
struct Section<'a> {
    raw: &'a [u8],
    attributes: BTreeMap<String, String>,
}

impl Section<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

fn parse_sections(data: &[u8]) -> Result<Vec<Section<'_>>> {
    let mut sections = vec![];
    let mut rest = data;
    while !rest.is_empty() {
        let end = rest
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map_or(rest.len(), |pos| pos + 4);
        let (raw, next) = rest.split_at(end);
        let text = String::from_utf8(raw.to_vec())
            .context("manifest section is not UTF-8")?
            .replace("\r\n ", "");
        let mut attributes = BTreeMap::new();
        for line in text.split("\r\n").filter(|line| !line.is_empty()) {
            let (key, value) = line
                .split_once(": ")
                .with_context(|| format!("malformed manifest line `{}`", line))?;
            attributes.insert(key.to_string(), value.to_string());
        }
        sections.push(Section { raw, attributes });
        rest = next;
    }
    Ok(sections)
}

/// Each named `CERT.SF` section must carry the digest of the matching
/// manifest section, raw bytes including its blank line.
fn check_section_digests(manifest: &[Section<'_>], signature_file: &[Section<'_>]) -> Result<()> {
    let digests: BTreeMap<&str, String> = manifest
        .iter()
        .skip(1)
        .filter_map(|section| Some((section.get("Name")?, digest_b64(section.raw))))
        .collect();
    for section in signature_file.iter().skip(1) {
        let name = section
            .get("Name")
            .context("CERT.SF section without a name")?;
        anyhow::ensure!(
            section.get(DIGEST_ATTR) == digests.get(name).map(String::as_str),
            "CERT.SF digest of `{}` does not match its manifest section",
            name
        );
    }
    Ok(())
}

/// Names and contents digests of every file entry to be signed.
fn entry_digests(archive: &mut ZipArchive<File>) -> Result<Vec<(String, String)>> {
    let mut digests = vec![];
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || is_signature_entry(entry.name()) {
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("While reading `{}`", entry.name()))?;
        digests.push((entry.name().to_string(), digest_b64(&data)));
    }
    Ok(digests)
}

/// Appends the three signature entries to the archive at `path`.
pub fn sign(path: &Path, signer: &Signer) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    anyhow::ensure!(
        !archive.file_names().any(is_signature_entry),
        "`{}` is already signed",
        path.display()
    );
    let digests = entry_digests(&mut archive)?;
    drop(archive);

    let mut manifest = section(&[("Manifest-Version", "1.0"), ("Created-By", CREATED_BY)]);
    let mut entry_sections = vec![];
    for (name, digest) in &digests {
        let entry = section(&[("Name", name.as_str()), (DIGEST_ATTR, digest.as_str())]);
        manifest.extend_from_slice(&entry);
        entry_sections.push((name, entry));
    }

    let manifest_digest = digest_b64(&manifest);
    let mut signature_file = section(&[
        ("Signature-Version", "1.0"),
        ("Created-By", CREATED_BY),
        (MANIFEST_DIGEST_ATTR, manifest_digest.as_str()),
        (APK_SIGNED_ATTR, "2"),
    ]);
    for (name, entry) in &entry_sections {
        let digest = digest_b64(entry);
        signature_file.extend_from_slice(&section(&[
            ("Name", name.as_str()),
            (DIGEST_ATTR, digest.as_str()),
        ]));
    }

    let signature = signer.sign(&signature_file)?;
    let block = cms::encode_signed_data(signer.cert(), signer.cert_der(), &signature)?;

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut zip = ZipWriter::new_append(file)?;
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, contents) in [
        (MANIFEST_MF, &manifest),
        (CERT_SF, &signature_file),
        (CERT_RSA, &block),
    ] {
        zip.start_file(name, opts)?;
        zip.write_all(contents)?;
    }
    zip.finish()?;
    log::debug!("v1: signed {} entries", digests.len());
    Ok(())
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("missing `{}`", name))?;
    let mut data = vec![];
    entry.read_to_end(&mut data)?;
    Ok(data)
}

/// Verifies the JAR signature and returns the signer's certificate.
pub fn verify(path: &Path) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let manifest = read_entry(&mut archive, MANIFEST_MF)?;
    let signature_file = read_entry(&mut archive, CERT_SF)?;
    let block = read_entry(&mut archive, CERT_RSA)?;

    let parts = cms::decode_signed_data(&block)?;
    let pubkey = cert::public_key(&parts.certificate)?;
    let digest = Sha256::digest(&signature_file);
    pubkey
        .verify(
            PaddingScheme::new_pkcs1v15_sign::<Sha256>(),
            &digest,
            &parts.signature,
        )
        .context("CERT.SF signature does not verify")?;

    let sf_sections = parse_sections(&signature_file)?;
    let sf_main = sf_sections.first().context("empty CERT.SF")?;
    anyhow::ensure!(
        sf_main.get(MANIFEST_DIGEST_ATTR) == Some(digest_b64(&manifest).as_str()),
        "MANIFEST.MF digest does not match CERT.SF"
    );

    let manifest_sections = parse_sections(&manifest)?;
    check_section_digests(&manifest_sections, &sf_sections)?;
    let mut listed = BTreeMap::new();
    for section in manifest_sections.iter().skip(1) {
        let name = section.get("Name").context("manifest section without a name")?;
        let digest = section
            .get(DIGEST_ATTR)
            .with_context(|| format!("no SHA-256 digest for `{}`", name))?;
        listed.insert(name.to_string(), digest.to_string());
    }
    for (name, digest) in entry_digests(&mut archive)? {
        match listed.remove(&name) {
            Some(expected) if expected == digest => {}
            Some(_) => anyhow::bail!("digest of `{}` does not match", name),
            None => anyhow::bail!("`{}` is not covered by the signature", name),
        }
    }
    if let Some(name) = listed.keys().next() {
        anyhow::bail!("signed entry `{}` is missing", name);
    }
    Ok(parts.certificate_der)
}
