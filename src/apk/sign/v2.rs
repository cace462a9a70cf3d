//! APK Signature Scheme v2 for rebranded packages.
//!
//! The signing block sits between the last entry and the central directory.
//! Its digest covers the entries, the central directory and the end record in
//! 1 MiB chunks, so [`sign`] runs after the v1 entries are in place and after
//! alignment. Only RSA PKCS#1 v1.5 with SHA-256 is produced or accepted.

use super::{cert, Signer};
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rasn_pkix::Certificate;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{PaddingScheme, PublicKey, RsaPublicKey};
use sha2::{Digest as _, Sha256};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

const APK_SIGNING_BLOCK_MAGIC: &[u8] = b"APK Sig Block 42";
const APK_SIGNING_BLOCK_V2_ID: u32 = 0x7109871a;
const APK_SIGNING_BLOCK_V3_ID: u32 = 0xf05368c0;
const APK_SIGNING_BLOCK_V4_ID: u32 = 0x42726577;
const RSA_PKCS1V15_SHA2_256: u32 = 0x0103;
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Where the central directory and its end record start.
struct ArchiveLayout {
    pub cde_start: u64,
    pub cd_start: u64,
}

impl ArchiveLayout {
    pub fn new<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let cde_start = find_cde_start_pos(r)?;
        r.seek(SeekFrom::Start(cde_start + 16))?;
        let cd_start = r.read_u32::<LittleEndian>()? as u64;
        anyhow::ensure!(cd_start <= cde_start, "central directory offset out of range");
        Ok(Self {
            cde_start,
            cd_start,
        })
    }
}

fn find_cde_start_pos<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    const CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x06054b50;
    const HEADER_SIZE: u64 = 22;
    let file_length = reader.seek(SeekFrom::End(0))?;
    let search_upper_bound = file_length.saturating_sub(HEADER_SIZE + u16::MAX as u64);
    anyhow::ensure!(file_length >= HEADER_SIZE, "Invalid zip header");
    let mut pos = file_length - HEADER_SIZE;
    while pos >= search_upper_bound {
        reader.seek(SeekFrom::Start(pos))?;
        if reader.read_u32::<LittleEndian>()? == CENTRAL_DIRECTORY_END_SIGNATURE {
            return Ok(pos);
        }
        pos = match pos.checked_sub(1) {
            Some(p) => p,
            None => break,
        };
    }
    anyhow::bail!("Could not find central directory end");
}

/// Checks the v2 signature of the package at `path` against its current
/// contents and returns the DER certificates it names. v3 and v4 entries in
/// the block are ignored.
pub fn verify(path: &Path) -> Result<Vec<Vec<u8>>> {
    let f = File::open(path)?;
    let mut r = BufReader::new(f);
    let layout = parse_apk_signing_block(&mut r)?;
    let mut v2_entry = None;
    for entry in &layout.blocks {
        match entry.id {
            APK_SIGNING_BLOCK_V2_ID => {
                log::debug!("v2 signing block");
                v2_entry = Some(*entry);
            }
            APK_SIGNING_BLOCK_V3_ID => {
                log::debug!("v3 signing block");
            }
            APK_SIGNING_BLOCK_V4_ID => {
                log::debug!("v4 signing block");
            }
            id => {
                log::debug!("unknown signing block 0x{:x}", id);
            }
        }
    }
    let block = if let Some(entry) = v2_entry {
        r.seek(SeekFrom::Start(entry.start))?;
        ApkSignatureBlockV2::read(&mut r)?
    } else {
        anyhow::bail!("no signing block v2 found");
    };
    let zip_hash = compute_digest(&mut r, layout.sb_start, layout.cd_start, layout.cde_start)?;
    anyhow::ensure!(!block.signers.is_empty(), "found no signers in v2 block");
    let mut certificates = vec![];
    for signer in &block.signers {
        anyhow::ensure!(
            !signer.signatures.is_empty(),
            "found no signatures in v2 block"
        );
        let pubkey = RsaPublicKey::from_public_key_der(&signer.public_key)?;
        for sig in &signer.signatures {
            anyhow::ensure!(
                sig.algorithm == RSA_PKCS1V15_SHA2_256,
                "found unsupported signature algorithm 0x{:x}",
                sig.algorithm
            );
            let digest = Sha256::digest(&signer.signed_data);
            let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
            pubkey
                .verify(padding, &digest, &sig.signature)
                .context("signed data signature does not verify")?;
        }
        let mut r = Cursor::new(&signer.signed_data[..]);
        let signed_data = SignedData::read(&mut r)?;
        anyhow::ensure!(
            !signed_data.digests.is_empty(),
            "found no digests in v2 block"
        );
        for digest in &signed_data.digests {
            anyhow::ensure!(
                digest.algorithm == RSA_PKCS1V15_SHA2_256,
                "found unsupported digest algorithm 0x{:x}",
                digest.algorithm
            );
            anyhow::ensure!(
                digest.digest == zip_hash,
                "computed hash doesn't match signed hash."
            );
        }
        let first = signed_data
            .certificates
            .first()
            .context("found no certificates in v2 block")?;
        anyhow::ensure!(
            cert::public_key(&cert::decode::<Certificate>(first)?)? == pubkey,
            "public key does not match the first certificate"
        );
        for der in &signed_data.certificates {
            cert::decode::<Certificate>(der)?;
            certificates.push(der.clone());
        }
        for attr in &signed_data.additional_attributes {
            log::debug!("v2: additional attribute: 0x{:x} {:?}", attr.0, &attr.1);
        }
    }
    Ok(certificates)
}

/// Rewrites the package at `path` with a signing block for `signer`,
/// dropping any block a previous signing left behind. The end record's
/// central directory offset moves past the new block.
pub fn sign(path: &Path, signer: &Signer) -> Result<()> {
    let apk = std::fs::read(path)?;
    let mut r = Cursor::new(&apk);
    let layout = parse_apk_signing_block(&mut r)?;
    let zip_hash = compute_digest(&mut r, layout.sb_start, layout.cd_start, layout.cde_start)?;
    let mut signing_block = vec![];
    let mut w = Cursor::new(&mut signing_block);
    write_apk_signing_block(&mut w, zip_hash, signer)?;
    let mut f = File::create(path)?;
    f.write_all(&apk[..(layout.sb_start as usize)])?;
    f.write_all(&signing_block)?;
    let cd_start = f.stream_position()?;
    f.write_all(&apk[(layout.cd_start as usize)..(layout.cde_start as usize)])?;
    let cde_start = f.stream_position()?;
    f.write_all(&apk[(layout.cde_start as usize)..])?;
    f.seek(SeekFrom::Start(cde_start + 16))?;
    anyhow::ensure!(cd_start <= u32::MAX as u64, "archive too large for v2 signing");
    f.write_u32::<LittleEndian>(cd_start as u32)?;
    f.sync_all()?;
    log::debug!("v2: signing block of {} bytes", signing_block.len());
    Ok(())
}

/// Top-level digest over the entries (up to `sb_start`), the central
/// directory and the end record, skipping the signing block itself.
fn compute_digest<R: Read + Seek>(
    r: &mut R,
    sb_start: u64,
    cd_start: u64,
    cde_start: u64,
) -> Result<[u8; 32]> {
    let mut chunks = vec![];
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; MAX_CHUNK_SIZE];

    // chunk contents
    r.rewind()?;
    let mut pos = 0;
    while pos < sb_start {
        hash_chunk(&mut chunks, r, sb_start, &mut hasher, &mut chunk, &mut pos)?;
    }

    // chunk cd
    let mut pos = r.seek(SeekFrom::Start(cd_start))?;
    while pos < cde_start {
        hash_chunk(&mut chunks, r, cde_start, &mut hasher, &mut chunk, &mut pos)?;
    }

    // chunk cde, with the cd offset pointing at the signing block
    chunk.clear();
    r.read_to_end(&mut chunk)?;
    anyhow::ensure!(chunk.len() >= 22, "truncated central directory end");
    let mut cursor = Cursor::new(&mut chunk);
    cursor.seek(SeekFrom::Start(16))?;
    cursor.write_u32::<LittleEndian>(sb_start as u32)?;
    hasher.update([0xa5]);
    anyhow::ensure!(chunk.len() <= MAX_CHUNK_SIZE, "central directory end too large");
    hasher.update((chunk.len() as u32).to_le_bytes());
    hasher.update(&chunk);
    chunks.push(hasher.finalize_reset().into());

    // compute root
    hasher.update([0x5a]);
    hasher.update((chunks.len() as u32).to_le_bytes());
    for chunk in &chunks {
        hasher.update(chunk);
    }
    Ok(hasher.finalize().into())
}

fn hash_chunk<R: Read + Seek>(
    chunks: &mut Vec<[u8; 32]>,
    r: &mut R,
    size: u64,
    hasher: &mut Sha256,
    buffer: &mut Vec<u8>,
    pos: &mut u64,
) -> Result<()> {
    let end = std::cmp::min(*pos + MAX_CHUNK_SIZE as u64, size);
    let len = (end - *pos) as usize;
    buffer.resize(len, 0);
    r.read_exact(buffer)?;
    hasher.update([0xa5]);
    hasher.update((len as u32).to_le_bytes());
    hasher.update(&buffer);
    chunks.push(hasher.finalize_reset().into());
    *pos = end;
    Ok(())
}

#[derive(Debug, Default)]
struct Digest {
    pub algorithm: u32,
    pub digest: Vec<u8>,
}

impl Digest {
    fn new(hash: [u8; 32]) -> Self {
        Self {
            algorithm: RSA_PKCS1V15_SHA2_256,
            digest: hash.to_vec(),
        }
    }

    fn size(&self) -> u32 {
        self.digest.len() as u32 + 12
    }

    fn read(r: &mut impl Read) -> Result<Self> {
        let _digest_size = r.read_u32::<LittleEndian>()?;
        let algorithm = r.read_u32::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()?;
        let digest = read_field(r, size)?;
        Ok(Self { algorithm, digest })
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.digest.len() as u32 + 8)?;
        w.write_u32::<LittleEndian>(self.algorithm)?;
        w.write_u32::<LittleEndian>(self.digest.len() as u32)?;
        w.write_all(&self.digest)?;
        Ok(())
    }
}

/// Reads a length-prefixed field without trusting the prefix for allocation.
fn read_field(r: &mut impl Read, len: u32) -> Result<Vec<u8>> {
    let mut field = vec![];
    r.by_ref().take(len as u64).read_to_end(&mut field)?;
    anyhow::ensure!(field.len() == len as usize, "truncated v2 block record");
    Ok(field)
}

/// Subtracts a record length from the bytes left in its list.
fn consume(remaining: &mut u32, len: u32) -> Result<()> {
    *remaining = remaining
        .checked_sub(len)
        .context("v2 block record overruns its list")?;
    Ok(())
}

/// The signer's `signed data` record: what its signature covers.
#[derive(Debug, Default)]
struct SignedData {
    pub digests: Vec<Digest>,
    pub certificates: Vec<Vec<u8>>,
    pub additional_attributes: Vec<(u32, Vec<u8>)>,
}

impl SignedData {
    fn new(hash: [u8; 32], signer: &Signer) -> Self {
        Self {
            digests: vec![Digest::new(hash)],
            certificates: vec![signer.cert_der().to_vec()],
            additional_attributes: vec![],
        }
    }

    fn read(r: &mut impl Read) -> Result<Self> {
        let mut signed_data = SignedData::default();
        let mut remaining_digests_size = r.read_u32::<LittleEndian>()?;
        while remaining_digests_size > 0 {
            let digest = Digest::read(r)?;
            consume(&mut remaining_digests_size, digest.size())?;
            signed_data.digests.push(digest);
        }
        let mut remaining_certificates_size = r.read_u32::<LittleEndian>()?;
        while remaining_certificates_size > 0 {
            let length = r.read_u32::<LittleEndian>()?;
            signed_data.certificates.push(read_field(r, length)?);
            consume(&mut remaining_certificates_size, length.saturating_add(4))?;
        }
        let mut remaining_additional_attributes_size = r.read_u32::<LittleEndian>()?;
        while remaining_additional_attributes_size > 0 {
            let length = r.read_u32::<LittleEndian>()?;
            anyhow::ensure!(length >= 4, "truncated v2 additional attribute");
            let id = r.read_u32::<LittleEndian>()?;
            let value = read_field(r, length - 4)?;
            signed_data.additional_attributes.push((id, value));
            consume(&mut remaining_additional_attributes_size, length.saturating_add(4))?;
        }
        Ok(signed_data)
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.digests.iter().map(|d| d.size()).sum())?;
        for digest in &self.digests {
            digest.write(w)?;
        }
        w.write_u32::<LittleEndian>(self.certificates.iter().map(|c| c.len() as u32 + 4).sum())?;
        for cert in &self.certificates {
            w.write_u32::<LittleEndian>(cert.len() as u32)?;
            w.write_all(cert)?;
        }
        w.write_u32::<LittleEndian>(
            self.additional_attributes
                .iter()
                .map(|(_, v)| v.len() as u32 + 8)
                .sum(),
        )?;
        for (id, value) in &self.additional_attributes {
            w.write_u32::<LittleEndian>(value.len() as u32 + 4)?;
            w.write_u32::<LittleEndian>(*id)?;
            w.write_all(value)?;
        }
        Ok(())
    }
}

/// Payload of the v2 entry in the signing block.
#[derive(Debug)]
struct ApkSignatureBlockV2 {
    pub signers: Vec<ApkSigner>,
}

#[derive(Debug)]
struct ApkSigner {
    pub signed_data: Vec<u8>,
    pub signatures: Vec<ApkSignature>,
    pub public_key: Vec<u8>,
}

#[derive(Debug)]
struct ApkSignature {
    pub algorithm: u32,
    pub signature: Vec<u8>,
}

impl ApkSignatureBlockV2 {
    fn new(hash: [u8; 32], signer: &Signer) -> Result<Self> {
        let mut signed_data = vec![];
        SignedData::new(hash, signer).write(&mut signed_data)?;
        let signature = signer.sign(&signed_data)?;
        Ok(Self {
            signers: vec![ApkSigner {
                signed_data,
                signatures: vec![ApkSignature {
                    algorithm: RSA_PKCS1V15_SHA2_256,
                    signature,
                }],
                public_key: signer.pubkey().to_public_key_der()?.as_ref().to_vec(),
            }],
        })
    }

    fn read(r: &mut impl Read) -> Result<Self> {
        let mut signers = vec![];
        let mut remaining_size = r.read_u32::<LittleEndian>()?;
        while remaining_size > 0 {
            let signer_size = r.read_u32::<LittleEndian>()?;

            let signed_data_size = r.read_u32::<LittleEndian>()?;
            let signed_data = read_field(r, signed_data_size)?;

            let mut signatures = vec![];
            let mut remaining_signature_size = r.read_u32::<LittleEndian>()?;
            while remaining_signature_size > 0 {
                let signature_size = r.read_u32::<LittleEndian>()?;
                let algorithm = r.read_u32::<LittleEndian>()?;
                let size = r.read_u32::<LittleEndian>()?;
                let signature = read_field(r, size)?;
                signatures.push(ApkSignature {
                    algorithm,
                    signature,
                });
                consume(&mut remaining_signature_size, signature_size.saturating_add(4))?;
            }

            let public_key_size = r.read_u32::<LittleEndian>()?;
            let public_key = read_field(r, public_key_size)?;

            signers.push(ApkSigner {
                signed_data,
                signatures,
                public_key,
            });
            consume(&mut remaining_size, signer_size.saturating_add(4))?;
        }
        Ok(ApkSignatureBlockV2 { signers })
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        let mut buffer = vec![];
        for signer in &self.signers {
            let mut signer_buffer = vec![];
            signer_buffer.write_u32::<LittleEndian>(signer.signed_data.len() as u32)?;
            signer_buffer.write_all(&signer.signed_data)?;
            let mut sig_buffer = vec![];
            for sig in &signer.signatures {
                sig_buffer.write_u32::<LittleEndian>(sig.signature.len() as u32 + 8)?;
                sig_buffer.write_u32::<LittleEndian>(sig.algorithm)?;
                sig_buffer.write_u32::<LittleEndian>(sig.signature.len() as u32)?;
                sig_buffer.write_all(&sig.signature)?;
            }
            signer_buffer.write_u32::<LittleEndian>(sig_buffer.len() as u32)?;
            signer_buffer.write_all(&sig_buffer)?;
            signer_buffer.write_u32::<LittleEndian>(signer.public_key.len() as u32)?;
            signer_buffer.write_all(&signer.public_key)?;
            buffer.write_u32::<LittleEndian>(signer_buffer.len() as u32)?;
            buffer.write_all(&signer_buffer)?;
        }
        w.write_u32::<LittleEndian>(buffer.len() as u32)?;
        w.write_all(&buffer)?;
        Ok(())
    }
}

/// The signing block's entries plus the archive offsets around it. Without a
/// block, `sb_start` equals `cd_start`.
#[derive(Debug, Default)]
struct ApkSignatureBlock {
    pub blocks: Vec<ApkOpaqueBlock>,
    pub sb_start: u64,
    pub cd_start: u64,
    pub cde_start: u64,
}

/// An ID-value entry of the signing block; `start` is the value's offset.
#[derive(Clone, Copy, Debug)]
struct ApkOpaqueBlock {
    pub id: u32,
    pub start: u64,
}

fn write_apk_signing_block<W: Write + Seek>(
    w: &mut W,
    hash: [u8; 32],
    signer: &Signer,
) -> Result<()> {
    let mut buf = vec![];
    ApkSignatureBlockV2::new(hash, signer)?.write(&mut buf)?;
    let size = buf.len() as u64 + 36;
    w.write_u64::<LittleEndian>(size)?;
    w.write_u64::<LittleEndian>(buf.len() as u64 + 4)?;
    w.write_u32::<LittleEndian>(APK_SIGNING_BLOCK_V2_ID)?;
    w.write_all(&buf)?;
    w.write_u64::<LittleEndian>(size)?;
    w.write_all(APK_SIGNING_BLOCK_MAGIC)?;
    Ok(())
}

/// Locates the signing block in front of the central directory, if any.
fn parse_apk_signing_block<R: Read + Seek>(r: &mut R) -> Result<ApkSignatureBlock> {
    let info = ArchiveLayout::new(r)?;
    let mut block = ApkSignatureBlock {
        cde_start: info.cde_start,
        cd_start: info.cd_start,
        sb_start: info.cd_start,
        ..Default::default()
    };
    let Some(footer) = block.cd_start.checked_sub(16 + 8) else {
        return Ok(block);
    };
    r.seek(SeekFrom::Start(footer))?;
    let mut remaining_size = r.read_u64::<LittleEndian>()?;
    let mut magic = [0; 16];
    r.read_exact(&mut magic)?;
    if magic != APK_SIGNING_BLOCK_MAGIC {
        return Ok(block);
    }
    anyhow::ensure!(
        remaining_size >= 24 && remaining_size + 8 <= block.cd_start,
        "signing block size out of range"
    );
    let mut pos = r.seek(SeekFrom::Start(block.cd_start - remaining_size))?;
    block.sb_start = pos - 8;
    while remaining_size > 24 {
        let length = r.read_u64::<LittleEndian>()?;
        let id = r.read_u32::<LittleEndian>()?;
        block.blocks.push(ApkOpaqueBlock {
            id,
            start: pos + 8 + 4,
        });
        remaining_size = remaining_size
            .checked_sub(length + 8)
            .context("signing block entry overruns the block")?;
        pos = r.seek(SeekFrom::Start(pos + length + 8))?;
    }
    Ok(block)
}
