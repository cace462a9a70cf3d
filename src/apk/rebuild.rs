//! Full reserialization of a binary manifest.
//!
//! The string pool and resource map are decoded; every other chunk is kept
//! as opaque bytes and only patched at known attribute offsets. Strings are
//! appended to the pool, never inserted, so indices held by untouched chunks
//! stay valid.

use super::axml::{
    attribute_is, element_name, expand_class_name, is_likely_class_name, ManifestEdit,
    ManifestPatcher, COMPONENT_TAGS,
};
use super::res::{
    attr, read_resource_map, set_attribute_data, set_string_attribute, value_type, write_resource_map,
    xml_chunks, ChunkType, ResChunkHeader, StartElement, StringPool,
};
use anyhow::{Context, Result};
use std::collections::BTreeSet;

/// A chunk carried through unchanged apart from attribute patches.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    pub ty: u16,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ParsedManifest {
    /// File header bytes; the size field is rewritten on output.
    header: Vec<u8>,
    pub pool: StringPool,
    pub resource_map: Option<Vec<u32>>,
    pub chunks: Vec<Chunk>,
}

impl ParsedManifest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (header_size, spans) = xml_chunks(data)?;
        anyhow::ensure!(
            header_size as usize >= ResChunkHeader::SIZE && header_size as usize <= data.len(),
            "invalid file header size {}",
            header_size
        );
        let mut pool = None;
        let mut resource_map = None;
        let mut chunks = vec![];
        for span in spans {
            let bytes = &data[span.range()];
            match ChunkType::from_u16(span.ty) {
                Some(ChunkType::StringPool) => {
                    anyhow::ensure!(pool.is_none(), "manifest has more than one string pool");
                    pool = Some(StringPool::read(bytes)?);
                }
                Some(ChunkType::XmlResourceMap) => {
                    anyhow::ensure!(resource_map.is_none(), "manifest has more than one resource map");
                    resource_map = Some(read_resource_map(bytes)?);
                }
                _ => chunks.push(Chunk {
                    ty: span.ty,
                    data: bytes.to_vec(),
                }),
            }
        }
        Ok(Self {
            header: data[..header_size as usize].to_vec(),
            pool: pool.context("Manifest has no string pool")?,
            resource_map,
            chunks,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        self.pool.write(&mut body)?;
        if let Some(ids) = &self.resource_map {
            write_resource_map(ids, &mut body)?;
        }
        for chunk in &self.chunks {
            body.extend_from_slice(&chunk.data);
        }
        let mut out = self.header.clone();
        let size = (out.len() + body.len()) as u32;
        out[4..8].copy_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn map(&self) -> &[u32] {
        self.resource_map.as_deref().unwrap_or(&[])
    }

    /// Start elements with the index of the chunk holding them.
    fn start_elements(&self) -> Result<Vec<(usize, StartElement)>> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| chunk.ty == ChunkType::XmlStartElement as u16)
            .map(|(i, chunk)| Ok((i, StartElement::parse(&chunk.data)?)))
            .collect()
    }

    /// Points relative component names at their absolute form under
    /// `package`. Returns the absolute names now referenced.
    pub fn expand_relative_names(&mut self, package: &str) -> Result<BTreeSet<String>> {
        let mut expansions = vec![];
        for (i, element) in self.start_elements()? {
            let tag = element_name(&element, &self.pool.strings).unwrap_or_default();
            if !COMPONENT_TAGS.contains(&tag) {
                continue;
            }
            for a in &element.attributes {
                if a.value_type != value_type::STRING
                    || !attribute_is(a, attr::NAME, "name", self.map(), &self.pool.strings)
                {
                    continue;
                }
                let absolute = self
                    .pool
                    .get(a.data)
                    .and_then(|value| expand_class_name(value, package));
                if let Some(absolute) = absolute {
                    log::debug!("Expanding <{}> name to `{}`", tag, absolute);
                    expansions.push((i, *a, absolute));
                }
            }
        }
        let mut expanded = BTreeSet::new();
        for (i, a, absolute) in expansions {
            let index = self.pool.get_or_insert(&absolute);
            set_string_attribute(&mut self.chunks[i].data, &a, index);
            expanded.insert(absolute);
        }
        Ok(expanded)
    }

    /// Renames `old` to `new` across the pool. Strings under `old.` are moved
    /// too, unless they are in `classes` or look like a class name.
    pub fn replace_package(&mut self, old: &str, new: &str, classes: &BTreeSet<String>) {
        let prefix = format!("{}.", old);
        for string in self.pool.strings.iter_mut() {
            if string == old {
                *string = new.to_string();
            } else if let Some(suffix) = string.strip_prefix(&prefix) {
                if classes.contains(string.as_str()) || is_likely_class_name(suffix) {
                    log::debug!("Keeping component class `{}`", string);
                } else {
                    *string = format!("{}.{}", new, suffix);
                }
            }
        }
    }

    /// Sets versionCode and versionName on `<manifest>`.
    pub fn set_version(&mut self, version_code: u32, version_name: &str) -> Result<()> {
        for (i, element) in self.start_elements()? {
            if element_name(&element, &self.pool.strings) != Some("manifest") {
                continue;
            }
            for a in &element.attributes {
                if a.value_type == value_type::INT_DEC
                    && attribute_is(a, attr::VERSION_CODE, "versionCode", self.map(), &self.pool.strings)
                {
                    set_attribute_data(&mut self.chunks[i].data, a, version_code);
                } else if a.value_type == value_type::STRING
                    && attribute_is(a, attr::VERSION_NAME, "versionName", self.map(), &self.pool.strings)
                {
                    let index = self.pool.get_or_insert(version_name);
                    set_string_attribute(&mut self.chunks[i].data, a, index);
                }
            }
            return Ok(());
        }
        anyhow::bail!("Manifest has no <manifest> element")
    }

    /// Sets `android:testOnly` on `<application>` to false.
    pub fn clear_test_only(&mut self) -> Result<()> {
        for (i, element) in self.start_elements()? {
            if element_name(&element, &self.pool.strings) != Some("application") {
                continue;
            }
            for a in &element.attributes {
                if matches!(a.value_type, value_type::INT_BOOLEAN | value_type::INT_DEC)
                    && attribute_is(a, attr::TEST_ONLY, "testOnly", self.map(), &self.pool.strings)
                {
                    set_attribute_data(&mut self.chunks[i].data, a, 0);
                    log::debug!("Cleared testOnly");
                }
            }
        }
        Ok(())
    }
}

/// Renames the package by rebuilding the manifest. Handles package names of
/// any length.
pub struct StructuralRebuilder;

impl StructuralRebuilder {
    /// Expands relative component names and renames `old` to `new`. Returns
    /// `manifest` unchanged when it cannot be parsed.
    pub fn expand_and_modify(&self, manifest: &[u8], old: &str, new: &str) -> Vec<u8> {
        let result = ParsedManifest::parse(manifest).and_then(|mut parsed| {
            let classes = parsed.expand_relative_names(old)?;
            parsed.replace_package(old, new, &classes);
            parsed.to_bytes()
        });
        match result {
            Ok(rebuilt) => rebuilt,
            Err(err) => {
                log::warn!("Manifest rebuild failed, keeping original: {:#}", err);
                manifest.to_vec()
            }
        }
    }

    fn rebuild(&self, manifest: &[u8], edit: &ManifestEdit) -> Result<Vec<u8>> {
        let mut parsed = ParsedManifest::parse(manifest)?;
        let expanded = parsed.expand_relative_names(edit.old_package)?;
        let mut classes = expanded.clone();
        classes.extend(edit.absolute_component_classes());
        parsed.replace_package(edit.old_package, edit.new_package, &classes);
        parsed.set_version(edit.version_code, edit.version_name)?;
        parsed.clear_test_only()?;
        let rebuilt = parsed.to_bytes()?;
        log::debug!(
            "Rebuilt manifest: {} -> {} bytes, {} names expanded",
            manifest.len(),
            rebuilt.len(),
            expanded.len()
        );
        Ok(rebuilt)
    }
}

impl ManifestPatcher for StructuralRebuilder {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn try_patch(&self, manifest: &[u8], edit: &ManifestEdit) -> Option<Vec<u8>> {
        match self.rebuild(manifest, edit) {
            Ok(rebuilt) => Some(rebuilt),
            Err(err) => {
                log::warn!("Manifest rebuild failed: {:#}", err);
                None
            }
        }
    }
}
