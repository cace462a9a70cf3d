//! Package renaming on the binary `AndroidManifest.xml`.
//!
//! Two editors implement [`ManifestPatcher`]: [`InPlaceEditor`] overwrites
//! string cells without moving a byte and only handles package names that do
//! not grow, while [`StructuralRebuilder`] reserializes the whole document.
//! [`PatcherChain`] tries them in that order.

use super::rebuild::StructuralRebuilder;
use super::res::{
    attr, read_resource_map, read_string_cells, rewrite_cell, set_attribute_data, xml_chunks,
    value_type, Attribute, ChunkSpan, ChunkType, StartElement, StringPool,
};
use anyhow::{Context, Result};
use std::collections::BTreeSet;

/// Tags whose `android:name` names a class.
pub const COMPONENT_TAGS: [&str; 6] = [
    "activity",
    "service",
    "receiver",
    "provider",
    "application",
    "activity-alias",
];

const COMPONENT_SUFFIXES: [&str; 12] = [
    "Activity",
    "Service",
    "Provider",
    "Receiver",
    "Application",
    "Fragment",
    "Adapter",
    "View",
    "Manager",
    "Helper",
    "Listener",
    "Callback",
];

/// Everything a manifest patch changes.
#[derive(Clone, Debug)]
pub struct ManifestEdit<'a> {
    pub old_package: &'a str,
    pub new_package: &'a str,
    pub version_code: u32,
    pub version_name: &'a str,
    /// Class suffixes under `old_package` that must keep resolving there.
    pub component_classes: &'a [String],
}

impl ManifestEdit<'_> {
    /// `component_classes` spelled out under `old_package`.
    pub fn absolute_component_classes(&self) -> BTreeSet<String> {
        self.component_classes
            .iter()
            .map(|suffix| format!("{}.{}", self.old_package, suffix))
            .collect()
    }
}

pub trait ManifestPatcher {
    fn name(&self) -> &'static str;

    /// Returns the patched manifest, or `None` when this editor cannot apply
    /// `edit` to `manifest`.
    fn try_patch(&self, manifest: &[u8], edit: &ManifestEdit) -> Option<Vec<u8>>;
}

/// Ordered list of editors; the first one that accepts the edit wins.
pub struct PatcherChain {
    patchers: Vec<Box<dyn ManifestPatcher + Send + Sync>>,
}

impl Default for PatcherChain {
    fn default() -> Self {
        Self::new(vec![Box::new(InPlaceEditor), Box::new(StructuralRebuilder)])
    }
}

impl PatcherChain {
    pub fn new(patchers: Vec<Box<dyn ManifestPatcher + Send + Sync>>) -> Self {
        Self { patchers }
    }

    pub fn patch(&self, manifest: &[u8], edit: &ManifestEdit) -> Option<Vec<u8>> {
        for patcher in &self.patchers {
            match patcher.try_patch(manifest, edit) {
                Some(patched) => {
                    log::info!("Manifest patched by the {} editor", patcher.name());
                    return Some(patched);
                }
                None => log::debug!("The {} editor declined the manifest", patcher.name()),
            }
        }
        None
    }
}

/// Whether the last segment of `suffix` looks like a class name rather than a
/// permission or authority segment. All-caps segments are permissions.
pub fn is_likely_class_name(suffix: &str) -> bool {
    let class_name = suffix.rsplit('.').next().unwrap_or(suffix);
    match class_name.chars().next() {
        Some(first) if first.is_uppercase() => {}
        _ => return false,
    }
    COMPONENT_SUFFIXES
        .iter()
        .any(|component| class_name.ends_with(component))
        || (class_name.chars().all(|c| c.is_ascii_alphanumeric())
            && class_name.chars().any(|c| c.is_lowercase()))
}

/// Absolute form of a relative class name (`.Main` or `Main`) under `package`.
pub(crate) fn expand_class_name(value: &str, package: &str) -> Option<String> {
    if value.starts_with('.') {
        Some(format!("{}{}", package, value))
    } else if !value.is_empty() && !value.contains('.') {
        Some(format!("{}.{}", package, value))
    } else {
        None
    }
}

/// Whether `attr` is the framework attribute `res_id`. Attribute names mapped
/// by the resource map are identified by id, the rest by local name.
pub(crate) fn attribute_is(
    attr: &Attribute,
    res_id: u32,
    local_name: &str,
    resource_map: &[u32],
    strings: &[String],
) -> bool {
    match resource_map.get(attr.name as usize) {
        Some(id) => *id == res_id,
        None => strings
            .get(attr.name as usize)
            .map_or(false, |name| name == local_name),
    }
}

pub(crate) fn element_name<'s>(element: &StartElement, strings: &'s [String]) -> Option<&'s str> {
    strings.get(element.name as usize).map(String::as_str)
}

/// Start elements of a document, paired with their chunk positions.
pub(crate) fn start_elements(data: &[u8], spans: &[ChunkSpan]) -> Result<Vec<(ChunkSpan, StartElement)>> {
    spans
        .iter()
        .filter(|span| span.ty == ChunkType::XmlStartElement as u16)
        .map(|span| {
            let element = StartElement::parse(&data[span.range()])
                .with_context(|| format!("While parsing element at 0x{:x}", span.offset))?;
            Ok((*span, element))
        })
        .collect()
}

fn find_span(spans: &[ChunkSpan], ty: ChunkType) -> Option<ChunkSpan> {
    spans.iter().find(|span| span.ty == ty as u16).copied()
}

/// Reads the `package` attribute of `<manifest>`.
pub fn read_package(manifest: &[u8]) -> Result<String> {
    let (_, spans) = xml_chunks(manifest)?;
    let pool_span = find_span(&spans, ChunkType::StringPool).context("Manifest has no string pool")?;
    let pool = StringPool::read(&manifest[pool_span.range()])?;
    for (_, element) in start_elements(manifest, &spans)? {
        if element_name(&element, &pool.strings) != Some("manifest") {
            continue;
        }
        return element
            .attributes
            .iter()
            .find(|a| a.value_type == value_type::STRING && pool.get(a.name) == Some("package"))
            .and_then(|a| pool.get(a.data))
            .map(str::to_string)
            .context("<manifest> has no package attribute");
    }
    anyhow::bail!("Manifest has no <manifest> element")
}

/// Renames the package by overwriting string cells in place.
///
/// Refuses package names that are longer than the original in either
/// encoding, and manifests with relative component names, which would start
/// resolving against the new package.
pub struct InPlaceEditor;

impl InPlaceEditor {
    fn patch(&self, manifest: &[u8], edit: &ManifestEdit) -> Result<Option<Vec<u8>>> {
        let (old, new) = (edit.old_package, edit.new_package);
        if new.len() > old.len() || new.encode_utf16().count() > old.encode_utf16().count() {
            log::debug!("`{}` does not fit in place of `{}`", new, old);
            return Ok(None);
        }

        let (_, spans) = xml_chunks(manifest)?;
        let pool_span = find_span(&spans, ChunkType::StringPool).context("Manifest has no string pool")?;
        let resource_map = match find_span(&spans, ChunkType::XmlResourceMap) {
            Some(span) => read_resource_map(&manifest[span.range()])?,
            None => vec![],
        };
        let (pool_header, cells) = read_string_cells(&manifest[pool_span.range()])?;
        let utf8 = pool_header.is_utf8();
        let strings: Vec<String> = cells.iter().map(|cell| cell.value.clone()).collect();
        let elements = start_elements(manifest, &spans)?;

        if old != new {
            for (_, element) in &elements {
                let tag = element_name(element, &strings).unwrap_or_default();
                if !COMPONENT_TAGS.contains(&tag) {
                    continue;
                }
                let relative = element.attributes.iter().find_map(|a| {
                    let is_name = a.value_type == value_type::STRING
                        && attribute_is(a, attr::NAME, "name", &resource_map, &strings);
                    strings
                        .get(a.data as usize)
                        .filter(|value| is_name && expand_class_name(value, old).is_some())
                });
                if let Some(name) = relative {
                    log::debug!("<{}> uses relative class name `{}`", tag, name);
                    return Ok(None);
                }
            }
        }

        let mut out = manifest.to_vec();
        let mut version_name_index = None;
        for (span, element) in &elements {
            let chunk = &mut out[span.range()];
            match element_name(element, &strings) {
                Some("manifest") => {
                    for a in &element.attributes {
                        if attribute_is(a, attr::VERSION_CODE, "versionCode", &resource_map, &strings) {
                            set_attribute_data(chunk, a, edit.version_code);
                        } else if a.value_type == value_type::STRING
                            && attribute_is(a, attr::VERSION_NAME, "versionName", &resource_map, &strings)
                        {
                            version_name_index = Some(a.data as usize);
                        }
                    }
                }
                Some("application") => {
                    for a in &element.attributes {
                        if attribute_is(a, attr::TEST_ONLY, "testOnly", &resource_map, &strings)
                            && matches!(a.value_type, value_type::INT_BOOLEAN | value_type::INT_DEC)
                        {
                            set_attribute_data(chunk, a, 0);
                        }
                    }
                }
                _ => {}
            }
        }

        let pool = &mut out[pool_span.range()];
        let prefix = format!("{}.", old);
        let classes = edit.absolute_component_classes();
        for cell in &cells {
            let replacement = if cell.value == old {
                Some(new.to_string())
            } else if classes.contains(&cell.value) {
                None
            } else {
                cell.value
                    .strip_prefix(&prefix)
                    .filter(|suffix| !is_likely_class_name(suffix))
                    .map(|suffix| format!("{}.{}", new, suffix))
            };
            if let Some(replacement) = replacement {
                if rewrite_cell(pool, cell, utf8, &replacement) {
                    log::debug!("Rewrote `{}` -> `{}`", cell.value, replacement);
                } else {
                    log::warn!("Could not rewrite `{}` in place", cell.value);
                }
            }
        }

        let (_, cells) = read_string_cells(pool)?;
        for suffix in edit.component_classes {
            let broken = format!("{}.{}", new, suffix);
            let original = format!("{}.{}", old, suffix);
            if broken == original || broken.len() != original.len() {
                continue;
            }
            for cell in cells.iter().filter(|cell| cell.value == broken) {
                if rewrite_cell(pool, cell, utf8, &original) {
                    log::debug!("Restored component class `{}`", original);
                }
            }
        }

        match version_name_index.and_then(|index| cells.get(index)) {
            Some(cell) if cell.value != edit.version_name => {
                if !rewrite_cell(pool, cell, utf8, edit.version_name) {
                    log::warn!(
                        "versionName `{}` does not fit in place of `{}`, keeping it",
                        edit.version_name,
                        cell.value
                    );
                }
            }
            Some(_) => {}
            None => log::warn!("Manifest declares no versionName"),
        }

        Ok(Some(out))
    }
}

impl ManifestPatcher for InPlaceEditor {
    fn name(&self) -> &'static str {
        "in-place"
    }

    fn try_patch(&self, manifest: &[u8], edit: &ManifestEdit) -> Option<Vec<u8>> {
        match self.patch(manifest, edit) {
            Ok(patched) => patched,
            Err(err) => {
                log::warn!("In-place manifest edit failed: {:#}", err);
                None
            }
        }
    }
}
