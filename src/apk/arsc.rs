//! Length-preserving string edits on a compiled resource table.
//!
//! The table is never parsed: strings are located by byte search and
//! overwritten with a replacement of exactly the same encoded length, so no
//! offset or size field anywhere in the table changes.

/// Text encodings a resource table string pool may use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    Utf8,
    Utf16Le,
}

impl Encoding {
    pub fn encode(&self, s: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => s.as_bytes().to_vec(),
            Encoding::Utf16Le => s.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect(),
        }
    }

    fn encode_char(&self, c: char) -> Vec<u8> {
        let mut buf = [0u8; 4];
        self.encode(c.encode_utf8(&mut buf))
    }
}

/// Encodes `s` to exactly `target_len` bytes: whole characters are dropped
/// from the end until it fits, then the gap is filled with spaces (and a raw
/// `0x20` for a remainder narrower than one space).
pub fn fit_to_byte_len(s: &str, target_len: usize, encoding: Encoding) -> Vec<u8> {
    let mut out = Vec::with_capacity(target_len);
    for c in s.chars() {
        let encoded = encoding.encode_char(c);
        if out.len() + encoded.len() > target_len {
            break;
        }
        out.extend_from_slice(&encoded);
    }
    let space = encoding.encode_char(' ');
    while out.len() + space.len() <= target_len {
        out.extend_from_slice(&space);
    }
    out.resize(target_len, b' ');
    out
}

/// Overwrites every occurrence of `pattern` with `replacement` (same length),
/// resuming the search after each match. Returns the number of matches.
fn replace_bytes(data: &mut [u8], pattern: &[u8], replacement: &[u8]) -> usize {
    if pattern.is_empty() || pattern.len() != replacement.len() || pattern.len() > data.len() {
        return 0;
    }
    let mut count = 0;
    let mut i = 0;
    while i + pattern.len() <= data.len() {
        if &data[i..i + pattern.len()] == pattern {
            data[i..i + pattern.len()].copy_from_slice(replacement);
            count += 1;
            i += pattern.len();
        } else {
            i += 1;
        }
    }
    count
}

/// Replaces `old` by `new` in one encoding, keeping the byte length of `old`.
pub fn replace_encoded(table: &mut [u8], old: &str, new: &str, encoding: Encoding) -> usize {
    let pattern = encoding.encode(old);
    let replacement = fit_to_byte_len(new, pattern.len(), encoding);
    replace_bytes(table, &pattern, &replacement)
}

/// Applies each `(old, new)` target in both encodings. Targets absent from
/// the table are skipped silently; compare the result with the input to detect
/// that nothing changed.
pub fn replace(table: &[u8], targets: &[(&str, &str)]) -> Vec<u8> {
    let mut out = table.to_vec();
    for (old, new) in targets {
        let utf8 = replace_encoded(&mut out, old, new, Encoding::Utf8);
        let utf16 = replace_encoded(&mut out, old, new, Encoding::Utf16Le);
        log::debug!("Replaced {:?}: {} UTF-8, {} UTF-16 occurrences", old, utf8, utf16);
    }
    out
}

/// Spellings under which the template's display name may be stored, most
/// specific first.
fn app_name_variants(original: &str) -> Vec<String> {
    let mut variants: Vec<String> = vec![];
    for candidate in [
        original.to_string(),
        original.replace('\u{a0}', " "),
        original.trim().to_string(),
        "WebToApp".to_string(),
        "webtoapp".to_string(),
    ] {
        if !candidate.is_empty() && !variants.contains(&candidate) {
            variants.push(candidate);
        }
    }
    variants
}

/// Replaces the template's display name with `new_name`.
///
/// Variants of `original_name` are tried in order; the first one found in
/// either encoding wins and the rest are not attempted.
pub fn replace_app_name(table: &[u8], original_name: &str, new_name: &str) -> Vec<u8> {
    let mut out = table.to_vec();
    for variant in app_name_variants(original_name) {
        for encoding in [Encoding::Utf8, Encoding::Utf16Le] {
            let count = replace_encoded(&mut out, &variant, new_name, encoding);
            if count > 0 {
                log::info!(
                    "Replaced app name variant of {} chars ({:?}, {} occurrences)",
                    variant.chars().count(),
                    encoding,
                    count
                );
                return out;
            }
        }
    }
    log::debug!("No app name variant found in resource table");
    out
}

pub const FOREGROUND_PATHS: [&str; 6] = [
    "res/drawable/ic_launcher_foreground",
    "res/drawable/ic_launcher_foreground_new",
    "res/drawable-v24/ic_launcher_foreground",
    "res/drawable-v24/ic_launcher_foreground_new",
    "res/drawable-anydpi-v24/ic_launcher_foreground",
    "res/drawable-anydpi-v24/ic_launcher_foreground_new",
];

const EXTENSION_SWAPS: [(&str, &str); 2] = [(".xml", ".png"), (".jpg", ".png")];

/// Points adaptive-icon foreground references at `.png` files so that a
/// raster foreground written into the archive is picked up.
pub fn swap_icon_paths_to_png(table: &[u8]) -> Vec<u8> {
    let mut out = table.to_vec();
    for base in FOREGROUND_PATHS {
        for (from, to) in EXTENSION_SWAPS {
            let old_path = format!("{}{}", base, from);
            let new_path = format!("{}{}", base, to);
            if old_path.len() != new_path.len() {
                continue;
            }
            let count = replace_bytes(&mut out, old_path.as_bytes(), new_path.as_bytes());
            if count > 0 {
                log::debug!("Retargeted {} -> {}", old_path, new_path);
            }
        }
    }
    out
}
