//! Copying a template archive while replacing selected entries.

use super::arsc::FOREGROUND_PATHS;
use super::icon::{
    is_icon_entry, Scaler, ScalerOpts, ADAPTIVE_SIZE, LAUNCHER_ICONS, ROUND_LAUNCHER_ICONS,
};
use super::RESOURCE_TABLE_ENTRY;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZipFileOptions {
    Unaligned,
    Aligned(u16),
    Compressed,
}

impl ZipFileOptions {
    pub fn alignment(self) -> u16 {
        match self {
            Self::Aligned(align) => align,
            _ => 1,
        }
    }

    pub fn compression_method(&self) -> CompressionMethod {
        match self {
            Self::Compressed => CompressionMethod::Deflated,
            _ => CompressionMethod::Stored,
        }
    }
}

/// Output archive. Entries go in the order they are written.
pub struct ApkWriter {
    zip: ZipWriter<File>,
}

impl ApkWriter {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("While creating `{}`", path.display()))?;
        Ok(Self {
            zip: ZipWriter::new(file),
        })
    }

    pub fn create_file(&mut self, name: &str, opts: ZipFileOptions, contents: &[u8]) -> Result<()> {
        self.start_file(name, opts, FileOptions::default())?;
        self.zip
            .write_all(contents)
            .with_context(|| format!("While writing `{}`", name))?;
        Ok(())
    }

    /// Copies an entry without recompressing it.
    pub fn raw_copy(&mut self, file: zip::read::ZipFile) -> Result<()> {
        let name = file.name().to_string();
        self.zip
            .raw_copy_file(file)
            .with_context(|| format!("While copying `{}`", name))?;
        Ok(())
    }

    fn start_file(&mut self, name: &str, opts: ZipFileOptions, base: FileOptions) -> Result<()> {
        let zopts = base.compression_method(opts.compression_method());
        self.zip
            .start_file_aligned(name, zopts, opts.alignment())
            .with_context(|| format!("While starting `{}`", name))?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.zip.finish()?;
        Ok(())
    }
}

/// Replacement contents keyed by entry name, plus the launcher icon.
#[derive(Default)]
pub struct TransformTable {
    entries: Vec<(String, ZipFileOptions, Vec<u8>)>,
    icon: Option<Scaler>,
}

impl TransformTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the contents of `name`, added at the end if the source lacks it.
    pub fn replace(&mut self, name: impl Into<String>, opts: ZipFileOptions, data: Vec<u8>) {
        let name = name.into();
        self.entries.retain(|(existing, _, _)| *existing != name);
        self.entries.push((name, opts, data));
    }

    pub fn set_icon(&mut self, icon: Scaler) {
        self.icon = Some(icon);
    }

    pub fn has_icon(&self) -> bool {
        self.icon.is_some()
    }

    fn get(&self, name: &str) -> Option<(ZipFileOptions, &[u8])> {
        self.entries
            .iter()
            .find(|(existing, _, _)| existing == name)
            .map(|(_, opts, data)| (*opts, data.as_slice()))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RewriteStats {
    pub copied: usize,
    pub replaced: usize,
    pub added: usize,
    pub icons_replaced: usize,
    pub signatures_dropped: usize,
}

/// Entries of a previous v1 signature.
pub fn is_signature_entry(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    file == "MANIFEST.MF"
        || [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|ext| file.ends_with(ext))
}

fn foreground_png(base: &str) -> String {
    format!("{}.png", base)
}

fn is_foreground_png(name: &str) -> bool {
    FOREGROUND_PATHS
        .iter()
        .any(|base| name == foreground_png(base))
}

fn icon_png(icon: &Scaler, name: &str) -> Result<Vec<u8>> {
    let opts = if is_foreground_png(name) {
        ScalerOpts::adaptive_foreground(ADAPTIVE_SIZE)
    } else {
        ScalerOpts::for_entry(name)
    };
    icon.png(opts)
        .with_context(|| format!("While rendering icon `{}`", name))
}

pub fn list_entries(archive: &Path) -> Result<Vec<String>> {
    let archive = ZipArchive::new(
        File::open(archive).with_context(|| format!("While opening `{}`", archive.display()))?,
    )?;
    Ok(archive.file_names().map(str::to_string).collect())
}

pub fn read_entry(archive: &Path, name: &str) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(
        File::open(archive).with_context(|| format!("While opening `{}`", archive.display()))?,
    )?;
    let mut f = archive
        .by_name(name)
        .with_context(|| format!("While looking up `{}`", name))?;
    let mut buf = Vec::with_capacity(f.size() as usize);
    f.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Writes `dest` from `source` with the entries in `table` replaced or added
/// and any previous signature dropped.
///
/// `resources.arsc` is written first and every stored entry is 4-byte
/// aligned. `progress` receives `(done, total)` after each source entry. On
/// failure `dest` is removed.
pub fn rewrite(
    source: &Path,
    dest: &Path,
    table: &TransformTable,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<RewriteStats> {
    let result = rewrite_inner(source, dest, table, progress);
    if result.is_err() && dest.exists() {
        if let Err(err) = std::fs::remove_file(dest) {
            log::warn!("Could not remove `{}`: {}", dest.display(), err);
        }
    }
    result
}

fn rewrite_inner(
    source: &Path,
    dest: &Path,
    table: &TransformTable,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<RewriteStats> {
    let file =
        File::open(source).with_context(|| format!("While opening `{}`", source.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("While reading `{}`", source.display()))?;

    let names: Vec<String> = (0..archive.len())
        .map(|i| Ok(archive.by_index_raw(i)?.name().to_string()))
        .collect::<Result<_>>()?;
    let mut order: Vec<usize> = (0..names.len()).collect();
    order.sort_by_key(|&i| names[i] != RESOURCE_TABLE_ENTRY);

    let mut writer = ApkWriter::new(dest)?;
    let mut stats = RewriteStats::default();
    let mut seen = HashSet::new();

    for (done, &i) in order.iter().enumerate() {
        let name = names[i].as_str();
        seen.insert(name.to_string());
        if is_signature_entry(name) {
            log::debug!("Dropping signature entry `{}`", name);
            stats.signatures_dropped += 1;
        } else if let Some((opts, data)) = table.get(name) {
            writer.create_file(name, opts, data)?;
            stats.replaced += 1;
        } else if let Some(icon) = table
            .icon
            .as_ref()
            .filter(|_| is_icon_entry(name) || is_foreground_png(name))
        {
            writer.create_file(name, ZipFileOptions::Compressed, &icon_png(icon, name)?)?;
            stats.icons_replaced += 1;
        } else {
            let entry = archive.by_index_raw(i)?;
            if entry.compression() == CompressionMethod::Stored && !entry.is_dir() {
                drop(entry);
                let mut entry = archive.by_index(i)?;
                let base = FileOptions::default().last_modified_time(entry.last_modified());
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut data)
                    .with_context(|| format!("While reading `{}`", name))?;
                writer.start_file(name, ZipFileOptions::Aligned(4), base)?;
                writer.zip.write_all(&data)?;
            } else {
                writer.raw_copy(entry)?;
            }
            stats.copied += 1;
        }
        progress(done + 1, order.len());
    }

    for (name, opts, data) in &table.entries {
        if !seen.contains(name) {
            log::debug!("Adding `{}`", name);
            writer.create_file(name, *opts, data)?;
            stats.added += 1;
        }
    }

    if let Some(icon) = &table.icon {
        if stats.icons_replaced == 0 {
            log::info!("Template has no launcher icons, adding them");
            for (name, size) in LAUNCHER_ICONS {
                writer.create_file(name, ZipFileOptions::Compressed, &icon.png(ScalerOpts::new(size))?)?;
                stats.added += 1;
            }
            for (name, size) in ROUND_LAUNCHER_ICONS {
                writer.create_file(name, ZipFileOptions::Compressed, &icon.png(ScalerOpts::round(size))?)?;
                stats.added += 1;
            }
        }
        for base in FOREGROUND_PATHS {
            let png = foreground_png(base);
            let has_vector = [".xml", ".jpg"]
                .iter()
                .any(|ext| seen.contains(&format!("{}{}", base, ext)));
            if has_vector && !seen.contains(&png) {
                log::debug!("Adding adaptive foreground `{}`", png);
                writer.create_file(&png, ZipFileOptions::Compressed, &icon_png(icon, &png)?)?;
                stats.added += 1;
            }
        }
    }

    writer.finish()?;
    log::info!("Rewrote archive: {:?}", stats);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};
    use tempfile::tempdir;

    fn write_template(path: &Path, entries: &[(&str, ZipFileOptions, &[u8])]) {
        let mut writer = ApkWriter::new(path).unwrap();
        for (name, opts, data) in entries {
            writer.create_file(name, *opts, data).unwrap();
        }
        writer.finish().unwrap();
    }

    fn entries(path: &Path) -> Vec<(String, CompressionMethod, Vec<u8>)> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut f = archive.by_index(i).unwrap();
                let mut data = vec![];
                f.read_to_end(&mut data).unwrap();
                (f.name().to_string(), f.compression(), data)
            })
            .collect()
    }

    fn red_icon() -> Scaler {
        let img = RgbaImage::from_pixel(64, 64, Rgba([255, 0, 0, 255]));
        Scaler::from_image(DynamicImage::ImageRgba8(img)).unwrap()
    }

    #[test]
    fn empty_table_round_trips() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("template.apk");
        let dest = dir.path().join("out.apk");
        write_template(
            &source,
            &[
                ("AndroidManifest.xml", ZipFileOptions::Compressed, b"manifest"),
                ("classes.dex", ZipFileOptions::Compressed, b"dex"),
                ("lib/arm64-v8a/libx.so", ZipFileOptions::Aligned(4096), b"\x7fELF"),
                (RESOURCE_TABLE_ENTRY, ZipFileOptions::Unaligned, b"table"),
            ],
        );
        let mut calls = vec![];
        let stats = rewrite(&source, &dest, &TransformTable::new(), &mut |done, total| {
            calls.push((done, total))
        })
        .unwrap();
        assert_eq!(stats.copied, 4);
        assert_eq!(calls.last(), Some(&(4, 4)));

        let mut before = entries(&source);
        let after = entries(&dest);
        assert_eq!(after[0].0, RESOURCE_TABLE_ENTRY);
        before.sort_by_key(|(name, _, _)| name != RESOURCE_TABLE_ENTRY);
        assert_eq!(before, after);
    }

    #[test]
    fn stored_entries_are_aligned() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("template.apk");
        let dest = dir.path().join("out.apk");
        write_template(
            &source,
            &[
                ("a", ZipFileOptions::Compressed, b"x"),
                ("odd-name.bin", ZipFileOptions::Unaligned, b"stored"),
                (RESOURCE_TABLE_ENTRY, ZipFileOptions::Unaligned, b"old table"),
            ],
        );
        let mut table = TransformTable::new();
        table.replace(RESOURCE_TABLE_ENTRY, ZipFileOptions::Aligned(4), b"new table".to_vec());
        rewrite(&source, &dest, &table, &mut |_, _| {}).unwrap();

        let mut archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let arsc = archive.by_index(0).unwrap();
        assert_eq!(arsc.name(), RESOURCE_TABLE_ENTRY);
        assert_eq!(arsc.data_start() % 4, 0);
        drop(arsc);
        let stored = archive.by_name("odd-name.bin").unwrap();
        assert_eq!(stored.compression(), CompressionMethod::Stored);
        assert_eq!(stored.data_start() % 4, 0);
        drop(stored);
        assert_eq!(read_entry(&dest, RESOURCE_TABLE_ENTRY).unwrap(), b"new table");
    }

    #[test]
    fn drops_signatures_and_adds_missing_entries() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("template.apk");
        let dest = dir.path().join("out.apk");
        write_template(
            &source,
            &[
                ("META-INF/MANIFEST.MF", ZipFileOptions::Compressed, b"m"),
                ("META-INF/CERT.SF", ZipFileOptions::Compressed, b"s"),
                ("META-INF/CERT.RSA", ZipFileOptions::Compressed, b"r"),
                ("META-INF/services/x.Provider", ZipFileOptions::Compressed, b"keep"),
                ("classes.dex", ZipFileOptions::Compressed, b"dex"),
            ],
        );
        let mut table = TransformTable::new();
        table.replace("assets/app_config.json", ZipFileOptions::Compressed, b"{}".to_vec());
        let stats = rewrite(&source, &dest, &table, &mut |_, _| {}).unwrap();
        assert_eq!(stats.signatures_dropped, 3);
        assert_eq!(stats.added, 1);
        assert_eq!(
            list_entries(&dest).unwrap(),
            vec!["META-INF/services/x.Provider", "classes.dex", "assets/app_config.json"]
        );
    }

    #[test]
    fn replaces_icons_at_their_density() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("template.apk");
        let dest = dir.path().join("out.apk");
        write_template(
            &source,
            &[
                ("res/mipmap-hdpi-v4/ic_launcher.png", ZipFileOptions::Unaligned, b"old"),
                ("res/mipmap-xxhdpi/ic_launcher_round.png", ZipFileOptions::Unaligned, b"old"),
                (
                    "res/drawable/ic_launcher_foreground.xml",
                    ZipFileOptions::Compressed,
                    b"<vector/>",
                ),
            ],
        );
        let mut table = TransformTable::new();
        table.set_icon(red_icon());
        let stats = rewrite(&source, &dest, &table, &mut |_, _| {}).unwrap();
        assert_eq!(stats.icons_replaced, 2);
        assert_eq!(stats.added, 1);

        let hdpi = read_entry(&dest, "res/mipmap-hdpi-v4/ic_launcher.png").unwrap();
        let img = image::load_from_memory(&hdpi).unwrap();
        assert_eq!((img.width(), img.height()), (72, 72));
        let round = read_entry(&dest, "res/mipmap-xxhdpi/ic_launcher_round.png").unwrap();
        let img = image::load_from_memory(&round).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (144, 144));
        assert_eq!(img.get_pixel(0, 0)[3], 0);
        let fg = read_entry(&dest, "res/drawable/ic_launcher_foreground.png").unwrap();
        assert_eq!(image::load_from_memory(&fg).unwrap().width(), ADAPTIVE_SIZE);
    }

    #[test]
    fn synthesizes_icons_when_template_has_none() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("template.apk");
        let dest = dir.path().join("out.apk");
        write_template(&source, &[("classes.dex", ZipFileOptions::Compressed, b"dex")]);
        let mut table = TransformTable::new();
        table.set_icon(red_icon());
        let stats = rewrite(&source, &dest, &table, &mut |_, _| {}).unwrap();
        assert_eq!(stats.added, LAUNCHER_ICONS.len() + ROUND_LAUNCHER_ICONS.len());
        let names = list_entries(&dest).unwrap();
        for (name, _) in LAUNCHER_ICONS.iter().chain(ROUND_LAUNCHER_ICONS.iter()) {
            assert!(names.iter().any(|n| n == name), "{}", name);
        }
    }

    #[test]
    fn failed_rewrite_leaves_no_output() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("not-a-zip.apk");
        let dest = dir.path().join("out.apk");
        std::fs::write(&source, b"garbage").unwrap();
        assert!(rewrite(&source, &dest, &TransformTable::new(), &mut |_, _| {}).is_err());
        assert!(!dest.exists());
        assert!(rewrite(&dir.path().join("missing.apk"), &dest, &TransformTable::new(), &mut |_, _| {}).is_err());
    }

    #[test]
    fn recognizes_signature_entries() {
        assert!(is_signature_entry("META-INF/MANIFEST.MF"));
        assert!(is_signature_entry("META-INF/ANDROIDD.RSA"));
        assert!(is_signature_entry("META-INF/KEY.EC"));
        assert!(!is_signature_entry("META-INF/services/foo"));
        assert!(!is_signature_entry("META-INF/kotlin.kotlin_module"));
        assert!(!is_signature_entry("assets/CERT.SF"));
    }
}
