//! Launcher icon rasterisation and icon entry matching.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use image::{DynamicImage, GenericImageView, ImageOutputFormat, RgbaImage};
use std::io::{Cursor, Seek, Write};
use std::path::Path;

/// Launcher icons added when the template carries none that could be
/// replaced.
pub const LAUNCHER_ICONS: [(&str, u32); 5] = [
    ("res/mipmap-mdpi-v4/ic_launcher.png", 48),
    ("res/mipmap-hdpi-v4/ic_launcher.png", 72),
    ("res/mipmap-xhdpi-v4/ic_launcher.png", 96),
    ("res/mipmap-xxhdpi-v4/ic_launcher.png", 144),
    ("res/mipmap-xxxhdpi-v4/ic_launcher.png", 192),
];

pub const ROUND_LAUNCHER_ICONS: [(&str, u32); 5] = [
    ("res/mipmap-mdpi-v4/ic_launcher_round.png", 48),
    ("res/mipmap-hdpi-v4/ic_launcher_round.png", 72),
    ("res/mipmap-xhdpi-v4/ic_launcher_round.png", 96),
    ("res/mipmap-xxhdpi-v4/ic_launcher_round.png", 144),
    ("res/mipmap-xxxhdpi-v4/ic_launcher_round.png", 192),
];

pub const ADAPTIVE_FOREGROUND_XML: &str = "res/drawable/ic_launcher_foreground.xml";
pub const ADAPTIVE_FOREGROUND_PNG: &str = "res/drawable/ic_launcher_foreground.png";
/// Adaptive icon layer size and the part of it that is always visible.
pub const ADAPTIVE_SIZE: u32 = 108;
pub const ADAPTIVE_SAFE_ZONE: u32 = 72;

const ICON_FILE_NAMES: [&str; 4] = [
    "ic_launcher.png",
    "ic_launcher_round.png",
    "ic_launcher_foreground.png",
    "ic_launcher_background.png",
];

/// Density qualifiers and their launcher icon sizes, most specific first so
/// that `xxxhdpi` is not taken for `xxhdpi` or `hdpi`.
const DENSITIES: [(&str, u32); 6] = [
    ("xxxhdpi", 192),
    ("xxhdpi", 144),
    ("xhdpi", 96),
    ("hdpi", 72),
    ("mdpi", 48),
    ("ldpi", 36),
];

const DEFAULT_ICON_SIZE: u32 = 96;

fn known_size(name: &str) -> Option<u32> {
    LAUNCHER_ICONS
        .iter()
        .chain(ROUND_LAUNCHER_ICONS.iter())
        .find(|(path, _)| *path == name)
        .map(|(_, size)| *size)
}

/// Whether archive entry `name` is a raster launcher icon that should be
/// replaced by the app's icon.
pub fn is_icon_entry(name: &str) -> bool {
    if known_size(name).is_some() {
        return true;
    }
    ICON_FILE_NAMES.iter().any(|file| name.ends_with(file))
        && (name.contains("mipmap") || name.contains("drawable"))
}

/// Pixel size for the icon at `name`, inferred from its density qualifier.
pub fn icon_size_for(name: &str) -> u32 {
    known_size(name).unwrap_or_else(|| {
        DENSITIES
            .iter()
            .find(|(density, _)| name.contains(density))
            .map_or(DEFAULT_ICON_SIZE, |(_, size)| *size)
    })
}

/// Options for one icon written by the scaler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScalerOpts {
    target_width: u32,
    target_height: u32,
    scaled_size: u32,
    round: bool,
}

impl ScalerOpts {
    pub fn new(size: u32) -> Self {
        Self {
            target_width: size,
            target_height: size,
            scaled_size: size,
            round: false,
        }
    }

    /// Circular icon, transparent outside the inscribed circle.
    pub fn round(size: u32) -> Self {
        Self {
            round: true,
            ..Self::new(size)
        }
    }

    /// Adaptive icon foreground: the image fills the centered safe zone of a
    /// transparent layer.
    pub fn adaptive_foreground(size: u32) -> Self {
        Self {
            target_width: size,
            target_height: size,
            scaled_size: size * ADAPTIVE_SAFE_ZONE / ADAPTIVE_SIZE,
            round: false,
        }
    }

    /// Options for replacing archive entry `name`.
    pub fn for_entry(name: &str) -> Self {
        let size = icon_size_for(name);
        if name.contains("round") {
            Self::round(size)
        } else {
            Self::new(size)
        }
    }
}

pub struct Scaler {
    img: DynamicImage,
}

impl Scaler {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let img = ImageReader::open(path)
            .with_context(|| format!("Scaler failed to open image at `{}`", path.display()))?
            .with_guessed_format()?
            .decode()
            .with_context(|| format!("While decoding icon `{}`", path.display()))?;
        Self::from_image(img)
    }

    pub fn from_image(img: DynamicImage) -> Result<Self> {
        let (width, height) = img.dimensions();
        anyhow::ensure!(width > 0 && height > 0, "icon has no pixels");
        if width != height {
            log::warn!("Icon is {}x{}, it will be stretched to a square", width, height);
        }
        Ok(Self { img })
    }

    /// Drops color or alpha channels the image does not use.
    pub fn optimize(&mut self) {
        let mut is_grayscale = true;
        let mut is_opaque = true;
        let (width, height) = self.img.dimensions();
        'scan: for x in 0..width {
            for y in 0..height {
                let pixel = self.img.get_pixel(x, y);
                if pixel[0] != pixel[1] || pixel[1] != pixel[2] {
                    is_grayscale = false;
                }
                if pixel[3] != 255 {
                    is_opaque = false;
                }
                if !is_grayscale && !is_opaque {
                    break 'scan;
                }
            }
        }
        match (is_grayscale, is_opaque) {
            (true, true) => self.img = DynamicImage::ImageLuma8(self.img.to_luma8()),
            (true, false) => self.img = DynamicImage::ImageLumaA8(self.img.to_luma_alpha8()),
            (false, true) => self.img = DynamicImage::ImageRgb8(self.img.to_rgb8()),
            (false, false) => {}
        }
    }

    pub fn write<W: Write + Seek>(&self, w: &mut W, opts: ScalerOpts) -> Result<()> {
        let resized = self
            .img
            .resize_exact(opts.scaled_size, opts.scaled_size, FilterType::Triangle);
        if opts.round {
            let mut masked = resized.to_rgba8();
            mask_circle(&mut masked);
            masked.write_to(w, ImageOutputFormat::Png)?;
        } else if opts.scaled_size == opts.target_width && opts.scaled_size == opts.target_height {
            resized.write_to(w, ImageOutputFormat::Png)?;
        } else {
            let x = (opts.target_width - opts.scaled_size) / 2;
            let y = (opts.target_height - opts.scaled_size) / 2;
            let mut padded = RgbaImage::new(opts.target_width, opts.target_height);
            image::imageops::overlay(&mut padded, &resized, x as i64, y as i64);
            padded.write_to(w, ImageOutputFormat::Png)?;
        }
        Ok(())
    }

    pub fn png(&self, opts: ScalerOpts) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(vec![]);
        self.write(&mut cursor, opts)?;
        Ok(cursor.into_inner())
    }
}

/// Clears alpha outside the inscribed circle, with a one pixel soft edge.
fn mask_circle(img: &mut RgbaImage) {
    let (width, height) = img.dimensions();
    let radius = width.min(height) as f32 / 2.0;
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - cx;
        let dy = y as f32 + 0.5 - cy;
        let coverage = (radius - (dx * dx + dy * dy).sqrt() + 0.5).clamp(0.0, 1.0);
        pixel[3] = (pixel[3] as f32 * coverage).round() as u8;
    }
}
