use crate::core::config::IdentifierConfig;
use anyhow::Result;

/// Derives package names of the form `<prefix>.<token>` from app names.
///
/// The token is a base-36 rendering of the app name's Java string hash, so
/// the same name always yields the same package. The token is narrowed when
/// needed so the result never exceeds the template's package name length.
#[derive(Clone, Debug)]
pub struct PackageNameDeriver {
    prefix: String,
    token_width: usize,
}

impl PackageNameDeriver {
    pub fn new(prefix: impl Into<String>, token_width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            token_width,
        }
    }

    pub fn from_config(config: &IdentifierConfig) -> Self {
        Self::new(config.prefix.clone(), config.token_width)
    }

    pub fn derive(&self, app_name: &str, template_package: &str) -> Result<String> {
        let room = template_package
            .len()
            .saturating_sub(self.prefix.len() + 1);
        let width = self.token_width.min(room);
        anyhow::ensure!(
            width > 0,
            "Prefix `{}` leaves no room for a token within `{}`",
            self.prefix,
            template_package
        );
        let name = format!("{}.{}", self.prefix, token(java_hash_code(app_name), width));
        anyhow::ensure!(
            is_valid_package_name(&name),
            "Derived package name `{}` is not valid",
            name
        );
        Ok(name)
    }
}

/// `java.lang.String#hashCode` over UTF-16 code units.
pub fn java_hash_code(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

fn to_base36(value: i64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let negative = value < 0;
    let mut n = value.unsigned_abs();
    let mut digits = vec![];
    loop {
        digits.push(DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    if negative {
        digits.push(b'-');
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

fn token(hash: i32, width: usize) -> String {
    // i32::MIN has no positive counterpart and keeps its sign.
    let raw: String = to_base36(hash.wrapping_abs() as i64).chars().take(width).collect();
    let padded = format!("{:0>width$}", raw, width = width).to_lowercase();
    let mut chars = padded.chars();
    let first = match chars.next() {
        Some(c @ 'a'..='z') => c,
        Some(c @ '0'..='9') => (b'a' + (c as u8 - b'0')) as char,
        _ => 'a',
    };
    std::iter::once(first).chain(chars).collect()
}

fn is_segment(segment: &str, first_allows_underscore: bool) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some('a'..='z') => {}
        Some('_') if first_allows_underscore => {}
        _ => return false,
    }
    chars.all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
}

/// Whether `name` is a lowercase dotted package name with at least two
/// segments: `[a-z][a-z0-9_]*(\.[a-z_][a-z0-9_]*)+`.
pub fn is_valid_package_name(name: &str) -> bool {
    let mut segments = name.split('.');
    let first_ok = segments.next().map_or(false, |s| is_segment(s, false));
    let mut rest = 0;
    for segment in segments {
        if !is_segment(segment, true) {
            return false;
        }
        rest += 1;
    }
    first_ok && rest > 0
}

/// Checks a caller-chosen package name against the grammar and the length of
/// the template's package name.
pub fn validate(name: &str, template_package: &str) -> Result<()> {
    anyhow::ensure!(
        is_valid_package_name(name),
        "`{}` is not a valid package name",
        name
    );
    anyhow::ensure!(
        name.len() <= template_package.len(),
        "`{}` is longer than the template package `{}`",
        name,
        template_package
    );
    Ok(())
}
