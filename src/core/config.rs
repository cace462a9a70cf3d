use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Entry inside the output package holding the rendered config payload.
pub const CONFIG_ENTRY: &str = "assets/app_config.json";

/// Builder-wide settings, usually read from a TOML file.
///
/// Every section carries `#[serde(default)]`, so a missing or broken section
/// falls back to its defaults without invalidating its siblings.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct BuilderConfig {
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub identifier: IdentifierConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TemplateConfig {
    /// Package name compiled into the template. Used when the manifest itself
    /// cannot be read.
    #[serde(default = "default_original_package")]
    pub original_package: String,
    /// Display name compiled into the template's resource table.
    #[serde(default = "default_original_app_name")]
    pub original_app_name: String,
    #[serde(default = "default_config_entry")]
    pub config_entry: String,
    /// Class name suffixes (relative to `original_package`) which must keep
    /// pointing at the template's classes after the package name changes.
    #[serde(default = "default_component_classes")]
    pub component_classes: Vec<String>,
}

fn default_original_package() -> String {
    "com.webtoapp".to_string()
}

fn default_original_app_name() -> String {
    "WebToApp".to_string()
}

fn default_config_entry() -> String {
    CONFIG_ENTRY.to_string()
}

fn default_component_classes() -> Vec<String> {
    vec![
        "WebToAppApplication".to_string(),
        "ui.MainActivity".to_string(),
        "ui.webview.WebViewActivity".to_string(),
        "ui.shell.ShellActivity".to_string(),
    ]
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            original_package: default_original_package(),
            original_app_name: default_original_app_name(),
            config_entry: default_config_entry(),
            component_classes: default_component_classes(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IdentifierConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_token_width")]
    pub token_width: usize,
}

fn default_prefix() -> String {
    "com.w2a".to_string()
}

fn default_token_width() -> usize {
    4
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            token_width: default_token_width(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SigningConfig {
    #[serde(default = "default_keystore_dir")]
    pub keystore_dir: PathBuf,
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
    #[serde(default = "default_common_name")]
    pub subject_common_name: String,
    #[serde(default = "default_organization")]
    pub subject_organization: String,
    #[serde(default = "default_country")]
    pub subject_country: String,
    #[serde(default = "default_validity_years")]
    pub validity_years: u32,
    #[serde(default = "default_serial")]
    pub serial: u64,
}

fn default_keystore_dir() -> PathBuf {
    PathBuf::from("keystore")
}

fn default_key_bits() -> usize {
    2048
}

fn default_common_name() -> String {
    "WebToApp".to_string()
}

fn default_organization() -> String {
    "WebToApp".to_string()
}

fn default_country() -> String {
    "CN".to_string()
}

fn default_validity_years() -> u32 {
    30
}

fn default_serial() -> u64 {
    1
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            keystore_dir: default_keystore_dir(),
            key_bits: default_key_bits(),
            subject_common_name: default_common_name(),
            subject_organization: default_organization(),
            subject_country: default_country(),
            validity_years: default_validity_years(),
            serial: default_serial(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputConfig {
    /// Parent of the per-build scratch directories.
    #[serde(default = "std::env::temp_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("build")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir(),
            output_dir: default_output_dir(),
        }
    }
}

/// Reads the builder config at `path`. A missing or malformed file yields the
/// defaults.
pub fn parse_config(path: &Path) -> BuilderConfig {
    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str::<BuilderConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Malformed config `{}`, using defaults: {}", path.display(), err);
                BuilderConfig::default()
            }
        },
        Err(err) => {
            log::info!("No config at `{}` ({}), using defaults", path.display(), err);
            BuilderConfig::default()
        }
    }
}

/// One build request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BuildConfig {
    pub app_name: String,
    /// Caller-chosen package name. Derived from `app_name` when absent.
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default = "default_version_code")]
    pub version_code: u32,
    #[serde(default = "default_version_name")]
    pub version_name: String,
    #[serde(default)]
    pub icon: Option<PathBuf>,
    /// Free-form app configuration shipped to the installed app as JSON.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

fn default_version_code() -> u32 {
    1
}

fn default_version_name() -> String {
    "1.0.0".to_string()
}

impl BuildConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            package_name: None,
            version_code: default_version_code(),
            version_name: default_version_name(),
            icon: None,
            payload: Map::new(),
        }
    }

    /// Renders the config entry: the payload with the identity keys the
    /// installed app reads on startup set at top level.
    pub fn render_payload(&self, package_name: &str) -> Result<Vec<u8>> {
        let mut doc = self.payload.clone();
        doc.insert("appName".into(), Value::String(self.app_name.clone()));
        doc.insert("packageName".into(), Value::String(package_name.to_string()));
        doc.insert("versionCode".into(), Value::from(self.version_code));
        doc.insert("versionName".into(), Value::String(self.version_name.clone()));
        serde_json::to_vec_pretty(&Value::Object(doc)).context("While rendering config payload")
    }

    /// File name for the signed package, e.g. `My_App_v1.0.0.apk`.
    pub fn output_file_name(&self) -> String {
        let sanitized: String = self
            .app_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' || ('\u{4e00}'..='\u{9fa5}').contains(&c) {
                    c
                } else {
                    '_'
                }
            })
            .take(50)
            .collect();
        format!("{}_v{}.apk", sanitized, self.version_name)
    }
}
