pub mod archive;
pub mod arsc;
pub mod axml;
pub mod builder;
pub mod icon;
pub mod package_name;
pub mod rebuild;
pub mod res;
pub mod sign;

/// Entry names every template is expected to carry.
pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";
pub const RESOURCE_TABLE_ENTRY: &str = "resources.arsc";
