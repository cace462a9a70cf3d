//! Template-based APK rebranding: manifest and resource table surgery,
//! archive rewriting and v1+v2 re-signing.

pub mod apk;
pub mod core;

pub use crate::apk::builder::{ApkBuilder, BuildMessage, BuildResult, BuildStage, CancelHandle};
pub use crate::core::config::{BuildConfig, BuilderConfig};
pub use crate::core::error::BuildError;
