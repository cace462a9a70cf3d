/// Failure taxonomy surfaced by a build.
///
/// Manifest and resource table failures are soft: they are logged and reported
/// through the progress channel while the build goes on. The builder escalates
/// a manifest failure only when the package name could not be changed at all.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BuildError {
    TemplateUnavailable(String),
    ArchiveIo(String),
    ManifestPatchFailed(String),
    ResourceTablePatchSkipped(String),
    InvalidIdentifier(String),
    SigningKeyUnavailable(String),
    SigningFailed(String),
    VerificationFailed(String),
    Cancelled,
}

impl BuildError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BuildError::ManifestPatchFailed(_) | BuildError::ResourceTablePatchSkipped(_)
        )
    }

    pub(crate) fn archive(err: anyhow::Error) -> Self {
        BuildError::ArchiveIo(format!("{:#}", err))
    }
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::TemplateUnavailable(msg) => write!(f, "Template unavailable: {}", msg),
            BuildError::ArchiveIo(msg) => write!(f, "Archive error: {}", msg),
            BuildError::ManifestPatchFailed(msg) => write!(f, "Manifest patch failed: {}", msg),
            BuildError::ResourceTablePatchSkipped(msg) => {
                write!(f, "Resource table patch skipped: {}", msg)
            }
            BuildError::InvalidIdentifier(msg) => write!(f, "Invalid package name: {}", msg),
            BuildError::SigningKeyUnavailable(msg) => write!(f, "Signing key unavailable: {}", msg),
            BuildError::SigningFailed(msg) => write!(f, "Signing failed: {}", msg),
            BuildError::VerificationFailed(msg) => write!(f, "Verification failed: {}", msg),
            BuildError::Cancelled => write!(f, "Build cancelled"),
        }
    }
}

impl std::error::Error for BuildError {}
