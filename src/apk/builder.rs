//! The build pipeline: identifier, manifest, resource table, archive,
//! signature, verification.

use super::archive::{self, TransformTable, ZipFileOptions};
use super::axml::{self, ManifestEdit, PatcherChain};
use super::icon::Scaler;
use super::package_name::{self, PackageNameDeriver};
use super::sign::{self, KeyStore};
use super::{arsc, MANIFEST_ENTRY, RESOURCE_TABLE_ENTRY};
use crate::core::config::{BuildConfig, BuilderConfig};
use crate::core::error::BuildError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildStage {
    Idle,
    DerivingIdentifier,
    PatchingManifest,
    PatchingResourceTable,
    RewritingArchive,
    Signing,
    Verifying,
    CleaningUp,
    Done,
}

impl BuildStage {
    /// Progress reported when the stage starts.
    pub fn percent(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::DerivingIdentifier => 10,
            Self::PatchingManifest => 20,
            Self::PatchingResourceTable | Self::RewritingArchive => 30,
            Self::Signing => 70,
            Self::Verifying => 85,
            Self::CleaningUp => 90,
            Self::Done => 100,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Idle => "Preparing",
            Self::DerivingIdentifier => "Deriving package name",
            Self::PatchingManifest => "Patching manifest",
            Self::PatchingResourceTable => "Patching resource table",
            Self::RewritingArchive => "Rewriting archive",
            Self::Signing => "Signing",
            Self::Verifying => "Verifying signature",
            Self::CleaningUp => "Cleaning up",
            Self::Done => "Done",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BuildResult {
    Success(PathBuf),
    Error(BuildError),
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Messages sent by a build running on its own thread.
#[derive(Clone, Debug, PartialEq)]
pub enum BuildMessage {
    Progress(u8, String),
    Done(BuildResult),
}

/// Stops a build before its next stage starts.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ApkBuilder {
    config: BuilderConfig,
    keystore: Arc<KeyStore>,
    patchers: PatcherChain,
    deriver: PackageNameDeriver,
}

/// State of one build: the current stage and where progress goes.
struct Run<'a> {
    stage: BuildStage,
    cancel: &'a CancelHandle,
    progress: &'a mut dyn FnMut(u8, &str),
    /// Set once this build starts writing `output`.
    output_touched: bool,
}

impl Run<'_> {
    fn enter(&mut self, stage: BuildStage) -> Result<(), BuildError> {
        // a stage that has started always runs to its end
        if self.cancel.is_cancelled() {
            log::info!("Build cancelled before {:?}", stage);
            return Err(BuildError::Cancelled);
        }
        if self.stage != BuildStage::Idle {
            log::info!("{:?} finished", self.stage);
        }
        log::info!("{:?} started", stage);
        self.stage = stage;
        self.report(stage.percent(), stage.message());
        Ok(())
    }

    fn report(&mut self, percent: u8, message: &str) {
        (self.progress)(percent, message);
    }

    /// Reports a soft failure and goes on.
    fn warn(&mut self, err: BuildError) {
        log::warn!("{}", err);
        let percent = self.stage.percent();
        self.report(percent, &err.to_string());
    }
}

fn remove_output(output: &Path) {
    if output.exists() {
        if let Err(err) = std::fs::remove_file(output) {
            log::warn!("Could not remove `{}`: {}", output.display(), err);
        }
    }
}

impl ApkBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        let keystore = Arc::new(KeyStore::new(config.signing.clone()));
        Self::with_keystore(config, keystore)
    }

    /// Builder sharing a key store with other builders.
    pub fn with_keystore(config: BuilderConfig, keystore: Arc<KeyStore>) -> Self {
        Self {
            deriver: PackageNameDeriver::from_config(&config.identifier),
            patchers: PatcherChain::default(),
            keystore,
            config,
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Runs the whole pipeline and writes the signed package to `output`.
    ///
    /// `progress` receives `(percent, message)` at each stage and for every
    /// soft failure. On error, whatever this build wrote to `output` is
    /// removed. A file already there stays if the build fails before the
    /// signing stage.
    pub fn build(
        &self,
        template: &Path,
        request: &BuildConfig,
        output: &Path,
        cancel: &CancelHandle,
        progress: &mut dyn FnMut(u8, &str),
    ) -> BuildResult {
        let mut run = Run {
            stage: BuildStage::Idle,
            cancel,
            progress,
            output_touched: false,
        };
        run.report(BuildStage::Idle.percent(), BuildStage::Idle.message());
        match self.execute(&mut run, template, request, output) {
            Ok(()) => {
                log::info!("Built `{}`", output.display());
                run.stage = BuildStage::Done;
                run.report(BuildStage::Done.percent(), BuildStage::Done.message());
                BuildResult::Success(output.to_path_buf())
            }
            Err(err) => {
                log::error!("Build failed during {:?}: {}", run.stage, err);
                if run.output_touched {
                    remove_output(output);
                }
                run.report(run.stage.percent(), &err.to_string());
                BuildResult::Error(err)
            }
        }
    }

    /// Runs [`ApkBuilder::build`] on a new thread. Progress and the final
    /// result arrive on the returned channel.
    pub fn spawn(
        self: Arc<Self>,
        template: PathBuf,
        request: BuildConfig,
        output: PathBuf,
        cancel: CancelHandle,
    ) -> (Receiver<BuildMessage>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn(move || {
            let progress_sender = sender.clone();
            let mut progress = |percent: u8, message: &str| {
                progress_sender
                    .send(BuildMessage::Progress(percent, message.to_string()))
                    .unwrap_or(());
            };
            let result = self.build(&template, &request, &output, &cancel, &mut progress);
            sender.send(BuildMessage::Done(result)).unwrap_or(());
        });
        (receiver, handle)
    }

    fn execute(
        &self,
        run: &mut Run<'_>,
        template: &Path,
        request: &BuildConfig,
        output: &Path,
    ) -> Result<(), BuildError> {
        archive::list_entries(template).map_err(|err| {
            BuildError::TemplateUnavailable(format!("{}: {:#}", template.display(), err))
        })?;
        let work = tempfile::Builder::new()
            .prefix("apk-rebrand-")
            .tempdir_in(&self.config.output.work_dir)
            .map_err(|err| BuildError::ArchiveIo(format!("While creating work dir: {}", err)))?;
        let unsigned = work.path().join("unsigned.apk");

        run.enter(BuildStage::DerivingIdentifier)?;
        let manifest = archive::read_entry(template, MANIFEST_ENTRY).map_err(|err| {
            BuildError::TemplateUnavailable(format!("{}: {:#}", MANIFEST_ENTRY, err))
        })?;
        let old_package = match axml::read_package(&manifest) {
            Ok(package) => package,
            Err(err) => {
                log::warn!("Could not read the template's package name: {:#}", err);
                self.config.template.original_package.clone()
            }
        };
        let package = self.package_name(request, &old_package)?;
        log::info!("Package name: {} -> {}", old_package, package);

        let mut table = TransformTable::new();

        run.enter(BuildStage::PatchingManifest)?;
        let edit = ManifestEdit {
            old_package: &old_package,
            new_package: &package,
            version_code: request.version_code,
            version_name: &request.version_name,
            component_classes: &self.config.template.component_classes,
        };
        match self.patchers.patch(&manifest, &edit) {
            Some(patched) => table.replace(MANIFEST_ENTRY, ZipFileOptions::Compressed, patched),
            None if package != old_package => {
                return Err(BuildError::ManifestPatchFailed(format!(
                    "package name `{}` could not be changed to `{}`",
                    old_package, package
                )));
            }
            None => run.warn(BuildError::ManifestPatchFailed(
                "no editor accepted the manifest, keeping it unchanged".to_string(),
            )),
        }

        run.enter(BuildStage::PatchingResourceTable)?;
        if let Some(path) = &request.icon {
            match Scaler::open(path) {
                Ok(mut icon) => {
                    icon.optimize();
                    table.set_icon(icon);
                }
                Err(err) => log::warn!("Ignoring icon: {:#}", err),
            }
        }
        self.patch_resource_table(run, template, request, &mut table);
        let payload = request
            .render_payload(&package)
            .map_err(BuildError::archive)?;
        table.replace(
            self.config.template.config_entry.clone(),
            ZipFileOptions::Compressed,
            payload,
        );

        run.enter(BuildStage::RewritingArchive)?;
        archive::rewrite(template, &unsigned, &table, &mut |done, total| {
            let percent = 30 + (40 * done / total.max(1)) as u8;
            run.report(percent, BuildStage::RewritingArchive.message());
        })
        .map_err(BuildError::archive)?;

        run.enter(BuildStage::Signing)?;
        let signer = self
            .keystore
            .get_or_create()
            .map_err(|err| BuildError::SigningKeyUnavailable(format!("{:#}", err)))?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| BuildError::ArchiveIo(format!("{}: {}", parent.display(), err)))?;
        }
        run.output_touched = true;
        std::fs::copy(&unsigned, output)
            .map_err(|err| BuildError::ArchiveIo(format!("{}: {}", output.display(), err)))?;
        sign::sign_package(output, &signer)
            .map_err(|err| BuildError::SigningFailed(format!("{:#}", err)))?;

        run.enter(BuildStage::Verifying)?;
        let report = sign::verify(output);
        if !report.verified {
            return Err(BuildError::VerificationFailed(report.errors.join("; ")));
        }

        run.enter(BuildStage::CleaningUp)?;
        if let Err(err) = work.close() {
            log::warn!("Could not remove work dir: {}", err);
        }
        Ok(())
    }

    fn package_name(&self, request: &BuildConfig, old_package: &str) -> Result<String, BuildError> {
        let package = match &request.package_name {
            Some(package) => {
                package_name::validate(package, old_package)
                    .map_err(|err| BuildError::InvalidIdentifier(format!("{:#}", err)))?;
                package.clone()
            }
            None => self
                .deriver
                .derive(&request.app_name, old_package)
                .map_err(|err| BuildError::InvalidIdentifier(format!("{:#}", err)))?,
        };
        Ok(package)
    }

    /// Renames the app in `resources.arsc`. Every failure here is soft.
    fn patch_resource_table(
        &self,
        run: &mut Run<'_>,
        template: &Path,
        request: &BuildConfig,
        table: &mut TransformTable,
    ) {
        let original = match archive::read_entry(template, RESOURCE_TABLE_ENTRY) {
            Ok(original) => original,
            Err(err) => {
                run.warn(BuildError::ResourceTablePatchSkipped(format!("{:#}", err)));
                return;
            }
        };
        let mut patched = arsc::replace_app_name(
            &original,
            &self.config.template.original_app_name,
            &request.app_name,
        );
        if patched == original {
            run.warn(BuildError::ResourceTablePatchSkipped(format!(
                "app name `{}` not found",
                self.config.template.original_app_name
            )));
        }
        if table.has_icon() {
            patched = arsc::swap_icon_paths_to_png(&patched);
        }
        table.replace(RESOURCE_TABLE_ENTRY, ZipFileOptions::Aligned(4), patched);
    }
}
