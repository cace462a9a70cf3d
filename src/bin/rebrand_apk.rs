use anyhow::{bail, Context, Result};
use apk_rebrand::{ApkBuilder, BuildConfig, BuildResult, BuilderConfig, CancelHandle};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const USAGE: &str = "Usage: rebrand_apk <job.toml>";

/// One build described in TOML:
///
/// ```toml
/// template = "template.apk"
/// output = "build/blog.apk"   # optional
///
/// [builder.signing]
/// keystore_dir = "keystore"
///
/// [build]
/// app_name = "Blog"
/// version_name = "2.0"
/// ```
#[derive(Debug, Deserialize)]
struct Job {
    template: PathBuf,
    output: Option<PathBuf>,
    #[serde(default)]
    builder: BuilderConfig,
    build: BuildConfig,
}

fn run() -> Result<bool> {
    let mut job_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(true);
            }
            _ if job_path.is_none() && !arg.starts_with('-') => job_path = Some(PathBuf::from(&arg)),
            _ => bail!("unknown argument: {arg}\n{USAGE}"),
        }
    }
    let job_path = job_path.context(USAGE)?;
    let job = {
        let contents = fs::read_to_string(&job_path)
            .with_context(|| format!("Reading `{}`", job_path.display()))?;
        toml::from_str::<Job>(&contents)
            .with_context(|| format!("Parsing `{}`", job_path.display()))?
    };

    let output = job.output.unwrap_or_else(|| {
        job.builder
            .output
            .output_dir
            .join(job.build.output_file_name())
    });
    let builder = ApkBuilder::new(job.builder);
    let result = builder.build(
        &job.template,
        &job.build,
        &output,
        &CancelHandle::default(),
        &mut |percent, message| println!("[{:>3}%] {}", percent, message),
    );
    match result {
        BuildResult::Success(path) => {
            println!("{}", path.display());
            Ok(true)
        }
        BuildResult::Error(err) => {
            eprintln!("{}", err);
            Ok(false)
        }
    }
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(2);
        }
    }
}
