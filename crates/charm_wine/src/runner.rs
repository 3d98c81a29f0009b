//! Wine builds: resolving, validating and managing the ones under `Runners/`.

use std::{
    ffi::OsStr,
    fs::{self, File, Permissions},
    io::{self, Read},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use charm_cfg::{tilde, Arch};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use tar::Archive;
use xz2::read::XzDecoder;
use zstd::stream::Decoder as ZstDecoder;

use crate::{prefix, process, Cancellation, Context, Paths};

pub const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid runner {0}. {1}")]
    Invalid(PathBuf, String),
    #[error(
        "Runner {runner} is {runner_arch} and cannot drive {template_arch} prefix {template}"
    )]
    ArchMismatch {
        runner: PathBuf,
        runner_arch: Arch,
        template: PathBuf,
        template_arch: Arch,
    },
    #[error("Runner not found. {0}")]
    Which(#[from] which::Error),
    #[error("Runner {0} already exists")]
    Exists(PathBuf),
    #[error("{0} is not a managed runner")]
    NotManaged(PathBuf),
    #[error("Unknown runner archive format for file {0}")]
    UnknownFormat(PathBuf),
    #[error("Prefix error. {0}")]
    Prefix(#[from] Box<prefix::Error>),
    #[error("Runner command error. {0}")]
    Process(#[from] process::Error),
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
}

impl Error {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Process(e) => e.is_cancelled(),
            Error::Prefix(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// A runner found under `Runners/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerInfo {
    pub name: String,
    pub dir: PathBuf,
    pub wine: PathBuf,
    pub arch: Option<Arch>,
}

/// Turns a script or settings `runner` value into a wine binary.
///
/// An empty value is the system `wine`, a bare name is looked up on `PATH`.
pub fn resolve(runner: &str) -> Result<PathBuf, Error> {
    let runner = runner.trim();
    if runner.is_empty() {
        return Ok(which::which("wine")?);
    }

    let path = tilde::expand(runner);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(which::which(runner)?)
    }
}

/// Runs `<wine> --version` and returns what it printed.
pub fn validate(wine: &Path) -> Result<String, Error> {
    if !wine.is_file() {
        return Err(Error::Invalid(wine.to_path_buf(), "No such file".to_owned()));
    }

    let output = process::run_with_timeout(
        Command::new(wine).arg("--version"),
        VALIDATE_TIMEOUT,
    )
    .map_err(|e| Error::Invalid(wine.to_path_buf(), e.to_string()))?;

    let version = output.stdout.trim().to_owned();
    debug!("{} is {version}", wine.display());
    Ok(version)
}

/// Guesses the architecture of a runner from `bin/wine64` or the ELF class of the binary.
#[must_use]
pub fn arch(wine: &Path) -> Option<Arch> {
    if wine.with_file_name("wine64").is_file() {
        return Some(Arch::Win64);
    }

    let mut header = [0u8; 5];
    File::open(wine).ok()?.read_exact(&mut header).ok()?;
    if &header[..4] != b"\x7fELF" {
        return None;
    }

    match header[4] {
        1 => Some(Arch::Win32),
        2 => Some(Arch::Win64),
        _ => None,
    }
}

/// Refuses 32-bit runners for 64-bit prefixes. Unknown architectures pass.
pub fn check_arch(wine: &Path, prefix: &Path, prefix_arch: Arch) -> Result<(), Error> {
    match arch(wine) {
        Some(Arch::Win32) if prefix_arch == Arch::Win64 => Err(Error::ArchMismatch {
            runner: wine.to_path_buf(),
            runner_arch: Arch::Win32,
            template: prefix.to_path_buf(),
            template_arch: prefix_arch,
        }),
        _ => Ok(()),
    }
}

/// Managed runners, sorted by name.
#[must_use]
pub fn list(paths: &Paths) -> Vec<RunnerInfo> {
    let Ok(entries) = fs::read_dir(&paths.runners) else {
        return Vec::new();
    };

    let mut runners = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter_map(|dir| {
            let wine = dir.join("bin").join("wine");
            wine.is_file().then(|| RunnerInfo {
                name: dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                arch: arch(&wine),
                dir,
                wine,
            })
        })
        .collect::<Vec<_>>();

    runners.sort_by(|a, b| a.name.cmp(&b.name));
    runners
}

/// Copies a runner directory into `Runners/`.
pub fn import(ctx: &Context, source: &Path) -> Result<PathBuf, Error> {
    let wine = source.join("bin").join("wine");
    validate(&wine)?;

    let name = source
        .file_name()
        .ok_or_else(|| Error::Invalid(source.to_path_buf(), "No directory name".to_owned()))?;
    let dest = ctx.paths.runners.join(name);
    if dest.exists() {
        return Err(Error::Exists(dest));
    }

    info!("Importing runner {} as {}", source.display(), dest.display());
    prefix::copy_dir(ctx, source, &dest).map_err(Box::new)?;
    make_executable(&dest)?;

    Ok(dest.join("bin").join("wine"))
}

fn make_executable(runner_dir: &Path) -> Result<(), io::Error> {
    for entry in fs::read_dir(runner_dir.join("bin"))? {
        let path = entry?.path();
        if path.is_file() {
            fs::set_permissions(&path, Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    fn detect(path: &Path) -> Result<Self, Error> {
        let name = path
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or_default();

        match name {
            n if n.ends_with(".tar.gz") || n.ends_with(".tgz") => Ok(Compression::Gzip),
            n if n.ends_with(".tar.xz") || n.ends_with(".txz") => Ok(Compression::Xz),
            n if n.ends_with(".tar.zst") => Ok(Compression::Zstd),
            _ => Err(Error::UnknownFormat(path.to_path_buf())),
        }
    }

    fn tar_flag(self) -> &'static str {
        match self {
            Compression::Gzip => "--gzip",
            Compression::Xz => "--xz",
            Compression::Zstd => "--zstd",
        }
    }
}

/// Archives a managed runner, compressed according to the extension of `dest`.
pub fn backup(ctx: &Context, runner_dir: &Path, dest: &Path) -> Result<(), Error> {
    let compression = Compression::detect(dest)?;
    let (Some(parent), Some(name)) = (runner_dir.parent(), runner_dir.file_name()) else {
        return Err(Error::Invalid(
            runner_dir.to_path_buf(),
            "Not a runner directory".to_owned(),
        ));
    };

    info!("Backing up runner {} to {}", runner_dir.display(), dest.display());
    let mut command = Command::new("tar");
    command
        .arg(compression.tar_flag())
        .arg("-cf")
        .arg(dest)
        .arg("-C")
        .arg(parent)
        .arg(name);

    if let Err(e) = process::run(&mut command, ctx.cancel, ctx.reporter) {
        let _ = fs::remove_file(dest);
        return Err(e.into());
    }
    Ok(())
}

/// Unpacks a runner archive into `Runners/`, returning the new runner directory.
pub fn restore(ctx: &Context, archive: &Path) -> Result<PathBuf, Error> {
    let compression = Compression::detect(archive)?;
    let file = File::open(archive)?;
    let fallback = archive_stem(archive);

    info!("Restoring runner {}", archive.display());
    match compression {
        Compression::Gzip => unpack(GzDecoder::new(file), &ctx.paths.runners, &fallback, ctx.cancel),
        Compression::Xz => unpack(XzDecoder::new(file), &ctx.paths.runners, &fallback, ctx.cancel),
        Compression::Zstd => unpack(
            ZstDecoder::new(file)?,
            &ctx.paths.runners,
            &fallback,
            ctx.cancel,
        ),
    }
}

fn archive_stem(archive: &Path) -> String {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    [".tar.gz", ".tar.xz", ".tar.zst", ".tgz", ".txz"]
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(&name)
        .to_owned()
}

/// Extracts a runner tarball into `runners`. An archive holding a single directory lands
/// under that directory's name, anything else under `fallback`.
pub(crate) fn unpack(
    tar: impl Read,
    runners: &Path,
    fallback: &str,
    cancel: &Cancellation,
) -> Result<PathBuf, Error> {
    fs::create_dir_all(runners)?;
    let staging = runners.join(format!(".{}", uuid::Uuid::new_v4()));
    fs::create_dir(&staging)?;

    // Auto-delete directory if extraction fails mid-way
    let guard = DirGuard::new(&staging);

    let mut archive = Archive::new(tar);
    for entry in archive.entries()? {
        cancel.check()?;
        entry?.unpack_in(&staging)?;
    }

    let entries = fs::read_dir(&staging)?
        .filter_map(Result::ok)
        .collect::<Vec<_>>();

    let (source, name) = match entries.as_slice() {
        [single] if single.path().is_dir() => (
            single.path(),
            single.file_name().to_string_lossy().into_owned(),
        ),
        _ => (staging.clone(), fallback.to_owned()),
    };

    let dest = runners.join(&name);
    if dest.exists() {
        return Err(Error::Exists(dest));
    }

    fs::rename(&source, &dest)?;
    if dest.join("bin").is_dir() {
        make_executable(&dest)?;
    } else {
        warn!("{} has no bin directory", dest.display());
    }

    drop(guard);
    info!("Installed runner {}", dest.display());
    Ok(dest)
}

/// Removes a managed runner directory.
pub fn delete(paths: &Paths, runner_dir: &Path) -> Result<(), Error> {
    if runner_dir.parent() != Some(paths.runners.as_path()) || !runner_dir.is_dir() {
        return Err(Error::NotManaged(runner_dir.to_path_buf()));
    }

    info!("Deleting runner {}", runner_dir.display());
    fs::remove_dir_all(runner_dir)?;
    Ok(())
}

struct DirGuard<'a> {
    path: &'a Path,
}

impl<'a> DirGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path }
    }
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        if self.path.exists() {
            debug!("Removing {path}", path = self.path.display());
            let _ = fs::remove_dir_all(self.path);
        }
    }
}
