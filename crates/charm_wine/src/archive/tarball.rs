//! `tar` command lines for creating and extracting prefix archives, plus the in-process
//! inspection used before extracting.

use std::{
    ffi::{CString, OsStr, OsString},
    fs::File,
    io::{self, BufRead, BufReader, Read},
    mem::MaybeUninit,
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
    process::Command,
};

use flate2::read::GzDecoder;
use log::debug;
use tar::Archive;
use xz2::read::XzDecoder;
use zstd::stream::Decoder as ZstDecoder;

use super::Error;
use crate::process::Cancellation;

const MB: u64 = 1024 * 1024;
const ZSTD: &str = "zstd -T0";
/// Archive members walked between two cancellation checks.
const CHECK_EVERY: usize = 64;

/// One `--transform` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform(String);

impl Transform {
    /// Renames the member `from` and everything below it.
    #[must_use]
    pub fn subtree(from: &str, to: &str) -> [Transform; 2] {
        let (from, to) = (escape_pattern(from), escape_replacement(to));
        [
            Transform(format!("s|^{from}$|{to}|")),
            Transform(format!("s|^{from}/|{to}/|")),
        ]
    }

    /// Replaces `from` anywhere in member names.
    #[must_use]
    pub fn everywhere(from: &str, to: &str) -> Transform {
        Transform(format!(
            "s|{}|{}|g",
            escape_pattern(from),
            escape_replacement(to)
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn arg(&self) -> String {
        format!("--transform={}", self.0)
    }
}

fn escape_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '.' | '*' | '[' | ']' | '^' | '$' | '|') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn escape_replacement(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '&' | '|') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// A directory to archive: `name` as seen from `dir`.
#[derive(Debug, Clone)]
pub struct Member {
    pub dir: PathBuf,
    pub name: OsString,
}

impl Member {
    /// Splits `path` into its parent and final component.
    pub fn of(path: &Path) -> Result<Self, Error> {
        match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) => Ok(Self {
                dir: dir.to_path_buf(),
                name: name.to_os_string(),
            }),
            _ => Err(Error::NotADirectory(path.to_path_buf())),
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.to_string_lossy().into_owned()
    }
}

#[must_use]
pub fn create_command(archive: &Path, members: &[Member], transforms: &[Transform]) -> Command {
    let mut command = Command::new("tar");
    command.arg("-I").arg(ZSTD);
    command.args(transforms.iter().map(Transform::arg));
    command.arg("-cf").arg(archive);

    for member in members {
        command.arg("-C").arg(&member.dir).arg(&member.name);
    }

    command
}

#[must_use]
pub fn extract_command(
    archive: &Path,
    dest: &Path,
    transforms: &[Transform],
    zstd: bool,
) -> Command {
    let mut command = Command::new("tar");
    if zstd {
        command.arg("-I").arg(ZSTD);
    }
    command.args(transforms.iter().map(Transform::arg));
    command.arg("-xf").arg(archive).arg("-C").arg(dest);
    command
}

/// Opens a tarball, picking the decoder from its magic bytes.
pub fn open(path: &Path) -> Result<Archive<Box<dyn Read>>, io::Error> {
    let mut file = BufReader::new(File::open(path)?);
    let head = file.fill_buf()?.iter().take(6).copied().collect::<Vec<_>>();

    let reader: Box<dyn Read> = if head.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
        Box::new(ZstDecoder::new(file)?)
    } else if head.starts_with(&[0xFD, b'7', b'z', b'X', b'Z', 0x00]) {
        Box::new(XzDecoder::new(file))
    } else if head.starts_with(&[0x1F, 0x8B]) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    Ok(Archive::new(reader))
}

/// Name of the directory an archive unpacks into: the top-level component of its first
/// directory member.
pub fn prefix_dir(path: &Path, cancel: &Cancellation) -> Result<Option<String>, Error> {
    let mut archive = open(path)?;
    let mut fallback = None;

    for (i, entry) in archive.entries()?.enumerate() {
        if i % CHECK_EVERY == 0 {
            cancel.check()?;
        }
        let entry = entry?;
        let member = entry.path()?;

        let Some(top) = top_level(&member) else {
            continue;
        };

        if entry.header().entry_type().is_dir() {
            debug!("Archive {} unpacks into {top}", path.display());
            return Ok(Some(top));
        }

        if fallback.is_none() && member.components().count() > 1 {
            fallback = Some(top);
        }
    }

    Ok(fallback)
}

fn top_level(member: &Path) -> Option<String> {
    member.components().find_map(|c| match c {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Sum of member sizes, the space the archive needs once unpacked.
///
/// Decoding a large bottle takes a while, so `cancel` is checked as the members go by.
pub fn unpacked_size(path: &Path, cancel: &Cancellation) -> Result<u64, Error> {
    let mut archive = open(path)?;
    let mut total = 0u64;

    for (i, entry) in archive.entries()?.enumerate() {
        if i % CHECK_EVERY == 0 {
            cancel.check()?;
        }
        total = total.saturating_add(entry?.header().size()?);
    }

    Ok(total)
}

/// Bytes available to unprivileged users on the filesystem holding `dir`.
pub fn available_space(dir: &Path) -> Result<u64, io::Error> {
    let path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: `path` is NUL-terminated and `stat` points to a writable statvfs.
    if unsafe { libc::statvfs(path.as_ptr(), stat.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs succeeded and filled the struct.
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::useless_conversion)]
    Ok(u64::from(stat.f_bavail).saturating_mul(u64::from(stat.f_frsize)))
}

/// Fails with [`Error::DiskSpace`] when `archive` will not fit below `dest`.
///
/// Anything ten times smaller than the free space passes right away, otherwise the
/// archive is listed to get its real unpacked size.
pub fn check_disk_space(archive: &Path, dest: &Path, cancel: &Cancellation) -> Result<(), Error> {
    let compressed = archive.metadata()?.len();
    let available = available_space(dest)?;
    fits(compressed, available, || unpacked_size(archive, cancel))
}

fn fits(
    compressed: u64,
    available: u64,
    unpacked: impl FnOnce() -> Result<u64, Error>,
) -> Result<(), Error> {
    if compressed.saturating_mul(10) <= available {
        return Ok(());
    }

    let required = unpacked()?;
    debug!("Archive needs {required} bytes, {available} available");

    if required <= available {
        Ok(())
    } else {
        Err(Error::DiskSpace {
            required_mb: required.div_ceil(MB),
            available_mb: available / MB,
        })
    }
}

/// Whether an archive name asks for zstd.
#[must_use]
pub fn is_zstd_name(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|e| matches!(e, "prefix" | "bottle" | "template" | "zst"))
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use pretty_assertions::assert_eq;

    use super::{fits, prefix_dir, top_level, unpacked_size, Member, Transform};
    use crate::{archive::Error, process::Cancellation};

    fn plain_tar(dir: &Path) -> std::path::PathBuf {
        let archive = dir.join("plain.tar");

        let mut builder = tar::Builder::new(fs::File::create(&archive).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "Game-0123456789", std::io::empty())
            .unwrap();

        let data = REGISTRY;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "Game-0123456789/user.reg", data)
            .unwrap();
        builder.finish().unwrap();

        archive
    }

    const REGISTRY: &[u8] = b"WINE REGISTRY Version 2\n";

    #[test]
    fn transform_escaping() {
        let [exact, below] = Transform::subtree("My Game.v1", "pfx/drive_c/GAMEDIR/My Game.v1");
        assert_eq!(exact.as_str(), r"s|^My Game\.v1$|pfx/drive_c/GAMEDIR/My Game.v1|");
        assert_eq!(below.as_str(), r"s|^My Game\.v1/|pfx/drive_c/GAMEDIR/My Game.v1/|");

        let odd = Transform::everywhere("a|b", "c&d");
        assert_eq!(odd.as_str(), r"s|a\|b|c\&d|g");
    }

    #[test]
    fn member_of_path() {
        let member = Member::of(Path::new("/data/Prefixes/Game-0123456789")).unwrap();
        assert_eq!(member.dir, Path::new("/data/Prefixes"));
        assert_eq!(member.name(), "Game-0123456789");
        assert!(Member::of(Path::new("/")).is_err());
    }

    #[test]
    fn space_decision() {
        assert!(fits(10, 100, || unreachable!()).is_ok());
        assert!(fits(50, 100, || Ok(90)).is_ok());

        let err = fits(50, 3 * 1024 * 1024, || Ok(5 * 1024 * 1024 + 1)).unwrap_err();
        assert!(matches!(
            err,
            Error::DiskSpace {
                required_mb: 6,
                available_mb: 3
            }
        ));
    }

    #[test]
    fn top_level_skips_dots() {
        assert_eq!(top_level(Path::new("./Game/user.reg")).as_deref(), Some("Game"));
        assert_eq!(top_level(Path::new("../x")).as_deref(), Some("x"));
        assert_eq!(top_level(Path::new(".")), None);
    }

    #[test]
    fn finds_prefix_dir_in_plain_tar() {
        let dir = tempfile::tempdir().unwrap();
        let archive = plain_tar(dir.path());
        let cancel = Cancellation::new();

        assert_eq!(
            prefix_dir(&archive, &cancel).unwrap().as_deref(),
            Some("Game-0123456789")
        );
        assert_eq!(
            unpacked_size(&archive, &cancel).unwrap(),
            REGISTRY.len() as u64
        );
    }

    #[test]
    fn inspection_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let archive = plain_tar(dir.path());
        let cancel = Cancellation::new();
        cancel.cancel();

        let err = unpacked_size(&archive, &cancel).unwrap_err();
        assert!(err.is_cancelled(), "{err}");

        let err = prefix_dir(&archive, &cancel).unwrap_err();
        assert!(err.is_cancelled(), "{err}");

        let err = fits(50, 100, || unpacked_size(&archive, &cancel)).unwrap_err();
        assert!(err.is_cancelled(), "{err}");
    }
}
