//! Backup and restore of prefixes, bottles and templates as zstd tarballs, and import of
//! legacy WZT archives.

use std::{
    ffi::OsStr,
    fmt, io,
    path::{Path, PathBuf},
};

use crate::{process, rewrite};

pub use backup::{backup, create_bottle};
pub use restore::{restore, Restored};
pub use tarball::{available_space, check_disk_space, prefix_dir, unpacked_size};

mod backup;
mod restore;
mod tarball;
pub mod wzt;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
    #[error("Archive command error. {0}")]
    Process(#[from] process::Error),
    #[error("Unable to rewrite prefix. {0}")]
    Rewrite(#[from] rewrite::Error),
    #[error("Script error. {0}")]
    Script(#[from] charm_cfg::Error),
    #[error("Not enough disk space: {required_mb} MB required, {available_mb} MB available")]
    DiskSpace { required_mb: u64, available_mb: u64 },
    #[error("Archive {0} does not contain a prefix directory")]
    NoPrefixDir(PathBuf),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("Refusing to bundle {0} into a bottle")]
    UnsafeGameDir(PathBuf),
    #[error("Unknown archive type {0}")]
    UnknownKind(PathBuf),
}

impl Error {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Process(e) => e.is_cancelled(),
            Error::Rewrite(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// The four archive flavours. They share one engine and differ in the transforms applied
/// and where they land on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Prefix,
    Bottle,
    Template,
    Wzt,
}

impl ArchiveKind {
    /// Guesses the flavour from the file name.
    #[must_use]
    pub fn detect(path: &Path) -> Option<Self> {
        match path.extension().and_then(OsStr::to_str)? {
            "prefix" => Some(ArchiveKind::Prefix),
            "bottle" => Some(ArchiveKind::Bottle),
            "template" => Some(ArchiveKind::Template),
            "wzt" => Some(ArchiveKind::Wzt),
            "zst" if path.to_string_lossy().ends_with(".tar.zst") => Some(ArchiveKind::Prefix),
            _ => None,
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveKind::Prefix => "prefix",
            ArchiveKind::Bottle => "bottle",
            ArchiveKind::Template => "template",
            ArchiveKind::Wzt => "wzt",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::ArchiveKind;

    #[test]
    fn detects_kind() {
        let kind = |p: &str| ArchiveKind::detect(Path::new(p));

        assert_eq!(kind("/tmp/out.prefix"), Some(ArchiveKind::Prefix));
        assert_eq!(kind("/tmp/it's a game.bottle"), Some(ArchiveKind::Bottle));
        assert_eq!(kind("WineCharm-win64.template"), Some(ArchiveKind::Template));
        assert_eq!(kind("old.wzt"), Some(ArchiveKind::Wzt));
        assert_eq!(kind("game.tar.zst"), Some(ArchiveKind::Prefix));
        assert_eq!(kind("game.zst"), None);
        assert_eq!(kind("setup.exe"), None);
    }
}
