//! Windows shell links (`.lnk`) left behind by installers, and turning them into scripts.

use std::{
    fs,
    path::{Path, PathBuf},
};

use charm_cfg::Script;
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::{exe, registry, User};

const HEADER_SIZE: u32 = 0x4C;

const HAS_ID_LIST: u32 = 0x1;
const HAS_LINK_INFO: u32 = 0x2;
const HAS_NAME: u32 = 0x4;
const HAS_RELATIVE_PATH: u32 = 0x8;
const HAS_WORKING_DIR: u32 = 0x10;
const HAS_ARGUMENTS: u32 = 0x20;
const HAS_ICON_LOCATION: u32 = 0x40;
const IS_UNICODE: u32 = 0x80;

const VOLUME_ID_AND_LOCAL_BASE_PATH: u32 = 0x1;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error. {0}")]
    Io(#[from] std::io::Error),
    #[error("Not a shell link")]
    NotALink,
    #[error("Shell link is truncated")]
    Truncated,
}

/// The parts of a shell link needed to launch its target.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShellLink {
    /// Windows path of the target, like `C:\Games\game.exe`.
    pub target: Option<String>,
    pub relative_path: Option<String>,
    pub working_dir: Option<String>,
    pub arguments: Option<String>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u16_at(&self, pos: usize) -> Result<u16, Error> {
        let bytes = self.data.get(pos..pos + 2).ok_or(Error::Truncated)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32_at(&self, pos: usize) -> Result<u32, Error> {
        let bytes = self.data.get(pos..pos + 4).ok_or(Error::Truncated)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn skip(&mut self, len: usize) -> Result<(), Error> {
        if self.pos + len > self.data.len() {
            return Err(Error::Truncated);
        }
        self.pos += len;
        Ok(())
    }

    fn c_string_at(&self, pos: usize) -> Result<String, Error> {
        let rest = self.data.get(pos..).ok_or(Error::Truncated)?;
        let end = rest.iter().position(|b| *b == 0).ok_or(Error::Truncated)?;
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }

    /// A counted StringData entry.
    fn counted_string(&mut self, unicode: bool) -> Result<String, Error> {
        let count = usize::from(self.u16_at(self.pos)?);
        self.pos += 2;

        if unicode {
            let bytes = self
                .data
                .get(self.pos..self.pos + count * 2)
                .ok_or(Error::Truncated)?;
            self.pos += count * 2;
            let units = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect::<Vec<_>>();
            Ok(String::from_utf16_lossy(&units))
        } else {
            let bytes = self
                .data
                .get(self.pos..self.pos + count)
                .ok_or(Error::Truncated)?;
            self.pos += count;
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

/// Parses the binary shell link format.
pub fn parse(data: &[u8]) -> Result<ShellLink, Error> {
    let mut reader = Reader { data, pos: 0 };
    if reader.u32_at(0)? != HEADER_SIZE {
        return Err(Error::NotALink);
    }

    let flags = reader.u32_at(0x14)?;
    let unicode = flags & IS_UNICODE != 0;
    reader.skip(HEADER_SIZE as usize)?;

    if flags & HAS_ID_LIST != 0 {
        let size = usize::from(reader.u16_at(reader.pos)?);
        reader.skip(2 + size)?;
    }

    let mut link = ShellLink::default();

    if flags & HAS_LINK_INFO != 0 {
        let start = reader.pos;
        let size = reader.u32_at(start)? as usize;
        let info_flags = reader.u32_at(start + 8)?;

        if info_flags & VOLUME_ID_AND_LOCAL_BASE_PATH != 0 {
            let base = reader.c_string_at(start + reader.u32_at(start + 16)? as usize)?;
            let suffix = reader.c_string_at(start + reader.u32_at(start + 24)? as usize)?;
            link.target = Some(base + &suffix).filter(|t| !t.is_empty());
        }

        reader.skip(size)?;
    }

    if flags & HAS_NAME != 0 {
        reader.counted_string(unicode)?;
    }
    if flags & HAS_RELATIVE_PATH != 0 {
        link.relative_path = Some(reader.counted_string(unicode)?);
    }
    if flags & HAS_WORKING_DIR != 0 {
        link.working_dir = Some(reader.counted_string(unicode)?);
    }
    if flags & HAS_ARGUMENTS != 0 {
        link.arguments = Some(reader.counted_string(unicode)?);
    }
    if flags & HAS_ICON_LOCATION != 0 {
        reader.counted_string(unicode)?;
    }

    Ok(link)
}

/// Maps a Windows path onto the prefix's drives.
#[must_use]
pub fn windows_to_unix(prefix: &Path, path: &str) -> PathBuf {
    let path = path.replace('\\', "/");
    let (drive, rest) = match path.split_once(':') {
        Some((drive, rest)) if drive.len() == 1 => (drive.to_ascii_lowercase(), rest),
        _ => ("c".to_owned(), path.as_str()),
    };

    let root = if drive == "c" {
        prefix.join("drive_c")
    } else {
        prefix.join("dosdevices").join(format!("{drive}:"))
    };

    root.join(rest.trim_start_matches('/'))
}

fn shortcut_dirs(prefix: &Path, user: &User) -> Vec<PathBuf> {
    let users = prefix.join("drive_c").join("users");
    vec![
        users.join(&user.name).join("Desktop"),
        users.join("Public").join("Desktop"),
        prefix.join("drive_c/ProgramData/Microsoft/Windows/Start Menu"),
    ]
}

/// Creates a script for every shell link in the prefix's desktop and start menu folders
/// that points at an existing program, skipping uninstallers and programs that already
/// have one.
#[must_use]
pub fn harvest(prefix: &Path, user: &User) -> Vec<Script> {
    let mut scripts: Vec<Script> = Vec::new();
    let mut known = registry::charm_files(prefix, 1)
        .iter()
        .filter_map(|p| Script::read(p).ok())
        .map(|s| s.sha256sum)
        .collect::<Vec<_>>();

    let links = shortcut_dirs(prefix, user)
        .into_iter()
        .filter(|d| d.is_dir())
        .flat_map(|d| WalkDir::new(d).follow_links(false).into_iter())
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|x| x.eq_ignore_ascii_case("lnk"))
        })
        .map(walkdir::DirEntry::into_path)
        .collect::<Vec<_>>();

    for path in links {
        match harvest_one(prefix, &path, &known) {
            Ok(Some(script)) => {
                known.push(script.sha256sum.clone());
                scripts.push(script);
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping shortcut {}. {e}", path.display()),
        }
    }

    info!("Harvested {} shortcuts from {}", scripts.len(), prefix.display());
    scripts
}

fn harvest_one(
    prefix: &Path,
    path: &Path,
    known: &[String],
) -> Result<Option<Script>, HarvestError> {
    let link = parse(&fs::read(path)?)?;
    let Some(target) = link.target.as_deref() else {
        debug!("{} has no local target", path.display());
        return Ok(None);
    };

    let exe_file = windows_to_unix(prefix, target);
    if exe::is_uninstaller(&exe_file) || !exe_file.is_file() {
        debug!("Ignoring {} -> {}", path.display(), exe_file.display());
        return Ok(None);
    }

    let sha256sum = charm_cfg::hash_file(&exe_file)?;
    if known.contains(&sha256sum) {
        return Ok(None);
    }

    let progname = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut script = exe::script_with(&exe_file, prefix, sha256sum, progname);
    script.args = link.arguments.unwrap_or_default();

    if script.script_path.exists() {
        debug!("{} already exists", script.script_path.display());
        return Ok(None);
    }

    script.write()?;
    info!("Created {} from {}", script.script_path.display(), path.display());
    Ok(Some(script))
}

#[derive(thiserror::Error, Debug)]
enum HarvestError {
    #[error("IO error. {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Link(#[from] Error),
    #[error("{0}")]
    Script(#[from] charm_cfg::Error),
}
