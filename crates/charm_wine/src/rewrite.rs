//! Converts a prefix between its local form, which mentions the current login, and its
//! portable form, which uses the `%USERNAME%` placeholder and `~` instead.

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use charm_cfg::write_atomic;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use walkdir::WalkDir;

use crate::{process, Cancellation, User};

pub const USERNAME_TOKEN: &str = "%USERNAME%";
/// Placeholder used by prefixes exported from WineZGUI.
pub const LEGACY_USER_TOKEN: &str = "XOUSERXO";

lazy_static! {
    static ref REG_USERNAME: Regex = Regex::new(r#""USERNAME"="([^"]*)""#).unwrap();
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to rewrite {0}. {1}")]
    File(PathBuf, #[source] io::Error),
    #[error("Unable to rename {0}. {1}")]
    Rename(PathBuf, #[source] io::Error),
    #[error(transparent)]
    Process(#[from] process::Error),
}

impl Error {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Process(e) if e.is_cancelled())
    }
}

type Pairs = Vec<(String, String)>;

/// Replaces everything that identifies `user` with placeholders.
///
/// Returns the number of files changed.
pub fn to_portable(prefix: &Path, user: &User, cancel: &Cancellation) -> Result<usize, Error> {
    info!("Making {} portable", prefix.display());

    let mut names = vec![user.name.clone()];
    if let Some(name) = registry_username(prefix).filter(|n| !is_token(n)) {
        if name != user.name {
            names.push(name);
        }
    }

    let mut reg = Pairs::new();
    let mut charm = vec![(format!("{}/", user.home.display()), "~/".to_owned())];
    for name in &names {
        reg.extend(reg_pairs(name, USERNAME_TOKEN));
        charm.push(users_dir_pair(name, USERNAME_TOKEN));
    }

    rewrite_tree(prefix, &reg, &charm, cancel)
}

/// Puts the current user back into a prefix in portable form, or one created under
/// another login.
///
/// Returns the number of files changed.
pub fn to_local(prefix: &Path, user: &User, cancel: &Cancellation) -> Result<usize, Error> {
    info!("Localizing {} for {}", prefix.display(), user.name);

    let mut names = vec![USERNAME_TOKEN.to_owned(), LEGACY_USER_TOKEN.to_owned()];
    if let Some(name) = registry_username(prefix) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names.retain(|n| n != &user.name);

    let mut reg = Pairs::new();
    let mut charm = Pairs::new();
    for name in &names {
        reg.extend(reg_pairs(&user.name, name).into_iter().map(|(a, b)| (b, a)));
        let (from, to) = users_dir_pair(name, &user.name);
        charm.push((from, to));
    }

    let changed = rewrite_tree(prefix, &reg, &charm, cancel)?;
    rename_users_dir(prefix, &names, &user.name)?;

    Ok(changed)
}

/// The `USERNAME` value recorded in the prefix's `user.reg`.
#[must_use]
pub fn registry_username(prefix: &Path) -> Option<String> {
    let bytes = fs::read(prefix.join("user.reg")).ok()?;
    let text = String::from_utf8_lossy(&bytes);
    REG_USERNAME
        .captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
        .filter(|n| !n.is_empty())
}

fn is_token(name: &str) -> bool {
    name == USERNAME_TOKEN || name == LEGACY_USER_TOKEN
}

/// Registry paths end a user component with an escaped separator or the closing quote,
/// so only whole components match.
fn reg_pairs(from: &str, to: &str) -> Pairs {
    let mut pairs = Pairs::new();
    for root in [r"\\users\\", r"\\home\\"] {
        for end in [r"\\", "\""] {
            pairs.push((format!("{root}{from}{end}"), format!("{root}{to}{end}")));
        }
    }
    pairs.push((
        format!(r#""USERNAME"="{from}""#),
        format!(r#""USERNAME"="{to}""#),
    ));
    pairs.push((format!("/media/{from}/"), format!("/media/{to}/")));
    pairs
}

fn users_dir_pair(from: &str, to: &str) -> (String, String) {
    (
        format!("/drive_c/users/{from}/"),
        format!("/drive_c/users/{to}/"),
    )
}

fn rewrite_tree(
    prefix: &Path,
    reg: &Pairs,
    charm: &Pairs,
    cancel: &Cancellation,
) -> Result<usize, Error> {
    let mut changed = 0;

    let files = WalkDir::new(prefix)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file());

    for entry in files {
        cancel.check()?;

        let path = entry.path();
        let pairs = match path.extension().and_then(|e| e.to_str()) {
            Some("reg") => reg,
            Some("charm") => charm,
            _ => continue,
        };

        match replace_in_file(path, pairs) {
            Ok(true) => changed += 1,
            Ok(false) => {}
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!("Skipping {}. {e}", path.display());
            }
            Err(e) => return Err(Error::File(path.to_path_buf(), e)),
        }
    }

    debug!("Rewrote {changed} files in {}", prefix.display());
    Ok(changed)
}

/// Applies literal replacements to a text file, atomically. Binary files, which have a
/// NUL in their first KiB, and read-only files are left alone.
///
/// Returns whether the file changed.
pub fn replace_in_file(path: &Path, pairs: &[(String, String)]) -> Result<bool, io::Error> {
    if is_binary(path)? {
        debug!("Skipping binary file {}", path.display());
        return Ok(false);
    }

    let metadata = fs::metadata(path)?;
    if metadata.permissions().readonly() {
        debug!("Skipping read-only file {}", path.display());
        return Ok(false);
    }

    let original = fs::read(path)?;
    let Ok(text) = String::from_utf8(original) else {
        debug!("Skipping non UTF-8 file {}", path.display());
        return Ok(false);
    };

    let mut updated = text.clone();
    for (from, to) in pairs {
        if !from.is_empty() && updated.contains(from.as_str()) {
            updated = updated.replace(from.as_str(), to);
        }
    }

    if updated == text {
        return Ok(false);
    }

    write_atomic(path, updated)?;
    fs::set_permissions(path, metadata.permissions())?;

    Ok(true)
}

fn is_binary(path: &Path) -> Result<bool, io::Error> {
    let mut head = [0u8; 1024];
    let mut file = File::open(path)?;
    let mut len = 0;

    while len < head.len() {
        let read = file.read(&mut head[len..])?;
        if read == 0 {
            break;
        }
        len += read;
    }

    Ok(head[..len].contains(&0))
}

fn rename_users_dir(prefix: &Path, names: &[String], user: &str) -> Result<(), Error> {
    let users = prefix.join("drive_c").join("users");
    let target = users.join(user);

    for name in names {
        let source = users.join(name);
        if !source.is_dir() {
            continue;
        }

        if target.exists() {
            warn!(
                "Both {} and {} exist, leaving them alone",
                source.display(),
                target.display()
            );
            continue;
        }

        info!("Renaming {} to {}", source.display(), target.display());
        fs::rename(&source, &target).map_err(|e| Error::Rename(source, e))?;
    }

    Ok(())
}
