//! Facts about Windows executables needed to turn them into scripts.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use charm_cfg::{Script, DEFAULT_WINE_DEBUG};
use log::debug;

const INSTALLER_HINTS: [&str; 3] = ["setup", "install", "unins"];

#[must_use]
pub fn is_msi(exe: &Path) -> bool {
    exe.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|e| e.eq_ignore_ascii_case("msi"))
}

/// Installers and uninstallers, judged by name.
#[must_use]
pub fn is_installer(exe: &Path) -> bool {
    if is_msi(exe) {
        return true;
    }

    let stem = stem(exe).to_lowercase();
    INSTALLER_HINTS.iter().any(|hint| stem.contains(hint))
}

#[must_use]
pub fn is_uninstaller(exe: &Path) -> bool {
    stem(exe).to_lowercase().contains("unins")
}

fn stem(exe: &Path) -> String {
    exe.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The PE `ProductName`, as reported by exiftool.
#[must_use]
pub fn product_name(exe: &Path) -> Option<String> {
    let output = Command::new("exiftool")
        .args(["-s3", "-ProductName"])
        .arg(exe)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let name = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    debug!("Product name of {}: {name:?}", exe.display());
    Some(name).filter(|n| !n.is_empty())
}

/// Display name for a new script: the product name when there is one, the file stem
/// otherwise, with a trailing `*` on installers.
#[must_use]
pub fn progname(exe: &Path) -> String {
    let name = product_name(exe).unwrap_or_else(|| stem(exe));
    decorate(name, exe)
}

fn decorate(name: String, exe: &Path) -> String {
    if is_installer(exe) && !name.ends_with('*') {
        format!("{name}*")
    } else {
        name
    }
}

/// File name (without extension) for the `.charm` of a script called `progname`.
#[must_use]
pub fn script_file_stem(progname: &str) -> String {
    let cleaned = progname
        .chars()
        .filter(|c| *c != '*')
        .map(|c| if c == '/' || c.is_control() { '_' } else { c })
        .collect::<String>();

    let cleaned = cleaned.trim().trim_start_matches('.');
    if cleaned.is_empty() {
        "script".to_owned()
    } else {
        cleaned.to_owned()
    }
}

/// Builds, without writing it, the script for `exe` living in `prefix`.
pub fn new_script(exe: &Path, prefix: &Path) -> Result<Script, charm_cfg::Error> {
    let sha256sum = charm_cfg::hash_file(exe)?;
    let progname = progname(exe);
    Ok(script_with(exe, prefix, sha256sum, progname))
}

pub(crate) fn script_with(exe: &Path, prefix: &Path, sha256sum: String, progname: String) -> Script {
    let script_path = prefix.join(format!("{}.charm", script_file_stem(&progname)));

    Script {
        sha256sum,
        exe_file: exe.to_path_buf(),
        script_path,
        wineprefix: prefix.to_path_buf(),
        progname,
        args: String::new(),
        env_vars: String::new(),
        runner: String::new(),
        wine_debug: DEFAULT_WINE_DEBUG.to_owned(),
        mtime: None,
    }
}

/// `<stem>-<first ten hash characters>`, the directory name of a dedicated prefix.
#[must_use]
pub fn prefix_dir_name(exe: &Path, sha256sum: &str) -> PathBuf {
    let short = sha256sum.get(..10).unwrap_or(sha256sum);
    PathBuf::from(format!("{}-{short}", script_file_stem(&stem(exe))))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use super::{decorate, is_installer, prefix_dir_name, script_file_stem};

    #[test]
    fn installers() {
        assert!(is_installer(Path::new("/tmp/GameSetup.exe")));
        assert!(is_installer(Path::new("/tmp/INSTALL.EXE")));
        assert!(is_installer(Path::new("/tmp/unins000.exe")));
        assert!(is_installer(Path::new("/tmp/package.MSI")));
        assert!(!is_installer(Path::new("/tmp/game.exe")));

        assert_eq!(decorate("Game".into(), Path::new("/tmp/GameSetup.exe")), "Game*");
        assert_eq!(decorate("Game".into(), Path::new("/tmp/game.exe")), "Game");
    }

    #[test]
    fn file_names() {
        assert_eq!(script_file_stem("GameSetup*"), "GameSetup");
        assert_eq!(script_file_stem("AC/DC Live"), "AC_DC Live");
        assert_eq!(script_file_stem("..hidden"), "hidden");
        assert_eq!(script_file_stem("*"), "script");

        assert_eq!(
            prefix_dir_name(Path::new("/tmp/GameSetup.exe"), "ab12cd34ef567890"),
            Path::new("GameSetup-ab12cd34ef")
        );
    }
}
