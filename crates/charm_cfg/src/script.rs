use std::{
    fmt::Write as _,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    time::SystemTime,
};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{tilde, write_atomic, Error};

pub const DEFAULT_WINE_DEBUG: &str = "WINEDEBUG=fixme-all DXVK_LOG_LEVEL=none";

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=.*$").unwrap();
}

/// A launchable executable inside a prefix, persisted as a `.charm` file.
///
/// Paths are held expanded in memory and `~`-encoded on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub sha256sum: String,
    pub exe_file: PathBuf,
    pub script_path: PathBuf,
    pub wineprefix: PathBuf,
    pub progname: String,
    pub args: String,
    pub env_vars: String,
    /// Path to a `wine` binary, a bare command name, or empty for the system wine.
    pub runner: String,
    pub wine_debug: String,
    pub mtime: Option<SystemTime>,
}

/// The `.charm` file as found on disk, with every key optional so damaged files can be
/// repaired instead of rejected.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RawScript {
    #[serde(default)]
    pub exe_file: Option<String>,
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default)]
    pub wineprefix: Option<String>,
    #[serde(default)]
    pub progname: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub sha256sum: Option<String>,
    #[serde(default)]
    pub runner: Option<String>,
    #[serde(default)]
    pub wine_debug: Option<String>,
    #[serde(default)]
    pub env_vars: Option<String>,
}

impl RawScript {
    /// Fills in missing keys. `script_path` and `wineprefix` always follow the file's real
    /// location; the hash is regenerated from `exe_file` when it is absent.
    ///
    /// Returns the script and whether anything had to be changed.
    pub fn repair(self, path: &Path) -> Result<(Script, bool), Error> {
        let mut repaired = false;
        let non_empty = |v: Option<String>| v.filter(|v| !v.trim().is_empty());

        let script_path = path.to_path_buf();
        if non_empty(self.script_path).map(|p| tilde::expand(&p)).as_deref() != Some(path) {
            repaired = true;
        }

        let wineprefix = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if non_empty(self.wineprefix).map(|p| tilde::expand(&p)) != Some(wineprefix.clone()) {
            repaired = true;
        }

        let exe_file = non_empty(self.exe_file)
            .map(|p| tilde::expand(&p))
            .unwrap_or_default();

        let sha256sum = match non_empty(self.sha256sum) {
            Some(hash) => hash,
            None if exe_file.is_file() => {
                repaired = true;
                hash_file(&exe_file)?
            }
            None => return Err(Error::Incomplete(path.to_path_buf())),
        };

        let progname = match non_empty(self.progname) {
            Some(name) => name,
            None => {
                repaired = true;
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            }
        };

        let runner = self.runner.unwrap_or_default();
        let runner = if runner.starts_with('~') {
            tilde::expand(&runner).to_string_lossy().into_owned()
        } else {
            runner
        };

        let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();

        Ok((
            Script {
                sha256sum,
                exe_file,
                script_path,
                wineprefix,
                progname,
                args: self.args.unwrap_or_default(),
                env_vars: self.env_vars.unwrap_or_default(),
                runner,
                wine_debug: self
                    .wine_debug
                    .unwrap_or_else(|| DEFAULT_WINE_DEBUG.to_owned()),
                mtime,
            },
            repaired,
        ))
    }
}

impl Script {
    /// Reads and repairs a `.charm` file. Repairs are written back.
    pub fn read(path: &Path) -> Result<Self, Error> {
        let bytes = fs::read(path)?;
        let raw: RawScript = serde_yaml::from_slice(&bytes)?;
        let (mut script, repaired) = raw.repair(path)?;

        if repaired {
            log::debug!("Repaired script file {}", path.display());
            script.write()?;
        }

        Ok(script)
    }

    /// The first ten characters of the hash, used as a display and directory suffix.
    #[must_use]
    pub fn short_hash(&self) -> &str {
        self.sha256sum.get(..10).unwrap_or(&self.sha256sum)
    }

    #[must_use]
    pub fn is_launchable(&self) -> bool {
        self.exe_file.is_file()
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.script_path.with_extension("log")
    }

    #[must_use]
    pub fn icon_path(&self) -> PathBuf {
        self.script_path.with_extension("png")
    }

    pub fn env_pairs(&self) -> Result<Vec<(String, String)>, Error> {
        parse_env_vars(&self.env_vars)
    }

    /// Serializes with single-quoted scalars, one key per line.
    #[must_use]
    pub fn to_yaml(&self) -> String {
        let runner = if self.runner.starts_with('/') {
            tilde::encode(Path::new(&self.runner))
        } else {
            self.runner.clone()
        };

        let fields = [
            ("exe_file", tilde::encode(&self.exe_file)),
            ("script_path", tilde::encode(&self.script_path)),
            ("wineprefix", tilde::encode(&self.wineprefix)),
            ("progname", self.progname.clone()),
            ("args", self.args.clone()),
            ("sha256sum", self.sha256sum.clone()),
            ("runner", runner),
            ("wine_debug", self.wine_debug.clone()),
            ("env_vars", self.env_vars.clone()),
        ];

        let mut yaml = String::new();
        for (key, value) in fields {
            let _ = writeln!(yaml, "{key}: {}", single_quoted(&value));
        }
        yaml
    }

    pub fn write(&mut self) -> Result<(), Error> {
        write_atomic(&self.script_path, self.to_yaml())?;
        self.mtime = fs::metadata(&self.script_path)
            .and_then(|m| m.modified())
            .ok();
        Ok(())
    }
}

fn single_quoted(value: &str) -> String {
    let value = value.replace(['\n', '\r'], " ");
    format!("'{}'", value.replace('\'', "''"))
}

/// Splits a `;`-separated `KEY=VALUE` list. Empty entries are ignored.
pub fn parse_env_vars(env_vars: &str) -> Result<Vec<(String, String)>, Error> {
    env_vars
        .split(';')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| {
            if !ENV_VAR.is_match(entry) {
                return Err(Error::InvalidEnvVar(entry.to_owned()));
            }
            let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
            Ok((key.to_owned(), value.to_owned()))
        })
        .collect()
}

/// Hex encoded SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> Result<String, io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use pretty_assertions::assert_eq;

    use super::{hash_file, parse_env_vars, RawScript, Script, DEFAULT_WINE_DEBUG};
    use crate::Error;

    fn script(dir: &std::path::Path) -> Script {
        Script {
            sha256sum: "ab12cd34ef".repeat(6) + "0123",
            exe_file: PathBuf::from("/opt/Games/it's here/game.exe"),
            script_path: dir.join("game.charm"),
            wineprefix: dir.to_path_buf(),
            progname: "Game".into(),
            args: "-opengl".into(),
            env_vars: "FOO=bar;BAZ=qux".into(),
            runner: String::new(),
            wine_debug: DEFAULT_WINE_DEBUG.into(),
            mtime: None,
        }
    }

    #[test]
    fn single_quotes_survive() {
        let dir = tempfile::tempdir().unwrap();
        let mut original = script(dir.path());
        original.write().unwrap();

        let yaml = fs::read_to_string(&original.script_path).unwrap();
        assert!(yaml.contains("exe_file: '/opt/Games/it''s here/game.exe'"));

        let read = Script::read(&original.script_path).unwrap();
        assert_eq!(read.exe_file, original.exe_file);
        assert_eq!(read.args, "-opengl");
        assert_eq!(read.short_hash(), "ab12cd34ef");
    }

    #[test]
    fn repairs_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("app.exe");
        fs::write(&exe, b"MZ").unwrap();

        let raw = RawScript {
            exe_file: Some(exe.to_string_lossy().into_owned()),
            ..RawScript::default()
        };

        let path = dir.path().join("App.charm");
        let (script, repaired) = raw.repair(&path).unwrap();

        assert!(repaired);
        assert_eq!(script.sha256sum, hash_file(&exe).unwrap());
        assert_eq!(script.script_path, path);
        assert_eq!(script.wineprefix, dir.path());
        assert_eq!(script.progname, "App");
        assert_eq!(script.wine_debug, DEFAULT_WINE_DEBUG);
    }

    #[test]
    fn hash_only_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Lonely.charm");
        fs::write(&path, "sha256sum: 'deadbeef'\n").unwrap();

        let script = Script::read(&path).unwrap();
        assert_eq!(script.sha256sum, "deadbeef");
        assert_eq!(script.wineprefix, dir.path());
        assert!(!script.is_launchable());
    }

    #[test]
    fn null_hash_without_exe_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Empty.charm");
        fs::write(&path, "sha256sum:\n").unwrap();

        assert!(matches!(Script::read(&path), Err(Error::Incomplete(_))));
    }

    #[test]
    fn env_vars() {
        assert_eq!(parse_env_vars("").unwrap(), vec![]);
        assert_eq!(
            parse_env_vars("FOO=bar;BAZ=qux").unwrap(),
            vec![("FOO".into(), "bar".into()), ("BAZ".into(), "qux".into())]
        );
        assert_eq!(
            parse_env_vars("DXVK_HUD=fps=1;").unwrap(),
            vec![("DXVK_HUD".into(), "fps=1".into())]
        );
        assert!(matches!(
            parse_env_vars("1BAD=x"),
            Err(Error::InvalidEnvVar(e)) if e == "1BAD=x"
        ));
        assert!(parse_env_vars("NOVALUE").is_err());
    }
}
