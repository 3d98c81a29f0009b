use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

pub use script::{hash_file, parse_env_vars, RawScript, Script, DEFAULT_WINE_DEBUG};
pub use settings::Settings;

mod script;
mod settings;
pub mod tilde;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
    #[error("Yaml error. {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid environment variable `{0}`, expected KEY=VALUE")]
    InvalidEnvVar(String),
    #[error("Script `{0}` has neither sha256sum nor exe_file")]
    Incomplete(PathBuf),
    #[error("Unknown architecture `{0}`")]
    UnknownArch(String),
}

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Win32,
    #[default]
    Win64,
}

impl Arch {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Win32 => "win32",
            Arch::Win64 => "win64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "win32" => Ok(Arch::Win32),
            "win64" => Ok(Arch::Win64),
            _ => Err(Error::UnknownArch(s.to_owned())),
        }
    }
}

/// Writes `contents` next to `path` first and renames it over, so readers never
/// observe a half-written file.
pub fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> Result<(), io::Error> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    Ok(())
}
