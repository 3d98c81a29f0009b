use std::{
    env,
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    process::Command,
};

use charm_cfg::Arch;
use indexmap::IndexMap;
use log::debug;
use path_absolutize::Absolutize;

/// Environment for running wine tools against one prefix with one runner.
#[derive(Debug, Clone)]
pub struct WineEnv {
    envs: IndexMap<String, String>,
    bin_dir: Option<PathBuf>,
}

impl WineEnv {
    /// `wine` is the runner binary: a bare `wine` means whatever is on `PATH`.
    pub fn new(wine: &Path, prefix: &Path) -> Result<Self, io::Error> {
        let mut envs = IndexMap::new();

        let bin_dir = if wine.components().count() > 1 {
            wine.absolutize()?.parent().map(Path::to_path_buf)
        } else {
            None
        };

        let wine_path = bin_dir
            .as_ref()
            .and_then(|p| p.to_str())
            .map(ToString::to_string);

        let path = env::var_os("PATH")
            .and_then(|p| p.into_string().ok())
            .and_then(|rest| wine_path.as_ref().map(|p| format!("{p}:{rest}")))
            .or(wine_path);

        if let Some(path) = path {
            envs.insert("PATH".to_owned(), path);
        }

        envs.insert("WINEDLLOVERRIDES".to_owned(), "winemenubuilder.exe=".to_owned());

        let prefix = prefix.absolutize()?.to_path_buf();
        envs.insert("WINEPREFIX".to_owned(), prefix.to_string_lossy().into_owned());

        Ok(Self { envs, bin_dir })
    }

    #[must_use]
    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.envs.insert("WINEARCH".to_owned(), arch.to_string());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.envs.insert(key.to_owned(), value.to_owned());
        self
    }

    /// A wine tool from the runner's directory, falling back to `PATH`.
    #[must_use]
    pub fn tool(&self, name: &str) -> PathBuf {
        self.bin_dir
            .as_ref()
            .map(|dir| dir.join(name))
            .filter(|p| p.is_file())
            .unwrap_or_else(|| PathBuf::from(name))
    }

    pub fn command(&self, program: impl AsRef<OsStr>, args: &[impl AsRef<OsStr>]) -> Command {
        let mut command = Command::new(program);
        command.args(args).envs(&self.envs);

        debug!("Prepared command: {command:?}");
        command
    }

    /// A command for one of the wine tools (`wine`, `wineboot`, `wineserver`, ...).
    pub fn wine_tool(&self, name: &str, args: &[impl AsRef<OsStr>]) -> Command {
        self.command(self.tool(name), args)
    }
}
