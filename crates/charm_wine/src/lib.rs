use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use charm_cfg::Arch;

pub use charm_download::mp;
pub use events::{Event, ProgressView, Reporter};
pub use manager::{Error, Manager, Opened};
pub use process::Cancellation;
pub use registry::{Registry, SortKey};
pub use supervisor::{LaunchPlan, ProcessRecord, Supervisor};
pub use xdg::BaseDirectoriesError as XdgError;

pub mod archive;
pub mod catalog;
mod command;
pub mod deps;
mod events;
mod github;
pub mod exe;
pub mod ipc;
pub mod lnk;
mod manager;
pub mod prefix;
pub mod process;
mod procfs;
mod registry;
pub mod rewrite;
pub mod runner;
mod steps;
pub mod supervisor;
pub mod template;

/// Environment override for the data root, mostly useful for tests and portable installs.
pub const DATA_DIR_ENV: &str = "WINECHARM_DATA_DIR";

/// Layout of the WineCharm data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub root: PathBuf,
    pub prefixes: PathBuf,
    pub templates: PathBuf,
    pub runners: PathBuf,
    pub tmp: PathBuf,
    pub settings: PathBuf,
    pub socket: PathBuf,
    pub runner_cache: PathBuf,
}

impl Paths {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            prefixes: root.join("Prefixes"),
            templates: root.join("Templates"),
            runners: root.join("Runners"),
            tmp: root.join("tmp"),
            settings: root.join("Settings.yaml"),
            socket: root.join("winecharm_socket"),
            runner_cache: root.join("runner_cache.yaml"),
        }
    }

    /// Resolves the data root from `WINECHARM_DATA_DIR` or the XDG data home.
    pub fn detect() -> Result<Self, xdg::BaseDirectoriesError> {
        if let Some(root) = env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(Path::new(&root)));
        }

        let dirs = xdg::BaseDirectories::with_prefix("winecharm")?;
        Ok(Self::new(&dirs.get_data_home()))
    }

    pub fn ensure(&self) -> Result<(), io::Error> {
        for dir in [&self.prefixes, &self.templates, &self.runners, &self.tmp] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn default_template(&self, arch: Arch) -> PathBuf {
        self.templates.join(format!("WineCharm-{arch}"))
    }

    #[must_use]
    pub fn single_prefix(&self, arch: Arch) -> PathBuf {
        self.prefixes.join(format!("WineCharm-Single_{arch}"))
    }
}

/// Everything a long-running operation needs besides its own arguments.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub paths: &'a Paths,
    pub user: &'a User,
    pub cancel: &'a Cancellation,
    pub reporter: &'a Reporter,
}

/// The login whose name and home directory get substituted into and out of prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub home: PathBuf,
}

impl User {
    #[must_use]
    pub fn current() -> Self {
        let name = ["USER", "LOGNAME", "USERNAME"]
            .iter()
            .find_map(|key| env::var(key).ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| "user".to_owned());

        Self {
            name,
            home: charm_cfg::tilde::home(),
        }
    }

    #[must_use]
    pub fn new(name: &str, home: &Path) -> Self {
        Self {
            name: name.to_owned(),
            home: home.to_path_buf(),
        }
    }
}
