use std::{
    ffi::OsStr,
    fs, io,
    path::{Path, PathBuf},
};

use charm_cfg::{Arch, Script, Settings};
use log::{info, warn};

use crate::{
    archive::{self, ArchiveKind, Restored},
    catalog::{self, Catalog},
    exe, lnk, prefix,
    process::Operation,
    runner::{self, RunnerInfo},
    supervisor::{self, Supervisor},
    template::{self, Initialized, TemplateInfo},
    Cancellation, Context, Event, Paths, Registry, Reporter, SortKey, User,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error. {0}")]
    Config(#[from] charm_cfg::Error),
    #[error("Archive error. {0}")]
    Archive(#[from] archive::Error),
    #[error("Prefix error. {0}")]
    Prefix(#[from] prefix::Error),
    #[error("Template error. {0}")]
    Template(#[from] template::Error),
    #[error("Runner error. {0}")]
    Runner(#[from] runner::Error),
    #[error("Catalog error. {0}")]
    Catalog(#[from] catalog::Error),
    #[error("{0}")]
    Process(#[from] supervisor::Error),
    #[error("Unable to locate data directory. {0}")]
    Xdg(#[from] xdg::BaseDirectoriesError),
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
    #[error("Don't know how to open {0}")]
    UnknownFile(PathBuf),
    #[error("No script matches `{0}`")]
    UnknownScript(String),
    #[error("{0} already exists")]
    Exists(PathBuf),
    #[error("{0} is running")]
    Running(String),
    #[error("Another operation is in progress")]
    Busy,
}

impl Error {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Archive(e) => e.is_cancelled(),
            Error::Prefix(e) => e.is_cancelled(),
            Error::Template(e) => e.is_cancelled(),
            Error::Runner(e) => e.is_cancelled(),
            Error::Catalog(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// What opening a file produced.
#[derive(Debug)]
pub enum Opened {
    Script(String),
    Restored(Restored),
}

/// The engine's single entry point: owns the settings, the script registry and the
/// process table, and runs every user-facing operation against them.
pub struct Manager {
    paths: Paths,
    user: User,
    settings: Settings,
    registry: Registry,
    supervisor: Supervisor,
    cancel: Cancellation,
    reporter: Reporter,
}

impl Manager {
    /// Creates the data directories, reads the settings and loads every script.
    pub fn new(paths: Paths, user: User, reporter: Reporter) -> Result<Self, Error> {
        paths.ensure()?;
        let settings = Settings::read(&paths.settings, &paths.default_template(Arch::default()))?;

        let mut registry = Registry::new();
        registry.load(&paths.prefixes, true);

        Ok(Self {
            supervisor: Supervisor::new(reporter.clone()),
            paths,
            user,
            settings,
            registry,
            cancel: Cancellation::new(),
            reporter,
        })
    }

    /// [`Manager::new`] for the current user and the detected data root.
    pub fn detect(reporter: Reporter) -> Result<Self, Error> {
        Self::new(Paths::detect()?, User::current(), reporter)
    }

    #[must_use]
    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// A handle that cancels whatever operation is running, from any thread.
    #[must_use]
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    fn ctx(&self) -> Context<'_> {
        Context {
            paths: &self.paths,
            user: &self.user,
            cancel: &self.cancel,
            reporter: &self.reporter,
        }
    }

    fn begin(&self) -> Result<Operation, Error> {
        self.cancel.begin().ok_or(Error::Busy)
    }

    /// Hash of the script matching `query`.
    pub fn key(&self, query: &str) -> Result<String, Error> {
        self.registry
            .find(query)
            .map(|s| s.sha256sum.clone())
            .ok_or_else(|| Error::UnknownScript(query.to_owned()))
    }

    pub fn script(&self, query: &str) -> Result<&Script, Error> {
        self.registry
            .find(query)
            .ok_or_else(|| Error::UnknownScript(query.to_owned()))
    }

    /// Reorders the registry, which is the order [`Manager::registry`] iterates in.
    pub fn sort(&mut self, key: SortKey, reverse: bool) {
        self.registry.sort(key, reverse);
    }

    /// Rescans the prefixes directory.
    pub fn reload(&mut self) -> usize {
        self.registry.load(&self.paths.prefixes, true)
    }

    /// Merges scripts from another directory into the registry.
    pub fn load_scripts(&mut self, dir: &Path) -> usize {
        self.registry.load(dir, false)
    }

    pub fn update_settings(&mut self, change: impl FnOnce(&mut Settings)) -> Result<(), Error> {
        change(&mut self.settings);
        self.settings.write(&self.paths.settings)?;
        Ok(())
    }

    /// Switches architecture and its default template, building the template when it
    /// does not exist yet.
    pub fn set_arch(&mut self, arch: Arch) -> Result<Option<Initialized>, Error> {
        let _op = self.begin()?;
        let template = self.paths.default_template(arch);

        if let Some(wine) = self.settings.runner_path() {
            runner::check_arch(&wine, &template, arch)?;
        }

        self.settings.arch = arch;
        self.settings.set_template(&template);
        let initialized = self.ensure_template()?;
        self.settings.write(&self.paths.settings)?;

        Ok(initialized)
    }

    /// Builds the default template of the configured architecture when no usable
    /// template exists.
    fn ensure_template(&self) -> Result<Option<Initialized>, Error> {
        if prefix::source_template(&self.paths, &self.settings).is_dir() {
            return Ok(None);
        }

        let arch = self.settings.arch;
        let wine = runner::resolve(self.settings.runner.as_deref().unwrap_or_default())?;
        let dir = self.paths.default_template(arch);
        Ok(Some(template::initialize(&self.ctx(), &dir, arch, &wine)?))
    }

    /// Builds the template of `arch` if it is missing.
    pub fn init_template(&mut self, arch: Arch) -> Result<Option<Initialized>, Error> {
        let _op = self.begin()?;
        let dir = self.paths.default_template(arch);
        if dir.is_dir() {
            return Ok(None);
        }

        let wine = runner::resolve(self.settings.runner.as_deref().unwrap_or_default())?;
        Ok(Some(template::initialize(&self.ctx(), &dir, arch, &wine)?))
    }

    /// Turns single-prefix mode on or off. The shared prefix is created before the
    /// setting is saved.
    pub fn set_single_prefix(&mut self, enabled: bool) -> Result<(), Error> {
        let _op = self.begin()?;
        if enabled {
            self.ensure_template()?;
            let prefix = prefix::ensure_single(&self.ctx(), self.settings.arch)?;
            info!("Single prefix is {}", prefix.display());
        }

        self.settings.single_prefix = enabled;
        self.settings.write(&self.paths.settings)?;
        Ok(())
    }

    /// Uses `dir` as the template for new prefixes.
    pub fn set_template(&mut self, dir: &Path) -> Result<(), Error> {
        template::validate(dir)?;
        self.settings.set_template(dir);
        self.settings.write(&self.paths.settings)?;
        Ok(())
    }

    /// Sets the runner new scripts get. `None` means the system wine.
    pub fn set_default_runner(&mut self, runner: Option<&Path>) -> Result<(), Error> {
        if let Some(wine) = runner {
            runner::validate(wine)?;
            runner::check_arch(wine, &self.settings.template_path(), self.settings.arch)?;
        }

        self.settings.set_runner(runner);
        self.settings.write(&self.paths.settings)?;
        Ok(())
    }

    /// Opens a file the way double-clicking it would: executables get a script, scripts
    /// are registered, archives are restored.
    pub fn open_file(&mut self, path: &Path) -> Result<Opened, Error> {
        let extension = path
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "exe" | "msi" => self.create_script(path).map(Opened::Script),
            "charm" => {
                let script = Script::read(path)?;
                let key = script.sha256sum.clone();
                self.registry.add(script);
                Ok(Opened::Script(key))
            }
            _ if ArchiveKind::detect(path).is_some() => self.restore(path).map(Opened::Restored),
            _ => Err(Error::UnknownFile(path.to_path_buf())),
        }
    }

    /// Creates a script and, when needed, a prefix for an executable.
    pub fn create_script(&mut self, exe: &Path) -> Result<String, Error> {
        let _op = self.begin()?;
        self.ensure_template()?;

        let script = prefix::open_executable(&self.ctx(), &self.settings, exe)?;
        let key = script.sha256sum.clone();
        self.registry.add(script);
        Ok(key)
    }

    fn edit(&mut self, query: &str, change: impl FnOnce(&mut Script) -> Result<(), Error>) -> Result<(), Error> {
        let key = self.key(query)?;
        let script = self
            .registry
            .get_mut(&key)
            .ok_or_else(|| Error::UnknownScript(query.to_owned()))?;

        change(script)?;
        script.write()?;
        Ok(())
    }

    /// Changes the display name and renames the script file and its siblings to match.
    pub fn rename(&mut self, query: &str, progname: &str) -> Result<(), Error> {
        self.edit(query, |script| {
            let stem = exe::script_file_stem(progname);
            let dest = script.wineprefix.join(format!("{stem}.charm"));

            if dest != script.script_path {
                if dest.exists() {
                    return Err(Error::Exists(dest));
                }

                for extension in ["png", "log"] {
                    let from = script.script_path.with_extension(extension);
                    if from.exists() {
                        fs::rename(&from, dest.with_extension(extension))?;
                    }
                }
                fs::rename(&script.script_path, &dest)?;
                script.script_path = dest;
            }

            script.progname = progname.to_owned();
            Ok(())
        })
    }

    pub fn set_env_vars(&mut self, query: &str, env_vars: &str) -> Result<(), Error> {
        charm_cfg::parse_env_vars(env_vars)?;
        self.edit(query, |script| {
            script.env_vars = env_vars.trim().to_owned();
            Ok(())
        })
    }

    pub fn set_args(&mut self, query: &str, args: &str) -> Result<(), Error> {
        self.edit(query, |script| {
            script.args = args.to_owned();
            Ok(())
        })
    }

    /// Sets a script's runner after checking it works and fits the script's prefix.
    /// An empty value means the system wine.
    pub fn set_runner(&mut self, query: &str, runner: &str) -> Result<(), Error> {
        self.edit(query, |script| {
            if !runner.trim().is_empty() {
                let wine = runner::resolve(runner)?;
                runner::validate(&wine)?;
                if let Some(arch) = prefix::arch(&script.wineprefix) {
                    runner::check_arch(&wine, &script.wineprefix, arch)?;
                }
            }

            script.runner = runner.trim().to_owned();
            Ok(())
        })
    }

    /// Moves the script file aside to `.bak` and generates a fresh one from the
    /// executable.
    pub fn reset(&mut self, query: &str) -> Result<String, Error> {
        let key = self.key(query)?;
        let old = self
            .registry
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::UnknownScript(query.to_owned()))?;

        if !old.is_launchable() {
            return Err(supervisor::Error::NotLaunchable(old.exe_file).into());
        }

        let backup = old.script_path.with_extension("bak");
        info!("Moving {} to {}", old.script_path.display(), backup.display());
        fs::rename(&old.script_path, &backup)?;

        let mut script = exe::new_script(&old.exe_file, &old.wineprefix)?;
        script.script_path = old.script_path;
        if let Err(e) = script.write() {
            fs::rename(&backup, &script.script_path)?;
            return Err(e.into());
        }

        let key = script.sha256sum.clone();
        self.registry.remove(&old.sha256sum);
        self.registry.add(script);
        Ok(key)
    }

    /// Removes a script file together with its icon and log.
    pub fn delete(&mut self, query: &str) -> Result<(), Error> {
        let key = self.key(query)?;
        if self.supervisor.is_running(&key) {
            return Err(Error::Running(query.to_owned()));
        }

        if let Some(script) = self.registry.remove(&key) {
            for path in [
                script.script_path.clone(),
                script.icon_path(),
                script.log_path(),
            ] {
                match fs::remove_file(&path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
            }
            info!("Deleted script {}", script.script_path.display());
        }

        Ok(())
    }

    pub fn clear_log(&self, query: &str) -> Result<(), Error> {
        supervisor::clear_log(self.script(query)?)?;
        Ok(())
    }

    /// Removes the prefix of a script along with every script living in it.
    pub fn delete_prefix(&mut self, query: &str) -> Result<(), Error> {
        let prefix = self.script(query)?.wineprefix.clone();

        let keys = self
            .registry
            .in_prefix(&prefix)
            .map(|s| s.sha256sum.clone())
            .collect::<Vec<_>>();
        if let Some(running) = keys.iter().find(|k| self.supervisor.is_running(k)) {
            return Err(Error::Running(running.clone()));
        }

        prefix::delete(&self.paths, &prefix)?;
        for key in keys {
            self.registry.remove(&key);
        }
        Ok(())
    }

    /// Archives the prefix of a script.
    pub fn backup_prefix(&mut self, query: &str, dest: &Path) -> Result<(), Error> {
        let prefix = self.script(query)?.wineprefix.clone();
        let _op = self.begin()?;
        archive::backup(&self.ctx(), &prefix, dest)?;
        Ok(())
    }

    /// Archives a script's prefix with its game files and runner.
    pub fn create_bottle(&mut self, query: &str, dest: &Path) -> Result<(), Error> {
        let script = self.script(query)?.clone();
        let _op = self.begin()?;
        archive::create_bottle(&self.ctx(), &script, dest)?;
        Ok(())
    }

    pub fn backup_template(&mut self, dir: &Path, dest: &Path) -> Result<(), Error> {
        template::validate(dir)?;
        let _op = self.begin()?;
        archive::backup(&self.ctx(), dir, dest)?;
        Ok(())
    }

    /// Restores any archive flavour and registers the scripts it brought.
    pub fn restore(&mut self, path: &Path) -> Result<Restored, Error> {
        let kind = ArchiveKind::detect(path).ok_or_else(|| Error::UnknownFile(path.to_path_buf()))?;
        let _op = self.begin()?;

        let restored = archive::restore(&self.ctx(), path, kind)?;
        for script in &restored.scripts {
            self.registry.add(script.clone());
        }
        Ok(restored)
    }

    #[must_use]
    pub fn templates(&self) -> Vec<TemplateInfo> {
        template::list(&self.paths)
    }

    pub fn clone_template(&mut self, source: &Path, name: &str) -> Result<PathBuf, Error> {
        let _op = self.begin()?;
        Ok(template::clone(&self.ctx(), source, name)?)
    }

    pub fn import_template(&mut self, source: &Path) -> Result<PathBuf, Error> {
        let _op = self.begin()?;
        Ok(template::import(&self.ctx(), source)?)
    }

    pub fn delete_template(&mut self, dir: &Path) -> Result<(), Error> {
        Ok(template::delete(&self.paths, &self.settings, dir)?)
    }

    #[must_use]
    pub fn runners(&self) -> Vec<RunnerInfo> {
        runner::list(&self.paths)
    }

    pub fn import_runner(&mut self, source: &Path) -> Result<PathBuf, Error> {
        let _op = self.begin()?;
        Ok(runner::import(&self.ctx(), source)?)
    }

    pub fn backup_runner(&mut self, dir: &Path, dest: &Path) -> Result<(), Error> {
        let _op = self.begin()?;
        Ok(runner::backup(&self.ctx(), dir, dest)?)
    }

    pub fn restore_runner(&mut self, archive: &Path) -> Result<PathBuf, Error> {
        let _op = self.begin()?;
        Ok(runner::restore(&self.ctx(), archive)?)
    }

    /// Deletes a managed runner and clears it from settings if it was the default.
    pub fn delete_runner(&mut self, dir: &Path) -> Result<(), Error> {
        runner::delete(&self.paths, dir)?;

        if self
            .settings
            .runner_path()
            .is_some_and(|wine| wine.starts_with(dir))
        {
            warn!("Default runner {} was deleted", dir.display());
            self.settings.set_runner(None);
            self.settings.write(&self.paths.settings)?;
        }
        Ok(())
    }

    /// The cached catalog of downloadable runners, refreshed when stale.
    pub fn catalog(&self, refresh: bool) -> Result<Catalog, Error> {
        Ok(catalog::load(&self.paths, refresh)?)
    }

    pub fn download_runner(&mut self, name: &str) -> Result<PathBuf, Error> {
        let catalog = self.catalog(false)?;
        let entry = catalog
            .find(name)
            .ok_or_else(|| catalog::Error::NotFound(name.to_owned()))?;

        let _op = self.begin()?;
        Ok(catalog::download(&self.ctx(), entry)?)
    }

    pub fn launch(&self, query: &str) -> Result<String, Error> {
        let script = self.script(query)?;
        Ok(self.supervisor.launch(script)?)
    }

    pub fn terminate(&self, query: &str) -> Result<(), Error> {
        let key = self.key(query)?;
        Ok(self.supervisor.terminate(&key)?)
    }

    /// Picks up programs that were started before this process.
    pub fn reconcile(&self) -> Vec<String> {
        self.supervisor.reconcile(self.registry.iter())
    }

    /// Turns shortcuts found in `prefix` into scripts. Returns the new keys.
    pub fn harvest(&mut self, prefix: &Path) -> Vec<String> {
        let scripts = lnk::harvest(prefix, &self.user);
        let keys = scripts.iter().map(|s| s.sha256sum.clone()).collect();
        for script in scripts {
            self.registry.add(script);
        }
        keys
    }

    /// Reacts to engine events. When an installer exits, its prefix is searched for the
    /// shortcuts it created. Returns the keys of scripts this added.
    pub fn handle_event(&mut self, event: &Event) -> Vec<String> {
        let Event::ProcessEnded { key } = event else {
            return Vec::new();
        };
        let Some(script) = self.registry.get(key) else {
            return Vec::new();
        };
        if !exe::is_installer(&script.exe_file) {
            return Vec::new();
        }

        let prefix = script.wineprefix.clone();
        info!("Installer {} finished, looking for shortcuts", script.progname);
        self.harvest(&prefix)
    }
}
