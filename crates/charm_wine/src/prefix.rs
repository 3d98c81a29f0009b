//! Prefixes: where a new script's prefix lives, creating it from a template, and removing it.

use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    process::Command,
};

use charm_cfg::{Arch, Script, Settings};
use log::{debug, info, warn};

use crate::{exe, process, Context, Paths};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
    #[error("Copy error. {0}")]
    Process(#[from] process::Error),
    #[error("Script error. {0}")]
    Script(#[from] charm_cfg::Error),
    #[error("{0} already exists")]
    Exists(PathBuf),
    #[error("{0} does not exist")]
    Missing(PathBuf),
    #[error("{0} is not inside the prefixes directory")]
    NotManaged(PathBuf),
}

impl Error {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Process(e) if e.is_cancelled())
    }
}

/// Architecture from the first `#arch=` line of `system.reg`.
#[must_use]
pub fn arch(prefix: &Path) -> Option<Arch> {
    let file = File::open(prefix.join("system.reg")).ok()?;
    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .find_map(|line| line.strip_prefix("#arch=").map(|a| a.trim().parse().ok()))
        .flatten()
}

/// Copies `source` to a new directory `dest` with `cp -a`, removing `dest` again on
/// failure or cancellation.
pub fn copy_dir(ctx: &Context, source: &Path, dest: &Path) -> Result<(), Error> {
    if !source.is_dir() {
        return Err(Error::Missing(source.to_path_buf()));
    }
    if dest.exists() {
        return Err(Error::Exists(dest.to_path_buf()));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    info!("Copying {} to {}", source.display(), dest.display());
    let mut guard = Partial {
        path: dest,
        done: false,
    };

    let mut command = Command::new("cp");
    command.arg("-a").arg(source.join(".")).arg(dest);
    process::run(&mut command, ctx.cancel, ctx.reporter)?;

    guard.done = true;
    Ok(())
}

struct Partial<'a> {
    path: &'a Path,
    done: bool,
}

impl Drop for Partial<'_> {
    fn drop(&mut self) {
        if !self.done && self.path.exists() {
            warn!("Removing partial copy {}", self.path.display());
            let _ = fs::remove_dir_all(self.path);
        }
    }
}

/// The prefix a new script for `exe` goes into.
#[must_use]
pub fn target_for(paths: &Paths, settings: &Settings, exe: &Path, sha256sum: &str) -> PathBuf {
    if settings.single_prefix {
        paths.single_prefix(settings.arch)
    } else {
        paths.prefixes.join(exe::prefix_dir_name(exe, sha256sum))
    }
}

/// The template new prefixes are copied from: the configured one, or the architecture's
/// default when the configured one is gone.
#[must_use]
pub fn source_template(paths: &Paths, settings: &Settings) -> PathBuf {
    let configured = settings.template_path();
    if configured.is_dir() {
        configured
    } else {
        let fallback = paths.default_template(settings.arch);
        debug!(
            "Template {} is missing, using {}",
            configured.display(),
            fallback.display()
        );
        fallback
    }
}

/// Makes sure `prefix` exists, copying it from `template` if needed.
///
/// Returns whether the prefix was created.
pub fn ensure(ctx: &Context, template: &Path, prefix: &Path) -> Result<bool, Error> {
    if prefix.is_dir() {
        return Ok(false);
    }

    copy_dir(ctx, template, prefix)?;
    Ok(true)
}

/// Creates the script for a freshly opened executable, creating its prefix first.
pub fn open_executable(ctx: &Context, settings: &Settings, exe: &Path) -> Result<Script, Error> {
    let exe = exe.canonicalize()?;
    let sha256sum = charm_cfg::hash_file(&exe)?;
    let prefix = target_for(ctx.paths, settings, &exe, &sha256sum);

    let template = source_template(ctx.paths, settings);
    if ensure(ctx, &template, &prefix)? {
        info!("Created prefix {}", prefix.display());
    }

    let progname = exe::progname(&exe);
    let mut script = exe::script_with(&exe, &prefix, sha256sum, progname);
    script.runner = settings.runner.clone().unwrap_or_default();
    script.wine_debug.clone_from(&settings.wine_debug);
    script.env_vars.clone_from(&settings.env_vars);
    script.script_path = free_script_path(&script);

    script.write()?;
    info!("Created script {}", script.script_path.display());
    Ok(script)
}

/// `<progname>.charm`, unless that file belongs to another executable.
fn free_script_path(script: &Script) -> PathBuf {
    let taken = |path: &Path| {
        path.exists()
            && Script::read(path).map_or(true, |other| other.sha256sum != script.sha256sum)
    };

    if !taken(&script.script_path) {
        return script.script_path.clone();
    }

    let stem = exe::script_file_stem(&script.progname);
    script
        .wineprefix
        .join(format!("{stem}-{}.charm", script.short_hash()))
}

/// Copies the architecture's default template into the shared single prefix unless it
/// already exists.
pub fn ensure_single(ctx: &Context, arch: Arch) -> Result<PathBuf, Error> {
    let prefix = ctx.paths.single_prefix(arch);
    ensure(ctx, &ctx.paths.default_template(arch), &prefix)?;
    Ok(prefix)
}

/// Removes a prefix directory. Its scripts go with it.
pub fn delete(paths: &Paths, prefix: &Path) -> Result<(), Error> {
    if prefix.parent() != Some(paths.prefixes.as_path()) {
        return Err(Error::NotManaged(prefix.to_path_buf()));
    }
    if !prefix.is_dir() {
        return Err(Error::Missing(prefix.to_path_buf()));
    }

    info!("Deleting prefix {}", prefix.display());
    fs::remove_dir_all(prefix)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use charm_cfg::{Arch, Script, Settings};
    use pretty_assertions::assert_eq;

    use super::{arch, copy_dir, delete, free_script_path, source_template, target_for, Error};
    use crate::{exe, Cancellation, Context, Paths, Reporter, User};

    #[test]
    fn reads_arch_line() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("system.reg"),
            "WINE REGISTRY Version 2\n;; All keys relative to \\\\Machine\n\n#arch=win32\n",
        )
        .unwrap();
        assert_eq!(arch(dir.path()), Some(Arch::Win32));
        assert_eq!(arch(&dir.path().join("missing")), None);
    }

    #[test]
    fn picks_target_by_mode() {
        let paths = Paths::new(Path::new("/data"));
        let mut settings = Settings::new(&paths.default_template(Arch::Win64));
        let exe = Path::new("/tmp/GameSetup.exe");
        let hash = "ab12cd34ef0000000000";

        assert_eq!(
            target_for(&paths, &settings, exe, hash),
            Path::new("/data/Prefixes/GameSetup-ab12cd34ef")
        );

        settings.single_prefix = true;
        settings.arch = Arch::Win32;
        assert_eq!(
            target_for(&paths, &settings, exe, hash),
            Path::new("/data/Prefixes/WineCharm-Single_win32")
        );
    }

    #[test]
    fn falls_back_to_default_template() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let mut settings = Settings::new(&paths.default_template(Arch::Win64));
        settings.set_template(&dir.path().join("Templates/Gone"));

        assert_eq!(
            source_template(&paths, &settings),
            paths.default_template(Arch::Win64)
        );
    }

    #[test]
    fn copies_and_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let user = User::new("alice", dir.path());
        let cancel = Cancellation::new();
        let reporter = Reporter::silent();
        let ctx = Context {
            paths: &paths,
            user: &user,
            cancel: &cancel,
            reporter: &reporter,
        };

        let source = dir.path().join("src");
        fs::create_dir_all(source.join("drive_c/windows")).unwrap();
        fs::write(source.join("system.reg"), "#arch=win64\n").unwrap();

        let dest = dir.path().join("Prefixes/Copy");
        copy_dir(&ctx, &source, &dest).unwrap();
        assert!(dest.join("drive_c/windows").is_dir());
        assert_eq!(arch(&dest), Some(Arch::Win64));

        assert!(matches!(copy_dir(&ctx, &source, &dest), Err(Error::Exists(_))));
    }

    #[test]
    fn cancelled_copy_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let user = User::new("alice", dir.path());
        let cancel = Cancellation::new();
        cancel.cancel();
        let reporter = Reporter::silent();
        let ctx = Context {
            paths: &paths,
            user: &user,
            cancel: &cancel,
            reporter: &reporter,
        };

        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        let dest = dir.path().join("Prefixes/Copy");

        assert!(copy_dir(&ctx, &source, &dest).is_err_and(|e| e.is_cancelled()));
        assert!(!dest.exists());
    }

    #[test]
    fn avoids_other_scripts_file() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("WineCharm-Single_win64");
        fs::create_dir_all(&prefix).unwrap();

        let mut first = exe::script_with(
            Path::new("/games/a/setup.exe"),
            &prefix,
            "a".repeat(64),
            "Setup".into(),
        );
        first.write().unwrap();

        let second = exe::script_with(
            Path::new("/games/b/setup.exe"),
            &prefix,
            "b".repeat(64),
            "Setup".into(),
        );
        assert_eq!(
            free_script_path(&second),
            prefix.join("Setup-bbbbbbbbbb.charm")
        );
        assert_eq!(free_script_path(&first), prefix.join("Setup.charm"));

        let reread = Script::read(&prefix.join("Setup.charm")).unwrap();
        assert_eq!(reread.sha256sum, "a".repeat(64));
    }

    #[test]
    fn deletes_only_managed_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let prefix = paths.prefixes.join("Game-0123456789");
        fs::create_dir_all(prefix.join("drive_c")).unwrap();

        assert!(matches!(
            delete(&paths, dir.path()),
            Err(Error::NotManaged(_))
        ));
        delete(&paths, &prefix).unwrap();
        assert!(!prefix.exists());
    }
}
