//! Templates: clean prefixes new prefixes are copied from.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use charm_cfg::{Arch, Settings};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    command::WineEnv, prefix, process, rewrite, steps::Steps, Cancellation, Context, Paths,
    Reporter,
};

/// Packages every fresh template gets.
pub const WINETRICKS_PACKAGES: [&str; 2] = ["arial", "openal"];

const REQUIRED_ON_IMPORT: [&str; 3] = ["system.reg", "userdef.reg", "dosdevices"];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} is not a valid template")]
    Invalid(PathBuf),
    #[error("Template {0} is in use")]
    InUse(PathBuf),
    #[error("{0} is not inside the templates directory")]
    NotManaged(PathBuf),
    #[error("Template command error. {0}")]
    Process(#[from] process::Error),
    #[error("Prefix error. {0}")]
    Prefix(#[from] prefix::Error),
    #[error("Unable to rewrite template. {0}")]
    Rewrite(#[from] rewrite::Error),
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
}

impl Error {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Process(e) => e.is_cancelled(),
            Error::Prefix(e) => e.is_cancelled(),
            Error::Rewrite(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// How far template initialization got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initialized {
    Full,
    /// Cancelled midway and rebuilt without winetricks packages.
    Basic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub name: String,
    pub dir: PathBuf,
    pub arch: Option<Arch>,
}

pub fn validate(dir: &Path) -> Result<(), Error> {
    if dir.join("system.reg").is_file() {
        Ok(())
    } else {
        Err(Error::Invalid(dir.to_path_buf()))
    }
}

/// Builds a template for `arch` in `dir` with `wine`.
///
/// Cancelling removes the partial template and builds a basic one instead, so there is
/// always something to copy prefixes from.
pub fn initialize(ctx: &Context, dir: &Path, arch: Arch, wine: &Path) -> Result<Initialized, Error> {
    info!("Initializing {arch} template {}", dir.display());
    let env = WineEnv::new(wine, dir)?
        .with_arch(arch)
        .with_env("WINE", &wine.to_string_lossy());
    let log = log_path(ctx.paths, dir);
    fs::create_dir_all(&ctx.paths.tmp)?;

    let mut steps = Steps::new(3, ctx.cancel, ctx.reporter);
    let result = (|| -> Result<(), Error> {
        steps.run("Initializing prefix", || boot(&env, ctx.cancel, ctx.reporter, &log))?;
        steps.run("Replacing user directory symlinks", || {
            flatten_user_dirs(dir).map_err(Error::from)
        })?;
        steps.run("Installing fonts and audio", || {
            let mut command = env.command("winetricks", &["-q"]);
            command.args(WINETRICKS_PACKAGES);
            process::run_logged(&mut command, ctx.cancel, ctx.reporter, &log)
                .map_err(Error::from)
        })
    })();

    match result {
        Ok(()) => Ok(Initialized::Full),
        Err(e) if e.is_cancelled() => {
            warn!("Template initialization cancelled, creating a basic template");
            remove_partial(dir);
            basic(&env, dir, &log)?;
            Ok(Initialized::Basic)
        }
        Err(e) => {
            remove_partial(dir);
            Err(e)
        }
    }
}

fn basic(env: &WineEnv, dir: &Path, log: &Path) -> Result<(), Error> {
    let cancel = Cancellation::new();
    boot(env, &cancel, &Reporter::silent(), log)?;
    flatten_user_dirs(dir)?;
    Ok(())
}

fn boot(env: &WineEnv, cancel: &Cancellation, reporter: &Reporter, log: &Path) -> Result<(), Error> {
    process::run_logged(&mut env.wine_tool("wineboot", &["-i"]), cancel, reporter, log)?;
    process::run_logged(&mut env.wine_tool("wineserver", &["-w"]), cancel, reporter, log)?;
    Ok(())
}

fn log_path(paths: &Paths, dir: &Path) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    paths.tmp.join(format!("{name}-init.log"))
}

fn remove_partial(dir: &Path) {
    if dir.exists() {
        info!("Removing partial template {}", dir.display());
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("Unable to remove {}. {e}", dir.display());
        }
    }
}

/// Replaces the symlinks wine creates from `drive_c/users/<user>/` into `$HOME` with
/// empty directories.
pub fn flatten_user_dirs(prefix: &Path) -> Result<(), io::Error> {
    let users = prefix.join("drive_c").join("users");
    if !users.is_dir() {
        return Ok(());
    }

    let symlinks = fs::read_dir(users)?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .filter_map(|p| fs::read_dir(p).ok())
        .flatten()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_symlink()).unwrap_or(false))
        .map(|e| e.path());

    for symlink in symlinks {
        debug!("Replacing symlink {}", symlink.display());
        fs::remove_file(&symlink)?;
        fs::create_dir(&symlink)?;
    }

    Ok(())
}

/// Copies template `source` to a sibling called `name`.
pub fn clone(ctx: &Context, source: &Path, name: &str) -> Result<PathBuf, Error> {
    validate(source)?;
    let dest = ctx.paths.templates.join(name);
    if name.is_empty() || name.contains('/') || dest.parent() != Some(ctx.paths.templates.as_path())
    {
        return Err(Error::Invalid(dest));
    }

    prefix::copy_dir(ctx, source, &dest)?;
    info!("Cloned {} to {}", source.display(), dest.display());
    Ok(dest)
}

/// Removes a template unless it is the one settings point at.
pub fn delete(paths: &Paths, settings: &Settings, dir: &Path) -> Result<(), Error> {
    if dir == settings.template_path() {
        return Err(Error::InUse(dir.to_path_buf()));
    }
    if dir.parent() != Some(paths.templates.as_path()) || !dir.is_dir() {
        return Err(Error::NotManaged(dir.to_path_buf()));
    }

    info!("Deleting template {}", dir.display());
    fs::remove_dir_all(dir)?;
    Ok(())
}

/// Copies a prefix from anywhere into `Templates/`, localizes it and drops scripts and
/// desktop entries it carried.
pub fn import(ctx: &Context, source: &Path) -> Result<PathBuf, Error> {
    if REQUIRED_ON_IMPORT
        .iter()
        .any(|name| !source.join(name).exists())
    {
        return Err(Error::Invalid(source.to_path_buf()));
    }

    let name = source
        .file_name()
        .ok_or_else(|| Error::Invalid(source.to_path_buf()))?;
    let dest = ctx.paths.templates.join(name);

    let mut steps = Steps::new(3, ctx.cancel, ctx.reporter);
    steps.run("Copying template", || prefix::copy_dir(ctx, source, &dest))?;

    let result = (|| -> Result<(), Error> {
        steps.run("Restoring user names", || {
            rewrite::to_local(&dest, ctx.user, ctx.cancel).map(drop)
        })?;
        steps.run("Removing scripts", || strip_scripts(&dest).map_err(Error::from))?;
        Ok(())
    })();

    if let Err(e) = result {
        remove_partial(&dest);
        return Err(e);
    }

    info!("Imported template {}", dest.display());
    Ok(dest)
}

fn strip_scripts(dir: &Path) -> Result<(), io::Error> {
    let leftovers = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| {
            p.extension()
                .is_some_and(|e| e == "charm" || e == "desktop")
        })
        .collect::<Vec<_>>();

    for path in leftovers {
        debug!("Removing {}", path.display());
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Templates under `Templates/`, sorted by name.
#[must_use]
pub fn list(paths: &Paths) -> Vec<TemplateInfo> {
    let Ok(entries) = fs::read_dir(&paths.templates) else {
        return Vec::new();
    };

    let mut templates = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|dir| dir.join("system.reg").is_file())
        .map(|dir| TemplateInfo {
            name: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            arch: prefix::arch(&dir),
            dir,
        })
        .collect::<Vec<_>>();

    templates.sort_by(|a, b| a.name.cmp(&b.name));
    templates
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::symlink, path::Path};

    use charm_cfg::{Arch, Settings};
    use pretty_assertions::assert_eq;

    use super::{clone, delete, flatten_user_dirs, import, list, validate, Error};
    use crate::{Cancellation, Context, Paths, Reporter, User};

    fn template(dir: &Path, arch: &str) {
        fs::create_dir_all(dir.join("dosdevices")).unwrap();
        fs::create_dir_all(dir.join("drive_c/users/alice")).unwrap();
        fs::write(dir.join("system.reg"), format!("WINE REGISTRY Version 2\n#arch={arch}\n")).unwrap();
        fs::write(dir.join("userdef.reg"), "WINE REGISTRY Version 2\n").unwrap();
        fs::write(
            dir.join("user.reg"),
            "\"Desktop\"=\"C:\\\\users\\\\alice\\\\Desktop\"\n\"USERNAME\"=\"alice\"\n",
        )
        .unwrap();
    }

    #[test]
    fn flattens_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("drive_c/users/alice");
        fs::create_dir_all(&user).unwrap();
        symlink(dir.path(), user.join("Documents")).unwrap();
        fs::create_dir(user.join("AppData")).unwrap();

        flatten_user_dirs(dir.path()).unwrap();

        let documents = fs::symlink_metadata(user.join("Documents")).unwrap();
        assert!(documents.is_dir());
        assert_eq!(fs::read_dir(user.join("Documents")).unwrap().count(), 0);
        assert!(user.join("AppData").is_dir());
    }

    #[test]
    fn clones_lists_and_deletes() {
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

        let base = paths.default_template(Arch::Win32);
        template(&base, "win32");
        validate(&base).unwrap();
        assert!(matches!(validate(dir.path()), Err(Error::Invalid(_))));

        let copy = clone(&ctx, &base, "Gaming").unwrap();
        let names = list(&paths)
            .into_iter()
            .map(|t| (t.name, t.arch))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                ("Gaming".to_owned(), Some(Arch::Win32)),
                ("WineCharm-win32".to_owned(), Some(Arch::Win32)),
            ]
        );

        let mut settings = Settings::new(&base);
        settings.set_template(&copy);
        assert!(matches!(delete(&paths, &settings, &copy), Err(Error::InUse(_))));

        settings.set_template(&base);
        delete(&paths, &settings, &copy).unwrap();
        assert!(!copy.exists());
    }

    #[test]
    fn imports_foreign_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("data").as_path());
        let user = User::new("bob", Path::new("/home/bob"));
        let cancel = Cancellation::new();
        let reporter = Reporter::silent();
        let ctx = Context {
            paths: &paths,
            user: &user,
            cancel: &cancel,
            reporter: &reporter,
        };

        let source = dir.path().join("elsewhere/OldPrefix");
        template(&source, "win64");
        fs::write(source.join("Game.charm"), "sha256sum: 'x'\n").unwrap();
        fs::create_dir_all(source.join("drive_c/users/alice/Desktop")).unwrap();
        fs::write(source.join("drive_c/users/alice/Desktop/Game.desktop"), "").unwrap();

        let imported = import(&ctx, &source).unwrap();
        assert_eq!(imported, paths.templates.join("OldPrefix"));
        assert!(!imported.join("Game.charm").exists());
        assert!(!imported.join("drive_c/users/alice/Desktop/Game.desktop").exists());

        let user_reg = fs::read_to_string(imported.join("user.reg")).unwrap();
        assert!(user_reg.contains("\"USERNAME\"=\"bob\""));
        assert!(!user_reg.contains("alice"));

        let bare = dir.path().join("bare");
        fs::create_dir_all(&bare).unwrap();
        fs::write(bare.join("system.reg"), "").unwrap();
        assert!(matches!(import(&ctx, &bare), Err(Error::Invalid(_))));
    }
}
