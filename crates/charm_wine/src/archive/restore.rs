use std::{
    fs,
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use charm_cfg::Script;
use log::{info, warn};

use super::{
    tarball::{self, Transform},
    wzt, ArchiveKind, Error,
};
use crate::{
    lnk, process, registry,
    rewrite::{self, LEGACY_USER_TOKEN, USERNAME_TOKEN},
    steps::Steps,
    Context,
};

/// Result of a successful restore.
#[derive(Debug)]
pub struct Restored {
    pub kind: ArchiveKind,
    pub target: PathBuf,
    pub scripts: Vec<Script>,
}

/// Unpacks `archive` into the prefixes directory, or the templates directory for
/// templates.
///
/// An existing directory of the same name is moved aside first and put back if anything
/// fails or the operation is cancelled.
pub fn restore(ctx: &Context, archive: &Path, kind: ArchiveKind) -> Result<Restored, Error> {
    let root = match kind {
        ArchiveKind::Template => &ctx.paths.templates,
        _ => &ctx.paths.prefixes,
    };
    fs::create_dir_all(root)?;

    let total = if kind == ArchiveKind::Wzt { 9 } else { 6 };
    let mut steps = Steps::new(total, ctx.cancel, ctx.reporter);

    let name = steps.run("Inspecting archive", || {
        tarball::prefix_dir(archive, ctx.cancel)?
            .ok_or_else(|| Error::NoPrefixDir(archive.to_path_buf()))
    })?;
    let target = root.join(&name);
    info!("Restoring {} into {}", archive.display(), target.display());

    steps.run("Checking disk space", || {
        tarball::check_disk_space(archive, root, ctx.cancel)
    })?;
    let rollback = steps.run("Preparing target", || Rollback::new(&target))?;

    steps.run("Extracting archive", || {
        let transforms = [
            Transform::everywhere(USERNAME_TOKEN, &ctx.user.name),
            Transform::everywhere(LEGACY_USER_TOKEN, &ctx.user.name),
        ];
        let zstd = kind != ArchiveKind::Wzt && tarball::is_zstd_name(archive);
        let mut command = tarball::extract_command(archive, root, &transforms, zstd);
        process::run(&mut command, ctx.cancel, ctx.reporter)?;

        if target.is_dir() {
            Ok(())
        } else {
            Err(Error::NoPrefixDir(archive.to_path_buf()))
        }
    })?;

    if kind == ArchiveKind::Wzt {
        steps.run("Replacing WZT tokens", || {
            wzt::substitute(&target, &wzt::tokens(ctx.paths, ctx.user), ctx.cancel)
        })?;
        steps.run("Converting legacy scripts", || wzt::convert_scripts(&target))?;
    }

    steps.run("Restoring user names", || {
        rewrite::to_local(&target, ctx.user, ctx.cancel).map_err(Error::from)
    })?;

    let mut scripts = steps.run("Updating scripts", || relocate_scripts(&target))?;

    if kind == ArchiveKind::Wzt {
        let harvested = steps.run("Harvesting shortcuts", || {
            Ok::<_, Error>(lnk::harvest(&target, ctx.user))
        })?;
        for script in harvested {
            if !scripts.iter().any(|s| s.sha256sum == script.sha256sum) {
                scripts.push(script);
            }
        }
    }

    rollback.commit();
    info!("Restored {} with {} scripts", target.display(), scripts.len());

    Ok(Restored {
        kind,
        target,
        scripts,
    })
}

/// Points every script in a freshly restored prefix at the prefix's new location.
pub(super) fn relocate_scripts(prefix: &Path) -> Result<Vec<Script>, Error> {
    let mut scripts = Vec::new();

    for path in registry::charm_files(prefix, 1) {
        let mut script = match Script::read(&path) {
            Ok(script) => script,
            Err(e) => {
                warn!("Skipping {}. {e}", path.display());
                continue;
            }
        };

        let mut changed = false;

        if !script.exe_file.exists() {
            if let Some(exe) = rebase(&script.exe_file, prefix, "drive_c") {
                script.exe_file = exe;
                changed = true;
            }
        }

        let runner = Path::new(&script.runner);
        if runner.is_absolute() && !runner.exists() {
            if let Some(runner) = rebase(runner, prefix, "Runner") {
                script.runner = runner.to_string_lossy().into_owned();
                changed = true;
            }
        }

        if changed {
            info!("Relocated {}", path.display());
            script.write()?;
        }

        scripts.push(script);
    }

    Ok(scripts)
}

/// Re-roots `path` at `prefix/marker`, keeping whatever followed `marker`.
fn rebase(path: &Path, prefix: &Path, marker: &str) -> Option<PathBuf> {
    let mut components = path.components();
    components.find(|c| matches!(c, Component::Normal(n) if n.to_str() == Some(marker)))?;
    Some(prefix.join(marker).join(components.as_path()))
}

/// Moves an existing target aside and puts it back unless committed.
struct Rollback {
    target: PathBuf,
    backup: Option<PathBuf>,
    committed: bool,
}

impl Rollback {
    fn new(target: &Path) -> Result<Self, Error> {
        let backup = if target.exists() {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();

            let mut name = target.file_name().unwrap_or_default().to_os_string();
            name.push(format!("_backup_{ts}"));
            let backup = target.with_file_name(name);

            info!("Moving {} to {}", target.display(), backup.display());
            fs::rename(target, &backup)?;
            Some(backup)
        } else {
            None
        };

        Ok(Self {
            target: target.to_path_buf(),
            backup,
            committed: false,
        })
    }

    fn commit(mut self) {
        self.committed = true;
        if let Some(backup) = &self.backup {
            info!("Removing {}", backup.display());
            if let Err(e) = fs::remove_dir_all(backup) {
                warn!("Unable to remove {}. {e}", backup.display());
            }
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        if self.target.exists() {
            warn!("Removing partial {}", self.target.display());
            if let Err(e) = fs::remove_dir_all(&self.target) {
                warn!("Unable to remove {}. {e}", self.target.display());
            }
        }

        if let Some(backup) = &self.backup {
            warn!("Rolling back {}", self.target.display());
            if let Err(e) = fs::rename(backup, &self.target) {
                warn!("Unable to restore {}. {e}", backup.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use charm_cfg::{Script, DEFAULT_WINE_DEBUG};
    use pretty_assertions::assert_eq;

    use super::{rebase, relocate_scripts, Rollback};

    #[test]
    fn rebases_onto_new_prefix() {
        assert_eq!(
            rebase(
                Path::new("/old/Prefixes/Game/drive_c/GAMEDIR/Game/game.exe"),
                Path::new("/new/Prefixes/Game"),
                "drive_c"
            )
            .as_deref(),
            Some(Path::new("/new/Prefixes/Game/drive_c/GAMEDIR/Game/game.exe"))
        );
        assert_eq!(
            rebase(Path::new("/usr/bin/wine"), Path::new("/p"), "Runner"),
            None
        );
    }

    #[test]
    fn rollback_restores_previous_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Game");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("user.reg"), "old").unwrap();

        {
            let _rollback = Rollback::new(&target).unwrap();
            assert!(!target.exists());
            fs::create_dir_all(&target).unwrap();
            fs::write(target.join("user.reg"), "partial").unwrap();
        }

        assert_eq!(fs::read_to_string(target.join("user.reg")).unwrap(), "old");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn commit_drops_backup() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Game");
        fs::create_dir_all(&target).unwrap();

        let rollback = Rollback::new(&target).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("user.reg"), "new").unwrap();
        rollback.commit();

        assert_eq!(fs::read_to_string(target.join("user.reg")).unwrap(), "new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn relocates_moved_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("Game-0000000000");
        let exe = prefix.join("drive_c/GAMEDIR/Game/game.exe");
        fs::create_dir_all(exe.parent().unwrap()).unwrap();
        fs::write(&exe, b"MZ").unwrap();

        let mut script = Script {
            sha256sum: "f".repeat(64),
            exe_file: "/elsewhere/Game-0000000000/drive_c/GAMEDIR/Game/game.exe".into(),
            script_path: prefix.join("Game.charm"),
            wineprefix: prefix.clone(),
            progname: "Game".into(),
            args: String::new(),
            env_vars: String::new(),
            runner: "/elsewhere/Game-0000000000/Runner/wine-9.0/bin/wine".into(),
            wine_debug: DEFAULT_WINE_DEBUG.into(),
            mtime: None,
        };
        script.write().unwrap();

        let scripts = relocate_scripts(&prefix).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].exe_file, exe);
        assert_eq!(
            scripts[0].runner,
            prefix.join("Runner/wine-9.0/bin/wine").to_string_lossy()
        );

        let reread = Script::read(&prefix.join("Game.charm")).unwrap();
        assert_eq!(reread.exe_file, exe);
    }
}
