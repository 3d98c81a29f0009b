use std::{
    fs,
    path::{Path, PathBuf},
};

use charm_cfg::Script;
use log::{info, warn};

use super::{
    tarball::{self, Member, Transform},
    Error,
};
use crate::{
    process,
    rewrite::{self, USERNAME_TOKEN},
    steps::Steps,
    Cancellation, Context, User,
};

/// Archives a prefix or template directory into `dest`.
pub fn backup(ctx: &Context, dir: &Path, dest: &Path) -> Result<(), Error> {
    if !dir.is_dir() {
        return Err(Error::NotADirectory(dir.to_path_buf()));
    }

    let member = Member::of(dir)?;
    let transforms = user_transforms(&member.name(), &ctx.user.name);
    info!("Backing up {} to {}", dir.display(), dest.display());

    let mut steps = Steps::new(3, ctx.cancel, ctx.reporter);
    let portable = steps.run("Preparing prefix", || {
        Portable::apply(dir, ctx.user, ctx.cancel)
    })?;
    let partial = Partial::new(dest);
    steps.run("Creating archive", || create(ctx, dest, &[member], &transforms))?;
    steps.run("Restoring prefix", || portable.restore())?;

    partial.keep();
    Ok(())
}

/// Archives the script's prefix together with the executable's directory when it lives
/// outside the prefix, and the runner when it is one of the managed runners.
pub fn create_bottle(ctx: &Context, script: &Script, dest: &Path) -> Result<(), Error> {
    let prefix = &script.wineprefix;
    let prefix_member = Member::of(prefix)?;
    let prefix_name = prefix_member.name();

    let mut transforms = user_transforms(&prefix_name, &ctx.user.name);
    let mut members = vec![prefix_member];
    let mut bottled = script.clone();

    if let Some(game_dir) = game_dir(script) {
        if game_dir == ctx.user.home || game_dir.parent().is_none() {
            return Err(Error::UnsafeGameDir(game_dir));
        }

        let member = Member::of(&game_dir)?;
        let name = member.name();
        transforms.extend(Transform::subtree(
            &name,
            &format!("{prefix_name}/drive_c/GAMEDIR/{name}"),
        ));

        if let Some(exe) = script.exe_file.file_name() {
            bottled.exe_file = prefix.join("drive_c").join("GAMEDIR").join(&name).join(exe);
        }
        members.push(member);
    }

    if let Some((runner_dir, rest)) = bundled_runner(script, &ctx.paths.runners) {
        let member = Member::of(&runner_dir)?;
        let name = member.name();
        transforms.extend(Transform::subtree(
            &name,
            &format!("{prefix_name}/Runner/{name}"),
        ));

        bottled.runner = prefix
            .join("Runner")
            .join(&name)
            .join(rest)
            .to_string_lossy()
            .into_owned();
        members.push(member);
    }

    info!(
        "Creating bottle {} from {} ({} members)",
        dest.display(),
        prefix.display(),
        members.len()
    );

    let mut steps = Steps::new(5, ctx.cancel, ctx.reporter);
    let rewritten = steps.run("Updating script paths", || Rewritten::apply(script, bottled))?;
    let portable = steps.run("Preparing prefix", || {
        Portable::apply(prefix, ctx.user, ctx.cancel)
    })?;
    let partial = Partial::new(dest);
    steps.run("Creating archive", || create(ctx, dest, &members, &transforms))?;
    steps.run("Restoring prefix", || portable.restore())?;
    steps.run("Restoring script", || rewritten.restore())?;

    partial.keep();
    Ok(())
}

fn create(
    ctx: &Context,
    dest: &Path,
    members: &[Member],
    transforms: &[Transform],
) -> Result<(), Error> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut command = tarball::create_command(dest, members, transforms);
    process::run(&mut command, ctx.cancel, ctx.reporter)?;
    Ok(())
}

fn user_transforms(prefix_name: &str, user: &str) -> Vec<Transform> {
    Transform::subtree(
        &format!("{prefix_name}/drive_c/users/{user}"),
        &format!("{prefix_name}/drive_c/users/{USERNAME_TOKEN}"),
    )
    .to_vec()
}

fn game_dir(script: &Script) -> Option<PathBuf> {
    if script.exe_file.as_os_str().is_empty() || script.exe_file.starts_with(&script.wineprefix) {
        return None;
    }
    script.exe_file.parent().map(Path::to_path_buf)
}

fn bundled_runner(script: &Script, runners: &Path) -> Option<(PathBuf, PathBuf)> {
    let relative = Path::new(&script.runner).strip_prefix(runners).ok()?;
    let mut components = relative.components();
    let name = components.next()?;
    Some((runners.join(name), components.as_path().to_path_buf()))
}

/// Keeps a prefix in portable form until restored or dropped.
struct Portable<'a> {
    dir: &'a Path,
    user: &'a User,
    restored: bool,
}

impl<'a> Portable<'a> {
    fn apply(dir: &'a Path, user: &'a User, cancel: &Cancellation) -> Result<Self, Error> {
        let guard = Self {
            dir,
            user,
            restored: false,
        };
        rewrite::to_portable(dir, user, cancel)?;
        Ok(guard)
    }

    fn restore(mut self) -> Result<(), Error> {
        self.restored = true;
        rewrite::to_local(self.dir, self.user, &Cancellation::new())?;
        Ok(())
    }
}

impl Drop for Portable<'_> {
    fn drop(&mut self) {
        if !self.restored {
            warn!("Restoring {} after failed backup", self.dir.display());
            if let Err(e) = rewrite::to_local(self.dir, self.user, &Cancellation::new()) {
                warn!("Unable to restore {}. {e}", self.dir.display());
            }
        }
    }
}

/// A script temporarily persisted with its in-bottle paths.
struct Rewritten {
    original: Script,
    active: bool,
}

impl Rewritten {
    fn apply(original: &Script, mut bottled: Script) -> Result<Self, Error> {
        let active = bottled != *original;
        let guard = Self {
            original: original.clone(),
            active,
        };
        if active {
            bottled.write()?;
        }
        Ok(guard)
    }

    fn restore(mut self) -> Result<(), Error> {
        if self.active {
            self.active = false;
            self.original.clone().write()?;
        }
        Ok(())
    }
}

impl Drop for Rewritten {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.original.clone().write() {
                warn!(
                    "Unable to restore {}. {e}",
                    self.original.script_path.display()
                );
            }
        }
    }
}

/// Removes an output file unless told to keep it.
struct Partial<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> Partial<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for Partial<'_> {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            info!("Removing partial archive {}", self.path.display());
            let _ = fs::remove_file(self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use charm_cfg::{Script, DEFAULT_WINE_DEBUG};
    use pretty_assertions::assert_eq;

    use super::{bundled_runner, game_dir, user_transforms};

    fn script(exe: &str, runner: &str) -> Script {
        Script {
            sha256sum: "0".repeat(64),
            exe_file: PathBuf::from(exe),
            script_path: PathBuf::from("/data/Prefixes/Game-0000000000/Game.charm"),
            wineprefix: PathBuf::from("/data/Prefixes/Game-0000000000"),
            progname: "Game".into(),
            args: String::new(),
            env_vars: String::new(),
            runner: runner.into(),
            wine_debug: DEFAULT_WINE_DEBUG.into(),
            mtime: None,
        }
    }

    #[test]
    fn bundles_outside_game_dir_and_managed_runner() {
        let outside = script("/games/My Game/game.exe", "/data/Runners/wine-9.0/bin/wine");
        assert_eq!(game_dir(&outside), Some(PathBuf::from("/games/My Game")));
        assert_eq!(
            bundled_runner(&outside, Path::new("/data/Runners")),
            Some((PathBuf::from("/data/Runners/wine-9.0"), PathBuf::from("bin/wine")))
        );

        let inside = script("/data/Prefixes/Game-0000000000/drive_c/Game/game.exe", "wine");
        assert_eq!(game_dir(&inside), None);
        assert_eq!(bundled_runner(&inside, Path::new("/data/Runners")), None);
    }

    #[test]
    fn rewrites_user_directory_only() {
        let transforms = user_transforms("Game-0000000000", "a.lice");
        assert_eq!(
            transforms.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            vec![
                r"s|^Game-0000000000/drive_c/users/a\.lice$|Game-0000000000/drive_c/users/%USERNAME%|",
                r"s|^Game-0000000000/drive_c/users/a\.lice/|Game-0000000000/drive_c/users/%USERNAME%/|",
            ]
        );
    }
}
