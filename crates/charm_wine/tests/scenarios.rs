use std::{
    fs,
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::Duration,
};

use charm_cfg::{hash_file, Arch, Script};
use charm_wine::{
    archive::{self, ArchiveKind},
    Cancellation, Context, Event, Manager, Opened, Paths, Reporter, User,
};
use pretty_assertions::assert_eq;

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    paths: Paths,
}

impl Fixture {
    fn new() -> Self {
        Self::with_user("alice")
    }

    /// A default template last localized for `user`.
    fn with_user(user: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let paths = Paths::new(&root.join("data"));

        let template = paths.default_template(Arch::Win64);
        fs::create_dir_all(template.join("dosdevices")).unwrap();
        fs::create_dir_all(template.join("drive_c/users").join(user).join("Desktop")).unwrap();
        fs::write(
            template.join("system.reg"),
            "WINE REGISTRY Version 2\n#arch=win64\n",
        )
        .unwrap();
        fs::write(template.join("userdef.reg"), "WINE REGISTRY Version 2\n").unwrap();
        fs::write(
            template.join("user.reg"),
            format!(
                "[Volatile Environment]\n\"USERNAME\"=\"{user}\"\n\
                 \"Desktop\"=\"C:\\\\users\\\\{user}\\\\Desktop\"\n"
            ),
        )
        .unwrap();

        Self {
            _dir: dir,
            root,
            paths,
        }
    }

    fn user(&self, name: &str) -> User {
        User::new(name, &self.root.join(format!("home-{name}")))
    }

    fn manager(&self, user: &str) -> Manager {
        Manager::new(self.paths.clone(), self.user(user), Reporter::silent()).unwrap()
    }

    fn exe(&self, name: &str) -> PathBuf {
        let exe = self.root.join("downloads").join(name);
        fs::create_dir_all(exe.parent().unwrap()).unwrap();
        fs::write(&exe, format!("MZ fake executable {name}")).unwrap();
        exe
    }
}

fn has(program: &str) -> bool {
    which::which(program).is_ok()
}

fn open_script(manager: &mut Manager, exe: &Path) -> String {
    match manager.open_file(exe).unwrap() {
        Opened::Script(key) => key,
        Opened::Restored(_) => panic!("expected a script"),
    }
}

#[test]
fn opens_fresh_executable_into_own_prefix() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager("alice");
    let exe = fixture.exe("GameSetup.exe");
    let hash = hash_file(&exe).unwrap();

    let key = open_script(&mut manager, &exe);
    assert_eq!(key, hash);

    let prefix = fixture
        .paths
        .prefixes
        .join(format!("GameSetup-{}", &hash[..10]));
    let charm = prefix.join("GameSetup.charm");
    assert!(prefix.join("drive_c").is_dir());
    assert!(charm.is_file());

    let script = Script::read(&charm).unwrap();
    assert_eq!(script.sha256sum, hash);
    assert_eq!(script.wineprefix, prefix);
    assert_eq!(manager.registry().len(), 1);

    // Opening it again reuses everything.
    open_script(&mut manager, &exe);
    assert_eq!(manager.registry().len(), 1);
    assert_eq!(fs::read_dir(&fixture.paths.prefixes).unwrap().count(), 1);

    // A fresh manager finds the same script on disk.
    let reloaded = fixture.manager("alice");
    assert_eq!(reloaded.registry().len(), 1);
    assert_eq!(reloaded.script(&hash[..10]).unwrap().script_path, charm);
}

#[test]
fn single_prefix_mode_shares_one_prefix() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager("alice");
    manager.set_single_prefix(true).unwrap();

    let first = open_script(&mut manager, &fixture.exe("one.exe"));
    let second = open_script(&mut manager, &fixture.exe("two.exe"));

    let shared = fixture.paths.single_prefix(Arch::Win64);
    assert_eq!(manager.script(&first).unwrap().wineprefix, shared);
    assert_eq!(manager.script(&second).unwrap().wineprefix, shared);
    assert!(shared.join("one.charm").is_file());
    assert!(shared.join("two.charm").is_file());

    let settings = fs::read_to_string(&fixture.paths.settings).unwrap();
    assert!(settings.contains("single-prefix: true"));
}

#[test]
fn edits_scripts_in_place() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager("alice");
    let key = open_script(&mut manager, &fixture.exe("game.exe"));
    let old_path = manager.script(&key).unwrap().script_path.clone();

    manager.rename(&key, "My Game").unwrap();
    let script = manager.script(&key).unwrap().clone();
    assert_eq!(script.progname, "My Game");
    assert_eq!(script.script_path, old_path.with_file_name("My Game.charm"));
    assert!(!old_path.exists());

    manager.set_env_vars(&key, "FOO=bar;BAZ=qux").unwrap();
    assert!(manager.set_env_vars(&key, "1BAD=x").is_err());
    manager.set_args(&key, "-windowed -nosound").unwrap();

    let on_disk = Script::read(&script.script_path).unwrap();
    assert_eq!(on_disk.env_vars, "FOO=bar;BAZ=qux");
    assert_eq!(on_disk.args, "-windowed -nosound");

    let new_key = manager.reset(&key).unwrap();
    assert_eq!(new_key, key);
    assert!(script.script_path.with_extension("bak").is_file());
    let reset = Script::read(&script.script_path).unwrap();
    assert_eq!(reset.args, "");
    assert_eq!(reset.env_vars, "");

    manager.delete(&key).unwrap();
    assert!(!script.script_path.exists());
    assert!(manager.registry().is_empty());
}

#[test]
fn deleting_prefix_forgets_its_scripts() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager("alice");
    let key = open_script(&mut manager, &fixture.exe("game.exe"));
    let prefix = manager.script(&key).unwrap().wineprefix.clone();

    manager.delete_prefix(&key).unwrap();
    assert!(!prefix.exists());
    assert!(manager.registry().is_empty());
}

#[test]
fn backup_restores_for_another_user() {
    if !has("tar") || !has("zstd") {
        eprintln!("Skipping, tar or zstd is not installed");
        return;
    }

    let fixture = Fixture::new();
    let mut alice = fixture.manager("alice");
    let key = open_script(&mut alice, &fixture.exe("GameSetup.exe"));
    let prefix = alice.script(&key).unwrap().wineprefix.clone();

    let archive = fixture.root.join("it's out.prefix");
    alice.backup_prefix(&key, &archive).unwrap();
    assert!(archive.is_file());
    drop(alice);

    fs::remove_dir_all(&fixture.paths.prefixes).unwrap();

    let mut bob = fixture.manager("bob");
    assert!(bob.registry().is_empty());
    let Opened::Restored(restored) = bob.open_file(&archive).unwrap() else {
        panic!("expected a restore");
    };
    assert_eq!(restored.kind, ArchiveKind::Prefix);
    assert_eq!(restored.target, prefix);

    let user_reg = fs::read_to_string(prefix.join("user.reg")).unwrap();
    assert!(user_reg.contains("\"USERNAME\"=\"bob\""));
    assert!(!user_reg.contains("alice"));
    assert!(!user_reg.contains("%USERNAME%"));
    assert!(prefix.join("drive_c/users/bob").is_dir());
    assert!(!prefix.join("drive_c/users/alice").exists());

    assert_eq!(bob.registry().len(), 1);
    assert!(bob.script(&key).is_ok());
}

#[test]
fn cancelled_restore_keeps_existing_prefix() {
    let fixture = Fixture::new();
    let mut manager = fixture.manager("alice");
    let key = open_script(&mut manager, &fixture.exe("game.exe"));
    let prefix = manager.script(&key).unwrap().wineprefix.clone();
    let before = fs::read_to_string(prefix.join("user.reg")).unwrap();

    let archive = fixture.root.join("game.prefix");
    fs::write(&archive, b"not really an archive").unwrap();

    let user = fixture.user("alice");
    let cancel = Cancellation::new();
    cancel.cancel();
    let reporter = Reporter::silent();
    let ctx = Context {
        paths: &fixture.paths,
        user: &user,
        cancel: &cancel,
        reporter: &reporter,
    };

    let err = archive::restore(&ctx, &archive, ArchiveKind::Prefix).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(fs::read_to_string(prefix.join("user.reg")).unwrap(), before);
    assert_eq!(fs::read_dir(&fixture.paths.prefixes).unwrap().count(), 1);
}

#[test]
fn dotted_username_survives_backup_and_restore() {
    if !has("tar") || !has("zstd") {
        eprintln!("Skipping, tar or zstd is not installed");
        return;
    }

    let fixture = Fixture::with_user("john.doe");
    let mut john = fixture.manager("john.doe");
    let key = open_script(&mut john, &fixture.exe("GameSetup.exe"));
    let prefix = john.script(&key).unwrap().wineprefix.clone();
    assert!(prefix.join("drive_c/users/john.doe/Desktop").is_dir());

    let archive = fixture.root.join("john's game 'v1'.prefix");
    john.backup_prefix(&key, &archive).unwrap();
    drop(john);

    fs::remove_dir_all(&fixture.paths.prefixes).unwrap();

    let mut bob = fixture.manager("bob");
    let Opened::Restored(restored) = bob.open_file(&archive).unwrap() else {
        panic!("expected a restore");
    };
    assert_eq!(restored.target, prefix);

    let user_reg = fs::read_to_string(prefix.join("user.reg")).unwrap();
    assert!(user_reg.contains("\"USERNAME\"=\"bob\""));
    assert!(user_reg.contains(r"C:\\users\\bob\\Desktop"));
    assert!(!user_reg.contains("john.doe"));
    assert!(!user_reg.contains("%USERNAME%"));
    assert!(prefix.join("drive_c/users/bob/Desktop").is_dir());
    assert!(!prefix.join("drive_c/users/john.doe").exists());
    assert!(!prefix.join("drive_c/users/%USERNAME%").exists());

    let charm = fs::read_to_string(bob.script(&key).unwrap().script_path.clone()).unwrap();
    assert!(!charm.contains("john.doe"));
}

#[test]
fn restore_interrupted_while_extracting_rolls_back() {
    if !has("tar") || !has("zstd") {
        eprintln!("Skipping, tar or zstd is not installed");
        return;
    }

    let fixture = Fixture::new();
    let mut alice = fixture.manager("alice");
    let key = open_script(&mut alice, &fixture.exe("game.exe"));
    let prefix = alice.script(&key).unwrap().wineprefix.clone();

    let archive = fixture.root.join("game.prefix");
    alice.backup_prefix(&key, &archive).unwrap();
    drop(alice);

    // Only the prefix already on disk has this file.
    fs::write(prefix.join("saved.txt"), "keep me").unwrap();

    let (tx, rx) = mpsc::channel();
    let mut manager =
        Manager::new(fixture.paths.clone(), fixture.user("alice"), Reporter::new(tx)).unwrap();
    let cancel = manager.cancellation();
    let interrupter = thread::spawn(move || {
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(30)) {
            if matches!(&event, Event::StepStarted { name, .. } if name == "Extracting archive") {
                cancel.cancel();
                break;
            }
        }
    });

    let err = manager.open_file(&archive).unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    interrupter.join().unwrap();

    assert_eq!(fs::read_to_string(prefix.join("saved.txt")).unwrap(), "keep me");
    let names = fs::read_dir(&fixture.paths.prefixes)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert_eq!(names.len(), 1, "{names:?}");
    assert!(!names[0].contains("_backup_"));
}
