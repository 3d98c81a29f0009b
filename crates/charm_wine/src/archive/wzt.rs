//! Legacy WineZGUI archives: placeholder tokens in file names and contents, and shell
//! launcher scripts instead of `.charm` files.

use std::{
    fs,
    path::{Path, PathBuf},
};

use charm_cfg::{tilde, Script, DEFAULT_WINE_DEBUG};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use walkdir::WalkDir;

use super::Error;
use crate::{exe, rewrite, Cancellation, Paths, User};

lazy_static! {
    static ref ASSIGNMENT: Regex =
        Regex::new(r#"^\s*(?:export\s+)?([A-Z_][A-Z0-9_]*)=(?:"([^"]*)"|'([^']*)'|(\S*))"#)
            .unwrap();
}

/// Token replacements, longest token first.
#[must_use]
pub fn tokens(paths: &Paths, user: &User) -> Vec<(String, String)> {
    let name = &user.name;
    let home = user.home.to_string_lossy();
    let relative = |p: &Path| {
        p.strip_prefix(&user.home)
            .unwrap_or(p)
            .to_string_lossy()
            .into_owned()
    };

    let mut tokens = vec![
        ("XOUSERHOMEXO", home.into_owned()),
        ("XOUSERSUSERXO", format!("/users/{name}")),
        ("XOMEDIASUSERXO", format!("/media/{name}")),
        ("XOREGUSERSUSERXO", format!(r"\\users\\{name}")),
        ("XOREGHOMEUSERXO", format!(r"\\home\\{name}")),
        ("XOREGUSERNAMEUSERXO", format!(r#""USERNAME"="{name}""#)),
        ("XOREGINSTALLEDBYUSERXO", format!(r#""InstalledBy"="{name}""#)),
        ("XOREGREGOWNERUSERXO", format!(r#""RegOwner"="{name}""#)),
        ("XOCONFIGXO", ".config".to_owned()),
        ("XOPREFIXXO", relative(&paths.prefixes)),
        ("XOWINEZGUIDIRXO", ".local/share/winezgui".to_owned()),
        ("XODATADIRXO", paths.root.to_string_lossy().into_owned()),
        ("XODESKTOPDIRXO", ".local/share/applications".to_owned()),
        ("XOAPPLICATIONSXO", "applications".to_owned()),
        ("XOAPPLICATIONSDIRXO", ".local/share/applications".to_owned()),
        ("XOINSTALLTYPEXO", "linux".to_owned()),
        ("XOFLATPAKIDXO", String::new()),
        ("XOFLATPAKNAMEXO", String::new()),
        ("XOWINEEXEXO", String::new()),
        ("XOWINEVERXO", "wine-9.0".to_owned()),
        (rewrite::LEGACY_USER_TOKEN, name.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v))
    .collect::<Vec<_>>();

    tokens.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
    tokens
}

/// Replaces tokens in file names and text file contents below `dir`.
///
/// Returns the number of files changed.
pub fn substitute(
    dir: &Path,
    tokens: &[(String, String)],
    cancel: &Cancellation,
) -> Result<usize, Error> {
    let mut changed = 0;

    // Deepest entries first so renaming a directory never invalidates a pending path.
    let entries = WalkDir::new(dir)
        .min_depth(1)
        .contents_first(true)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .collect::<Vec<_>>();

    for entry in entries {
        cancel.check()?;

        let path = entry.path();

        if entry.file_type().is_file() {
            match rewrite::replace_in_file(path, tokens) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!("Skipping {}. {e}", path.display()),
            }
        }

        let name = entry.file_name().to_string_lossy();
        if !tokens.iter().any(|(t, _)| name.contains(t.as_str())) {
            continue;
        }

        let renamed = replace_all(&name, tokens);
        if renamed.contains('/') || renamed.is_empty() {
            warn!("Not renaming {}, would become {renamed}", path.display());
            continue;
        }

        debug!("Renaming {} to {renamed}", path.display());
        fs::rename(path, path.with_file_name(&renamed))?;
        changed += 1;
    }

    info!("Substituted tokens in {changed} entries of {}", dir.display());
    Ok(changed)
}

fn replace_all(value: &str, tokens: &[(String, String)]) -> String {
    tokens
        .iter()
        .fold(value.to_owned(), |acc, (t, v)| acc.replace(t.as_str(), v))
}

/// Fields of a WineZGUI launcher script.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LegacyScript {
    pub progname: Option<String>,
    pub exe_file: Option<String>,
    pub args: Option<String>,
    pub sha256sum: Option<String>,
}

#[must_use]
pub fn parse_legacy_script(text: &str) -> LegacyScript {
    let mut script = LegacyScript::default();

    for line in text.lines() {
        let Some(captures) = ASSIGNMENT.captures(line) else {
            continue;
        };

        let value = (2..=4)
            .find_map(|i| captures.get(i))
            .map(|m| m.as_str().to_owned());
        let Some(value) = value else {
            continue;
        };

        match &captures[1] {
            "PROGNAME" => script.progname = Some(value),
            "EXE_FILE" | "EXE_PATH" => script.exe_file = Some(value),
            "ARGS" | "EXE_ARGS" => script.args = Some(value),
            "CHECKSUM" | "SHA256SUM" => script.sha256sum = Some(value),
            _ => {}
        }
    }

    script
}

/// Turns every top-level `*.sh` launcher of `prefix` into a `.charm` file next to it.
pub fn convert_scripts(prefix: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut created = Vec::new();

    let launchers = fs::read_dir(prefix)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "sh"));

    for path in launchers {
        let text = String::from_utf8_lossy(&fs::read(&path)?).into_owned();
        let legacy = parse_legacy_script(&text);

        let Some(exe_file) = legacy.exe_file.as_deref().map(expand_home) else {
            debug!("{} does not name an executable", path.display());
            continue;
        };

        let sha256sum = match legacy.sha256sum.filter(|s| s.len() == 64) {
            Some(hash) => hash,
            None if exe_file.is_file() => charm_cfg::hash_file(&exe_file)?,
            None => {
                warn!("Skipping {}, no checksum and no executable", path.display());
                continue;
            }
        };

        let progname = legacy
            .progname
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| exe::progname(&exe_file));

        let mut script = Script {
            sha256sum,
            script_path: prefix.join(format!("{}.charm", exe::script_file_stem(&progname))),
            wineprefix: prefix.to_path_buf(),
            exe_file,
            progname,
            args: legacy.args.unwrap_or_default(),
            env_vars: String::new(),
            runner: String::new(),
            wine_debug: DEFAULT_WINE_DEBUG.to_owned(),
            mtime: None,
        };

        if script.script_path.exists() {
            debug!("{} already exists", script.script_path.display());
            continue;
        }

        info!("Converted {} to {}", path.display(), script.script_path.display());
        script.write()?;
        created.push(script.script_path);
    }

    Ok(created)
}

fn expand_home(value: &str) -> PathBuf {
    let value = value.replace("${HOME}", "~").replace("$HOME", "~");
    tilde::expand(&value)
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use charm_cfg::Script;
    use pretty_assertions::assert_eq;

    use super::{convert_scripts, parse_legacy_script, substitute, tokens, LegacyScript};
    use crate::{Cancellation, Paths, User};

    #[test]
    fn token_table() {
        let paths = Paths::new(Path::new("/home/bob/.local/share/winecharm"));
        let user = User::new("bob", Path::new("/home/bob"));
        let tokens = tokens(&paths, &user);

        let get = |k: &str| tokens.iter().find(|(t, _)| t == k).map(|(_, v)| v.as_str());
        assert_eq!(get("XOPREFIXXO"), Some(".local/share/winecharm/Prefixes"));
        assert_eq!(get("XOREGUSERSUSERXO"), Some(r"\\users\\bob"));
        assert_eq!(get("XOWINEVERXO"), Some("wine-9.0"));
        assert_eq!(get("XOWINEEXEXO"), Some(""));
        assert_eq!(get("XOUSERXO"), Some("bob"));
        assert!(tokens.windows(2).all(|w| w[0].0.len() >= w[1].0.len()));
    }

    #[test]
    fn substitutes_names_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("Game");
        fs::create_dir_all(prefix.join("drive_c/users/XOUSERXO/Desktop")).unwrap();
        fs::write(
            prefix.join("user.reg"),
            "\"Personal\"=\"C:XOREGUSERSUSERXO\\\\Documents\"\nXOREGUSERNAMEUSERXO\n",
        )
        .unwrap();

        let paths = Paths::new(Path::new("/home/bob/.local/share/winecharm"));
        let user = User::new("bob", Path::new("/home/bob"));
        substitute(&prefix, &tokens(&paths, &user), &Cancellation::new()).unwrap();

        assert!(prefix.join("drive_c/users/bob/Desktop").is_dir());
        assert_eq!(
            fs::read_to_string(prefix.join("user.reg")).unwrap(),
            "\"Personal\"=\"C:\\\\users\\\\bob\\\\Documents\"\n\"USERNAME\"=\"bob\"\n"
        );
    }

    #[test]
    fn parses_launcher() {
        let text = "#!/usr/bin/env bash\n\
            export PROGNAME=\"Some Game\"\n\
            export EXE_FILE='$HOME/Games/some game.exe'\n\
            ARGS=-windowed\n\
            export CHECKSUM=\"abc\"\n\
            echo $PROGNAME\n";

        assert_eq!(
            parse_legacy_script(text),
            LegacyScript {
                progname: Some("Some Game".into()),
                exe_file: Some("$HOME/Games/some game.exe".into()),
                args: Some("-windowed".into()),
                sha256sum: Some("abc".into()),
            }
        );
    }

    #[test]
    fn converts_launcher_to_charm() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("Game");
        fs::create_dir_all(prefix.join("drive_c/Game")).unwrap();
        let exe = prefix.join("drive_c/Game/game.exe");
        fs::write(&exe, b"MZ").unwrap();

        fs::write(
            prefix.join("Game.sh"),
            format!("export PROGNAME=\"The Game\"\nexport EXE_FILE=\"{}\"\n", exe.display()),
        )
        .unwrap();

        let created = convert_scripts(&prefix).unwrap();
        assert_eq!(created, vec![prefix.join("The Game.charm")]);

        let script = Script::read(&created[0]).unwrap();
        assert_eq!(script.exe_file, exe);
        assert_eq!(script.progname, "The Game");
        assert_eq!(script.sha256sum, charm_cfg::hash_file(&exe).unwrap());
    }
}
