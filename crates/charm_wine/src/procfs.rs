use std::{
    fs,
    path::{Path, PathBuf},
};

/// A view of `/proc`. Tests point it at a fake tree.
#[derive(Debug, Clone)]
pub(crate) struct Proc {
    root: PathBuf,
}

impl Default for Proc {
    fn default() -> Self {
        Self::new(Path::new("/proc"))
    }
}

impl Proc {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn pids(&self) -> Vec<libc::pid_t> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut pids = entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str()?.parse().ok())
            .collect::<Vec<_>>();
        pids.sort_unstable();
        pids
    }

    /// The process's command line with arguments joined by spaces.
    pub fn cmdline(&self, pid: libc::pid_t) -> Option<String> {
        let bytes = fs::read(self.root.join(pid.to_string()).join("cmdline")).ok()?;
        let args = bytes
            .split(|b| *b == 0)
            .filter(|a| !a.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>();
        Some(args.join(" "))
    }

    pub fn env_var(&self, pid: libc::pid_t, key: &str) -> Option<String> {
        let bytes = fs::read(self.root.join(pid.to_string()).join("environ")).ok()?;
        bytes.split(|b| *b == 0).find_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (k, v) = entry.split_once('=')?;
            (k == key).then(|| v.to_owned())
        })
    }

    /// Processes carrying `key=value` in their environment.
    pub fn with_env(&self, key: &str, value: &str) -> Vec<libc::pid_t> {
        self.pids()
            .into_iter()
            .filter(|pid| self.env_var(*pid, key).as_deref() == Some(value))
            .collect()
    }

    /// Processes running in `prefix` whose command line mentions `needle`.
    pub fn in_prefix(&self, prefix: &Path, needle: &str) -> Vec<libc::pid_t> {
        let needle = needle.to_lowercase();
        self.pids()
            .into_iter()
            .filter(|pid| {
                self.env_var(*pid, "WINEPREFIX")
                    .is_some_and(|p| same_dir(Path::new(&p), prefix))
            })
            .filter(|pid| {
                self.cmdline(*pid)
                    .is_some_and(|c| c.to_lowercase().contains(&needle))
            })
            .collect()
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    a.components().eq(b.components())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{fs, path::Path};

    use pretty_assertions::assert_eq;

    use super::Proc;

    /// Adds a fake process to a `/proc` lookalike.
    pub(crate) fn fake_process(root: &Path, pid: i32, cmdline: &[&str], env: &[(&str, &str)]) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();

        let mut cmd = Vec::new();
        for arg in cmdline {
            cmd.extend(arg.as_bytes());
            cmd.push(0);
        }
        fs::write(dir.join("cmdline"), cmd).unwrap();

        let mut environ = Vec::new();
        for (k, v) in env {
            environ.extend(format!("{k}={v}").as_bytes());
            environ.push(0);
        }
        fs::write(dir.join("environ"), environ).unwrap();
    }

    #[test]
    fn scans_environment_and_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("self")).unwrap();
        fake_process(
            root,
            100,
            &["C:\\Game\\Game.exe", "-windowed"],
            &[("WINEPREFIX", "/data/Prefixes/Game/"), ("WINECHARM_UNIQUE_ID", "abc")],
        );
        fake_process(
            root,
            200,
            &["C:\\windows\\system32\\services.exe"],
            &[("WINEPREFIX", "/data/Prefixes/Game")],
        );
        fake_process(root, 300, &["/usr/bin/bash"], &[("HOME", "/home/alice")]);

        let proc = Proc::new(root);
        assert_eq!(proc.pids(), vec![100, 200, 300]);
        assert_eq!(
            proc.cmdline(100).as_deref(),
            Some("C:\\Game\\Game.exe -windowed")
        );
        assert_eq!(proc.with_env("WINECHARM_UNIQUE_ID", "abc"), vec![100]);
        assert_eq!(
            proc.in_prefix(Path::new("/data/Prefixes/Game"), "game.exe"),
            vec![100]
        );
        assert!(proc.in_prefix(Path::new("/data/Prefixes/Other"), "game.exe").is_empty());
    }
}
