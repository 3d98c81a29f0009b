use std::{
    cmp::Ordering,
    fs,
    path::{Path, PathBuf},
};

use charm_cfg::Script;
use indexmap::IndexMap;
use log::{debug, info, warn};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Progname,
    Wineprefix,
    Mtime,
}

/// In-memory index of every known script, keyed by the executable's hash.
#[derive(Debug, Default)]
pub struct Registry {
    scripts: IndexMap<String, Script>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans `dir` and its direct subdirectories for `.charm` files.
    ///
    /// Loading the default prefixes directory replaces the index. Any other directory is
    /// merged in front of what is already known. Files that do not parse are skipped.
    pub fn load(&mut self, dir: &Path, replace: bool) -> usize {
        let parsed = charm_files(dir, 2)
            .into_par_iter()
            .map(|path| (Script::read(&path), path))
            .collect::<Vec<_>>();

        let mut found = IndexMap::new();
        for (script, path) in parsed {
            match script {
                Ok(script) => {
                    debug!("Loaded {}", path.display());
                    found.insert(script.sha256sum.clone(), script);
                }
                Err(e) => warn!("Skipping {}. {e}", path.display()),
            }
        }

        let count = found.len();
        info!("Loaded {count} scripts from {}", dir.display());

        if replace {
            self.scripts = found;
        } else {
            for (key, script) in self.scripts.drain(..) {
                found.entry(key).or_insert(script);
            }
            self.scripts = found;
        }

        count
    }

    /// Registers `script`. A previous script with the same hash in the same prefix is
    /// superseded and its file removed. One living in another prefix keeps its file, but
    /// the index only remembers the newest.
    pub fn add(&mut self, script: Script) {
        if let Some(old) = self.scripts.get(&script.sha256sum) {
            if old.wineprefix == script.wineprefix && old.script_path != script.script_path {
                info!("Replacing {}", old.script_path.display());
                if let Err(e) = fs::remove_file(&old.script_path) {
                    warn!("Unable to remove {}. {e}", old.script_path.display());
                }
            }
        }

        self.scripts.insert(script.sha256sum.clone(), script);
    }

    pub fn remove(&mut self, key: &str) -> Option<Script> {
        self.scripts.shift_remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Script> {
        self.scripts.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Script> {
        self.scripts.get_mut(key)
    }

    /// Finds a script by hash, hash prefix, script path or progname.
    #[must_use]
    pub fn find(&self, query: &str) -> Option<&Script> {
        if let Some(script) = self.scripts.get(query) {
            return Some(script);
        }

        let path = Path::new(query);
        self.scripts.values().find(|s| {
            s.script_path == path
                || (query.len() >= 6 && s.sha256sum.starts_with(query))
                || s.progname == query
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Script> {
        self.scripts.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Scripts that live in `prefix`.
    pub fn in_prefix<'a>(&'a self, prefix: &'a Path) -> impl Iterator<Item = &'a Script> {
        self.scripts.values().filter(move |s| s.wineprefix == prefix)
    }

    /// Stable sort. Text keys compare case-insensitively.
    pub fn sort(&mut self, key: SortKey, reverse: bool) {
        self.scripts.sort_by(|_, a, _, b| {
            let ordering = compare(a, b, key);
            if reverse {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }

    /// Case-insensitive substring match against the exe name, script name and progname.
    pub fn filter<'a>(&'a self, needle: &str) -> impl Iterator<Item = &'a Script> {
        let needle = needle.to_lowercase();
        self.scripts.values().filter(move |s| matches(s, &needle))
    }
}

fn compare(a: &Script, b: &Script, key: SortKey) -> Ordering {
    match key {
        SortKey::Progname => a.progname.to_lowercase().cmp(&b.progname.to_lowercase()),
        SortKey::Wineprefix => a
            .wineprefix
            .to_string_lossy()
            .to_lowercase()
            .cmp(&b.wineprefix.to_string_lossy().to_lowercase()),
        SortKey::Mtime => a.mtime.cmp(&b.mtime),
    }
}

fn matches(script: &Script, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }

    let name = |p: Option<&std::ffi::OsStr>| p.map(|n| n.to_string_lossy().to_lowercase());

    name(script.exe_file.file_name()).is_some_and(|n| n.contains(needle))
        || name(script.script_path.file_stem()).is_some_and(|n| n.contains(needle))
        || script.progname.to_lowercase().contains(needle)
}

/// `.charm` files under `dir`, at most `depth` levels deep, in name order.
pub(crate) fn charm_files(dir: &Path, depth: usize) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| p.extension().is_some_and(|e| e == "charm"))
        .collect()
}
