//! Index of downloadable Wine builds, cached in `runner_cache.yaml`.

use std::{
    fmt, fs,
    io::{self, BufReader},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use xz2::read::XzDecoder;

use crate::{
    github::{self, Release, Repo},
    runner, Context, Paths,
};

/// The cache is refreshed when it is older than this.
pub const MAX_AGE: Duration = Duration::from_secs(60 * 60);

const UPSTREAM: Repo = Repo {
    owner: "Kron4ek",
    name: "Wine-Builds",
};
const ASSET_SUFFIX: &str = ".tar.xz";

lazy_static! {
    static ref STABLE: Regex = Regex::new(r"\d+\.0").unwrap();
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to fetch the runner index. {0}")]
    Index(#[from] github::Error),
    #[error("Download error. {0}")]
    Download(#[from] charm_download::Error),
    #[error("Runner error. {0}")]
    Runner(#[from] runner::Error),
    #[error("Unable to parse runner cache. {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("No runner named {0} in the catalog")]
    NotFound(String),
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
}

impl Error {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Download(e) => matches!(e, charm_download::Error::Cancelled),
            Error::Runner(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Proton,
    Stable,
    Devel,
    Tkg,
    Wow64,
}

impl Variant {
    pub const ALL: [Variant; 5] = [
        Variant::Proton,
        Variant::Stable,
        Variant::Devel,
        Variant::Tkg,
        Variant::Wow64,
    ];

    /// Sorts a build into a variant by its download URL.
    #[must_use]
    pub fn classify(url: &str) -> Self {
        let url = url.to_lowercase();
        if url.contains("proton") {
            Variant::Proton
        } else if url.contains("wow64") {
            Variant::Wow64
        } else if url.contains("tkg") {
            Variant::Tkg
        } else if url.contains("staging") {
            Variant::Devel
        } else if STABLE.is_match(&url) {
            Variant::Stable
        } else {
            Variant::Devel
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Variant::Proton => "proton",
            Variant::Stable => "stable",
            Variant::Devel => "devel",
            Variant::Tkg => "tkg",
            Variant::Wow64 => "wow64",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub proton: Vec<Entry>,
    #[serde(default)]
    pub stable: Vec<Entry>,
    #[serde(default)]
    pub devel: Vec<Entry>,
    #[serde(default)]
    pub tkg: Vec<Entry>,
    #[serde(default)]
    pub wow64: Vec<Entry>,
}

impl Catalog {
    /// Builds the catalog from the `.tar.xz` assets of a release listing.
    #[must_use]
    pub fn from_releases(releases: &[Release]) -> Self {
        let mut catalog = Self::default();

        for asset in releases.iter().flat_map(|r| r.assets_with_suffix(ASSET_SUFFIX)) {
            let name = asset
                .name
                .strip_suffix(ASSET_SUFFIX)
                .unwrap_or(&asset.name)
                .to_owned();
            let url = asset.browser_download_url.clone();

            catalog
                .entries_mut(Variant::classify(&url))
                .push(Entry { name, url });
        }

        catalog
    }

    #[must_use]
    pub fn entries(&self, variant: Variant) -> &[Entry] {
        match variant {
            Variant::Proton => &self.proton,
            Variant::Stable => &self.stable,
            Variant::Devel => &self.devel,
            Variant::Tkg => &self.tkg,
            Variant::Wow64 => &self.wow64,
        }
    }

    fn entries_mut(&mut self, variant: Variant) -> &mut Vec<Entry> {
        match variant {
            Variant::Proton => &mut self.proton,
            Variant::Stable => &mut self.stable,
            Variant::Devel => &mut self.devel,
            Variant::Tkg => &mut self.tkg,
            Variant::Wow64 => &mut self.wow64,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Variant, &Entry)> {
        Variant::ALL
            .into_iter()
            .flat_map(move |v| self.entries(v).iter().map(move |e| (v, e)))
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Entry> {
        self.iter().map(|(_, e)| e).find(|e| e.name == name)
    }

    pub fn read(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        charm_cfg::write_atomic(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// Whether the cache at `path` is missing or older than [`MAX_AGE`] at `now`.
#[must_use]
pub fn is_stale(path: &Path, now: SystemTime) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) else {
        return true;
    };
    now.duration_since(modified).unwrap_or_default() > MAX_AGE
}

fn fetch() -> Result<Catalog, Error> {
    let releases = github::releases(UPSTREAM)?;
    Ok(Catalog::from_releases(&releases))
}

/// The cached catalog, refreshed from upstream when stale or when `force` is set.
///
/// A failed refresh falls back to the old cache when there is one.
pub fn load(paths: &Paths, force: bool) -> Result<Catalog, Error> {
    let cache = &paths.runner_cache;

    if !force && !is_stale(cache, SystemTime::now()) {
        match Catalog::read(cache) {
            Ok(catalog) => return Ok(catalog),
            Err(e) => warn!("Ignoring broken runner cache. {e}"),
        }
    }

    match fetch() {
        Ok(catalog) => {
            debug!("Writing runner cache {}", cache.display());
            catalog.write(cache)?;
            Ok(catalog)
        }
        Err(e) if cache.is_file() => {
            warn!("Unable to refresh runner catalog, using the cached one. {e}");
            Catalog::read(cache)
        }
        Err(e) => Err(e),
    }
}

/// Downloads a build into `tmp/` and unpacks it into `Runners/`.
///
/// The archive is removed afterwards whatever happens.
pub fn download(ctx: &Context, entry: &Entry) -> Result<PathBuf, Error> {
    fs::create_dir_all(&ctx.paths.tmp)?;
    let file_name = entry
        .url
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .map_or_else(|| format!("{}{ASSET_SUFFIX}", entry.name), ToOwned::to_owned);
    let archive = ctx.paths.tmp.join(file_name);

    ctx.cancel.check().map_err(runner::Error::from)?;
    let stream = charm_download::download_file(&entry.url)?;
    stream.save_to(&archive, ctx.cancel.stop_flag(), |f| ctx.reporter.fraction(f))?;

    info!("Unpacking {}", archive.display());
    ctx.reporter.pulse();
    let result = fs::File::open(&archive).map_err(runner::Error::from).and_then(|file| {
        runner::unpack(
            XzDecoder::new(BufReader::new(file)),
            &ctx.paths.runners,
            &entry.name,
            ctx.cancel,
        )
    });

    if let Err(e) = fs::remove_file(&archive) {
        warn!("Unable to remove {}. {e}", archive.display());
    }

    Ok(result?)
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        time::{Duration, SystemTime},
    };

    use pretty_assertions::assert_eq;

    use super::{is_stale, Catalog, Entry, Variant, MAX_AGE};
    use crate::github::Release;

    const BASE: &str = "https://github.com/Kron4ek/Wine-Builds/releases/download";

    #[test]
    fn classifies_by_url() {
        let cases = [
            ("proton-9.0-3/wine-proton-9.0-3-amd64.tar.xz", Variant::Proton),
            ("9.0/wine-9.0-amd64-wow64.tar.xz", Variant::Wow64),
            ("9.0/wine-9.0-staging-tkg-amd64.tar.xz", Variant::Tkg),
            ("9.0/wine-9.0-staging-amd64.tar.xz", Variant::Devel),
            ("9.0/wine-9.0-amd64.tar.xz", Variant::Stable),
            ("9.12/wine-9.12-amd64.tar.xz", Variant::Devel),
        ];

        for (path, variant) in cases {
            assert_eq!(Variant::classify(&format!("{BASE}/{path}")), variant, "{path}");
        }
    }

    #[test]
    fn builds_from_release_listing() {
        let json = format!(
            r#"[{{"tag_name":"9.0","assets":[
                {{"name":"wine-9.0-amd64.tar.xz","browser_download_url":"{BASE}/9.0/wine-9.0-amd64.tar.xz"}},
                {{"name":"wine-9.0-staging-tkg-amd64.tar.xz","browser_download_url":"{BASE}/9.0/wine-9.0-staging-tkg-amd64.tar.xz"}},
                {{"name":"sha256sums.txt","browser_download_url":"{BASE}/9.0/sha256sums.txt"}}
            ]}}]"#
        );
        let releases: Vec<Release> = serde_json::from_str(&json).unwrap();
        let catalog = Catalog::from_releases(&releases);

        assert_eq!(
            catalog.stable,
            vec![Entry {
                name: "wine-9.0-amd64".into(),
                url: format!("{BASE}/9.0/wine-9.0-amd64.tar.xz"),
            }]
        );
        assert_eq!(catalog.tkg.len(), 1);
        assert!(catalog.proton.is_empty() && catalog.devel.is_empty());
        assert_eq!(catalog.iter().count(), 2);
        assert!(catalog.find("wine-9.0-staging-tkg-amd64").is_some());
    }

    #[test]
    fn reads_cache_and_checks_age() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("runner_cache.yaml");
        assert!(is_stale(&cache, SystemTime::now()));

        fs::write(
            &cache,
            "proton: []\nstable:\n- name: wine-9.0-amd64\n  url: https://x/wine-9.0-amd64.tar.xz\n",
        )
        .unwrap();
        let catalog = Catalog::read(&cache).unwrap();
        assert_eq!(catalog.entries(Variant::Stable)[0].name, "wine-9.0-amd64");
        assert!(catalog.wow64.is_empty());

        let now = SystemTime::now();
        assert!(!is_stale(&cache, now));
        assert!(is_stale(&cache, now + MAX_AGE + Duration::from_secs(5)));
    }
}
