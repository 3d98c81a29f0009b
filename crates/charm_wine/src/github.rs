//! Just enough of the GitHub releases API to list downloadable builds.

use std::{env, fmt};

use charm_download::{ureq, TlsError};
use log::info;
use serde::Deserialize;

const ACCEPT_HEADER: &str = "application/vnd.github.v3+json";

/// Optional personal access token, sent to get past anonymous rate limits.
pub const TOKEN_ENV: &str = "GITHUB_TOKEN";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("TLS error. {0}")]
    Tls(#[from] &'static TlsError),
    #[error("Unable to get release data. {0}")]
    Request(#[from] Box<ureq::Error>),
    #[error("Unable to parse release data. {0}")]
    Parse(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repo {
    pub owner: &'static str,
    pub name: &'static str,
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

#[derive(Deserialize, Debug)]
pub struct Release {
    pub tag_name: String,
    pub assets: Vec<Asset>,
}

impl Release {
    /// Assets whose file name ends with `suffix`.
    pub fn assets_with_suffix<'a>(&'a self, suffix: &'a str) -> impl Iterator<Item = &'a Asset> {
        self.assets.iter().filter(move |a| a.name.ends_with(suffix))
    }
}

/// The most recent page of releases of `repo`, newest first.
pub fn releases(repo: Repo) -> Result<Vec<Release>, Error> {
    let url = format!("https://api.github.com/repos/{repo}/releases");
    info!("Downloading release metadata from {url}");

    let mut req = ureq()?.get(&url).set("Accept", ACCEPT_HEADER);
    if let Ok(token) = env::var(TOKEN_ENV) {
        if !token.is_empty() {
            req = req.set("Authorization", &format!("Bearer {token}"));
        }
    }

    Ok(req.call().map_err(Box::new)?.into_json()?)
}
