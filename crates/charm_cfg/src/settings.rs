use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, NoneAsEmptyString};

use crate::{script::DEFAULT_WINE_DEBUG, tilde, write_atomic, Arch, Error};

/// Contents of `Settings.yaml`. Keys not known here are carried in `rest` and written
/// back untouched.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Tilde-encoded template directory.
    pub template: String,
    #[serde(default)]
    pub arch: Arch,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub runner: Option<String>,
    #[serde(default = "default_wine_debug")]
    pub wine_debug: String,
    #[serde(default)]
    pub env_vars: String,
    #[serde(default)]
    pub icon_view: bool,
    #[serde(default, rename = "single-prefix")]
    pub single_prefix: bool,

    #[serde(flatten)]
    pub rest: serde_yaml::Mapping,
}

fn default_wine_debug() -> String {
    DEFAULT_WINE_DEBUG.to_owned()
}

impl Settings {
    #[must_use]
    pub fn new(default_template: &Path) -> Self {
        Self {
            template: tilde::encode(default_template),
            arch: Arch::default(),
            runner: None,
            wine_debug: default_wine_debug(),
            env_vars: String::new(),
            icon_view: false,
            single_prefix: false,
            rest: serde_yaml::Mapping::new(),
        }
    }

    /// Loads settings, falling back to defaults when the file does not exist.
    pub fn read(path: &Path, default_template: &Path) -> Result<Self, Error> {
        if !path.exists() {
            log::info!("No settings at {}, using defaults", path.display());
            return Ok(Self::new(default_template));
        }

        let bytes = fs::read(path)?;
        let mut value: serde_yaml::Value = serde_yaml::from_slice(&bytes)?;
        if value.is_null() {
            return Ok(Self::new(default_template));
        }

        if let Some(map) = value.as_mapping_mut() {
            let key = serde_yaml::Value::from("template");
            if map.get(&key).map_or(true, serde_yaml::Value::is_null) {
                map.insert(key, tilde::encode(default_template).into());
            }
        }

        Ok(serde_yaml::from_value(value)?)
    }

    /// Full rewrite of the settings file.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        write_atomic(path, yaml)?;
        Ok(())
    }

    #[must_use]
    pub fn template_path(&self) -> PathBuf {
        tilde::expand(&self.template)
    }

    pub fn set_template(&mut self, path: &Path) {
        self.template = tilde::encode(path);
    }

    #[must_use]
    pub fn runner_path(&self) -> Option<PathBuf> {
        self.runner.as_deref().map(tilde::expand)
    }

    pub fn set_runner(&mut self, runner: Option<&Path>) {
        self.runner = runner.map(tilde::encode);
    }
}
