//! The one place that converts between absolute paths and their `~`-encoded
//! persisted form.

use std::{
    env,
    path::{Path, PathBuf},
};

#[must_use]
pub fn home() -> PathBuf {
    env::var_os("HOME").map_or_else(|| PathBuf::from("/"), PathBuf::from)
}

/// Replaces a leading `$HOME` with `~`.
#[must_use]
pub fn encode(path: &Path) -> String {
    encode_with(path, &home())
}

#[must_use]
pub fn encode_with(path: &Path, home: &Path) -> String {
    match path.strip_prefix(home) {
        Ok(rest) if home != Path::new("/") => {
            if rest.as_os_str().is_empty() {
                "~".to_owned()
            } else {
                format!("~/{}", rest.display())
            }
        }
        _ => path.to_string_lossy().into_owned(),
    }
}

/// Expands a leading `~` to `$HOME`.
#[must_use]
pub fn expand(value: &str) -> PathBuf {
    expand_with(value, &home())
}

#[must_use]
pub fn expand_with(value: &str, home: &Path) -> PathBuf {
    let home = home.to_string_lossy();
    let expanded = shellexpand::tilde_with_context(value, || Some(home.as_ref()));
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{encode_with, expand_with};

    #[test]
    fn round_trip() {
        let home = Path::new("/home/alice");

        assert_eq!(encode_with(Path::new("/home/alice/Games/a.exe"), home), "~/Games/a.exe");
        assert_eq!(encode_with(Path::new("/home/alice"), home), "~");
        assert_eq!(encode_with(Path::new("/home/alice2/x"), home), "/home/alice2/x");
        assert_eq!(encode_with(Path::new("/opt/x"), home), "/opt/x");

        assert_eq!(expand_with("~/Games/a.exe", home), Path::new("/home/alice/Games/a.exe"));
        assert_eq!(expand_with("/opt/x", home), Path::new("/opt/x"));
        assert_eq!(expand_with("", home), Path::new(""));
    }
}
